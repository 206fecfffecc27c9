mod common;

use common::{HOST, collect_messages, credential, expected_messages, wait_for};
use ws_link::{client::Client, server::Server};

fn verified_server(port: u16, max_sessions: usize) -> Server {
    Server::with_tls(
        port,
        max_sessions,
        &credential("server-key.pem"),
        &credential("server-cert.pem"),
        &credential("server-cert.pem"),
    )
    .unwrap()
}

fn verified_client() -> Client {
    Client::with_tls(
        &credential("client-key.pem"),
        &credential("client-cert.pem"),
        &credential("server-cert.pem"),
    )
    .unwrap()
}

#[test]
fn verified_session_lifecycle() {
    let server = verified_server(8082, 4);
    server.start().unwrap();

    let client = verified_client();
    assert!(client.connect(HOST, 8082));
    assert!(client.check_connection());

    assert!(server.is_running());
    assert!(wait_for(|| server.sessions_count() == 1));
    assert!(server.is_serving());
    assert!(wait_for(|| server.check_session(1)));
    assert!(!server.check_session(2));

    client.disconnect();
    assert!(wait_for(|| server.sessions_count() == 0));

    server.stop();
    assert!(!server.is_running());
}

#[test]
fn anonymous_session_lifecycle() {
    let server = Server::with_tls_anonymous(8083, 4, &credential("server-key.pem")).unwrap();
    server.start().unwrap();

    let client = Client::with_tls_anonymous(&credential("client-key.pem")).unwrap();
    assert!(client.connect(HOST, 8083));
    assert!(client.check_connection());

    assert!(server.is_running());
    assert!(wait_for(|| server.sessions_count() == 1));
    assert!(server.is_serving());
    assert!(wait_for(|| server.check_session(1)));
    assert!(!server.check_session(2));

    client.disconnect();
    assert!(wait_for(|| server.sessions_count() == 0));

    server.stop();
    assert!(!server.is_running());
}

#[test]
fn three_clients_exchange_messages_in_order() {
    let server = verified_server(8085, 4);
    server.start().unwrap();

    let clients: Vec<Client> = (0..3).map(|_| verified_client()).collect();
    for client in &clients {
        assert!(client.connect(HOST, 8085));
    }
    assert!(wait_for(|| server.sessions_count() == 3));

    for id in 1..=3 {
        assert!(server.check_session(id));
        for message in common::MESSAGES {
            assert!(server.send_message(id, message.as_bytes()));
        }
    }
    assert!(!server.check_session(4));

    for client in &clients {
        for message in common::MESSAGES {
            client.send_message(message.as_bytes());
        }
    }

    for id in 1..=3 {
        assert_eq!(
            collect_messages(|| server.read_message(id), 3),
            expected_messages(),
        );
    }
    for client in &clients {
        assert_eq!(collect_messages(|| client.read_message(), 3), expected_messages());
    }

    for client in &clients {
        client.disconnect();
    }
    assert!(wait_for(|| server.sessions_count() == 0));
    assert!(!server.is_serving());

    server.stop();
}

#[test]
fn stop_start_cycle_and_close_by_id() {
    let server = Server::with_tls_anonymous(8086, 4, &credential("server-key.pem")).unwrap();
    server.start().unwrap();
    server.stop();
    assert!(!server.is_running());

    // nobody is listening between the cycles.
    let client = Client::with_tls_anonymous(&credential("client-key.pem")).unwrap();
    assert!(!client.connect(HOST, 8086));
    assert!(client.check_failed_connection());

    server.start().unwrap();
    assert!(server.is_running());

    // the failed client recovers without an explicit reset.
    assert!(client.connect(HOST, 8086));
    assert!(!client.check_failed_connection());
    assert!(wait_for(|| server.check_session(1)));

    server.close_session(1);
    assert!(wait_for(|| !server.check_session(1)));
    assert!(wait_for(|| !client.check_connection()));
    assert!(wait_for(|| server.sessions_count() == 0));

    server.stop();
    assert!(!server.is_running());
}
