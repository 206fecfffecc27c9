mod common;

use common::{HOST, collect_messages, expected_messages, wait_for};
use ws_link::{client::Client, server::Server};

#[test]
fn single_session_lifecycle() {
    let server = Server::new(8081, 4);
    server.start().unwrap();

    let client = Client::new();
    assert!(client.connect(HOST, 8081));
    assert!(client.check_connection());

    assert!(server.is_running());
    assert!(wait_for(|| server.sessions_count() == 1));
    assert!(server.is_serving());
    assert!(wait_for(|| server.check_session(1)));
    assert!(!server.check_session(2));

    client.disconnect();
    assert!(!client.check_connection());
    assert!(wait_for(|| server.sessions_count() == 0));
    assert!(!server.is_serving());

    server.stop();
    assert!(!server.is_running());
}

#[test]
fn capacity_limit_rejects_fifth_client() {
    let server = Server::new(8084, 4);
    server.start().unwrap();

    let clients: Vec<Client> = (0..5).map(|_| Client::new()).collect();
    for client in &clients[..4] {
        assert!(client.connect(HOST, 8084));
    }
    assert!(wait_for(|| server.sessions_count() == 4));

    assert!(!clients[4].connect(HOST, 8084));
    assert!(!clients[4].check_connection());
    assert!(clients[4].check_failed_connection());
    assert!(!server.check_session(5));
    assert_eq!(server.sessions_count(), 4);

    for (client, expected) in clients[..4].iter().zip([3, 2, 1, 0]) {
        client.disconnect();
        assert!(wait_for(|| server.sessions_count() == expected));
    }

    server.stop();
}

#[test]
fn smallest_free_id_is_reassigned() {
    let server = Server::new(8088, 4);
    server.start().unwrap();

    let first = Client::new();
    let second = Client::new();
    let third = Client::new();
    assert!(first.connect(HOST, 8088));
    assert!(second.connect(HOST, 8088));
    assert!(third.connect(HOST, 8088));
    assert!(wait_for(|| server.sessions_count() == 3));
    assert!(wait_for(|| server.check_session(2)));

    second.disconnect();
    assert!(wait_for(|| !server.check_session(2)));
    assert!(wait_for(|| server.sessions_count() == 2));

    let replacement = Client::new();
    assert!(replacement.connect(HOST, 8088));
    assert!(wait_for(|| server.check_session(2)));
    assert!(!server.check_session(4));

    server.stop();
}

#[test]
fn messages_round_trip_in_order() {
    let server = Server::new(8089, 4);
    server.start().unwrap();

    let client = Client::new();
    assert!(client.connect(HOST, 8089));
    assert!(wait_for(|| server.check_session(1)));

    for message in common::MESSAGES {
        client.send_message(message.as_bytes());
    }
    assert_eq!(
        collect_messages(|| server.read_message(1), 3),
        expected_messages()
    );

    for message in common::MESSAGES {
        assert!(server.send_message(1, message.as_bytes()));
    }
    assert_eq!(collect_messages(|| client.read_message(), 3), expected_messages());
    assert!(!client.check_inbox());
    assert!(!server.check_inbox(1));

    client.disconnect();
    assert!(wait_for(|| server.sessions_count() == 0));

    // the same object reconnects after a graceful disconnect, no reset.
    assert!(client.connect(HOST, 8089));
    assert!(wait_for(|| server.check_session(1)));

    client.disconnect();
    server.stop();
}

#[test]
fn rebinding_a_served_port_fails_until_stop() {
    let server = Server::new(8090, 2);
    server.start().unwrap();
    // starting twice is a no-op, not a rebind.
    server.start().unwrap();

    let contender = Server::new(8090, 2);
    assert!(contender.start().is_err());
    assert!(!contender.is_running());

    server.stop();
    server.stop();
    assert!(!server.is_running());

    assert!(contender.start().is_ok());
    assert!(contender.is_running());
    contender.stop();
}

#[test]
fn capacity_sweep_at_twenty_five() {
    let server = Server::new(8087, 25);
    server.start().unwrap();

    let clients: Vec<Client> = (0..25).map(|_| Client::new()).collect();
    for client in &clients {
        assert!(client.connect(HOST, 8087));
    }
    assert!(wait_for(|| server.sessions_count() == 25));

    let extra = Client::new();
    assert!(!extra.connect(HOST, 8087));
    assert_eq!(server.sessions_count(), 25);

    for client in &clients {
        client.disconnect();
    }
    assert!(wait_for(|| server.sessions_count() == 0));

    server.stop();
}

#[test]
fn unknown_ids_answer_empty_results() {
    let server = Server::new(8091, 2);
    server.start().unwrap();

    assert!(!server.send_message(1, b"nobody home"));
    assert_eq!(server.read_message(1), Vec::<u8>::new());
    assert!(!server.check_inbox(1));
    assert!(!server.check_session(1));
    server.close_session(1);

    server.stop();
}
