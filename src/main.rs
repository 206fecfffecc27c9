#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::{thread, time::Duration};

use ws_link::{config::Config, server::Server};

/// pause between polls of the session inboxes.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// echo driver: every payload a session sends comes straight back to it.
fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    let server = match &config.tls {
        Some(tls) => match (&tls.certificate, &tls.authority) {
            (Some(certificate), Some(authority)) => Server::with_tls(
                config.listen.port,
                config.listen.max_sessions,
                &tls.private_key,
                certificate,
                authority,
            )?,
            _ => Server::with_tls_anonymous(
                config.listen.port,
                config.listen.max_sessions,
                &tls.private_key,
            )?,
        },
        None => Server::new(config.listen.port, config.listen.max_sessions),
    };

    server.start()?;

    loop {
        thread::sleep(POLL_INTERVAL);
        for id in 1..=config.listen.max_sessions {
            while server.check_inbox(id) {
                let payload = server.read_message(id);
                if !payload.is_empty() {
                    server.send_message(id, &payload);
                }
            }
        }
    }
}
