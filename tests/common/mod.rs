#![allow(dead_code)]

use std::{
    thread,
    time::{Duration, Instant},
};

pub const HOST: &str = "127.0.0.1";

/// payloads used by the exchange scenarios.
pub const MESSAGES: [&str; 3] = [
    "This is message 1 - Alfa",
    "This is message 2 - Beta",
    "This is message 3 - Gamma",
];

/// path of a file under the repository's `credentials/` directory.
pub fn credential(name: &str) -> String {
    format!("{}/credentials/{}", env!("CARGO_MANIFEST_DIR"), name)
}

/// poll `condition` until it holds or a five second deadline passes.
pub fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }

        thread::sleep(Duration::from_millis(20));
    }

    false
}

/// drain `read` until `count` payloads arrive or the deadline passes.
pub fn collect_messages(read: impl Fn() -> Vec<u8>, count: usize) -> Vec<Vec<u8>> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut messages = Vec::new();
    while messages.len() < count && Instant::now() < deadline {
        let payload = read();
        if payload.is_empty() {
            thread::sleep(Duration::from_millis(20));
        } else {
            messages.push(payload);
        }
    }

    messages
}

/// the exchange payloads as owned byte vectors.
pub fn expected_messages() -> Vec<Vec<u8>> {
    MESSAGES.iter().map(|text| text.as_bytes().to_vec()).collect()
}
