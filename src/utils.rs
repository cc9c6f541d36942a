use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use rand::random;
use sha1::{Digest, Sha1};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

// About thirty years, far enough to never fire during a run
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

pub(crate) const UUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub(crate) fn generate_websocket_accept_value(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(UUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

pub(crate) fn generate_websocket_key() -> String {
    let random_bytes: [u8; 16] = random();
    BASE64_STANDARD.encode(random_bytes)
}

pub(crate) fn generate_mask() -> [u8; 4] {
    random()
}

// Used for tagging every run, so reports coming from different runs never collide
pub fn generate_run_id() -> Uuid {
    let buf: [u8; 16] = random();
    Uuid::new_v8(buf)
}

// Configured durations come from user input and may not fit in an Instant
pub(crate) fn deadline_after(start: Instant, wait: Duration) -> Instant {
    start
        .checked_add(wait)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}
