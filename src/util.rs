//! Small helpers shared across transports.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

// ============================================================================
// Cache-Buster Token
// ============================================================================

/// URL-safe alphabet ordered so that encoded timestamps sort
/// chronologically.
const ALPHABET: &[u8; 64] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz-_";

static PREVIOUS: Mutex<String> = Mutex::new(String::new());
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Returns a fresh cache-buster token for timestamped requests.
///
/// Encodes the current epoch milliseconds in a compact base-64 alphabet.
/// Two calls within the same millisecond get a `.N` suffix so tokens
/// never repeat.
pub(crate) fn timestamp_token() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let encoded = encode(millis);

    let mut previous = PREVIOUS.lock();
    if *previous == encoded {
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        return format!("{}.{}", encoded, encode(seq));
    }

    SEQUENCE.store(0, Ordering::Relaxed);
    *previous = encoded.clone();
    encoded
}

fn encode(mut value: u64) -> String {
    let mut out = Vec::new();
    loop {
        out.push(ALPHABET[(value % 64) as usize]);
        value /= 64;
        if value == 0 {
            break;
        }
    }
    out.reverse();
    // the alphabet is ASCII
    String::from_utf8(out).unwrap_or_default()
}

// ============================================================================
// Tests
// ============================================================================
