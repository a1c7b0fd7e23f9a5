//! Message id and timestamp helpers.
//!
//! # What is a message id? (for beginners)
//!
//! Every message on the wire carries an `id` string chosen by the sender and a
//! `timestamp` in milliseconds since the Unix epoch.  The protocol only
//! guarantees one use of the id: a `PONG` echoes the `id` of the `PING` that
//! triggered it, which lets a controller measure round-trip time.  For every
//! other message the id is purely informational (handy in logs).
//!
//! Ids are random UUID v4 strings, so two controllers never collide even
//! though neither coordinates with the other.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Returns a fresh, globally unique message id.
///
/// # Examples
///
/// ```rust
/// use soundlink_core::protocol::new_message_id;
///
/// let a = new_message_id();
/// let b = new_message_id();
/// assert_ne!(a, b);
/// ```
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Returns the current time as milliseconds since the Unix epoch.
///
/// A clock set before 1970 yields 0 rather than panicking.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
