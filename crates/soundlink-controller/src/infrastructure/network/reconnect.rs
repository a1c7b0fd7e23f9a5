//! When (and whether) a dropped control connection is retried.

use std::time::Duration;

/// Reconnection policy for [`super::ControllerClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// A failed or closed connection stays down until `connect` is called
    /// again.
    #[default]
    Never,
    /// Retry with exponential backoff: `initial`, `2 * initial`, ... capped
    /// at `max`.
    Backoff { initial: Duration, max: Duration },
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` to give up.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match *self {
            ReconnectPolicy::Never => None,
            ReconnectPolicy::Backoff { initial, max } => {
                let shift = attempt.saturating_sub(1).min(31);
                let factor = 1u32 << shift;
                Some(initial.saturating_mul(factor).min(max))
            }
        }
    }
}
