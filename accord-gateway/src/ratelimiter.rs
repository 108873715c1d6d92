//! Ratelimiter on the client's ability to send messages to the gateway.
//!
//! The gateway allows 120 messages per connection per minute. A slice of
//! the budget is reserved for lifecycle traffic (heartbeats, IDENTIFY,
//! RESUME) so that saturating the queues can never starve the session
//! itself.

use std::{sync::Mutex, time::Duration};
use tokio::time::Instant;

/// Interval of how often the ratelimit bucket resets.
const RESET_DURATION: Duration = Duration::from_millis(60_000);

/// Messages allotted per reset period to queue-drained sends.
const NON_PRIORITY_ALLOTMENT: u32 = 115;

/// Messages allotted per reset period including lifecycle sends.
///
/// API documentation with details:
/// <https://discord.com/developers/docs/topics/gateway#rate-limiting>
const COMMANDS_PER_RESET: u32 = 120;

#[derive(Debug)]
struct Window {
    ends_at: Instant,
    sent: u32,
    warned: bool,
}

/// Ratelimiter for sending commands over the gateway.
///
/// [`acquire`] never blocks; a denied caller is expected to park for
/// [`time_until_reset`] and retry.
///
/// [`acquire`]: Self::acquire
/// [`time_until_reset`]: Self::time_until_reset
#[derive(Debug)]
pub struct CommandRatelimiter {
    window: Mutex<Window>,
}

impl CommandRatelimiter {
    /// Create a new ratelimiter with a freshly started window.
    pub(crate) fn new() -> Self {
        Self {
            window: Mutex::new(Window {
                ends_at: Instant::now() + RESET_DURATION,
                sent: 0,
                warned: false,
            }),
        }
    }

    /// Try to reserve one send in the current window.
    ///
    /// Priority sends draw from the full budget; all others stop at the
    /// non-priority allotment. Exactly one reservation is made per `true`
    /// return. A denial is logged once per window.
    pub(crate) fn acquire(&self, priority: bool) -> bool {
        let mut window = self.window.lock().expect("window poisoned");
        let now = Instant::now();

        if now >= window.ends_at {
            window.ends_at = now + RESET_DURATION;
            window.sent = 0;
            window.warned = false;
        }

        let allotment = if priority {
            COMMANDS_PER_RESET
        } else {
            NON_PRIORITY_ALLOTMENT
        };

        if window.sent < allotment {
            window.sent += 1;

            return true;
        }

        if !window.warned {
            window.warned = true;
            tracing::warn!(
                sent = window.sent,
                priority,
                "outbound budget exhausted, parking until the window resets",
            );
        }

        false
    }

    /// Number of non-priority sends still available within the window.
    pub fn available(&self) -> u32 {
        let window = self.window.lock().expect("window poisoned");

        if Instant::now() >= window.ends_at {
            return NON_PRIORITY_ALLOTMENT;
        }

        NON_PRIORITY_ALLOTMENT.saturating_sub(window.sent)
    }

    /// Maximum number of sends per window, including priority sends.
    pub const fn max(&self) -> u32 {
        COMMANDS_PER_RESET
    }

    /// Time until the current window rolls over.
    pub fn time_until_reset(&self) -> Duration {
        let window = self.window.lock().expect("window poisoned");

        window.ends_at.saturating_duration_since(Instant::now())
    }

    #[cfg(test)]
    fn warned(&self) -> bool {
        self.window.lock().unwrap().warned
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandRatelimiter, COMMANDS_PER_RESET, NON_PRIORITY_ALLOTMENT, RESET_DURATION};
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(CommandRatelimiter: Debug, Send, Sync);

    #[tokio::test(start_paused = true)]
    async fn non_priority_allotment() {
        let ratelimiter = CommandRatelimiter::new();

        for _ in 0..NON_PRIORITY_ALLOTMENT {
            assert!(ratelimiter.acquire(false));
        }

        assert!(!ratelimiter.acquire(false));
        assert_eq!(0, ratelimiter.available());
    }

    #[tokio::test(start_paused = true)]
    async fn priority_reserve_stays_available() {
        let ratelimiter = CommandRatelimiter::new();

        for _ in 0..NON_PRIORITY_ALLOTMENT {
            assert!(ratelimiter.acquire(false));
        }
        assert!(!ratelimiter.acquire(false));

        // the lifecycle reserve remains
        for _ in NON_PRIORITY_ALLOTMENT..COMMANDS_PER_RESET {
            assert!(ratelimiter.acquire(true));
        }

        assert!(!ratelimiter.acquire(true));
    }

    #[tokio::test(start_paused = true)]
    async fn window_rolls_over() {
        let ratelimiter = CommandRatelimiter::new();

        for _ in 0..COMMANDS_PER_RESET {
            assert!(ratelimiter.acquire(true));
        }
        assert!(!ratelimiter.acquire(false));
        assert!(ratelimiter.warned());

        tokio::time::sleep(ratelimiter.time_until_reset()).await;

        assert!(ratelimiter.acquire(false));
        assert!(!ratelimiter.warned());
        assert_eq!(NON_PRIORITY_ALLOTMENT - 1, ratelimiter.available());
    }

    #[tokio::test(start_paused = true)]
    async fn warns_once_per_window() {
        let ratelimiter = CommandRatelimiter::new();

        for _ in 0..NON_PRIORITY_ALLOTMENT {
            assert!(ratelimiter.acquire(false));
        }

        assert!(!ratelimiter.warned());
        assert!(!ratelimiter.acquire(false));
        assert!(ratelimiter.warned());
        assert!(!ratelimiter.acquire(false));
        assert!(ratelimiter.warned());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_duration_is_a_minute() {
        let ratelimiter = CommandRatelimiter::new();

        assert!(ratelimiter.time_until_reset() <= RESET_DURATION);
        assert!(ratelimiter.time_until_reset() > RESET_DURATION / 2);
    }
}
