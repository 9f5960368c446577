use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod clock;
pub mod operating_mode;
pub mod ring_buffer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use operating_mode::{ModeController, ModeTransitionError, OperatingMode, TickGate};
pub use ring_buffer::RingBuffer;

#[macro_export]
macro_rules! unwrap_or_continue {
    ($opt: expr) => {
        match $opt {
            Some(v) => v,
            None => {
                continue;
            }
        }
    };
}

/// Get the elapsed system time since the Unix Epoch in Milliseconds
pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Whole seconds elapsed between two epoch-millisecond timestamps.
///
/// Returns 0 when `at` lies in the future of `now`, which happens when a
/// reporter's clock runs ahead of ours.
pub fn elapsed_secs(now_ms: u64, at_ms: u64) -> u64 {
    now_ms.saturating_sub(at_ms) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_secs() {
        assert_eq!(elapsed_secs(10_000, 4_000), 6);
        assert_eq!(elapsed_secs(10_999, 10_000), 0);
        // future timestamps clamp to zero
        assert_eq!(elapsed_secs(1_000, 5_000), 0);
    }

    #[test]
    fn test_epoch_time_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(get_epoch_time_in_ms() > 1_577_836_800_000);
    }
}
