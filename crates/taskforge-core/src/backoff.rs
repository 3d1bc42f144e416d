//! Exponential backoff shared by `WorkerMachine`'s idle-poll loop (spec
//! §4.5) and the Orchestrator's subtask-completion poll (spec §4.6, which
//! explicitly calls for "bounded interval, same backoff as §4.5").

use chrono::Duration;

pub const FLOOR: Duration = Duration::milliseconds(200);
pub const CEILING: Duration = Duration::seconds(10);

/// Double the interval, clamped to `CEILING`. Callers reset to `FLOOR` on
/// any successful claim or terminal poll.
pub fn next(current: Duration) -> Duration {
    let doubled = current
        .checked_mul(2)
        .unwrap_or(CEILING);
    doubled.min(CEILING)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_ceiling() {
        let mut interval = FLOOR;
        for _ in 0..10 {
            interval = next(interval);
        }
        assert_eq!(interval, CEILING);
    }

    #[test]
    fn floor_is_below_ceiling() {
        assert!(FLOOR < CEILING);
    }

    #[test]
    fn single_step_doubles() {
        assert_eq!(next(Duration::milliseconds(200)), Duration::milliseconds(400));
    }

    #[test]
    fn never_exceeds_ceiling() {
        assert_eq!(next(CEILING), CEILING);
    }
}
