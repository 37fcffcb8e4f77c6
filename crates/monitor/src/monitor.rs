//! Sliding-window debounce over sequence-numbered observations.

use crate::types::{Error, MAX_THRESHOLD, MIN_THRESHOLD, Status};

/// Threshold-based liveness classifier.
///
/// Observations are keyed by sequence number and may arrive out of order.
/// The history keeps the last `max(down, up) + 1` sequences; slot `i` holds
/// the status registered for sequence `sequence - len + 1 + i`.
#[derive(Debug, Clone)]
pub struct Monitor {
    down_threshold: usize,
    up_threshold: usize,
    history: Vec<Status>,
    sequence: u64,
}

impl Monitor {
    /// Create a new monitor.
    ///
    /// Both thresholds must be within `[2, 10]`.
    pub fn new(down_threshold: usize, up_threshold: usize) -> Result<Self, Error> {
        if !(MIN_THRESHOLD..=MAX_THRESHOLD).contains(&down_threshold) {
            return Err(Error::DownThresholdInvalid(down_threshold));
        }
        if !(MIN_THRESHOLD..=MAX_THRESHOLD).contains(&up_threshold) {
            return Err(Error::UpThresholdInvalid(up_threshold));
        }

        Ok(Self {
            down_threshold,
            up_threshold,
            history: vec![Status::Pending; down_threshold.max(up_threshold) + 1],
            sequence: 0,
        })
    }

    /// Record the status observed for `sequence`.
    ///
    /// Sequences that already fell out of the window are ignored.
    pub fn register_status(&mut self, sequence: u64, status: Status) {
        if sequence > self.sequence {
            self.advance(sequence);
        }

        let len = self.history.len() as u64;
        let offset = self.sequence - sequence;
        if offset >= len {
            return;
        }

        let index = (len - 1 - offset) as usize;
        self.history[index] = status;
    }

    /// Current debounced status.
    pub fn status(&self) -> Status {
        let window = self
            .history
            .len()
            .min(self.down_threshold.max(self.up_threshold));

        let mut down_streak: i64 = 0;
        let mut pending_streak: i64 = 0;
        let mut up_streak: i64 = 0;

        for (scanned, status) in self.history.iter().rev().take(window).enumerate() {
            match status {
                Status::Up => {
                    down_streak = -1;
                    pending_streak = -1;
                    if up_streak >= 0 {
                        up_streak += 1;
                    }
                }
                Status::Down => {
                    if down_streak >= 0 {
                        down_streak += 1;
                    }
                    pending_streak = -1;
                    up_streak = -1;
                }
                Status::Pending => {
                    if down_streak >= 0 {
                        down_streak += 1;
                    }
                    if pending_streak >= 0 {
                        pending_streak += 1;
                    }
                    // only the most recent unknown may count towards "up"
                    if scanned == 0 && up_streak >= 0 {
                        up_streak += 1;
                    }
                }
            }

            if down_streak >= self.down_threshold as i64 && pending_streak < down_streak {
                return Status::Down;
            }
            if up_streak >= self.up_threshold as i64 && pending_streak < up_streak {
                return Status::Up;
            }
        }

        Status::Pending
    }

    /// Highest sequence observed so far.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Configured down threshold.
    pub fn down_threshold(&self) -> usize {
        self.down_threshold
    }

    /// Configured up threshold.
    pub fn up_threshold(&self) -> usize {
        self.up_threshold
    }

    fn advance(&mut self, sequence: u64) {
        let jump = sequence - self.sequence;
        let len = self.history.len();

        if jump >= len as u64 {
            self.history.fill(Status::Pending);
        } else {
            let jump = jump as usize;
            self.history.rotate_left(jump);
            self.history[len - jump..].fill(Status::Pending);
        }

        self.sequence = sequence;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_range() {
        for down in MIN_THRESHOLD..=MAX_THRESHOLD {
            for up in MIN_THRESHOLD..=MAX_THRESHOLD {
                assert!(Monitor::new(down, up).is_ok(), "down={} up={}", down, up);
            }
        }

        assert_eq!(Monitor::new(1, 2).unwrap_err(), Error::DownThresholdInvalid(1));
        assert_eq!(Monitor::new(11, 2).unwrap_err(), Error::DownThresholdInvalid(11));
        assert_eq!(Monitor::new(2, 0).unwrap_err(), Error::UpThresholdInvalid(0));
        assert_eq!(Monitor::new(2, 11).unwrap_err(), Error::UpThresholdInvalid(11));
    }

    #[test]
    fn test_history_length() {
        let monitor = Monitor::new(5, 2).unwrap();
        assert_eq!(monitor.history.len(), 6);
        assert_eq!(monitor.sequence(), 0);
        assert_eq!(monitor.status(), Status::Pending);
    }

    #[test]
    fn test_reference_scenario() {
        let mut monitor = Monitor::new(5, 2).unwrap();

        let steps = [
            (0, Status::Pending, Status::Pending),
            (1, Status::Pending, Status::Pending),
            (2, Status::Up, Status::Pending),
            (3, Status::Down, Status::Pending),
            (4, Status::Down, Status::Pending),
            (5, Status::Down, Status::Pending),
            (6, Status::Down, Status::Pending),
            (7, Status::Down, Status::Down),
            (8, Status::Pending, Status::Down),
            (9, Status::Pending, Status::Down),
            (9, Status::Up, Status::Pending),
            (8, Status::Up, Status::Up),
            (10, Status::Pending, Status::Up),
        ];

        for (sequence, registered, expected) in steps {
            monitor.register_status(sequence, registered);
            assert_eq!(
                monitor.status(),
                expected,
                "after registering {} for sequence {}",
                registered,
                sequence
            );
        }
    }

    #[test]
    fn test_reregistration_is_idempotent() {
        let mut monitor = Monitor::new(3, 2).unwrap();
        for sequence in 1..=3 {
            monitor.register_status(sequence, Status::Down);
        }
        let before = monitor.status();
        assert_eq!(before, Status::Down);

        monitor.register_status(3, Status::Down);
        monitor.register_status(3, Status::Down);
        assert_eq!(monitor.status(), before);
        assert_eq!(monitor.sequence(), 3);
    }

    #[test]
    fn test_out_of_window_is_ignored() {
        let mut monitor = Monitor::new(2, 2).unwrap();
        monitor.register_status(10, Status::Up);
        monitor.register_status(11, Status::Up);
        assert_eq!(monitor.status(), Status::Up);

        // window length is 3, so sequence 8 is already gone
        monitor.register_status(8, Status::Down);
        monitor.register_status(1, Status::Down);
        assert_eq!(monitor.status(), Status::Up);
        assert_eq!(monitor.sequence(), 11);
    }

    #[test]
    fn test_large_jump_resets_window() {
        let mut monitor = Monitor::new(2, 2).unwrap();
        monitor.register_status(1, Status::Up);
        monitor.register_status(2, Status::Up);
        assert_eq!(monitor.status(), Status::Up);

        monitor.register_status(100, Status::Pending);
        assert_eq!(monitor.sequence(), 100);
        assert_eq!(monitor.status(), Status::Pending);

        monitor.register_status(101, Status::Down);
        monitor.register_status(102, Status::Down);
        assert_eq!(monitor.status(), Status::Down);
    }

    #[test]
    fn test_gap_backfills_pending() {
        let mut monitor = Monitor::new(2, 2).unwrap();
        monitor.register_status(1, Status::Up);
        monitor.register_status(2, Status::Up);

        // sequence 3 is never observed; the slot stays unknown
        monitor.register_status(4, Status::Up);
        assert_eq!(monitor.history, vec![Status::Up, Status::Pending, Status::Up]);
        assert_eq!(monitor.status(), Status::Pending);
    }

    #[test]
    fn test_pending_extends_down_streak() {
        let mut monitor = Monitor::new(3, 2).unwrap();
        monitor.register_status(1, Status::Up);
        monitor.register_status(2, Status::Down);
        monitor.register_status(3, Status::Down);
        assert_eq!(monitor.status(), Status::Pending);

        monitor.register_status(4, Status::Pending);
        assert_eq!(monitor.status(), Status::Down);
    }

    #[test]
    fn test_recent_pending_does_not_block_up() {
        let mut monitor = Monitor::new(3, 2).unwrap();
        monitor.register_status(1, Status::Up);
        monitor.register_status(2, Status::Up);
        assert_eq!(monitor.status(), Status::Up);

        monitor.register_status(3, Status::Pending);
        assert_eq!(monitor.status(), Status::Up);
    }

    #[test]
    fn test_silence_is_not_down() {
        let mut monitor = Monitor::new(3, 2).unwrap();
        for sequence in 1..=10 {
            monitor.register_status(sequence, Status::Pending);
        }
        assert_eq!(monitor.status(), Status::Pending);
    }
}
