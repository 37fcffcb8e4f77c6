//! Debounced liveness classification.
//!
//! A [`Monitor`] turns a stream of noisy, possibly reordered per-sequence
//! observations into a stable [`Status`]. A subject is only declared down
//! (or up) once enough consecutive observations agree, and gaps in the
//! sequence space count as unknown rather than as failures.
//!
//! # Example
//!
//! ```
//! use monitor::{Monitor, Status};
//!
//! let mut monitor = Monitor::new(3, 2).unwrap();
//! monitor.register_status(1, Status::Up);
//! monitor.register_status(2, Status::Up);
//! assert_eq!(monitor.status(), Status::Up);
//! ```

pub mod monitor;
pub mod types;

pub use monitor::Monitor;
pub use types::{Error, MAX_THRESHOLD, MIN_THRESHOLD, Status};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Down.to_string(), "DOWN");
        assert_eq!(Status::Pending.to_string(), "PENDING");
        assert_eq!(Status::Up.to_string(), "UP");
    }

    #[test]
    fn test_status_values() {
        assert_eq!(Status::Down as i8, -1);
        assert_eq!(Status::Pending as i8, 0);
        assert_eq!(Status::Up as i8, 1);
        assert_eq!(Status::default(), Status::Pending);
    }
}
