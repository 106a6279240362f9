//! Backend availability state machine.
//!
//! Each backend carries an immutable [`AvailabilityCounter`]; every
//! connection outcome produces a *new* value which is installed with a
//! compare-and-swap, so hot-path readers never take a lock. The failure
//! ladder spaces retries out to a 10 s ceiling, so a recovered backend is
//! re-discovered promptly; isolated failures retry almost immediately.

use std::time::{Duration, Instant};

/// Health classification of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityStatus {
    /// Recent connections succeeded.
    PossiblyAvailable,
    /// Nothing is known yet.
    Unknown,
    /// Recent connections failed; retries are spaced by a cool-down.
    NotAvailable,
}

/// Immutable availability state. Transitions are pure functions of the
/// current value and the caller-supplied clock reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityCounter {
    /// Health classification.
    pub status: AvailabilityStatus,
    /// Streak counter; meaning depends on `status`.
    pub counter: u32,
    /// Earliest moment a `NotAvailable` backend may be retried.
    pub next_try: Instant,
}

impl AvailabilityCounter {
    /// The starting state of every backend.
    #[must_use]
    pub fn unknown() -> Self {
        Self::unknown_at(Instant::now())
    }

    fn unknown_at(now: Instant) -> Self {
        Self {
            status: AvailabilityStatus::Unknown,
            counter: 0,
            next_try: now,
        }
    }

    /// Whether a connection attempt should be offered right now.
    ///
    /// `Unknown` and `PossiblyAvailable` are always tryable; `NotAvailable`
    /// becomes tryable once its cool-down has elapsed.
    #[must_use]
    pub fn is_available_to_try(&self, now: Instant) -> bool {
        match self.status {
            AvailabilityStatus::PossiblyAvailable | AvailabilityStatus::Unknown => true,
            AvailabilityStatus::NotAvailable => now >= self.next_try,
        }
    }

    /// Next state after a successful connection.
    #[must_use]
    pub fn on_success(&self, now: Instant) -> Self {
        match self.status {
            AvailabilityStatus::PossiblyAvailable => {
                if self.counter >= 50 {
                    return self.clone();
                }
                Self {
                    status: AvailabilityStatus::PossiblyAvailable,
                    counter: self.counter + 1,
                    next_try: now,
                }
            }
            AvailabilityStatus::Unknown => Self {
                status: AvailabilityStatus::PossiblyAvailable,
                counter: 1,
                next_try: now,
            },
            AvailabilityStatus::NotAvailable => {
                if self.counter <= 1 {
                    return Self::unknown_at(now);
                }
                let counter = if self.counter < 5 {
                    self.counter - 1
                } else if self.counter < 10 {
                    self.counter - 2
                } else {
                    self.counter - 4
                };
                Self {
                    status: AvailabilityStatus::NotAvailable,
                    counter,
                    next_try: now,
                }
            }
        }
    }

    /// Next state after a failed connection.
    #[must_use]
    pub fn on_failure(&self, now: Instant) -> Self {
        match self.status {
            AvailabilityStatus::PossiblyAvailable => {
                if self.counter <= 10 {
                    return Self::unknown_at(now);
                }
                Self {
                    status: AvailabilityStatus::PossiblyAvailable,
                    counter: self.counter - 10,
                    next_try: now,
                }
            }
            AvailabilityStatus::Unknown => Self {
                status: AvailabilityStatus::NotAvailable,
                counter: 1,
                next_try: now,
            },
            AvailabilityStatus::NotAvailable => {
                if self.counter >= 20 {
                    // Too many failures, retry again in 10 seconds.
                    return Self {
                        status: AvailabilityStatus::NotAvailable,
                        counter: 20,
                        next_try: now + Duration::from_secs(10),
                    };
                }
                let cool_down = if self.counter >= 10 {
                    Duration::from_secs(5)
                } else if self.counter >= 3 {
                    Duration::from_secs(1)
                } else {
                    Duration::from_millis(100)
                };
                Self {
                    status: AvailabilityStatus::NotAvailable,
                    counter: self.counter + 1,
                    next_try: now + cool_down,
                }
            }
        }
    }
}

impl Default for AvailabilityCounter {
    fn default() -> Self {
        Self::unknown()
    }
}
