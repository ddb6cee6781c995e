//! Error escalation for the card.
//!
//! Individual read/write failures only degrade the card. Once more than
//! `threshold` of them happened without a success in between, or when the
//! card is pulled or a format is requested, the supervisor tears the medium
//! down and starts over.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// No unresolved failures
    Ready,
    /// This many failures since the last success
    Degraded(u32),
    /// Unmount and re-initialize on the next turn
    Reinitializing,
}

impl Health {
    /// A read or write went through, the streak is over.
    pub fn record_success(&mut self) {
        if let Health::Degraded(_) = self {
            *self = Health::Ready;
        }
    }

    /// A read or write failed. Returns true when this crossed the threshold.
    pub fn record_failure(&mut self, threshold: u32) -> bool {
        let count = match *self {
            Health::Ready => 1,
            Health::Degraded(n) => n.saturating_add(1),
            Health::Reinitializing => return false,
        };
        *self = if count > threshold {
            Health::Reinitializing
        } else {
            Health::Degraded(count)
        };
        *self == Health::Reinitializing
    }

    /// Card removal and format requests skip the counting.
    pub fn force_reinit(&mut self) {
        *self = Health::Reinitializing;
    }

    /// Consumes a pending re-initialization, resetting the counter.
    pub fn take_reinit(&mut self) -> bool {
        if *self == Health::Reinitializing {
            *self = Health::Ready;
            true
        } else {
            false
        }
    }

    /// Failures since the last success, as reported to the protocol layer.
    pub fn error_count(&self, threshold: u32) -> u32 {
        match *self {
            Health::Ready => 0,
            Health::Degraded(n) => n,
            Health::Reinitializing => threshold + 1,
        }
    }
}
