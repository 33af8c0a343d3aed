use std::time::Duration;
use tokio::time::Instant;

/// An absolute point in time by which a whole unit of work must finish.
///
/// Each layer asks for what is left rather than starting its own clock, so
/// inner retries can never push an outer operation past its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// A deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    /// A deadline at a fixed instant.
    pub fn at(instant: Instant) -> Self {
        Self { at: instant }
    }

    /// The instant the budget runs out.
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Whether no budget is left.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// The smaller of `limit` and the remaining budget.
    pub fn cap(&self, limit: Duration) -> Duration {
        limit.min(self.remaining())
    }

    /// Whether waiting `wait` would reach or pass the deadline.
    pub fn would_exceed(&self, wait: Duration) -> bool {
        wait >= self.remaining()
    }
}

/// Cap `limit` by an optional deadline.
pub fn budget(deadline: Option<Deadline>, limit: Duration) -> Duration {
    deadline.map_or(limit, |d| d.cap(limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_remaining_shrinks() {
        let deadline = Deadline::after(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(deadline.remaining(), Duration::from_secs(6));
        assert_eq!(deadline.cap(Duration::from_secs(30)), Duration::from_secs(6));
        assert_eq!(deadline.cap(Duration::from_secs(2)), Duration::from_secs(2));
        assert!(!deadline.is_expired());
        assert!(deadline.would_exceed(Duration::from_secs(6)));
        assert!(!deadline.would_exceed(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline() {
        let deadline = Deadline::after(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
        assert_eq!(budget(Some(deadline), Duration::from_secs(1)), Duration::ZERO);
        assert_eq!(budget(None, Duration::from_secs(1)), Duration::from_secs(1));
    }
}
