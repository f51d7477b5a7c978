use tokio::time::Duration;

pub trait ExponentialBackoff: Sized {
    fn exponential_backoff(&self, max: Duration) -> Self;
}

impl ExponentialBackoff for Duration {
    fn exponential_backoff(&self, max: Duration) -> Self {
        std::cmp::min(self.saturating_mul(2), max)
    }
}
