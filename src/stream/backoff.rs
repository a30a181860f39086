use std::time::Duration;
use tokio::time::sleep;

/// Reconnect delay for the bridged transport
///
/// Doubles from `initial` up to `max` and never gives up; the caller stops
/// reconnecting when the subscription is closed.
#[derive(Debug)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    current_attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current_attempt: 0,
        }
    }

    pub fn next_delay(&self) -> Duration {
        let factor = 2_u32.saturating_pow(self.current_attempt.min(16));
        std::cmp::min(self.initial.saturating_mul(factor), self.max)
    }

    pub async fn sleep(&mut self) {
        let delay = self.next_delay();
        log::warn!("⏳ Reconnect attempt {} in {:?}", self.current_attempt + 1, delay);
        sleep(delay).await;
        self.current_attempt = self.current_attempt.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_delay_doubles_and_caps() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        backoff.sleep().await;
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        backoff.sleep().await;
        backoff.sleep().await;
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
