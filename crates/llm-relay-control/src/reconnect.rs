//! Reconnection logic with exponential backoff and full jitter

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<usize>,
    /// Sleep a uniformly random time in `[0, backoff]` instead of `backoff`
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: Some(10),
            jitter: true,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,
}

/// Reconnection manager with exponential backoff
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Start the next attempt and return how long to wait before it
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        let ceiling = self.current_backoff;
        let delay = if self.config.jitter && !ceiling.is_zero() {
            rand::thread_rng().gen_range(Duration::ZERO..=ceiling)
        } else {
            ceiling
        };

        // Increase backoff, saturating at the ceiling
        let scaled = self.current_backoff.as_secs_f64() * self.config.multiplier;
        let next_backoff =
            Duration::try_from_secs_f64(scaled).unwrap_or(self.config.max_backoff);
        self.current_backoff = next_backoff.min(self.config.max_backoff);

        debug!(
            "Waiting {}ms before reconnection attempt {}",
            delay.as_millis(),
            self.attempt
        );
        Ok(delay)
    }

    /// Wait before next reconnection attempt
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        let delay = self.next_delay()?;
        sleep(delay).await;
        Ok(())
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Get current backoff ceiling
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: Option<usize>, jitter: bool) -> ReconnectConfig {
        ReconnectConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts,
            jitter,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff() {
        let mut manager = ReconnectManager::new(config(None, false));

        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.current_backoff(), Duration::from_millis(10));

        manager.wait().await.unwrap();
        assert_eq!(manager.attempt(), 1);
        assert_eq!(manager.current_backoff(), Duration::from_millis(20));

        manager.wait().await.unwrap();
        assert_eq!(manager.current_backoff(), Duration::from_millis(40));

        manager.wait().await.unwrap();
        assert_eq!(manager.current_backoff(), Duration::from_millis(80));

        manager.wait().await.unwrap();
        assert_eq!(manager.attempt(), 4);
        // Should cap at max_backoff
        assert_eq!(manager.current_backoff(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_reset() {
        let mut manager = ReconnectManager::new(config(None, false));

        manager.wait().await.unwrap();
        manager.wait().await.unwrap();
        assert_eq!(manager.attempt(), 2);

        manager.reset();
        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.current_backoff(), Duration::from_millis(10));
    }

    #[test]
    fn test_max_attempts() {
        let mut manager = ReconnectManager::new(config(Some(2), false));

        assert!(manager.next_delay().is_ok());
        assert!(manager.next_delay().is_ok());
        assert_eq!(
            manager.next_delay(),
            Err(ReconnectError::MaxAttemptsReached)
        );
    }

    #[test]
    fn test_jitter_stays_within_ceiling() {
        let mut manager = ReconnectManager::new(config(None, true));

        for _ in 0..50 {
            let ceiling = manager.current_backoff();
            let delay = manager.next_delay().unwrap();
            assert!(delay <= ceiling);
        }
    }

    #[test]
    fn test_huge_multiplier_saturates_at_max_backoff() {
        let mut manager = ReconnectManager::new(ReconnectConfig {
            multiplier: 1e300,
            ..config(None, false)
        });

        assert_eq!(manager.next_delay().unwrap(), Duration::from_millis(10));
        assert_eq!(manager.current_backoff(), Duration::from_millis(100));
        assert_eq!(manager.next_delay().unwrap(), Duration::from_millis(100));
    }
}
