//! Clock capability

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Source of wall-clock time and sleeps.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);

    /// `YYYYMMDD_HHMMSS` stamp used in backup and export names.
    fn stamp(&self) -> String {
        self.now().format("%Y%m%d_%H%M%S").to_string()
    }
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
