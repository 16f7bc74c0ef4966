//! Per-subscription high-water marks used to resume relay subscriptions after
//! a reconnect or restart.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tracing::debug;

use crate::store::{CoordinationStore, StoreError};

/// Window re-requested on resume to cover clock skew between relays.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(2 * 180);

/// Tracks the newest `created_at` handled per subscription.
///
/// Watermarks live in the coordination store so they survive restarts; the
/// local cache only keeps concurrent handlers of this process from writing a
/// lower value over a higher one.
pub struct ReplayTracker {
    store: Arc<dyn CoordinationStore>,
    tolerance: Duration,
    cache: Mutex<HashMap<String, u64>>,
}

impl ReplayTracker {
    pub fn new(store: Arc<dyn CoordinationStore>, tolerance: Duration) -> Self {
        Self {
            store,
            tolerance,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn store_key(subscription: &str) -> String {
        format!("watermark:{subscription}")
    }

    async fn load(&self, subscription: &str) -> Result<Option<u64>, StoreError> {
        let raw = self.store.get(&Self::store_key(subscription)).await?;
        Ok(raw.and_then(|v| v.trim().parse().ok()))
    }

    /// Record `created_at` for `subscription`; values not above the current
    /// watermark are ignored.
    pub async fn mark_processed(&self, subscription: &str, created_at: u64) -> Result<(), StoreError> {
        let mut cache = self.cache.lock().await;
        let current = match cache.get(subscription) {
            Some(ts) => Some(*ts),
            None => self.load(subscription).await?,
        };
        if current.is_some_and(|ts| created_at <= ts) {
            return Ok(());
        }
        self.store
            .set(&Self::store_key(subscription), &created_at.to_string())
            .await?;
        cache.insert(subscription.to_string(), created_at);
        debug!(subscription, created_at, "watermark advanced");
        Ok(())
    }

    /// Last recorded timestamp, if any.
    pub async fn current_watermark(&self, subscription: &str) -> Result<Option<u64>, StoreError> {
        if let Some(ts) = self.cache.lock().await.get(subscription) {
            return Ok(Some(*ts));
        }
        self.load(subscription).await
    }

    /// `since` bound for a (re)subscription: the watermark minus the tolerance
    /// window, or `None` on first run so the relay sends its full backlog.
    pub async fn resume_since(&self, subscription: &str) -> Result<Option<u64>, StoreError> {
        Ok(self
            .current_watermark(subscription)
            .await?
            .map(|ts| ts.saturating_sub(self.tolerance.as_secs())))
    }
}
