//! Eventual-consistency guard
//!
//! A freshly written application may not be visible to every reader yet.
//! Stage workers poll the store until the record shows up, bounded by a
//! fixed number of reads.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use core_kernel::ApplicationId;
use domain_application::{Application, ApplicationStore};

use crate::error::{WorkflowError, WorkflowResult};

/// Polling bounds for the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardConfig {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_attempts: 40,
            interval: Duration::from_millis(500),
        }
    }
}

/// Reads `id` until it is visible, at most `max_attempts` times
///
/// Sleeps `interval` between misses but not after the last one. Store read
/// errors end the wait immediately.
pub async fn await_visible(
    store: &dyn ApplicationStore,
    id: ApplicationId,
    max_attempts: u32,
    interval: Duration,
) -> WorkflowResult<Application> {
    for attempt in 1..=max_attempts {
        if let Some(application) = store.find_by_id(id).await.map_err(WorkflowError::StoreRead)? {
            if attempt > 1 {
                debug!(application_id = %id, attempt, "Application became visible");
            }
            return Ok(application);
        }
        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    debug!(application_id = %id, max_attempts, "Application not visible after polling");
    Err(WorkflowError::NotFound(id))
}

/// [`await_visible`] bound to a store and its polling bounds
#[derive(Clone)]
pub struct ConsistencyGuard {
    store: Arc<dyn ApplicationStore>,
    config: GuardConfig,
}

impl ConsistencyGuard {
    pub fn new(store: Arc<dyn ApplicationStore>, config: GuardConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> GuardConfig {
        self.config
    }

    pub async fn await_visible(&self, id: ApplicationId) -> WorkflowResult<Application> {
        await_visible(
            self.store.as_ref(),
            id,
            self.config.max_attempts,
            self.config.interval,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain_application::{InMemoryApplicationStore, UserData};

    #[tokio::test]
    async fn test_returns_on_first_visible_read() {
        let store = InMemoryApplicationStore::with_visibility_lag(3);
        let app = Application::new(UserData::default());
        store.insert(&app).await.unwrap();

        let found = await_visible(&store, app.id, 10, Duration::from_millis(1)).await.unwrap();
        assert_eq!(found.id, app.id);
        assert_eq!(store.find_calls(), 4);
    }

    #[tokio::test]
    async fn test_gives_up_after_exactly_max_attempts() {
        let store = InMemoryApplicationStore::new();
        let missing = ApplicationId::new();

        let err = await_visible(&store, missing, 5, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(id) if id == missing));
        assert_eq!(store.find_calls(), 5);
    }

    #[tokio::test]
    async fn test_does_not_sleep_after_last_miss() {
        let store = InMemoryApplicationStore::new();
        let started = tokio::time::Instant::now();
        let result = await_visible(&store, ApplicationId::new(), 1, Duration::from_secs(30)).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_default_bounds() {
        let config = GuardConfig::default();
        assert_eq!(config.max_attempts, 40);
        assert_eq!(config.interval, Duration::from_millis(500));
    }
}
