//! Application Store Port
//!
//! The store exclusively owns application records. Every component reads and
//! writes applications through this port; the workflow layer never keeps a
//! mutable copy across a suspension point.
//!
//! # Adapters
//!
//! - **PostgreSQL**: `infra_db::PostgresApplicationStore`
//! - **In-memory**: [`mock::InMemoryApplicationStore`], with simulated
//!   replication lag for exercising the consistency guard
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_application::ports::ApplicationStore;
//! use std::sync::Arc;
//!
//! let store: Arc<dyn ApplicationStore> = Arc::new(PostgresApplicationStore::new(pool));
//! let app = store.find_by_id(id).await?;
//! ```

use async_trait::async_trait;

use core_kernel::{ApplicationId, DomainPort, PortError};

use crate::application::{Application, HistoryEntry, ResultFields};
use crate::status::ApplicationStatus;

/// A field set written by one logical read-modify-write
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationUpdate {
    /// Replaces the stored status
    pub status: ApplicationStatus,
    /// Merged into the stored results, key by key
    pub fields: ResultFields,
    /// Appended to the stored history
    pub history: Vec<HistoryEntry>,
}

/// Persistence capability for applications
#[async_trait]
pub trait ApplicationStore: DomainPort {
    /// Inserts a new application
    ///
    /// # Errors
    ///
    /// `PortError::Conflict` if an application with the same id exists
    async fn insert(&self, application: &Application) -> Result<(), PortError>;

    /// Retrieves an application by ID
    ///
    /// # Returns
    ///
    /// `None` when the record does not exist or is not yet visible to this reader
    async fn find_by_id(&self, id: ApplicationId) -> Result<Option<Application>, PortError>;

    /// Applies a field set if the stored version still equals `expected_version`
    ///
    /// # Returns
    ///
    /// The new version on success, `PortError::Conflict` when another writer
    /// got there first, or `PortError::NotFound`
    async fn update(
        &self,
        id: ApplicationId,
        expected_version: u64,
        update: ApplicationUpdate,
    ) -> Result<u64, PortError>;

    /// IDs of unsettled applications, oldest submission first
    ///
    /// Completed, errored, and failed-step applications are left out.
    async fn find_in_flight(&self, limit: u32) -> Result<Vec<ApplicationId>, PortError>;
}

/// In-memory implementation of ApplicationStore for testing
///
/// Mimics a replicated store: with a visibility lag of `n`, the first `n`
/// reads of a freshly inserted application miss it.
#[cfg(any(test, feature = "mock"))]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::{Mutex, RwLock};

    use core_kernel::{AdapterHealth, HealthCheckResult, HealthCheckable};

    /// In-memory mock implementation of ApplicationStore
    #[derive(Debug, Default)]
    pub struct InMemoryApplicationStore {
        records: Arc<RwLock<HashMap<ApplicationId, Application>>>,
        hidden_reads: Mutex<HashMap<ApplicationId, u32>>,
        snapshots: Mutex<HashMap<ApplicationId, Vec<ApplicationStatus>>>,
        visibility_lag: u32,
        find_calls: AtomicUsize,
        pending_conflicts: AtomicU32,
        reject_writes: AtomicBool,
    }

    impl InMemoryApplicationStore {
        /// Creates a new store where inserts are immediately visible
        pub fn new() -> Self {
            Self::default()
        }

        /// Creates a store that hides each inserted record for `reads` lookups
        pub fn with_visibility_lag(reads: u32) -> Self {
            Self {
                visibility_lag: reads,
                ..Self::default()
            }
        }

        /// Number of `find_by_id` calls served so far
        pub fn find_calls(&self) -> usize {
            self.find_calls.load(Ordering::SeqCst)
        }

        /// Makes the next `count` updates fail with a version conflict
        pub fn inject_conflicts(&self, count: u32) {
            self.pending_conflicts.store(count, Ordering::SeqCst);
        }

        /// Rejects every write while set
        pub fn reject_writes(&self, reject: bool) {
            self.reject_writes.store(reject, Ordering::SeqCst);
        }

        /// Reads a record, ignoring visibility lag
        pub async fn get(&self, id: ApplicationId) -> Option<Application> {
            self.records.read().await.get(&id).cloned()
        }

        /// Every status written for an application, oldest first
        pub async fn snapshots(&self, id: ApplicationId) -> Vec<ApplicationStatus> {
            self.snapshots.lock().await.get(&id).cloned().unwrap_or_default()
        }

        async fn record_snapshot(&self, id: ApplicationId, status: &ApplicationStatus) {
            self.snapshots
                .lock()
                .await
                .entry(id)
                .or_default()
                .push(status.clone());
        }
    }

    impl DomainPort for InMemoryApplicationStore {}

    #[async_trait]
    impl HealthCheckable for InMemoryApplicationStore {
        async fn health_check(&self) -> HealthCheckResult {
            HealthCheckResult::new("in-memory-application-store", AdapterHealth::Healthy, 0)
                .with_message("Mock adapter always healthy")
        }
    }

    #[async_trait]
    impl ApplicationStore for InMemoryApplicationStore {
        async fn insert(&self, application: &Application) -> Result<(), PortError> {
            if self.reject_writes.load(Ordering::SeqCst) {
                return Err(PortError::write_rejected("store is rejecting writes"));
            }
            let mut records = self.records.write().await;
            if records.contains_key(&application.id) {
                return Err(PortError::conflict(format!(
                    "application {} already exists",
                    application.id
                )));
            }
            records.insert(application.id, application.clone());
            drop(records);

            if self.visibility_lag > 0 {
                self.hidden_reads
                    .lock()
                    .await
                    .insert(application.id, self.visibility_lag);
            }
            self.record_snapshot(application.id, &application.status).await;
            Ok(())
        }

        async fn find_by_id(&self, id: ApplicationId) -> Result<Option<Application>, PortError> {
            self.find_calls.fetch_add(1, Ordering::SeqCst);

            let mut hidden = self.hidden_reads.lock().await;
            if let Some(remaining) = hidden.get_mut(&id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(None);
                }
                hidden.remove(&id);
            }
            drop(hidden);

            Ok(self.records.read().await.get(&id).cloned())
        }

        async fn update(
            &self,
            id: ApplicationId,
            expected_version: u64,
            update: ApplicationUpdate,
        ) -> Result<u64, PortError> {
            if self.reject_writes.load(Ordering::SeqCst) {
                return Err(PortError::write_rejected("store is rejecting writes"));
            }
            let injected = self
                .pending_conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(PortError::conflict(format!(
                    "application {} was modified concurrently",
                    id
                )));
            }

            let mut records = self.records.write().await;
            let record = records
                .get_mut(&id)
                .ok_or_else(|| PortError::not_found("Application", id))?;
            if record.version != expected_version {
                return Err(PortError::conflict(format!(
                    "application {} is at version {}, expected {}",
                    id, record.version, expected_version
                )));
            }

            record.status = update.status;
            record.merge_fields(&update.fields);
            record.history.extend(update.history);
            record.version += 1;
            let version = record.version;
            let status = record.status.clone();
            drop(records);

            self.record_snapshot(id, &status).await;
            Ok(version)
        }

        async fn find_in_flight(&self, limit: u32) -> Result<Vec<ApplicationId>, PortError> {
            let records = self.records.read().await;
            let mut in_flight: Vec<_> = records
                .values()
                .filter(|app| !app.status.is_settled())
                .map(|app| (app.submitted_at, app.id))
                .collect();
            in_flight.sort_by_key(|(submitted_at, _)| *submitted_at);
            Ok(in_flight
                .into_iter()
                .take(limit as usize)
                .map(|(_, id)| id)
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::mock::InMemoryApplicationStore;
    use crate::application::UserData;
    use crate::stage::Stage;
    use crate::status::StepStatus;

    fn draft_update(app: &Application) -> ApplicationUpdate {
        let mut draft = app.clone();
        draft
            .transition_step(Stage::Policy, StepStatus::Processing, &ResultFields::new())
            .unwrap();
        draft.diff_since(app)
    }

    #[tokio::test]
    async fn test_mock_store_insert_and_find() {
        let store = InMemoryApplicationStore::new();
        let app = Application::new(UserData::default());
        store.insert(&app).await.unwrap();

        let found = store.find_by_id(app.id).await.unwrap();
        assert_eq!(found, Some(app));
    }

    #[tokio::test]
    async fn test_mock_store_duplicate_insert() {
        let store = InMemoryApplicationStore::new();
        let app = Application::new(UserData::default());
        store.insert(&app).await.unwrap();
        let result = store.insert(&app).await;
        assert!(result.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_mock_store_visibility_lag() {
        let store = InMemoryApplicationStore::with_visibility_lag(2);
        let app = Application::new(UserData::default());
        store.insert(&app).await.unwrap();

        assert!(store.find_by_id(app.id).await.unwrap().is_none());
        assert!(store.find_by_id(app.id).await.unwrap().is_none());
        assert!(store.find_by_id(app.id).await.unwrap().is_some());
        assert_eq!(store.find_calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_store_update_checks_version() {
        let store = InMemoryApplicationStore::new();
        let app = Application::new(UserData::default());
        store.insert(&app).await.unwrap();

        let version = store.update(app.id, 0, draft_update(&app)).await.unwrap();
        assert_eq!(version, 1);

        let stale = store.update(app.id, 0, draft_update(&app)).await;
        assert!(stale.unwrap_err().is_conflict());

        let stored = store.get(app.id).await.unwrap();
        assert_eq!(stored.history.len(), 1);
        assert_eq!(stored.status.percent_complete, 20);
    }

    #[tokio::test]
    async fn test_mock_store_update_missing() {
        let store = InMemoryApplicationStore::new();
        let app = Application::new(UserData::default());
        let result = store.update(app.id, 0, draft_update(&app)).await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_mock_store_in_flight_excludes_finished() {
        let store = InMemoryApplicationStore::new();
        let running = Application::new(UserData::default());
        let mut done = Application::new(UserData::default());
        done.complete();
        store.insert(&running).await.unwrap();
        store.insert(&done).await.unwrap();

        let ids = store.find_in_flight(10).await.unwrap();
        assert_eq!(ids, vec![running.id]);
    }

    #[tokio::test]
    async fn test_mock_store_in_flight_excludes_failed_step() {
        let store = InMemoryApplicationStore::new();
        let mut failed = Application::new(UserData::default());
        failed
            .transition_step(Stage::Policy, StepStatus::Processing, &ResultFields::new())
            .unwrap();
        failed
            .transition_step(Stage::Policy, StepStatus::Failed, &ResultFields::new())
            .unwrap();
        let pending = Application::new(UserData::default());
        store.insert(&failed).await.unwrap();
        store.insert(&pending).await.unwrap();

        assert_eq!(store.find_in_flight(1).await.unwrap(), vec![pending.id]);
    }
}
