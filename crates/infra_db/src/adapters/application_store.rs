//! PostgreSQL Application Store Adapter
//!
//! Implements `ApplicationStore` over `ApplicationRepository`. The domain
//! record is split into JSONB columns on the way in and reassembled on the
//! way out; the version column backs the optimistic concurrency check.
//!
//! # Example
//!
//! ```rust,ignore
//! use infra_db::PostgresApplicationStore;
//! use domain_application::ApplicationStore;
//! use std::sync::Arc;
//!
//! let store: Arc<dyn ApplicationStore> = Arc::new(PostgresApplicationStore::new(pool));
//! let app = store.find_by_id(id).await?;
//! ```

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, instrument};

use core_kernel::{ApplicationId, DomainPort, HealthCheckable, HealthCheckResult, PortError};
use domain_application::{Application, ApplicationStatus, ApplicationStore, ApplicationUpdate};

use crate::adapters::ping;
use crate::error::DatabaseError;
use crate::repositories::{ApplicationChanges, ApplicationRepository, ApplicationRow, StatusFlags};

/// PostgreSQL-backed implementation of the ApplicationStore trait
#[derive(Debug, Clone)]
pub struct PostgresApplicationStore {
    repository: ApplicationRepository,
    pool: PgPool,
}

impl PostgresApplicationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            repository: ApplicationRepository::new(pool.clone()),
            pool,
        }
    }

    pub fn repository(&self) -> &ApplicationRepository {
        &self.repository
    }
}

impl DomainPort for PostgresApplicationStore {}

#[async_trait]
impl HealthCheckable for PostgresApplicationStore {
    async fn health_check(&self) -> HealthCheckResult {
        ping(&self.pool, "postgres-application-store").await
    }
}

#[async_trait]
impl ApplicationStore for PostgresApplicationStore {
    #[instrument(skip(self, application), fields(application_id = %application.id))]
    async fn insert(&self, application: &Application) -> Result<(), PortError> {
        let row = application_to_row(application)?;
        self.repository
            .insert(&row, flags_of(&application.status))
            .await
            .map_err(|e| match e {
                DatabaseError::DuplicateEntry(_) => {
                    PortError::conflict(format!("application {} already exists", application.id))
                }
                other => other.into(),
            })?;
        debug!("Inserted application");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: ApplicationId) -> Result<Option<Application>, PortError> {
        let row = self.repository.find(id.into()).await?;
        row.map(row_to_application).transpose().map_err(PortError::from)
    }

    #[instrument(skip(self, update))]
    async fn update(
        &self,
        id: ApplicationId,
        expected_version: u64,
        update: ApplicationUpdate,
    ) -> Result<u64, PortError> {
        let changes = ApplicationChanges {
            flags: flags_of(&update.status),
            status: serde_json::to_value(&update.status).map_err(DatabaseError::from)?,
            fields: serde_json::to_value(&update.fields).map_err(DatabaseError::from)?,
            history: serde_json::to_value(&update.history).map_err(DatabaseError::from)?,
        };
        let expected = i64::try_from(expected_version)
            .map_err(|_| PortError::validation(format!("version {} out of range", expected_version)))?;

        match self.repository.update_versioned(id.into(), expected, &changes).await? {
            Some(version) => {
                debug!(version, "Updated application");
                Ok(version as u64)
            }
            None if self.repository.exists(id.into()).await? => Err(PortError::conflict(format!(
                "application {} is no longer at version {}",
                id, expected_version
            ))),
            None => Err(PortError::not_found("Application", id)),
        }
    }

    #[instrument(skip(self))]
    async fn find_in_flight(&self, limit: u32) -> Result<Vec<ApplicationId>, PortError> {
        let ids = self.repository.find_in_flight(i64::from(limit)).await?;
        Ok(ids.into_iter().map(ApplicationId::from).collect())
    }
}

fn flags_of(status: &ApplicationStatus) -> StatusFlags {
    StatusFlags {
        completed: status.completed,
        errored: status.error.is_some(),
        settled: status.is_settled(),
    }
}

fn application_to_row(application: &Application) -> Result<ApplicationRow, DatabaseError> {
    Ok(ApplicationRow {
        id: application.id.into(),
        user_data: serde_json::to_value(&application.user_data)?,
        submitted_at: application.submitted_at,
        status: serde_json::to_value(&application.status)?,
        results: serde_json::to_value(&application.results)?,
        history: serde_json::to_value(&application.history)?,
        version: application.version as i64,
    })
}

fn row_to_application(row: ApplicationRow) -> Result<Application, DatabaseError> {
    Ok(Application {
        id: ApplicationId::from(row.id),
        user_data: serde_json::from_value(row.user_data)?,
        submitted_at: row.submitted_at,
        status: serde_json::from_value(row.status)?,
        results: serde_json::from_value(row.results)?,
        history: serde_json::from_value(row.history)?,
        version: row.version.max(0) as u64,
    })
}
