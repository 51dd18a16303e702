//! Throwaway PostgreSQL for integration tests
//!
//! Each `PipelineDatabase` owns a container with the pipeline schema
//! applied. The container stops when the value is dropped.

use once_cell::sync::Lazy;
use sqlx::PgPool;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};

use infra_db::{create_pool, run_migrations, DatabaseConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const USER: &str = "pipeline";
const PASSWORD: &str = "pipeline";
const DATABASE: &str = "underwriting_test";

/// Image tag, overridable with `TEST_POSTGRES_TAG`
static POSTGRES_TAG: Lazy<String> =
    Lazy::new(|| std::env::var("TEST_POSTGRES_TAG").unwrap_or_else(|_| "16-alpine".to_string()));

fn database_url(host: &str, port: u16) -> String {
    format!("postgres://{USER}:{PASSWORD}@{host}:{port}/{DATABASE}")
}

pub struct PipelineDatabase {
    _container: ContainerAsync<GenericImage>,
    url: String,
    pool: PgPool,
}

impl PipelineDatabase {
    /// Starts a container and applies the schema
    pub async fn start() -> Result<Self, BoxError> {
        let container = GenericImage::new("postgres", POSTGRES_TAG.as_str())
            .with_exposed_port(5432.tcp())
            .with_wait_for(WaitFor::message_on_stderr("database system is ready to accept connections"))
            .with_env_var("POSTGRES_USER", USER)
            .with_env_var("POSTGRES_PASSWORD", PASSWORD)
            .with_env_var("POSTGRES_DB", DATABASE)
            .start()
            .await?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(5432).await?;
        let url = database_url(&host, port);

        let pool = create_pool(DatabaseConfig::new(&url)).await?;
        run_migrations(&pool).await?;

        Ok(Self {
            _container: container,
            url,
            pool,
        })
    }

    /// Connection string reachable from the host, e.g. for a spawned worker process
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Declares a Docker-backed test that receives a fresh pool
///
/// Ignored by default; run with `--ignored`.
#[macro_export]
macro_rules! db_test {
    ($name:ident, |$pool:ident| $body:block) => {
        #[tokio::test]
        #[ignore = "requires Docker"]
        async fn $name() {
            let db = $crate::database::PipelineDatabase::start()
                .await
                .expect("Failed to start PostgreSQL container");
            let $pool = db.pool().clone();
            $body
        }
    };
}
