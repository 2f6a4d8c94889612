use std::sync::Arc;

use concierge_agent::{BookingRuntime, RuntimeBuilder, RuntimeError};
use concierge_core::audit::TracingAuditSink;
use concierge_core::config::{AppConfig, ConfigError};
use concierge_db::{connect, migrations, DbPool, SqlSessionStore, SqlSideEffectLedger};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<BookingRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("runtime wiring failed: {0}")]
    Runtime(#[from] RuntimeError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        booking_api_mode = config.booking_api.mode.as_str(),
        llm_provider = config.llm.provider.as_str(),
        "starting application bootstrap"
    );

    let db_pool = connect(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let runtime = RuntimeBuilder::from_config(&config, false)?
        .store(Arc::new(SqlSessionStore::new(db_pool.clone())))
        .ledger(Arc::new(SqlSideEffectLedger::new(db_pool.clone())))
        .audit(Arc::new(TracingAuditSink))
        .build()?;
    info!(
        event_name = "system.bootstrap.runtime_ready",
        correlation_id = "bootstrap",
        collect_payment = config.engine.collect_payment,
        "booking runtime wired"
    );

    Ok(Application { config, db_pool, runtime: Arc::new(runtime) })
}

#[cfg(test)]
mod tests {
    use concierge_core::config::{AppConfig, BookingApiMode, ConfigOverrides, LoadOptions};
    use concierge_core::domain::session::SessionId;

    use crate::bootstrap::{bootstrap_with_config, Application, BootstrapError};

    async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
        bootstrap_with_config(AppConfig::load(options)?).await
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_when_http_backend_has_no_url() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                booking_api_mode: Some(BookingApiMode::Http),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let error = result.err().expect("bootstrap should fail");
        assert!(matches!(error, BootstrapError::Config(_)));
        assert!(error.to_string().contains("booking_api.base_url"));
    }

    #[tokio::test]
    async fn sandbox_bootstrap_migrates_and_wires_the_runtime() {
        let app = bootstrap(sandbox_options()).await.expect("bootstrap should succeed");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('booking_sessions', 'side_effect_ledger')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("expected booking tables after bootstrap");
        assert_eq!(table_count, 2);

        let session = app.runtime.session(&SessionId::from("nobody")).await.expect("load");
        assert!(session.is_none());

        app.db_pool.close().await;
    }

    fn sandbox_options() -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                booking_api_mode: Some(BookingApiMode::Sandbox),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }
}
