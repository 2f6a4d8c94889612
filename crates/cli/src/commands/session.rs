use concierge_core::config::{AppConfig, LoadOptions};
use concierge_core::domain::booking::mask_card_number;
use concierge_core::domain::session::{Session, SessionId};
use concierge_core::store::SessionStore;
use concierge_db::{connect, migrations, DbPool, SqlSessionStore};
use serde_json::Value;

use crate::commands::{async_runtime, CommandResult};

type Failure = (&'static str, String, u8);

pub fn show(options: LoadOptions, id: &str) -> CommandResult {
    let session_id = SessionId::from(id);
    with_store("session show", options, |store| async move {
        let session = load_existing(&store, &session_id).await?;
        render_session(&session).map_err(|error| ("serialization", error.to_string(), 5))
    })
}

pub fn reset(options: LoadOptions, id: &str) -> CommandResult {
    let session_id = SessionId::from(id);
    let result = with_store("session reset", options, |store| async move {
        let mut session = load_existing(&store, &session_id).await?;
        session.reset();
        store.save(&session).await.map_err(|error| ("persistence", error.to_string(), 5))?;
        Ok(format!("session {} reset (epoch {})", session.id, session.epoch))
    });
    if result.exit_code == 0 {
        CommandResult::success("session reset", result.output)
    } else {
        result
    }
}

pub fn list(options: LoadOptions, limit: u32) -> CommandResult {
    with_store("session list", options, |store| async move {
        let summaries = store
            .list_recent(limit)
            .await
            .map_err(|error| ("persistence", error.to_string(), 5))?;
        if summaries.is_empty() {
            return Ok("no sessions recorded".to_string());
        }
        Ok(summaries
            .iter()
            .map(|summary| {
                format!(
                    "- {} node={} status={} flow={} epoch={} turns={} updated={}",
                    summary.id,
                    summary.current_node,
                    summary.status.as_str(),
                    summary.flow.as_deref().unwrap_or("-"),
                    summary.epoch,
                    summary.turn_count,
                    summary.updated_at.to_rfc3339()
                )
            })
            .collect::<Vec<_>>()
            .join("\n"))
    })
}

/// Pretty JSON of the persisted session with card data masked.
pub fn render_session(session: &Session) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(session)?;
    mask_payment_fields(&mut value);
    serde_json::to_string_pretty(&value)
}

fn mask_payment_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                let masked = match (key.as_str(), &*field) {
                    ("cardNumber", Value::String(number)) => Some(mask_card_number(number)),
                    ("cvv", Value::String(_)) => Some("***".to_string()),
                    _ => None,
                };
                match masked {
                    Some(masked) => *field = Value::String(masked),
                    None => mask_payment_fields(field),
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(mask_payment_fields),
        _ => {}
    }
}

async fn load_existing(store: &SqlSessionStore, session_id: &SessionId) -> Result<Session, Failure> {
    store
        .load(session_id)
        .await
        .map_err(|error| ("persistence", error.to_string(), 5))?
        .ok_or_else(|| ("not_found", format!("no session with id `{session_id}`"), 6))
}

fn with_store<F, Fut>(command: &str, options: LoadOptions, action: F) -> CommandResult
where
    F: FnOnce(SqlSessionStore) -> Fut,
    Fut: std::future::Future<Output = Result<String, Failure>>,
{
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                command,
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match async_runtime(command) {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let output = action(SqlSessionStore::new(pool.clone())).await;
        pool.close().await;
        output
    });

    match result {
        Ok(output) => CommandResult { exit_code: 0, output },
        Err((error_class, message, exit_code)) => {
            CommandResult::failure(command, error_class, message, exit_code)
        }
    }
}

async fn open_pool(config: &AppConfig) -> Result<DbPool, Failure> {
    let pool = connect(&config.database)
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4))?;
    migrations::run_pending(&pool).await.map_err(|error| ("migration", error.to_string(), 5))?;
    Ok(pool)
}
