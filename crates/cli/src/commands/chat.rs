use std::io;
use std::sync::Arc;

use anyhow::Context;
use concierge_agent::{BookingRuntime, RuntimeBuilder, RuntimeError};
use concierge_core::audit::TracingAuditSink;
use concierge_core::config::{AppConfig, BookingApiMode, LoadOptions, LogFormat, LoggingConfig};
use concierge_core::domain::session::SessionId;
use concierge_core::errors::ApplicationError;
use concierge_db::{connect, migrations, DbPool, SqlSessionStore, SqlSideEffectLedger};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{warn, Level};

use crate::commands::{async_runtime, CommandResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatSummary {
    pub turns: usize,
    /// Sessions the loop talked to, including ones opened after a conversation ended.
    pub sessions: usize,
    pub last_session: SessionId,
}

pub fn run(mut options: LoadOptions, session: Option<String>, sandbox: bool) -> CommandResult {
    if sandbox {
        options.overrides.booking_api_mode = Some(BookingApiMode::Sandbox);
    }
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "chat",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };
    init_logging(&config.logging);

    let runtime = match async_runtime("chat") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let session_id = session.map(|id| SessionId::from(id.as_str())).unwrap_or_else(SessionId::generate);
    let result = runtime.block_on(async {
        let (booking, pool) = open_runtime(&config, sandbox).await?;
        let input = BufReader::new(tokio::io::stdin());
        let mut output = tokio::io::stdout();
        let summary = converse(&booking, session_id, input, &mut output)
            .await
            .context("terminal i/o failed")?;
        pool.close().await;
        Ok::<ChatSummary, anyhow::Error>(summary)
    });

    match result {
        Ok(summary) => CommandResult::success(
            "chat",
            format!(
                "{} turn(s) across {} session(s); last session {}",
                summary.turns, summary.sessions, summary.last_session
            ),
        ),
        Err(error) => CommandResult::failure("chat", "runtime", format!("{error:#}"), 4),
    }
}

async fn open_runtime(config: &AppConfig, sandbox: bool) -> anyhow::Result<(BookingRuntime, DbPool)> {
    let pool = connect(&config.database).await.context("failed to connect to database")?;
    migrations::run_pending(&pool).await.context("failed to apply migrations")?;

    let runtime = RuntimeBuilder::from_config(config, sandbox)?
        .store(Arc::new(SqlSessionStore::new(pool.clone())))
        .ledger(Arc::new(SqlSideEffectLedger::new(pool.clone())))
        .audit(Arc::new(TracingAuditSink))
        .build()?;
    Ok((runtime, pool))
}

/// Runs one turn per input line until end of input or `/quit`.
///
/// `/reset` clears the current booking. When a conversation ends the loop continues on a
/// freshly generated session id.
pub async fn converse<R, W>(
    runtime: &BookingRuntime,
    session_id: SessionId,
    input: R,
    output: &mut W,
) -> io::Result<ChatSummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut summary = ChatSummary { turns: 0, sessions: 1, last_session: session_id };
    write_line(
        output,
        &format!(
            "session {}. Type /reset to start over or /quit to leave.",
            summary.last_session
        ),
    )
    .await?;

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" || text == "/exit" {
            break;
        }
        if text == "/reset" {
            let notice = match runtime.reset(&summary.last_session).await {
                Ok(session) => format!("(booking cleared, epoch {})", session.epoch),
                Err(RuntimeError::NotFound(_)) => "(nothing to reset yet)".to_owned(),
                Err(error) => format!("(reset failed: {error})"),
            };
            write_line(output, &notice).await?;
            continue;
        }

        match runtime.process_turn(&summary.last_session, text).await {
            Ok(reply) => {
                summary.turns += 1;
                if !reply.assistant_text.is_empty() {
                    write_line(output, &reply.assistant_text).await?;
                }
                if reply.is_terminal {
                    summary.last_session = SessionId::generate();
                    summary.sessions += 1;
                    write_line(output, &format!("(new session {})", summary.last_session)).await?;
                }
            }
            Err(error) => {
                warn!(
                    event_name = "cli.chat.turn_failed",
                    session_id = %summary.last_session,
                    error = %error,
                    "turn could not be processed"
                );
                let message = ApplicationError::from(error).into_interface("cli").user_message();
                write_line(output, &format!("({message})")).await?;
            }
        }
    }

    output.flush().await?;
    Ok(summary)
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, text: &str) -> io::Result<()> {
    output.write_all(text.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}

fn init_logging(logging: &LoggingConfig) {
    let level = logging.level.parse::<Level>().unwrap_or(Level::WARN);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .with_writer(io::stderr);

    // A subscriber may already be installed when the command runs inside a test harness.
    let _ = match logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use concierge_agent::{RuntimeBuilder, SandboxBookingApi, ScriptedLlm};
    use concierge_core::config::EngineConfig;
    use concierge_core::domain::session::SessionId;
    use concierge_core::ledger::InMemorySideEffectLedger;
    use concierge_core::store::InMemorySessionStore;
    use serde_json::json;

    use super::converse;

    fn runtime_with(llm: Arc<ScriptedLlm>) -> concierge_agent::BookingRuntime {
        RuntimeBuilder::new(EngineConfig {
            collect_payment: false,
            max_extraction_retries: None,
            llm_timeout_secs: 5,
            upstream_timeout_secs: 5,
        })
        .llm(llm)
        .booking_api(Arc::new(SandboxBookingApi::new()))
        .store(Arc::new(InMemorySessionStore::default()))
        .ledger(Arc::new(InMemorySideEffectLedger::default()))
        .build()
        .expect("runtime builds")
    }

    fn reply(message: &str, collected: serde_json::Value) -> String {
        json!({ "done": true, "message": message, "collected": collected }).to_string()
    }

    #[tokio::test]
    async fn each_line_is_one_turn_and_quit_stops_the_loop() {
        let llm = Arc::new(ScriptedLlm::new([reply("Sure.", json!({ "flow": "booking" }))]));
        let runtime = runtime_with(llm.clone());
        let input = "I want to book a lounge\n\n/quit\nnever read\n".as_bytes();
        let mut output = Vec::new();

        let summary = converse(&runtime, SessionId::from("cli-1"), input, &mut output)
            .await
            .expect("chat loop");

        assert_eq!(summary.turns, 1);
        assert_eq!(summary.sessions, 1);
        assert_eq!(summary.last_session, SessionId::from("cli-1"));
        assert_eq!(llm.remaining(), 0);
        let transcript = String::from_utf8(output).expect("utf8");
        assert!(transcript.starts_with("session cli-1."));
        assert!(transcript.contains("arrival, your departure, or both"));
    }

    #[tokio::test]
    async fn reset_before_any_turn_reports_nothing_to_reset() {
        let runtime = runtime_with(Arc::new(ScriptedLlm::default()));
        let mut output = Vec::new();

        let summary = converse(&runtime, SessionId::from("cli-2"), "/reset\n".as_bytes(), &mut output)
            .await
            .expect("chat loop");

        assert_eq!(summary.turns, 0);
        assert!(String::from_utf8(output).expect("utf8").contains("(nothing to reset yet)"));
    }

    #[tokio::test]
    async fn ended_conversation_rotates_to_a_new_session() {
        let llm = Arc::new(ScriptedLlm::new([
            reply("", json!({ "flow": "general" })),
            "Lounges open at 5am.".to_owned(),
            reply("Sure.", json!({ "flow": "booking" })),
        ]));
        let runtime = runtime_with(llm);
        let input = "When do lounges open?\nBook me a lounge\n".as_bytes();
        let mut output = Vec::new();

        let summary = converse(&runtime, SessionId::from("cli-3"), input, &mut output)
            .await
            .expect("chat loop");

        assert_eq!(summary.turns, 2);
        assert_eq!(summary.sessions, 2);
        assert_ne!(summary.last_session, SessionId::from("cli-3"));
        let transcript = String::from_utf8(output).expect("utf8");
        assert!(transcript.contains("Lounges open at 5am.\n(new session "));
        let closed = runtime
            .session(&SessionId::from("cli-3"))
            .await
            .expect("load")
            .expect("first session persisted");
        assert!(closed.status.is_terminal());
    }
}
