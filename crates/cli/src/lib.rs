pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use concierge_core::config::LoadOptions;

#[derive(Debug, Parser)]
#[command(
    name = "concierge",
    about = "Lounge booking concierge",
    long_about = "Chat with the lounge booking assistant, inspect persisted sessions, and check runtime readiness.",
    after_help = "Examples:\n  concierge chat --sandbox\n  concierge session show <id>\n  concierge doctor --json"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a concierge.toml config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Start an interactive booking conversation on stdin/stdout")]
    Chat {
        #[arg(long, help = "Resume or name the session id (a new id is generated otherwise)")]
        session: Option<String>,
        #[arg(long, help = "Use the in-process booking backend instead of the HTTP API")]
        sandbox: bool,
    },
    #[command(subcommand, about = "Inspect or reset persisted sessions")]
    Session(SessionCommand),
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, model and booking endpoints, and DB readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    #[command(about = "Print the persisted session state as JSON")]
    Show { id: String },
    #[command(about = "Clear booking progress while keeping the transcript")]
    Reset { id: String },
    #[command(about = "List the most recently updated sessions")]
    List {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = load_options(cli.config);

    let result = match cli.command {
        Command::Chat { session, sandbox } => commands::chat::run(options, session, sandbox),
        Command::Session(SessionCommand::Show { id }) => commands::session::show(options, &id),
        Command::Session(SessionCommand::Reset { id }) => commands::session::reset(options, &id),
        Command::Session(SessionCommand::List { limit }) => commands::session::list(options, limit),
        Command::Migrate => commands::migrate::run(options),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(options) }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(options, json) }
        }
    };

    if !result.output.is_empty() {
        println!("{}", result.output);
    }
    ExitCode::from(result.exit_code)
}

fn load_options(config_path: Option<PathBuf>) -> LoadOptions {
    match config_path {
        Some(path) => LoadOptions { config_path: Some(path), require_file: true, ..LoadOptions::default() },
        None => LoadOptions::default(),
    }
}
