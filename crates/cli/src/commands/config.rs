use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use concierge_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

struct ConfigEntry {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

pub fn run(options: LoadOptions) -> String {
    let explicit_path = options.config_path.clone();
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path(explicit_path);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines =
        vec!["effective config (source precedence: env > file > default):".to_string()];
    for entry in entries(&config) {
        let source = field_source(
            entry.key,
            entry.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(entry.key, &entry.value, source));
    }

    lines.join("\n")
}

fn entries(config: &AppConfig) -> Vec<ConfigEntry> {
    vec![
        entry("database.url", config.database.url.clone(), &["CONCIERGE_DATABASE_URL"]),
        entry(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["CONCIERGE_DATABASE_MAX_CONNECTIONS"],
        ),
        entry(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["CONCIERGE_DATABASE_TIMEOUT_SECS"],
        ),
        entry("llm.provider", config.llm.provider.as_str().to_string(), &["CONCIERGE_LLM_PROVIDER"]),
        entry("llm.model", config.llm.model.clone(), &["CONCIERGE_LLM_MODEL"]),
        entry("llm.base_url", optional(config.llm.base_url.as_deref()), &["CONCIERGE_LLM_BASE_URL"]),
        entry(
            "llm.api_key",
            redact_secret(config.llm.api_key.as_ref().map(|key| key.expose_secret())),
            &["CONCIERGE_LLM_API_KEY"],
        ),
        entry(
            "llm.timeout_secs",
            config.llm.timeout_secs.to_string(),
            &["CONCIERGE_LLM_TIMEOUT_SECS"],
        ),
        entry("llm.max_retries", config.llm.max_retries.to_string(), &["CONCIERGE_LLM_MAX_RETRIES"]),
        entry(
            "booking_api.mode",
            config.booking_api.mode.as_str().to_string(),
            &["CONCIERGE_BOOKING_API_MODE"],
        ),
        entry(
            "booking_api.base_url",
            optional(config.booking_api.base_url.as_deref()),
            &["CONCIERGE_BOOKING_API_BASE_URL"],
        ),
        entry(
            "booking_api.username",
            optional(config.booking_api.username.as_deref()),
            &["CONCIERGE_BOOKING_API_USERNAME"],
        ),
        entry(
            "booking_api.session_token",
            redact_secret(
                config.booking_api.session_token.as_ref().map(|token| token.expose_secret()),
            ),
            &["CONCIERGE_BOOKING_API_SESSION_TOKEN"],
        ),
        entry(
            "booking_api.timeout_secs",
            config.booking_api.timeout_secs.to_string(),
            &["CONCIERGE_BOOKING_API_TIMEOUT_SECS"],
        ),
        entry(
            "engine.collect_payment",
            config.engine.collect_payment.to_string(),
            &["CONCIERGE_ENGINE_COLLECT_PAYMENT"],
        ),
        entry(
            "engine.max_extraction_retries",
            config
                .engine
                .max_extraction_retries
                .map(|limit| limit.to_string())
                .unwrap_or_else(|| "<unlimited>".to_string()),
            &["CONCIERGE_ENGINE_MAX_EXTRACTION_RETRIES"],
        ),
        entry(
            "engine.llm_timeout_secs",
            config.engine.llm_timeout_secs.to_string(),
            &["CONCIERGE_ENGINE_LLM_TIMEOUT_SECS"],
        ),
        entry(
            "engine.upstream_timeout_secs",
            config.engine.upstream_timeout_secs.to_string(),
            &["CONCIERGE_ENGINE_UPSTREAM_TIMEOUT_SECS"],
        ),
        entry(
            "server.bind_address",
            config.server.bind_address.clone(),
            &["CONCIERGE_SERVER_BIND_ADDRESS"],
        ),
        entry("server.port", config.server.port.to_string(), &["CONCIERGE_SERVER_PORT"]),
        entry(
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            &["CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        ),
        entry(
            "logging.level",
            config.logging.level.clone(),
            &["CONCIERGE_LOGGING_LEVEL", "CONCIERGE_LOG_LEVEL"],
        ),
        entry(
            "logging.format",
            format!("{:?}", config.logging.format).to_lowercase(),
            &["CONCIERGE_LOGGING_FORMAT", "CONCIERGE_LOG_FORMAT"],
        ),
    ]
}

fn entry(key: &'static str, value: String, env_keys: &'static [&'static str]) -> ConfigEntry {
    ConfigEntry { key, value, env_keys }
}

fn detect_config_path(explicit_path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path);
    }

    [PathBuf::from("concierge.toml"), PathBuf::from("config/concierge.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn optional(value: Option<&str>) -> String {
    value.unwrap_or("<unset>").to_string()
}

fn redact_secret(secret: Option<&str>) -> String {
    match secret.map(str::trim) {
        None => "<unset>".to_string(),
        Some("") => "<empty>".to_string(),
        Some(_) => "<redacted>".to_string(),
    }
}
