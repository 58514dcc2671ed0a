use crate::llm::{assistant::PollPolicy, openai, DispatchSettings};
use anyhow::{Context, Result};
use std::{path::PathBuf, str::FromStr, time::Duration};

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub port: u16,
    pub openai: openai::OpenAiConfig,
    pub assistant_model: String,
    pub dispatch: DispatchSettings,
    /// How long an idle HTTP session is kept before it is signed out.
    pub session_idle: Duration,
}

impl Config {
    /// Reads settings from the process environment (after `.env` is loaded).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = get("OPENAI_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .context("OPENAI_API_KEY not set")?;

        let base_url =
            get("OPENAI_BASE_URL").unwrap_or_else(|| openai::DEFAULT_BASE_URL.to_string());

        // We use ~/.parley/parley.db unless told otherwise
        let db_path = match get("PARLEY_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => {
                let home_dir = get("HOME").unwrap_or_else(|| ".".into());
                PathBuf::from(home_dir).join(".parley").join("parley.db")
            }
        };

        let defaults = DispatchSettings::default();
        let poll_defaults = PollPolicy::default();

        let text_model = get("PARLEY_TEXT_MODEL").unwrap_or(defaults.text_model);
        let dispatch = DispatchSettings {
            vision_model: get("PARLEY_VISION_MODEL").unwrap_or(defaults.vision_model),
            max_tokens: parse_or(&get, "PARLEY_MAX_TOKENS", defaults.max_tokens)?,
            temperature: parse_or(&get, "PARLEY_TEMPERATURE", defaults.temperature)?,
            poll: PollPolicy {
                interval: Duration::from_millis(parse_or(
                    &get,
                    "PARLEY_POLL_INTERVAL_MS",
                    poll_defaults.interval.as_millis() as u64,
                )?),
                max_attempts: parse_or(
                    &get,
                    "PARLEY_POLL_MAX_ATTEMPTS",
                    poll_defaults.max_attempts,
                )?,
                max_wait: Duration::from_secs(parse_or(
                    &get,
                    "PARLEY_POLL_MAX_WAIT_SECS",
                    poll_defaults.max_wait.as_secs(),
                )?),
            },
            text_model: text_model.clone(),
        };

        Ok(Self {
            db_path,
            port: parse_or(&get, "PARLEY_PORT", 3000)?,
            openai: openai::OpenAiConfig { api_key, base_url },
            assistant_model: get("PARLEY_ASSISTANT_MODEL").unwrap_or(text_model),
            dispatch,
            session_idle: Duration::from_secs(parse_or(&get, "PARLEY_SESSION_IDLE_SECS", 1800)?),
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}={:?}: {}", key, raw, e)),
        None => Ok(default),
    }
}
