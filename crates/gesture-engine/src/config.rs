use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use gesture_contracts::generation::DEFAULT_TOTAL_STEPS;
use reqwest::Url;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const GENERATE_STREAM_PATH: &str = "api/generate-stream";
const CONNECT_TIMEOUT_MS_DEFAULT: u64 = 10_000;
const READ_TICK_MS_DEFAULT: u64 = 250;
const READ_TICK_MS_MIN: u64 = 10;
const READ_TICK_MS_MAX: u64 = 5_000;
const TOTAL_STEPS_MAX: u64 = 1_000;
const IDLE_TIMEOUT_MS_MIN: u64 = 100;
const IDLE_TIMEOUT_MS_MAX: u64 = 600_000;

/// Settings for the generation stream client.
///
/// Resolved from defaults, then `GESTURE_GEN_*` environment variables; the
/// CLI applies its flags on top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub default_total_steps: u64,
    /// `None` waits on a silent stream forever.
    pub idle_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Longest single blocking wait on the socket, for response headers or
    /// for the next body bytes. Bounds how long closing a stream can take.
    pub read_tick: Duration,
    pub prompts_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            default_total_steps: DEFAULT_TOTAL_STEPS,
            idle_timeout: None,
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS_DEFAULT),
            read_tick: Duration::from_millis(READ_TICK_MS_DEFAULT),
            prompts_path: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };
        let defaults = Self::default();
        Self {
            base_url: value("GESTURE_GEN_BASE_URL").unwrap_or(defaults.base_url),
            default_total_steps: value("GESTURE_GEN_TOTAL_STEPS")
                .and_then(|raw| raw.parse::<u64>().ok())
                .map(clamp_total_steps)
                .unwrap_or(defaults.default_total_steps),
            idle_timeout: value("GESTURE_GEN_IDLE_TIMEOUT_MS")
                .and_then(|raw| raw.parse::<u64>().ok())
                .and_then(idle_timeout_from_millis),
            connect_timeout: value("GESTURE_GEN_CONNECT_TIMEOUT_MS")
                .and_then(|raw| raw.parse::<u64>().ok())
                .map(|ms| Duration::from_millis(ms.clamp(100, 120_000)))
                .unwrap_or(defaults.connect_timeout),
            read_tick: value("GESTURE_GEN_READ_TICK_MS")
                .and_then(|raw| raw.parse::<u64>().ok())
                .map(|ms| Duration::from_millis(ms.clamp(READ_TICK_MS_MIN, READ_TICK_MS_MAX)))
                .unwrap_or(defaults.read_tick),
            prompts_path: value("GESTURE_GEN_PROMPTS").map(PathBuf::from),
        }
    }

    /// `<base-url>/api/generate-stream?prompt=<url-encoded prompt>`.
    pub fn stream_url(&self, prompt: &str) -> Result<Url> {
        let mut url = Url::parse(self.base_url.trim())
            .with_context(|| format!("invalid generation base url '{}'", self.base_url))?;
        if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
            bail!(
                "generation base url must be http(s): '{}'",
                self.base_url
            );
        }
        let base_path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base_path}/{GENERATE_STREAM_PATH}"));
        url.query_pairs_mut().clear().append_pair("prompt", prompt);
        Ok(url)
    }
}

pub fn clamp_total_steps(value: u64) -> u64 {
    value.clamp(1, TOTAL_STEPS_MAX)
}

/// Zero disables the idle timeout; other values are clamped.
pub fn idle_timeout_from_millis(ms: u64) -> Option<Duration> {
    if ms == 0 {
        return None;
    }
    Some(Duration::from_millis(
        ms.clamp(IDLE_TIMEOUT_MS_MIN, IDLE_TIMEOUT_MS_MAX),
    ))
}
