//! Engine configuration: defaults, then an optional JSON file, then `PARLA_*`
//! environment variables.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context};
use parla_media::{CaptureConfig, PlaybackConfig, VadConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// `ws://` or `wss://` URL of the agent peer.
    pub endpoint: String,
    pub connect_timeout_ms: u64,
    pub register_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub interrupt_timeout_ms: u64,
    /// Longest allowed gap between peer heartbeats.
    pub keepalive_window_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub platform: String,
    pub require_tts: bool,
    pub enable_retrieval: bool,
    pub capture: CaptureConfig,
    pub vad: VadConfig,
    pub playback: PlaybackConfig,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8765/agent".to_string(),
            connect_timeout_ms: 10_000,
            register_timeout_ms: 30_000,
            request_timeout_ms: 120_000,
            interrupt_timeout_ms: 15_000,
            keepalive_window_ms: 90_000,
            reconnect_attempts: 5,
            reconnect_delay_ms: 2_000,
            platform: "DESKTOP".to_string(),
            require_tts: true,
            enable_retrieval: false,
            capture: CaptureConfig::default(),
            vad: VadConfig::default(),
            playback: PlaybackConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::default().apply_env()
    }

    pub fn apply_env(self) -> anyhow::Result<Self> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Overlay `PARLA_*` variables provided by `lookup`.
    pub fn apply_env_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        if let Some(endpoint) = lookup("PARLA_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(platform) = lookup("PARLA_PLATFORM") {
            self.platform = platform;
        }
        if let Some(filter) = lookup("PARLA_LOG") {
            self.log_filter = filter;
        }
        parse_env(&lookup, "PARLA_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms)?;
        parse_env(&lookup, "PARLA_REGISTER_TIMEOUT_MS", &mut self.register_timeout_ms)?;
        parse_env(&lookup, "PARLA_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms)?;
        parse_env(&lookup, "PARLA_INTERRUPT_TIMEOUT_MS", &mut self.interrupt_timeout_ms)?;
        parse_env(&lookup, "PARLA_KEEPALIVE_MS", &mut self.keepalive_window_ms)?;
        parse_env(&lookup, "PARLA_RECONNECT_ATTEMPTS", &mut self.reconnect_attempts)?;
        parse_env(&lookup, "PARLA_RECONNECT_DELAY_MS", &mut self.reconnect_delay_ms)?;
        parse_env(&lookup, "PARLA_REQUIRE_TTS", &mut self.require_tts)?;
        parse_env(&lookup, "PARLA_ENABLE_RETRIEVAL", &mut self.enable_retrieval)?;
        parse_env(&lookup, "PARLA_CAPTURE_SAMPLE_RATE", &mut self.capture.sample_rate)?;
        parse_env(&lookup, "PARLA_PLAYBACK_SAMPLE_RATE", &mut self.playback.sample_rate)?;
        Ok(self)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.endpoint)
            .with_context(|| format!("invalid endpoint {}", self.endpoint))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(anyhow!("endpoint must be ws:// or wss://, got {}", self.endpoint));
        }
        for (name, value) in [
            ("connectTimeoutMs", self.connect_timeout_ms),
            ("registerTimeoutMs", self.register_timeout_ms),
            ("requestTimeoutMs", self.request_timeout_ms),
            ("interruptTimeoutMs", self.interrupt_timeout_ms),
            ("keepaliveWindowMs", self.keepalive_window_ms),
        ] {
            if value == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        self.capture.validate().context("capture")?;
        self.vad.validate().context("vad")?;
        self.playback.validate().context("playback")?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    pub fn keepalive_window(&self) -> Duration {
        Duration::from_millis(self.keepalive_window_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

fn parse_env<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
) -> anyhow::Result<()>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return Ok(());
    };
    *slot = raw
        .trim()
        .parse()
        .map_err(|e| anyhow!("invalid {name}={raw:?}: {e}"))?;
    Ok(())
}
