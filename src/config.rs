use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::frame_source::FrameSourceConfig;
use crate::reconciler::{BackoffPolicy, ReconcilerSettings};
use crate::transport::{PollSettings, PollTransport, Transport, WsSettings, WsTransport};

const DEFAULT_BACKEND: &str = "127.0.0.1:8000";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_STALENESS_MS: u64 = 10_000;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_CEILING_MS: u64 = 30_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_FRAME_RECONNECT_MS: u64 = 2_000;
const DEFAULT_FRAME_SNAPSHOT_MS: u64 = 500;

const PREDICTION_STREAM_PATH: &str = "/ws";
const PREDICTION_POLL_PATH: &str = "/predict";
const VIDEO_FEED_PATH: &str = "/video_feed";
const HISTORY_PATH: &str = "/history";

#[derive(Debug, Deserialize, Default)]
struct ClientConfigFile {
    backend: Option<String>,
    transport: Option<String>,
    staleness_window_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    backoff: Option<BackoffConfigFile>,
    frames: Option<FrameConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct BackoffConfigFile {
    base_ms: Option<u64>,
    ceiling_ms: Option<u64>,
    jitter: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct FrameConfigFile {
    reconnect_delay_ms: Option<u64>,
    snapshot_interval_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Poll,
}

impl TransportKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            "poll" | "http" => Ok(TransportKind::Poll),
            other => Err(anyhow!(
                "unknown transport '{}'; expected websocket or poll",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend `host:port`.
    pub backend: String,
    pub transport: TransportKind,
    pub staleness_window: Duration,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
    pub frames: FrameSettings,
}

#[derive(Debug, Clone)]
pub struct FrameSettings {
    pub reconnect_delay: Duration,
    pub snapshot_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            transport: TransportKind::WebSocket,
            staleness_window: Duration::from_millis(DEFAULT_STALENESS_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            backoff: BackoffPolicy {
                base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
                ceiling: Duration::from_millis(DEFAULT_BACKOFF_CEILING_MS),
                jitter: 0.0,
            },
            frames: FrameSettings {
                reconnect_delay: Duration::from_millis(DEFAULT_FRAME_RECONNECT_MS),
                snapshot_interval: Duration::from_millis(DEFAULT_FRAME_SNAPSHOT_MS),
            },
        }
    }
}

impl ClientConfig {
    /// File named by `SURVEIL_CONFIG` (JSON, or TOML by extension), then env, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SURVEIL_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Replace the backend address and re-validate.
    pub fn with_backend(mut self, backend: &str) -> Result<Self> {
        self.backend = backend.to_string();
        self.validate()?;
        Ok(self)
    }

    fn from_file(file: ClientConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let millis_or = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_millis).unwrap_or(default)
        };
        let transport = match file.transport.as_deref() {
            Some(kind) => TransportKind::parse(kind)?,
            None => defaults.transport,
        };
        let backoff_file = file.backoff.unwrap_or_default();
        let frames_file = file.frames.unwrap_or_default();
        Ok(Self {
            backend: file.backend.unwrap_or(defaults.backend),
            transport,
            staleness_window: millis_or(file.staleness_window_ms, defaults.staleness_window),
            connect_timeout: millis_or(file.connect_timeout_ms, defaults.connect_timeout),
            poll_interval: millis_or(file.poll_interval_ms, defaults.poll_interval),
            backoff: BackoffPolicy {
                base: millis_or(backoff_file.base_ms, defaults.backoff.base),
                ceiling: millis_or(backoff_file.ceiling_ms, defaults.backoff.ceiling),
                jitter: backoff_file.jitter.unwrap_or(defaults.backoff.jitter),
            },
            frames: FrameSettings {
                reconnect_delay: millis_or(
                    frames_file.reconnect_delay_ms,
                    defaults.frames.reconnect_delay,
                ),
                snapshot_interval: millis_or(
                    frames_file.snapshot_interval_ms,
                    defaults.frames.snapshot_interval,
                ),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(backend) = std::env::var("SURVEIL_BACKEND") {
            if !backend.trim().is_empty() {
                self.backend = backend;
            }
        }
        if let Ok(kind) = std::env::var("SURVEIL_TRANSPORT") {
            if !kind.trim().is_empty() {
                self.transport = TransportKind::parse(&kind)?;
            }
        }
        if let Ok(window) = std::env::var("SURVEIL_STALENESS_MS") {
            let millis: u64 = window.trim().parse().map_err(|_| {
                anyhow!("SURVEIL_STALENESS_MS must be an integer number of milliseconds")
            })?;
            self.staleness_window = Duration::from_millis(millis);
        }
        if let Ok(interval) = std::env::var("SURVEIL_POLL_INTERVAL_MS") {
            let millis: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("SURVEIL_POLL_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.poll_interval = Duration::from_millis(millis);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.backend = normalize_backend(&self.backend)?;

        if self.staleness_window.is_zero() {
            return Err(anyhow!("staleness window must be greater than zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("connect timeout must be greater than zero"));
        }
        if self.backoff.base.is_zero() {
            return Err(anyhow!("backoff base must be greater than zero"));
        }
        if self.backoff.base > self.backoff.ceiling {
            return Err(anyhow!(
                "backoff base ({}ms) exceeds ceiling ({}ms)",
                self.backoff.base.as_millis(),
                self.backoff.ceiling.as_millis()
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(anyhow!("backoff jitter must be within 0..=1"));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll interval must be greater than zero"));
        }
        Ok(())
    }

    pub fn prediction_stream_url(&self) -> String {
        format!("ws://{}{}", self.backend, PREDICTION_STREAM_PATH)
    }

    pub fn prediction_poll_url(&self) -> String {
        format!("http://{}{}", self.backend, PREDICTION_POLL_PATH)
    }

    pub fn video_feed_url(&self) -> String {
        format!("http://{}{}", self.backend, VIDEO_FEED_PATH)
    }

    pub fn history_url(&self) -> String {
        format!("http://{}{}", self.backend, HISTORY_PATH)
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            staleness_window: self.staleness_window,
            backoff: self.backoff.clone(),
        }
    }

    pub fn build_transport(&self) -> Box<dyn Transport> {
        match self.transport {
            TransportKind::WebSocket => Box::new(WsTransport::new(
                self.prediction_stream_url(),
                WsSettings {
                    connect_timeout: self.connect_timeout,
                    ..WsSettings::default()
                },
            )),
            TransportKind::Poll => Box::new(PollTransport::new(
                self.prediction_poll_url(),
                PollSettings {
                    interval: self.poll_interval,
                    request_timeout: self.connect_timeout,
                },
            )),
        }
    }

    pub fn frame_source_config(&self) -> FrameSourceConfig {
        FrameSourceConfig {
            url: self.video_feed_url(),
            reconnect_delay: self.frames.reconnect_delay,
            snapshot_interval: self.frames.snapshot_interval,
            read_timeout: self.connect_timeout,
        }
    }
}

/// Reduce `ws://host:port/...`, `http://host`, or `host` to `host:port`.
pub fn normalize_backend(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("backend address must not be empty"));
    }
    let after_scheme = match trimmed.split_once("://") {
        Some((_, rest)) => rest,
        None => trimmed,
    };
    let authority = after_scheme.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(anyhow!("backend address '{}' has no host", raw));
    }
    let url = Url::parse(&format!("http://{}", authority))
        .with_context(|| format!("invalid backend address '{}'", raw))?;
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| anyhow!("backend address '{}' has no host", raw))?;
    let port = url.port().unwrap_or(DEFAULT_PORT);
    Ok(format!("{}:{}", host, port))
}

fn read_config_file(path: &Path) -> Result<ClientConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
