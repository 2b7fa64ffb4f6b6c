use std::{fs, path::Path, time::Duration};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub type LineId = u32;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub timeout: u64,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LineBias {
    #[default]
    Floating,
    PullUp,
    PullDown,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl EdgeKind {
    /// Whether an observed transition should fire for this configured edge.
    pub fn matches(self, observed: EdgeKind) -> bool {
        match self {
            EdgeKind::None => false,
            EdgeKind::Rising => observed == EdgeKind::Rising,
            EdgeKind::Falling => observed == EdgeKind::Falling,
            EdgeKind::Both => matches!(observed, EdgeKind::Rising | EdgeKind::Falling),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LineConfig {
    pub name: String,
    pub chip: String,
    pub line: u32,
    #[serde(default)]
    pub bias: LineBias,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub lines: FxHashMap<LineId, LineConfig>,
    /// Open the device and start polling before serving requests.
    #[serde(default)]
    pub autostart: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default = "default_mailbox_timeout_ms")]
    pub mailbox_timeout_ms: u64,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
}

/// Tuning for a [`Controller`](crate::Controller) and the poller it spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub poll_interval: Duration,
    pub mailbox_capacity: usize,
    pub mailbox_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            mailbox_capacity: default_mailbox_capacity(),
            mailbox_timeout: Duration::from_millis(default_mailbox_timeout_ms()),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_mailbox_capacity() -> usize {
    8
}

fn default_mailbox_timeout_ms() -> u64 {
    1000
}

fn default_broadcast_capacity() -> usize {
    64
}

fn default_event_history_capacity() -> usize {
    32
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, AppError> {
        let config: AppConfig = serde_json::from_str(contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.poll_interval_ms == 0 {
            return Err(AppError::Config("poll_interval_ms must be positive".into()));
        }
        if self.mailbox_capacity == 0 {
            return Err(AppError::Config("mailbox_capacity must be positive".into()));
        }
        if self.broadcast_capacity == 0 {
            return Err(AppError::Config(
                "broadcast_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            mailbox_capacity: self.mailbox_capacity,
            mailbox_timeout: Duration::from_millis(self.mailbox_timeout_ms),
        }
    }
}
