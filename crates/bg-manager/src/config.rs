use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

pub const DEFAULT_KEEP: usize = 10;
pub const DEFAULT_TAIL_LINES: usize = 50;

const HOME_DIR_NAME: &str = ".bg-manager";
const DEFAULT_PID_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_PID_POLL_ATTEMPTS: u32 = 30;
const DEFAULT_FOLLOW_INTERVAL_MS: u64 = 500;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u32>().ok())
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Bounds for the windowed-mode PID handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeConfig {
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_PID_POLL_INTERVAL_MS),
            attempts: DEFAULT_PID_POLL_ATTEMPTS,
        }
    }
}

impl HandshakeConfig {
    fn from_env() -> Self {
        let interval_ms = env_u64("BG_PID_POLL_INTERVAL_MS")
            .map(|v| v.clamp(10, 5000))
            .unwrap_or(DEFAULT_PID_POLL_INTERVAL_MS);
        let attempts = env_u32("BG_PID_POLL_ATTEMPTS")
            .map(|v| v.clamp(1, 600))
            .unwrap_or(DEFAULT_PID_POLL_ATTEMPTS);
        Self {
            interval: Duration::from_millis(interval_ms),
            attempts,
        }
    }

    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.attempts)
    }
}

/// Per-invocation settings. Resolved once in `main` and passed down; nothing
/// below reads the environment on its own.
#[derive(Debug, Clone)]
pub struct Settings {
    pub home: PathBuf,
    pub handshake: HandshakeConfig,
    pub follow_interval: Duration,
    pub terminal: Option<String>,
}

impl Settings {
    pub fn from_env(home_override: Option<PathBuf>) -> anyhow::Result<Self> {
        let home = match home_override {
            Some(p) => absolutize(&p),
            None => default_home()?,
        };
        let follow_ms = env_u64("BG_FOLLOW_INTERVAL_MS")
            .map(|v| v.clamp(50, 10_000))
            .unwrap_or(DEFAULT_FOLLOW_INTERVAL_MS);

        Ok(Self {
            home,
            handshake: HandshakeConfig::from_env(),
            follow_interval: Duration::from_millis(follow_ms),
            terminal: env_nonempty("BG_TERMINAL"),
        })
    }
}

fn default_home() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine the user home directory")?;
    Ok(home.join(HOME_DIR_NAME))
}

pub(crate) fn absolutize(p: &Path) -> PathBuf {
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}
