use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(2000);
pub const DEFAULT_COMMAND: &str = "run";
pub const DEFAULT_TERM: &str = "xterm-color";
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 30;

/// Process-wide settings captured once at startup and handed to every
/// supervisor; nothing below reads the ambient environment afterwards.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub workdir: PathBuf,
    pub base_env: BTreeMap<String, String>,
    pub scan_interval: Duration,
}

impl SupervisorConfig {
    pub fn new(workdir: PathBuf, base_env: BTreeMap<String, String>) -> Self {
        Self {
            workdir,
            base_env,
            scan_interval: DEFAULT_SCAN_INTERVAL,
        }
    }

    pub fn capture() -> io::Result<Self> {
        let workdir = env::current_dir()?;
        // non-UTF-8 entries cannot be forwarded through the JSON surface anyway
        let mut base_env: BTreeMap<String, String> = env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
            .collect();
        base_env.insert("PWD".to_string(), workdir.to_string_lossy().to_string());
        Ok(Self::new(workdir, base_env))
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.scan_interval = interval;
        }
        self
    }
}

/// Body of a create request: `{cmd, args[], term?, cols?, rows?, cwd?, env?}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub term: Option<String>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl SpawnRequest {
    pub fn command(cmd: &str, args: &[&str]) -> Self {
        Self {
            cmd: Some(cmd.to_string()),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn cmd(&self) -> &str {
        self.cmd
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(DEFAULT_COMMAND)
    }

    pub fn term(&self) -> &str {
        self.term
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(DEFAULT_TERM)
    }

    pub fn cols(&self) -> u16 {
        self.cols.filter(|value| *value > 0).unwrap_or(DEFAULT_COLS)
    }

    pub fn rows(&self) -> u16 {
        self.rows.filter(|value| *value > 0).unwrap_or(DEFAULT_ROWS)
    }

    pub fn cwd(&self, config: &SupervisorConfig) -> PathBuf {
        self.cwd.clone().unwrap_or_else(|| config.workdir.clone())
    }

    /// Captured base env, then `TERM`, then the caller's overlay; caller keys win.
    pub fn environment(&self, config: &SupervisorConfig) -> BTreeMap<String, String> {
        let mut merged = config.base_env.clone();
        merged.insert("TERM".to_string(), self.term().to_string());
        for (key, value) in &self.env {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}
