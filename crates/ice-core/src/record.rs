use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A direct child of a supervised process as seen by the last scan tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildProcessRecord {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// JSON projection of a supervised process: `{pid, name, ports, cmd, args, children}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub name: String,
    pub ports: Vec<u16>,
    pub cmd: String,
    pub args: Vec<String>,
    pub children: BTreeMap<u32, ChildProcessRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub exit_code: u32,
    pub signal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum WaitOutcome {
    Exited(ExitInfo),
    Timeout { detail: &'static str },
}

impl WaitOutcome {
    pub const fn timeout() -> Self {
        WaitOutcome::Timeout { detail: "Timeout" }
    }

    pub fn exit_info(&self) -> Option<&ExitInfo> {
        match self {
            WaitOutcome::Exited(info) => Some(info),
            WaitOutcome::Timeout { .. } => None,
        }
    }
}
