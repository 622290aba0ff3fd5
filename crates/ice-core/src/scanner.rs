//! Reads process and socket state from the OS.
//!
//! The parsing functions are pure and operate on the text the kernel and the
//! `ps`/`ss` tools produce. [`ProcessTable`] is the seam the supervisor scans
//! through; [`LinuxProcessTable`] is the real implementation backed by `/proc`
//! and subprocesses.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::process::Command;

/// Kernel TCP state code for a listening socket.
pub const TCP_LISTEN_STATE: &str = "0A";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListeningSocket {
    pub inode: u64,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsEntry {
    pub pid: u32,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsListener {
    pub port: u16,
    pub pid: u32,
}

#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// Listening rows of the TCP tables visible from `pid`'s network namespace.
    async fn tcp_listeners(&self, pid: u32) -> io::Result<Vec<ListeningSocket>>;
    /// Socket inodes currently open as file descriptors of `pid`.
    async fn socket_inodes(&self, pid: u32) -> io::Result<HashSet<u64>>;
    /// Direct children of `pid`.
    async fn children(&self, pid: u32) -> io::Result<Vec<PsEntry>>;
    /// System-wide listening sockets with their owning pids.
    async fn system_listeners(&self) -> io::Result<Vec<SsListener>>;
}

pub struct LinuxProcessTable {
    proc_root: PathBuf,
}

impl Default for LinuxProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxProcessTable {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }

    fn pid_path(&self, pid: u32) -> PathBuf {
        self.proc_root.join(pid.to_string())
    }
}

#[async_trait]
impl ProcessTable for LinuxProcessTable {
    async fn tcp_listeners(&self, pid: u32) -> io::Result<Vec<ListeningSocket>> {
        let net = self.pid_path(pid).join("net");
        let tcp = tokio::fs::read_to_string(net.join("tcp")).await?;
        let mut listeners = parse_tcp_table(&tcp);
        // tcp6 is absent when IPv6 is disabled
        if let Ok(tcp6) = tokio::fs::read_to_string(net.join("tcp6")).await {
            listeners.extend(parse_tcp_table(&tcp6));
        }
        Ok(listeners)
    }

    async fn socket_inodes(&self, pid: u32) -> io::Result<HashSet<u64>> {
        let mut entries = tokio::fs::read_dir(self.pid_path(pid).join("fd")).await?;
        let mut inodes = HashSet::new();
        while let Some(entry) = entries.next_entry().await? {
            // descriptors can close between listing and readlink
            let Ok(target) = tokio::fs::read_link(entry.path()).await else {
                continue;
            };
            if let Some(inode) = parse_socket_inode(&target.to_string_lossy()) {
                inodes.insert(inode);
            }
        }
        Ok(inodes)
    }

    async fn children(&self, pid: u32) -> io::Result<Vec<PsEntry>> {
        // ps exits non-zero when nothing matches; only stdout matters
        let output = Command::new("ps")
            .arg(format!("--ppid={pid}"))
            .args(["-o", "pid,comm"])
            .output()
            .await?;
        Ok(parse_ps_table(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn system_listeners(&self) -> io::Result<Vec<SsListener>> {
        let output = Command::new("ss").arg("-plnt").output().await?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("ss exited with {}", output.status),
            ));
        }
        Ok(parse_ss_listeners(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parses a `/proc/<pid>/net/tcp{,6}` table, keeping only listening rows.
///
/// Columns are located by header name. The kernel prints `tx_queue:rx_queue`
/// and `tr:tm->when` as single data columns under two header words each, so
/// the second word of each pair is dropped before indexing.
pub fn parse_tcp_table(text: &str) -> Vec<ListeningSocket> {
    let mut lines = text.lines();
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let names: Vec<&str> = header
        .split_whitespace()
        .filter(|name| *name != "rx_queue" && *name != "tm->when")
        .collect();
    let column = |name: &str| names.iter().position(|value| *value == name);
    let (Some(local_col), Some(state_col), Some(inode_col)) =
        (column("local_address"), column("st"), column("inode"))
    else {
        return Vec::new();
    };

    let mut sockets = Vec::new();
    for line in lines {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.get(state_col) != Some(&TCP_LISTEN_STATE) {
            continue;
        }
        let Some((address, port)) = columns.get(local_col).and_then(|value| value.split_once(':'))
        else {
            continue;
        };
        let (Some(ip), Ok(port), Some(Ok(inode))) = (
            decode_hex_address(address),
            u16::from_str_radix(port, 16),
            columns.get(inode_col).map(|value| value.parse::<u64>()),
        ) else {
            continue;
        };
        sockets.push(ListeningSocket { inode, ip, port });
    }
    sockets
}

/// Decodes a kernel hex address, reading byte pairs (IPv4) or 16-bit groups
/// (IPv6) in reverse order: `0100007F` is `127.0.0.1`.
pub fn decode_hex_address(hex: &str) -> Option<String> {
    let (width, separator) = match hex.len() {
        8 => (2, "."),
        32 => (4, ":"),
        _ => return None,
    };
    let mut groups = Vec::with_capacity(hex.len() / width);
    for start in (0..hex.len()).step_by(width).rev() {
        let value = u16::from_str_radix(hex.get(start..start + width)?, 16).ok()?;
        groups.push(if width == 2 {
            value.to_string()
        } else {
            format!("{value:x}")
        });
    }
    Some(groups.join(separator))
}

/// Extracts the inode from an fd link target such as `socket:[12345]`.
pub fn parse_socket_inode(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Parses columnar `ps` output. The header row is discarded; the command
/// column is whatever follows the pid column's siblings and may contain spaces.
pub fn parse_ps_table(stdout: &str) -> Vec<PsEntry> {
    let mut lines = stdout.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let headers: Vec<&str> = header.split_whitespace().collect();
    let Some(pid_col) = headers.iter().position(|name| *name == "PID") else {
        return Vec::new();
    };
    let name_col = headers
        .iter()
        .position(|name| matches!(*name, "CMD" | "COMMAND"))
        .unwrap_or(headers.len().saturating_sub(1));

    lines
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            let pid = columns.get(pid_col)?.parse::<u32>().ok()?;
            let name = columns.get(name_col..).map(|rest| rest.join(" ")).unwrap_or_default();
            Some(PsEntry { pid, name })
        })
        .collect()
}

fn ss_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"LISTEN\s+\d+\s+\d+\s+\S+:(\d+)\s+.*users:").expect("valid ss pattern")
    })
}

fn ss_pid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"pid=(\d+)").expect("valid pid pattern"))
}

/// Parses `ss -plnt` output into one entry per (port, owning pid). A socket
/// shared by several processes yields several entries.
pub fn parse_ss_listeners(stdout: &str) -> Vec<SsListener> {
    let mut listeners = Vec::new();
    for line in stdout.lines().skip(1) {
        let Some(captures) = ss_line_pattern().captures(line) else {
            continue;
        };
        let Ok(port) = captures[1].parse::<u16>() else {
            continue;
        };
        for pid in ss_pid_pattern().captures_iter(line) {
            if let Ok(pid) = pid[1].parse::<u32>() {
                listeners.push(SsListener { port, pid });
            }
        }
    }
    listeners
}
