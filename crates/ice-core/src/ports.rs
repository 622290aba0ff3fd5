use crate::scanner::{ListeningSocket, ProcessTable, PsEntry};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Resolves the TCP ports a process (or its descendant tree) listens on.
///
/// Every failure along the way degrades to an empty result for that pid and is
/// only logged; a scan never errors out.
#[derive(Clone)]
pub struct PortResolver {
    table: Arc<dyn ProcessTable>,
}

impl PortResolver {
    pub fn new(table: Arc<dyn ProcessTable>) -> Self {
        Self { table }
    }

    /// Ports whose listening socket is an open fd of `pid` itself.
    pub async fn direct(&self, pid: u32) -> Vec<u16> {
        let listeners = match self.table.tcp_listeners(pid).await {
            Ok(value) => value,
            Err(err) => {
                debug!(event = "tcp_table_unreadable", pid, error = %err);
                return Vec::new();
            }
        };
        if listeners.is_empty() {
            return Vec::new();
        }
        let owned = match self.table.socket_inodes(pid).await {
            Ok(value) => value,
            Err(err) => {
                debug!(event = "fd_list_unreadable", pid, error = %err);
                return Vec::new();
            }
        };
        owned_ports(listeners, &owned)
    }

    /// Direct resolution first; when that finds nothing, ports owned by any
    /// process in `pid`'s descendant tree (root included) according to the
    /// system-wide listener inventory.
    pub async fn with_descendants(&self, pid: u32) -> Vec<u16> {
        let direct = self.direct(pid).await;
        if !direct.is_empty() {
            return direct;
        }
        let descendants = self.descendants(pid).await;
        if descendants.is_empty() {
            return Vec::new();
        }
        let mut tree: HashSet<u32> = descendants.iter().map(|entry| entry.pid).collect();
        tree.insert(pid);
        match self.table.system_listeners().await {
            Ok(listeners) => listeners
                .into_iter()
                .filter(|listener| tree.contains(&listener.pid))
                .map(|listener| listener.port)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            Err(err) => {
                debug!(event = "ss_failed", pid, error = %err);
                Vec::new()
            }
        }
    }

    pub async fn children(&self, pid: u32) -> Vec<PsEntry> {
        match self.table.children(pid).await {
            Ok(value) => value,
            Err(err) => {
                debug!(event = "ps_failed", pid, error = %err);
                Vec::new()
            }
        }
    }

    /// Full transitive closure of `pid`'s children, parents before their own
    /// children.
    pub async fn descendants(&self, pid: u32) -> Vec<PsEntry> {
        let mut found = Vec::new();
        let mut visited = HashSet::from([pid]);
        let mut pending = vec![pid];
        while let Some(current) = pending.pop() {
            for child in self.children(current).await {
                // pid reuse can briefly make the listing cyclic
                if visited.insert(child.pid) {
                    pending.push(child.pid);
                    found.push(child);
                }
            }
        }
        found
    }
}

/// Deduplicates listeners by `ip:port`, keeps those whose inode is in `owned`,
/// and returns their ports sorted and unique.
pub fn owned_ports(listeners: Vec<ListeningSocket>, owned: &HashSet<u64>) -> Vec<u16> {
    let mut endpoints: HashMap<(String, u16), u64> = HashMap::new();
    for socket in listeners {
        endpoints.insert((socket.ip, socket.port), socket.inode);
    }
    endpoints
        .into_iter()
        .filter(|(_, inode)| owned.contains(inode))
        .map(|((_, port), _)| port)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
