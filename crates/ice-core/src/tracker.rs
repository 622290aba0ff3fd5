use crate::notification::Notification;
use crate::ports::PortResolver;
use crate::record::ChildProcessRecord;
use std::collections::{BTreeMap, HashSet};
use tracing::info;

/// Mutable per-process state rebuilt by every scan tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedState {
    pub ports: Vec<u16>,
    pub children: BTreeMap<u32, ChildProcessRecord>,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub state: TrackedState,
    pub events: Vec<Notification>,
}

/// One scan tick for the process `pid`: diff the fresh OS view against
/// `previous` and collect the notifications to publish, in order: port change,
/// child starts, child exits. Child port sets are refreshed without an event.
pub async fn scan_tick(resolver: &PortResolver, pid: u32, previous: &TrackedState) -> ScanOutcome {
    let mut state = previous.clone();
    let mut events = Vec::new();

    let ports = resolver.direct(pid).await;
    if ports != previous.ports {
        info!(event = "ports_changed", pid, ports = ?ports);
        events.push(Notification::ports_changed(pid, ports.clone()));
    }
    state.ports = ports;

    let listing = resolver.children(pid).await;
    let present: HashSet<u32> = listing.iter().map(|entry| entry.pid).collect();
    for entry in listing {
        if state.children.contains_key(&entry.pid) {
            continue;
        }
        let child = ChildProcessRecord {
            pid: entry.pid,
            ppid: pid,
            name: entry.name,
            ports: Vec::new(),
        };
        info!(event = "child_started", pid, child = child.pid, name = %child.name);
        events.push(Notification::child_started(child.clone()));
        state.children.insert(child.pid, child);
    }

    let gone: Vec<u32> = state
        .children
        .keys()
        .filter(|child| !present.contains(child))
        .copied()
        .collect();
    for child_pid in gone {
        if let Some(child) = state.children.remove(&child_pid) {
            info!(event = "child_exited", pid, child = child.pid, name = %child.name);
            events.push(Notification::child_exited(child));
        }
    }

    for child in state.children.values_mut() {
        child.ports = resolver.with_descendants(child.pid).await;
    }

    ScanOutcome { state, events }
}
