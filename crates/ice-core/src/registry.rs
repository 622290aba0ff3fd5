use crate::bus::NotificationBus;
use crate::config::{SpawnRequest, SupervisorConfig};
use crate::error::{Result, SupervisorError};
use crate::notification::{Notification, NotificationEvent};
use crate::open_file::{OpenFileRequest, OpenRequestBody};
use crate::ports::PortResolver;
use crate::record::ProcessSnapshot;
use crate::scanner::ProcessTable;
use crate::supervisor::ProcessSupervisor;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, info};

struct RegistryInner {
    config: SupervisorConfig,
    resolver: PortResolver,
    processes: RwLock<HashMap<u32, ProcessSupervisor>>,
    notifications: NotificationBus<Notification>,
}

impl RegistryInner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<u32, ProcessSupervisor>> {
        self.processes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<u32, ProcessSupervisor>> {
        self.processes.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict(&self, pid: u32) {
        let removed = self.write().remove(&pid);
        if let Some(supervisor) = removed {
            supervisor.dispose();
            debug!(event = "process_evicted", pid);
        }
    }
}

/// Live supervisors keyed by pid, plus the global notification stream that
/// every supervisor relays into.
#[derive(Clone)]
pub struct SupervisorRegistry {
    inner: Arc<RegistryInner>,
}

impl SupervisorRegistry {
    pub fn new(config: SupervisorConfig, table: Arc<dyn ProcessTable>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                resolver: PortResolver::new(table),
                processes: RwLock::new(HashMap::new()),
                notifications: NotificationBus::new(),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Global stream: every supervisor's notifications plus open-file requests.
    pub fn notifications(&self) -> &NotificationBus<Notification> {
        &self.inner.notifications
    }

    /// Spawns a supervisor with output paused until a terminal attaches. The
    /// entry removes itself once its `PROCESS_EXITED` has been relayed.
    pub fn create(&self, request: &SpawnRequest) -> Result<ProcessSupervisor> {
        let relay: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let resolver = self.inner.resolver.clone();
        let supervisor = ProcessSupervisor::builder(request, &self.inner.config, resolver)
            .paused(true)
            .observer(move |notification| {
                let Some(registry) = relay.upgrade() else {
                    return;
                };
                registry.notifications.publish(notification);
                if let (NotificationEvent::ProcessExited(_), Some(pid)) =
                    (&notification.event, notification.pid)
                {
                    registry.evict(pid);
                }
            })
            .spawn()?;

        let pid = supervisor.pid();
        self.inner.write().insert(pid, supervisor.clone());
        // exit may have been relayed before the insert landed
        if supervisor.has_exited() {
            self.inner.evict(pid);
        }
        info!(event = "process_registered", pid);
        Ok(supervisor)
    }

    pub fn get(&self, pid: u32) -> Result<ProcessSupervisor> {
        self.inner
            .read()
            .get(&pid)
            .cloned()
            .ok_or(SupervisorError::NotFound(pid))
    }

    pub fn list(&self) -> BTreeMap<u32, ProcessSnapshot> {
        let supervisors: Vec<ProcessSupervisor> = self.inner.read().values().cloned().collect();
        supervisors
            .into_iter()
            .map(|supervisor| (supervisor.pid(), supervisor.snapshot()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves an editor open request against the working directory and
    /// publishes it on the global stream.
    pub fn open_file(&self, body: &OpenRequestBody) -> OpenFileRequest {
        let request = OpenFileRequest::resolve(&self.inner.config.workdir, body);
        info!(event = "open_file_request", path = %request.path);
        self.inner
            .notifications
            .publish(&Notification::open_file(request.clone()));
        request
    }

    /// Disposes every live supervisor; used on server shutdown.
    pub fn shutdown(&self) {
        let drained: Vec<ProcessSupervisor> =
            self.inner.write().drain().map(|(_, supervisor)| supervisor).collect();
        info!(event = "registry_shutdown", processes = drained.len());
        for supervisor in drained {
            supervisor.dispose();
        }
    }
}
