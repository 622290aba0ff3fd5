//! Process supervision for interactive containers: PTY-backed processes,
//! descendant tracking, listening-port discovery and a notification stream.

pub mod bus;
pub mod config;
pub mod error;
pub mod notification;
pub mod open_file;
pub mod ports;
pub mod record;
pub mod registry;
pub mod scanner;
pub mod supervisor;
pub mod tracker;

pub use bus::{NotificationBus, SubscriptionId};
pub use config::{SpawnRequest, SupervisorConfig};
pub use error::{Result, SupervisorError};
pub use notification::{Notification, NotificationEvent};
pub use open_file::{OpenFileRequest, OpenRequestBody};
pub use ports::PortResolver;
pub use record::{ChildProcessRecord, ExitInfo, ProcessSnapshot, WaitOutcome};
pub use registry::SupervisorRegistry;
pub use scanner::{LinuxProcessTable, ProcessTable};
pub use supervisor::{parse_signal, ProcessSupervisor};
