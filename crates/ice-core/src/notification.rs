use crate::open_file::OpenFileRequest;
use crate::record::{ChildProcessRecord, ExitInfo, ProcessSnapshot};
use serde::Serialize;

/// Event published on supervisor and global buses. Serializes as
/// `{pid, ppid?, type, data}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ppid: Option<u32>,
    #[serde(flatten)]
    pub event: NotificationEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationEvent {
    ProcessStarted(ProcessSnapshot),
    ProcessExited(ExitInfo),
    PortsChanged(Vec<u16>),
    ChildProcessStarted(ChildProcessRecord),
    ChildProcessExited(ChildProcessRecord),
    OpenFileRequest(OpenFileRequest),
}

impl Notification {
    pub fn process_started(snapshot: ProcessSnapshot) -> Self {
        Self {
            pid: Some(snapshot.pid),
            ppid: None,
            event: NotificationEvent::ProcessStarted(snapshot),
        }
    }

    pub fn process_exited(pid: u32, exit: ExitInfo) -> Self {
        Self {
            pid: Some(pid),
            ppid: None,
            event: NotificationEvent::ProcessExited(exit),
        }
    }

    pub fn ports_changed(pid: u32, ports: Vec<u16>) -> Self {
        Self {
            pid: Some(pid),
            ppid: None,
            event: NotificationEvent::PortsChanged(ports),
        }
    }

    pub fn child_started(child: ChildProcessRecord) -> Self {
        Self {
            pid: Some(child.pid),
            ppid: Some(child.ppid),
            event: NotificationEvent::ChildProcessStarted(child),
        }
    }

    pub fn child_exited(child: ChildProcessRecord) -> Self {
        Self {
            pid: Some(child.pid),
            ppid: Some(child.ppid),
            event: NotificationEvent::ChildProcessExited(child),
        }
    }

    pub fn open_file(request: OpenFileRequest) -> Self {
        Self {
            pid: None,
            ppid: None,
            event: NotificationEvent::OpenFileRequest(request),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.event {
            NotificationEvent::ProcessStarted(_) => "PROCESS_STARTED",
            NotificationEvent::ProcessExited(_) => "PROCESS_EXITED",
            NotificationEvent::PortsChanged(_) => "PORTS_CHANGED",
            NotificationEvent::ChildProcessStarted(_) => "CHILD_PROCESS_STARTED",
            NotificationEvent::ChildProcessExited(_) => "CHILD_PROCESS_EXITED",
            NotificationEvent::OpenFileRequest(_) => "OPEN_FILE_REQUEST",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ports_changed_wire_shape() {
        let value =
            serde_json::to_value(Notification::ports_changed(12, vec![8080, 9090])).unwrap();
        assert_eq!(
            value,
            json!({"pid": 12, "type": "PORTS_CHANGED", "data": [8080, 9090]})
        );
    }

    #[test]
    fn child_events_carry_parent_pid() {
        let child = ChildProcessRecord {
            pid: 31,
            ppid: 30,
            name: "python3".to_string(),
            ports: vec![],
        };
        let value = serde_json::to_value(Notification::child_exited(child)).unwrap();
        assert_eq!(value["type"], json!("CHILD_PROCESS_EXITED"));
        assert_eq!(value["pid"], json!(31));
        assert_eq!(value["ppid"], json!(30));
        assert_eq!(value["data"]["name"], json!("python3"));
    }

    #[test]
    fn open_file_request_has_null_pid() {
        let notification = Notification::open_file(OpenFileRequest {
            name: "main.rs".to_string(),
            path: "src/main.rs".to_string(),
            is_directory: false,
            absolute_path: "/work/src/main.rs".to_string(),
            mime_type: Some("text/x-rust".to_string()),
        });
        assert_eq!(notification.kind(), "OPEN_FILE_REQUEST");
        let value = serde_json::to_value(&notification).unwrap();
        assert_eq!(value["pid"], serde_json::Value::Null);
        assert!(value.get("ppid").is_none());
        assert_eq!(value["data"]["absolutePath"], json!("/work/src/main.rs"));
        assert_eq!(value["data"]["isDirectory"], json!(false));
    }

    #[test]
    fn process_exited_payload() {
        let value = serde_json::to_value(Notification::process_exited(
            5,
            ExitInfo {
                exit_code: 1,
                signal: Some("Terminated".to_string()),
            },
        ))
        .unwrap();
        assert_eq!(
            value,
            json!({
                "pid": 5,
                "type": "PROCESS_EXITED",
                "data": {"exitCode": 1, "signal": "Terminated"}
            })
        );
    }
}
