use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Body POSTed by the `ice-open` helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRequestBody {
    pub full_path: String,
    pub path: String,
}

/// Payload of an `OPEN_FILE_REQUEST` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenFileRequest {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    pub absolute_path: String,
    pub mime_type: Option<String>,
}

impl OpenFileRequest {
    pub fn resolve(workdir: &Path, body: &OpenRequestBody) -> Self {
        let name = Path::new(&body.path)
            .file_name()
            .map(|value| value.to_string_lossy().to_string())
            .unwrap_or_else(|| body.path.clone());
        let absolute = Path::new(&body.full_path);
        Self {
            name,
            path: relative_to(workdir, absolute).to_string_lossy().to_string(),
            is_directory: false,
            absolute_path: body.full_path.clone(),
            mime_type: mime_for_path(absolute).map(str::to_string),
        }
    }
}

fn relative_to(base: &Path, target: &Path) -> PathBuf {
    let base: Vec<Component> = base.components().collect();
    let target: Vec<Component> = target.components().collect();
    let shared = base
        .iter()
        .zip(target.iter())
        .take_while(|(left, right)| left == right)
        .count();
    let mut relative = PathBuf::new();
    for _ in shared..base.len() {
        relative.push("..");
    }
    for component in &target[shared..] {
        relative.push(component.as_os_str());
    }
    relative
}

/// Best guess from the extension; `None` when the extension is unknown or missing.
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    mime_guess::from_path(path).first_raw()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_path_and_mime() {
        let body = OpenRequestBody {
            full_path: "/work/app/src/main.py".to_string(),
            path: "src/main.py".to_string(),
        };
        let request = OpenFileRequest::resolve(Path::new("/work/app"), &body);
        assert_eq!(request.name, "main.py");
        assert_eq!(request.path, "src/main.py");
        assert_eq!(request.absolute_path, "/work/app/src/main.py");
        assert_eq!(request.mime_type.as_deref(), Some("text/x-python"));
        assert!(!request.is_directory);
    }

    #[test]
    fn files_outside_workdir_climb_up() {
        let body = OpenRequestBody {
            full_path: "/etc/hosts".to_string(),
            path: "/etc/hosts".to_string(),
        };
        let request = OpenFileRequest::resolve(Path::new("/work/app"), &body);
        assert_eq!(request.path, "../../etc/hosts");
        assert_eq!(request.mime_type, None);
    }

    #[test]
    fn mime_follows_extension_table() {
        assert_eq!(mime_for_path(Path::new("data.JSON")), Some("application/json"));
        assert!(mime_for_path(Path::new("web/app.ts")).is_some());
        assert_eq!(mime_for_path(Path::new("Makefile")), None);
        assert_eq!(mime_for_path(Path::new("archive.unknown-ext")), None);
    }
}
