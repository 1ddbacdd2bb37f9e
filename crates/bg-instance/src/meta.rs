use std::{collections::BTreeMap, fmt, path::PathBuf};

use chrono::{DateTime, Utc};

use crate::InstanceId;

/// `name -> instanceId` of the run currently considered active for a name.
pub type ActiveMap = BTreeMap<String, InstanceId>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Headless,
    Window,
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchMode::Headless => f.pad("headless"),
            LaunchMode::Window => f.pad("window"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    Stopped,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Running => f.pad("RUNNING"),
            InstanceState::Stopped => f.pad("STOPPED"),
        }
    }
}

/// Metadata record persisted as `meta.json` in the instance directory.
///
/// At most one of `pid` (headless supervisor) and `window_pid` (windowed
/// run script) is set. A windowed instance whose PID handshake timed out
/// carries neither.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMeta {
    pub instance_id: InstanceId,
    pub name: String,
    pub command: String,
    pub cwd: PathBuf,
    pub started_at: DateTime<Utc>,
    pub log_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_pid: Option<u32>,
}

impl InstanceMeta {
    /// The pid to probe or signal, preferring the headless supervisor.
    pub fn tracked_pid(&self) -> Option<u32> {
        self.pid.or(self.window_pid)
    }

    pub fn mode(&self) -> LaunchMode {
        if self.pid.is_some() {
            LaunchMode::Headless
        } else {
            LaunchMode::Window
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InstanceMeta {
        InstanceMeta {
            instance_id: InstanceId("api_20240307_090503".to_string()),
            name: "api".to_string(),
            command: "python -m http.server 8080".to_string(),
            cwd: PathBuf::from("/srv/api"),
            started_at: DateTime::parse_from_rfc3339("2024-03-07T09:05:03.120Z")
                .unwrap()
                .with_timezone(&Utc),
            log_file: PathBuf::from("/home/u/.bg-manager/instances/api_20240307_090503/log.txt"),
            pid: None,
            window_pid: None,
        }
    }

    #[test]
    fn headless_meta_uses_camel_case_and_omits_window_pid() {
        let meta = InstanceMeta {
            pid: Some(4242),
            ..sample()
        };
        let v = serde_json::to_value(&meta).unwrap();
        assert_eq!(v["instanceId"], "api_20240307_090503");
        assert_eq!(v["pid"], 4242);
        assert!(v.get("windowPid").is_none());
        assert_eq!(meta.mode(), LaunchMode::Headless);
        assert_eq!(meta.tracked_pid(), Some(4242));
    }

    #[test]
    fn windowed_meta_without_pid_is_window_mode() {
        let meta = sample();
        let raw = serde_json::to_string(&meta).unwrap();
        assert!(!raw.contains("pid"));
        let back: InstanceMeta = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.mode(), LaunchMode::Window);
        assert_eq!(back.tracked_pid(), None);
    }

    #[test]
    fn reads_record_written_by_older_tool() {
        let raw = r#"{
  "windowPid": 991,
  "command": "npm run dev",
  "cwd": "/work",
  "startedAt": "2024-03-07T09:05:03.120Z",
  "logFile": "/tmp/log.txt",
  "name": "dev",
  "instanceId": "dev_20240307_090503"
}"#;
        let meta: InstanceMeta = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.window_pid, Some(991));
        assert_eq!(meta.mode(), LaunchMode::Window);
    }
}
