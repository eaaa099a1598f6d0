//! starqueue.toml configuration and task submission file parser.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{DeviceBindings, TaskParameters};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub store: StoreConfig,
    pub artifacts: Option<ArtifactsConfig>,
    #[serde(default)]
    pub queue: QueueSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/starqueue/tasks.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Directory the image files of completed tasks live in.
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// Start launching tasks as soon as the daemon is up.
    pub autostart: bool,
    /// Repair rows left `executing` by a previous crash before starting.
    pub recover: bool,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            autostart: true,
            recover: true,
        }
    }
}

impl QueueConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: QueueConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Configuration rooted at a single data directory.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        QueueConfig {
            store: StoreConfig {
                path: data_dir.join("tasks.redb"),
            },
            artifacts: Some(ArtifactsConfig {
                directory: data_dir.join("images"),
            }),
            queue: QueueSection::default(),
        }
    }
}

/// One task to submit, as written in a task file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSubmission {
    #[serde(default)]
    pub parameters: TaskParameters,
    #[serde(default)]
    pub devices: DeviceBindings,
}

/// A batch of tasks submitted together (`[[tasks]]` entries).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub tasks: Vec<TaskSubmission>,
}

impl TaskFile {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: TaskFile = toml::from_str(&content)?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskType;

    #[test]
    fn test_parse_empty() {
        let config: QueueConfig = toml::from_str("").unwrap();
        assert!(config.queue.autostart);
        assert!(config.queue.recover);
        assert!(config.artifacts.is_none());
    }

    #[test]
    fn test_parse_full() {
        let toml_str = r#"
[store]
path = "/tmp/tasks.redb"

[artifacts]
directory = "/tmp/images"

[queue]
autostart = false
"#;
        let config: QueueConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.store.path, PathBuf::from("/tmp/tasks.redb"));
        assert_eq!(
            config.artifacts.unwrap().directory,
            PathBuf::from("/tmp/images")
        );
        assert!(!config.queue.autostart);
        assert!(config.queue.recover);
    }

    #[test]
    fn test_data_dir_roundtrips_through_toml() {
        let config = QueueConfig::in_data_dir(Path::new("/srv/starqueue"));
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("/srv/starqueue/tasks.redb"));
        let parsed: QueueConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.store.path, config.store.path);
    }

    #[test]
    fn test_task_file() {
        let toml_str = r#"
[[tasks]]
parameters = { task_type = "sleep", exposure = { exposure_time = 3.0 } }
devices = { camera = "camera1" }

[[tasks]]
devices = { camera = "camera2", ccd = "ccd0" }
"#;
        let file: TaskFile = toml::from_str(toml_str).unwrap();
        assert_eq!(file.tasks.len(), 2);
        assert_eq!(file.tasks[0].parameters.task_type, TaskType::Sleep);
        assert_eq!(file.tasks[0].parameters.exposure.exposure_time, 3.0);
        assert_eq!(file.tasks[1].parameters.task_type, TaskType::Exposure);
        assert_eq!(file.tasks[1].devices.ccd.as_deref(), Some("ccd0"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("starqueue.toml");
        std::fs::write(&path, "[queue]\nrecover = false\n").unwrap();
        let config = QueueConfig::from_file(&path).unwrap();
        assert!(!config.queue.recover);
    }
}
