use crate::engine::EngineSettings;
use crate::session::SessionSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Passed to the engine as its own wall-clock budget.
    #[serde(default = "default_max_total_time_secs")]
    pub max_total_time_secs: u64,
    #[serde(default = "default_go_fuzz_upload_interval_secs")]
    pub go_fuzz_upload_interval_secs: u64,
}

pub fn default_poll_interval_secs() -> u64 {
    60
}
pub fn default_max_total_time_secs() -> u64 {
    3600
}
pub fn default_go_fuzz_upload_interval_secs() -> u64 {
    3600
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_total_time_secs: default_max_total_time_secs(),
            go_fuzz_upload_interval_secs: default_go_fuzz_upload_interval_secs(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EnginesConfig {
    #[serde(default = "default_java")]
    pub java: PathBuf,
    #[serde(default = "default_zest_jar")]
    pub zest_jar: PathBuf,
    #[serde(default = "default_go_fuzz")]
    pub go_fuzz: PathBuf,
}

fn default_java() -> PathBuf {
    PathBuf::from("java")
}
fn default_zest_jar() -> PathBuf {
    PathBuf::from("zest-cli.jar")
}
fn default_go_fuzz() -> PathBuf {
    PathBuf::from("./go-fuzz")
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            java: default_java(),
            zest_jar: default_zest_jar(),
            go_fuzz: default_go_fuzz(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_control_plane_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub api_key: Option<String>,
}

pub fn default_control_plane_root() -> PathBuf {
    PathBuf::from("./.warden/control")
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            root: default_control_plane_root(),
            api_key: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

pub fn default_storage_root() -> PathBuf {
    PathBuf::from("./.warden/storage")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct WardenConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub engines: EnginesConfig,
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl WardenConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: WardenConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            poll_interval: Duration::from_secs(self.session.poll_interval_secs),
            go_fuzz_upload_interval: Duration::from_secs(self.session.go_fuzz_upload_interval_secs),
            engine: EngineSettings {
                max_total_time: Duration::from_secs(self.session.max_total_time_secs),
                java: self.engines.java.clone(),
                zest_jar: self.engines.zest_jar.clone(),
                go_fuzz: self.engines.go_fuzz.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn empty_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        fs::write(&path, "").unwrap();

        let config = WardenConfig::load_from_file(&path).unwrap();
        let settings = config.session_settings();
        assert_eq!(settings.poll_interval, Duration::from_secs(60));
        assert_eq!(settings.engine.max_total_time, Duration::from_secs(3600));
        assert_eq!(config.control_plane.root, default_control_plane_root());
        assert!(config.control_plane.api_key.is_none());
    }

    #[test]
    fn kebab_case_keys_override_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        fs::write(
            &path,
            r#"
[session]
poll-interval-secs = 5
max-total-time-secs = 120

[engines]
zest-jar = "/opt/jqf/zest-cli.jar"

[control-plane]
root = "/srv/warden/db"
api-key = "k-123"

[storage]
root = "/srv/warden/blobs"
"#,
        )
        .unwrap();

        let config = WardenConfig::load_from_file(&path).unwrap();
        let settings = config.session_settings();
        assert_eq!(settings.poll_interval, Duration::from_secs(5));
        assert_eq!(settings.engine.max_total_time, Duration::from_secs(120));
        assert_eq!(settings.engine.zest_jar, PathBuf::from("/opt/jqf/zest-cli.jar"));
        assert_eq!(settings.engine.java, PathBuf::from("java"));
        assert_eq!(config.control_plane.api_key.as_deref(), Some("k-123"));
        assert_eq!(config.storage.root, PathBuf::from("/srv/warden/blobs"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        fs::write(&path, "[session]\npoll-every = 3\n").unwrap();
        let err = WardenConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse TOML"), "got: {err}");
    }

    #[test]
    fn missing_file_reports_path() {
        let err = WardenConfig::load_from_file(Path::new("/nonexistent/warden.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/warden.toml"));
    }
}
