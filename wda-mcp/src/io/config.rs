//! Server configuration loaded from an optional TOML file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Server configuration (TOML).
///
/// Every field has a default so an empty or missing file yields a working setup
/// for a stock WebDriverAgent checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Program used for both the version query and the build.
    pub xcodebuild: String,
    pub scheme: String,
    /// Project descriptor searched for and passed to `-project`.
    pub project_file: String,
    /// `-derivedDataPath`, relative to the project directory.
    pub derived_data_dir: String,
    pub destination: String,

    /// Root searched for `project_file` when no project path is given.
    /// Defaults to `~/.appium`.
    pub project_search_root: Option<PathBuf>,

    /// Fixed provisioning profile directory. Skips Xcode version detection.
    pub profiles_dir: Option<PathBuf>,

    pub version_timeout_secs: u64,
    pub build_timeout_secs: u64,

    /// Bytes of child output kept per stream.
    pub output_limit_bytes: usize,

    pub signer: SignerConfig,
}

/// Signing engine invocation and its pass-through flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SignerConfig {
    /// Program and leading arguments (e.g. `["npx","applesign"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub with_get_task_allow: bool,
    pub without_plugins: bool,
    pub without_watchapp: bool,
    pub without_xctests: bool,
    pub clone_entitlements: bool,
    pub verify: bool,
    pub parallel: bool,
    /// Signing identity hash; the engine picks one from the profile when unset.
    pub identity: Option<String>,
    pub keychain: Option<PathBuf>,
    /// Appended verbatim before the input archive.
    pub extra_args: Vec<String>,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            command: vec!["applesign".to_string()],
            timeout_secs: 10 * 60,
            with_get_task_allow: true,
            without_plugins: true,
            without_watchapp: false,
            without_xctests: false,
            clone_entitlements: false,
            verify: false,
            parallel: false,
            identity: None,
            keychain: None,
            extra_args: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            xcodebuild: "xcodebuild".to_string(),
            scheme: "WebDriverAgentRunner".to_string(),
            project_file: "WebDriverAgent.xcodeproj".to_string(),
            derived_data_dir: "appium_wda_ios".to_string(),
            destination: "generic/platform=iOS".to_string(),
            project_search_root: None,
            profiles_dir: None,
            version_timeout_secs: 30,
            build_timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
            signer: SignerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("xcodebuild", &self.xcodebuild),
            ("scheme", &self.scheme),
            ("project_file", &self.project_file),
            ("derived_data_dir", &self.derived_data_dir),
            ("destination", &self.destination),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{name} must not be empty"));
            }
        }
        if self.version_timeout_secs == 0 {
            return Err(anyhow!("version_timeout_secs must be > 0"));
        }
        if self.build_timeout_secs == 0 {
            return Err(anyhow!("build_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.signer.timeout_secs == 0 {
            return Err(anyhow!("signer.timeout_secs must be > 0"));
        }
        if self.signer.command.is_empty() || self.signer.command[0].trim().is_empty() {
            return Err(anyhow!("signer.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn version_timeout(&self) -> Duration {
        Duration::from_secs(self.version_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn sign_timeout(&self) -> Duration {
        Duration::from_secs(self.signer.timeout_secs)
    }

    /// Search root for the project, falling back to `~/.appium`.
    pub fn resolved_search_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.project_search_root {
            return Ok(root.clone());
        }
        let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
        Ok(home.join(".appium"))
    }
}

/// Load config from a TOML file, or defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
    let Some(path) = path else {
        let cfg = ServerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    };
    debug!(path = %path.display(), "loading config");
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ServerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_path_returns_default() {
        let cfg = load_config(None).expect("load");
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn missing_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_config(Some(&temp.path().join("missing.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("missing.toml"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "scheme = \"Custom\"\nprofiles_dir = \"/tmp/profiles\"\n\n[signer]\ncommand = [\"npx\", \"applesign\"]\nverify = true\n",
        )
        .expect("write");

        let cfg = load_config(Some(&path)).expect("load");
        assert_eq!(cfg.scheme, "Custom");
        assert_eq!(cfg.profiles_dir, Some(PathBuf::from("/tmp/profiles")));
        assert_eq!(cfg.signer.command, vec!["npx", "applesign"]);
        assert!(cfg.signer.verify);
        assert!(cfg.signer.without_plugins);
        assert_eq!(cfg.derived_data_dir, "appium_wda_ios");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "build_timeout_secs = 0\n").expect("write");
        let err = load_config(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("build_timeout_secs must be > 0"));
    }

    #[test]
    fn empty_signer_command_is_rejected() {
        let cfg = ServerConfig {
            signer: SignerConfig {
                command: Vec::new(),
                ..SignerConfig::default()
            },
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn explicit_search_root_is_used() {
        let cfg = ServerConfig {
            project_search_root: Some(PathBuf::from("/opt/wda")),
            ..ServerConfig::default()
        };
        assert_eq!(
            cfg.resolved_search_root().expect("root"),
            PathBuf::from("/opt/wda")
        );
    }
}
