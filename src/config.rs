//! Loads the node settings from the YAML config file.
//!
//! The settings cover the server binding and the cache groups with their engine
//! tuning; they are read once at startup and turned into a typed [Settings]
//! value - command line flags of the binaries override the file where they
//! overlap. A missing file simply yields the defaults, so a bare node starts up
//! without any preparation. Changing group or engine settings requires a
//! restart.
//!
//! ```yaml
//! server:
//!     host: 0.0.0.0
//!     port: 8001
//!
//! groups:
//!     users:
//!         engine: arc
//!         capacity: 4096
//!     sessions:
//!         engine: sharded-avg-lfu
//!         capacity: 65536
//!         shards: 8
//! ```
use anyhow::Context;
use yaml_rust::{Yaml, YamlLoader};

use crate::cache::EngineSettings;

/// Where the binaries look for their settings.
pub const DEFAULT_CONFIG_PATH: &str = "config/settings.yml";

/// The engine selection of one configured cache group.
pub struct GroupSettings {
    /// The group name.
    pub name: String,
    /// The engine kind and its tuning knobs.
    pub engine: EngineSettings,
}

/// The typed settings of a node.
pub struct Settings {
    /// The host the RPC server binds to.
    pub host: String,
    /// The port the RPC server listens on.
    pub port: u16,
    /// The configured cache groups, in file order.
    pub groups: Vec<GroupSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            host: "0.0.0.0".to_owned(),
            port: 8001,
            groups: Vec::new(),
        }
    }
}

impl Settings {
    /// Parses settings from the given YAML text.
    ///
    /// Absent values fall back to their defaults; only unparseable YAML is an
    /// error (a node silently running on wrong settings is worse than one which
    /// refuses to start).
    ///
    /// # Example
    /// ```
    /// # use nimbus::config::Settings;
    /// let settings = Settings::from_yaml("
    /// server:
    ///     port: 1844
    /// ").unwrap();
    ///
    /// assert_eq!(settings.port, 1844);
    /// assert_eq!(settings.host, "0.0.0.0");
    /// ```
    pub fn from_yaml(text: &str) -> anyhow::Result<Settings> {
        let documents =
            YamlLoader::load_from_str(text).context("Cannot parse the config file as YAML")?;
        let root = documents.into_iter().next().unwrap_or(Yaml::Null);
        let defaults = Settings::default();

        let host = root["server"]["host"]
            .as_str()
            .unwrap_or(&defaults.host)
            .to_owned();
        let port = root["server"]["port"]
            .as_i64()
            .filter(|port| *port > 0 && *port <= u16::MAX as i64)
            .map(|port| port as u16)
            .unwrap_or(defaults.port);

        let mut groups = Vec::new();
        if let Some(section) = root["groups"].as_hash() {
            for (name, config) in section {
                match name.as_str() {
                    Some(name) => groups.push(GroupSettings {
                        name: name.to_owned(),
                        engine: EngineSettings::parse(config),
                    }),
                    None => log::warn!("Skipping a group whose name is not a string."),
                }
            }
        }

        Ok(Settings { host, port, groups })
    }

    /// Reads the settings from the given file.
    ///
    /// A missing file (or an unmounted docker volume, which presents itself as a
    /// directory) yields the defaults.
    pub async fn load(path: &str) -> anyhow::Result<Settings> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => (),
            _ => {
                log::info!("No config file at {} - using the default settings.", path);
                return Ok(Settings::default());
            }
        }

        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Cannot read the config file {}", path))?;
        Settings::from_yaml(&text).with_context(|| format!("Cannot load the config file {}", path))
    }

    /// Renders the `host:port` address the server binds to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
