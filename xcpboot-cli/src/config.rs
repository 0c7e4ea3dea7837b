//! Configuration file support for xcpboot.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (XCPBOOT_DEVICE, XCPBOOT_BAUD)
//! 3. Local config file (./xcpboot.toml)
//! 4. Global config file (~/.config/xcpboot/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "xcpboot.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Transport name (`xcp_rs232`, `xcp_can`, `xcp_usb`, `xcp_net`).
    pub transport: Option<String>,
    /// Serial device or CAN interface (e.g., "/dev/ttyUSB0" or "COM3").
    pub device: Option<String>,
    /// Serial or CAN baudrate.
    pub baudrate: Option<u32>,
    /// CAN channel index.
    pub channel: Option<u32>,
    /// Target host name or IP address for `xcp_net`.
    pub address: Option<String>,
    /// Target TCP port for `xcp_net`.
    pub port: Option<u16>,
}

/// Timeout overrides in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Generic command timeout.
    pub t1: Option<u64>,
    /// PROGRAM_START timeout.
    pub t3: Option<u64>,
    /// Erase timeout.
    pub t4: Option<u64>,
    /// Program timeout.
    pub t5: Option<u64>,
    /// Connect timeout.
    pub t6: Option<u64>,
    /// Busy wait timeout.
    pub t7: Option<u64>,
}

/// Security and session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// External seed/key program.
    pub seed_key: Option<PathBuf>,
    /// CONNECT mode byte.
    pub connect_mode: Option<u8>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Timeout overrides.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Session settings.
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "xcpboot").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; values set in `other` win.
    fn merge(&mut self, other: Self) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        let conn = other.connection;
        take(&mut self.connection.transport, conn.transport);
        take(&mut self.connection.device, conn.device);
        take(&mut self.connection.baudrate, conn.baudrate);
        take(&mut self.connection.channel, conn.channel);
        take(&mut self.connection.address, conn.address);
        take(&mut self.connection.port, conn.port);

        let t = other.timeouts;
        take(&mut self.timeouts.t1, t.t1);
        take(&mut self.timeouts.t3, t.t3);
        take(&mut self.timeouts.t4, t.t4);
        take(&mut self.timeouts.t5, t.t5);
        take(&mut self.timeouts.t6, t.t6);
        take(&mut self.timeouts.t7, t.t7);

        take(&mut self.session.seed_key, other.session.seed_key);
        take(&mut self.session.connect_mode, other.session.connect_mode);
    }
}
