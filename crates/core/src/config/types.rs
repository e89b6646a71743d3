use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::machine::MachineConfig;
use crate::pipeline::PipelineConfig;
use crate::scheduler::SchedulerConfig;
use crate::watcher::WatcherConfig;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub machine: MachineConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Directories watched for new packages.
    #[serde(default)]
    pub hot_folders: Vec<HotFolderConfig>,
    /// Media platforms packages can be published to.
    #[serde(default)]
    pub platforms: Vec<PlatformConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("hotfolder.db")
}

/// A watched hot folder and the hints attached to packages dropped in it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HotFolderConfig {
    /// Root directory, watched recursively.
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Platform to publish to. Falls back to `pipeline.default_platform`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

/// Generic HTTP media platform
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlatformConfig {
    /// Name referenced by hot folders and upload requests.
    pub name: String,
    /// Base URL (e.g., "https://media.example.com/api")
    pub url: String,
    /// Bearer token sent with every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Request timeout in seconds (default: 300, uploads can be large)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u32,
}

fn default_timeout() -> u32 {
    300
}
