use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::db::models::Direction;
use crate::projection::FillerConfig;

#[derive(Parser, Debug)]
#[command(name = "feedsync", about = "Offline-first client for a social feed")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path to data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Backend base URL
    #[arg(long)]
    pub base_url: Option<String>,

    /// Bearer token sent with every request
    #[arg(long)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Replace the cache with the latest page
    Refresh,
    /// Replace the cache with every post on the server
    SyncAll,
    /// Load the next page in one direction
    More {
        #[arg(value_enum)]
        direction: MoreDirection,
    },
    /// Print the cached feed
    Show,
    Like { id: i64 },
    Unlike { id: i64 },
    Delete { id: i64 },
    /// Publish a new post
    Post {
        text: String,
        /// File to attach
        #[arg(long)]
        attach: Option<PathBuf>,
    },
    /// Change the text of a post
    Edit { id: i64, text: String },
    /// Poll for newer posts until interrupted
    Watch,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoreDirection {
    Older,
    Newer,
}

impl From<MoreDirection> for Direction {
    fn from(direction: MoreDirection) -> Self {
        match direction {
            MoreDirection::Older => Direction::Before,
            MoreDirection::Newer => Direction::After,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub database: DatabaseConfig,
    pub feed: FeedConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FeedConfig {
    pub page_size: usize,
    pub poll_interval_secs: u64,
    pub filler_stride: usize,
    pub filler_payload: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9999/api/slow/".to_string(),
            auth_token: None,
            timeout_secs: 30,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: 25,
            poll_interval_secs: 15,
            filler_stride: 5,
            filler_payload: "promo.jpg".to_string(),
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl FeedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn filler(&self) -> FillerConfig {
        FillerConfig {
            stride: self.filler_stride,
            payload_ref: self.filler_payload.clone(),
        }
    }
}

impl Config {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let data_dir = Self::data_dir(cli)?;
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| data_dir.join("config.toml"));

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };

        // CLI overrides
        if let Some(ref base_url) = cli.base_url {
            config.remote.base_url = base_url.clone();
        }
        if let Some(ref token) = cli.token {
            config.remote.auth_token = Some(token.clone());
        }

        if config.database.path.is_none() {
            config.database.path = Some(data_dir.join("feed.db"));
        }

        Ok(config)
    }

    pub fn data_dir(cli: &Cli) -> anyhow::Result<PathBuf> {
        match cli.data_dir.clone() {
            Some(dir) => Ok(dir),
            None => dirs::home_dir()
                .map(|home| home.join(".feedsync"))
                .ok_or_else(|| anyhow::anyhow!("Could not determine home directory")),
        }
    }

    pub fn db_path(&self) -> anyhow::Result<&PathBuf> {
        self.database
            .path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Database path not configured"))
    }
}
