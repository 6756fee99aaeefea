use std::fs;
use std::io::Write;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::Level;

#[derive(Parser, Debug)]
#[command(author, version, about = "cardano blockchain data importer", long_about = None)]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "importer.toml")]
    pub config: String,

    #[arg(long, default_value = "0.0.0.0")]
    pub server_address: String,

    #[arg(long, default_value = "9090")]
    pub server_port: u16,

    #[arg(long, default_value = "info")]
    pub log_level: LogLevel,

    /// Write an example configuration file and exit
    #[arg(long)]
    pub init: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppConfig {
    pub bridge_url: String,
    #[serde(default = "default_bridge_timeout")]
    pub bridge_timeout_seconds: u64,
    pub network: NetworkConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    /// Hash of the genesis document served by the bridge.
    pub genesis: String,
    /// Unix timestamp of slot 0 of epoch 0.
    pub start_time: i64,
    /// Expected magic of destination addresses; unset on mainnet, whose
    /// addresses carry no magic attribute.
    pub network_magic: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Connect timeout in seconds.
    #[serde(default = "default_db_timeout")]
    pub timeout: u64,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub check_tip_seconds: u64,
    pub rollback_blocks_count: i64,
    /// Flush threshold of the in-memory block buffer.
    pub blocks_cache_size: usize,
    /// Slot cutoff below which a whole-epoch pull is still worthwhile.
    pub epoch_download_threshold: i64,
    pub max_blocks_per_loop: i64,
    pub log_block_parsed_threshold: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_tip_seconds: 15,
            rollback_blocks_count: 25,
            blocks_cache_size: 800,
            epoch_download_threshold: 14400,
            max_blocks_per_loop: 9000,
            log_block_parsed_threshold: 3000,
        }
    }
}

fn default_bridge_timeout() -> u64 {
    600
}

fn default_db_timeout() -> u64 {
    5
}

fn default_pool_size() -> usize {
    4
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("cannot read config file {path}"))?;
        toml::from_str(&contents).with_context(|| format!("invalid config file {path}"))
    }

    pub fn to_file(&self, path: &str) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = fs::File::create(path)?;
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }
}

pub struct Config {
    pub server_address: String,
    pub server_port: u16,
    pub log_level: Level,
    pub bridge_url: String,
    pub bridge_timeout_seconds: u64,
    pub network: NetworkConfig,
    pub db: DbConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    pub fn init(args: Args) -> Result<Self> {
        if args.init {
            Self::generate_config(&args.config)?;
        }
        let app = AppConfig::from_file(&args.config)?;
        Ok(Config {
            server_address: args.server_address,
            server_port: args.server_port,
            log_level: args.log_level.into(),
            bridge_url: app.bridge_url,
            bridge_timeout_seconds: app.bridge_timeout_seconds,
            network: app.network,
            db: app.db,
            scheduler: app.scheduler,
        })
    }

    fn generate_config(path: &str) -> Result<()> {
        let example = AppConfig {
            bridge_url: "http://localhost:8082".to_string(),
            bridge_timeout_seconds: default_bridge_timeout(),
            network: NetworkConfig {
                name: "mainnet".to_string(),
                genesis: "5f20df933584822601f9e3f8c024eb5eb252fe8cefb24d1317dc3d432e940ebb"
                    .to_string(),
                start_time: 1506203091,
                network_magic: None,
            },
            db: DbConfig {
                host: "localhost".to_string(),
                port: 5432,
                user: "postgres".to_string(),
                password: String::new(),
                database: "cardano_importer".to_string(),
                timeout: default_db_timeout(),
                pool_size: default_pool_size(),
            },
            scheduler: SchedulerConfig::default(),
        };
        example.to_file(path)?;
        println!("config has been written to {path}");
        std::process::exit(0);
    }
}

#[derive(Debug, Clone, ValueEnum, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        match log_level {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_scheduler_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            bridge_url = "http://localhost:8082"

            [network]
            name = "testnet"
            genesis = "96fceff972c2c06bd3bb5243c39215333be6d56aaf4823073dca31afe5038471"
            start_time = 1563999616
            network_magic = 1097911063

            [db]
            host = "localhost"
            port = 5432
            user = "postgres"
            password = ""
            database = "importer"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.check_tip_seconds, 15);
        assert_eq!(config.scheduler.rollback_blocks_count, 25);
        assert_eq!(config.db.timeout, 5);
        assert_eq!(config.network.network_magic, Some(1097911063));
        assert_eq!(config.bridge_timeout_seconds, 600);
    }
}
