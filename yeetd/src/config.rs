use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;
use logger::LogConfig;
use serde::Deserialize;

/// CLI flags, highest priority. Every field is optional so it only
/// overrides the environment/file/default chain when given.
#[derive(Debug, Parser)]
#[command(name = "yeetd", about = "Host agent for yeet")]
pub struct CliArgs {
  #[arg(long)]
  pub config_path: Option<PathBuf>,
  #[arg(long)]
  pub port: Option<u16>,
  #[arg(long)]
  pub root_directory: Option<PathBuf>,
  #[arg(long)]
  pub log_level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Env {
  yeetd_config_path: Option<PathBuf>,
  yeetd_port: Option<u16>,
  yeetd_bind_ip: Option<String>,
  yeetd_root_directory: Option<PathBuf>,
  yeetd_registry_port: Option<u16>,
  yeetd_log_level: Option<String>,
  yeetd_log_json: Option<bool>,
}

/// A config file loaded from `yeetd.toml` under the root directory or the
/// path named by `--config-path`/`YEETD_CONFIG_PATH`.
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
  port: Option<u16>,
  bind_ip: Option<String>,
  root_directory: Option<PathBuf>,
  registry_port: Option<u16>,
  log_level: Option<String>,
  log_json: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
  /// RPC listener port.
  pub port: u16,
  pub bind_ip: String,
  /// Root of the on-disk layout: `<root>/db.json`, `<root>/services/*`,
  /// `<root>/mounts/*`.
  pub root_directory: PathBuf,
  /// OCI distribution v2 listener port.
  pub registry_port: u16,
  pub logging: LogConfig,
}

impl AgentConfig {
  pub fn services_dir(&self) -> PathBuf {
    self.root_directory.join("services")
  }

  pub fn mounts_dir(&self) -> PathBuf {
    self.root_directory.join("mounts")
  }

  pub fn db_path(&self) -> PathBuf {
    self.root_directory.join("db.json")
  }
}

fn parse_log_level(s: &str) -> logger::LogLevel {
  use logger::LogLevel::*;
  match s.to_ascii_lowercase().as_str() {
    "error" => Error,
    "warn" | "warning" => Warn,
    "debug" => Debug,
    "trace" => Trace,
    _ => Info,
  }
}

pub fn agent_config() -> &'static AgentConfig {
  static CONFIG: OnceLock<AgentConfig> = OnceLock::new();
  CONFIG.get_or_init(load_config)
}

fn load_config() -> AgentConfig {
  let env: Env = envy::from_env().unwrap_or_else(|e| {
    eprintln!("WARN: failed to parse yeetd environment: {e}");
    Env {
      yeetd_config_path: None,
      yeetd_port: None,
      yeetd_bind_ip: None,
      yeetd_root_directory: None,
      yeetd_registry_port: None,
      yeetd_log_level: None,
      yeetd_log_json: None,
    }
  });
  let args = CliArgs::parse();

  let config_path = args
    .config_path
    .clone()
    .or_else(|| env.yeetd_config_path.clone())
    .unwrap_or_else(|| PathBuf::from("/etc/yeetd/yeetd.toml"));
  let file: FileConfig = config::load_toml(&config_path).ok().flatten().unwrap_or_default();

  let root_directory = args
    .root_directory
    .clone()
    .or(env.yeetd_root_directory)
    .or(file.root_directory)
    .unwrap_or_else(|| PathBuf::from("/var/lib/yeetd"));

  let log_level = args
    .log_level
    .clone()
    .or(env.yeetd_log_level)
    .or(file.log_level)
    .map(|s| parse_log_level(&s))
    .unwrap_or(logger::LogLevel::Info);

  let log_json = env.yeetd_log_json.or(file.log_json).unwrap_or(false);

  AgentConfig {
    port: args.port.or(env.yeetd_port).or(file.port).unwrap_or(9120),
    bind_ip: env.yeetd_bind_ip.or(file.bind_ip).unwrap_or_else(|| "0.0.0.0".to_string()),
    root_directory,
    registry_port: env.yeetd_registry_port.or(file.registry_port).unwrap_or(9121),
    logging: LogConfig {
      level: log_level,
      stdio: if log_json { logger::StdioLogMode::Json } else { logger::StdioLogMode::Standard },
      pretty: false,
    },
  }
}
