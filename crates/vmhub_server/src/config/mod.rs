#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::debug;

/// Default config path: `~/.vmhub/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".vmhub").join("config.toml"))
}

/// Process configuration: everything operational lives in the DB-backed
/// settings table; this covers only what is needed before the DB opens.
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub database_url: String,
	/// Optional Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			database_url: "sqlite:vmhub.db?mode=rwc".to_string(),
			metrics_bind: None,
			health_bind: None,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	database_url: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

/// Load the config from TOML with env overrides (`VMHUB_*`).
pub fn load_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path).with_context(|| format!("read config from {}", path.display()))?;

	let mut cfg = ServerConfig::default();
	if let Some(file_cfg) = file_cfg {
		if let Some(v) = file_cfg.database_url {
			cfg.database_url = v;
		}
		cfg.metrics_bind = file_cfg.metrics_bind;
		cfg.health_bind = file_cfg.health_bind;
	}

	apply_env_overrides(&mut cfg);
	Ok(cfg)
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	if !path.exists() {
		debug!(path = %path.display(), "no config file, using defaults");
		return Ok(None);
	}
	let raw = fs::read_to_string(path)?;
	let cfg = toml::from_str(&raw).context("parse config toml")?;
	Ok(Some(cfg))
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("VMHUB_DATABASE_URL")
		&& !v.trim().is_empty()
	{
		cfg.database_url = v;
	}
	if let Ok(v) = std::env::var("VMHUB_METRICS_BIND")
		&& !v.trim().is_empty()
	{
		cfg.metrics_bind = Some(v);
	}
	if let Ok(v) = std::env::var("VMHUB_HEALTH_BIND")
		&& !v.trim().is_empty()
	{
		cfg.health_bind = Some(v);
	}
}

#[cfg(test)]
mod config_tests {
	use super::*;

	#[test]
	fn missing_file_yields_defaults() {
		let cfg = load_config_from_path(Path::new("/nonexistent/vmhub/config.toml")).expect("load");
		assert_eq!(cfg.database_url, "sqlite:vmhub.db?mode=rwc");
		assert!(cfg.metrics_bind.is_none());
	}

	#[test]
	fn file_values_are_applied() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("config.toml");
		std::fs::write(
			&path,
			"database_url = \"sqlite::memory:\"\nmetrics_bind = \"127.0.0.1:9633\"\n",
		)
		.expect("write");

		let cfg = load_config_from_path(&path).expect("load");
		assert_eq!(cfg.database_url, "sqlite::memory:");
		assert_eq!(cfg.metrics_bind.as_deref(), Some("127.0.0.1:9633"));
	}
}
