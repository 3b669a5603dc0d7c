use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringMode {
    Rules,
    Model,
}

impl FromStr for ScoringMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rules" => Ok(Self::Rules),
            "model" | "ml" => Ok(Self::Model),
            other => bail!("unknown scoring mode {other:?}, expected \"rules\" or \"model\""),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub bind_addr: SocketAddr,
    pub api_key: String,
    pub scoring_mode: ScoringMode,
    pub model_path: Option<PathBuf>,
    pub default_base_rate: f64,
    pub history_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            api_key: "devkey".to_string(),
            scoring_mode: ScoringMode::Rules,
            model_path: None,
            default_base_rate: 120.0,
            history_limit: 60,
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("invalid {key}={raw:?}: {err}")),
        _ => Ok(None),
    }
}

impl Settings {
    /// Reads the process environment after loading `.env`, if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        cfg.database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        if let Some(addr) = parsed::<SocketAddr>(&lookup, "BIND_ADDR")? {
            cfg.bind_addr = addr;
        }
        if let Some(key) = lookup("API_KEY") {
            if key.is_empty() {
                bail!("API_KEY must not be empty");
            }
            cfg.api_key = key;
        }

        if lookup("USE_ML").is_some_and(|v| v.trim().eq_ignore_ascii_case("true")) {
            cfg.scoring_mode = ScoringMode::Model;
        }
        if let Some(mode) = parsed::<ScoringMode>(&lookup, "SCORING_MODE")? {
            cfg.scoring_mode = mode;
        }
        cfg.model_path = lookup("MODEL_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        if let Some(rate) = parsed::<f64>(&lookup, "DEFAULT_BASE_RATE")? {
            if !rate.is_finite() || rate < 0.0 {
                bail!("DEFAULT_BASE_RATE must be a non-negative number");
            }
            cfg.default_base_rate = rate;
        }
        if let Some(limit) = parsed::<usize>(&lookup, "HISTORY_LIMIT")? {
            if limit == 0 {
                bail!("HISTORY_LIMIT must be at least 1");
            }
            cfg.history_limit = limit;
        }

        Ok(cfg)
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set to a Postgres instance")
    }
}
