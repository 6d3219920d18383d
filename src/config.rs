use anyhow::{Context, Result};
use serde::Deserialize;
use std::{env, fmt::Display, fs, path::Path, str::FromStr, time::Duration};

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub assets: AssetsConfig,
    pub trail: TrailConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("parsing config {:?}", path))?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AssetsConfig {
    pub bucket: String,
    /// Prepended to every generated object key, e.g. `"staging/"`.
    pub prefix: String,
    /// CDN host serving the bucket. Urls point at the bucket directly when unset.
    pub cdn: Option<String>,
    pub io_timeout_ms: u64,
    pub cold_cache_warn_threshold: usize,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        AssetsConfig {
            bucket: "attractions-assets".to_owned(),
            prefix: String::new(),
            cdn: None,
            io_timeout_ms: 10_000,
            cold_cache_warn_threshold: 10,
        }
    }
}

impl AssetsConfig {
    pub fn from_env() -> Result<AssetsConfig> {
        let default = AssetsConfig::default();
        Ok(AssetsConfig {
            bucket: try_load("ASSETS_BUCKET", default.bucket)?,
            prefix: try_load("ASSETS_PREFIX", default.prefix)?,
            cdn: try_load_optional("ASSETS_CDN"),
            io_timeout_ms: try_load("ASSETS_IO_TIMEOUT_MS", default.io_timeout_ms)?,
            cold_cache_warn_threshold: try_load(
                "ASSETS_COLD_CACHE_WARN_THRESHOLD",
                default.cold_cache_warn_threshold,
            )?,
        })
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

fn try_load<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match env::var(key) {
        Err(_) => {
            debug!("{key} not set, using default: {default}");
            Ok(default)
        }
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow!("invalid {key} value {value:?}: {e}")),
    }
}

// an empty value counts as unset
fn try_load_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => {
            debug!("{key} not set, using default: none");
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrailConfig {
    /// Number of altitude samples averaged together. From experience altitude
    /// is much less accurate than latitude or longitude, so a single point
    /// should never carry much weight.
    pub altitude_compare_points: usize,
    /// Minimal change of the averaged altitude (in meters) counted as a real
    /// climb or descent.
    pub height_threshold: f64,
}

pub const ALTITUDE_COMPARE_POINTS: usize = 20;
pub const HEIGHT_THRESHOLD: f64 = 5.0;

impl Default for TrailConfig {
    fn default() -> Self {
        TrailConfig {
            altitude_compare_points: ALTITUDE_COMPARE_POINTS,
            height_threshold: HEIGHT_THRESHOLD,
        }
    }
}
