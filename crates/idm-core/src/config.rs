//! Engine configuration: immutable settings plus hot-tunable knobs.
//!
//! The serializable part loads from `~/.config/idm/config.toml` (or is passed
//! in directly by an embedding application). Speed limit and max-concurrent
//! are atomic cells so they can change while jobs run.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// What to do when the final path already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Replace the existing file.
    Overwrite,
    /// Pick `name (1).ext`, `name (2).ext`, ...
    #[default]
    Rename,
}

/// Engine settings persisted to TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory completed files land in (jobs may override per submit).
    pub download_dir: PathBuf,
    /// Root for per-job temp dirs and the `jobs.json` index.
    pub temp_root: PathBuf,
    /// Maximum jobs in `Running` at once (1..64).
    pub max_concurrent_jobs: usize,
    /// Maximum connections per download (1..N).
    pub max_connections: usize,
    /// Preferred segment size in bytes; segment count is derived from it and
    /// clamped to `max_connections`-friendly bounds.
    pub segment_size_hint: u64,
    /// Aggregate speed limit, bytes/s. 0 = unlimited.
    pub global_speed_limit: u64,
    /// Connect timeout.
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    /// Idle read timeout (no bytes for this long aborts the attempt).
    #[serde(with = "secs")]
    pub read_timeout: Duration,
    /// Verify TLS certificates.
    pub verify_tls: bool,
    /// Compute MD5 + SHA-256 during assembly.
    pub verify_checksums: bool,
    /// Ask the muxer to tag media metadata after merge.
    pub write_metadata: bool,
    /// What to do when the target filename is taken.
    pub collision_policy: CollisionPolicy,
    /// Per-segment worker retry cap.
    pub max_worker_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            temp_root: PathBuf::from(".idm-temp"),
            max_concurrent_jobs: 3,
            max_connections: 8,
            segment_size_hint: 4 * 1024 * 1024,
            global_speed_limit: 0,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            verify_tls: true,
            verify_checksums: false,
            write_metadata: false,
            collision_policy: CollisionPolicy::Rename,
            max_worker_retries: 10,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("idm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<EngineConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: EngineConfig = toml::from_str(&data)?;
    Ok(cfg)
}

/// Knobs the scheduler reads on every cycle; safe to poke from any thread.
#[derive(Debug)]
pub struct HotKnobs {
    global_speed_limit: AtomicU64,
    max_concurrent_jobs: AtomicUsize,
}

impl HotKnobs {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            global_speed_limit: AtomicU64::new(cfg.global_speed_limit),
            max_concurrent_jobs: AtomicUsize::new(cfg.max_concurrent_jobs.clamp(1, 64)),
        }
    }

    pub fn global_speed_limit(&self) -> u64 {
        self.global_speed_limit.load(Ordering::Relaxed)
    }

    pub fn set_global_speed_limit(&self, bps: u64) {
        self.global_speed_limit.store(bps, Ordering::Relaxed);
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs.load(Ordering::Relaxed)
    }

    pub fn set_max_concurrent_jobs(&self, n: usize) {
        self.max_concurrent_jobs
            .store(n.clamp(1, 64), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_concurrent_jobs, 3);
        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.read_timeout, Duration::from_secs(30));
        assert_eq!(cfg.collision_policy, CollisionPolicy::Rename);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.max_connections, cfg.max_connections);
        assert_eq!(parsed.connect_timeout, cfg.connect_timeout);
        assert_eq!(parsed.segment_size_hint, cfg.segment_size_hint);
    }

    #[test]
    fn hot_knobs_clamp_concurrency() {
        let knobs = HotKnobs::from_config(&EngineConfig::default());
        knobs.set_max_concurrent_jobs(0);
        assert_eq!(knobs.max_concurrent_jobs(), 1);
        knobs.set_max_concurrent_jobs(1000);
        assert_eq!(knobs.max_concurrent_jobs(), 64);
        knobs.set_global_speed_limit(1_048_576);
        assert_eq!(knobs.global_speed_limit(), 1_048_576);
    }
}
