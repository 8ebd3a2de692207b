//! Environment-driven configuration, mirroring
//! `examples/DSado88-squall/src/config.rs`'s `Config::from_env` pattern:
//! read `env::var`, fall back to a sane default, `tracing::warn!` on
//! anything missing rather than failing startup.

use std::env;
use std::time::Duration;

use crate::job::ResourceLimits;

fn env_u64(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!("{key} is not a valid integer, using default {default}");
            default
        }),
        Err(_) => default,
    }
}

/// Top-level runtime configuration, assembled once at startup.
pub struct Config {
    pub bind_addr: String,
    pub worker_key_path: Option<String>,
    pub default_limits: ResourceLimits,
    pub max_concurrent_jobs: u32,
    pub jobs_per_hour: u64,
    pub cleanup_after: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let bind_addr = env::var("SANDRUN_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:7420".to_string());

        let worker_key_path = env::var("SANDRUN_WORKER_KEYFILE").ok();
        if worker_key_path.is_none() {
            tracing::warn!("SANDRUN_WORKER_KEYFILE not set — generating an ephemeral worker identity");
        }

        let default_limits = ResourceLimits {
            max_memory_bytes: env_u64("SANDRUN_MAX_MEMORY_BYTES", ResourceLimits::DEFAULT_MEMORY_BYTES),
            max_cpu_seconds: env_u64("SANDRUN_MAX_CPU_SECONDS", ResourceLimits::DEFAULT_CPU_SECONDS),
            max_wall_seconds: env_u64("SANDRUN_MAX_WALL_SECONDS", ResourceLimits::DEFAULT_WALL_SECONDS),
            max_output_file_bytes: env_u64(
                "SANDRUN_MAX_OUTPUT_FILE_BYTES",
                ResourceLimits::DEFAULT_OUTPUT_FILE_BYTES,
            ),
            max_processes: env_u64("SANDRUN_MAX_PROCESSES", 32) as u32,
            max_open_files: env_u64("SANDRUN_MAX_OPEN_FILES", 256) as u32,
            max_gpu_memory_bytes: env::var("SANDRUN_MAX_GPU_MEMORY_BYTES")
                .ok()
                .and_then(|v| v.parse().ok()),
        };

        let max_concurrent_jobs = env_u64("SANDRUN_MAX_CONCURRENT_JOBS_PER_IP", 2) as u32;
        let jobs_per_hour = env_u64("SANDRUN_MAX_JOBS_PER_HOUR", 10);
        let cleanup_after = Duration::from_secs(env_u64("SANDRUN_CLEANUP_AFTER_SECONDS", 60));

        Self {
            bind_addr,
            worker_key_path,
            default_limits,
            max_concurrent_jobs,
            jobs_per_hour,
            cleanup_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_unset() {
        // SANDRUN_* vars are assumed unset in the test environment; this
        // exercises the fallback path rather than real overrides.
        let config = Config::from_env();
        assert_eq!(config.default_limits.max_cpu_seconds, ResourceLimits::DEFAULT_CPU_SECONDS);
        assert_eq!(config.max_concurrent_jobs, 2);
    }
}
