use conductor_pool::PoolConfig;
use conductor_scheduler::{ExecutorConfig, MonitorConfig};
use serde::Deserialize;
use std::path::Path;

/// Contents of `conductor.toml`.
///
/// `[monitor]` and `[executor]` fall back to their defaults; `[pool]` must
/// be spelled out.
#[derive(Debug, Deserialize)]
pub struct ConductorConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    pub pool: PoolConfig,
}

impl ConductorConfig {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: ConductorConfig = toml::from_str(raw)?;
        config.monitor.validate()?;
        config.executor.validate()?;
        config.pool.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    const POOL: &str = r#"
[pool]
max_concurrent_e2e = 1
max_concurrent_build = 2
max_concurrent_heavy_compute = 1
stale_lock_threshold_ms = 600000
stale_check_interval_ms = 30000
wait_timeout_ms = 300000
lock_dir = "/tmp/conductor-test/slots"
"#;

    #[test]
    fn test_sections_default_except_pool() {
        let config = ConductorConfig::parse(POOL).unwrap();
        assert_eq!(config.monitor, MonitorConfig::default());
        assert_eq!(config.executor.max_task_history, 1000);
        assert_eq!(config.pool.max_concurrent_build, 2);
    }

    #[test]
    fn test_missing_pool_is_an_error() {
        let err = ConductorConfig::parse("[monitor]\nmax_cpu_percent = 50.0\n").unwrap_err();
        assert!(err.to_string().contains("pool"));
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let raw = format!("[monitor]\nmax_cpu_percent = 150.0\n{POOL}");
        assert!(ConductorConfig::parse(&raw).is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[executor]\norchestrator_id = \"nightly\"\n{POOL}").unwrap();
        let config = ConductorConfig::load(file.path()).await.unwrap();
        assert_eq!(config.executor.orchestrator_id, "nightly");
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = ConductorConfig::load(Path::new("/nonexistent/conductor.toml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
