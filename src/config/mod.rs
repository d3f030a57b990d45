mod config;

pub use config::{ClientConfig, Config};

use std::{fs, path::PathBuf, sync::Arc};

use anyhow::Context;
use log::info;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct RuntimeContext {
    pub config_path: PathBuf,
}

/// Live configuration shared by the proxy, the cache sweeper and the
/// headless dashboard session.
#[derive(Clone)]
pub struct ConfigCenter {
    runtime: Arc<RuntimeContext>,
    config: Arc<RwLock<Config>>,
}

impl ConfigCenter {
    /// 启动时加载配置，失败则返回错误由 main 处理
    pub fn load(runtime: RuntimeContext) -> anyhow::Result<Self> {
        let cfg = read_config(&runtime.config_path)?;
        Ok(Self {
            runtime: Arc::new(runtime),
            config: Arc::new(RwLock::new(cfg)),
        })
    }

    /// In-memory center, no backing file. Reload keeps the current values.
    pub fn from_config(mut cfg: Config) -> Self {
        cfg.finalize();
        Self {
            runtime: Arc::new(RuntimeContext {
                config_path: PathBuf::new(),
            }),
            config: Arc::new(RwLock::new(cfg)),
        }
    }

    /// 运行期重载（SIGHUP 触发）
    pub async fn reload(&self) -> anyhow::Result<()> {
        if self.runtime.config_path.as_os_str().is_empty() {
            return Ok(());
        }
        let new_cfg = read_config(&self.runtime.config_path)?;
        let old_proxy = self.config.read().await.proxy.clone();
        if old_proxy != new_cfg.proxy {
            log::warn!("[config] proxy setting changed; restart required for it to apply");
        }
        *self.config.write().await = new_cfg;
        info!("[config] reloaded {}", self.runtime.config_path.display());
        Ok(())
    }

    pub async fn config(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config.read().await
    }

    /// Owned copy for callers that must not hold the lock across awaits.
    pub async fn snapshot(&self) -> Config {
        self.config.read().await.clone()
    }
}

fn read_config(path: &PathBuf) -> anyhow::Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config ({})", path.display()))?;
    let mut cfg: Config = toml::from_str(&raw)
        .with_context(|| format!("config parse error ({})", path.display()))?;
    cfg.finalize();
    Ok(cfg)
}
