// main.rs
// 功能：
// 1. serve：读取 config.toml，启动队列代理（缓存 + 上游转发 + 上传校验）
// 2. watch：无界面的看板会话，轮询 + 事件推送驱动队列状态机，记录状态变化

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{info, warn};

use queuerelay::{
    cache::{self, QueueCache},
    client::{
        ClientSettings, Notice, QueueApi, QueueClient, ReqwestBackend, RetryPolicy, RetryTransport,
        Ui, spawn_status_poller,
    },
    config::{ConfigCenter, RuntimeContext},
    events::{EventChannel, SseEventSource},
    http,
    model::Scope,
    proxy::QueueProxy,
    signal,
    upstream::UpstreamClient,
};

#[derive(Parser)]
#[command(name = "queuerelay", version)]
struct Args {
    /// config.toml 路径
    #[arg(long, global = true, default_value = "config/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the queue proxy.
    Serve,
    /// Follow one service's queue from the command line.
    Watch {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        service: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cc = ConfigCenter::load(RuntimeContext {
        config_path: args.config.clone(),
    })?;
    signal::spawn_reload_on_hangup(cc.clone());

    match args.command {
        Command::Serve => serve(cc).await,
        Command::Watch { tenant, service } => watch(cc, Scope::new(tenant, service)).await,
    }
}

async fn serve(cc: ConfigCenter) -> anyhow::Result<()> {
    let cfg = cc.snapshot().await;
    let addr: SocketAddr = cfg
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cfg.bind))?;

    let upstream = UpstreamClient::new(cc.clone(), &cfg)?;
    let cache = Arc::new(QueueCache::new());
    cache::spawn_sweeper(cache.clone(), cc.clone());

    let proxy = Arc::new(QueueProxy::new(upstream, cache, cc));
    info!("Forwarding queue calls to {}", cfg.upstream_url);
    http::serve_http(addr, http::build_router(proxy)).await
}

/// Headless session: confirmations are auto-accepted, notices go to the log.
struct LogUi;

impl Ui for LogUi {
    fn confirm(&self, prompt: &str) -> bool {
        info!("[client] auto-confirm: {}", prompt);
        true
    }

    fn notify(&self, notice: Notice) {
        match notice {
            Notice::Info(msg) => info!("[client] {}", msg),
            Notice::Error(msg) => warn!("[client] {}", msg),
        }
    }
}

async fn watch(cc: ConfigCenter, scope: Scope) -> anyhow::Result<()> {
    let cfg = cc.snapshot().await.client;

    let backend = ReqwestBackend::new(&cfg.proxy_url, scope.clone())?;
    let transport = Arc::new(RetryTransport::new(Arc::new(backend), RetryPolicy::from_config(&cfg)));
    let client = Arc::new(QueueClient::new(
        QueueApi::new(transport.clone()),
        Arc::new(LogUi),
        ClientSettings::from(&cfg),
    ));

    if let Err(e) = client.load_all(true).await {
        warn!("[client] initial load failed: {}", e);
    }
    spawn_status_poller(client.clone(), Duration::from_secs(cfg.poll_interval_secs));

    let _events = match &cfg.events_url {
        Some(url) => {
            let channel = EventChannel::new(client.clone(), Arc::new(SseEventSource::new(url.clone())?), scope.room());
            channel.activate().await;
            Some(channel)
        }
        None => {
            info!("[events] no events_url configured; polling only");
            None
        }
    };

    let mut views = client.subscribe();
    let mut connection = transport.watch_connection();
    info!("Watching queue for {}", scope);

    let shutdown = signal::shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                info!(
                    "[client] {:?}: {} queued, processing={}",
                    view.phase,
                    view.queue.len(),
                    view.is_processing()
                );
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connection.borrow_and_update();
                if state.retrying {
                    warn!("[transport] retrying {}/{}", state.retry_count, state.max_retries);
                }
            }
            _ = &mut shutdown => break,
        }
    }
    Ok(())
}
