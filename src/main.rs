mod alerts;
mod charts;
mod collectors;
mod config;
mod format;
mod http;
mod metrics;
mod monitor;
mod notifier;
mod pipeline;
mod telegram;

use alerts::AlertEngine;
use axum::serve;
use clap::Parser;
use collectors::docker::DockerClient;
use collectors::host::HostControl;
use collectors::system::SysinfoSource;
use collectors::MetricsSource;
use config::Config;
use metrics::Metrics;
use monitor::{HealthMonitor, MonitorSettings};
use notifier::{Notifier, RecipientSet};
use pipeline::{AuditStage, AuthorizationStage, Pipeline, RateLimitStage};
use std::net::SocketAddr;
use std::sync::Arc;
use teloxide::Bot;
use telegram::{BotDeps, TelegramSink};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hostwatch")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Validate the config file and exit.
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let token = match ensure_telegram_settings(&cfg) {
        Ok(token) => token,
        Err(err) => {
            error!(error = %err, "telegram settings are incomplete");
            std::process::exit(1);
        }
    };

    if cli.check_config {
        info!(config = %cli.config, "configuration is valid");
        return;
    }

    info!(
        listen = %cfg.listen,
        interval_secs = cfg.interval_secs,
        allowed_users = cfg.telegram.allowed_user_ids.len(),
        "starting hostwatch"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialize metrics");
            std::process::exit(1);
        }
    };

    let cfg = Arc::new(cfg);
    let bot = Bot::new(token);

    let recipients = RecipientSet::new();
    for chat_id in cfg.telegram.initial_recipients() {
        recipients.register(chat_id).await;
    }
    let notifier = Arc::new(Notifier::new(TelegramSink::new(bot.clone()), recipients));
    let engine = AlertEngine::new(cfg.alerts.rules())
        .with_max_active(cfg.alerts.max_active_alerts)
        .into_shared();

    let source = Arc::new(SysinfoSource::new());
    let metrics_source: Arc<dyn MetricsSource> = source.clone();
    let monitor = Arc::new(
        HealthMonitor::new(
            metrics_source,
            engine.clone(),
            notifier,
            MonitorSettings {
                cpu_settle: cfg.alerts.cpu_settle(),
                disk_mount: cfg.alerts.disk_mount.clone(),
            },
        )
        .with_metrics(metrics.clone()),
    );

    let pipeline = Arc::new(
        Pipeline::new()
            .with_stage(AuthorizationStage::new(
                cfg.telegram.allowed_user_ids.iter().copied(),
            ))
            .with_stage(RateLimitStage::new(
                cfg.telegram.rate_limit_calls,
                cfg.telegram.rate_limit_period_secs,
            ))
            .with_stage(AuditStage::new(Some(metrics.clone())))
            .with_metrics(metrics.clone()),
    );

    if !monitor.start(cfg.interval()).await {
        warn!("health monitor was already running");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let metrics = metrics.clone();
        let engine = engine.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, engine);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to bind HTTP listener");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let telegram_task = {
        let deps = BotDeps {
            cfg: cfg.clone(),
            monitor: monitor.clone(),
            source,
            docker: Arc::new(DockerClient::new(cfg.docker.clone())),
            host: Arc::new(HostControl::new(cfg.host.clone())),
            pipeline,
        };
        let metrics = Some(metrics.clone());
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(err) = telegram::run_bot(bot, deps, metrics, shutdown).await {
                error!(error = %err, "telegram task failed");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("shutdown requested");

    monitor.stop().await;
    let _ = shutdown_tx.send(true);

    let _ = telegram_task.await;
    let _ = http_task.await;
    info!("hostwatch stopped");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Resolves the bot token (environment first, then the config file) and
/// checks that someone is allowed to talk to the bot.
fn ensure_telegram_settings(cfg: &Config) -> Result<String, String> {
    let env_token = std::env::var(&cfg.telegram.bot_token_env)
        .ok()
        .filter(|v| !v.trim().is_empty());
    let token = env_token
        .or_else(|| {
            cfg.telegram
                .bot_token
                .clone()
                .filter(|v| !v.trim().is_empty())
        })
        .ok_or_else(|| {
            format!(
                "set {} or telegram.bot_token in the config",
                cfg.telegram.bot_token_env
            )
        })?;

    if cfg.telegram.allowed_user_ids.is_empty() {
        return Err("telegram.allowed_user_ids must contain at least one user id".to_string());
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_token_is_used_when_env_is_unset() {
        let mut cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("example parses");
        cfg.telegram.bot_token_env = "HOSTWATCH_TEST_TOKEN_UNSET".to_string();
        cfg.telegram.bot_token = Some("123:abc".to_string());
        cfg.telegram.allowed_user_ids = vec![1];
        assert_eq!(ensure_telegram_settings(&cfg).as_deref(), Ok("123:abc"));
    }

    #[test]
    fn missing_token_or_users_is_rejected() {
        let mut cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("example parses");
        cfg.telegram.bot_token_env = "HOSTWATCH_TEST_TOKEN_UNSET".to_string();
        cfg.telegram.bot_token = None;
        cfg.telegram.allowed_user_ids = vec![1];
        assert!(ensure_telegram_settings(&cfg).is_err());

        cfg.telegram.bot_token = Some("123:abc".to_string());
        cfg.telegram.allowed_user_ids.clear();
        assert!(ensure_telegram_settings(&cfg).is_err());
    }
}
