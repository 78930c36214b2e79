use crate::alerts::{Alert, AlertKind};
use crate::charts::{self, BarChart};
use crate::collectors::docker::{validate_container_name, ContainerError, ContainerOp, DockerClient};
use crate::collectors::host::{CommandError, HostControl, PowerOp};
use crate::collectors::system::SysinfoSource;
use crate::collectors::{blocking, MetricsSource, SampleError};
use crate::config::{ChartsConfig, Config};
use crate::format;
use crate::metrics::{now_unix, Metrics};
use crate::monitor::HealthMonitor;
use crate::notifier::{AlertSink, DeliveryError};
use crate::pipeline::{Outcome, Pipeline, Request};
use std::collections::HashMap;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{
    BotCommand, CallbackQuery, ChatAction, ChatId, InlineKeyboardButton, InlineKeyboardMarkup,
    InputFile, Message, MessageId, ParseMode,
};
use teloxide::{ApiError, RequestError};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

const TOP_PROCESS_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("telegram request failed: {0}")]
    Request(#[from] RequestError),
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Sample(#[from] SampleError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Confirm(#[from] ConfirmError),
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ConfirmError {
    #[error("this confirmation is unknown or was already used")]
    Unknown,
    #[error("this confirmation has expired, please request the action again")]
    Expired,
    #[error("only the user who requested this action can answer it")]
    WrongUser,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Start,
    Help,
    Status,
    Cpu,
    Memory,
    Disk,
    Network,
    Top,
    Temp,
    Uptime,
    Services,
    Alerts,
    CheckNow,
    Ack(Option<u64>),
    Clear(Option<AlertKind>),
    Subscribe,
    Unsubscribe,
    Docker,
    DockerStats,
    DockerLogs(Option<String>),
    Container(ContainerOp, Option<String>),
    Power(PowerOp),
    Confirm(String),
    Cancel(String),
    Invalid(String),
}

impl Action {
    /// Parses `/name[@bot] [arg]`. Returns `None` for anything that is not a
    /// known command.
    pub fn from_command(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let first = parts.next()?;
        let normalized = first.split('@').next()?.to_lowercase();
        let arg = parts.next().map(str::to_string);
        match normalized.as_str() {
            "/start" | "/menu" => Some(Self::Start),
            "/help" => Some(Self::Help),
            "/status" => Some(Self::Status),
            "/cpu" => Some(Self::Cpu),
            "/memory" | "/mem" => Some(Self::Memory),
            "/disk" => Some(Self::Disk),
            "/network" | "/net" => Some(Self::Network),
            "/top" => Some(Self::Top),
            "/temp" => Some(Self::Temp),
            "/uptime" => Some(Self::Uptime),
            "/services" => Some(Self::Services),
            "/alerts" => Some(Self::Alerts),
            "/check" => Some(Self::CheckNow),
            "/ack" => Some(Self::Ack(arg.and_then(|a| a.trim_start_matches('#').parse().ok()))),
            "/clear" => Some(match arg {
                None => Self::Clear(None),
                Some(raw) => match raw.parse::<AlertKind>() {
                    Ok(kind) => Self::Clear(Some(kind)),
                    Err(err) => Self::Invalid(format!("{err}. Use cpu, memory or disk.")),
                },
            }),
            "/subscribe" => Some(Self::Subscribe),
            "/unsubscribe" => Some(Self::Unsubscribe),
            "/docker" => Some(Self::Docker),
            "/docker_stats" => Some(Self::DockerStats),
            "/docker_logs" => Some(Self::DockerLogs(arg)),
            "/docker_restart" => Some(Self::Container(ContainerOp::Restart, arg)),
            "/docker_stop" => Some(Self::Container(ContainerOp::Stop, arg)),
            "/docker_start" => Some(Self::Container(ContainerOp::Start, arg)),
            "/reboot" => Some(Self::Power(PowerOp::Reboot)),
            "/shutdown" => Some(Self::Power(PowerOp::Shutdown)),
            _ => None,
        }
    }

    /// Plain text yields `None`; unknown commands fall back to the welcome view.
    pub fn from_message(text: &str) -> Option<Self> {
        if !text.trim_start().starts_with('/') {
            return None;
        }
        Some(Self::from_command(text).unwrap_or(Self::Start))
    }

    pub fn from_callback(data: &str) -> Option<Self> {
        if let Some((prefix, value)) = data.split_once(':') {
            return match prefix {
                "ack" => value.parse().ok().map(|id| Self::Ack(Some(id))),
                "clear" => value.parse().ok().map(|kind| Self::Clear(Some(kind))),
                "confirm" => Some(Self::Confirm(value.to_string())),
                "cancel" => Some(Self::Cancel(value.to_string())),
                _ => None,
            };
        }
        match data {
            "menu" => Some(Self::Start),
            "help" => Some(Self::Help),
            "status" => Some(Self::Status),
            "cpu" => Some(Self::Cpu),
            "memory" => Some(Self::Memory),
            "disk" => Some(Self::Disk),
            "network" => Some(Self::Network),
            "top" => Some(Self::Top),
            "temp" => Some(Self::Temp),
            "uptime" => Some(Self::Uptime),
            "services" => Some(Self::Services),
            "alerts" => Some(Self::Alerts),
            "check" => Some(Self::CheckNow),
            "clear" => Some(Self::Clear(None)),
            "subscribe" => Some(Self::Subscribe),
            "unsubscribe" => Some(Self::Unsubscribe),
            "docker" => Some(Self::Docker),
            "docker_stats" => Some(Self::DockerStats),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Help => "help",
            Self::Status => "status",
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Network => "network",
            Self::Top => "top",
            Self::Temp => "temp",
            Self::Uptime => "uptime",
            Self::Services => "services",
            Self::Alerts => "alerts",
            Self::CheckNow => "check",
            Self::Ack(_) => "ack",
            Self::Clear(_) => "clear",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Docker => "docker",
            Self::DockerStats => "docker_stats",
            Self::DockerLogs(_) => "docker_logs",
            Self::Container(ContainerOp::Restart, _) => "docker_restart",
            Self::Container(ContainerOp::Stop, _) => "docker_stop",
            Self::Container(ContainerOp::Start, _) => "docker_start",
            Self::Power(PowerOp::Reboot) => "reboot",
            Self::Power(PowerOp::Shutdown) => "shutdown",
            Self::Confirm(_) => "confirm",
            Self::Cancel(_) => "cancel",
            Self::Invalid(_) => "invalid",
        }
    }

    /// Ack answers go to a new message so the acknowledged alert stays readable.
    fn edits_in_place(&self) -> bool {
        !matches!(self, Self::Ack(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOp {
    Container(ContainerOp, String),
    Power(PowerOp),
}

impl PendingOp {
    fn describe(&self) -> String {
        match self {
            Self::Container(op, name) => {
                format!("{} container <b>{}</b>", op, teloxide::utils::html::escape(name))
            }
            Self::Power(op) => format!("<b>{op}</b> the host"),
        }
    }
}

#[derive(Debug)]
struct Pending {
    op: PendingOp,
    user_id: u64,
    chat_id: i64,
    created_at: i64,
}

/// Single-use tokens for privileged actions awaiting confirmation.
#[derive(Debug)]
pub struct ConfirmationBook {
    ttl_secs: i64,
    next_seq: u64,
    pending: HashMap<String, Pending>,
}

impl ConfirmationBook {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl_secs: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
            next_seq: 1,
            pending: HashMap::new(),
        }
    }

    pub fn issue(&mut self, op: PendingOp, user_id: u64, chat_id: i64, now: i64) -> String {
        self.purge(now);
        let token = format!("{:x}{:04x}", now.max(0), self.next_seq);
        self.next_seq += 1;
        self.pending.insert(
            token.clone(),
            Pending {
                op,
                user_id,
                chat_id,
                created_at: now,
            },
        );
        token
    }

    pub fn take(&mut self, token: &str, user_id: u64, now: i64) -> Result<PendingOp, ConfirmError> {
        let entry = self.pending.get(token).ok_or(ConfirmError::Unknown)?;
        if entry.user_id != user_id {
            return Err(ConfirmError::WrongUser);
        }
        let entry = self.pending.remove(token).ok_or(ConfirmError::Unknown)?;
        if now - entry.created_at >= self.ttl_secs {
            return Err(ConfirmError::Expired);
        }
        debug!(chat_id = entry.chat_id, user_id, "confirmation accepted");
        Ok(entry.op)
    }

    pub fn cancel(&mut self, token: &str, user_id: u64) -> Result<PendingOp, ConfirmError> {
        let entry = self.pending.get(token).ok_or(ConfirmError::Unknown)?;
        if entry.user_id != user_id {
            return Err(ConfirmError::WrongUser);
        }
        self.pending
            .remove(token)
            .map(|p| p.op)
            .ok_or(ConfirmError::Unknown)
    }

    fn purge(&mut self, now: i64) {
        let ttl = self.ttl_secs;
        self.pending.retain(|_, p| now - p.created_at < ttl);
    }
}

/// Rendered answer to an action; the optional chart follows the text.
#[derive(Debug)]
struct Reply {
    text: String,
    keyboard: Option<InlineKeyboardMarkup>,
    chart: Option<(Vec<u8>, String)>,
}

impl Reply {
    fn text(text: String, keyboard: InlineKeyboardMarkup) -> Self {
        Self {
            text,
            keyboard: Some(keyboard),
            chart: None,
        }
    }

    fn with_chart(mut self, png: Option<Vec<u8>>, caption: &str) -> Self {
        self.chart = png.map(|png| (png, caption.to_string()));
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct ActionContext {
    user_id: u64,
    chat_id: i64,
}

/// Sends alerts as HTML messages with an acknowledge button.
#[derive(Clone)]
pub struct TelegramSink {
    bot: Bot,
}

impl TelegramSink {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

impl AlertSink for TelegramSink {
    async fn deliver(&self, recipient: i64, alert: &Alert) -> Result<(), DeliveryError> {
        self.bot
            .send_message(ChatId(recipient), format::format_alert(alert))
            .parse_mode(ParseMode::Html)
            .reply_markup(alert_keyboard(alert.id))
            .await?;
        Ok(())
    }
}

pub struct BotDeps {
    pub cfg: Arc<Config>,
    pub monitor: Arc<HealthMonitor<TelegramSink>>,
    pub source: Arc<SysinfoSource>,
    pub docker: Arc<DockerClient>,
    pub host: Arc<HostControl>,
    pub pipeline: Arc<Pipeline>,
}

#[derive(Clone)]
struct TelegramRuntime {
    cfg: Arc<Config>,
    monitor: Arc<HealthMonitor<TelegramSink>>,
    source: Arc<SysinfoSource>,
    docker: Arc<DockerClient>,
    host: Arc<HostControl>,
    pipeline: Arc<Pipeline>,
    confirmations: Arc<Mutex<ConfirmationBook>>,
    metrics: Option<Arc<Metrics>>,
}

pub async fn run_bot(
    bot: Bot,
    deps: BotDeps,
    metrics: Option<Arc<Metrics>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TelegramError> {
    let runtime = TelegramRuntime {
        confirmations: Arc::new(Mutex::new(ConfirmationBook::new(
            deps.cfg.host.confirmation_ttl_secs,
        ))),
        cfg: deps.cfg,
        monitor: deps.monitor,
        source: deps.source,
        docker: deps.docker,
        host: deps.host,
        pipeline: deps.pipeline,
        metrics,
    };

    if let Err(err) = bot.set_my_commands(bot_commands()).await {
        warn!(error = %err, "failed to register bot commands");
    }

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![runtime])
        .build();

    let mut dispatch_handle = tokio::spawn(async move {
        dispatcher.dispatch().await;
    });

    tokio::select! {
        _ = shutdown.changed() => {
            dispatch_handle.abort();
            let _ = (&mut dispatch_handle).await;
            info!("telegram bot stopped");
            Ok(())
        }
        result = &mut dispatch_handle => {
            match result {
                Ok(()) => Ok(()),
                Err(join_err) if join_err.is_cancelled() => Ok(()),
                Err(join_err) => {
                    warn!(error = %join_err, "telegram dispatcher task failed");
                    Ok(())
                }
            }
        }
    }
}

async fn handle_message(bot: Bot, msg: Message, runtime: TelegramRuntime) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(action) = Action::from_message(text) else {
        return Ok(());
    };
    let user_id = msg.from().map(|u| u.id.0);
    let chat_id = msg.chat.id;

    let request = Request {
        user_id,
        chat_id: chat_id.0,
        action: action.label(),
        now_unix: now_unix(),
    };
    match runtime.pipeline.run(&request) {
        Outcome::Proceed => {}
        Outcome::Rejected { reply, .. } => {
            if let Some(text) = reply {
                send_html(&bot, chat_id, text, None).await?;
            }
            return Ok(());
        }
    }

    if let Err(err) = bot.send_chat_action(chat_id, ChatAction::Typing).await {
        debug!(error = %err, "typing indicator failed");
    }

    let ctx = ActionContext {
        user_id: user_id.unwrap_or_default(),
        chat_id: chat_id.0,
    };
    let reply = execute(action, ctx, &runtime).await;
    deliver_reply(&bot, chat_id, None, reply).await
}

async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    runtime: TelegramRuntime,
) -> ResponseResult<()> {
    let action = q.data.as_deref().and_then(Action::from_callback);
    let (Some(action), Some(message)) = (action, q.message.as_ref()) else {
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    };
    let chat_id = message.chat.id;
    let message_id = message.id;

    let request = Request {
        user_id: Some(q.from.id.0),
        chat_id: chat_id.0,
        action: action.label(),
        now_unix: now_unix(),
    };
    if let Outcome::Rejected { reply, .. } = runtime.pipeline.run(&request) {
        bot.answer_callback_query(q.id).await?;
        if let Some(text) = reply {
            send_html(&bot, chat_id, text, None).await?;
        }
        return Ok(());
    }

    bot.answer_callback_query(q.id.clone()).await?;

    let ctx = ActionContext {
        user_id: q.from.id.0,
        chat_id: chat_id.0,
    };
    let edit = action.edits_in_place().then_some(message_id);
    let reply = execute(action, ctx, &runtime).await;
    deliver_reply(&bot, chat_id, edit, reply).await
}

async fn execute(action: Action, ctx: ActionContext, runtime: &TelegramRuntime) -> Reply {
    let label = action.label();
    match run_action(action, ctx, runtime).await {
        Ok(reply) => reply,
        Err(err) => {
            warn!(action = label, chat_id = ctx.chat_id, error = %err, "action failed");
            Reply::text(format::error_reply(&err), back_menu())
        }
    }
}

async fn run_action(
    action: Action,
    ctx: ActionContext,
    runtime: &TelegramRuntime,
) -> Result<Reply, ActionError> {
    let cfg = &runtime.cfg;
    let settle = cfg.alerts.cpu_settle();
    let charts_cfg = cfg.charts;

    match action {
        Action::Start => Ok(Reply::text(format::welcome_text(), main_menu())),
        Action::Help => Ok(Reply::text(format::help_text(), back_menu())),
        Action::Status => {
            let cpu = blocking(runtime.source.clone(), move |s| s.sample_cpu(settle)).await?;
            let memory = blocking(runtime.source.clone(), |s| s.sample_memory()).await?;
            let mount = cfg.alerts.disk_mount.clone();
            let disk = blocking(runtime.source.clone(), move |s| s.sample_disk(&mount)).await?;
            let host = blocking(runtime.source.clone(), |s| s.host_overview()).await?;
            Ok(Reply::text(
                format::format_status(&cpu, &memory, &disk, &host),
                view_menu("status"),
            ))
        }
        Action::Cpu => {
            let cpu = blocking(runtime.source.clone(), move |s| s.sample_cpu(settle)).await?;
            let png = render_chart(charts::cpu_chart(&cpu), charts_cfg).await;
            Ok(Reply::text(format::format_cpu(&cpu), view_menu("cpu")).with_chart(png, "CPU usage"))
        }
        Action::Memory => {
            let memory = blocking(runtime.source.clone(), |s| s.sample_memory()).await?;
            let png = render_chart(charts::memory_chart(&memory), charts_cfg).await;
            Ok(Reply::text(format::format_memory(&memory), view_menu("memory"))
                .with_chart(png, "Memory usage"))
        }
        Action::Disk => {
            let disks = blocking(runtime.source.clone(), |s| s.disks()).await?;
            let png = if disks.is_empty() {
                None
            } else {
                render_chart(charts::disk_chart(&disks), charts_cfg).await
            };
            Ok(
                Reply::text(format::format_disks(&disks, &cfg.alerts.disk_mount), view_menu("disk"))
                    .with_chart(png, "Disk usage"),
            )
        }
        Action::Network => {
            let ifaces = blocking(runtime.source.clone(), |s| s.networks()).await?;
            Ok(Reply::text(format::format_network(&ifaces), view_menu("network")))
        }
        Action::Top => {
            let procs = blocking(runtime.source.clone(), move |s| {
                s.top_processes(TOP_PROCESS_LIMIT, settle)
            })
            .await?;
            let png = if procs.is_empty() {
                None
            } else {
                render_chart(charts::process_chart(&procs), charts_cfg).await
            };
            Ok(Reply::text(format::format_top(&procs), view_menu("top"))
                .with_chart(png, "Top processes"))
        }
        Action::Temp => {
            let temps = blocking(runtime.source.clone(), |s| s.temperatures()).await?;
            Ok(Reply::text(format::format_temperatures(&temps), view_menu("temp")))
        }
        Action::Uptime => {
            let host = blocking(runtime.source.clone(), |s| s.host_overview()).await?;
            Ok(Reply::text(format::format_uptime(&host), view_menu("uptime")))
        }
        Action::Services => {
            let services = runtime.host.services_status().await;
            Ok(Reply::text(format::format_services(&services), view_menu("services")))
        }
        Action::Alerts => alerts_page(ctx, runtime).await,
        Action::CheckNow => {
            let report = runtime.monitor.evaluate_once().await;
            Ok(Reply::text(format::format_tick_report(&report), alerts_menu(&report.alerts)))
        }
        Action::Ack(None) => Ok(Reply::text(
            "Usage: <code>/ack &lt;id&gt;</code>. Alert ids are listed in /alerts.".to_string(),
            back_menu(),
        )),
        Action::Ack(Some(id)) => {
            let (acked, active) = {
                let mut engine = runtime.monitor.engine().lock().await;
                (engine.acknowledge(id), engine.active_count())
            };
            update_active_gauge(runtime, active);
            let text = match acked {
                Some(alert) => format!(
                    "✅ Alert <code>#{}</code> ({}) acknowledged.",
                    alert.id,
                    alert.kind.label()
                ),
                None => format!("Alert <code>#{id}</code> is not active."),
            };
            Ok(Reply::text(text, alerts_shortcut()))
        }
        Action::Clear(kind) => {
            let (removed, active) = {
                let mut engine = runtime.monitor.engine().lock().await;
                (engine.clear(kind), engine.active_count())
            };
            update_active_gauge(runtime, active);
            let scope = kind.map(|k| format!(" {}", k.label())).unwrap_or_default();
            Ok(Reply::text(
                format!("🧹 Cleared {removed} active{scope} alert(s)."),
                alerts_shortcut(),
            ))
        }
        Action::Subscribe => {
            let added = runtime.monitor.notifier().register(ctx.chat_id).await;
            let text = if added {
                "🔔 This chat will now receive alerts."
            } else {
                "This chat already receives alerts."
            };
            Ok(Reply::text(text.to_string(), alerts_shortcut()))
        }
        Action::Unsubscribe => {
            let removed = runtime.monitor.notifier().unregister(ctx.chat_id).await;
            let text = if removed {
                "🔕 This chat will no longer receive alerts."
            } else {
                "This chat was not receiving alerts."
            };
            Ok(Reply::text(text.to_string(), alerts_shortcut()))
        }
        Action::Docker => {
            let containers = runtime.docker.list_containers(true).await?;
            Ok(Reply::text(format::format_containers(&containers), docker_menu()))
        }
        Action::DockerStats => {
            let stats = runtime.docker.container_stats().await?;
            let png = if stats.is_empty() {
                None
            } else {
                render_chart(charts::container_chart(&stats), charts_cfg).await
            };
            Ok(Reply::text(format::format_container_stats(&stats), docker_menu())
                .with_chart(png, "Container usage"))
        }
        Action::DockerLogs(None) => Ok(Reply::text(
            "Usage: <code>/docker_logs &lt;name&gt;</code>".to_string(),
            docker_menu(),
        )),
        Action::DockerLogs(Some(name)) => {
            let logs = runtime
                .docker
                .logs(&name, runtime.docker.log_lines())
                .await?;
            Ok(Reply::text(format::format_logs(&name, &logs), docker_menu()))
        }
        Action::Container(op, None) => Ok(Reply::text(
            format!("Usage: <code>/docker_{op} &lt;name&gt;</code>"),
            docker_menu(),
        )),
        Action::Container(op, Some(name)) => {
            validate_container_name(&name)?;
            request_confirmation(PendingOp::Container(op, name), ctx, runtime).await
        }
        Action::Power(op) => {
            if !runtime.host.power_enabled() {
                return Ok(Reply::text(
                    "⛔️ Power actions are disabled in the configuration.".to_string(),
                    back_menu(),
                ));
            }
            request_confirmation(PendingOp::Power(op), ctx, runtime).await
        }
        Action::Confirm(token) => {
            let op = runtime
                .confirmations
                .lock()
                .await
                .take(&token, ctx.user_id, now_unix())?;
            info!(user_id = ctx.user_id, chat_id = ctx.chat_id, op = ?op, "privileged action confirmed");
            run_confirmed(op, runtime).await
        }
        Action::Cancel(token) => {
            let op = runtime
                .confirmations
                .lock()
                .await
                .cancel(&token, ctx.user_id)?;
            Ok(Reply::text(
                format!("❎ Cancelled: {}.", op.describe()),
                back_menu(),
            ))
        }
        Action::Invalid(message) => Ok(Reply::text(
            format!("⚠️ {}", teloxide::utils::html::escape(&message)),
            back_menu(),
        )),
    }
}

async fn alerts_page(ctx: ActionContext, runtime: &TelegramRuntime) -> Result<Reply, ActionError> {
    let (rules, summary, active) = {
        let engine = runtime.monitor.engine().lock().await;
        let rules: Vec<_> = AlertKind::ALL
            .into_iter()
            .map(|kind| (kind, engine.rule(kind)))
            .collect();
        (rules, engine.summary(), engine.active_alerts())
    };
    let subscribed = runtime
        .monitor
        .notifier()
        .recipients()
        .contains(ctx.chat_id)
        .await;
    Ok(Reply::text(
        format::format_alerts_page(&rules, &summary, &active, subscribed),
        alerts_menu(&active),
    ))
}

async fn request_confirmation(
    op: PendingOp,
    ctx: ActionContext,
    runtime: &TelegramRuntime,
) -> Result<Reply, ActionError> {
    let description = op.describe();
    let token = runtime
        .confirmations
        .lock()
        .await
        .issue(op, ctx.user_id, ctx.chat_id, now_unix());
    let ttl = format::human_duration(runtime.cfg.host.confirmation_ttl_secs);
    Ok(Reply::text(
        format!("⚠️ Are you sure you want to {description}?\n\nThis request expires in {ttl}."),
        confirm_menu(&token),
    ))
}

async fn run_confirmed(op: PendingOp, runtime: &TelegramRuntime) -> Result<Reply, ActionError> {
    match op {
        PendingOp::Container(op, name) => {
            runtime.docker.execute(op, &name).await?;
            Ok(Reply::text(
                format!(
                    "✅ Container <b>{}</b> {}.",
                    teloxide::utils::html::escape(&name),
                    op.past_tense()
                ),
                docker_menu(),
            ))
        }
        PendingOp::Power(op) => {
            runtime.host.power(op).await?;
            let text = match op {
                PowerOp::Reboot => "♻️ Reboot initiated.",
                PowerOp::Shutdown => "⏻ Shutdown initiated.",
            };
            Ok(Reply::text(text.to_string(), back_menu()))
        }
    }
}

fn update_active_gauge(runtime: &TelegramRuntime, active: usize) {
    if let Some(metrics) = &runtime.metrics {
        metrics.set_active_alerts(active);
    }
}

async fn render_chart(chart: BarChart, size: ChartsConfig) -> Option<Vec<u8>> {
    let title = chart.title.clone();
    match tokio::task::spawn_blocking(move || chart.render_png(size.width, size.height)).await {
        Ok(Ok(png)) => Some(png),
        Ok(Err(err)) => {
            warn!(chart = %title, error = %err, "chart rendering failed");
            None
        }
        Err(err) => {
            warn!(chart = %title, error = %err, "chart task failed");
            None
        }
    }
}

async fn deliver_reply(
    bot: &Bot,
    chat_id: ChatId,
    edit: Option<MessageId>,
    reply: Reply,
) -> ResponseResult<()> {
    let Reply {
        text,
        keyboard,
        chart,
    } = reply;

    let edited = match edit {
        Some(message_id) => {
            let mut req = bot
                .edit_message_text(chat_id, message_id, text.clone())
                .parse_mode(ParseMode::Html);
            if let Some(kb) = keyboard.clone() {
                req = req.reply_markup(kb);
            }
            match req.await {
                Ok(_) => true,
                Err(RequestError::Api(ApiError::MessageNotModified)) => true,
                Err(err) => {
                    debug!(error = %err, "message edit failed, sending a new one");
                    false
                }
            }
        }
        None => false,
    };
    if !edited {
        send_html(bot, chat_id, text, keyboard).await?;
    }

    if let Some((png, caption)) = chart {
        bot.send_photo(chat_id, InputFile::memory(png).file_name("chart.png"))
            .caption(caption)
            .await?;
    }
    Ok(())
}

async fn send_html(
    bot: &Bot,
    chat_id: ChatId,
    text: String,
    keyboard: Option<InlineKeyboardMarkup>,
) -> ResponseResult<Message> {
    let mut req = bot.send_message(chat_id, text).parse_mode(ParseMode::Html);
    if let Some(kb) = keyboard {
        req = req.reply_markup(kb);
    }
    req.await
}

fn bot_commands() -> Vec<BotCommand> {
    [
        ("status", "System overview"),
        ("cpu", "CPU usage"),
        ("memory", "Memory usage"),
        ("disk", "Disk usage"),
        ("network", "Network interfaces"),
        ("top", "Top processes"),
        ("temp", "Temperatures"),
        ("uptime", "Uptime"),
        ("services", "Service status"),
        ("alerts", "Alerts and thresholds"),
        ("check", "Run health check now"),
        ("docker", "Containers"),
        ("docker_stats", "Container stats"),
        ("help", "All commands"),
    ]
    .into_iter()
    .map(|(cmd, desc)| BotCommand::new(cmd, desc))
    .collect()
}

fn button(text: &str, data: impl Into<String>) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(text.to_string(), data.into())
}

fn main_menu() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![button("📊 System Status", "status")],
        vec![button("🖥 CPU", "cpu"), button("🧠 Memory", "memory")],
        vec![button("💾 Disk", "disk"), button("🌐 Network", "network")],
        vec![button("⚙️ Processes", "top"), button("🌡 Temperature", "temp")],
        vec![button("⏱ Uptime", "uptime"), button("🛠 Services", "services")],
        vec![button("🔔 Alerts", "alerts"), button("🐳 Docker", "docker")],
        vec![button("❓ Help", "help")],
    ])
}

fn back_menu() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![button("« Menu", "menu")]])
}

fn view_menu(refresh: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        button("🔄 Refresh", refresh),
        button("« Menu", "menu"),
    ]])
}

fn alerts_shortcut() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        button("🔔 Alerts", "alerts"),
        button("« Menu", "menu"),
    ]])
}

fn alerts_menu(active: &[Alert]) -> InlineKeyboardMarkup {
    let mut rows = vec![vec![
        button("🔍 Check now", "check"),
        button("🧹 Clear all", "clear"),
    ]];
    let acks: Vec<_> = active
        .iter()
        .rev()
        .take(format::ALERTS_PAGE_LIMIT)
        .map(|a| button(&format!("✅ #{}", a.id), format!("ack:{}", a.id)))
        .collect();
    if !acks.is_empty() {
        rows.push(acks);
    }
    rows.push(vec![button("🔄 Refresh", "alerts"), button("« Menu", "menu")]);
    InlineKeyboardMarkup::new(rows)
}

fn docker_menu() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            button("🐳 Containers", "docker"),
            button("📊 Stats", "docker_stats"),
        ],
        vec![button("« Menu", "menu")],
    ])
}

fn confirm_menu(token: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        button("✅ Confirm", format!("confirm:{token}")),
        button("❌ Cancel", format!("cancel:{token}")),
    ]])
}

fn alert_keyboard(alert_id: u64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![button(
        "✅ Acknowledge",
        format!("ack:{alert_id}"),
    )]])
}
