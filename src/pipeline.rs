use crate::metrics::Metrics;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// What the stages see about an incoming chat update.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub user_id: Option<u64>,
    pub chat_id: i64,
    pub action: &'a str,
    pub now_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Reply(String),
    Drop,
}

pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn process(&self, req: &Request<'_>) -> Verdict;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Proceed,
    Rejected {
        stage: &'static str,
        reply: Option<String>,
    },
}

/// Ordered middleware stages, built once at startup.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    metrics: Option<Arc<Metrics>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn run(&self, req: &Request<'_>) -> Outcome {
        for stage in &self.stages {
            let reply = match stage.process(req) {
                Verdict::Continue => continue,
                Verdict::Reply(text) => Some(text),
                Verdict::Drop => None,
            };
            if let Some(metrics) = &self.metrics {
                metrics.inc_rejected(stage.name());
            }
            return Outcome::Rejected {
                stage: stage.name(),
                reply,
            };
        }
        Outcome::Proceed
    }
}

pub struct AuthorizationStage {
    allowed: HashSet<u64>,
}

impl AuthorizationStage {
    pub fn new(allowed: impl IntoIterator<Item = u64>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl Stage for AuthorizationStage {
    fn name(&self) -> &'static str {
        "authorization"
    }

    fn process(&self, req: &Request<'_>) -> Verdict {
        let Some(user_id) = req.user_id else {
            return Verdict::Drop;
        };
        if self.allowed.contains(&user_id) {
            return Verdict::Continue;
        }
        warn!(user_id, chat_id = req.chat_id, action = req.action, "unauthorized request");
        Verdict::Reply(format!(
            "🔒 <b>Access denied</b>\n\nYou are not authorized to use this bot.\nYour user ID: <code>{user_id}</code>"
        ))
    }
}

/// Sliding window of `limit` calls per `period_secs` for each user.
#[derive(Debug)]
struct RateLimiter {
    limit: u32,
    period_secs: i64,
    timestamps_by_user: HashMap<u64, VecDeque<i64>>,
}

impl RateLimiter {
    fn new(limit: u32, period_secs: u64) -> Self {
        Self {
            limit,
            period_secs: i64::try_from(period_secs).unwrap_or(i64::MAX),
            timestamps_by_user: HashMap::new(),
        }
    }

    /// `Err` carries the seconds until the oldest call leaves the window.
    fn allow(&mut self, user_id: u64, now_unix: i64) -> Result<(), i64> {
        let queue = self.timestamps_by_user.entry(user_id).or_default();
        while let Some(ts) = queue.front().copied() {
            if now_unix - ts >= self.period_secs {
                queue.pop_front();
            } else {
                break;
            }
        }

        if queue.len() >= self.limit as usize {
            let oldest = queue.front().copied().unwrap_or(now_unix);
            return Err((self.period_secs - (now_unix - oldest)).max(1));
        }

        queue.push_back(now_unix);
        Ok(())
    }
}

pub struct RateLimitStage {
    limiter: Mutex<RateLimiter>,
}

impl RateLimitStage {
    pub fn new(limit: u32, period_secs: u64) -> Self {
        Self {
            limiter: Mutex::new(RateLimiter::new(limit, period_secs)),
        }
    }
}

impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn process(&self, req: &Request<'_>) -> Verdict {
        let Some(user_id) = req.user_id else {
            return Verdict::Continue;
        };
        let result = match self.limiter.lock() {
            Ok(mut limiter) => limiter.allow(user_id, req.now_unix),
            Err(poisoned) => poisoned.into_inner().allow(user_id, req.now_unix),
        };
        match result {
            Ok(()) => Verdict::Continue,
            Err(wait_secs) => {
                warn!(user_id, wait_secs, "rate limit exceeded");
                Verdict::Reply(format!(
                    "⏳ Too many requests. Please wait {wait_secs} seconds."
                ))
            }
        }
    }
}

pub struct AuditStage {
    metrics: Option<Arc<Metrics>>,
}

impl AuditStage {
    pub fn new(metrics: Option<Arc<Metrics>>) -> Self {
        Self { metrics }
    }
}

impl Stage for AuditStage {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn process(&self, req: &Request<'_>) -> Verdict {
        info!(
            action = req.action,
            user_id = req.user_id.unwrap_or_default(),
            chat_id = req.chat_id,
            "handling request"
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc_request(req.action);
        }
        Verdict::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user_id: Option<u64>, now_unix: i64) -> Request<'static> {
        Request {
            user_id,
            chat_id: 10,
            action: "status",
            now_unix,
        }
    }

    fn pipeline() -> Pipeline {
        Pipeline::new()
            .with_stage(AuthorizationStage::new([42]))
            .with_stage(RateLimitStage::new(2, 60))
            .with_stage(AuditStage::new(None))
    }

    #[test]
    fn stages_run_in_declared_order() {
        assert_eq!(
            pipeline().stage_names(),
            vec!["authorization", "rate_limit", "audit"]
        );
    }

    #[test]
    fn unauthorized_user_gets_reply_with_id() {
        match pipeline().run(&request(Some(7), 0)) {
            Outcome::Rejected {
                stage,
                reply: Some(text),
            } => {
                assert_eq!(stage, "authorization");
                assert!(text.contains("Access denied"));
                assert!(text.contains("<code>7</code>"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn update_without_sender_is_dropped() {
        assert_eq!(
            pipeline().run(&request(None, 0)),
            Outcome::Rejected {
                stage: "authorization",
                reply: None
            }
        );
    }

    #[test]
    fn rate_limit_blocks_extra_calls_until_window_passes() {
        let pipeline = pipeline();
        assert_eq!(pipeline.run(&request(Some(42), 10)), Outcome::Proceed);
        assert_eq!(pipeline.run(&request(Some(42), 20)), Outcome::Proceed);
        match pipeline.run(&request(Some(42), 30)) {
            Outcome::Rejected {
                stage: "rate_limit",
                reply: Some(text),
            } => assert!(text.contains("wait 40 seconds")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(pipeline.run(&request(Some(42), 71)), Outcome::Proceed);
    }

    #[test]
    fn rate_limiter_tracks_users_separately() {
        let mut limiter = RateLimiter::new(1, 60);
        assert!(limiter.allow(1, 0).is_ok());
        assert!(limiter.allow(2, 0).is_ok());
        assert_eq!(limiter.allow(1, 59), Err(1));
        assert!(limiter.allow(1, 60).is_ok());
    }

    #[test]
    fn huge_period_keeps_limiting() {
        let mut limiter = RateLimiter::new(1, u64::MAX);
        assert!(limiter.allow(1, 0).is_ok());
        assert!(limiter.allow(1, 1_000_000).is_err());
    }

    #[test]
    fn rejections_are_counted_by_stage() {
        let metrics = Metrics::new().expect("metrics");
        let pipeline = Pipeline::new()
            .with_stage(AuthorizationStage::new([1]))
            .with_metrics(metrics.clone());
        pipeline.run(&request(Some(2), 0));
        let rejected = metrics
            .hostwatch_requests_rejected_total
            .with_label_values(&["authorization"])
            .get();
        assert_eq!(rejected, 1.0);
    }
}
