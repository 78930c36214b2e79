use crate::alerts::{Alert, Severity, SharedAlertEngine};
use crate::metrics::Metrics;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub engine: SharedAlertEngine,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiAlerts {
    pub active: Vec<Alert>,
    pub summary: BTreeMap<Severity, usize>,
}

pub fn build_router(metrics: Arc<Metrics>, engine: SharedAlertEngine) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/alerts", get(alerts_handler))
        .with_state(HttpAppState { metrics, engine })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn alerts_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let engine = state.engine.lock().await;
    Json(ApiAlerts {
        active: engine.active_alerts(),
        summary: engine.summary(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertEngine, AlertKind, AlertRule, AlertRules, MetricSample};
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn engine() -> SharedAlertEngine {
        let rule = AlertRule {
            threshold: 80.0,
            cooldown_secs: 60,
        };
        AlertEngine::new(AlertRules {
            cpu: rule,
            memory: rule,
            disk: rule,
        })
        .into_shared()
    }

    async fn get_text(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let metrics = Metrics::new().expect("metrics");
        let (status, body) = get_text(build_router(metrics, engine()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_contains_uptime_and_counts_scrapes() {
        let metrics = Metrics::new().expect("metrics");
        let app = build_router(metrics.clone(), engine());
        let (status, body) = get_text(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("hostwatch_uptime_seconds"));
        assert_eq!(metrics.hostwatch_scrape_count_total.get(), 1.0);
    }

    #[tokio::test]
    async fn api_alerts_lists_active_alerts() {
        let metrics = Metrics::new().expect("metrics");
        let engine = engine();
        engine
            .lock()
            .await
            .evaluate(&MetricSample::new(AlertKind::Disk, 97.0, 0))
            .expect("alert emitted");

        let (status, body) = get_text(build_router(metrics, engine), "/api/alerts").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["active"].as_array().map(Vec::len), Some(1));
        assert_eq!(json["active"][0]["kind"], "disk");
        assert_eq!(json["summary"]["critical"], 1);
        assert_eq!(json["summary"]["warning"], 0);
    }
}
