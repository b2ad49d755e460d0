use axum::{
    extract::{Json, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use dq_guard_core::error::EngineError;
use dq_guard_core::health;
use dq_guard_core::metrics::METRICS;
use dq_guard_core::rule::{RuleId, RuleSpec};
use dq_guard_core::IncidentEngine;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

pub type SharedEngine = Arc<IncidentEngine>;

/// API key authentication. Without keys every request is let through.
#[derive(Clone)]
pub struct ApiKeyAuth {
    keys: HashSet<String>,
}

impl ApiKeyAuth {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys: keys.into_iter().filter(|k| !k.is_empty()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn validate(&self, api_key: &str) -> bool {
        self.keys.contains(api_key)
    }
}

pub async fn auth_middleware(
    State(auth): State<ApiKeyAuth>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<axum::response::Response, StatusCode> {
    if auth.is_empty() {
        return Ok(next.run(request).await);
    }

    let api_key = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !auth.validate(api_key) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}

pub struct DqGuardServer {
    engine: SharedEngine,
    api_auth: ApiKeyAuth,
}

impl DqGuardServer {
    pub fn new(engine: SharedEngine, api_keys: Vec<String>) -> Self {
        Self {
            engine,
            api_auth: ApiKeyAuth::new(api_keys),
        }
    }

    pub fn router(&self) -> Router {
        let public_routes = Router::new()
            .route("/health", get(handle_health))
            .route("/metrics", get(handle_metrics));

        let protected_routes = Router::new()
            .route("/api/v1/impact", get(handle_impact))
            .route("/api/v1/checks", get(handle_checks))
            .route("/api/v1/summary", get(handle_summary))
            .route("/api/v1/rules", get(handle_rules).post(handle_create_rule))
            .route(
                "/api/v1/rules/:rule_id",
                put(handle_replace_rule)
                    .delete(handle_delete_rule)
                    .get(handle_get_rule),
            )
            .route("/api/v1/rules/:rule_id/evaluate", post(handle_evaluate_one))
            .route("/api/v1/preview", get(handle_preview))
            .route("/api/v1/refresh", post(handle_refresh))
            .route("/api/v1/evaluate", post(handle_evaluate_all))
            .layer(axum::middleware::from_fn_with_state(
                self.api_auth.clone(),
                auth_middleware,
            ));

        Router::new()
            .merge(public_routes)
            .merge(protected_routes)
            .with_state(self.engine.clone())
    }

    pub async fn run(self, port: u16) -> anyhow::Result<()> {
        if self.api_auth.is_empty() {
            warn!("No API keys configured, the rule API is unauthenticated");
        }
        let app = self.router();

        let addr = format!("0.0.0.0:{}", port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("dqguard server running on http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(self.engine.clone()))
            .await?;

        info!("dqguard server shut down gracefully");
        Ok(())
    }
}

fn error_response(err: EngineError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::RuleNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Fetch(_) => StatusCode::BAD_GATEWAY,
        EngineError::Config(_) | EngineError::Audit(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() })))
}

fn parse_rule_id(raw: &str) -> Result<RuleId, (StatusCode, Json<Value>)> {
    raw.parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "Invalid rule id", "rule_id": raw })),
        )
    })
}

async fn handle_health(State(engine): State<SharedEngine>) -> impl IntoResponse {
    let snapshot = engine.snapshot();
    let health = serde_json::json!({
        "status": "healthy",
        "engine": {
            "rules": engine.rules().len(),
            "snapshot_version": snapshot.version,
            "refreshed_at": snapshot.refreshed_at,
            "checks": snapshot.outcomes.len(),
            "workflows": snapshot.impact.len(),
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    (StatusCode::OK, Json(health))
}

async fn handle_metrics() -> String {
    METRICS.to_prometheus()
}

#[derive(Deserialize)]
struct ImpactQuery {
    #[serde(default)]
    q: String,
}

async fn handle_impact(
    State(engine): State<SharedEngine>,
    Query(query): Query<ImpactQuery>,
) -> impl IntoResponse {
    let snapshot = engine.snapshot();
    let pairs = snapshot.impact.search(&query.q);
    Json(serde_json::json!({
        "workflows": snapshot.impact.workflows(),
        "pairs": pairs,
    }))
}

async fn handle_checks(State(engine): State<SharedEngine>) -> impl IntoResponse {
    let snapshot = engine.snapshot();
    Json(serde_json::json!({
        "snapshot_version": snapshot.version,
        "checks": snapshot.outcomes.outcomes(),
    }))
}

#[derive(Deserialize)]
struct SummaryQuery {
    /// Comma-separated labels; rows with any of them are kept.
    #[serde(default)]
    labels: Option<String>,
}

async fn handle_summary(
    State(engine): State<SharedEngine>,
    Query(query): Query<SummaryQuery>,
) -> impl IntoResponse {
    let snapshot = engine.snapshot();
    let selected: Vec<String> = query
        .labels
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    let rows = health::filter_by_labels(&snapshot.rows, &selected);

    Json(serde_json::json!({
        "summary": health::summarize(&rows),
        "tables": health::by_table(&rows),
        "labels": health::all_labels(&snapshot.rows),
    }))
}

async fn handle_rules(State(engine): State<SharedEngine>) -> impl IntoResponse {
    let rules = engine.rules();
    Json(serde_json::json!({ "rules": rules.as_slice() }))
}

async fn handle_get_rule(
    State(engine): State<SharedEngine>,
    Path(rule_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let id = match parse_rule_id(&rule_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match engine.get_rule(id) {
        Some(rule) => (StatusCode::OK, Json(serde_json::json!({ "rule": rule }))),
        None => error_response(EngineError::RuleNotFound(id)),
    }
}

async fn handle_create_rule(
    State(engine): State<SharedEngine>,
    Json(spec): Json<RuleSpec>,
) -> (StatusCode, Json<Value>) {
    match engine.add_rule(spec).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "message": "Rule created successfully",
                "rule": engine.get_rule(id),
            })),
        ),
        Err(e) => error_response(e),
    }
}

async fn handle_replace_rule(
    State(engine): State<SharedEngine>,
    Path(rule_id): Path<String>,
    Json(spec): Json<RuleSpec>,
) -> (StatusCode, Json<Value>) {
    let id = match parse_rule_id(&rule_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match engine.replace_rule(id, spec).await {
        Ok(rule) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "message": "Rule replaced successfully",
                "rule": rule,
            })),
        ),
        Err(e) => error_response(e),
    }
}

async fn handle_delete_rule(
    State(engine): State<SharedEngine>,
    Path(rule_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let id = match parse_rule_id(&rule_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match engine.remove_rule(id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "message": "Rule deleted successfully",
                "rule_id": id,
            })),
        ),
        Err(e) => error_response(e),
    }
}

async fn handle_refresh(State(engine): State<SharedEngine>) -> (StatusCode, Json<Value>) {
    match engine.refresh().await {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "snapshot_version": snapshot.version,
                "checks": snapshot.outcomes.len(),
                "workflows": snapshot.impact.len(),
                "superseded_rows": snapshot.outcomes.superseded_rows(),
            })),
        ),
        Err(e) => error_response(e),
    }
}

async fn handle_evaluate_all(State(engine): State<SharedEngine>) -> impl IntoResponse {
    let results = engine.evaluate_all().await;
    Json(serde_json::json!({ "results": results }))
}

/// Which rules would fire against the current snapshot. Sends nothing.
async fn handle_preview(State(engine): State<SharedEngine>) -> impl IntoResponse {
    let evaluations = engine.preview_all();
    let fired = evaluations.iter().filter(|e| e.fired).count();
    Json(serde_json::json!({ "evaluations": evaluations, "fired": fired }))
}

async fn handle_evaluate_one(
    State(engine): State<SharedEngine>,
    Path(rule_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let id = match parse_rule_id(&rule_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match engine.evaluate_one(id).await {
        Ok(result) => (StatusCode::OK, Json(serde_json::json!({ "result": result }))),
        Err(e) => error_response(e),
    }
}

/// Resolves on Ctrl-C or SIGTERM. SIGHUP refreshes the snapshot instead.
async fn shutdown_signal(engine: SharedEngine) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::hangup()) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    while stream.recv().await.is_some() {
                        info!("SIGHUP received, refreshing snapshot...");
                        if let Err(e) = engine.refresh().await {
                            error!(error = %e, "Refresh on SIGHUP failed");
                        }
                    }
                });
            }
            Err(e) => warn!(error = %e, "Failed to install SIGHUP handler"),
        }
    }
    #[cfg(not(unix))]
    drop(engine);

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dq_guard_core::agent::{Alert, AlertSink};
    use dq_guard_core::dispatcher::ActionDispatcher;
    use dq_guard_core::error::TransportError;
    use dq_guard_core::outcome::{CheckOutcome, Outcome};
    use dq_guard_core::source::OutcomeBatch;

    struct Quiet;

    #[async_trait]
    impl AlertSink for Quiet {
        fn name(&self) -> &str {
            "quiet"
        }

        async fn send(&self, _target: &str, _alert: &Alert) -> Result<(), TransportError> {
            Ok(())
        }
    }

    async fn spawn(api_keys: Vec<String>) -> String {
        let engine = IncidentEngine::new(ActionDispatcher::new(Arc::new(Quiet)));
        engine.load_snapshot(
            OutcomeBatch::raw(vec![CheckOutcome::new(
                "row_count_check",
                "orders",
                Outcome::Fail,
                chrono::Utc::now(),
            )
            .with_labels("PII")]),
            None,
        );
        let app = DqGuardServer::new(Arc::new(engine), api_keys).router();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_api_key_required_when_configured() {
        let base = spawn(vec!["k1".into()]).await;
        let client = reqwest::Client::new();

        let denied = client.get(format!("{}/api/v1/rules", base)).send().await.unwrap();
        assert_eq!(denied.status().as_u16(), 401);

        let allowed = client
            .get(format!("{}/api/v1/rules", base))
            .header("X-API-Key", "k1")
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status().as_u16(), 200);

        let health = client.get(format!("{}/health", base)).send().await.unwrap();
        assert_eq!(health.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn test_rule_lifecycle_over_http() {
        let base = spawn(Vec::new()).await;
        let client = reqwest::Client::new();

        let created: Value = client
            .post(format!("{}/api/v1/rules", base))
            .json(&serde_json::json!({
                "check_name": "row_count_check",
                "desired_outcome": "fail",
                "action": "alert_only",
                "webhook_target": "https://hooks.example/x"
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = created["rule"]["id"].as_str().unwrap().to_string();

        let evaluated: Value = client
            .post(format!("{}/api/v1/rules/{}/evaluate", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(evaluated["result"]["fired"], true);
        assert_eq!(evaluated["result"]["alert_status"], "sent");
        assert_eq!(evaluated["result"]["termination_status"], "not_applicable");

        let deleted = client
            .delete(format!("{}/api/v1/rules/{}", base, id))
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status().as_u16(), 200);

        let again = client
            .delete(format!("{}/api/v1/rules/{}", base, id))
            .send()
            .await
            .unwrap();
        assert_eq!(again.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn test_preview_reports_without_dispatching() {
        let base = spawn(Vec::new()).await;
        let client = reqwest::Client::new();
        for check in ["row_count_check", "never_reported"] {
            client
                .post(format!("{}/api/v1/rules", base))
                .json(&serde_json::json!({
                    "check_name": check,
                    "desired_outcome": "fail",
                    "action": "alert_only"
                }))
                .send()
                .await
                .unwrap();
        }

        let preview: Value = client
            .get(format!("{}/api/v1/preview", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(preview["fired"], 1);
        assert_eq!(preview["evaluations"][0]["check_name"], "row_count_check");
        assert_eq!(preview["evaluations"][0]["fired"], true);
        assert_eq!(preview["evaluations"][1]["fired"], false);
        assert!(preview["evaluations"][0].get("alert_status").is_none());
    }

    #[tokio::test]
    async fn test_invalid_rule_is_bad_request() {
        let base = spawn(Vec::new()).await;
        let response = reqwest::Client::new()
            .post(format!("{}/api/v1/rules", base))
            .json(&serde_json::json!({
                "check_name": "row_count_check",
                "desired_outcome": "fail",
                "action": "alert_and_terminate"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn test_summary_and_refresh_without_source() {
        let base = spawn(Vec::new()).await;
        let client = reqwest::Client::new();

        let summary: Value = client
            .get(format!("{}/api/v1/summary?labels=PII", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(summary["summary"]["total_checks"], 1);
        assert_eq!(summary["summary"]["failed"], 1);

        let refresh = client
            .post(format!("{}/api/v1/refresh", base))
            .send()
            .await
            .unwrap();
        assert_eq!(refresh.status().as_u16(), 500);
    }
}
