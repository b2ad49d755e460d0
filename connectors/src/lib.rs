//! Upstream sources: the lineage service and the check-outcome store.

use async_trait::async_trait;
use dq_guard_core::config::{LineageConfig, OutcomeSourceConfig};
use dq_guard_core::error::FetchError;
use dq_guard_core::lineage::LineageGraph;
use dq_guard_core::outcome::CheckOutcome;
use dq_guard_core::source::{LineageSource, OutcomeBatch, OutcomeSource};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

fn http_client(timeout: Duration) -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .timeout(timeout)
        .build()
        .map_err(|e| FetchError::Unreachable(format!("failed to build HTTP client: {}", e)))
}

fn fetch_error(err: reqwest::Error, timeout: Duration) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(timeout)
    } else if err.is_decode() {
        FetchError::Decode(err.to_string())
    } else {
        FetchError::Unreachable(err.to_string())
    }
}

/// GETs `url` and returns the body of a 2xx answer. Any other status is a
/// fetch error carrying the body; it is never parsed.
async fn get_body(
    client: &reqwest::Client,
    url: reqwest::Url,
    token: Option<&str>,
    timeout: Duration,
) -> Result<String, FetchError> {
    let mut request = client.get(url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await.map_err(|e| fetch_error(e, timeout))?;

    let status = response.status();
    let body = response.text().await.map_err(|e| fetch_error(e, timeout))?;
    if !status.is_success() {
        return Err(FetchError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

fn decode_rows(raw: &str) -> Result<Vec<CheckOutcome>, FetchError> {
    serde_json::from_str(raw).map_err(|e| FetchError::Decode(e.to_string()))
}

/// Lineage of one table, fetched by fully-qualified name.
pub struct HttpLineageSource {
    endpoint: reqwest::Url,
    table_fqn: String,
    token: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpLineageSource {
    pub fn from_config(
        config: &LineageConfig,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let table_fqn = config.table_fqn();
        let mut endpoint = reqwest::Url::parse(&config.base_url)
            .map_err(|e| FetchError::Unreachable(format!("invalid lineage url: {}", e)))?;
        endpoint
            .path_segments_mut()
            .map_err(|_| FetchError::Unreachable("lineage url cannot hold a path".to_string()))?
            .pop_if_empty()
            .extend(["metis", "api", "v1", "lineage", "table", "name", table_fqn.as_str()]);
        endpoint
            .query_pairs_mut()
            .append_pair("upstreamDepth", &config.upstream_depth.to_string())
            .append_pair("downstreamDepth", &config.downstream_depth.to_string());

        Ok(Self {
            endpoint,
            table_fqn,
            token,
            client: http_client(timeout)?,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &reqwest::Url {
        &self.endpoint
    }

    pub fn table_fqn(&self) -> &str {
        &self.table_fqn
    }
}

#[async_trait]
impl LineageSource for HttpLineageSource {
    fn name(&self) -> &str {
        "lineage-api"
    }

    async fn fetch(&self) -> Result<LineageGraph, FetchError> {
        debug!(table = %self.table_fqn, "Fetching lineage");
        let body = get_body(
            &self.client,
            self.endpoint.clone(),
            self.token.as_deref(),
            self.timeout,
        )
        .await?;

        let value: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))?;
        let graph = LineageGraph::from_value(&value);
        info!(
            table = %self.table_fqn,
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "Lineage fetched"
        );
        Ok(graph)
    }
}

/// Outcome rows served as a JSON array over HTTP.
pub struct HttpOutcomeSource {
    url: reqwest::Url,
    ranked: bool,
    token: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpOutcomeSource {
    pub fn new(
        url: &str,
        ranked: bool,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| FetchError::Unreachable(format!("invalid outcome url: {}", e)))?;
        Ok(Self {
            url,
            ranked,
            token,
            client: http_client(timeout)?,
            timeout,
        })
    }
}

#[async_trait]
impl OutcomeSource for HttpOutcomeSource {
    fn name(&self) -> &str {
        "outcome-api"
    }

    async fn fetch(&self) -> Result<OutcomeBatch, FetchError> {
        let body = get_body(&self.client, self.url.clone(), self.token.as_deref(), self.timeout).await?;
        let rows = decode_rows(&body)?;
        debug!(rows = rows.len(), ranked = self.ranked, "Outcomes fetched");
        Ok(OutcomeBatch {
            rows,
            ranked: self.ranked,
        })
    }
}

/// Outcome rows read from a JSON array file, e.g. an export of the check
/// store.
pub struct FileOutcomeSource {
    path: PathBuf,
    ranked: bool,
}

impl FileOutcomeSource {
    pub fn new(path: impl Into<PathBuf>, ranked: bool) -> Self {
        Self {
            path: path.into(),
            ranked,
        }
    }
}

#[async_trait]
impl OutcomeSource for FileOutcomeSource {
    fn name(&self) -> &str {
        "outcome-file"
    }

    async fn fetch(&self) -> Result<OutcomeBatch, FetchError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| FetchError::Unreachable(format!("{}: {}", self.path.display(), e)))?;
        let rows = decode_rows(&raw)?;
        debug!(path = %self.path.display(), rows = rows.len(), "Outcomes loaded");
        Ok(OutcomeBatch {
            rows,
            ranked: self.ranked,
        })
    }
}

/// Outcome rows held in memory. `set` swaps what the next fetch returns,
/// including an error.
pub struct MemoryOutcomeSource {
    next: RwLock<Result<Vec<CheckOutcome>, FetchError>>,
    ranked: bool,
}

impl MemoryOutcomeSource {
    pub fn new(rows: Vec<CheckOutcome>) -> Self {
        Self {
            next: RwLock::new(Ok(rows)),
            ranked: false,
        }
    }

    pub fn ranked(mut self) -> Self {
        self.ranked = true;
        self
    }

    pub fn set(&self, next: Result<Vec<CheckOutcome>, FetchError>) {
        *self.next.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

#[async_trait]
impl OutcomeSource for MemoryOutcomeSource {
    fn name(&self) -> &str {
        "outcome-memory"
    }

    async fn fetch(&self) -> Result<OutcomeBatch, FetchError> {
        let rows = self
            .next
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        Ok(OutcomeBatch {
            rows,
            ranked: self.ranked,
        })
    }
}

/// Lineage graph held in memory.
pub struct MemoryLineageSource {
    next: RwLock<Result<LineageGraph, FetchError>>,
}

impl MemoryLineageSource {
    pub fn new(graph: LineageGraph) -> Self {
        Self {
            next: RwLock::new(Ok(graph)),
        }
    }

    pub fn set(&self, next: Result<LineageGraph, FetchError>) {
        *self.next.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

#[async_trait]
impl LineageSource for MemoryLineageSource {
    fn name(&self) -> &str {
        "lineage-memory"
    }

    async fn fetch(&self) -> Result<LineageGraph, FetchError> {
        self.next.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Builds the configured outcome source.
pub fn outcome_source(
    config: &OutcomeSourceConfig,
    token: Option<String>,
    timeout: Duration,
) -> Result<Arc<dyn OutcomeSource>, FetchError> {
    Ok(match config {
        OutcomeSourceConfig::Http { url, ranked, .. } => {
            Arc::new(HttpOutcomeSource::new(url, *ranked, token, timeout)?)
        }
        OutcomeSourceConfig::File { path, ranked, .. } => {
            Arc::new(FileOutcomeSource::new(path.clone(), *ranked))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use dq_guard_core::lineage::LineageGraphParser;
    use dq_guard_core::outcome::Outcome;
    use std::collections::HashMap;
    use std::io::Write;

    const LINEAGE: &str = r#"{
        "nodes": [
            {"id": "1", "type": "dataosJob", "fullyQualifiedName": "a.b.ingest_wf"},
            {"id": "2", "type": "table", "fullyQualifiedName": "icebase.icebase.retail.orders"}
        ],
        "downstreamEdges": [{"fromEntity": "1", "toEntity": "2"}]
    }"#;

    const ROWS: &str = r#"[
        {"check_name": "row_count_check", "table_name": "orders", "outcome": "FAIL",
         "definition": "row_count > 0", "observed_at": "2024-03-01T08:00:00Z"},
        {"check_name": "row_count_check", "table_name": "orders", "outcome": "pass",
         "observed_at": "2024-03-01T09:00:00Z", "labels": "PII"}
    ]"#;

    async fn lineage(
        Path(fqn): Path<String>,
        Query(params): Query<HashMap<String, String>>,
    ) -> (StatusCode, String) {
        let depth_ok = params.get("upstreamDepth").map(String::as_str) == Some("2")
            && params.get("downstreamDepth").map(String::as_str) == Some("3");
        if fqn == "icebase.icebase.retail.orders" && depth_ok {
            (StatusCode::OK, LINEAGE.to_string())
        } else {
            (StatusCode::NOT_FOUND, format!("no lineage for {}", fqn))
        }
    }

    async fn serve() -> String {
        let app = Router::new()
            .route("/metis/api/v1/lineage/table/name/:fqn", get(lineage))
            .route("/checks", get(|| async { ROWS }))
            .route("/garbage", get(|| async { "not json" }))
            .route(
                "/down",
                get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn lineage_config(base_url: &str, table: &str) -> LineageConfig {
        LineageConfig {
            base_url: base_url.to_string(),
            catalog: "icebase".into(),
            schema: "retail".into(),
            table: table.into(),
            upstream_depth: 2,
            downstream_depth: 3,
        }
    }

    #[tokio::test]
    async fn test_lineage_fetch_feeds_parser() {
        let base = serve().await;
        let source =
            HttpLineageSource::from_config(&lineage_config(&base, "orders"), None, Duration::from_secs(5))
                .unwrap();

        let graph = source.fetch().await.unwrap();
        let impact = LineageGraphParser::parse(&graph);
        assert!(impact.contains_workflow("ingest_wf"));
        assert!(impact
            .datasets("ingest_wf")
            .unwrap()
            .contains("icebase.icebase.retail.orders"));
    }

    #[tokio::test]
    async fn test_lineage_non_2xx_is_status_error() {
        let base = serve().await;
        let source =
            HttpLineageSource::from_config(&lineage_config(&base, "missing"), None, Duration::from_secs(5))
                .unwrap();

        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[test]
    fn test_lineage_endpoint_layout() {
        let source = HttpLineageSource::from_config(
            &lineage_config("https://ctx.example", "orders"),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            source.endpoint().as_str(),
            "https://ctx.example/metis/api/v1/lineage/table/name/icebase.icebase.retail.orders?upstreamDepth=2&downstreamDepth=3"
        );
    }

    #[tokio::test]
    async fn test_http_outcomes() {
        let base = serve().await;
        let source =
            HttpOutcomeSource::new(&format!("{}/checks", base), true, None, Duration::from_secs(5))
                .unwrap();

        let batch = source.fetch().await.unwrap();
        assert!(batch.ranked);
        assert_eq!(batch.rows.len(), 2);
        assert_eq!(batch.rows[0].outcome, Outcome::Fail);
        assert_eq!(batch.rows[1].labels.as_deref(), Some("PII"));
    }

    #[tokio::test]
    async fn test_http_outcome_errors() {
        let base = serve().await;
        let down = HttpOutcomeSource::new(&format!("{}/down", base), false, None, Duration::from_secs(5))
            .unwrap();
        assert_eq!(
            down.fetch().await.unwrap_err(),
            FetchError::Status {
                status: 503,
                body: "maintenance".into()
            }
        );

        let garbage =
            HttpOutcomeSource::new(&format!("{}/garbage", base), false, None, Duration::from_secs(5))
                .unwrap();
        assert!(matches!(garbage.fetch().await.unwrap_err(), FetchError::Decode(_)));
    }

    #[tokio::test]
    async fn test_file_outcomes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ROWS.as_bytes()).unwrap();

        let batch = FileOutcomeSource::new(file.path(), false).fetch().await.unwrap();
        assert!(!batch.ranked);
        assert_eq!(batch.rows.len(), 2);

        let missing = FileOutcomeSource::new("/nonexistent/outcomes.json", false);
        assert!(matches!(
            missing.fetch().await.unwrap_err(),
            FetchError::Unreachable(_)
        ));
    }

    #[tokio::test]
    async fn test_memory_sources_follow_set() {
        let outcomes = MemoryOutcomeSource::new(decode_rows(ROWS).unwrap()).ranked();
        let batch = outcomes.fetch().await.unwrap();
        assert!(batch.ranked);
        assert_eq!(batch.rows[0].outcome, Outcome::Fail);

        outcomes.set(Err(FetchError::Timeout(Duration::from_secs(1))));
        assert_eq!(
            outcomes.fetch().await.unwrap_err(),
            FetchError::Timeout(Duration::from_secs(1))
        );

        let value: serde_json::Value = serde_json::from_str(LINEAGE).unwrap();
        let lineage = MemoryLineageSource::new(LineageGraph::from_value(&value));
        let impact = LineageGraphParser::parse(&lineage.fetch().await.unwrap());
        assert!(impact.contains_workflow("ingest_wf"));

        lineage.set(Err(FetchError::Unreachable("down".into())));
        assert!(lineage.fetch().await.is_err());
    }
}
