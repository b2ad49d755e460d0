use async_trait::async_trait;
use dq_guard_core::agent::{Alert, AlertSink, TerminationResponse, WorkflowTerminator};
use dq_guard_core::error::TransportError;
use std::time::Duration;
use tracing::{debug, info, warn};

const TEMPLATE_NAME: &str = "alert";

fn http_client(timeout: Duration) -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .timeout(timeout)
        .build()
        .map_err(|e| TransportError::Request(format!("failed to build HTTP client: {}", e)))
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Request(err.to_string())
    }
}

/// Logs alerts instead of delivering them. Useful for dry runs.
pub struct LoggerAlertSink;

#[async_trait]
impl AlertSink for LoggerAlertSink {
    fn name(&self) -> &str {
        "logger"
    }

    async fn send(&self, target: &str, alert: &Alert) -> Result<(), TransportError> {
        info!(
            agent = self.name(),
            rule_id = %alert.rule_id,
            check_name = %alert.check_name,
            target = %target,
            text = %alert.text,
            "Alert"
        );
        Ok(())
    }
}

/// Posts `{"text": ...}` to the rule's webhook. Any non-2xx answer is a
/// failure; nothing is retried.
pub struct WebhookAlertSink {
    client: reqwest::Client,
    timeout: Duration,
    template: Option<handlebars::Handlebars<'static>>,
}

impl WebhookAlertSink {
    pub fn new(template: Option<String>, timeout: Duration) -> Result<Self, TransportError> {
        let compiled_template = template.and_then(|t| {
            let mut handlebars = handlebars::Handlebars::new();
            handlebars.set_strict_mode(true);
            handlebars.register_escape_fn(handlebars::no_escape);
            match handlebars.register_template_string(TEMPLATE_NAME, &t) {
                Ok(()) => Some(handlebars),
                Err(e) => {
                    warn!(error = %e, "Invalid alert template, using default text");
                    None
                }
            }
        });

        Ok(Self {
            client: http_client(timeout)?,
            timeout,
            template: compiled_template,
        })
    }

    /// Alert text, rendered from the template when one is configured.
    pub fn render(&self, alert: &Alert) -> String {
        let Some(template) = &self.template else {
            return alert.text.clone();
        };

        let context = serde_json::json!({
            "rule_id": alert.rule_id.to_string(),
            "check_name": alert.check_name,
            "table_name": alert.table_name,
            "outcome": alert.outcome.as_str(),
            "definition": alert.definition,
        });
        match template.render(TEMPLATE_NAME, &context) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(error = %e, rule_id = %alert.rule_id, "Template rendering failed, using default text");
                alert.text.clone()
            }
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, target: &str, alert: &Alert) -> Result<(), TransportError> {
        let payload = serde_json::json!({ "text": self.render(alert) });

        debug!(rule_id = %alert.rule_id, "Sending webhook");
        let response = self
            .client
            .post(target)
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Deletes workflows through the workspace resource API:
/// `DELETE {base}/poros/api/v1/workspaces/{workspace}/resources/workflow/{name}`.
pub struct HttpWorkflowTerminator {
    base_url: reqwest::Url,
    workspace: String,
    token: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpWorkflowTerminator {
    pub fn new(
        base_url: &str,
        workspace: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let base_url = reqwest::Url::parse(base_url)
            .map_err(|e| TransportError::Request(format!("invalid base url '{}': {}", base_url, e)))?;
        Ok(Self {
            base_url,
            workspace: workspace.into(),
            token,
            client: http_client(timeout)?,
            timeout,
        })
    }

    pub fn endpoint(&self, workflow_name: &str) -> Result<reqwest::Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::Request(format!("base url '{}' cannot hold a path", self.base_url)))?
            .pop_if_empty()
            .extend([
                "poros",
                "api",
                "v1",
                "workspaces",
                self.workspace.as_str(),
                "resources",
                "workflow",
                workflow_name,
            ]);
        Ok(url)
    }
}

#[async_trait]
impl WorkflowTerminator for HttpWorkflowTerminator {
    fn name(&self) -> &str {
        "workspace-api"
    }

    async fn terminate(&self, workflow_name: &str) -> Result<TerminationResponse, TransportError> {
        let url = self.endpoint(workflow_name)?;
        let mut request = self.client.delete(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        debug!(workflow = %workflow_name, workspace = %self.workspace, "Deleting workflow");
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(TerminationResponse { status, body })
    }
}
