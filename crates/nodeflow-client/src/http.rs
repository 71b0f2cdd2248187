use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nodeflow_core::config::BackendConfig;
use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::template::{InputField, NodeTemplate};
use nodeflow_core::traits::{BuildService, TemplateMutationService};
use nodeflow_core::types::{BuildEvent, BuildRequest, EventDeliveryMode, MutationRequest, NodeId};

use crate::events;

/// Shared HTTP plumbing for both backend services.
#[derive(Clone)]
struct Backend {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    request_timeout: Duration,
}

impl Backend {
    fn new(config: &BackendConfig) -> Result<Self> {
        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        // No whole-request timeout on the client: build event streams stay open.
        let http = Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| NodeflowError::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            request_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("x-api-key", key),
            None => req,
        }
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorize(self.http.post(self.url(path)))
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.http.get(self.url(path)))
    }
}

/// Turn a non-2xx response into an error carrying the body.
async fn check(response: Response) -> std::result::Result<Response, String> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    Err(format!("HTTP {}: {}", status, body))
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    code: &'a str,
    template: &'a BTreeMap<String, InputField>,
    field: &'a str,
    field_value: serde_json::Value,
    tool_mode: bool,
}

/// Template mutation service backed by the component update endpoint.
pub struct HttpMutationService {
    backend: Backend,
}

impl HttpMutationService {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        Ok(Self {
            backend: Backend::new(config)?,
        })
    }
}

impl TemplateMutationService for HttpMutationService {
    fn mutate(&self, request: MutationRequest) -> BoxFuture<'_, Result<NodeTemplate>> {
        Box::pin(async move {
            let operation = request.operation.kind();
            let mutation_err = |message: String| NodeflowError::mutation(operation, message);

            let body = UpdateRequest {
                code: request
                    .template
                    .template
                    .get("code")
                    .map(InputField::value_str)
                    .unwrap_or(""),
                template: &request.template.template,
                field: &request.field,
                field_value: request.operation.field_value(),
                tool_mode: request.tool_mode,
            };

            debug!(node = %request.node_id, field = %request.field, operation, "Posting template mutation");

            let response = self
                .backend
                .post("custom_component/update")
                .timeout(self.backend.request_timeout)
                .json(&body)
                .send()
                .await
                .map_err(|e| mutation_err(e.to_string()))?;
            let response = check(response).await.map_err(mutation_err)?;

            response
                .json::<NodeTemplate>()
                .await
                .map_err(|e| mutation_err(e.to_string()))
        })
    }
}

#[derive(Deserialize)]
struct BuildJob {
    job_id: String,
}

struct ActiveJob {
    job_id: Option<String>,
    stop_node: NodeId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Build service backed by the flow build endpoint. Build events are decoded
/// from the response stream and forwarded into the channel given at
/// construction.
pub struct HttpBuildService {
    backend: Backend,
    flow_id: String,
    events: mpsc::Sender<BuildEvent>,
    active: Mutex<Option<ActiveJob>>,
}

impl HttpBuildService {
    pub fn new(config: &BackendConfig, events: mpsc::Sender<BuildEvent>) -> Result<Self> {
        let flow_id = config
            .flow_id
            .clone()
            .ok_or_else(|| NodeflowError::Config("backend.flow_id is required to build".into()))?;
        Ok(Self {
            backend: Backend::new(config)?,
            flow_id,
            events,
            active: Mutex::new(None),
        })
    }

    async fn start(&self, request: BuildRequest) -> Result<()> {
        let path = format!("build/{}/flow", self.flow_id);
        let response = self
            .backend
            .post(&path)
            .query(&[
                ("stop_component_id", request.stop_node_id.as_str()),
                ("event_delivery", request.event_delivery.as_str()),
            ])
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| NodeflowError::Build(e.to_string()))?;
        let response = check(response).await.map_err(NodeflowError::Build)?;

        let cancel = CancellationToken::new();
        let stop_node = request.stop_node_id.clone();

        let (job_id, stream_response) = match request.event_delivery {
            EventDeliveryMode::Direct => (None, response),
            EventDeliveryMode::Streaming | EventDeliveryMode::Polling => {
                let job: BuildJob = response
                    .json()
                    .await
                    .map_err(|e| NodeflowError::Build(e.to_string()))?;
                let stream = self
                    .backend
                    .get(&format!("build/{}/events", job.job_id))
                    .query(&[("event_delivery", request.event_delivery.as_str())])
                    .send()
                    .await
                    .map_err(|e| NodeflowError::Build(e.to_string()))?;
                let stream = check(stream).await.map_err(NodeflowError::Build)?;
                (Some(job.job_id), stream)
            }
        };

        info!(
            node = %stop_node,
            job = job_id.as_deref().unwrap_or("direct"),
            "Build job started"
        );

        let tx = self.events.clone();
        let task_cancel = cancel.clone();
        let task_node = stop_node.clone();
        let task = tokio::spawn(async move {
            let stream = Box::pin(stream_response.bytes_stream());
            let finished = events::pump(stream, task_node.clone(), tx, task_cancel).await;
            if !finished {
                debug!(node = %task_node, "Build stream closed without a backend result");
            }
        });

        let previous = self.active.lock().await.replace(ActiveJob {
            job_id,
            stop_node,
            cancel,
            task,
        });
        // The replaced stream reports its node as stopped on the way out.
        if let Some(previous) = previous {
            debug!(node = %previous.stop_node, "Superseding active build");
            previous.cancel.cancel();
        }
        Ok(())
    }

    /// Ask the backend to cancel, then tear down the stream. A rejected cancel
    /// leaves the job running and its stream attached.
    async fn cancel_active(&self) -> Result<()> {
        let job_id = match self.active.lock().await.as_ref() {
            Some(job) => job.job_id.clone(),
            None => {
                debug!("No active build to stop");
                return Ok(());
            }
        };

        if let Some(job_id) = &job_id {
            let response = self
                .backend
                .post(&format!("build/{}/cancel", job_id))
                .send()
                .await
                .map_err(|e| NodeflowError::BuildStop(e.to_string()))?;
            check(response).await.map_err(NodeflowError::BuildStop)?;
        }

        let job = {
            let mut active = self.active.lock().await;
            match active.as_ref() {
                Some(current) if current.job_id == job_id => active.take(),
                _ => None,
            }
        };
        let Some(job) = job else {
            debug!("Active build changed while cancelling");
            return Ok(());
        };

        job.cancel.cancel();
        if let Err(e) = job.task.await {
            warn!(node = %job.stop_node, error = %e, "Build stream task failed");
        }
        info!(node = %job.stop_node, "Build cancelled");
        Ok(())
    }
}

impl BuildService for HttpBuildService {
    fn build(&self, request: BuildRequest) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.start(request))
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.cancel_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(flow_id: Option<&str>) -> BackendConfig {
        BackendConfig {
            base_url: "http://localhost:7860/".into(),
            api_key: Some("sk-test".into()),
            request_timeout_secs: 5,
            flow_id: flow_id.map(str::to_string),
        }
    }

    #[test]
    fn test_url_joins_api_prefix() {
        let backend = Backend::new(&config(None)).unwrap();
        assert_eq!(
            backend.url("custom_component/update"),
            "http://localhost:7860/api/v1/custom_component/update"
        );
        assert_eq!(
            backend.url("/build/f1/cancel"),
            "http://localhost:7860/api/v1/build/f1/cancel"
        );
    }

    #[test]
    fn test_build_service_requires_flow_id() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            HttpBuildService::new(&config(None), tx),
            Err(NodeflowError::Config(_))
        ));
    }

    #[test]
    fn test_update_body_shape() {
        let template = NodeTemplate::new("Gmail")
            .with_field("code", InputField::new("code", "class Gmail: ...".into()))
            .with_field("auth_link", InputField::auth(""));
        let body = UpdateRequest {
            code: template.template["code"].value_str(),
            template: &template.template,
            field: "auth_link",
            field_value: serde_json::json!({ "validate": "" }),
            tool_mode: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "class Gmail: ...");
        assert_eq!(json["field"], "auth_link");
        assert_eq!(json["template"]["auth_link"]["type"], "auth");
        assert_eq!(json["field_value"]["validate"], "");
    }

    #[tokio::test]
    async fn stop_without_active_build_is_noop() {
        let (tx, mut rx) = mpsc::channel(1);
        let svc = HttpBuildService::new(&config(Some("f1")), tx).unwrap();
        svc.stop().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    /// Park a job whose stream never yields.
    async fn park_job(svc: &HttpBuildService, job_id: Option<&str>, node: &str) -> CancellationToken {
        let cancel = CancellationToken::new();
        let stream = Box::pin(futures::stream::pending::<
            std::result::Result<bytes::Bytes, reqwest::Error>,
        >());
        let tx = svc.events.clone();
        let stop_node = NodeId::from_str(node);
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            events::pump(stream, stop_node, tx, task_cancel).await;
        });
        *svc.active.lock().await = Some(ActiveJob {
            job_id: job_id.map(str::to_string),
            stop_node: NodeId::from_str(node),
            cancel: cancel.clone(),
            task,
        });
        cancel
    }

    #[tokio::test]
    async fn stop_tears_down_stream_and_reports_stopped() {
        let (tx, mut rx) = mpsc::channel(4);
        let svc = HttpBuildService::new(&config(Some("f1")), tx).unwrap();
        park_job(&svc, None, "n1").await;

        svc.stop().await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(BuildEvent::Stopped { node_id: NodeId::from_str("n1") })
        );
        assert!(svc.active.lock().await.is_none());
    }

    #[tokio::test]
    async fn rejected_cancel_keeps_job_running() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut unreachable = config(Some("f1"));
        unreachable.base_url = "http://127.0.0.1:1".into();
        let svc = HttpBuildService::new(&unreachable, tx).unwrap();
        let cancel = park_job(&svc, Some("job-1"), "n1").await;

        let err = svc.stop().await.unwrap_err();

        assert!(matches!(err, NodeflowError::BuildStop(_)));
        assert!(svc.active.lock().await.is_some());
        assert!(rx.try_recv().is_err());
        cancel.cancel();
    }
}
