use futures::future::BoxFuture;

use crate::error::Result;
use crate::template::NodeTemplate;
use crate::types::*;

/// Template mutation service. Posts a field operation and returns the
/// replacement template.
pub trait TemplateMutationService: Send + Sync + 'static {
    fn mutate(&self, request: MutationRequest) -> BoxFuture<'_, Result<NodeTemplate>>;
}

/// Backend build service. Results arrive out-of-band as `BuildEvent`s.
pub trait BuildService: Send + Sync + 'static {
    /// Start a build that stops at `request.stop_node_id`.
    fn build(&self, request: BuildRequest) -> BoxFuture<'_, Result<()>>;

    /// Stop the in-flight build.
    fn stop(&self) -> BoxFuture<'_, Result<()>>;
}

/// Error reporting sink, fire-and-forget.
pub trait ErrorSink: Send + Sync + 'static {
    fn report(&self, report: ErrorReport);
}

/// Analytics sink, fire-and-forget.
pub trait AnalyticsSink: Send + Sync + 'static {
    fn record(&self, event: &str, payload: serde_json::Value);
}

/// Opens an authorization URL in an external context (browser tab).
pub trait UrlOpener: Send + Sync + 'static {
    fn open(&self, url: &str) -> Result<()>;
}
