//! Fakes and fixtures shared by nodeflow tests.

use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::template::{InputField, NodeTemplate};
use nodeflow_core::traits::{AnalyticsSink, BuildService, ErrorSink, TemplateMutationService, UrlOpener};
use nodeflow_core::types::{BuildRequest, ErrorReport, MutationRequest};

/// A template with a single auth field named `field` holding `value`.
pub fn auth_template(display_name: &str, field: &str, value: &str) -> NodeTemplate {
    NodeTemplate::new(display_name).with_field(field, InputField::auth(value))
}

type Responder = Box<dyn Fn(&MutationRequest) -> Result<NodeTemplate> + Send + Sync>;

enum Mode {
    Auto(Responder),
    Manual(mpsc::UnboundedSender<PendingMutation>),
}

/// A mutation call parked until the test answers it.
pub struct PendingMutation {
    pub request: MutationRequest,
    tx: oneshot::Sender<Result<NodeTemplate>>,
}

impl PendingMutation {
    pub fn respond(self, result: Result<NodeTemplate>) {
        let _ = self.tx.send(result);
    }
}

/// Template mutation service that records every request.
///
/// In auto mode each call is answered by a closure. In manual mode each call
/// is handed to the test, which answers in any order it likes.
pub struct MockMutationService {
    mode: Mode,
    calls: Mutex<Vec<MutationRequest>>,
}

impl MockMutationService {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&MutationRequest) -> Result<NodeTemplate> + Send + Sync + 'static,
    {
        Self {
            mode: Mode::Auto(Box::new(responder)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with a clone of `template`.
    pub fn replying(template: NodeTemplate) -> Self {
        Self::new(move |_| Ok(template.clone()))
    }

    /// Fail every call with `message`.
    pub fn failing(message: &str) -> Self {
        let message = message.to_string();
        Self::new(move |req| {
            Err(NodeflowError::mutation(req.operation.kind(), message.clone()))
        })
    }

    pub fn manual() -> (Self, mpsc::UnboundedReceiver<PendingMutation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                mode: Mode::Manual(tx),
                calls: Mutex::new(Vec::new()),
            },
            rx,
        )
    }

    pub fn calls(&self) -> Vec<MutationRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl TemplateMutationService for MockMutationService {
    fn mutate(&self, request: MutationRequest) -> BoxFuture<'_, Result<NodeTemplate>> {
        self.calls.lock().unwrap().push(request.clone());
        match &self.mode {
            Mode::Auto(responder) => {
                let result = responder(&request);
                Box::pin(async move { result })
            }
            Mode::Manual(pending) => {
                let (tx, rx) = oneshot::channel();
                let _ = pending.send(PendingMutation { request, tx });
                Box::pin(async move {
                    rx.await
                        .unwrap_or_else(|_| Err(NodeflowError::mutation("mock", "response dropped")))
                })
            }
        }
    }
}

/// Build service that records build and stop calls.
#[derive(Default)]
pub struct RecordingBuildService {
    builds: Mutex<Vec<BuildRequest>>,
    stops: Mutex<usize>,
    fail_with: Mutex<Option<String>>,
}

impl RecordingBuildService {
    pub fn failing(message: &str) -> Self {
        let svc = Self::default();
        *svc.fail_with.lock().unwrap() = Some(message.to_string());
        svc
    }

    pub fn builds(&self) -> Vec<BuildRequest> {
        self.builds.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        *self.stops.lock().unwrap()
    }
}

impl BuildService for RecordingBuildService {
    fn build(&self, request: BuildRequest) -> BoxFuture<'_, Result<()>> {
        let failure = self.fail_with.lock().unwrap().clone();
        if failure.is_none() {
            self.builds.lock().unwrap().push(request);
        }
        Box::pin(async move {
            match failure {
                Some(msg) => Err(NodeflowError::Build(msg)),
                None => Ok(()),
            }
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        *self.stops.lock().unwrap() += 1;
        Box::pin(async { Ok(()) })
    }
}

#[derive(Default)]
pub struct RecordingErrorSink {
    reports: Mutex<Vec<ErrorReport>>,
}

impl RecordingErrorSink {
    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorSink for RecordingErrorSink {
    fn report(&self, report: ErrorReport) {
        self.reports.lock().unwrap().push(report);
    }
}

#[derive(Default)]
pub struct RecordingAnalytics {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingAnalytics {
    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events.lock().unwrap().clone()
    }
}

impl AnalyticsSink for RecordingAnalytics {
    fn record(&self, event: &str, payload: serde_json::Value) {
        self.events.lock().unwrap().push((event.to_string(), payload));
    }
}

/// URL opener that records instead of launching anything.
#[derive(Default)]
pub struct RecordingUrlOpener {
    opened: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingUrlOpener {
    pub fn failing() -> Self {
        Self {
            opened: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

impl UrlOpener for RecordingUrlOpener {
    fn open(&self, url: &str) -> Result<()> {
        self.opened.lock().unwrap().push(url.to_string());
        if self.fail {
            return Err(NodeflowError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no browser available",
            )));
        }
        Ok(())
    }
}
