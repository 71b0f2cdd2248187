use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use nodeflow_core::config::BuildConfig;
use nodeflow_core::error::Result;
use nodeflow_core::event::EventBus;
use nodeflow_core::traits::{AnalyticsSink, BuildService, ErrorSink};
use nodeflow_core::types::{BuildRequest, BuildStatus, ErrorReport, NodeEvent, NodeId};

use crate::store::{FlowPool, NodeRecord, NodeStore};

/// What a run request turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A build request was issued to the backend.
    BuildIssued,
    /// The in-flight build was asked to stop.
    StopRequested,
    /// A build is already in flight for this node.
    Coalesced,
    /// Shortcut fired for a node that is not selected.
    NotSelected,
    /// The backend rejected the request; reported to the error sink.
    Failed,
}

/// Single entry point for run and stop requests.
pub struct BuildTrigger {
    build: Arc<dyn BuildService>,
    analytics: Arc<dyn AnalyticsSink>,
    errors: Arc<dyn ErrorSink>,
    store: Arc<NodeStore>,
    pool: Arc<FlowPool>,
    event_bus: Arc<EventBus>,
    config: BuildConfig,
    in_flight: Mutex<HashSet<NodeId>>,
}

impl BuildTrigger {
    pub fn new(
        build: Arc<dyn BuildService>,
        analytics: Arc<dyn AnalyticsSink>,
        errors: Arc<dyn ErrorSink>,
        store: Arc<NodeStore>,
        pool: Arc<FlowPool>,
        event_bus: Arc<EventBus>,
        config: BuildConfig,
    ) -> Self {
        Self {
            build,
            analytics,
            errors,
            store,
            pool,
            event_bus,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Run button handler.
    ///
    /// While building, a hovered click stops the build and any other click is
    /// coalesced. Otherwise the node's stale pool entries are cleared and one
    /// build scoped to this node is issued.
    pub async fn request_run(
        &self,
        node_id: &NodeId,
        current_status: BuildStatus,
        is_building: bool,
        hovered: bool,
    ) -> Result<RunOutcome> {
        if current_status == BuildStatus::Building && hovered {
            return Ok(self.request_stop(node_id).await);
        }

        self.issue(node_id, current_status, is_building, false).await
    }

    /// Keyboard shortcut handler. Only ever affects the selected node.
    pub async fn handle_run_shortcut(
        &self,
        node_id: &NodeId,
        current_status: BuildStatus,
        is_building: bool,
        selected: bool,
    ) -> Result<RunOutcome> {
        if !selected {
            return Ok(RunOutcome::NotSelected);
        }

        self.issue(node_id, current_status, is_building, true).await
    }

    /// Forget the in-flight marker once the backend reports the build over.
    pub async fn on_build_finished(&self, node_id: &NodeId) {
        self.in_flight.lock().await.remove(node_id);
    }

    pub async fn is_in_flight(&self, node_id: &NodeId) -> bool {
        self.in_flight.lock().await.contains(node_id)
    }

    async fn request_stop(&self, node_id: &NodeId) -> RunOutcome {
        info!(node = %node_id, "Stopping build");
        self.event_bus.publish(NodeEvent::BuildStopRequested {
            node_id: node_id.clone(),
        });

        if let Err(e) = self.build.stop().await {
            error!(node = %node_id, error = %e, "Failed to stop build");
            self.errors.report(ErrorReport::new(
                "Error while stopping the build",
                vec![e.to_string()],
            ));
            return RunOutcome::Failed;
        }

        self.in_flight.lock().await.remove(node_id);
        RunOutcome::StopRequested
    }

    async fn issue(
        &self,
        node_id: &NodeId,
        current_status: BuildStatus,
        is_building: bool,
        clear_validation: bool,
    ) -> Result<RunOutcome> {
        {
            let mut in_flight = self.in_flight.lock().await;
            if current_status == BuildStatus::Building
                || is_building
                || in_flight.contains(node_id)
            {
                debug!(node = %node_id, status = %current_status, "Build already in flight, ignoring run");
                return Ok(RunOutcome::Coalesced);
            }
            in_flight.insert(node_id.clone());
        }

        self.pool.clear_node(node_id).await;
        if clear_validation {
            let cleared = self
                .store
                .update(node_id, |old| NodeRecord {
                    validation: None,
                    ..old.clone()
                })
                .await;
            if let Err(e) = cleared {
                self.in_flight.lock().await.remove(node_id);
                warn!(node = %node_id, error = %e, "Could not clear validation before build");
                return Err(e);
            }
        }

        let request = BuildRequest {
            stop_node_id: node_id.clone(),
            event_delivery: self.config.event_delivery,
        };

        match self.build.build(request).await {
            Ok(()) => {
                info!(node = %node_id, delivery = self.config.event_delivery.as_str(), "Build requested");
                self.event_bus.publish(NodeEvent::BuildRequested {
                    node_id: node_id.clone(),
                });
                self.analytics.record(
                    &self.config.analytics_event,
                    serde_json::json!({ "stopNodeId": node_id.as_str() }),
                );
                Ok(RunOutcome::BuildIssued)
            }
            Err(e) => {
                self.in_flight.lock().await.remove(node_id);
                error!(node = %node_id, error = %e, "Build request failed");
                self.errors.report(ErrorReport::new(
                    "Error while building the component",
                    vec![e.to_string()],
                ));
                Ok(RunOutcome::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_core::error::NodeflowError;
    use chrono::Utc;
    use nodeflow_core::template::NodeTemplate;
    use nodeflow_core::types::{EventDeliveryMode, ValidationResult, VertexBuild};
    use nodeflow_test_utils::{RecordingAnalytics, RecordingBuildService, RecordingErrorSink};

    struct Harness {
        trigger: BuildTrigger,
        build: Arc<RecordingBuildService>,
        analytics: Arc<RecordingAnalytics>,
        errors: Arc<RecordingErrorSink>,
        store: Arc<NodeStore>,
        pool: Arc<FlowPool>,
        id: NodeId,
    }

    async fn harness(build: RecordingBuildService) -> Harness {
        let bus = Arc::new(EventBus::default());
        let store = Arc::new(NodeStore::new(bus.clone()));
        let pool = Arc::new(FlowPool::new());
        let id = NodeId::from_str("openai-1");
        store
            .insert(NodeRecord::new(id.clone(), NodeTemplate::new("OpenAI")))
            .await;
        let build = Arc::new(build);
        let analytics = Arc::new(RecordingAnalytics::default());
        let errors = Arc::new(RecordingErrorSink::default());
        let trigger = BuildTrigger::new(
            build.clone(),
            analytics.clone(),
            errors.clone(),
            store.clone(),
            pool.clone(),
            bus,
            BuildConfig::default(),
        );
        Harness {
            trigger,
            build,
            analytics,
            errors,
            store,
            pool,
            id,
        }
    }

    #[tokio::test]
    async fn run_issues_scoped_build_and_tracks() {
        let h = harness(RecordingBuildService::default()).await;

        let outcome = h.trigger.request_run(&h.id, BuildStatus::Idle, false, false).await.unwrap();

        assert_eq!(outcome, RunOutcome::BuildIssued);
        assert_eq!(
            h.build.builds(),
            vec![BuildRequest {
                stop_node_id: h.id.clone(),
                event_delivery: EventDeliveryMode::Streaming,
            }]
        );
        let events = h.analytics.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "Flow Build - Clicked");
        assert_eq!(events[0].1["stopNodeId"], "openai-1");
    }

    #[tokio::test]
    async fn back_to_back_runs_issue_one_build() {
        let h = harness(RecordingBuildService::default()).await;

        let first = h.trigger.request_run(&h.id, BuildStatus::Idle, false, false).await.unwrap();
        // Backend has not reported Building yet; the caller still sees Idle.
        let second = h.trigger.request_run(&h.id, BuildStatus::Idle, false, false).await.unwrap();
        let third = h.trigger.request_run(&h.id, BuildStatus::Building, false, false).await.unwrap();

        assert_eq!(first, RunOutcome::BuildIssued);
        assert_eq!(second, RunOutcome::Coalesced);
        assert_eq!(third, RunOutcome::Coalesced);
        assert_eq!(h.build.builds().len(), 1);
        assert_eq!(h.analytics.events().len(), 1);
    }

    #[tokio::test]
    async fn hovered_click_while_building_stops() {
        let h = harness(RecordingBuildService::default()).await;

        let outcome = h.trigger.request_run(&h.id, BuildStatus::Building, false, true).await.unwrap();

        assert_eq!(outcome, RunOutcome::StopRequested);
        assert_eq!(h.build.stops(), 1);
        assert!(h.build.builds().is_empty());
        assert!(h.analytics.events().is_empty());
    }

    #[tokio::test]
    async fn external_building_flag_coalesces() {
        let h = harness(RecordingBuildService::default()).await;
        let outcome = h.trigger.request_run(&h.id, BuildStatus::Built, true, false).await.unwrap();
        assert_eq!(outcome, RunOutcome::Coalesced);
        assert!(h.build.builds().is_empty());
    }

    #[tokio::test]
    async fn run_clears_node_pool_entries() {
        let h = harness(RecordingBuildService::default()).await;
        h.pool
            .push(VertexBuild {
                id: "old".into(),
                node_id: h.id.clone(),
                valid: false,
                duration_ms: None,
                message: Some("stale".into()),
                timestamp: Utc::now(),
            })
            .await;

        h.trigger.request_run(&h.id, BuildStatus::Error, false, false).await.unwrap();
        assert!(h.pool.latest(&h.id).await.is_none());
    }

    #[tokio::test]
    async fn finished_build_allows_next_run() {
        let h = harness(RecordingBuildService::default()).await;

        h.trigger.request_run(&h.id, BuildStatus::Idle, false, false).await.unwrap();
        assert!(h.trigger.is_in_flight(&h.id).await);
        h.trigger.on_build_finished(&h.id).await;

        let outcome = h.trigger.request_run(&h.id, BuildStatus::Built, false, false).await.unwrap();
        assert_eq!(outcome, RunOutcome::BuildIssued);
        assert_eq!(h.build.builds().len(), 2);
    }

    #[tokio::test]
    async fn shortcut_requires_selection() {
        let h = harness(RecordingBuildService::default()).await;

        let outcome = h
            .trigger
            .handle_run_shortcut(&h.id, BuildStatus::Idle, false, false)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::NotSelected);
        assert!(h.build.builds().is_empty());
    }

    #[tokio::test]
    async fn shortcut_clears_validation_and_builds() {
        let h = harness(RecordingBuildService::default()).await;
        h.store
            .update(&h.id, |old| NodeRecord {
                validation: Some(ValidationResult::success(10)),
                ..old.clone()
            })
            .await
            .unwrap();

        let outcome = h
            .trigger
            .handle_run_shortcut(&h.id, BuildStatus::Built, false, true)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::BuildIssued);
        assert!(h.store.get(&h.id).await.unwrap().validation.is_none());
        assert_eq!(h.build.builds().len(), 1);
    }

    #[tokio::test]
    async fn shortcut_while_building_is_noop() {
        let h = harness(RecordingBuildService::default()).await;
        let outcome = h
            .trigger
            .handle_run_shortcut(&h.id, BuildStatus::Building, false, true)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Coalesced);
        assert_eq!(h.build.stops(), 0);
    }

    #[tokio::test]
    async fn backend_rejection_reports_and_releases() {
        let h = harness(RecordingBuildService::failing("HTTP 503")).await;

        let outcome = h.trigger.request_run(&h.id, BuildStatus::Idle, false, false).await.unwrap();

        assert_eq!(outcome, RunOutcome::Failed);
        assert_eq!(h.errors.reports().len(), 1);
        assert!(h.analytics.events().is_empty());
        assert!(!h.trigger.is_in_flight(&h.id).await);
    }

    #[tokio::test]
    async fn shortcut_on_unknown_node_errors_and_releases() {
        let h = harness(RecordingBuildService::default()).await;
        let ghost = NodeId::from_str("ghost");

        let result = h
            .trigger
            .handle_run_shortcut(&ghost, BuildStatus::Idle, false, true)
            .await;

        assert!(matches!(result, Err(NodeflowError::NodeNotFound(_))));
        assert!(!h.trigger.is_in_flight(&ghost).await);
        assert!(h.build.builds().is_empty());
        assert!(h.analytics.events().is_empty());
    }
}
