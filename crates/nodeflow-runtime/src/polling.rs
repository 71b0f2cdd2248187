//! Authorization polling engine.
//!
//! One session per `(node, field)`. A session is two timers (the validate
//! interval and the give-up timeout) plus a tick sequence counter. Responses
//! to validate ticks may arrive in any order; a response older than the last
//! applied one is dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nodeflow_core::config::PollingConfig;
use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::event::EventBus;
use nodeflow_core::template::NodeTemplate;
use nodeflow_core::traits::{ErrorSink, TemplateMutationService, UrlOpener};
use nodeflow_core::types::{
    ErrorReport, MutationOperation, MutationRequest, NodeEvent, NodeId, PollStopReason,
};

use crate::store::NodeStore;

/// Identifies a polling session.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SessionKey {
    pub node_id: NodeId,
    pub field: String,
}

impl SessionKey {
    pub fn new(node_id: NodeId, field: impl Into<String>) -> Self {
        Self {
            node_id,
            field: field.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node_id, self.field)
    }
}

/// Tick sequence bookkeeping shared by a session's in-flight ticks.
#[derive(Default)]
struct TickLedger {
    issued: AtomicU64,
    applied: Mutex<u64>,
}

struct PollingSession {
    generation: u64,
    started_at: Instant,
    cancel: CancellationToken,
    ledger: Arc<TickLedger>,
    open_handle: Option<JoinHandle<()>>,
    interval_handle: Option<JoinHandle<()>>,
    timeout_handle: Option<JoinHandle<()>>,
}

impl PollingSession {
    /// Cancel the session and release every timer it owns.
    fn release(self) {
        self.cancel.cancel();
        for handle in [self.open_handle, self.interval_handle, self.timeout_handle]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

/// Everything a session's tasks need, cloned into each task.
#[derive(Clone)]
struct SessionCtx {
    key: SessionKey,
    generation: u64,
    cancel: CancellationToken,
    ledger: Arc<TickLedger>,
    deadline: Instant,
}

/// Drives a node's auth field from "needs authorization" to "connected".
pub struct AuthPoller {
    mutation: Arc<dyn TemplateMutationService>,
    store: Arc<NodeStore>,
    errors: Arc<dyn ErrorSink>,
    opener: Arc<dyn UrlOpener>,
    event_bus: Arc<EventBus>,
    config: PollingConfig,
    sessions: Mutex<HashMap<SessionKey, PollingSession>>,
    generations: AtomicU64,
}

impl AuthPoller {
    pub fn new(
        mutation: Arc<dyn TemplateMutationService>,
        store: Arc<NodeStore>,
        errors: Arc<dyn ErrorSink>,
        opener: Arc<dyn UrlOpener>,
        event_bus: Arc<EventBus>,
        config: PollingConfig,
    ) -> Self {
        Self {
            mutation,
            store,
            errors,
            opener,
            event_bus,
            config,
            sessions: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Start polling with the configured interval and timeout.
    pub async fn start_polling_with_defaults(
        self: &Arc<Self>,
        node_id: &NodeId,
        field: &str,
    ) -> Result<()> {
        self.start_polling(node_id, field, self.config.interval(), self.config.timeout())
            .await
    }

    /// Start a polling session, replacing any live session for the same key.
    ///
    /// Returns once the session is registered; the open-authorization request
    /// and all ticks run in the background.
    pub async fn start_polling(
        self: &Arc<Self>,
        node_id: &NodeId,
        field: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<()> {
        if interval.is_zero() || timeout.is_zero() {
            return Err(NodeflowError::Config(
                "polling interval and timeout must be non-zero".into(),
            ));
        }

        let record = self.store.require(node_id).await?;
        let field = match record.template.auth_field(field) {
            Some((key, _)) => key.to_string(),
            None => {
                return Err(NodeflowError::AuthFieldNotFound {
                    node: node_id.to_string(),
                    field: field.to_string(),
                })
            }
        };
        let key = SessionKey::new(node_id.clone(), field);

        let mut sessions = self.sessions.lock().await;
        if let Some(prior) = sessions.remove(&key) {
            prior.release();
            self.publish_stopped(&key, PollStopReason::Superseded);
        }

        let started_at = Instant::now();
        let ctx = SessionCtx {
            key: key.clone(),
            generation: self.generations.fetch_add(1, Ordering::SeqCst) + 1,
            cancel: CancellationToken::new(),
            ledger: Arc::new(TickLedger::default()),
            deadline: started_at + timeout,
        };

        let open_handle = tokio::spawn(self.clone().open_authorization(ctx.clone(), interval));
        let timeout_handle = tokio::spawn(self.clone().run_timeout(ctx.clone()));

        sessions.insert(
            key.clone(),
            PollingSession {
                generation: ctx.generation,
                started_at,
                cancel: ctx.cancel,
                ledger: ctx.ledger,
                open_handle: Some(open_handle),
                interval_handle: None,
                timeout_handle: Some(timeout_handle),
            },
        );
        drop(sessions);

        info!(
            node = %key.node_id,
            field = %key.field,
            interval_ms = interval.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "Authorization polling started"
        );
        self.event_bus.publish(NodeEvent::PollingStarted {
            node_id: key.node_id,
            field: key.field,
        });
        Ok(())
    }

    /// Stop the session for `(node, field)`. No-op when none is live.
    pub async fn stop_polling(&self, node_id: &NodeId, field: &str) {
        let key = self.resolve_key(node_id, field).await;
        let removed = self.sessions.lock().await.remove(&key);
        if let Some(session) = removed {
            session.release();
            info!(node = %key.node_id, field = %key.field, "Authorization polling stopped");
            self.publish_stopped(&key, PollStopReason::Cancelled);
        }
    }

    /// Stop every live session.
    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        for (key, session) in drained {
            session.release();
            self.publish_stopped(&key, PollStopReason::Cancelled);
        }
    }

    pub async fn is_polling(&self, node_id: &NodeId, field: &str) -> bool {
        let key = self.resolve_key(node_id, field).await;
        self.sessions.lock().await.contains_key(&key)
    }

    /// Whether any session is live for the node, whatever the field.
    pub async fn is_polling_node(&self, node_id: &NodeId) -> bool {
        self.sessions
            .lock()
            .await
            .keys()
            .any(|k| &k.node_id == node_id)
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Number of validate ticks issued by the live session.
    pub async fn ticks_issued(&self, node_id: &NodeId, field: &str) -> Option<u64> {
        let key = self.resolve_key(node_id, field).await;
        self.sessions
            .lock()
            .await
            .get(&key)
            .map(|s| s.ledger.issued.load(Ordering::SeqCst))
    }

    /// Send a one-shot disconnect request and replace the template on success.
    /// Does not touch polling sessions.
    pub async fn disconnect(&self, node_id: &NodeId, field: &str) -> Result<()> {
        let record = self.store.require(node_id).await?;
        let field = record
            .template
            .auth_field(field)
            .map(|(k, _)| k.to_string())
            .unwrap_or_else(|| field.to_string());

        let request = MutationRequest {
            operation: MutationOperation::Disconnect,
            node_id: node_id.clone(),
            template: record.template.clone(),
            field: field.clone(),
            tool_mode: record.template.tool_mode,
        };

        match self.mutation.mutate(request).await {
            Ok(template) => {
                self.store.replace_template(node_id, template).await?;
                info!(node = %node_id, field = %field, "Disconnected");
                self.event_bus.publish(NodeEvent::Disconnected {
                    node_id: node_id.clone(),
                    field,
                });
                Ok(())
            }
            Err(e) => {
                error!(node = %node_id, field = %field, error = %e, "Disconnect failed");
                self.errors.report(ErrorReport::new(
                    "Error while disconnecting the component",
                    vec![e.to_string()],
                ));
                Err(e)
            }
        }
    }

    /// Map a caller-supplied field name onto the node's actual auth field key.
    async fn resolve_key(&self, node_id: &NodeId, field: &str) -> SessionKey {
        let resolved = match self.store.get(node_id).await {
            Some(record) => record
                .template
                .auth_field(field)
                .map(|(k, _)| k.to_string())
                .unwrap_or_else(|| field.to_string()),
            None => field.to_string(),
        };
        SessionKey::new(node_id.clone(), resolved)
    }

    /// Step 1: fetch or trigger the auth link, open it, then arm the interval.
    async fn open_authorization(self: Arc<Self>, ctx: SessionCtx, interval: Duration) {
        let Some(record) = self.store.get(&ctx.key.node_id).await else {
            self.finish(&ctx, PollStopReason::OpenFailed).await;
            return;
        };

        let request = MutationRequest {
            operation: MutationOperation::OpenAuthorization,
            node_id: ctx.key.node_id.clone(),
            template: record.template.clone(),
            field: ctx.key.field.clone(),
            tool_mode: record.template.tool_mode,
        };

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            result = self.mutation.mutate(request) => result,
        };

        match result {
            Ok(template) => {
                if let Some(url) = template.auth_value(&ctx.key.field).url() {
                    if let Err(e) = self.opener.open(url) {
                        warn!(node = %ctx.key.node_id, url = %url, error = %e, "Failed to open authorization URL");
                    }
                }
                if let Err(e) = self.store.replace_template(&ctx.key.node_id, template).await {
                    warn!(node = %ctx.key.node_id, error = %e, "Node vanished while opening authorization");
                    self.finish(&ctx, PollStopReason::OpenFailed).await;
                    return;
                }
                self.arm(&ctx, interval).await;
            }
            Err(e) => {
                error!(node = %ctx.key.node_id, field = %ctx.key.field, error = %e, "Open authorization failed");
                self.errors.report(ErrorReport::new(
                    "Error while connecting the component",
                    vec![e.to_string()],
                ));
                self.finish(&ctx, PollStopReason::OpenFailed).await;
            }
        }
    }

    /// Step 2: spawn the validate interval for a live session.
    async fn arm(self: &Arc<Self>, ctx: &SessionCtx, interval: Duration) {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&ctx.key) else {
            return;
        };
        if session.generation != ctx.generation || ctx.cancel.is_cancelled() {
            return;
        }

        session.interval_handle = Some(tokio::spawn(self.clone().run_interval(ctx.clone(), interval)));
        debug!(node = %ctx.key.node_id, field = %ctx.key.field, "Poll interval armed");
    }

    async fn run_interval(self: Arc<Self>, ctx: SessionCtx, interval: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Timeout wins over a tick landing on or after the deadline.
            if ctx.cancel.is_cancelled() || Instant::now() >= ctx.deadline {
                break;
            }

            let seq = ctx.ledger.issued.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::spawn(self.clone().tick(ctx.clone(), seq));
        }
    }

    async fn run_timeout(self: Arc<Self>, ctx: SessionCtx) {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {}
            _ = tokio::time::sleep_until(ctx.deadline) => {
                info!(node = %ctx.key.node_id, field = %ctx.key.field, "Authorization polling timed out");
                self.finish(&ctx, PollStopReason::TimedOut).await;
            }
        }
    }

    /// One validate request. Failures are swallowed; the session keeps going.
    async fn tick(self: Arc<Self>, ctx: SessionCtx, seq: u64) {
        let Some(record) = self.store.get(&ctx.key.node_id).await else {
            return;
        };
        let current = record
            .template
            .auth_value(&ctx.key.field)
            .link()
            .to_string();

        debug!(node = %ctx.key.node_id, field = %ctx.key.field, seq, "Poll tick");
        self.event_bus.publish(NodeEvent::PollTick {
            node_id: ctx.key.node_id.clone(),
            field: ctx.key.field.clone(),
            seq,
        });

        let request = MutationRequest {
            operation: MutationOperation::Validate(current),
            node_id: ctx.key.node_id.clone(),
            template: record.template.clone(),
            field: ctx.key.field.clone(),
            tool_mode: record.template.tool_mode,
        };

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            result = self.mutation.mutate(request) => result,
        };

        match result {
            Ok(template) => self.apply_tick(&ctx, seq, template).await,
            Err(e) => {
                warn!(node = %ctx.key.node_id, seq, error = %e, "Poll tick failed, continuing");
            }
        }
    }

    async fn apply_tick(&self, ctx: &SessionCtx, seq: u64, template: NodeTemplate) {
        let connected = template.auth_value(&ctx.key.field).is_connected();
        {
            let mut applied = ctx.ledger.applied.lock().await;
            if ctx.cancel.is_cancelled() {
                return;
            }
            if seq <= *applied {
                debug!(node = %ctx.key.node_id, seq, applied = *applied, "Discarding stale poll response");
                self.event_bus.publish(NodeEvent::PollStaleDiscarded {
                    node_id: ctx.key.node_id.clone(),
                    seq,
                    applied: *applied,
                });
                return;
            }
            *applied = seq;

            if let Err(e) = self.store.replace_template(&ctx.key.node_id, template).await {
                warn!(node = %ctx.key.node_id, seq, error = %e, "Dropping poll response");
                return;
            }
        }

        if connected && self.config.stop_on_connected {
            info!(node = %ctx.key.node_id, field = %ctx.key.field, seq, "Authorization confirmed");
            self.finish(ctx, PollStopReason::Connected).await;
        }
    }

    /// End the session owned by `ctx`, unless a newer one already replaced it.
    async fn finish(&self, ctx: &SessionCtx, reason: PollStopReason) {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            let owned = sessions
                .get(&ctx.key)
                .is_some_and(|s| s.generation == ctx.generation);
            if owned {
                sessions.remove(&ctx.key)
            } else {
                None
            }
        };
        if let Some(session) = removed {
            debug!(
                node = %ctx.key.node_id,
                field = %ctx.key.field,
                reason = ?reason,
                elapsed_ms = session.started_at.elapsed().as_millis() as u64,
                "Polling session finished"
            );
            session.release();
            self.publish_stopped(&ctx.key, reason);
        }
    }

    fn publish_stopped(&self, key: &SessionKey, reason: PollStopReason) {
        self.event_bus.publish(NodeEvent::PollingStopped {
            node_id: key.node_id.clone(),
            field: key.field.clone(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NodeRecord;
    use nodeflow_core::template::InputField;
    use nodeflow_test_utils::{
        auth_template, MockMutationService, RecordingErrorSink, RecordingUrlOpener,
    };

    const FIELD: &str = "auth_link";

    struct Harness {
        poller: Arc<AuthPoller>,
        store: Arc<NodeStore>,
        errors: Arc<RecordingErrorSink>,
        opener: Arc<RecordingUrlOpener>,
        bus: Arc<EventBus>,
        id: NodeId,
    }

    async fn harness(mutation: Arc<MockMutationService>) -> Harness {
        harness_with_opener(mutation, RecordingUrlOpener::default()).await
    }

    async fn harness_with_opener(
        mutation: Arc<MockMutationService>,
        opener: RecordingUrlOpener,
    ) -> Harness {
        let bus = Arc::new(EventBus::default());
        let store = Arc::new(NodeStore::new(bus.clone()));
        let id = NodeId::from_str("gmail-1");
        store
            .insert(NodeRecord::new(id.clone(), auth_template("Gmail", FIELD, "")))
            .await;
        let errors = Arc::new(RecordingErrorSink::default());
        let opener = Arc::new(opener);
        let poller = Arc::new(AuthPoller::new(
            mutation,
            store.clone(),
            errors.clone(),
            opener.clone(),
            bus.clone(),
            PollingConfig::default(),
        ));
        Harness {
            poller,
            store,
            errors,
            opener,
            bus,
            id,
        }
    }

    fn pending_link() -> NodeTemplate {
        auth_template("Gmail", FIELD, "https://accounts.example.com/oauth")
    }

    /// Let spawned tasks run without moving the clock.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_authorization_opens_url_and_is_polling() {
        let mutation = Arc::new(MockMutationService::replying(pending_link()));
        let h = harness(mutation.clone()).await;

        h.poller.start_polling_with_defaults(&h.id, FIELD).await.unwrap();
        assert!(h.poller.is_polling(&h.id, FIELD).await);
        settle().await;

        assert_eq!(
            h.opener.opened(),
            vec!["https://accounts.example.com/oauth".to_string()]
        );
        let calls = mutation.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].operation, MutationOperation::OpenAuthorization);
        assert!(h.poller.is_polling(&h.id, FIELD).await);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_silently_after_deadline() {
        let mutation = Arc::new(MockMutationService::replying(pending_link()));
        let h = harness(mutation.clone()).await;

        h.poller
            .start_polling(
                &h.id,
                FIELD,
                Duration::from_millis(3_000),
                Duration::from_millis(60_000),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60_001)).await;
        settle().await;

        assert!(!h.poller.is_polling(&h.id, FIELD).await);
        // One open request plus ticks at 3s..57s; the 60s tick loses to the timeout.
        let validates = mutation
            .calls()
            .iter()
            .filter(|c| matches!(c.operation, MutationOperation::Validate(_)))
            .count();
        assert_eq!(validates, 19);
        assert!(h.errors.reports().is_empty());

        tokio::time::sleep(Duration::from_millis(30_000)).await;
        settle().await;
        assert_eq!(mutation.calls().len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_leaves_exactly_one_session() {
        let mutation = Arc::new(MockMutationService::replying(pending_link()));
        let h = harness(mutation.clone()).await;

        h.poller.start_polling_with_defaults(&h.id, FIELD).await.unwrap();
        settle().await;
        h.poller.start_polling_with_defaults(&h.id, FIELD).await.unwrap();
        settle().await;

        assert_eq!(h.poller.active_sessions().await, 1);

        // Only the second session ticks: one validate per interval.
        mutation.clear();
        tokio::time::sleep(Duration::from_millis(3_001)).await;
        settle().await;
        assert_eq!(mutation.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_polling_is_idempotent_and_halts_ticks() {
        let mutation = Arc::new(MockMutationService::replying(pending_link()));
        let h = harness(mutation.clone()).await;

        h.poller.stop_polling(&h.id, FIELD).await;

        h.poller.start_polling_with_defaults(&h.id, FIELD).await.unwrap();
        settle().await;
        h.poller.stop_polling(&h.id, FIELD).await;
        h.poller.stop_polling(&h.id, FIELD).await;
        assert!(!h.poller.is_polling(&h.id, FIELD).await);

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        settle().await;
        assert_eq!(mutation.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connected_tick_stops_session_before_next_tick() {
        let connected = auth_template("Gmail", FIELD, "validated");
        let mutation = Arc::new(MockMutationService::new(move |req| match req.operation {
            MutationOperation::OpenAuthorization => Ok(pending_link()),
            _ => Ok(connected.clone()),
        }));
        let h = harness(mutation.clone()).await;

        h.poller.start_polling_with_defaults(&h.id, FIELD).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_001)).await;
        settle().await;

        assert!(!h.poller.is_polling(&h.id, FIELD).await);
        assert!(h
            .store
            .get(&h.id)
            .await
            .unwrap()
            .template
            .auth_value(FIELD)
            .is_connected());

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        settle().await;
        assert_eq!(mutation.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_tick_response_is_discarded() {
        let (mutation, mut pending) = MockMutationService::manual();
        let mutation = Arc::new(mutation);
        let h = harness(mutation.clone()).await;
        let mut events = h.bus.subscribe();

        h.poller.start_polling_with_defaults(&h.id, FIELD).await.unwrap();
        let open = pending.recv().await.unwrap();
        open.respond(Ok(pending_link()));
        settle().await;

        tokio::time::sleep(Duration::from_millis(3_001)).await;
        let first = pending.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        let second = pending.recv().await.unwrap();

        let newer = auth_template("Gmail", FIELD, "https://accounts.example.com/oauth?step=2")
            .with_field("note", InputField::new("str", serde_json::json!("newer")));
        let older = auth_template("Gmail", FIELD, "https://accounts.example.com/oauth?step=1")
            .with_field("note", InputField::new("str", serde_json::json!("older")));

        second.respond(Ok(newer));
        settle().await;
        first.respond(Ok(older));
        settle().await;

        let record = h.store.get(&h.id).await.unwrap();
        assert_eq!(record.template.template["note"].value, serde_json::json!("newer"));

        let mut saw_discard = false;
        while let Ok(event) = events.try_recv() {
            if let NodeEvent::PollStaleDiscarded { seq, applied, .. } = event {
                assert_eq!((seq, applied), (1, 2));
                saw_discard = true;
            }
        }
        assert!(saw_discard);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_failures_are_swallowed() {
        let mutation = Arc::new(MockMutationService::new(|req| match req.operation {
            MutationOperation::OpenAuthorization => Ok(pending_link()),
            _ => Err(NodeflowError::mutation("validate", "connection reset")),
        }));
        let h = harness(mutation.clone()).await;

        h.poller.start_polling_with_defaults(&h.id, FIELD).await.unwrap();
        tokio::time::sleep(Duration::from_millis(9_001)).await;
        settle().await;

        assert!(h.poller.is_polling(&h.id, FIELD).await);
        assert_eq!(h.poller.ticks_issued(&h.id, FIELD).await, Some(3));
        assert!(h.errors.reports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn browser_launch_failure_keeps_polling() {
        let mutation = Arc::new(MockMutationService::replying(pending_link()));
        let h = harness_with_opener(mutation.clone(), RecordingUrlOpener::failing()).await;

        h.poller.start_polling_with_defaults(&h.id, FIELD).await.unwrap();
        settle().await;
        assert_eq!(
            h.opener.opened(),
            vec!["https://accounts.example.com/oauth".to_string()]
        );

        tokio::time::sleep(Duration::from_millis(6_001)).await;
        settle().await;

        assert!(h.poller.is_polling(&h.id, FIELD).await);
        assert_eq!(h.poller.ticks_issued(&h.id, FIELD).await, Some(2));
        assert_eq!(mutation.calls().len(), 3);
        assert!(h.errors.reports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_reports_and_ends_session() {
        let mutation = Arc::new(MockMutationService::failing("backend unavailable"));
        let h = harness(mutation.clone()).await;

        h.poller.start_polling_with_defaults(&h.id, FIELD).await.unwrap();
        settle().await;

        assert!(!h.poller.is_polling(&h.id, FIELD).await);
        let reports = h.errors.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].title, "Error while connecting the component");
        // Template untouched
        assert_eq!(h.store.get(&h.id).await.unwrap().revision, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_replaces_template_without_touching_sessions() {
        let mutation = Arc::new(MockMutationService::replying(auth_template("Gmail", FIELD, "")));
        let h = harness(mutation.clone()).await;

        h.poller.disconnect(&h.id, FIELD).await.unwrap();

        assert_eq!(h.poller.active_sessions().await, 0);
        assert_eq!(h.store.get(&h.id).await.unwrap().revision, 1);
        assert_eq!(mutation.calls()[0].operation, MutationOperation::Disconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_failure_reports_and_keeps_state() {
        let mutation = Arc::new(MockMutationService::failing("HTTP 500"));
        let h = harness(mutation).await;

        assert!(h.poller.disconnect(&h.id, FIELD).await.is_err());
        assert_eq!(h.errors.reports().len(), 1);
        assert_eq!(h.store.get(&h.id).await.unwrap().revision, 0);
    }

    #[tokio::test]
    async fn missing_auth_field_is_rejected() {
        let mutation = Arc::new(MockMutationService::replying(pending_link()));
        let h = harness(mutation).await;
        let plain = NodeId::from_str("plain");
        h.store
            .insert(NodeRecord::new(plain.clone(), NodeTemplate::new("Plain")))
            .await;

        let err = h
            .poller
            .start_polling_with_defaults(&plain, FIELD)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeflowError::AuthFieldNotFound { .. }));
        assert_eq!(h.poller.active_sessions().await, 0);
    }
}
