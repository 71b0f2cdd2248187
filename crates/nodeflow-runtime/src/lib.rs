pub mod connection;
pub mod coordinator;
pub mod polling;
pub mod presentation;
pub mod sinks;
pub mod status;
pub mod store;
pub mod trigger;

pub use connection::{ConnectOutcome, ConnectionController};
pub use coordinator::{Collaborators, NodeCoordinator, NodeView};
pub use polling::AuthPoller;
pub use sinks::{SystemUrlOpener, TracingAnalyticsSink, TracingErrorSink};
pub use status::BuildStatusMachine;
pub use store::{FlowPool, NodeFlags, NodeRecord, NodeStore};
pub use trigger::{BuildTrigger, RunOutcome};
