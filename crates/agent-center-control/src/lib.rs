//! Connection control plane for the agent center
pub mod admission;
pub mod command;
pub mod connection;
pub mod identity;
pub mod ingest;
pub mod metrics;
pub mod registry;
pub mod reporter;
pub mod session;

pub use admission::{AdmissionGate, AdmissionToken};
pub use command::{
    Command, CommandDispatcher, CommandReceipt, DispatchError, SessionMessage,
    DEFAULT_DISPATCH_TIMEOUT,
};
pub use connection::{AgentDetail, Connection, ConnectionInfo, EthInfo};
pub use identity::{
    ConnAuthRequest, DisabledIdentityResolver, HttpIdentityResolver, Identity, IdentityError,
    IdentityResolver, DEFAULT_AUTH_TIMEOUT,
};
pub use ingest::{DetailIngestor, FrameSink, IngestedFrame};
pub use metrics::{AgentCounters, Metrics, MetricsSnapshot};
pub use registry::{ConnectionRegistry, RegistryError};
pub use reporter::{BasicInfoReport, HeartbeatReporter, RebootEvent, ReportError, ReporterConfig};
pub use session::{
    CloseReason, SessionContext, SessionError, SessionState, SessionSummary, TransferSession,
};
