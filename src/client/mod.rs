//! Dashboard-side queue client: retry transport, typed calls and the queue
//! state machine that reconciles local view with the processor.

pub mod api;
mod error;
mod poller;
pub mod state;
pub mod transport;

pub use api::{QueueApi, StagedUpload};
pub use error::ClientError;
pub use poller::spawn_status_poller;
pub use state::{ClientSettings, Notice, Phase, QueueClient, QueueView, Reconciliation, Ui};
pub use transport::{
    ConnectionState, HttpBackend, ReqwestBackend, RetryPolicy, RetryTransport, TransportError,
};
