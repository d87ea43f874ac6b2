pub mod claim;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod ledger;
pub mod loopback;
pub mod query;
pub mod session;
pub mod transport;
pub mod upload;
pub mod wire;

pub use claim::{ClaimResult, ClaimTargets, ClaimedKey, KeyClaimCoordinator};
pub use client::KeysClient;
pub use config::ClientConfig;
pub use directory::{DirectoryError, KeyDirectory};
pub use error::KeysError;
pub use ledger::{PendingRequest, RequestId, RequestLedger};
pub use loopback::{Fault, LoopbackTransport};
pub use query::{KeyQueryCoordinator, QueryResult, RejectedDevice};
pub use session::{Session, SessionHandle};
pub use transport::{Method, Request, Transport, TransportFailure};
pub use upload::{KeyFormat, KeyUploadCoordinator, OneTimeKeyUpload};

#[cfg(feature = "http")]
pub use transport::HttpTransport;
