pub mod cache;
pub mod cipher;
pub mod error;
pub mod handler;
pub mod manager;
pub mod notify;
pub mod router;
pub mod schedule;
pub mod session;
pub mod store;
pub mod visitor;

use std::sync::Arc;

pub use error::AgendaError;
pub use manager::{BroadcastReport, ManagerSettings, SessionManager};
pub use session::{SessionHandle, SessionId};

/// External collaborators, built once at startup and shared by the manager
/// and every handler.
pub struct Services {
    pub storage: Arc<dyn store::Storage>,
    pub cache: Arc<dyn cache::Cache>,
    pub notifier: Arc<dyn notify::Notifier>,
    pub cipher: cipher::CipherSettings,
}
