use agenda_protocol::ServerMessage;
use agenda_protocol::model::Period;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AgendaError;

pub type SessionId = Uuid;

/// Shared half of a connected visitor session.
///
/// The socket itself lives in the transport's pump tasks; this handle carries
/// what the registry and handlers need: the outbound queue, the viewed period
/// and the eviction token.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    remote_addr: SocketAddr,
    period: RwLock<Option<Period>>,
    outbound: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(
        remote_addr: SocketAddr,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            remote_addr,
            period: RwLock::new(None),
            outbound,
            cancel,
        };
        (handle, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Requester identity is keyed on the address without the port.
    pub fn remote_ip(&self) -> IpAddr {
        self.remote_addr.ip()
    }

    pub async fn set_period(&self, period: Period) {
        *self.period.write().await = Some(period);
    }

    pub async fn period(&self) -> Option<Period> {
        self.period.read().await.clone()
    }

    /// Queue a direct reply, waiting for room.
    pub async fn send(&self, msg: ServerMessage) -> Result<(), AgendaError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| AgendaError::SessionClosed)
    }

    /// Queue a pushed message without waiting.
    pub fn try_push(&self, msg: ServerMessage) -> Result<(), TrySendError<ServerMessage>> {
        self.outbound.try_send(msg)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
