use agenda_protocol::{ConnCode, Envelope, ErrorReply, EventKind, InboundEvent, ServerMessage};
use std::sync::Arc;
use std::time::Instant;

use crate::error::AgendaError;
use crate::handler::{HandlerContext, handle_event};
use crate::manager::SessionManager;
use crate::session::SessionHandle;

/// What the inbound loop should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Decode one inbound text frame, run its handler and queue the reply.
///
/// Only an undecodable envelope or a dead outbound queue ends the session;
/// every other failure becomes an `error` reply.
pub async fn dispatch(
    manager: &Arc<SessionManager>,
    session: &Arc<SessionHandle>,
    raw: &str,
) -> Flow {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(session_id = %session.id(), error = %e, "undecodable envelope");
            let reply = ErrorReply::new(ConnCode::JsonDecodeError, format!("invalid message: {e}"));
            let _ = session.send(ServerMessage::Error(reply)).await;
            return Flow::Close;
        }
    };

    let result = match EventKind::from_tag(&envelope.kind) {
        None => Err(AgendaError::UnsupportedEvent(envelope.kind)),
        Some(kind) => match InboundEvent::decode(kind, envelope.payload) {
            Err(e) => Err(AgendaError::Decode(format!("{} payload: {e}", kind.tag()))),
            Ok(event) => run_handler(manager, session, event).await,
        },
    };

    let reply = match result {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(session_id = %session.id(), error = %e, "event failed");
            ServerMessage::Error(e.to_error_reply())
        }
    };

    match session.send(reply).await {
        Ok(()) => Flow::Continue,
        Err(_) => Flow::Close,
    }
}

async fn run_handler(
    manager: &Arc<SessionManager>,
    session: &Arc<SessionHandle>,
    event: InboundEvent,
) -> Result<ServerMessage, AgendaError> {
    let kind = event.kind();
    let limit = manager.event_timeout();
    let ctx = HandlerContext::new(
        Arc::clone(manager),
        Arc::clone(session),
        Instant::now() + limit,
    );
    tracing::debug!(session_id = %session.id(), event = kind.tag(), "dispatching event");
    match tokio::time::timeout(limit, handle_event(&ctx, event)).await {
        Ok(result) => result,
        Err(_) => Err(AgendaError::Timeout(limit)),
    }
}
