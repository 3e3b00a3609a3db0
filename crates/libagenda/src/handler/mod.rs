mod schedule;
mod tasks;


use agenda_protocol::model::UserRecord;
use agenda_protocol::{InboundEvent, ServerMessage};
use chrono::{DateTime, FixedOffset};
use std::sync::Arc;
use std::time::Instant;

use crate::error::AgendaError;
use crate::manager::SessionManager;
use crate::session::SessionHandle;
use crate::visitor;

/// What a handler can reach: the shared manager, the calling session and
/// the point after which storage must not be written.
pub struct HandlerContext {
    pub manager: Arc<SessionManager>,
    pub session: Arc<SessionHandle>,
    pub deadline: Instant,
}

impl HandlerContext {
    pub fn new(
        manager: Arc<SessionManager>,
        session: Arc<SessionHandle>,
        deadline: Instant,
    ) -> Self {
        Self {
            manager,
            session,
            deadline,
        }
    }

    /// Requester record cached for this connection's address, if any.
    async fn cached_user(&self) -> Result<Option<UserRecord>, AgendaError> {
        visitor::cached_user(self.manager.services(), self.session.remote_ip()).await
    }

    async fn store_user(&self, user: &UserRecord) -> Result<(), AgendaError> {
        visitor::store_user(self.manager.services(), self.session.remote_ip(), user).await
    }
}

/// Route a decoded event to its handler.
pub async fn handle_event(
    ctx: &HandlerContext,
    event: InboundEvent,
) -> Result<ServerMessage, AgendaError> {
    match event {
        InboundEvent::FetchSchedule(payload) => schedule::handle_fetch_schedule(ctx, payload).await,
        InboundEvent::CreateTask(payload) => tasks::handle_create_task(ctx, payload).await,
        InboundEvent::UpdateTask(payload) => tasks::handle_update_task(ctx, payload).await,
        InboundEvent::RemoveTask(payload) => tasks::handle_remove_task(ctx, payload).await,
    }
}

fn parse_timestamp(field: &'static str, raw: &str) -> Result<DateTime<FixedOffset>, AgendaError> {
    DateTime::parse_from_rfc3339(raw)
        .map_err(|e| AgendaError::TimeParse(format!("{field} '{raw}': {e}")))
}

fn require(field: &'static str, value: &str) -> Result<(), AgendaError> {
    if value.trim().is_empty() {
        return Err(AgendaError::MissingData(field));
    }
    Ok(())
}
