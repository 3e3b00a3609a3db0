use agenda_protocol::model::{Period, ScheduleResponse};
use agenda_protocol::{FetchSchedulePayload, ServerMessage};

use super::{HandlerContext, parse_timestamp};
use crate::error::AgendaError;

pub(super) async fn handle_fetch_schedule(
    ctx: &HandlerContext,
    payload: FetchSchedulePayload,
) -> Result<ServerMessage, AgendaError> {
    let start = parse_timestamp("periodStart", &payload.period_start)?;
    let end = parse_timestamp("periodEnd", &payload.period_end)?;
    if end < start {
        return Err(AgendaError::TimeParse(
            "periodEnd is before periodStart".to_string(),
        ));
    }

    let period = Period::between(start, end);
    ctx.session.set_period(period.clone()).await;

    let agenda = ctx.manager.fetch_schedule(&period).await?;
    tracing::debug!(
        session_id = %ctx.session.id(),
        tasks = agenda.tasks().count(),
        "schedule fetched"
    );
    Ok(ServerMessage::FetchSchedule(ScheduleResponse {
        current_period: period,
        agenda,
    }))
}
