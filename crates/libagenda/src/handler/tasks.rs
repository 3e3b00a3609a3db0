use agenda_protocol::model::{Period, Task, TaskUpdate, UserRecord, split_roles};
use agenda_protocol::{
    CreateTaskPayload, RemoveTaskPayload, ServerMessage, TaskCreated, TaskRemoved,
    UpdateTaskPayload,
};
use chrono::{DateTime, FixedOffset};
use std::sync::Arc;
use uuid::Uuid;

use super::{HandlerContext, parse_timestamp, require};
use crate::cipher::derive_id;
use crate::error::AgendaError;
use crate::notify::{Notification, NotificationKind};
use crate::schedule::window_in_bounds;
use crate::store::StoreError;

fn parse_window(
    start: &str,
    end: &str,
) -> Result<(DateTime<FixedOffset>, DateTime<FixedOffset>), AgendaError> {
    let start = parse_timestamp("start", start)?;
    let end = parse_timestamp("end", end)?;
    if !window_in_bounds(&start, &end) {
        return Err(AgendaError::TimeParse(format!(
            "task window {start} - {end} is outside bookable hours"
        )));
    }
    Ok((start, end))
}

fn new_tid() -> String {
    format!("tsk_{}", Uuid::new_v4().simple())
}

/// Cached identity for this address, checked against the `uid` the client sent.
async fn verify_identity(ctx: &HandlerContext, uid: &str) -> Result<UserRecord, AgendaError> {
    let Some(user) = ctx.cached_user().await? else {
        return Err(AgendaError::Permission(
            "no identity on record for this address".to_string(),
        ));
    };
    if user.uid != uid {
        return Err(AgendaError::Permission("requester id mismatch".to_string()));
    }
    Ok(user)
}

fn verify_owner(task: &Task, uid: &str) -> Result<(), AgendaError> {
    if task.owner != uid {
        return Err(AgendaError::Permission(format!(
            "task {} belongs to another requester",
            task.tid
        )));
    }
    Ok(())
}

pub(super) async fn handle_create_task(
    ctx: &HandlerContext,
    payload: CreateTaskPayload,
) -> Result<ServerMessage, AgendaError> {
    let (start, end) = parse_window(&payload.start, &payload.end)?;

    let user = match ctx.cached_user().await? {
        Some(user) if !user.is_anonymous() => user,
        cached => {
            // an address first seen through a visit keeps its id
            let uid = match cached {
                Some(visitor) => visitor.uid,
                None => derive_id(&ctx.session.remote_ip(), &ctx.manager.services().cipher),
            };
            let user = UserRecord {
                uid,
                name: payload.user_name,
                company: payload.company,
                email: payload.email,
                phone: payload.phone,
                roles: split_roles(&payload.roles),
            };
            ctx.store_user(&user).await?;
            tracing::info!(uid = %user.uid, "registered requester");
            user
        }
    };

    let task = Task {
        id: Uuid::new_v4(),
        tid: new_tid(),
        start,
        end,
        detail: payload.detail,
        method: payload.method.unwrap_or_default(),
        owner: user.uid.clone(),
    };
    let manager = Arc::clone(&ctx.manager);
    let deadline = ctx.deadline;
    let committed = task.clone();
    let requester = user.clone();
    ctx.manager
        .run_mutation(async move {
            let storage = &manager.services().storage;
            storage.insert_task(&committed, deadline).await?;
            tracing::info!(
                tid = %committed.tid,
                uid = %requester.uid,
                start = %committed.start,
                "task created"
            );

            if let Err(e) = storage.mark_visitor_booked(&requester.uid).await {
                tracing::warn!(
                    uid = %requester.uid,
                    error = %e,
                    "failed to flag visitor as booked"
                );
            }
            manager.notify(Notification::new(
                NotificationKind::TaskCreated,
                requester.clone(),
                Some(committed.clone()),
            ));
            manager.notify(Notification::new(
                NotificationKind::ThankYou,
                requester,
                Some(committed.clone()),
            ));

            manager.invalidate_schedules().await;
            manager.schedule_broadcast(Period::week_of(committed.start));
            Ok(())
        })
        .await?;

    Ok(ServerMessage::CreateTask(TaskCreated {
        task,
        uid: user.uid,
    }))
}

pub(super) async fn handle_update_task(
    ctx: &HandlerContext,
    payload: UpdateTaskPayload,
) -> Result<ServerMessage, AgendaError> {
    require("tid", &payload.tid)?;
    require("uid", &payload.uid)?;
    let (start, end) = parse_window(&payload.start, &payload.end)?;

    let user = verify_identity(ctx, &payload.uid).await?;
    let storage = &ctx.manager.services().storage;
    let existing = storage.fetch_task(&payload.tid).await?;
    verify_owner(&existing, &payload.uid)?;

    let update = TaskUpdate {
        start,
        end,
        detail: payload.detail,
    };
    let manager = Arc::clone(&ctx.manager);
    let deadline = ctx.deadline;
    let tid = payload.tid;
    let previous_week = Period::week_of(existing.start);
    let updated = ctx
        .manager
        .run_mutation(async move {
            let updated = manager
                .services()
                .storage
                .update_task(&tid, &update, deadline)
                .await?;
            tracing::info!(tid = %updated.tid, start = %updated.start, "task updated");

            manager.notify(Notification::new(
                NotificationKind::TaskEdited,
                user,
                Some(updated.clone()),
            ));

            manager.invalidate_schedules().await;
            manager.schedule_broadcast(previous_week.union(&Period::week_of(updated.start)));
            Ok(updated)
        })
        .await?;

    Ok(ServerMessage::UpdateTask(updated))
}

pub(super) async fn handle_remove_task(
    ctx: &HandlerContext,
    payload: RemoveTaskPayload,
) -> Result<ServerMessage, AgendaError> {
    require("tid", &payload.tid)?;
    require("uid", &payload.uid)?;

    let user = verify_identity(ctx, &payload.uid).await?;
    let storage = &ctx.manager.services().storage;
    let existing = match storage.fetch_task(&payload.tid).await {
        Ok(task) => task,
        Err(StoreError::NotFound(_)) => {
            tracing::debug!(tid = %payload.tid, "task already removed");
            return Ok(ServerMessage::RemoveTask(TaskRemoved { removed: 0 }));
        }
        Err(e) => return Err(e.into()),
    };
    verify_owner(&existing, &payload.uid)?;

    let manager = Arc::clone(&ctx.manager);
    let deadline = ctx.deadline;
    let removed = ctx
        .manager
        .run_mutation(async move {
            let removed = manager
                .services()
                .storage
                .delete_task(&existing.tid, deadline)
                .await?;
            if removed > 0 {
                tracing::info!(tid = %existing.tid, "task removed");
                let week = Period::week_of(existing.start);
                manager.notify(Notification::new(
                    NotificationKind::TaskDeleted,
                    user,
                    Some(existing),
                ));
                manager.invalidate_schedules().await;
                manager.schedule_broadcast(week);
            }
            Ok(removed)
        })
        .await?;

    Ok(ServerMessage::RemoveTask(TaskRemoved { removed }))
}
