use agenda_protocol::model::{UserRecord, Visitor};
use std::net::IpAddr;

use crate::Services;
use crate::cache::user_key;
use crate::cipher::derive_id;
use crate::error::AgendaError;

/// Requester record cached for `ip`, if any.
pub async fn cached_user(
    services: &Services,
    ip: IpAddr,
) -> Result<Option<UserRecord>, AgendaError> {
    let key = user_key(&ip);
    let Some(raw) = services.cache.get(&key).await? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|_| AgendaError::TypeCast(key))
}

pub async fn store_user(
    services: &Services,
    ip: IpAddr,
    user: &UserRecord,
) -> Result<(), AgendaError> {
    let raw = serde_json::to_string(user).map_err(|e| AgendaError::Encode(e.to_string()))?;
    services.cache.set(&user_key(&ip), raw).await?;
    Ok(())
}

/// Count a visit from `ip`.
///
/// A first-time address gets a derived id and an anonymous cached record, so
/// a later booking from the same address resolves to the same requester.
pub async fn record_visit(services: &Services, ip: IpAddr) -> Result<Visitor, AgendaError> {
    let uid = match cached_user(services, ip).await? {
        Some(user) => user.uid,
        None => {
            let user = UserRecord {
                uid: derive_id(&ip, &services.cipher),
                ..UserRecord::default()
            };
            store_user(services, ip, &user).await?;
            user.uid
        }
    };
    Ok(services.storage.record_visit(&uid, &ip.to_string()).await?)
}
