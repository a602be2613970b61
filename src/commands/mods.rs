use crate::error::AppError;
use crate::identity::Identity;
use crate::state::AppState;
use serde_json::{json, Value};
use tracing::{info, warn};

/// Administrator-only: change the number of server slots.
pub fn resize(
    state: &AppState,
    caller: &Identity,
    slots: usize,
    force: bool,
) -> Result<Value, AppError> {
    if !state.config().is_admin(caller) {
        warn!("{caller} attempted to resize the pool to {slots}");
        return Err(AppError::NotAdmin(caller.clone()));
    }

    let report = state.resize_pool(slots, force)?;
    info!("Moderator {caller} resized {} slots to {slots}", report.from);

    let active = state
        .request_status()
        .iter()
        .filter(|s| s.is_active())
        .count();
    Ok(json!({
        "message": format!("Server trackers updated to {slots}. Current active servers: {active}."),
        "result": report,
    }))
}
