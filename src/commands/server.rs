use crate::error::AppError;
use crate::handoff::{Choice, PromptId};
use crate::identity::Identity;
use crate::state::{AppState, StartOutcome};
use serde_json::{json, Value};

const START_NOTICE: &str = "Server started. If you do not end or transfer ownership, \
    you only keep 10% of your previously tracked time when someone takes the slot over.";

/// Claim a slot; may suspend for the whole hand-off negotiation.
pub async fn start(state: &AppState, caller: &Identity, label: &str) -> Result<Value, AppError> {
    let outcome = state.request_start(caller, label).await?;
    let message = match &outcome {
        StartOutcome::Started { slot_index } => {
            format!("Slot {} is yours. {START_NOTICE}", slot_index + 1)
        }
        StartOutcome::TookOver {
            slot_index,
            previous_owner,
            ..
        } => format!(
            "Previous session of {previous_owner} ended. You now own slot {}.",
            slot_index + 1
        ),
        StartOutcome::NoSlot => {
            "Every owner kept their slot. Try again later.".to_string()
        }
        StartOutcome::NotConfirmed => {
            "Hand-off not confirmed in time, nothing changed.".to_string()
        }
    };

    Ok(json!({ "message": message, "result": outcome }))
}

pub fn status(state: &AppState) -> Result<Value, AppError> {
    let slots = state.request_status();
    let active = slots.iter().filter(|s| s.is_active()).count();
    let mut message = if active == 0 {
        "No server is currently being tracked.".to_string()
    } else {
        format!("{active} of {} slots active.", slots.len())
    };

    let degraded = state.stats().is_degraded();
    if degraded {
        message.push_str(" Stats are not being saved; totals may be lost on restart.");
    }

    Ok(json!({ "message": message, "slots": slots, "stats_degraded": degraded }))
}

pub fn end(state: &AppState, caller: &Identity) -> Result<Value, AppError> {
    let outcome = state.request_end(caller)?;
    Ok(json!({
        "message": "Your server session has been ended.",
        "result": outcome,
    }))
}

pub fn stats(state: &AppState, caller: &Identity) -> Result<Value, AppError> {
    let report = state.request_stats(caller);
    Ok(serde_json::to_value(report)?)
}

pub fn opt_out(state: &AppState, caller: &Identity) -> Result<Value, AppError> {
    let opted_out = state.toggle_opt_out(caller);
    let message = if opted_out {
        "You have opted out of server tracking."
    } else {
        "You have opted back into server tracking."
    };
    Ok(json!({ "message": message, "opted_out": opted_out }))
}

pub fn respond(
    state: &AppState,
    caller: &Identity,
    prompt: PromptId,
    choice: Choice,
) -> Result<Value, AppError> {
    state.respond(prompt, caller, choice)?;
    Ok(json!({ "message": "Answer recorded.", "prompt": prompt, "choice": choice }))
}

/// Prompts the caller can answer right now.
pub fn prompts(state: &AppState, caller: &Identity) -> Result<Value, AppError> {
    let is_admin = state.config().is_admin(caller);
    let prompts: Vec<_> = state
        .pending_prompts()
        .into_iter()
        .filter(|p| p.addressee == *caller || (is_admin && !p.admin_choices.is_empty()))
        .collect();
    Ok(json!({ "prompts": prompts }))
}
