use crate::error::PromptError;
use crate::identity::Identity;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

pub type PromptId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Choice {
    /// Requester agrees to walk the owners.
    Confirm,
    /// Owner hands over with full credit.
    End,
    /// Takeover with the forced discount.
    Overwrite,
    /// Owner keeps the slot.
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromptKind {
    /// Pool is full; does the requester want to negotiate?
    ConfirmHandoff,
    /// Ask a slot owner to give way.
    Handoff { slot_index: usize, owner: Identity },
}

/// A question posted to the transport, answered through [`PromptBoard::respond`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt {
    pub id: PromptId,
    #[serde(flatten)]
    pub kind: PromptKind,
    pub requester: Identity,
    pub addressee: Identity,
    pub choices: Vec<Choice>,
    /// Choices any administrator may make in the addressee's place.
    pub admin_choices: Vec<Choice>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    Answered { choice: Choice, by: Identity },
    TimedOut,
}

type Reply = (Choice, Identity);

struct Pending {
    prompt: Prompt,
    reply: oneshot::Sender<Reply>,
}

/// Prompts awaiting an answer, keyed by id.
#[derive(Default)]
pub struct PromptBoard {
    pending: Mutex<HashMap<PromptId, Pending>>,
}

impl PromptBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PromptId, Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a prompt. Await the answer with [`PromptBoard::wait`].
    pub fn post(&self, prompt: Prompt) -> oneshot::Receiver<Reply> {
        let (reply, rx) = oneshot::channel();
        self.lock().insert(prompt.id, Pending { prompt, reply });
        rx
    }

    /// Deliver an answer. The addressee may pick any offered choice, an
    /// administrator only the admin choices.
    pub fn respond(
        &self,
        id: PromptId,
        responder: &Identity,
        is_admin: bool,
        choice: Choice,
    ) -> Result<(), PromptError> {
        let mut pending = self.lock();
        let entry = pending.get(&id).ok_or(PromptError::NotFound(id))?;
        let prompt = &entry.prompt;

        let by_addressee = *responder == prompt.addressee && prompt.choices.contains(&choice);
        let by_admin = is_admin && prompt.admin_choices.contains(&choice);
        if !by_addressee && !by_admin {
            if !prompt.choices.contains(&choice) && !prompt.admin_choices.contains(&choice) {
                return Err(PromptError::ChoiceNotOffered(choice));
            }
            warn!("{responder} tried to answer prompt {id} addressed to {}", prompt.addressee);
            return Err(PromptError::NotAddressee(responder.clone()));
        }

        let Some(entry) = pending.remove(&id) else {
            return Err(PromptError::NotFound(id));
        };
        entry
            .reply
            .send((choice, responder.clone()))
            .map_err(|_| PromptError::NotFound(id))?;
        debug!("Prompt {id} answered by {responder}: {choice:?}");
        Ok(())
    }

    /// Wait for an answer until the window closes. The prompt is withdrawn
    /// either way.
    pub async fn wait(
        &self,
        id: PromptId,
        rx: oneshot::Receiver<Reply>,
        window: Duration,
    ) -> PromptOutcome {
        let outcome = match tokio::time::timeout(window, rx).await {
            Ok(Ok((choice, by))) => PromptOutcome::Answered { choice, by },
            Ok(Err(_)) | Err(_) => PromptOutcome::TimedOut,
        };
        self.lock().remove(&id);
        outcome
    }

    pub fn pending(&self) -> Vec<Prompt> {
        self.lock().values().map(|p| p.prompt.clone()).collect()
    }
}
