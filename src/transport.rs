use crate::handoff::Prompt;
use crate::slots::SlotStatus;

/// Callbacks into whatever carries messages to people (chat bot, console).
///
/// Both calls are notifications and must not block; answers to a prompt
/// come back through `AppState::respond`.
pub trait Transport: Send + Sync {
    /// Show a prompt to its addressee (and administrators, if it has
    /// admin choices).
    fn prompt(&self, prompt: &Prompt);

    /// Ownership or capacity changed; refresh any pinned status view.
    fn notify_pool_changed(&self, status: &[SlotStatus]);
}
