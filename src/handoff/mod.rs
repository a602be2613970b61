pub mod negotiator;
pub mod prompts;

pub use negotiator::{decide, Candidate, Decision, HandoffNegotiator, Transfer};
pub use prompts::{Choice, Prompt, PromptBoard, PromptId, PromptKind, PromptOutcome};
