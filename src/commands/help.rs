use super::ConsoleLine;
use clap::CommandFactory;
use serde_json::{json, Value};

/// Usage text generated from the console grammar.
pub fn help() -> Value {
    let usage = ConsoleLine::command().render_help().to_string();
    json!({
        "message": "Lines are '<your-id> <command> [args]'.",
        "usage": usage,
    })
}
