//! Line-oriented console front end.
//!
//! Input lines are `<identity> <command> [args]`; every reply, prompt and
//! pool update goes out as one JSON object per line.

use crate::commands::{self, Request};
use crate::error::AppError;
use crate::handoff::Prompt;
use crate::identity::Identity;
use crate::slots::SlotStatus;
use crate::state::AppState;
use crate::transport::Transport;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Writes every event as a JSON line to the wrapped writer.
pub struct ConsoleTransport {
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleTransport {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn emit(&self, value: &Value) {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(out, "{value}").and_then(|_| out.flush()) {
            warn!("Failed to write console event: {}", e);
        }
    }
}

impl Transport for ConsoleTransport {
    fn prompt(&self, prompt: &Prompt) {
        self.emit(&json!({ "event": "prompt:posted", "prompt": prompt }));
    }

    fn notify_pool_changed(&self, status: &[SlotStatus]) {
        self.emit(&json!({ "event": "pool:updated", "slots": status }));
    }
}

fn reply(request: &Request, result: Result<Value, AppError>) -> Value {
    let mut event = json!({
        "event": "reply",
        "caller": request.caller,
        "command": request.command.name(),
    });
    match result {
        Ok(body) => event["ok"] = body,
        Err(e) => event["error"] = json!(e),
    }
    event
}

async fn handle(state: &AppState, console: &ConsoleTransport, request: Request) {
    let result = commands::execute(state, request.clone()).await;
    console.emit(&reply(&request, result));
}

/// Works through one caller's ordered requests until their queue closes.
async fn serve_caller(
    state: Arc<AppState>,
    console: Arc<ConsoleTransport>,
    mut queue: mpsc::UnboundedReceiver<Request>,
) {
    while let Some(request) = queue.recv().await {
        handle(&state, &console, request).await;
    }
}

/// Routes requests onto per-caller queues or straight onto their own task.
struct Dispatcher {
    state: Arc<AppState>,
    console: Arc<ConsoleTransport>,
    queues: HashMap<Identity, mpsc::UnboundedSender<Request>>,
    tasks: JoinSet<()>,
}

impl Dispatcher {
    fn new(state: Arc<AppState>, console: Arc<ConsoleTransport>) -> Self {
        Self {
            state,
            console,
            queues: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    fn dispatch(&mut self, request: Request) {
        if !request.command.runs_in_caller_order() {
            let state = self.state.clone();
            let console = self.console.clone();
            self.tasks
                .spawn(async move { handle(&state, &console, request).await });
            return;
        }

        let request = match self.queues.get(&request.caller) {
            Some(queue) => match queue.send(request) {
                Ok(()) => return,
                // Worker is gone; start a fresh one below
                Err(mpsc::error::SendError(request)) => request,
            },
            None => request,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let caller = request.caller.clone();
        let _ = tx.send(request);
        self.queues.insert(caller, tx);
        self.tasks
            .spawn(serve_caller(self.state.clone(), self.console.clone(), rx));
    }

    fn reap(&self, joined: Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            if !e.is_cancelled() {
                error!("Request task failed: {}", e);
            }
        }
    }

    /// Let queued and in-flight requests finish. Anything still running
    /// after `grace` (or at ctrl-c) is abandoned.
    async fn drain(&mut self, grace: Duration) {
        // Closing the queues lets each caller worker exit once it is empty
        self.queues.clear();

        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = self.tasks.join_next() => match joined {
                    Some(joined) => self.reap(joined),
                    None => return,
                },
                _ = &mut deadline => {
                    warn!("Abandoning {} unfinished request(s)", self.tasks.len());
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted while draining");
                    break;
                }
            }
        }
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }
}

/// Serve `input` until EOF or ctrl-c, then credit active owners and flush.
///
/// Ownership commands from one caller run in arrival order; different
/// callers run concurrently, so a `start` waiting on a hand-off does not
/// hold up the `respond` that answers it. At EOF every accepted request is
/// allowed to finish, bounded by the longest possible negotiation.
pub async fn run_console<R>(
    state: Arc<AppState>,
    console: Arc<ConsoleTransport>,
    input: R,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut dispatcher = Dispatcher::new(state.clone(), console.clone());
    let mut interrupted = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match commands::parse_line(&line) {
                    Ok(request) => dispatcher.dispatch(request),
                    Err(e) => console.emit(&json!({ "event": "reply", "error": e })),
                }
            }
            Some(joined) = dispatcher.tasks.join_next() => dispatcher.reap(joined),
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                interrupted = true;
                break;
            }
        }
    }

    if interrupted {
        dispatcher.queues.clear();
        dispatcher.tasks.abort_all();
        while dispatcher.tasks.join_next().await.is_some() {}
    } else {
        // A confirmation plus one prompt per owner, each up to one window
        let rounds = state.request_status().len() as u32 + 1;
        let grace = state.config().prompt_window() * rounds + Duration::from_secs(1);
        debug!("Input closed, draining requests for up to {:?}", grace);
        dispatcher.drain(grace).await;
    }

    state.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use crate::config::TrackerConfig;
    use crate::stats::snapshot::testing::MemoryPort;
    use crate::stats::StatsStore;

    /// Shared buffer standing in for stdout.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn events(&self) -> Vec<Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    async fn console_state(config: TrackerConfig) -> (Arc<AppState>, Arc<ConsoleTransport>, Captured) {
        let captured = Captured::default();
        let console = Arc::new(ConsoleTransport::new(Box::new(captured.clone())));
        let stats = StatsStore::open(Arc::new(MemoryPort::default()))
            .await
            .unwrap();
        let state = AppState::new(
            config,
            stats,
            Arc::new(crate::clock::SystemClock),
            console.clone(),
        )
        .unwrap();
        (state, console, captured)
    }

    fn replies_from<'a>(events: &'a [Value], caller: &str) -> Vec<&'a Value> {
        events
            .iter()
            .filter(|e| e["event"] == "reply" && e["caller"] == caller)
            .collect()
    }

    fn request() -> Request {
        Request {
            caller: Identity::from("42"),
            command: Command::End,
        }
    }

    #[test]
    fn reply_carries_body_on_success() {
        let event = reply(&request(), Ok(json!({ "message": "done" })));
        assert_eq!(event["event"], "reply");
        assert_eq!(event["caller"], "42");
        assert_eq!(event["command"], "end");
        assert_eq!(event["ok"]["message"], "done");
        assert!(event.get("error").is_none());
    }

    #[test]
    fn reply_renders_error_as_string() {
        let event = reply(&request(), Err(AppError::NotOwner(Identity::from("42"))));
        assert_eq!(event["error"], "42 does not own a slot");
        assert!(event.get("ok").is_none());
    }

    #[tokio::test]
    async fn piped_input_is_answered_in_caller_order() {
        let (state, console, captured) = console_state(TrackerConfig {
            slots: 2,
            ..TrackerConfig::default()
        })
        .await;
        let input: &[u8] = b"a start X7\nb start Y\na status\na end\n\nbogus\n";

        run_console(state.clone(), console, input).await.unwrap();

        let events = captured.events();
        let a = replies_from(&events, "a");
        let commands: Vec<&str> = a.iter().map(|e| e["command"].as_str().unwrap()).collect();
        assert_eq!(commands, ["start", "status", "end"]);
        assert!(a.iter().all(|e| e.get("error").is_none()), "{a:?}");
        assert!(a[1]["ok"]["slots"]
            .as_array()
            .unwrap()
            .iter()
            .any(|s| s["owner"] == "a"));

        assert_eq!(replies_from(&events, "b").len(), 1);
        // The unparsable line still gets a reply
        assert_eq!(
            events
                .iter()
                .filter(|e| e["event"] == "reply" && e.get("caller").is_none())
                .count(),
            1
        );
        assert!(events.iter().any(|e| e["event"] == "pool:updated"));
    }

    #[tokio::test]
    async fn negotiation_pending_at_eof_is_finished_not_dropped() {
        let (state, console, captured) = console_state(TrackerConfig {
            slots: 1,
            prompt_timeout_ms: 20,
            require_confirmation: false,
            ..TrackerConfig::default()
        })
        .await;
        state
            .request_start(&Identity::from("a"), "X7")
            .await
            .unwrap();
        let input: &[u8] = b"b start Y\n";

        run_console(state.clone(), console, input).await.unwrap();

        let events = captured.events();
        assert!(events.iter().any(|e| e["event"] == "prompt:posted"));
        let b = replies_from(&events, "b");
        assert_eq!(b.len(), 1);
        assert_eq!(b[0]["ok"]["result"]["outcome"], "took_over");
        assert_eq!(b[0]["ok"]["result"]["transfer"], "timed_out");
        assert_eq!(state.request_status()[0].owner, Some(Identity::from("b")));
    }
}
