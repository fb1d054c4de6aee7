use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use uuid::Uuid;

use crate::context_builder::ScreenContextBuilder;
use crate::conversation::{ConversationStore, Turn};
use crate::executor::{ActionExecutor, ActionResult, ErrorKind};
use crate::history::{self, TurnRow};
use crate::intent::{ActionKind, CommandIntent};
use crate::metrics::{self, CommandMetrics};
use crate::resolver::IntentResolver;
use crate::screen::ScreenContext;
use crate::trace::Span;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

const VERIFY_INFLATE_PX: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Capturing,
    Resolving,
    AwaitingClarification,
    Executing,
    Verifying,
    Reporting,
    Failed,
}

impl OrchestratorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::Capturing => "capturing",
            OrchestratorState::Resolving => "resolving",
            OrchestratorState::AwaitingClarification => "awaiting_clarification",
            OrchestratorState::Executing => "executing",
            OrchestratorState::Verifying => "verifying",
            OrchestratorState::Reporting => "reporting",
            OrchestratorState::Failed => "failed",
        }
    }
}

/// Outward voice of the assistant. Called once per finished turn, whether it
/// acted, failed, or asked a question.
pub trait Reporter: Send + Sync {
    fn report(&self, turn: &Turn);
}

struct PendingClarification {
    command_text: String,
    intent: CommandIntent,
    context: Arc<ScreenContext>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub session_id: String,
    pub history_capacity: usize,
    pub prompt_history_turns: usize,
    /// sqlite file for persisted turns; `None` keeps history in memory only.
    pub db_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            history_capacity: 50,
            prompt_history_turns: 3,
            db_path: None,
        }
    }
}

/// Drives one command at a time through capture, resolution, execution,
/// verification and reporting. Commands queue behind the one in flight; a
/// queued command that has already been displaced by a newer one is reported
/// as superseded without touching the screen.
pub struct Orchestrator {
    builder: Arc<ScreenContextBuilder>,
    resolver: IntentResolver,
    executor: ActionExecutor,
    reporter: Arc<dyn Reporter>,
    store: ConversationStore,
    cfg: OrchestratorConfig,
    data_dir: PathBuf,
    state: OrchestratorState,
    pending: Option<PendingClarification>,
    queue: VecDeque<String>,
}

impl Orchestrator {
    pub fn new(
        builder: Arc<ScreenContextBuilder>,
        resolver: IntentResolver,
        executor: ActionExecutor,
        reporter: Arc<dyn Reporter>,
        cfg: OrchestratorConfig,
        data_dir: PathBuf,
    ) -> Self {
        let store = ConversationStore::new(cfg.history_capacity);
        Self {
            builder,
            resolver,
            executor,
            reporter,
            store,
            cfg,
            data_dir,
            state: OrchestratorState::Idle,
            pending: None,
            queue: VecDeque::new(),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn submit(&mut self, command: &str) {
        self.queue.push_back(command.to_string());
    }

    /// Processes the oldest queued command. Returns `None` when the queue is
    /// empty. Commands displaced by a newer submission are finished as
    /// superseded instead of executed.
    pub async fn process_next(&mut self) -> Option<Turn> {
        let command = self.queue.pop_front()?;
        if !self.queue.is_empty() {
            let turn = self.finish_turn(
                &command,
                CommandIntent::unknown(&command, crate::intent::IntentSourceKind::Rules, 0.0),
                None,
                ActionResult::failed(
                    ErrorKind::Superseded,
                    "a newer command replaced this one",
                    0,
                ),
            );
            return Some(turn);
        }
        Some(self.handle_command(&command).await)
    }

    /// Runs the whole pipeline for one command and always produces a turn.
    pub async fn handle_command(&mut self, command: &str) -> Turn {
        let command_id = Uuid::new_v4().to_string();
        let t0 = Instant::now();
        let span = Span::start(
            &self.data_dir,
            Some(command_id.as_str()),
            "Orchestrate",
            "ORCH.command",
            Some(serde_json::json!({"chars": command.len()})),
        );

        // A pending question first gets the chance to consume this utterance
        // as its answer.
        if let Some(pending) = self.pending.take() {
            match interpret_answer(command, &pending) {
                Answer::Pick(intent) => {
                    let turn = self
                        .execute_answer(&command_id, &pending.command_text, intent, &pending.context, t0)
                        .await;
                    span.ok(Some(serde_json::json!({"clarified": true})));
                    return turn;
                }
                Answer::Confirmed(mut intent) => {
                    // The question skipped target binding; bind now against
                    // the context the question was asked about.
                    crate::resolver::bind_target(&mut intent, &pending.context);
                    let turn = if intent.needs_clarification {
                        self.ask(&command_id, &pending.command_text, intent, &pending.context, 0, 0, t0)
                    } else {
                        self.execute_answer(&command_id, &pending.command_text, intent, &pending.context, t0)
                            .await
                    };
                    span.ok(Some(serde_json::json!({"confirmed": true})));
                    return turn;
                }
                Answer::Declined => {
                    let result = ActionResult {
                        success: false,
                        verified: false,
                        description: "Okay, I won't do that.".to_string(),
                        target: None,
                        error: None,
                        duration_ms: t0.elapsed().as_millis(),
                        post_context_id: None,
                    };
                    let turn = self.finish_turn(
                        &pending.command_text,
                        pending.intent,
                        Some(pending.context.context_id),
                        result,
                    );
                    self.emit_metrics(&command_id, &turn, 0, 0, 0, t0.elapsed().as_millis());
                    span.ok(Some(serde_json::json!({"declined": true})));
                    return turn;
                }
                // Not an answer; fall through and treat it as a fresh command.
                Answer::NotAnAnswer => {}
            }
        }

        self.state = OrchestratorState::Capturing;
        let t_capture = Instant::now();
        let context = match self.builder.build(false).await {
            Ok(c) => c,
            Err(e) => {
                let result = ActionResult::failed(
                    ErrorKind::CaptureFailed,
                    format!("I couldn't see the screen: {e}"),
                    t0.elapsed().as_millis(),
                );
                let turn = self.finish_turn(
                    command,
                    CommandIntent::unknown(command, crate::intent::IntentSourceKind::Rules, 0.0),
                    None,
                    result,
                );
                self.emit_metrics(&command_id, &turn, t_capture.elapsed().as_millis(), 0, 0, t0.elapsed().as_millis());
                span.err("logic", "E_CAPTURE", "capture failed", None);
                return turn;
            }
        };
        let capture_ms = t_capture.elapsed().as_millis();

        self.state = OrchestratorState::Resolving;
        let t_resolve = Instant::now();
        let history_rendering = self.render_history();
        let intent = self
            .resolver
            .resolve(&command_id, command, &context, &history_rendering)
            .await;
        let resolve_ms = t_resolve.elapsed().as_millis();

        if intent.needs_clarification {
            let turn = self.ask(&command_id, command, intent, &context, capture_ms, resolve_ms, t0);
            span.ok(Some(serde_json::json!({"asked": true})));
            return turn;
        }

        self.state = OrchestratorState::Executing;
        let t_exec = Instant::now();
        let result = self.executor.execute(&command_id, &intent, &context).await;
        let result = self.verify(&command_id, &intent, &context, result).await;
        let execute_ms = t_exec.elapsed().as_millis();

        let turn = self.finish_turn(command, intent, Some(context.context_id), result);
        self.emit_metrics(&command_id, &turn, capture_ms, resolve_ms, execute_ms, t0.elapsed().as_millis());
        span.ok(Some(serde_json::json!({
            "success": turn.result.success,
            "verified": turn.result.verified,
        })));
        turn
    }

    /// Post-action check: recapture and compare what should have changed.
    /// An unchanged screen after a successful action stays a success, only
    /// flagged as unverified.
    async fn verify(
        &mut self,
        command_id: &str,
        intent: &CommandIntent,
        pre: &ScreenContext,
        mut result: ActionResult,
    ) -> ActionResult {
        if !result.success {
            return result;
        }
        let span = Span::start(&self.data_dir, Some(command_id), "Verify", "VERIFY.run", None);
        if intent.action == ActionKind::Read {
            span.skipped("read leaves the screen unchanged", None);
            return result;
        }
        self.state = OrchestratorState::Verifying;

        let post = match self.builder.build(true).await {
            Ok(p) => p,
            Err(e) => {
                span.err("logic", "E_VERIFY_RECAPTURE", &e.to_string(), None);
                return result;
            }
        };
        result.post_context_id = Some(post.context_id);

        let changed = match (&intent.target, intent.action) {
            // Scroll and navigation move content anywhere on screen.
            (_, ActionKind::Scroll) | (_, ActionKind::Navigate) => {
                pre.screen_signature() != post.screen_signature()
            }
            (Some(target), _) => match pre.resolve_target(target) {
                Some(e) => {
                    let region = e.rect.inflate(VERIFY_INFLATE_PX);
                    pre.region_signature(&region) != post.region_signature(&region)
                }
                None => pre.screen_signature() != post.screen_signature(),
            },
            (None, _) => pre.screen_signature() != post.screen_signature(),
        };

        if changed {
            result.verified = true;
        } else {
            result.verified = false;
            result.error = Some(ErrorKind::VerificationMismatch);
        }
        span.ok(Some(serde_json::json!({"changed": changed})));
        result
    }

    /// Executes an intent produced by answering a pending question, against
    /// the context the question was asked about.
    async fn execute_answer(
        &mut self,
        command_id: &str,
        command_text: &str,
        intent: CommandIntent,
        context: &Arc<ScreenContext>,
        t0: Instant,
    ) -> Turn {
        let t_exec = Instant::now();
        self.state = OrchestratorState::Executing;
        let result = self.executor.execute(command_id, &intent, context).await;
        let result = self.verify(command_id, &intent, context, result).await;
        let turn = self.finish_turn(command_text, intent, Some(context.context_id), result);
        self.emit_metrics(command_id, &turn, 0, 0, t_exec.elapsed().as_millis(), t0.elapsed().as_millis());
        turn
    }

    /// Surfaces a clarification question and pauses on it. The turn carries
    /// the taxonomy kind of what blocked execution so structured consumers
    /// can tell a choice question from a confirmation question.
    #[allow(clippy::too_many_arguments)]
    fn ask(
        &mut self,
        command_id: &str,
        command_text: &str,
        intent: CommandIntent,
        context: &Arc<ScreenContext>,
        capture_ms: u128,
        resolve_ms: u128,
        t0: Instant,
    ) -> Turn {
        let prompt = intent
            .clarification
            .clone()
            .unwrap_or_else(|| "Could you say that again?".to_string());
        let error = if !intent.candidates.is_empty() {
            Some(ErrorKind::AmbiguousTarget)
        } else if intent.awaiting_confirmation {
            Some(ErrorKind::LowConfidence)
        } else {
            None
        };
        self.pending = Some(PendingClarification {
            command_text: command_text.to_string(),
            intent: intent.clone(),
            context: context.clone(),
        });
        self.state = OrchestratorState::AwaitingClarification;
        let result = ActionResult {
            success: false,
            verified: false,
            description: prompt,
            target: None,
            error,
            duration_ms: t0.elapsed().as_millis(),
            post_context_id: None,
        };
        let turn = self.report_turn(command_text, intent, Some(context.context_id), result);
        self.emit_metrics(command_id, &turn, capture_ms, resolve_ms, 0, t0.elapsed().as_millis());
        turn
    }

    fn finish_turn(
        &mut self,
        command: &str,
        intent: CommandIntent,
        context_id: Option<Uuid>,
        result: ActionResult,
    ) -> Turn {
        self.state = closing_state(&result);
        let turn = self.report_turn(command, intent, context_id, result);
        self.state = OrchestratorState::Idle;
        turn
    }

    fn report_turn(
        &mut self,
        command: &str,
        intent: CommandIntent,
        context_id: Option<Uuid>,
        result: ActionResult,
    ) -> Turn {
        let turn = Turn {
            turn_id: Uuid::new_v4(),
            session_id: self.cfg.session_id.clone(),
            command_text: command.to_string(),
            intent,
            context_id,
            result,
            ts_ms: now_ms(),
        };
        self.store.push(turn.clone());
        if let Some(db) = &self.cfg.db_path {
            if let Ok(row) = TurnRow::from_turn(&turn) {
                let _ = history::append(db, &row);
            }
        }
        self.reporter.report(&turn);
        turn
    }

    fn emit_metrics(
        &self,
        command_id: &str,
        turn: &Turn,
        capture_ms: u128,
        resolve_ms: u128,
        execute_ms: u128,
        total_ms: u128,
    ) {
        let m = CommandMetrics {
            record_type: "command_done",
            command_id: command_id.to_string(),
            session_id: self.cfg.session_id.clone(),
            action: turn.intent.action.as_str().to_string(),
            resolver_source: turn.intent.source.as_str().to_string(),
            confidence: turn.intent.confidence,
            success: turn.result.success,
            verified: turn.result.verified,
            error: turn.result.error.map(|e| e.as_str().to_string()),
            capture_ms,
            resolve_ms,
            execute_ms,
            total_ms,
        };
        let _ = metrics::append_jsonl(&self.data_dir, &m);
    }

    /// "user: ... / assistant: ..." lines for the model prompt, oldest first.
    fn render_history(&self) -> String {
        let mut out = String::new();
        for t in self.store.recent(self.cfg.prompt_history_turns) {
            out.push_str(&format!("user: {}\n", t.command_text));
            out.push_str(&format!("assistant: {}\n", t.result.description));
        }
        out
    }
}

/// Failed results pass through `Failed` on their way to the report; a
/// question or a declined confirmation is not a failure and closes through
/// `Reporting` directly.
fn closing_state(result: &ActionResult) -> OrchestratorState {
    if !result.success && result.error.is_some() {
        OrchestratorState::Failed
    } else {
        OrchestratorState::Reporting
    }
}

enum Answer {
    /// A pick from the pending candidate set, target already bound.
    Pick(CommandIntent),
    /// An affirmative reply to a yes/no question; target still unbound.
    Confirmed(CommandIntent),
    /// A negative reply to a yes/no question.
    Declined,
    NotAnAnswer,
}

const AFFIRMATIVE: &[&str] = &[
    "yes", "yeah", "yep", "sure", "ok", "okay", "do it", "go ahead", "confirm", "yes please",
];
const NEGATIVE: &[&str] = &[
    "no", "nope", "cancel", "stop", "don't", "do not", "never mind", "nevermind", "forget it",
];

/// Reads `answer` against the pending question. Candidate questions accept
/// a 1-based number, an ordinal word, or a unique case-insensitive substring
/// of one candidate's label; yes/no questions accept affirmative or negative
/// phrases. Anything else was not an answer at all.
fn interpret_answer(answer: &str, pending: &PendingClarification) -> Answer {
    let trimmed = answer
        .trim()
        .trim_end_matches(['.', '!', '?'])
        .trim()
        .to_ascii_lowercase();

    if pending.intent.candidates.is_empty() {
        if !pending.intent.awaiting_confirmation {
            return Answer::NotAnAnswer;
        }
        if AFFIRMATIVE.contains(&trimmed.as_str()) {
            let mut intent = pending.intent.clone();
            intent.needs_clarification = false;
            intent.clarification = None;
            intent.awaiting_confirmation = false;
            return Answer::Confirmed(intent);
        }
        if NEGATIVE.contains(&trimmed.as_str()) {
            return Answer::Declined;
        }
        return Answer::NotAnAnswer;
    }

    let n = pending.intent.candidates.len();
    let index = trimmed
        .parse::<usize>()
        .ok()
        .filter(|i| (1..=n).contains(i))
        .map(|i| i - 1)
        .or_else(|| ordinal_index(&trimmed).filter(|i| *i < n))
        .or_else(|| {
            let matches: Vec<usize> = pending
                .intent
                .candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| {
                    c.text
                        .as_deref()
                        .map(|t| t.to_ascii_lowercase().contains(&trimmed))
                        .unwrap_or(false)
                })
                .map(|(i, _)| i)
                .collect();
            match matches.as_slice() {
                [one] => Some(*one),
                _ => None,
            }
        });
    let index = match index {
        Some(i) => i,
        None => return Answer::NotAnAnswer,
    };

    let candidate = &pending.intent.candidates[index];
    let mut intent = pending.intent.clone();
    intent.target = Some(pending.context.target_for(candidate.element));
    intent.needs_clarification = false;
    intent.clarification = None;
    intent.candidates = Vec::new();
    Answer::Pick(intent)
}

fn ordinal_index(word: &str) -> Option<usize> {
    match word {
        "first" | "the first" | "first one" | "the first one" => Some(0),
        "second" | "the second" | "second one" | "the second one" => Some(1),
        "third" | "the third" | "third one" | "the third one" => Some(2),
        "fourth" | "the fourth" => Some(3),
        "fifth" | "the fifth" => Some(4),
        _ => None,
    }
}
