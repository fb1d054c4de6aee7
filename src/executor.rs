use std::{path::PathBuf, time::Duration, time::Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::intent::{ActionKind, CommandIntent};
use crate::screen::{ElementKind, ScreenContext, TargetRef, UIElement};
use crate::trace::Span;

/// Error taxonomy for the whole pipeline. Partial-tolerant kinds (ocr,
/// detection) degrade capability; only fallback exhaustion is surfaced as a
/// failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CaptureFailed,
    OcrFailed,
    DetectionFailed,
    ResolverUnavailable,
    AmbiguousTarget,
    LowConfidence,
    StaleTarget,
    ExecutionTimeout,
    ExecutionFailed,
    VerificationMismatch,
    Superseded,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CaptureFailed => "capture_failed",
            ErrorKind::OcrFailed => "ocr_failed",
            ErrorKind::DetectionFailed => "detection_failed",
            ErrorKind::ResolverUnavailable => "resolver_unavailable",
            ErrorKind::AmbiguousTarget => "ambiguous_target",
            ErrorKind::LowConfidence => "low_confidence",
            ErrorKind::StaleTarget => "stale_target",
            ErrorKind::ExecutionTimeout => "execution_timeout",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::VerificationMismatch => "verification_mismatch",
            ErrorKind::Superseded => "superseded",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
}

impl ScrollDirection {
    pub fn parse(s: &str) -> ScrollDirection {
        if s.trim().eq_ignore_ascii_case("up") {
            ScrollDirection::Up
        } else {
            ScrollDirection::Down
        }
    }
}

/// Wire shape of the input-synthesis collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputRequest {
    Click { x: i32, y: i32 },
    Type { text: String },
    Scroll { direction: ScrollDirection, amount: i32 },
    Key { name: String },
}

#[async_trait]
pub trait InputSynthesizer: Send + Sync {
    async fn dispatch(&self, req: InputRequest) -> Result<()>;
}

/// Outcome of one executed command. `verified` is filled in by the
/// orchestrator after post-action comparison; absence of observed change is
/// recorded as unverified success, not failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub verified: bool,
    pub description: String,
    pub target: Option<TargetRef>,
    pub error: Option<ErrorKind>,
    pub duration_ms: u128,
    pub post_context_id: Option<Uuid>,
}

impl ActionResult {
    pub fn failed(error: ErrorKind, description: impl Into<String>, duration_ms: u128) -> Self {
        Self {
            success: false,
            verified: false,
            description: description.into(),
            target: None,
            error: Some(error),
            duration_ms,
            post_context_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub timeout_ms: u64,
    pub default_scroll_amount: i32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            default_scroll_amount: 3,
        }
    }
}

/// Translates a resolved intent into input-synthesis requests and applies
/// them with a bounded timeout. Never guesses coordinates: an id that does
/// not resolve against the passed context fails fast as a stale target.
pub struct ActionExecutor {
    input: Arc<dyn InputSynthesizer>,
    cfg: ExecutorConfig,
    data_dir: PathBuf,
}

impl ActionExecutor {
    pub fn new(input: Arc<dyn InputSynthesizer>, cfg: ExecutorConfig, data_dir: PathBuf) -> Self {
        Self { input, cfg, data_dir }
    }

    pub async fn execute(
        &self,
        command_id: &str,
        intent: &CommandIntent,
        context: &ScreenContext,
    ) -> ActionResult {
        let t0 = Instant::now();
        let span = Span::start(
            &self.data_dir,
            Some(command_id),
            "Execute",
            "EXEC.run",
            Some(serde_json::json!({
                "action": intent.action.as_str(),
                "has_target": intent.target.is_some(),
            })),
        );

        let fut = self.run_action(intent, context);
        let mut result = match tokio::time::timeout(Duration::from_millis(self.cfg.timeout_ms), fut).await
        {
            Ok(r) => r,
            Err(_) => ActionResult::failed(
                ErrorKind::ExecutionTimeout,
                format!("the {} action timed out", intent.action.as_str()),
                0,
            ),
        };
        result.duration_ms = t0.elapsed().as_millis();

        match result.error {
            None => span.ok(Some(serde_json::json!({"description": result.description}))),
            Some(kind) => span.err(
                if kind == ErrorKind::ExecutionTimeout { "timeout" } else { "logic" },
                "E_EXEC",
                kind.as_str(),
                None,
            ),
        }
        result
    }

    async fn run_action(&self, intent: &CommandIntent, context: &ScreenContext) -> ActionResult {
        match intent.action {
            ActionKind::Read => self.run_read(context),
            ActionKind::Scroll => self.run_scroll(intent).await,
            ActionKind::Click | ActionKind::Navigate => self.run_click(intent, context).await,
            ActionKind::Type => self.run_type(intent, context).await,
            ActionKind::Unknown => ActionResult::failed(
                ErrorKind::ExecutionFailed,
                "I couldn't work out what to do with that command",
                0,
            ),
        }
    }

    /// Reads free text only; performs no synthesized input. A screen with no
    /// readable text is an empty read, not a failure.
    fn run_read(&self, context: &ScreenContext) -> ActionResult {
        let free = context.read_text();
        let description = if !free.is_empty() {
            free
        } else {
            let labels: Vec<String> = context
                .elements
                .iter()
                .filter_map(|e| e.text.clone())
                .collect();
            if labels.is_empty() {
                "The screen has no readable text".to_string()
            } else {
                labels.join("\n")
            }
        };
        ActionResult {
            success: true,
            verified: true, // nothing on screen is expected to change
            description,
            target: None,
            error: None,
            duration_ms: 0,
            post_context_id: None,
        }
    }

    async fn run_scroll(&self, intent: &CommandIntent) -> ActionResult {
        let direction = ScrollDirection::parse(
            intent
                .parameters
                .get("direction")
                .map(|s| s.as_str())
                .unwrap_or("down"),
        );
        let amount = intent
            .parameters
            .get("amount")
            .and_then(|s| s.parse::<i32>().ok())
            .unwrap_or(self.cfg.default_scroll_amount);
        match self.input.dispatch(InputRequest::Scroll { direction, amount }).await {
            Ok(()) => ActionResult {
                success: true,
                verified: false,
                description: format!(
                    "scrolled {}",
                    match direction {
                        ScrollDirection::Up => "up",
                        ScrollDirection::Down => "down",
                    }
                ),
                target: None,
                error: None,
                duration_ms: 0,
                post_context_id: None,
            },
            Err(e) => ActionResult::failed(ErrorKind::ExecutionFailed, format!("scroll failed: {e}"), 0),
        }
    }

    async fn run_click(&self, intent: &CommandIntent, context: &ScreenContext) -> ActionResult {
        let element = match self.require_target(intent, context) {
            Ok(e) => e,
            Err(r) => return r,
        };
        let c = element.rect.center();
        match self.input.dispatch(InputRequest::Click { x: c.x, y: c.y }).await {
            Ok(()) => ActionResult {
                success: true,
                verified: false,
                description: format!("clicked {}", element_label(element)),
                target: intent.target,
                error: None,
                duration_ms: 0,
                post_context_id: None,
            },
            Err(e) => ActionResult::failed(ErrorKind::ExecutionFailed, format!("click failed: {e}"), 0),
        }
    }

    async fn run_type(&self, intent: &CommandIntent, context: &ScreenContext) -> ActionResult {
        let text = match intent.parameters.get("text") {
            Some(t) if !t.trim().is_empty() => t.clone(),
            _ => {
                return ActionResult::failed(
                    ErrorKind::ExecutionFailed,
                    "there was no text to type",
                    0,
                )
            }
        };

        let mut focused_label = None;
        if let Some(target) = &intent.target {
            let element = match context.resolve_target(target) {
                Some(e) => e,
                None => return stale_target_result(intent.target),
            };
            // Focus the field first unless the detector already saw it focused.
            if element.kind == ElementKind::InputField && !element.focused {
                let c = element.rect.center();
                if let Err(e) = self.input.dispatch(InputRequest::Click { x: c.x, y: c.y }).await {
                    return ActionResult::failed(
                        ErrorKind::ExecutionFailed,
                        format!("could not focus {}: {e}", element_label(element)),
                        0,
                    );
                }
            }
            focused_label = Some(element_label(element));
        }

        match self.input.dispatch(InputRequest::Type { text: text.clone() }).await {
            Ok(()) => ActionResult {
                success: true,
                verified: false,
                description: match focused_label {
                    Some(l) => format!("typed \"{text}\" into {l}"),
                    None => format!("typed \"{text}\""),
                },
                target: intent.target,
                error: None,
                duration_ms: 0,
                post_context_id: None,
            },
            Err(e) => ActionResult::failed(ErrorKind::ExecutionFailed, format!("typing failed: {e}"), 0),
        }
    }

    fn require_target<'c>(
        &self,
        intent: &CommandIntent,
        context: &'c ScreenContext,
    ) -> std::result::Result<&'c UIElement, ActionResult> {
        let target = match &intent.target {
            Some(t) => t,
            None => {
                // Resolution either binds a target or asks for clarification;
                // reaching execution without one is a pipeline invariant breach.
                return Err(ActionResult::failed(
                    ErrorKind::Internal,
                    format!("the {} action reached execution without a target", intent.action.as_str()),
                    0,
                ))
            }
        };
        context.resolve_target(target).ok_or_else(|| stale_target_result(Some(*target)))
    }

    /// Key-press path for collaborators that expose shortcuts; not reachable
    /// from intent resolution, offered for embedding callers.
    pub async fn press_key(&self, name: &str) -> Result<()> {
        let fut = self.input.dispatch(InputRequest::Key { name: name.to_string() });
        tokio::time::timeout(Duration::from_millis(self.cfg.timeout_ms), fut)
            .await
            .map_err(|_| anyhow!("key press timed out"))?
    }
}

fn element_label(e: &UIElement) -> String {
    match e.text.as_deref() {
        Some(t) if !t.trim().is_empty() => format!("'{}'", t.trim()),
        _ => format!("the {}", e.kind.as_str()),
    }
}

fn stale_target_result(target: Option<TargetRef>) -> ActionResult {
    let mut r = ActionResult::failed(
        ErrorKind::StaleTarget,
        "the screen changed before I could act; please repeat the command",
        0,
    );
    r.target = target;
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::intent::IntentSourceKind;
    use crate::screen::test_support;
    use crate::screen::{ElementId, ElementKind};
    use std::sync::Mutex;

    struct RecordingInput {
        requests: Mutex<Vec<InputRequest>>,
        fail: bool,
        hang: bool,
    }

    impl RecordingInput {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                fail: false,
                hang: false,
            })
        }

        fn taken(&self) -> Vec<InputRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InputSynthesizer for RecordingInput {
        async fn dispatch(&self, req: InputRequest) -> Result<()> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail {
                return Err(anyhow!("synthetic input failure"));
            }
            self.requests.lock().unwrap().push(req);
            Ok(())
        }
    }

    fn executor(input: Arc<RecordingInput>) -> ActionExecutor {
        let td = std::env::temp_dir().join("vantage-exec-test");
        ActionExecutor::new(input, ExecutorConfig::default(), td)
    }

    fn click_intent(target: Option<TargetRef>) -> CommandIntent {
        let mut i = CommandIntent::new(ActionKind::Click, IntentSourceKind::Rules, 0.9);
        i.target = target;
        i
    }

    #[tokio::test]
    async fn click_dispatches_element_center() {
        let ctx = test_support::context(
            vec![test_support::element(
                0,
                ElementKind::Button,
                Rect::new(100, 200, 80, 40),
                Some("Submit"),
            )],
            Vec::new(),
        );
        let input = RecordingInput::new();
        let r = executor(input.clone())
            .execute("cmd-1", &click_intent(Some(ctx.target_for(ElementId(0)))), &ctx)
            .await;
        assert!(r.success);
        assert!(r.description.contains("Submit"));
        assert_eq!(input.taken(), vec![InputRequest::Click { x: 140, y: 220 }]);
    }

    #[tokio::test]
    async fn stale_target_fails_fast_and_never_succeeds() {
        let ctx = test_support::context(Vec::new(), Vec::new());
        let other = test_support::context(Vec::new(), Vec::new());
        let stale = TargetRef {
            context_id: other.context_id,
            element: ElementId(0),
        };
        let input = RecordingInput::new();
        let r = executor(input.clone())
            .execute("cmd-1", &click_intent(Some(stale)), &ctx)
            .await;
        assert!(!r.success);
        assert_eq!(r.error, Some(ErrorKind::StaleTarget));
        assert!(input.taken().is_empty());
    }

    #[tokio::test]
    async fn type_into_unfocused_field_clicks_first() {
        let ctx = test_support::context(
            vec![test_support::element(
                0,
                ElementKind::InputField,
                Rect::new(0, 0, 200, 30),
                Some("Search"),
            )],
            Vec::new(),
        );
        let mut intent = CommandIntent::new(ActionKind::Type, IntentSourceKind::Rules, 0.9);
        intent.target = Some(ctx.target_for(ElementId(0)));
        intent.parameters.insert("text".to_string(), "hello".to_string());

        let input = RecordingInput::new();
        let r = executor(input.clone()).execute("cmd-1", &intent, &ctx).await;
        assert!(r.success);
        let reqs = input.taken();
        assert_eq!(reqs.len(), 2);
        assert!(matches!(reqs[0], InputRequest::Click { .. }));
        assert_eq!(reqs[1], InputRequest::Type { text: "hello".to_string() });
    }

    #[tokio::test]
    async fn read_returns_element_labels_when_free_text_is_empty() {
        let ctx = test_support::context(
            vec![test_support::element(
                0,
                ElementKind::Button,
                Rect::new(0, 0, 80, 30),
                Some("Save"),
            )],
            Vec::new(),
        );
        let intent = CommandIntent::new(ActionKind::Read, IntentSourceKind::Rules, 0.9);
        let input = RecordingInput::new();
        let r = executor(input.clone()).execute("cmd-1", &intent, &ctx).await;
        assert!(r.success);
        assert_eq!(r.description, "Save");
        assert!(input.taken().is_empty());
    }

    #[tokio::test]
    async fn hung_synthesizer_times_out_instead_of_hanging() {
        let ctx = test_support::context(
            vec![test_support::element(
                0,
                ElementKind::Button,
                Rect::new(0, 0, 80, 30),
                Some("Go"),
            )],
            Vec::new(),
        );
        let input = Arc::new(RecordingInput {
            requests: Mutex::new(Vec::new()),
            fail: false,
            hang: true,
        });
        let exec = ActionExecutor::new(
            input,
            ExecutorConfig {
                timeout_ms: 20,
                default_scroll_amount: 3,
            },
            std::env::temp_dir().join("vantage-exec-test"),
        );
        let r = exec
            .execute("cmd-1", &click_intent(Some(ctx.target_for(ElementId(0)))), &ctx)
            .await;
        assert!(!r.success);
        assert_eq!(r.error, Some(ErrorKind::ExecutionTimeout));
    }

    #[tokio::test]
    async fn unbound_target_action_is_an_internal_error() {
        let ctx = test_support::context(Vec::new(), Vec::new());
        let input = RecordingInput::new();
        let r = executor(input.clone()).execute("cmd-1", &click_intent(None), &ctx).await;
        assert!(!r.success);
        assert_eq!(r.error, Some(ErrorKind::Internal));
        assert!(input.taken().is_empty());
    }

    #[tokio::test]
    async fn press_key_dispatches_a_key_request() {
        let input = RecordingInput::new();
        executor(input.clone()).press_key("enter").await.expect("press");
        assert_eq!(input.taken(), vec![InputRequest::Key { name: "enter".to_string() }]);
    }

    #[tokio::test]
    async fn failing_synthesizer_maps_to_execution_failed() {
        let input = Arc::new(RecordingInput {
            requests: Mutex::new(Vec::new()),
            fail: true,
            hang: false,
        });
        let mut intent = CommandIntent::new(ActionKind::Scroll, IntentSourceKind::Rules, 0.9);
        intent.parameters.insert("direction".to_string(), "down".to_string());
        let ctx = test_support::context(Vec::new(), Vec::new());
        let r = executor(input).execute("cmd-1", &intent, &ctx).await;
        assert!(!r.success);
        assert_eq!(r.error, Some(ErrorKind::ExecutionFailed));
    }
}
