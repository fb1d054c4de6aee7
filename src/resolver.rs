use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;

use crate::geometry::center_distance_sq;
use crate::intent::{ActionKind, CommandIntent, IntentSourceKind, TargetCandidate};
use crate::llm::{build_prompt, param_as_string, parse_reply, LlmClient};
use crate::screen::{ElementKind, ScreenContext, UIElement};
use crate::trace::{self, Span};

/// One stage of the fallback chain. A source either proposes an intent or
/// errors; an error moves resolution to the next source, it never fails the
/// command by itself.
#[async_trait]
pub trait IntentSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn propose(
        &self,
        command: &str,
        context: &ScreenContext,
        history_rendering: &str,
    ) -> Result<CommandIntent>;
}

/// Primary source: asks the language model to parse the command against a
/// compact rendering of the screen.
pub struct ModelIntentSource {
    llm: Arc<dyn LlmClient>,
    render_max_chars: usize,
}

impl ModelIntentSource {
    pub fn new(llm: Arc<dyn LlmClient>, render_max_chars: usize) -> Self {
        Self { llm, render_max_chars }
    }
}

#[async_trait]
impl IntentSource for ModelIntentSource {
    fn name(&self) -> &'static str {
        "model"
    }

    async fn propose(
        &self,
        command: &str,
        context: &ScreenContext,
        history_rendering: &str,
    ) -> Result<CommandIntent> {
        let prompt = build_prompt(
            command,
            &context.render_compact(self.render_max_chars),
            history_rendering,
        );
        let raw = self.llm.complete(&prompt).await.context("model source failed")?;
        let reply = parse_reply(&raw)?;

        let action = ActionKind::parse(&reply.action);
        if action == ActionKind::Unknown && !reply.action.trim().eq_ignore_ascii_case("unknown") {
            return Err(anyhow!("model proposed unsupported action '{}'", reply.action));
        }

        let mut intent = CommandIntent::new(
            action,
            IntentSourceKind::Model,
            reply.confidence.clamp(0.0, 1.0),
        );
        if let Some(t) = reply.target {
            let (text, kind) = crate::intent::parse_target_phrase(&t);
            intent.target_text = if text.is_empty() { None } else { Some(text) };
            intent.target_kind = kind;
        }
        for (k, v) in &reply.parameters {
            intent.parameters.insert(k.clone(), param_as_string(v));
        }
        Ok(intent)
    }
}

/// Last-resort source wrapping the deterministic verb matcher. Infallible,
/// so a chain ending with it always produces some intent.
pub struct RuleIntentSource;

#[async_trait]
impl IntentSource for RuleIntentSource {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn propose(
        &self,
        command: &str,
        _context: &ScreenContext,
        _history_rendering: &str,
    ) -> Result<CommandIntent> {
        Ok(crate::intent::match_rules(command))
    }
}

pub(crate) enum TargetOutcome {
    Chosen(crate::screen::TargetRef),
    Ambiguous(Vec<TargetCandidate>),
    NotFound,
    NotNeeded,
}

fn candidate_of(e: &UIElement) -> TargetCandidate {
    TargetCandidate {
        element: e.id,
        kind: e.kind,
        text: e.text.clone(),
    }
}

fn pick_unique<'c>(matched: Vec<&'c UIElement>, context: &ScreenContext) -> Option<TargetOutcome> {
    match matched.len() {
        0 => None,
        1 => Some(TargetOutcome::Chosen(context.target_for(matched[0].id))),
        _ => Some(TargetOutcome::Ambiguous(
            matched.iter().map(|e| candidate_of(e)).collect(),
        )),
    }
}

/// Target ranking over one context. Rules, in order, each tried only when
/// the previous one matched nothing:
/// (a) exact case-insensitive text equality;
/// (b) case-insensitive substring containment;
/// (c) nearest element of the implied kind, anchored at the free-text block
///     that best matches the phrase (or the lone kind-matching element when
///     the phrase is empty).
/// Several survivors within one rule is an ambiguity, never a guess.
pub(crate) fn rank_target(intent: &CommandIntent, context: &ScreenContext) -> TargetOutcome {
    if !(intent.action.needs_target()
        || (intent.action == ActionKind::Type && intent.target_text.is_some()))
    {
        return TargetOutcome::NotNeeded;
    }

    let kind_pool: Vec<&UIElement> = match intent.target_kind {
        Some(kind) => context.elements_of_kinds(&[kind]),
        None => context.elements_of_kinds(intent.action.implied_kinds()),
    };

    let phrase = intent
        .target_text
        .as_deref()
        .map(|t| t.trim().to_ascii_lowercase())
        .unwrap_or_default();

    if !phrase.is_empty() {
        // (a) exact match, over every element regardless of kind.
        let exact: Vec<&UIElement> = context
            .elements
            .iter()
            .filter(|e| {
                e.text
                    .as_deref()
                    .map(|t| t.trim().eq_ignore_ascii_case(&phrase))
                    .unwrap_or(false)
            })
            .collect();
        if let Some(outcome) = pick_unique(exact, context) {
            return outcome;
        }

        // (b) substring containment.
        let partial: Vec<&UIElement> = context
            .elements
            .iter()
            .filter(|e| {
                e.text
                    .as_deref()
                    .map(|t| t.to_ascii_lowercase().contains(&phrase))
                    .unwrap_or(false)
            })
            .collect();
        if let Some(outcome) = pick_unique(partial, context) {
            return outcome;
        }

        // (c) the phrase names nearby text rather than the element itself:
        // anchor at the best-matching free block and take the closest
        // element of a plausible kind.
        let anchor = context
            .free_text
            .iter()
            .find(|b| b.text.to_ascii_lowercase().contains(&phrase));
        if let (Some(anchor), false) = (anchor, kind_pool.is_empty()) {
            let mut ranked: Vec<(i64, &UIElement)> = kind_pool
                .iter()
                .map(|e| (center_distance_sq(&e.rect, &anchor.rect), *e))
                .collect();
            ranked.sort_by_key(|(d, _)| *d);
            let best = ranked[0].0;
            let tied: Vec<&UIElement> =
                ranked.iter().take_while(|(d, _)| *d == best).map(|(_, e)| *e).collect();
            if let Some(outcome) = pick_unique(tied, context) {
                return outcome;
            }
        }
        return TargetOutcome::NotFound;
    }

    // No phrase at all ("click the button"): only an unambiguous kind pool
    // can be acted on.
    match pick_unique(kind_pool, context) {
        Some(outcome) => outcome,
        None => TargetOutcome::NotFound,
    }
}

fn visible_alternatives(context: &ScreenContext, kinds: &[ElementKind]) -> String {
    let pool = if kinds.is_empty() {
        context.elements.iter().collect::<Vec<_>>()
    } else {
        context.elements_of_kinds(kinds)
    };
    let labels: Vec<String> = pool
        .iter()
        .filter_map(|e| e.text.as_deref())
        .map(|t| format!("'{}'", t.trim()))
        .take(5)
        .collect();
    labels.join(", ")
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub accept_threshold: f32,
    pub render_max_chars: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.6,
            render_max_chars: 4_000,
        }
    }
}

/// Runs the fallback chain, gates on confidence, and binds the winning
/// intent's target against the context it was resolved from.
pub struct IntentResolver {
    sources: Vec<Arc<dyn IntentSource>>,
    cfg: ResolverConfig,
    data_dir: PathBuf,
}

impl IntentResolver {
    pub fn new(sources: Vec<Arc<dyn IntentSource>>, cfg: ResolverConfig, data_dir: PathBuf) -> Self {
        Self { sources, cfg, data_dir }
    }

    pub fn with_model_and_rules(
        llm: Arc<dyn LlmClient>,
        cfg: ResolverConfig,
        data_dir: PathBuf,
    ) -> Self {
        let sources: Vec<Arc<dyn IntentSource>> = vec![
            Arc::new(ModelIntentSource::new(llm, cfg.render_max_chars)),
            Arc::new(RuleIntentSource),
        ];
        Self::new(sources, cfg, data_dir)
    }

    pub async fn resolve(
        &self,
        command_id: &str,
        command: &str,
        context: &ScreenContext,
        history_rendering: &str,
    ) -> CommandIntent {
        let span = Span::start(
            &self.data_dir,
            Some(command_id),
            "Resolve",
            "RES.run",
            Some(serde_json::json!({"context_id": context.context_id.to_string()})),
        );

        let mut intent = None;
        for source in &self.sources {
            match source.propose(command, context, history_rendering).await {
                Ok(i) => {
                    intent = Some(i);
                    break;
                }
                Err(e) => {
                    trace::event(
                        &self.data_dir,
                        Some(command_id),
                        "Resolve",
                        "RES.source",
                        "err",
                        Some(serde_json::json!({
                            "source": source.name(),
                            "kind": crate::executor::ErrorKind::ResolverUnavailable.as_str(),
                            "message": e.to_string(),
                        })),
                    );
                }
            }
        }
        // An empty or fully-errored chain degrades to the infallible matcher.
        let mut intent =
            intent.unwrap_or_else(|| crate::intent::match_rules(command));

        if !intent.needs_clarification {
            self.gate_and_bind(&mut intent, context);
        }

        span.ok(Some(serde_json::json!({
            "action": intent.action.as_str(),
            "source": intent.source.as_str(),
            "confidence": intent.confidence,
            "needs_clarification": intent.needs_clarification,
            "target_bound": intent.target.is_some(),
        })));
        intent
    }

    fn gate_and_bind(&self, intent: &mut CommandIntent, context: &ScreenContext) {
        if intent.action == ActionKind::Unknown {
            intent.needs_clarification = true;
            intent.clarification =
                Some("I didn't understand that. Could you rephrase the command?".to_string());
            return;
        }

        // Low confidence asks before acting; it never silently drops the
        // command and never silently acts on a guess. The answer path binds
        // the target on confirmation.
        if intent.confidence < self.cfg.accept_threshold {
            intent.needs_clarification = true;
            intent.awaiting_confirmation = true;
            intent.clarification = Some(format!(
                "I think you want me to {}, but I'm not sure. Should I?",
                describe(intent)
            ));
            return;
        }

        bind_target(intent, context);
    }
}

/// Runs target ranking and attaches its outcome to the intent: a bound
/// target, a candidate set to choose from, or a not-found question naming
/// the visible alternatives. Also used to bind a confirmed low-confidence
/// intent against the context its question was asked about.
pub(crate) fn bind_target(intent: &mut CommandIntent, context: &ScreenContext) {
    match rank_target(intent, context) {
        TargetOutcome::NotNeeded => {}
        TargetOutcome::Chosen(target) => intent.target = Some(target),
        TargetOutcome::Ambiguous(candidates) => {
            let labels: Vec<String> = candidates.iter().map(|c| c.label()).collect();
            intent.needs_clarification = true;
            intent.clarification = Some(format!(
                "I see {} possible targets: {}. Which one did you mean?",
                candidates.len(),
                labels.join(", ")
            ));
            intent.candidates = candidates;
        }
        TargetOutcome::NotFound => {
            let kinds = match intent.target_kind {
                Some(k) => vec![k],
                None => intent.action.implied_kinds().to_vec(),
            };
            let alternatives = visible_alternatives(context, &kinds);
            intent.needs_clarification = true;
            intent.clarification = Some(match intent.target_text.as_deref() {
                Some(t) if !alternatives.is_empty() => format!(
                    "I can't find '{t}' on the screen. I can see: {alternatives}."
                ),
                Some(t) => format!("I can't find '{t}' on the screen."),
                None if !alternatives.is_empty() => format!(
                    "I'm not sure what to target. I can see: {alternatives}."
                ),
                None => "I'm not sure what to target on this screen.".to_string(),
            });
        }
    }
}

fn describe(intent: &CommandIntent) -> String {
    match (&intent.action, intent.target_text.as_deref()) {
        (ActionKind::Click, Some(t)) => format!("click '{t}'"),
        (ActionKind::Navigate, Some(t)) => format!("open '{t}'"),
        (ActionKind::Type, _) => match intent.parameters.get("text") {
            Some(text) => format!("type \"{text}\""),
            None => "type something".to_string(),
        },
        (ActionKind::Scroll, _) => format!(
            "scroll {}",
            intent.parameters.get("direction").map(|s| s.as_str()).unwrap_or("down")
        ),
        (ActionKind::Read, _) => "read the screen".to_string(),
        (action, _) => action.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::screen::{test_support, ElementId, TextBlock};
    use std::sync::Mutex;

    struct ScriptedLlm {
        replies: Mutex<Vec<Result<String>>>,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(anyhow!("no scripted reply"));
            }
            replies.remove(0)
        }
    }

    fn resolver(llm: Arc<dyn LlmClient>) -> IntentResolver {
        IntentResolver::with_model_and_rules(
            llm,
            ResolverConfig::default(),
            std::env::temp_dir().join("vantage-resolver-test"),
        )
    }

    fn submit_screen() -> crate::screen::ScreenContext {
        test_support::context(
            vec![
                test_support::element(0, ElementKind::Button, Rect::new(10, 10, 80, 30), Some("Submit")),
                test_support::element(1, ElementKind::Button, Rect::new(10, 60, 80, 30), Some("Cancel")),
            ],
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn model_reply_binds_exact_target() {
        let llm = ScriptedLlm::new(vec![Ok(
            "{\"action\":\"click\",\"target\":\"Submit\",\"confidence\":0.9}".to_string(),
        )]);
        let ctx = submit_screen();
        let i = resolver(llm).resolve("cmd-1", "click submit", &ctx, "").await;
        assert_eq!(i.source, IntentSourceKind::Model);
        assert!(!i.needs_clarification);
        assert_eq!(i.target, Some(ctx.target_for(ElementId(0))));
    }

    #[tokio::test]
    async fn unreachable_model_falls_back_to_rules() {
        let llm = ScriptedLlm::new(vec![Err(anyhow!("connection refused"))]);
        let ctx = submit_screen();
        let i = resolver(llm).resolve("cmd-1", "click the Cancel button", &ctx, "").await;
        assert_eq!(i.source, IntentSourceKind::Rules);
        assert!(!i.needs_clarification);
        assert_eq!(i.target, Some(ctx.target_for(ElementId(1))));
    }

    #[tokio::test]
    async fn garbage_model_reply_falls_back_to_rules() {
        let llm = ScriptedLlm::new(vec![Ok("I love to help! No JSON though.".to_string())]);
        let ctx = submit_screen();
        let i = resolver(llm).resolve("cmd-1", "scroll down", &ctx, "").await;
        assert_eq!(i.source, IntentSourceKind::Rules);
        assert_eq!(i.action, ActionKind::Scroll);
    }

    #[tokio::test]
    async fn low_confidence_asks_instead_of_acting() {
        let llm = ScriptedLlm::new(vec![Ok(
            "{\"action\":\"click\",\"target\":\"Submit\",\"confidence\":0.3}".to_string(),
        )]);
        let ctx = submit_screen();
        let i = resolver(llm).resolve("cmd-1", "maybe submit it?", &ctx, "").await;
        assert!(i.needs_clarification);
        assert!(i.awaiting_confirmation);
        assert!(i.target.is_none());
        assert!(i.clarification.as_deref().unwrap_or("").contains("click 'submit'"));
    }

    #[tokio::test]
    async fn ambiguous_targets_surface_candidates() {
        let llm = ScriptedLlm::new(vec![Err(anyhow!("down"))]);
        let ctx = test_support::context(
            vec![
                test_support::element(0, ElementKind::Button, Rect::new(10, 10, 80, 30), Some("Save draft")),
                test_support::element(1, ElementKind::Button, Rect::new(10, 60, 80, 30), Some("Save and close")),
            ],
            Vec::new(),
        );
        let i = resolver(llm).resolve("cmd-1", "click save", &ctx, "").await;
        assert!(i.needs_clarification);
        assert!(!i.awaiting_confirmation);
        assert_eq!(i.candidates.len(), 2);
        assert!(i.clarification.as_deref().unwrap_or("").contains("'Save draft'"));
    }

    #[tokio::test]
    async fn missing_target_names_visible_alternatives() {
        let llm = ScriptedLlm::new(vec![Err(anyhow!("down"))]);
        let ctx = submit_screen();
        let i = resolver(llm).resolve("cmd-1", "click the Export button", &ctx, "").await;
        assert!(i.needs_clarification);
        let c = i.clarification.as_deref().unwrap_or("");
        assert!(c.contains("export"));
        assert!(c.contains("'Submit'"));
    }

    #[test]
    fn bare_kind_phrase_picks_the_only_element_of_that_kind() {
        let ctx = test_support::context(
            vec![
                test_support::element(0, ElementKind::Button, Rect::new(10, 10, 80, 30), Some("Go")),
                test_support::element(1, ElementKind::Link, Rect::new(10, 60, 80, 30), Some("Docs")),
            ],
            Vec::new(),
        );
        let mut intent = CommandIntent::new(ActionKind::Click, IntentSourceKind::Rules, 0.9);
        intent.target_kind = Some(ElementKind::Button);
        match rank_target(&intent, &ctx) {
            TargetOutcome::Chosen(t) => assert_eq!(t, ctx.target_for(ElementId(0))),
            _ => panic!("expected a chosen target"),
        }
    }

    #[test]
    fn free_text_anchor_picks_nearest_kind_match() {
        // An unlabeled input sits right under a "Username" caption; a second
        // input is far away.
        let ctx = test_support::context(
            vec![
                test_support::element(0, ElementKind::InputField, Rect::new(10, 40, 200, 24), None),
                test_support::element(1, ElementKind::InputField, Rect::new(10, 400, 200, 24), None),
            ],
            vec![TextBlock {
                text: "Username".to_string(),
                rect: Rect::new(10, 12, 80, 18),
                confidence: 0.9,
            }],
        );
        let mut intent = CommandIntent::new(ActionKind::Type, IntentSourceKind::Rules, 0.9);
        intent.target_text = Some("username".to_string());
        intent.parameters.insert("text".to_string(), "alice".to_string());
        match rank_target(&intent, &ctx) {
            TargetOutcome::Chosen(t) => assert_eq!(t, ctx.target_for(ElementId(0))),
            _ => panic!("expected the near input to win"),
        }
    }

    #[test]
    fn bind_target_attaches_the_exact_match() {
        let ctx = submit_screen();
        let mut intent = CommandIntent::new(ActionKind::Click, IntentSourceKind::Model, 0.3);
        intent.target_text = Some("submit".to_string());
        bind_target(&mut intent, &ctx);
        assert_eq!(intent.target, Some(ctx.target_for(ElementId(0))));
        assert!(!intent.needs_clarification);
    }

    #[test]
    fn read_needs_no_target() {
        let ctx = submit_screen();
        let intent = CommandIntent::new(ActionKind::Read, IntentSourceKind::Rules, 0.9);
        assert!(matches!(rank_target(&intent, &ctx), TargetOutcome::NotNeeded));
    }
}
