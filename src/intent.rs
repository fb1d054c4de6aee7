use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::screen::{ElementId, ElementKind, TargetRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    Scroll,
    Read,
    Navigate,
    Unknown,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::Type => "type",
            ActionKind::Scroll => "scroll",
            ActionKind::Read => "read",
            ActionKind::Navigate => "navigate",
            ActionKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> ActionKind {
        match s.trim().to_ascii_lowercase().as_str() {
            "click" | "press" | "tap" => ActionKind::Click,
            "type" | "write" | "input" => ActionKind::Type,
            "scroll" => ActionKind::Scroll,
            "read" => ActionKind::Read,
            "navigate" | "open" | "go" => ActionKind::Navigate,
            _ => ActionKind::Unknown,
        }
    }

    /// Whether execution requires a resolved screen element.
    pub fn needs_target(&self) -> bool {
        matches!(self, ActionKind::Click | ActionKind::Navigate)
    }

    /// Element kinds this action plausibly operates on, used by the ranking
    /// rule that picks the nearest element of an implied kind.
    pub fn implied_kinds(&self) -> &'static [ElementKind] {
        match self {
            ActionKind::Click => &[ElementKind::Button, ElementKind::Link, ElementKind::InputField],
            ActionKind::Navigate => &[ElementKind::Link, ElementKind::Button],
            ActionKind::Type => &[ElementKind::InputField],
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSourceKind {
    Model,
    Rules,
}

impl IntentSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentSourceKind::Model => "model",
            IntentSourceKind::Rules => "rules",
        }
    }
}

/// One entry of the tied set surfaced when target ranking cannot pick a
/// single element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetCandidate {
    pub element: ElementId,
    pub kind: ElementKind,
    pub text: Option<String>,
}

impl TargetCandidate {
    pub fn label(&self) -> String {
        match self.text.as_deref() {
            Some(t) if !t.trim().is_empty() => format!("'{}'", t.trim()),
            _ => format!("unlabeled {}", self.kind.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandIntent {
    pub action: ActionKind,
    /// Free-text target description, verbatim-ish from the command.
    pub target_text: Option<String>,
    /// Kind implied by the phrasing ("the submit button" -> Button).
    pub target_kind: Option<ElementKind>,
    /// Resolved element, valid only against the context it was resolved from.
    pub target: Option<TargetRef>,
    pub parameters: BTreeMap<String, String>,
    pub confidence: f32,
    pub needs_clarification: bool,
    /// Prompt to surface when clarification is needed.
    pub clarification: Option<String>,
    pub candidates: Vec<TargetCandidate>,
    /// True when the clarification is a yes/no question ("should I?") rather
    /// than a pick from `candidates`; an affirmative answer runs the intent.
    #[serde(default)]
    pub awaiting_confirmation: bool,
    pub source: IntentSourceKind,
}

impl CommandIntent {
    pub fn new(action: ActionKind, source: IntentSourceKind, confidence: f32) -> Self {
        Self {
            action,
            target_text: None,
            target_kind: None,
            target: None,
            parameters: BTreeMap::new(),
            confidence,
            needs_clarification: false,
            clarification: None,
            candidates: Vec::new(),
            awaiting_confirmation: false,
            source,
        }
    }

    pub fn unknown(command: &str, source: IntentSourceKind, confidence: f32) -> Self {
        let mut i = Self::new(ActionKind::Unknown, source, confidence);
        i.target_text = Some(command.trim().to_string());
        i
    }
}

pub const RULE_MATCH_CONFIDENCE: f32 = 0.9;
pub const RULE_MISS_CONFIDENCE: f32 = 0.2;

const CLICK_VERBS: &[&str] = &["click", "press", "tap", "select"];
const SCROLL_VERBS: &[&str] = &["scroll", "page"];
const TYPE_VERBS: &[&str] = &["type", "write", "enter", "input"];
const NAVIGATE_VERBS: &[&str] = &["open", "launch", "navigate", "go"];

fn normalize_word(w: &str) -> String {
    w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
        .to_ascii_lowercase()
}

/// Finds the first word matching any verb and returns the remainder of the
/// command after it, original casing preserved.
fn after_first_verb(command: &str, verbs: &[&str]) -> Option<String> {
    let words: Vec<&str> = command.split_whitespace().collect();
    for (i, w) in words.iter().enumerate() {
        if verbs.contains(&normalize_word(w).as_str()) {
            return Some(words[i + 1..].join(" "));
        }
    }
    None
}

fn has_any_word(lower: &str, verbs: &[&str]) -> bool {
    lower
        .split_whitespace()
        .any(|w| verbs.contains(&normalize_word(w).as_str()))
}

/// Strips articles and a trailing kind word from a target phrase:
/// "the Submit button" -> ("submit", Some(Button)).
pub fn parse_target_phrase(phrase: &str) -> (String, Option<ElementKind>) {
    let mut words: Vec<String> = phrase
        .split_whitespace()
        .map(|w| normalize_word(w))
        .filter(|w| !w.is_empty())
        .collect();
    while matches!(
        words.first().map(|s| s.as_str()),
        Some("the") | Some("a") | Some("an") | Some("on") | Some("to")
    ) {
        words.remove(0);
    }
    let kind = match words.last().map(|s| s.as_str()) {
        Some("button") => Some(ElementKind::Button),
        Some("link") => Some(ElementKind::Link),
        Some("field") | Some("input") | Some("box") | Some("textbox") => {
            Some(ElementKind::InputField)
        }
        Some("menu") => Some(ElementKind::Menu),
        _ => None,
    };
    if kind.is_some() {
        words.pop();
    }
    (words.join(" "), kind)
}

fn is_read_command(lower: &str) -> bool {
    lower.split_whitespace().next() == Some("read")
        || lower.starts_with("what")
        || lower.contains("what's on")
        || lower.contains("what is on")
        || lower.starts_with("tell me")
}

/// Deterministic fallback matcher: an ordered verb+pattern table that always
/// returns some intent (possibly `unknown`) and never errors. Matched
/// patterns get a fixed high confidence, misses a fixed low one.
pub fn match_rules(command: &str) -> CommandIntent {
    let trimmed = command.trim();
    let lower = trimmed.to_ascii_lowercase();
    if trimmed.is_empty() {
        return CommandIntent::unknown(trimmed, IntentSourceKind::Rules, RULE_MISS_CONFIDENCE);
    }

    if let Some(rest) = after_first_verb(trimmed, CLICK_VERBS) {
        let (target, kind) = parse_target_phrase(&rest);
        let mut i = CommandIntent::new(ActionKind::Click, IntentSourceKind::Rules, RULE_MATCH_CONFIDENCE);
        i.target_text = if target.is_empty() { None } else { Some(target) };
        i.target_kind = kind;
        return i;
    }

    if has_any_word(&lower, SCROLL_VERBS) {
        let direction = if has_any_word(&lower, &["up"]) { "up" } else { "down" };
        let mut i = CommandIntent::new(ActionKind::Scroll, IntentSourceKind::Rules, RULE_MATCH_CONFIDENCE);
        i.parameters.insert("direction".to_string(), direction.to_string());
        return i;
    }

    if is_read_command(&lower) {
        return CommandIntent::new(ActionKind::Read, IntentSourceKind::Rules, RULE_MATCH_CONFIDENCE);
    }

    if let Some(rest) = after_first_verb(trimmed, TYPE_VERBS) {
        let text = rest.trim().to_string();
        let mut i = CommandIntent::new(ActionKind::Type, IntentSourceKind::Rules, RULE_MATCH_CONFIDENCE);
        if text.is_empty() {
            i.needs_clarification = true;
            i.clarification = Some("What should I type?".to_string());
        } else {
            i.parameters.insert("text".to_string(), text);
        }
        return i;
    }

    if let Some(rest) = after_first_verb(trimmed, NAVIGATE_VERBS) {
        let (target, kind) = parse_target_phrase(&rest);
        if !target.is_empty() {
            let mut i = CommandIntent::new(
                ActionKind::Navigate,
                IntentSourceKind::Rules,
                RULE_MATCH_CONFIDENCE,
            );
            i.target_text = Some(target);
            i.target_kind = kind;
            return i;
        }
    }

    CommandIntent::unknown(trimmed, IntentSourceKind::Rules, RULE_MISS_CONFIDENCE)
}
