use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::{reading_order, Rect};

/// One grabbed frame. Immutable once created; a newer capture supersedes it,
/// nothing ever mutates it in place.
#[derive(Debug, Clone)]
pub struct ScreenCapture {
    pub pixels: Vec<u8>, // opaque raw image bytes, owned by the capture collaborator's format
    pub width: u32,
    pub height: u32,
    pub display_id: String,
    pub captured_at_ms: i64,
}

/// A recognized text run from the OCR collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    pub rect: Rect,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Button,
    InputField,
    Menu,
    Link,
    Text,
    Unknown,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Button => "button",
            ElementKind::InputField => "input_field",
            ElementKind::Menu => "menu",
            ElementKind::Link => "link",
            ElementKind::Text => "text",
            ElementKind::Unknown => "unknown",
        }
    }
}

/// What the element detector reports before fusion. Ids are assigned by the
/// builder, never by the detector.
#[derive(Debug, Clone)]
pub struct DetectedElement {
    pub kind: ElementKind,
    pub rect: Rect,
    pub confidence: f32,
    pub focused: bool,
}

/// Arena-style index, valid only within the ScreenContext that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementId(pub u32);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UIElement {
    pub id: ElementId,
    pub kind: ElementKind,
    pub rect: Rect,
    /// Text absorbed from overlapping OCR blocks during fusion, in reading
    /// order. `None` when no block overlapped the element.
    pub text: Option<String>,
    pub confidence: f32,
    pub focused: bool,
}

/// Element reference that can always be checked before use: a stale id is a
/// context-id mismatch, not a dangling pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub context_id: Uuid,
    pub element: ElementId,
}

/// Fusion of one capture with its OCR blocks and detected elements.
/// Read-only once published; a new context replaces the old one atomically.
#[derive(Debug, Clone)]
pub struct ScreenContext {
    pub context_id: Uuid,
    pub capture: ScreenCapture,
    pub elements: Vec<UIElement>,
    /// OCR blocks not absorbed by any element, in reading order.
    pub free_text: Vec<TextBlock>,
    /// True when OCR or detection failed and the context carries only the
    /// surviving half.
    pub partial: bool,
    pub built_at_ms: i64,
}

impl ScreenContext {
    /// Resolves a target against this exact context. `None` means the ref is
    /// stale (produced by a different context) or out of range.
    pub fn resolve_target(&self, target: &TargetRef) -> Option<&UIElement> {
        if target.context_id != self.context_id {
            return None;
        }
        self.elements.get(target.element.0 as usize)
    }

    pub fn target_for(&self, id: ElementId) -> TargetRef {
        TargetRef {
            context_id: self.context_id,
            element: id,
        }
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.built_at_ms)
    }

    pub fn elements_of_kinds(&self, kinds: &[ElementKind]) -> Vec<&UIElement> {
        self.elements
            .iter()
            .filter(|e| kinds.contains(&e.kind))
            .collect()
    }

    /// Free-standing text in reading order, for "read screen" intents.
    pub fn read_text(&self) -> String {
        let mut blocks: Vec<&TextBlock> = self.free_text.iter().collect();
        blocks.sort_by(|a, b| reading_order(&a.rect, &b.rect));
        blocks
            .iter()
            .map(|b| b.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Compact textual rendering for the language-model prompt: element
    /// kinds, texts and approximate positions, then free text, clipped to a
    /// character budget.
    pub fn render_compact(&self, max_chars: usize) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "screen {}x{} ({})\n",
            self.capture.width,
            self.capture.height,
            if self.partial { "partial" } else { "complete" }
        ));
        out.push_str("elements:\n");
        for e in &self.elements {
            let c = e.rect.center();
            let line = match e.text.as_deref() {
                Some(t) => format!("- [{}] {} \"{}\" @ ({},{})\n", e.id.0, e.kind.as_str(), t, c.x, c.y),
                None => format!("- [{}] {} @ ({},{})\n", e.id.0, e.kind.as_str(), c.x, c.y),
            };
            if out.len() + line.len() > max_chars {
                return out;
            }
            out.push_str(&line);
        }
        let free = self.read_text();
        if !free.is_empty() {
            out.push_str("free text:\n");
            for ch in free.chars() {
                if out.len() >= max_chars {
                    break;
                }
                out.push(ch);
            }
            out.push('\n');
        }
        out
    }

    /// Signal used for post-action verification: kind+text of elements and
    /// the free text overlapping `region`, sorted for stable comparison.
    pub fn region_signature(&self, region: &Rect) -> Vec<String> {
        let mut sig = Vec::new();
        for e in &self.elements {
            if e.rect.overlaps(region) {
                sig.push(format!(
                    "{}:{}",
                    e.kind.as_str(),
                    e.text.as_deref().unwrap_or("")
                ));
            }
        }
        for b in &self.free_text {
            if b.rect.overlaps(region) {
                sig.push(format!("text:{}", b.text));
            }
        }
        sig.sort();
        sig
    }

    /// Signature of the whole screen, used when the action has no target
    /// region (scroll, navigate).
    pub fn screen_signature(&self) -> Vec<String> {
        let full = Rect::new(0, 0, self.capture.width, self.capture.height);
        self.region_signature(&full)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::geometry::Rect;

    #[test]
    fn resolve_target_rejects_foreign_context_ids() {
        let ctx = context(
            vec![element(0, ElementKind::Button, Rect::new(10, 10, 80, 30), Some("Submit"))],
            Vec::new(),
        );
        let other = context(Vec::new(), Vec::new());

        let live = ctx.target_for(ElementId(0));
        assert!(ctx.resolve_target(&live).is_some());

        let stale = TargetRef {
            context_id: other.context_id,
            element: ElementId(0),
        };
        assert!(ctx.resolve_target(&stale).is_none());
        assert!(ctx
            .resolve_target(&TargetRef {
                context_id: ctx.context_id,
                element: ElementId(99),
            })
            .is_none());
    }

    #[test]
    fn read_text_follows_reading_order() {
        let ctx = context(
            Vec::new(),
            vec![
                TextBlock {
                    text: "second".to_string(),
                    rect: Rect::new(0, 100, 50, 20),
                    confidence: 0.9,
                },
                TextBlock {
                    text: "first".to_string(),
                    rect: Rect::new(200, 10, 50, 20),
                    confidence: 0.9,
                },
            ],
        );
        assert_eq!(ctx.read_text(), "first\nsecond");
    }

    #[test]
    fn render_compact_respects_char_budget() {
        let ctx = context(
            (0..50)
                .map(|i| {
                    element(
                        i,
                        ElementKind::Button,
                        Rect::new(0, i as i32 * 40, 120, 30),
                        Some("A very long button label to inflate the rendering"),
                    )
                })
                .collect(),
            Vec::new(),
        );
        let out = ctx.render_compact(400);
        assert!(out.len() <= 400 + 64); // header line may finish the budget
        assert!(out.contains("elements:"));
    }

    #[test]
    fn region_signature_is_order_independent() {
        let ctx = context(
            vec![
                element(0, ElementKind::Button, Rect::new(0, 0, 50, 20), Some("b")),
                element(1, ElementKind::Link, Rect::new(60, 0, 50, 20), Some("a")),
            ],
            Vec::new(),
        );
        let region = Rect::new(0, 0, 200, 40);
        let sig = ctx.region_signature(&region);
        assert_eq!(sig, vec!["button:b".to_string(), "link:a".to_string()]);
    }
}
