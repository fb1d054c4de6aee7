use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::executor::ErrorKind;
use crate::geometry::reading_order;
use crate::screen::{DetectedElement, ElementId, ScreenCapture, ScreenContext, TextBlock, UIElement};
use crate::trace::{self, Span};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Grabs raw pixels for one display.
#[async_trait]
pub trait ScreenSource: Send + Sync {
    async fn capture(&self) -> Result<ScreenCapture>;
}

/// OCR collaborator: typed text blocks for a capture, or an error.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, capture: &ScreenCapture) -> Result<Vec<TextBlock>>;
}

/// Element-detection collaborator. Ids are assigned during fusion, not here.
#[async_trait]
pub trait ElementDetector: Send + Sync {
    async fn detect(&self, capture: &ScreenCapture) -> Result<Vec<DetectedElement>>;
}

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub staleness_ms: i64,
    pub capture_timeout_ms: u64,
    pub engine_timeout_ms: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            staleness_ms: 3_000,
            capture_timeout_ms: 5_000,
            engine_timeout_ms: 10_000,
        }
    }
}

/// Owns the current ScreenContext for a session. Contexts are published as
/// `Arc` snapshots: a command keeps the snapshot it resolved against even if
/// the background refresh replaces the current one.
pub struct ScreenContextBuilder {
    source: Arc<dyn ScreenSource>,
    ocr: Arc<dyn OcrEngine>,
    detector: Arc<dyn ElementDetector>,
    cfg: BuilderConfig,
    data_dir: PathBuf,
    current: Mutex<Option<Arc<ScreenContext>>>,
}

impl ScreenContextBuilder {
    pub fn new(
        source: Arc<dyn ScreenSource>,
        ocr: Arc<dyn OcrEngine>,
        detector: Arc<dyn ElementDetector>,
        cfg: BuilderConfig,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            source,
            ocr,
            detector,
            cfg,
            data_dir,
            current: Mutex::new(None),
        }
    }

    /// Snapshot of the current context without capturing.
    pub fn current(&self) -> Option<Arc<ScreenContext>> {
        self.current.lock().unwrap().clone()
    }

    /// Returns the cached context when it is younger than the staleness
    /// threshold and no refresh is forced; otherwise captures, runs OCR and
    /// detection concurrently, fuses, and publishes the replacement.
    pub async fn build(&self, force_refresh: bool) -> Result<Arc<ScreenContext>> {
        if !force_refresh {
            if let Some(ctx) = self.current() {
                if ctx.age_ms(now_ms()) < self.cfg.staleness_ms {
                    return Ok(ctx);
                }
            }
        }

        let span = Span::start(&self.data_dir, None, "ScreenContext", "CTX.build", None);

        let capture = match tokio::time::timeout(
            Duration::from_millis(self.cfg.capture_timeout_ms),
            self.source.capture(),
        )
        .await
        {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => {
                span.err("io", "E_CAPTURE", &e.to_string(), None);
                return Err(e).context("screen capture failed");
            }
            Err(_) => {
                span.err("timeout", "E_CAPTURE_TIMEOUT", "screen capture timed out", None);
                return Err(anyhow!("screen capture timed out"));
            }
        };

        // OCR and detection are independent and order-free; run both against
        // the same immutable capture and join before fusing.
        let engine_timeout = Duration::from_millis(self.cfg.engine_timeout_ms);
        let (ocr_res, det_res) = tokio::join!(
            tokio::time::timeout(engine_timeout, self.ocr.recognize(&capture)),
            tokio::time::timeout(engine_timeout, self.detector.detect(&capture)),
        );

        let ocr_kind = ErrorKind::OcrFailed.as_str();
        let blocks = match ocr_res {
            Ok(Ok(b)) => Some(b),
            Ok(Err(e)) => {
                trace::event(
                    &self.data_dir,
                    None,
                    "ScreenContext",
                    "CTX.ocr",
                    "err",
                    Some(serde_json::json!({"code": "E_OCR", "kind": ocr_kind, "message": e.to_string()})),
                );
                None
            }
            Err(_) => {
                trace::event(
                    &self.data_dir,
                    None,
                    "ScreenContext",
                    "CTX.ocr",
                    "err",
                    Some(serde_json::json!({"code": "E_OCR_TIMEOUT", "kind": ocr_kind})),
                );
                None
            }
        };
        let detect_kind = ErrorKind::DetectionFailed.as_str();
        let detected = match det_res {
            Ok(Ok(d)) => Some(d),
            Ok(Err(e)) => {
                trace::event(
                    &self.data_dir,
                    None,
                    "ScreenContext",
                    "CTX.detect",
                    "err",
                    Some(serde_json::json!({"code": "E_DETECT", "kind": detect_kind, "message": e.to_string()})),
                );
                None
            }
            Err(_) => {
                trace::event(
                    &self.data_dir,
                    None,
                    "ScreenContext",
                    "CTX.detect",
                    "err",
                    Some(serde_json::json!({"code": "E_DETECT_TIMEOUT", "kind": detect_kind})),
                );
                None
            }
        };

        // One failed sub-engine degrades the context, it never drops it.
        let partial = blocks.is_none() || detected.is_none();
        let ctx = Arc::new(fuse(
            capture,
            blocks.unwrap_or_default(),
            detected.unwrap_or_default(),
            partial,
        ));

        *self.current.lock().unwrap() = Some(ctx.clone());
        span.ok(Some(serde_json::json!({
            "context_id": ctx.context_id.to_string(),
            "elements": ctx.elements.len(),
            "free_text_blocks": ctx.free_text.len(),
            "partial": ctx.partial,
        })));
        Ok(ctx)
    }

    /// Periodic refresh with no pending command. `build(false)` only
    /// recaptures once the cached context has gone stale, so an active
    /// command's snapshot is never overwritten under it.
    pub fn spawn_background_refresh(
        self: &Arc<Self>,
        interval_ms: u64,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {
                        if let Err(e) = this.build(false).await {
                            trace::event(
                                &this.data_dir,
                                None,
                                "ScreenContext",
                                "CTX.background_refresh",
                                "err",
                                Some(serde_json::json!({"message": e.to_string()})),
                            );
                        }
                    }
                }
            }
        })
    }
}

/// Fuses OCR blocks and detected elements into one spatial model. Every
/// element whose rectangle overlaps a block absorbs that block's text;
/// blocks overlapping several elements feed each of them; unabsorbed blocks
/// stay as free text. Rectangles are clamped to the capture bounds.
pub(crate) fn fuse(
    capture: ScreenCapture,
    blocks: Vec<TextBlock>,
    detected: Vec<DetectedElement>,
    partial: bool,
) -> ScreenContext {
    let (w, h) = (capture.width, capture.height);

    let mut kept_blocks: Vec<TextBlock> = Vec::with_capacity(blocks.len());
    for mut b in blocks {
        if b.text.trim().is_empty() {
            continue;
        }
        match b.rect.clamp_to_bounds(w, h) {
            Some(r) => {
                b.rect = r;
                kept_blocks.push(b);
            }
            None => {}
        }
    }

    let mut elements: Vec<UIElement> = Vec::with_capacity(detected.len());
    let mut absorbed = vec![false; kept_blocks.len()];
    for d in detected {
        let rect = match d.rect.clamp_to_bounds(w, h) {
            Some(r) => r,
            None => continue,
        };

        let mut overlapping: Vec<usize> = kept_blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.rect.overlaps(&rect))
            .map(|(i, _)| i)
            .collect();
        // Tie-break when several blocks overlap one element: concatenate in
        // reading order rather than picking one arbitrarily.
        overlapping.sort_by(|&a, &b| reading_order(&kept_blocks[a].rect, &kept_blocks[b].rect));

        let mut text = String::new();
        for &i in &overlapping {
            absorbed[i] = true;
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(kept_blocks[i].text.trim());
        }

        elements.push(UIElement {
            id: ElementId(elements.len() as u32),
            kind: d.kind,
            rect,
            text: if text.is_empty() { None } else { Some(text) },
            confidence: d.confidence,
            focused: d.focused,
        });
    }

    let mut free_text: Vec<TextBlock> = kept_blocks
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !absorbed[*i])
        .map(|(_, b)| b)
        .collect();
    free_text.sort_by(|a, b| reading_order(&a.rect, &b.rect));

    ScreenContext {
        context_id: Uuid::new_v4(),
        capture,
        elements,
        free_text,
        partial,
        built_at_ms: now_ms(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::screen::{test_support, ElementKind};

    struct FixedSource;

    #[async_trait]
    impl ScreenSource for FixedSource {
        async fn capture(&self) -> Result<ScreenCapture> {
            Ok(test_support::capture(800, 600))
        }
    }

    struct FixedOcr {
        blocks: Vec<TextBlock>,
        fail: bool,
    }

    #[async_trait]
    impl OcrEngine for FixedOcr {
        async fn recognize(&self, _capture: &ScreenCapture) -> Result<Vec<TextBlock>> {
            if self.fail {
                return Err(anyhow!("ocr engine unavailable"));
            }
            Ok(self.blocks.clone())
        }
    }

    struct FixedDetector {
        elements: Vec<DetectedElement>,
        fail: bool,
    }

    #[async_trait]
    impl ElementDetector for FixedDetector {
        async fn detect(&self, _capture: &ScreenCapture) -> Result<Vec<DetectedElement>> {
            if self.fail {
                return Err(anyhow!("detector unavailable"));
            }
            Ok(self.elements.clone())
        }
    }

    fn block(text: &str, rect: Rect) -> TextBlock {
        TextBlock {
            text: text.to_string(),
            rect,
            confidence: 0.9,
        }
    }

    fn detected(kind: ElementKind, rect: Rect) -> DetectedElement {
        DetectedElement {
            kind,
            rect,
            confidence: 0.8,
            focused: false,
        }
    }

    fn builder(ocr: FixedOcr, detector: FixedDetector, staleness_ms: i64) -> Arc<ScreenContextBuilder> {
        Arc::new(ScreenContextBuilder::new(
            Arc::new(FixedSource),
            Arc::new(ocr),
            Arc::new(detector),
            BuilderConfig {
                staleness_ms,
                ..BuilderConfig::default()
            },
            std::env::temp_dir().join("vantage-builder-test"),
        ))
    }

    #[test]
    fn fusion_concatenates_overlapping_blocks_in_reading_order() {
        let ctx = fuse(
            test_support::capture(800, 600),
            vec![
                block("World", Rect::new(60, 12, 40, 16)),
                block("Hello", Rect::new(12, 10, 40, 16)),
                block("free standing", Rect::new(10, 500, 120, 16)),
            ],
            vec![detected(ElementKind::Button, Rect::new(0, 0, 120, 40))],
            false,
        );
        assert_eq!(ctx.elements.len(), 1);
        assert_eq!(ctx.elements[0].text.as_deref(), Some("Hello World"));
        assert_eq!(ctx.free_text.len(), 1);
        assert_eq!(ctx.free_text[0].text, "free standing");
    }

    #[test]
    fn fusion_clamps_element_rects_to_capture_bounds() {
        let ctx = fuse(
            test_support::capture(100, 100),
            Vec::new(),
            vec![
                detected(ElementKind::Button, Rect::new(90, 90, 50, 50)),
                detected(ElementKind::Link, Rect::new(500, 500, 20, 20)),
            ],
            false,
        );
        // The off-screen element is dropped, the straddling one clamped.
        assert_eq!(ctx.elements.len(), 1);
        let r = ctx.elements[0].rect;
        assert!(r.right() <= 100 && r.bottom() <= 100);
    }

    #[test]
    fn fusion_skips_whitespace_only_blocks() {
        let ctx = fuse(
            test_support::capture(800, 600),
            vec![block("   ", Rect::new(0, 0, 20, 10))],
            Vec::new(),
            false,
        );
        assert!(ctx.free_text.is_empty());
    }

    #[tokio::test]
    async fn failed_ocr_yields_partial_context_with_elements() {
        let b = builder(
            FixedOcr { blocks: Vec::new(), fail: true },
            FixedDetector {
                elements: vec![detected(ElementKind::Button, Rect::new(10, 10, 60, 20))],
                fail: false,
            },
            3_000,
        );
        let ctx = b.build(true).await.expect("build");
        assert!(ctx.partial);
        assert_eq!(ctx.elements.len(), 1);
        assert!(ctx.elements[0].text.is_none());
        assert_eq!(ctx.read_text(), "");
    }

    #[tokio::test]
    async fn failed_ocr_records_its_error_kind_in_the_trace() {
        let td = tempfile::tempdir().expect("tempdir");
        let b = ScreenContextBuilder::new(
            Arc::new(FixedSource),
            Arc::new(FixedOcr { blocks: Vec::new(), fail: true }),
            Arc::new(FixedDetector { elements: Vec::new(), fail: false }),
            BuilderConfig::default(),
            td.path().to_path_buf(),
        );
        b.build(true).await.expect("build");
        let raw = std::fs::read_to_string(crate::trace::trace_path(td.path())).expect("trace");
        assert!(raw
            .lines()
            .any(|l| l.contains("CTX.ocr") && l.contains("ocr_failed")));
    }

    #[tokio::test]
    async fn both_engines_failing_still_publishes_a_context() {
        let b = builder(
            FixedOcr { blocks: Vec::new(), fail: true },
            FixedDetector { elements: Vec::new(), fail: true },
            3_000,
        );
        let ctx = b.build(true).await.expect("build");
        assert!(ctx.partial);
        assert!(ctx.elements.is_empty());
        assert!(ctx.free_text.is_empty());
    }

    #[tokio::test]
    async fn fresh_context_is_reused_until_forced() {
        let b = builder(
            FixedOcr { blocks: Vec::new(), fail: false },
            FixedDetector { elements: Vec::new(), fail: false },
            60_000,
        );
        let first = b.build(false).await.expect("build");
        let second = b.build(false).await.expect("build");
        assert_eq!(first.context_id, second.context_id);

        let forced = b.build(true).await.expect("build");
        assert_ne!(first.context_id, forced.context_id);
    }

    #[tokio::test]
    async fn background_refresh_stops_on_cancellation() {
        let b = builder(
            FixedOcr { blocks: Vec::new(), fail: false },
            FixedDetector { elements: Vec::new(), fail: false },
            0, // always stale so the refresher captures every tick
        );
        let token = CancellationToken::new();
        let handle = b.spawn_background_refresh(5, token.clone());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(b.current().is_some());
        token.cancel();
        handle.await.expect("join");
    }
}
