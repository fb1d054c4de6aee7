//! Orchestration core of a voice-driven screen assistant.
//!
//! The pipeline for one spoken command: fuse a screen capture with OCR and
//! element detection into a [`screen::ScreenContext`], resolve the command
//! into a [`intent::CommandIntent`] through a model-first fallback chain,
//! execute it via an [`executor::InputSynthesizer`], recapture to verify,
//! and report the finished [`conversation::Turn`]. The
//! [`orchestrator::Orchestrator`] owns that state machine; the collaborator
//! seams (screen source, OCR, detection, language model, input synthesis,
//! reporting) are traits supplied by the embedding application.

pub mod context_builder;
pub mod conversation;
pub mod data_dir;
pub mod executor;
pub mod geometry;
pub mod history;
pub mod intent;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod resolver;
pub mod screen;
pub mod settings;
pub mod trace;

pub use context_builder::{
    BuilderConfig, ElementDetector, OcrEngine, ScreenContextBuilder, ScreenSource,
};
pub use conversation::{ConversationStore, Turn};
pub use executor::{
    ActionExecutor, ActionResult, ErrorKind, ExecutorConfig, InputRequest, InputSynthesizer,
    ScrollDirection,
};
pub use intent::{ActionKind, CommandIntent, IntentSourceKind, TargetCandidate};
pub use llm::{LlmClient, LlmConfig, OllamaClient};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorState, Reporter};
pub use resolver::{IntentResolver, IntentSource, ModelIntentSource, ResolverConfig, RuleIntentSource};
pub use screen::{
    DetectedElement, ElementId, ElementKind, ScreenCapture, ScreenContext, TargetRef, TextBlock,
    UIElement,
};
pub use settings::Settings;
