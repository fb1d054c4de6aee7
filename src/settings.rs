use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::context_builder::BuilderConfig;
use crate::executor::ExecutorConfig;
use crate::llm::LlmConfig;
use crate::resolver::ResolverConfig;

/// On-disk user settings. Every field is optional so a file written by an
/// older build keeps loading; defaults fill the gaps.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub llm_base_url: Option<String>,
    pub llm_model: Option<String>,
    pub llm_timeout_ms: Option<u64>,
    pub llm_temperature: Option<f32>,
    pub accept_threshold: Option<f32>,
    pub context_staleness_ms: Option<i64>,
    pub capture_timeout_ms: Option<u64>,
    pub engine_timeout_ms: Option<u64>,
    pub execute_timeout_ms: Option<u64>,
    pub default_scroll_amount: Option<i32>,
    pub history_capacity: Option<usize>,
    pub prompt_history_turns: Option<usize>,
    pub background_refresh_ms: Option<u64>,
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

pub fn load_settings(data_dir: &Path) -> Result<Settings> {
    let p = settings_path(data_dir);
    if !p.exists() {
        return Ok(Settings::default());
    }
    let s = fs::read_to_string(&p).context("read settings.json failed")?;
    let v: Settings = serde_json::from_str(&s).context("parse settings.json failed")?;
    Ok(v)
}

/// Loads settings, parking an unreadable file aside as `settings.json.bak`
/// and starting over from defaults rather than refusing to start.
pub fn load_settings_or_recover(data_dir: &Path) -> Settings {
    match load_settings(data_dir) {
        Ok(s) => s,
        Err(_) => {
            let p = settings_path(data_dir);
            let _ = fs::rename(&p, data_dir.join("settings.json.bak"));
            Settings::default()
        }
    }
}

pub fn save_settings(data_dir: &Path, settings: &Settings) -> Result<()> {
    std::fs::create_dir_all(data_dir).ok();
    let p = settings_path(data_dir);
    let s = serde_json::to_string_pretty(settings).context("serialize settings failed")?;
    fs::write(&p, s).context("write settings.json failed")?;
    Ok(())
}

impl Settings {
    pub fn llm_config(&self) -> LlmConfig {
        let d = LlmConfig::default();
        LlmConfig {
            base_url: self.llm_base_url.clone().unwrap_or(d.base_url),
            model: self.llm_model.clone().unwrap_or(d.model),
            timeout_ms: self.llm_timeout_ms.unwrap_or(d.timeout_ms),
            temperature: self.llm_temperature.unwrap_or(d.temperature),
        }
    }

    pub fn builder_config(&self) -> BuilderConfig {
        let d = BuilderConfig::default();
        BuilderConfig {
            staleness_ms: self.context_staleness_ms.unwrap_or(d.staleness_ms),
            capture_timeout_ms: self.capture_timeout_ms.unwrap_or(d.capture_timeout_ms),
            engine_timeout_ms: self.engine_timeout_ms.unwrap_or(d.engine_timeout_ms),
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        let d = ResolverConfig::default();
        ResolverConfig {
            accept_threshold: self.accept_threshold.unwrap_or(d.accept_threshold),
            render_max_chars: d.render_max_chars,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        let d = ExecutorConfig::default();
        ExecutorConfig {
            timeout_ms: self.execute_timeout_ms.unwrap_or(d.timeout_ms),
            default_scroll_amount: self.default_scroll_amount.unwrap_or(d.default_scroll_amount),
        }
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity.unwrap_or(50)
    }

    pub fn prompt_history_turns(&self) -> usize {
        self.prompt_history_turns.unwrap_or(3)
    }

    pub fn background_refresh_ms(&self) -> u64 {
        self.background_refresh_ms.unwrap_or(30_000)
    }
}
