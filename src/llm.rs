use std::{collections::BTreeMap, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String, // e.g. http://localhost:11434
    pub model: String,
    pub timeout_ms: u64,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout_ms: 30_000,
            temperature: 0.1,
        }
    }
}

pub fn normalize_base_url(s: &str) -> String {
    let mut t = s.trim().trim_end_matches('/').to_string();
    if t.is_empty() {
        return "http://localhost:11434".to_string();
    }
    // Allow users to paste the full endpoint and still work.
    if let Some(stripped) = t.strip_suffix("/api/generate") {
        t = stripped.to_string();
    }
    t.trim_end_matches('/').to_string()
}

/// The language-model collaborator: a prompt in, either raw reply text out
/// or a distinguishable error/timeout.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct GenerateReq<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResp {
    response: String,
}

/// Non-streaming client for an Ollama-compatible `/api/generate` endpoint.
pub struct OllamaClient {
    client: Client,
    cfg: LlmConfig,
}

impl OllamaClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .context("build llm http client failed")?;
        Ok(Self { client, cfg })
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", normalize_base_url(&self.cfg.base_url));
        let req = GenerateReq {
            model: &self.cfg.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.cfg.temperature,
                num_predict: 200,
            },
        };
        let resp = self
            .client
            .post(url)
            .json(&req)
            .send()
            .await
            .context("llm http request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("llm http {status}: {body}"));
        }
        let r: GenerateResp = resp.json().await.context("llm response parse failed")?;
        let text = r.response.trim().to_string();
        if text.is_empty() {
            return Err(anyhow!("llm returned empty response"));
        }
        Ok(text)
    }
}

/// Structured reply the model is asked to produce. Unknown fields are
/// ignored; missing ones default so a sparse-but-valid reply still parses.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmReply {
    pub action: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub confidence: f32,
}

/// Parses the model's reply, tolerating code fences and prose around the
/// JSON object. Anything without a parseable object is an error, which the
/// resolver treats the same as an unreachable model.
pub fn parse_reply(raw: &str) -> Result<LlmReply> {
    let start = raw.find('{').ok_or_else(|| anyhow!("llm reply has no json object"))?;
    let end = raw.rfind('}').ok_or_else(|| anyhow!("llm reply has no json object"))?;
    if end < start {
        return Err(anyhow!("llm reply has malformed json"));
    }
    let reply: LlmReply =
        serde_json::from_str(&raw[start..=end]).context("llm reply json parse failed")?;
    if reply.action.trim().is_empty() {
        return Err(anyhow!("llm reply missing action"));
    }
    Ok(reply)
}

pub fn param_as_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn build_prompt(command: &str, screen_rendering: &str, history_rendering: &str) -> String {
    let mut p = String::new();
    p.push_str(
        "You are the intent parser of a voice-driven screen assistant.\n\
         Parse the user command into a JSON object with these fields:\n\
         - action: one of click, type, scroll, read, navigate, unknown\n\
         - target: what to interact with (element text or description), or null\n\
         - parameters: extra parameters such as direction or text to type\n\
         - confidence: your confidence in the parsing, 0.0 to 1.0\n\n",
    );
    p.push_str("Current screen:\n");
    if screen_rendering.trim().is_empty() {
        p.push_str("(no screen context available)\n");
    } else {
        p.push_str(screen_rendering.trim());
        p.push('\n');
    }
    if !history_rendering.trim().is_empty() {
        p.push_str("\nRecent turns:\n");
        p.push_str(history_rendering.trim());
        p.push('\n');
    }
    p.push_str(&format!("\nUser command: \"{}\"\n", command.trim()));
    p.push_str("\nRespond ONLY with valid JSON:");
    p
}
