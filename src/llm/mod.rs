//! Client for the local LLM endpoint.
//!
//! Speaks the Ollama generate protocol: a single synchronous (non-streaming)
//! POST per entry. Transport failures and non-2xx responses surface as
//! environment errors; the runner records them on the entry rather than
//! retrying.

pub mod prompts;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{JournalError, Result};
use crate::store::{EntryKind, PromptAnswer};

/// Sampling temperature for journal generation.
const TEMPERATURE: f64 = 0.7;

/// Token budget for the generated body.
const NUM_PREDICT: u32 = 4096;

/// Connect-level timeout. Generation itself has no application timeout; a
/// slow local model is allowed to take its time.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Output of a generation call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedOutput {
    /// Full structured journal body (brain-dump).
    pub content: Option<String>,
    /// Short reflection paragraph (daily-reflection).
    pub reflection: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Client bound to one base URL and model id.
#[derive(Debug, Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(base_url: &str, model: &str) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            model: model.to_owned(),
        }
    }

    /// Generate the LLM-authored parts of a note for `kind`.
    ///
    /// Quick notes never touch the model and return empty output.
    pub async fn generate(
        &self,
        transcript: &str,
        prompt_answers: &HashMap<String, PromptAnswer>,
        kind: EntryKind,
        user_name: &str,
    ) -> Result<GeneratedOutput> {
        match kind {
            EntryKind::QuickNote => Ok(GeneratedOutput::default()),
            EntryKind::BrainDump => {
                let prompt = prompts::brain_dump_prompt(transcript, user_name);
                let body = self.complete(&prompt).await?;
                Ok(GeneratedOutput {
                    content: Some(body),
                    reflection: None,
                })
            }
            EntryKind::DailyReflection => {
                let prompt = prompts::reflection_prompt(prompt_answers);
                let body = self.complete(&prompt).await?;
                Ok(GeneratedOutput {
                    content: None,
                    reflection: Some(body),
                })
            }
        }
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        debug!(model = %self.model, prompt_chars = prompt.len(), "calling LLM");

        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: TEMPERATURE,
                num_predict: NUM_PREDICT,
            },
        };

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| JournalError::Llm(format!("LLM endpoint unreachable at {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JournalError::Llm(format!(
                "LLM endpoint returned {status}: {}",
                body.chars().take(500).collect::<String>()
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| JournalError::Llm(format!("malformed LLM response: {e}")))?;

        info!(chars = parsed.response.len(), "LLM generation complete");
        Ok(parsed.response.trim().to_owned())
    }
}
