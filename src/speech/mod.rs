//! Speech collaborators: text-to-speech for outgoing replies and
//! speech-to-text for incoming voice notes.
//!
//! Both are thin I/O wrappers behind traits; failures are transient and
//! never abort the turn that triggered them.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::{json, Value};

// ── Text-to-speech ───────────────────────────────────────────

/// Renders finalized assistant text as audio.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Audio bytes for `text`, or `None` when synthesis is disabled.
    async fn synthesize(&self, text: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Synthesis turned off — every reply stays text-only.
pub struct NullSynthesizer;

#[async_trait]
impl SpeechSynthesizer for NullSynthesizer {
    async fn synthesize(&self, _text: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// OpenAI speech endpoint.
pub struct OpenAISpeech {
    client: Client,
    api_key: String,
    model: String,
    voice: String,
    endpoint: String,
}

impl OpenAISpeech {
    pub fn new(api_key: String, model: String, voice: String) -> Self {
        Self::with_endpoint(
            api_key,
            model,
            voice,
            "https://api.openai.com/v1/audio/speech".to_string(),
        )
    }

    pub fn with_endpoint(api_key: String, model: String, voice: String, endpoint: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .expect("failed to build HTTP client"),
            api_key,
            model,
            voice,
            endpoint,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAISpeech {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let body = json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI Speech API returned {status}: {text}");
        }

        Ok(Some(resp.bytes().await?.to_vec()))
    }
}

// ── Speech-to-text ───────────────────────────────────────────

/// Turns a recorded voice note into plain text for the engine.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> anyhow::Result<String>;
}

/// OpenAI transcription endpoint.
pub struct OpenAITranscriber {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAITranscriber {
    pub fn new(api_key: String) -> Self {
        Self::with_endpoint(
            api_key,
            "whisper-1".to_string(),
            "https://api.openai.com/v1/audio/transcriptions".to_string(),
        )
    }

    pub fn with_endpoint(api_key: String, model: String, endpoint: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .expect("failed to build HTTP client"),
            api_key,
            model,
            endpoint,
        }
    }
}

#[async_trait]
impl Transcriber for OpenAITranscriber {
    async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> anyhow::Result<String> {
        let form = Form::new()
            .text("model", self.model.clone())
            .part("file", Part::bytes(audio).file_name(filename.to_string()));

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI Transcription API returned {status}: {text}");
        }

        let json: Value = resp.json().await?;
        json["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("transcription response contained no text"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_synthesizer_yields_nothing() {
        let s = NullSynthesizer;
        assert!(s.synthesize("hello").await.unwrap().is_none());
    }

    #[test]
    fn transcription_response_extracts_text() {
        let fake = serde_json::json!({ "text": "set a timer for five minutes" });
        assert_eq!(
            fake["text"].as_str().unwrap(),
            "set a timer for five minutes"
        );
    }
}
