use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One intercepted call to an LLM provider, as delivered by the event bus.
///
/// Every field is optional on the wire: the evaluator decides whether an event
/// is assessable, the transport does not. `received_at` is stamped by the
/// pipeline on ingest and stands in for a missing `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, alias = "event_id")]
    pub id: Option<String>,
    #[serde(default, alias = "source_ip", alias = "client_ip")]
    pub source_address: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, alias = "prompt")]
    pub prompt_text: Option<String>,
    #[serde(default, alias = "response")]
    pub response_text: Option<String>,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(
        source_address: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        prompt_text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            source_address: Some(source_address.into()),
            provider: Some(provider.into()),
            model: Some(model.into()),
            prompt_text: Some(prompt_text.into()),
            response_text: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: None,
            duration_ms: 0,
            status_code: Some(200),
            timestamp: Some(timestamp),
            received_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response_text = Some(response.into());
        self
    }

    pub fn with_tokens(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.prompt_tokens = prompt_tokens;
        self.completion_tokens = completion_tokens;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Stamp the ingest time. A redelivered event keeps its first stamp.
    pub fn received(mut self, at: DateTime<Utc>) -> Self {
        self.received_at.get_or_insert(at);
        self
    }

    /// Event time: the producer's timestamp, else the ingest stamp.
    pub fn event_time(&self) -> DateTime<Utc> {
        self.timestamp.or(self.received_at).unwrap_or_default()
    }

    /// Stable identity used for replay detection. Explicit ids win; otherwise
    /// the id is a BLAKE3 digest of the identifying fields.
    pub fn identity(&self) -> String {
        if let Some(id) = self.id.as_deref().filter(|s| !s.is_empty()) {
            return id.to_string();
        }
        let mut h = blake3::Hasher::new();
        for part in [
            self.source_address.as_deref().unwrap_or(""),
            self.provider.as_deref().unwrap_or(""),
            self.model.as_deref().unwrap_or(""),
            self.prompt_text.as_deref().unwrap_or(""),
            self.response_text.as_deref().unwrap_or(""),
        ] {
            h.update(part.as_bytes());
            h.update(b"|");
        }
        if let Some(ts) = self.timestamp {
            h.update(ts.to_rfc3339().as_bytes());
        }
        h.finalize().to_hex().to_string()
    }

    /// Source address, if the event is minimally identifiable.
    pub fn source(&self) -> Option<&str> {
        self.source_address.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Names of the fields required for assessment that are absent or blank.
    pub fn missing_fields(&self) -> Vec<String> {
        let mut missing = Vec::new();
        let blank = |v: &Option<String>| v.as_deref().map(str::trim).map_or(true, str::is_empty);
        if self.source().is_none() {
            missing.push("source_address".to_string());
        }
        if blank(&self.provider) {
            missing.push("provider".to_string());
        }
        if blank(&self.model) {
            missing.push("model".to_string());
        }
        if self.prompt_text.is_none() {
            missing.push("prompt_text".to_string());
        }
        if self.timestamp.is_none() {
            missing.push("timestamp".to_string());
        }
        missing
    }

    /// Prompt and response joined by a newline; the haystack for text rules.
    pub fn combined_text(&self) -> String {
        let prompt = self.prompt_text.as_deref().unwrap_or("");
        match self.response_text.as_deref() {
            Some(resp) if !resp.is_empty() => format!("{}\n{}", prompt, resp),
            _ => prompt.to_string(),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
            .unwrap_or_else(|| self.prompt_tokens.saturating_add(self.completion_tokens))
    }
}
