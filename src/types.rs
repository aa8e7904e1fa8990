use serde::{Deserialize, Serialize};

/// One message in a chat-completion request, as sent by the client.
///
/// https://platform.openai.com/docs/api-reference/chat/create
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    pub name: Option<String>,
}

/// Internal, provider-agnostic view of an inbound chat-completion request.
/// Produced once per request by an [`crate::adapter::LlmAdapter`] and consumed
/// by the filter; it is not retained once admission/prediction has run.
#[derive(Debug, Clone)]
pub struct HtnnRequest {
    pub model: String,
    pub prompt_token: u64,
    pub stream: bool,
    pub max_tokens: u64,
}

/// Internal view of a non-streamed chat-completion response.
#[derive(Debug, Clone)]
pub struct HtnnResponse {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One `{role, content}` fragment accumulated from a streamed response.
#[derive(Debug, Clone, Default)]
pub struct Delta {
    pub role: String,
    pub content: String,
}

/// Accumulator threaded through successive `encode_data` calls for one
/// streaming request. `completion_tokens` is only meaningful once `finish`
/// flips to true.
#[derive(Debug, Clone, Default)]
pub struct HtnnStreamDelta {
    pub model: String,
    pub finish: bool,
    pub deltas: Vec<Delta>,
    pub completion_tokens: u64,
}

/// A single observed `(prompt, completion)` exchange, as recorded into
/// [`crate::stats::TokenStats`]'s sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPair {
    pub prompt: u64,
    pub completion: u64,
}
