use serde::Deserialize;

use super::LlmAdapter;
use crate::errors::AdapterError;
use crate::tokenizer;
use crate::types::{ChatMessage, Delta, HtnnRequest, HtnnResponse, HtnnStreamDelta};

/// https://platform.openai.com/docs/api-reference/chat/create
#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    model: String,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    max_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: String,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
}

pub struct OpenAiAdapter;

impl LlmAdapter for OpenAiAdapter {
    fn convert_request(&self, body: &[u8]) -> Result<HtnnRequest, AdapterError> {
        let req: ChatCompletionRequest =
            serde_json::from_slice(body).map_err(AdapterError::InvalidRequestBody)?;
        let prompt_token = tokenizer::count_chat_tokens(&req.messages, &req.model)?;
        Ok(HtnnRequest {
            model: req.model,
            prompt_token,
            stream: req.stream,
            max_tokens: req.max_tokens,
        })
    }

    fn convert_response(&self, body: &[u8]) -> Result<HtnnResponse, AdapterError> {
        let resp: ChatCompletionResponse =
            serde_json::from_slice(body).map_err(AdapterError::InvalidResponseBody)?;
        Ok(HtnnResponse {
            model: resp.model,
            prompt_tokens: resp.usage.prompt_tokens,
            completion_tokens: resp.usage.completion_tokens,
            total_tokens: resp.usage.total_tokens,
        })
    }

    fn convert_stream_chunk(
        &self,
        mut delta: HtnnStreamDelta,
        chunk: &[u8],
    ) -> Result<HtnnStreamDelta, AdapterError> {
        let streamed: ChatCompletionChunk =
            serde_json::from_slice(chunk).map_err(AdapterError::InvalidStreamChunk)?;
        if !streamed.model.is_empty() {
            delta.model = streamed.model.clone();
        }

        for choice in &streamed.choices {
            delta.deltas.push(Delta {
                role: choice.delta.role.clone(),
                content: choice.delta.content.clone(),
            });

            if choice.finish_reason.is_some() {
                delta.finish = true;
                let synthetic: Vec<ChatMessage> = delta
                    .deltas
                    .iter()
                    .map(|d| ChatMessage {
                        role: d.role.clone(),
                        content: d.content.clone(),
                        name: None,
                    })
                    .collect();
                delta.completion_tokens =
                    tokenizer::count_chat_tokens(&synthetic, &streamed.model)?;
                return Ok(delta);
            }
        }

        Ok(delta)
    }
}
