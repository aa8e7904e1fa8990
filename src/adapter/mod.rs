//! Provider-specific translation between wire bytes and the internal
//! `HtnnRequest`/`HtnnResponse`/`HtnnStreamDelta` shapes.
//!
//! The set of providers is closed and selected once at config-build time —
//! nothing downstream of configuration can introduce a new provider — so
//! this is a trait object behind an `Arc`, not an open registry.

pub mod openai;

use crate::errors::AdapterError;
use crate::types::{HtnnRequest, HtnnResponse, HtnnStreamDelta};

pub trait LlmAdapter: Send + Sync {
    fn convert_request(&self, body: &[u8]) -> Result<HtnnRequest, AdapterError>;
    fn convert_response(&self, body: &[u8]) -> Result<HtnnResponse, AdapterError>;
    fn convert_stream_chunk(
        &self,
        delta: HtnnStreamDelta,
        chunk: &[u8],
    ) -> Result<HtnnStreamDelta, AdapterError>;
}

/// The closed set of adapter kinds recognized by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmAdapterType {
    OpenAi,
}

impl LlmAdapterType {
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "openai" => Ok(Self::OpenAi),
            other => Err(anyhow::anyhow!("invalid llm adapter type: {other}")),
        }
    }

    pub fn build(self) -> std::sync::Arc<dyn LlmAdapter> {
        match self {
            LlmAdapterType::OpenAi => std::sync::Arc::new(openai::OpenAiAdapter),
        }
    }
}
