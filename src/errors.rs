use thiserror::Error;

/// Errors from the tokenizer seam. Callers branch on `UnsupportedModel` to
/// decide disposition (fail-open), so this is a typed enum rather than
/// `anyhow::Error`.
#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("model {0:?} is not supported for chat token counting")]
    UnsupportedModel(String),
    #[error("failed to load byte-pair encoder for encoding {0:?}: {1}")]
    EncoderLoad(String, #[source] anyhow::Error),
}

/// Errors from the LLM adapter seam (request/response/stream-chunk parsing).
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to parse request body as JSON: {0}")]
    InvalidRequestBody(#[source] serde_json::Error),
    #[error("failed to parse response body as JSON: {0}")]
    InvalidResponseBody(#[source] serde_json::Error),
    #[error("failed to parse stream chunk as JSON: {0}")]
    InvalidStreamChunk(#[source] serde_json::Error),
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
}
