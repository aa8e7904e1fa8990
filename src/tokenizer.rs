use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

use crate::errors::TokenizerError;
use crate::types::ChatMessage;

/// Per-message token overhead for a model family, per OpenAI's
/// `num_tokens_from_messages` reference implementation.
struct ChatOverhead {
    tokens_per_message: i64,
    tokens_per_name: i64,
    final_addition: i64,
}

/// Resolves a raw model name to the encoding it should be tokenized with and
/// the per-message overhead to apply when counting chat tokens. Unknown
/// `gpt-3.5-turbo`/`gpt-4` point releases are aliased to the newest known
/// release in that family, matching the upstream model's own behavior of
/// evolving in place under the same name.
fn resolve_model(model: &str) -> Result<(&'static str, ChatOverhead), TokenizerError> {
    match model {
        "gpt-3.5-turbo-0613" | "gpt-3.5-turbo-16k-0613" | "gpt-4-0314" | "gpt-4-32k-0314"
        | "gpt-4-0613" | "gpt-4-32k-0613" => Ok((
            "cl100k_base",
            ChatOverhead {
                tokens_per_message: 3,
                tokens_per_name: 1,
                final_addition: 3,
            },
        )),
        "gpt-3.5-turbo-0301" => Ok((
            "cl100k_base",
            ChatOverhead {
                tokens_per_message: 4,
                tokens_per_name: -1,
                final_addition: 3,
            },
        )),
        other if other.contains("gpt-3.5-turbo") => {
            tracing::warn!(
                model = other,
                "gpt-3.5-turbo may update over time, assuming gpt-3.5-turbo-0613"
            );
            resolve_model("gpt-3.5-turbo-0613")
        }
        other if other.contains("gpt-4") => {
            tracing::warn!(model = other, "gpt-4 may update over time, assuming gpt-4-0613");
            resolve_model("gpt-4-0613")
        }
        other => Err(TokenizerError::UnsupportedModel(other.to_string())),
    }
}

fn bpe_for_encoding(encoding: &str) -> Result<Arc<CoreBPE>, TokenizerError> {
    static CACHE: Lazy<Mutex<HashMap<String, Arc<CoreBPE>>>> =
        Lazy::new(|| Mutex::new(HashMap::new()));

    let mut cache = CACHE.lock().expect("tokenizer cache mutex poisoned");
    if let Some(bpe) = cache.get(encoding) {
        return Ok(bpe.clone());
    }

    let bpe = match encoding {
        "cl100k_base" => tiktoken_rs::cl100k_base(),
        "o200k_base" => tiktoken_rs::o200k_base(),
        other => {
            return Err(TokenizerError::EncoderLoad(
                other.to_string(),
                anyhow::anyhow!("no known vocabulary for encoding {other:?}"),
            ))
        }
    }
    .map_err(|err| TokenizerError::EncoderLoad(encoding.to_string(), err))?;

    let bpe = Arc::new(bpe);
    cache.insert(encoding.to_string(), bpe.clone());
    Ok(bpe)
}

/// Byte-pair encodes `text` for `model`, returning token ids. Loads and
/// caches the encoder lazily per encoding name; the merge tables are large
/// enough that reloading them per call would dominate request latency.
pub fn encode(text: &str, model: &str) -> Result<Vec<usize>, TokenizerError> {
    let (encoding, _) = resolve_model(model)?;
    let bpe = bpe_for_encoding(encoding)?;
    Ok(bpe.encode_with_special_tokens(text))
}

/// Counts the tokens a chat-completion request over `messages` will cost,
/// applying the model family's per-message overhead.
pub fn count_chat_tokens(messages: &[ChatMessage], model: &str) -> Result<u64, TokenizerError> {
    let (encoding, overhead) = resolve_model(model)?;
    let bpe = bpe_for_encoding(encoding)?;

    let mut num_tokens: i64 = 0;
    for message in messages {
        num_tokens += overhead.tokens_per_message;
        num_tokens += bpe.encode_with_special_tokens(&message.content).len() as i64;
        num_tokens += bpe.encode_with_special_tokens(&message.role).len() as i64;
        if let Some(name) = &message.name {
            num_tokens += bpe.encode_with_special_tokens(name).len() as i64;
            num_tokens += overhead.tokens_per_name;
        }
    }
    num_tokens += overhead.final_addition;

    Ok(num_tokens.max(0) as u64)
}
