//! Token accounting. Wraps a process-wide model → encoder cache over the
//! lazily-initialized tiktoken singletons; unknown models fall back to the
//! `cl100k_base` encoder so metering degrades instead of failing.

use crate::openai::Message;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use tiktoken_rs::CoreBPE;
use tiktoken_rs::tokenizer::{Tokenizer, get_tokenizer};

fn encoder_cache() -> &'static RwLock<HashMap<String, &'static CoreBPE>> {
    static CACHE: OnceLock<RwLock<HashMap<String, &'static CoreBPE>>> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn bpe_for_tokenizer(tokenizer: Tokenizer) -> &'static CoreBPE {
    match tokenizer {
        Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        Tokenizer::R50kBase | Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
        Tokenizer::P50kBase | Tokenizer::P50kEdit => tiktoken_rs::r50k_base_singleton(),
    }
}

/// Resolves the encoder for a model. Steady-state reads take the shared
/// lock; a miss takes the write lock with a double-check so two racing
/// requests insert the same entry once.
fn token_encoder(model: &str) -> &'static CoreBPE {
    if let Some(encoder) = encoder_cache()
        .read()
        .expect("encoder cache poisoned")
        .get(model)
        .copied()
    {
        return encoder;
    }
    let encoder = match get_tokenizer(model) {
        Some(tokenizer) => bpe_for_tokenizer(tokenizer),
        None => {
            tracing::warn!(model, "no token encoder for model, using cl100k_base");
            tiktoken_rs::cl100k_base_singleton()
        }
    };
    let mut cache = encoder_cache().write().expect("encoder cache poisoned");
    cache.entry(model.to_string()).or_insert(encoder);
    encoder
}

/// Prompt tokens of a chat message list, following the OpenAI cookbook
/// accounting: a fixed per-message overhead, role and content tokens, the
/// name field when present, and the assistant priming tail.
pub fn count_token_messages(messages: &[Message], model: &str) -> i64 {
    let encoder = token_encoder(model);
    // Every message follows <|start|>{role/name}\n{content}<|end|>\n
    let (tokens_per_message, tokens_per_name): (i64, i64) = if model == "gpt-3.5-turbo-0301" {
        (4, -1) // if there's a name, the role is omitted
    } else {
        (3, 1)
    };
    let mut total = 0i64;
    for message in messages {
        total += tokens_per_message;
        total += encoder.encode_ordinary(&message.content).len() as i64;
        total += encoder.encode_ordinary(&message.role).len() as i64;
        if let Some(name) = &message.name {
            total += tokens_per_name;
            total += encoder.encode_ordinary(name).len() as i64;
        }
    }
    total += 3; // every reply is primed with <|start|>assistant<|message|>
    total
}

/// Prompt tokens of a completions/moderations input: a string, or an array
/// of strings counted as their concatenation.
pub fn count_token_input(input: &Value, model: &str) -> i64 {
    match input {
        Value::String(text) => count_token_text(text, model),
        Value::Array(items) => {
            let mut text = String::new();
            for item in items {
                if let Some(s) = item.as_str() {
                    text.push_str(s);
                }
            }
            count_token_text(&text, model)
        }
        _ => 0,
    }
}

pub fn count_token_text(text: &str, model: &str) -> i64 {
    token_encoder(model).encode_ordinary(text).len() as i64
}
