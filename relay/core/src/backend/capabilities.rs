//! Capability Inference
//!
//! Neither backend reports context windows in its catalog, so they are
//! inferred from the model id. The rules are deterministic: an explicit size
//! token wins, then a family default, otherwise unknown.

use crate::contracts::ModelCapabilities;

/// Explicit context size tokens, longest first so `128k` is not read as `8k`
const SIZE_TOKENS: &[(&str, u32)] = &[
    ("128k", 131_072),
    ("100k", 102_400),
    ("64k", 65_536),
    ("32k", 32_768),
    ("16k", 16_384),
    ("8k", 8_192),
    ("4k", 4_096),
    ("2k", 2_048),
];

/// Family defaults, checked in order (code-branded models before their base family)
const FAMILY_DEFAULTS: &[(&[&str], u32)] = &[
    (
        &["codellama", "deepseek-coder", "starcoder", "qwen2.5-coder"],
        16_384,
    ),
    (&["llama3", "llama-3"], 8_192),
    (&["mistral", "mixtral"], 32_768),
    (&["qwen2", "qwen3"], 32_768),
    (&["phi3", "phi-3"], 4_096),
    (&["gemma"], 8_192),
    (&["llama2", "llama-2"], 4_096),
];

/// Whether `token` occurs in `id` without a digit directly before it
fn has_size_token(id: &str, token: &str) -> bool {
    id.match_indices(token).any(|(pos, _)| {
        id[..pos]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_ascii_digit())
    })
}

/// Context window in tokens, if it can be inferred from the id
#[must_use]
pub fn infer_context_length(model_id: &str) -> Option<u32> {
    let id = model_id.to_ascii_lowercase();

    if let Some((_, size)) = SIZE_TOKENS.iter().find(|(token, _)| has_size_token(&id, token)) {
        return Some(*size);
    }

    FAMILY_DEFAULTS
        .iter()
        .find(|(names, _)| names.iter().any(|name| id.contains(name)))
        .map(|(_, size)| *size)
}

/// Whether the id names an embedding-only model
#[must_use]
pub fn is_embedding_model(model_id: &str) -> bool {
    model_id.to_ascii_lowercase().contains("embed")
}

/// Capabilities for a model id
#[must_use]
pub fn infer_capabilities(model_id: &str) -> ModelCapabilities {
    let embedding = is_embedding_model(model_id);
    ModelCapabilities {
        supports_chat: !embedding,
        supports_completion: !embedding,
        max_context_length: infer_context_length(model_id),
        ..ModelCapabilities::default()
    }
}
