//! Token encoder registry
//!
//! Encoders are expensive to build, so each one is created on first use and
//! kept until [`TokenCounter::clear`]. Counts from here are advisory only:
//! billing always uses backend-reported usage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tiktoken_rs::CoreBPE;

use crate::error::GatewayError;

pub const DEFAULT_ENCODING: &str = "cl100k_base";

/// Cheap length heuristic (about four bytes per token)
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

/// Encoding conventionally used by a model family
pub fn encoding_for_model(model_id: &str) -> &'static str {
    let model = model_id.to_ascii_lowercase();
    if model.starts_with("text-davinci-002") || model.starts_with("text-davinci-003") {
        "p50k_base"
    } else if model.starts_with("davinci") || model.starts_with("curie") || model.starts_with("babbage") {
        "r50k_base"
    } else {
        DEFAULT_ENCODING
    }
}

/// Lazily populated encoders, keyed by encoding name
#[derive(Default)]
pub struct TokenCounter {
    encoders: RwLock<HashMap<String, Arc<CoreBPE>>>,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encoder(&self, encoding: &str) -> Result<Arc<CoreBPE>, GatewayError> {
        {
            let encoders = self.encoders.read().unwrap_or_else(|e| e.into_inner());
            if let Some(bpe) = encoders.get(encoding) {
                return Ok(bpe.clone());
            }
        }

        // Build outside the lock; a racing builder simply loses the insert
        let bpe = Arc::new(build_encoder(encoding)?);
        let mut encoders = self.encoders.write().unwrap_or_else(|e| e.into_inner());
        let entry = encoders.entry(encoding.to_string()).or_insert(bpe);
        Ok(entry.clone())
    }

    pub fn count(&self, text: &str, encoding: &str) -> Result<u64, GatewayError> {
        let bpe = self.encoder(encoding)?;
        Ok(bpe.encode_with_special_tokens(text).len() as u64)
    }

    /// Count with the model's encoding, falling back to [`estimate_tokens`]
    pub fn count_for_model(&self, text: &str, model_id: &str) -> u64 {
        match self.count(text, encoding_for_model(model_id)) {
            Ok(count) => count,
            Err(e) => {
                tracing::debug!(model = %model_id, error = %e, "Tokenizer unavailable, using estimate");
                estimate_tokens(text)
            }
        }
    }

    pub fn preload(&self, encodings: &[&str]) -> Result<(), GatewayError> {
        for encoding in encodings {
            self.encoder(encoding)?;
        }
        tracing::info!(count = encodings.len(), "Preloaded token encoders");
        Ok(())
    }

    /// Drop every cached encoder
    pub fn clear(&self) {
        self.encoders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn cached_encodings(&self) -> Vec<String> {
        let encoders = self.encoders.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = encoders.keys().cloned().collect();
        names.sort();
        names
    }
}

fn build_encoder(encoding: &str) -> Result<CoreBPE, GatewayError> {
    let result = match encoding {
        "cl100k_base" => tiktoken_rs::cl100k_base(),
        "p50k_base" => tiktoken_rs::p50k_base(),
        "p50k_edit" => tiktoken_rs::p50k_edit(),
        "r50k_base" => tiktoken_rs::r50k_base(),
        other => {
            return Err(GatewayError::Config(format!("unknown token encoding: {}", other)));
        }
    };
    result.map_err(|e| GatewayError::Config(format!("failed to load encoding {}: {}", encoding, e)))
}
