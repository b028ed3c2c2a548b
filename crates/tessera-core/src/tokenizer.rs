//! Tokenization boundary for the engine core.
//!
//! The engine only needs encode, decode, and the EOS token id; everything
//! else about tokenization is the backend's business. Requests that carry
//! pre-tokenized prompts work without any backend at all.

use std::path::Path;

use tokenizers::Tokenizer as HfBackend;
use tracing::debug;

use crate::engine::types::TokenId;
use crate::error::{Error, Result};

/// The contract the engine holds against an external tokenizer.
pub trait TokenizerBackend: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>>;

    fn decode(&self, ids: &[TokenId]) -> Result<String>;

    fn eos_token_id(&self) -> Option<TokenId>;

    /// Liveness probe; backends running out of process should override.
    fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Adapter-specific tokenizer, when the backend serves LoRA adapters
    /// with extended vocabularies.
    fn adapter(&self, _name: &str) -> Option<&dyn TokenizerBackend> {
        None
    }
}

/// Tokenizer backed by a HuggingFace `tokenizer.json`.
pub struct HfTokenizer {
    inner: HfBackend,
    eos_token_id: Option<TokenId>,
}

impl HfTokenizer {
    pub fn from_path(model_dir: &Path) -> Result<Self> {
        let tokenizer_path = model_dir.join("tokenizer.json");
        let inner = HfBackend::from_file(&tokenizer_path)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        debug!("Loaded tokenizer from {:?}", tokenizer_path);
        Ok(Self::new(inner, None))
    }

    pub fn new(inner: HfBackend, eos_token_id: Option<TokenId>) -> Self {
        Self {
            inner,
            eos_token_id,
        }
    }

    pub fn with_eos_token(mut self, eos_token_id: TokenId) -> Self {
        self.eos_token_id = Some(eos_token_id);
        self
    }
}

impl TokenizerBackend for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[TokenId]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }

    fn eos_token_id(&self) -> Option<TokenId> {
        self.eos_token_id
    }
}
