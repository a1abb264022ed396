//! Tokenizer service and its two implementations.
//!
//! [`HfTokenizer`] wraps a Hugging Face `tokenizer.json`; [`ByteTokenizer`] is a
//! byte-level fallback with the chat special tokens registered, small enough to
//! pair with the bigram reference model.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub const HF_TOKENIZER_FILE: &str = "tokenizer.json";
pub const HF_TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
pub const BYTE_TOKENIZER_FILE: &str = "byte_tokenizer.json";

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str, add_special_tokens: bool) -> TrainingResult<Vec<u32>>;

    fn decode(&self, ids: &[u32]) -> TrainingResult<String>;

    fn eos_id(&self) -> u32;

    fn bos_token(&self) -> Option<&str>;

    fn vocab_size(&self) -> usize;

    /// Write the artifacts needed to reload this tokenizer into `dir`.
    fn save(&self, dir: &Path) -> TrainingResult<()>;

    /// Jinja chat template shipped with the tokenizer, if any.
    fn chat_template(&self) -> Option<&str> {
        None
    }
}

/// Load the tokenizer that ships with a model directory.
///
/// `tokenizer.json` wins; otherwise a saved byte tokenizer; otherwise a fresh one.
pub fn load_tokenizer(model_path: &Path) -> TrainingResult<Arc<dyn Tokenizer>> {
    if model_path.join(HF_TOKENIZER_FILE).exists() {
        info!(path = %model_path.display(), "loading Hugging Face tokenizer");
        return Ok(Arc::new(HfTokenizer::from_dir(model_path)?));
    }
    if model_path.join(BYTE_TOKENIZER_FILE).exists() {
        info!(path = %model_path.display(), "loading byte tokenizer");
        return Ok(Arc::new(ByteTokenizer::from_file(&model_path.join(BYTE_TOKENIZER_FILE))?));
    }
    info!("no tokenizer found in model path, using default byte tokenizer");
    Ok(Arc::new(ByteTokenizer::default()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteTokenizer {
    special_tokens: Vec<String>,
    eos_token: String,
    bos_token: String,
}

impl Default for ByteTokenizer {
    fn default() -> Self {
        let special_tokens = [
            "<|endoftext|>",
            "<|begin_of_text|>",
            "<|im_start|>",
            "<|im_end|>",
            "<|start_header_id|>",
            "<|end_header_id|>",
            "<|eot_id|>",
            "<think>",
            "</think>",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        Self {
            special_tokens,
            eos_token: "<|endoftext|>".to_string(),
            bos_token: "<|begin_of_text|>".to_string(),
        }
    }
}

impl ByteTokenizer {
    const BYTE_VOCAB: u32 = 256;

    pub fn from_file(path: &Path) -> TrainingResult<Self> {
        let bytes = std::fs::read(path)?;
        let tokenizer: Self = serde_json::from_slice(&bytes)?;
        tokenizer.special_id(&tokenizer.eos_token).ok_or_else(|| {
            TrainingError::Tokenizer(format!("eos token {} is not a special token", tokenizer.eos_token))
        })?;
        Ok(tokenizer)
    }

    fn special_id(&self, token: &str) -> Option<u32> {
        self.special_tokens
            .iter()
            .position(|t| t == token)
            .map(|idx| Self::BYTE_VOCAB + idx as u32)
    }

    /// Longest special token starting at the beginning of `text`.
    fn match_special(&self, text: &str) -> Option<(u32, usize)> {
        self.special_tokens
            .iter()
            .enumerate()
            .filter(|(_, tok)| text.starts_with(tok.as_str()))
            .max_by_key(|(_, tok)| tok.len())
            .map(|(idx, tok)| (Self::BYTE_VOCAB + idx as u32, tok.len()))
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> TrainingResult<Vec<u32>> {
        let mut ids = Vec::with_capacity(text.len() + 1);
        if add_special_tokens {
            ids.extend(self.special_id(&self.bos_token));
        }

        let mut rest = text;
        while !rest.is_empty() {
            if let Some((id, len)) = self.match_special(rest) {
                ids.push(id);
                rest = &rest[len..];
                continue;
            }
            let ch_len = rest.chars().next().map_or(1, char::len_utf8);
            ids.extend(rest.as_bytes()[..ch_len].iter().map(|b| u32::from(*b)));
            rest = &rest[ch_len..];
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> TrainingResult<String> {
        let mut bytes = Vec::with_capacity(ids.len());
        for &id in ids {
            if id < Self::BYTE_VOCAB {
                bytes.push(id as u8);
                continue;
            }
            let token = self
                .special_tokens
                .get((id - Self::BYTE_VOCAB) as usize)
                .ok_or_else(|| TrainingError::Tokenizer(format!("token id {id} out of range")))?;
            bytes.extend_from_slice(token.as_bytes());
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_id(&self) -> u32 {
        self.special_id(&self.eos_token).unwrap_or(Self::BYTE_VOCAB)
    }

    fn bos_token(&self) -> Option<&str> {
        Some(&self.bos_token)
    }

    fn vocab_size(&self) -> usize {
        Self::BYTE_VOCAB as usize + self.special_tokens.len()
    }

    fn save(&self, dir: &Path) -> TrainingResult<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(BYTE_TOKENIZER_FILE), serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

/// Hugging Face tokenizer loaded from `tokenizer.json` (+ optional `tokenizer_config.json`).
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    eos_id: u32,
    bos_token: Option<String>,
    chat_template: Option<String>,
    config_json: Option<serde_json::Value>,
}

impl HfTokenizer {
    pub fn from_dir(dir: &Path) -> TrainingResult<Self> {
        let tokenizer_path = dir.join(HF_TOKENIZER_FILE);
        let inner = tokenizers::Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            TrainingError::Tokenizer(format!("failed to load {}: {e}", tokenizer_path.display()))
        })?;

        let config_json = read_tokenizer_config(dir)?;

        let eos_token = config_json
            .as_ref()
            .and_then(|c| special_token_field(c, "eos_token"))
            .unwrap_or_else(|| "<|endoftext|>".to_string());
        let eos_id = inner.token_to_id(&eos_token).ok_or_else(|| {
            TrainingError::Tokenizer(format!("eos token {eos_token} not found in vocabulary"))
        })?;
        let bos_token = config_json.as_ref().and_then(|c| special_token_field(c, "bos_token"));
        let chat_template = config_json.as_ref().and_then(chat_template_field);
        if chat_template.is_none() {
            warn!(path = %dir.display(), "tokenizer config has no chat_template, using the built-in layout");
        }

        Ok(Self { inner, eos_id, bos_token, chat_template, config_json })
    }
}

/// `tokenizer_config.json` in `dir`, if present.
pub fn read_tokenizer_config(dir: &Path) -> TrainingResult<Option<serde_json::Value>> {
    let config_path = dir.join(HF_TOKENIZER_CONFIG_FILE);
    if !config_path.exists() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&std::fs::read(&config_path)?)?))
}

/// `chat_template` is either one template or a list of named ones; the default wins.
pub fn chat_template_field(config: &serde_json::Value) -> Option<String> {
    match config.get("chat_template")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(entries) => entries
            .iter()
            .find(|e| e.get("name").and_then(serde_json::Value::as_str) == Some("default"))
            .and_then(|e| e.get("template")?.as_str())
            .map(ToString::to_string),
        _ => None,
    }
}

/// `tokenizer_config.json` stores special tokens either as a string or as `{ "content": ... }`.
fn special_token_field(config: &serde_json::Value, key: &str) -> Option<String> {
    match config.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(obj) => obj.get("content")?.as_str().map(ToString::to_string),
        _ => None,
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> TrainingResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| TrainingError::Tokenizer(format!("failed to encode text: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> TrainingResult<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| TrainingError::Tokenizer(format!("failed to decode ids: {e}")))
    }

    fn eos_id(&self) -> u32 {
        self.eos_id
    }

    fn bos_token(&self) -> Option<&str> {
        self.bos_token.as_deref()
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn chat_template(&self) -> Option<&str> {
        self.chat_template.as_deref()
    }

    fn save(&self, dir: &Path) -> TrainingResult<()> {
        std::fs::create_dir_all(dir)?;
        self.inner
            .save(dir.join(HF_TOKENIZER_FILE), false)
            .map_err(|e| TrainingError::Tokenizer(format!("failed to save tokenizer: {e}")))?;
        if let Some(config) = &self.config_json {
            std::fs::write(dir.join(HF_TOKENIZER_CONFIG_FILE), serde_json::to_vec_pretty(config)?)?;
        }
        Ok(())
    }
}
