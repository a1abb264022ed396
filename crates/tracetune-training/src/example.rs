//! Raw record -> token ids + loss-masked labels.

use crate::dataset::RawRecord;
use crate::error::{TrainingError, TrainingResult};
use crate::template::{RenderStrategy, RenderedExchange};
use crate::thinking::{ThinkingMode, ThinkingSplit};
use crate::tokenizer::Tokenizer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Label value excluded from loss and accuracy.
pub const MASK_VALUE: i64 = -100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenExample {
    pub input_ids: Vec<u32>,
    pub labels: Vec<i64>,
}

impl TokenExample {
    /// Mask the first `prompt_len` positions of `input_ids`.
    ///
    /// A prompt longer than the whole sequence cannot be a prefix of it and is an
    /// invariant violation.
    pub fn from_prompt_boundary(input_ids: Vec<u32>, prompt_len: usize) -> TrainingResult<Self> {
        if prompt_len > input_ids.len() {
            return Err(TrainingError::InvariantViolation(format!(
                "label length {prompt_len} does not match input length {}",
                input_ids.len()
            )));
        }

        let labels: Vec<i64> = std::iter::repeat_n(MASK_VALUE, prompt_len)
            .chain(input_ids[prompt_len..].iter().map(|&id| i64::from(id)))
            .collect();
        Ok(Self { input_ids, labels })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Keep the trailing `max_len` positions of both sequences.
    pub fn truncate_tail(&mut self, max_len: usize) {
        if self.input_ids.len() > max_len {
            let start = self.input_ids.len() - max_len;
            self.input_ids.drain(..start);
            self.labels.drain(..start);
        }
    }

    #[must_use]
    pub fn trainable_tokens(&self) -> usize {
        self.labels.iter().filter(|&&l| l != MASK_VALUE).count()
    }
}

/// Rendering options for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderOptions {
    pub strategy: RenderStrategy,
    pub thinking: ThinkingMode,
    pub max_seq_len: usize,
}

pub struct ExampleBuilder {
    tokenizer: Arc<dyn Tokenizer>,
    options: BuilderOptions,
    parse_failures: AtomicU64,
}

impl ExampleBuilder {
    #[must_use]
    pub fn new(tokenizer: Arc<dyn Tokenizer>, options: BuilderOptions) -> Self {
        Self { tokenizer, options, parse_failures: AtomicU64::new(0) }
    }

    #[must_use]
    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    #[must_use]
    pub fn options(&self) -> &BuilderOptions {
        &self.options
    }

    /// Records whose response carried no thinking delimiters so far.
    #[must_use]
    pub fn parse_failures(&self) -> u64 {
        self.parse_failures.load(Ordering::Relaxed)
    }

    /// Final assistant text for `record`, warning once if the trace could not be parsed.
    pub fn assistant_text(&self, record: &RawRecord) -> String {
        let split = ThinkingSplit::from_response(&record.response);
        if !split.delimiters_found {
            self.parse_failures.fetch_add(1, Ordering::Relaxed);
            warn!(response = %split.attempt, "`<think>` parsing failed, training on the full response");
        }
        split.compose(self.options.thinking)
    }

    pub fn render(&self, record: &RawRecord) -> TrainingResult<RenderedExchange> {
        let assistant = self.assistant_text(record);
        self.options.strategy.render_exchange(&record.question, &assistant)
    }

    pub fn build(&self, record: &RawRecord) -> TrainingResult<TokenExample> {
        self.build_detailed(record).map(|built| built.example)
    }

    /// Like [`ExampleBuilder::build`], keeping the rendered text and untruncated token counts.
    pub fn build_detailed(&self, record: &RawRecord) -> TrainingResult<BuiltExample> {
        let exchange = self.render(record)?;

        let full_ids = self.tokenizer.encode(&exchange.full, false)?;
        let prompt_ids = self.tokenizer.encode(&exchange.prompt, false)?;

        if !full_ids.starts_with(&prompt_ids) {
            warn!(
                prompt_len = prompt_ids.len(),
                full_len = full_ids.len(),
                "prompt tokens are not a prefix of the exchange tokens; masking by length"
            );
        }

        let prompt_tokens = prompt_ids.len();
        let full_tokens = full_ids.len();
        let mut example = TokenExample::from_prompt_boundary(full_ids, prompt_tokens)?;
        example.truncate_tail(self.options.max_seq_len);
        Ok(BuiltExample { exchange, prompt_tokens, full_tokens, example })
    }
}

#[derive(Debug, Clone)]
pub struct BuiltExample {
    pub exchange: RenderedExchange,
    pub prompt_tokens: usize,
    pub full_tokens: usize,
    pub example: TokenExample,
}
