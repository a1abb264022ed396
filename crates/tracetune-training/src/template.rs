//! Chat rendering for the supported model families.
//!
//! A [`RenderStrategy`] is chosen once when the run is configured. Tokenizers
//! that ship a Jinja `chat_template` are rendered through it; the family only
//! decides whether the BOS token is passed in. The built-in ChatML and Llama-3
//! layouts cover tokenizers without a template.
//!
//! Rendering the prompt alone (with the generation header) must yield a prefix
//! of rendering the full exchange; label masking depends on it.

use crate::error::{TrainingError, TrainingResult};
use crate::tokenizer::Tokenizer;
use minijinja::{Environment, ErrorKind, State, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const CHATML_IM_START: &str = "<|im_start|>";
pub const CHATML_IM_END: &str = "<|im_end|>";
pub const LLAMA3_START_HEADER: &str = "<|start_header_id|>";
pub const LLAMA3_END_HEADER: &str = "<|end_header_id|>";
pub const LLAMA3_EOT: &str = "<|eot_id|>";

/// Clause in reasoning-model templates that drops everything up to `</think>`
/// from assistant turns. Removed so the trace stays in the training text.
pub const THINK_STRIP_CLAUSE: &str =
    "{% if '</think>' in content %}{% set content = content.split('</think>')[-1] %}{% endif %}";

/// Base model family, as named on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatFamily {
    Qwen,
    Llama,
}

impl ChatFamily {
    /// Pick the render strategy for this family and tokenizer.
    pub fn strategy(self, tokenizer: &dyn Tokenizer) -> TrainingResult<RenderStrategy> {
        let Some(source) = tokenizer.chat_template() else {
            return self.builtin(tokenizer.bos_token());
        };
        let bos_token = self.bos_argument(tokenizer.bos_token())?;
        Ok(RenderStrategy::Jinja(ChatTemplate::new(source, bos_token)?))
    }

    /// The family's built-in layout, for tokenizers without a chat template.
    pub fn builtin(self, bos_token: Option<&str>) -> TrainingResult<RenderStrategy> {
        match self.bos_argument(bos_token)? {
            None => Ok(RenderStrategy::ChatMl),
            Some(bos_token) => Ok(RenderStrategy::Llama3 { bos_token }),
        }
    }

    /// Llama templates take the BOS token explicitly; Qwen templates do not.
    fn bos_argument(self, bos_token: Option<&str>) -> TrainingResult<Option<String>> {
        match self {
            Self::Qwen => Ok(None),
            Self::Llama => bos_token.map(|t| Some(t.to_string())).ok_or_else(|| {
                TrainingError::InvalidConfig("Llama chat template requires a tokenizer with a BOS token".to_string())
            }),
        }
    }
}

impl fmt::Display for ChatFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Qwen => f.write_str("Qwen"),
            Self::Llama => f.write_str("Llama"),
        }
    }
}

impl FromStr for ChatFamily {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "qwen" => Ok(Self::Qwen),
            "llama" => Ok(Self::Llama),
            other => Err(TrainingError::InvalidConfig(format!(
                "unsupported base model family '{other}' (expected Qwen or Llama)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// A full conversation turn and its prompt-only rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedExchange {
    pub full: String,
    pub prompt: String,
}

impl RenderedExchange {
    /// The assistant part of `full`, i.e. everything after `prompt`.
    #[must_use]
    pub fn completion(&self) -> &str {
        &self.full[self.prompt.len()..]
    }
}

/// A model's own Jinja chat template, with the trace-stripping clause removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTemplate {
    source: String,
    bos_token: Option<String>,
}

impl ChatTemplate {
    pub fn new(source: &str, bos_token: Option<String>) -> TrainingResult<Self> {
        let source = source.replace(THINK_STRIP_CLAUSE, "");
        let env = template_env();
        env.template_from_str(&source)
            .map_err(|e| TrainingError::Tokenizer(format!("invalid chat template: {e}")))?;
        Ok(Self { source, bos_token })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    fn render(&self, messages: &[Message], add_generation_prompt: bool) -> TrainingResult<String> {
        let messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut ctx = serde_json::Map::new();
        ctx.insert("messages".to_string(), serde_json::Value::from(messages));
        ctx.insert("add_generation_prompt".to_string(), serde_json::Value::from(add_generation_prompt));
        if let Some(bos_token) = &self.bos_token {
            ctx.insert("bos_token".to_string(), serde_json::Value::from(bos_token.clone()));
        }

        template_env()
            .render_str(&self.source, ctx)
            .map_err(|e| TrainingError::Tokenizer(format!("failed to render chat template: {e}")))
    }
}

fn template_env() -> Environment<'static> {
    let mut env = Environment::new();
    env.add_function("raise_exception", |message: String| -> Result<String, minijinja::Error> {
        Err(minijinja::Error::new(ErrorKind::InvalidOperation, message))
    });
    env.set_unknown_method_callback(python_string_method);
    env
}

/// The Python `str` methods chat templates call on message content.
fn python_string_method(_state: &State<'_, '_>, value: &Value, method: &str, args: &[Value]) -> Result<Value, minijinja::Error> {
    let unknown = || minijinja::Error::new(ErrorKind::UnknownMethod, format!("{} has no method named {method}", value.kind()));
    let s = value.as_str().ok_or_else(unknown)?;
    let arg = args.first().and_then(Value::as_str);

    let result = match method {
        "startswith" => Value::from(arg.is_some_and(|prefix| s.starts_with(prefix))),
        "endswith" => Value::from(arg.is_some_and(|suffix| s.ends_with(suffix))),
        "strip" => Value::from(arg.map_or_else(|| s.trim(), |chars| s.trim_matches(|c: char| chars.contains(c)))),
        "lstrip" => Value::from(arg.map_or_else(|| s.trim_start(), |chars| s.trim_start_matches(|c: char| chars.contains(c)))),
        "rstrip" => Value::from(arg.map_or_else(|| s.trim_end(), |chars| s.trim_end_matches(|c: char| chars.contains(c)))),
        "split" => {
            let parts: Vec<Value> = match arg {
                Some(delim) => s.split(delim).map(Value::from).collect(),
                None => s.split_whitespace().map(Value::from).collect(),
            };
            Value::from(parts)
        }
        _ => return Err(unknown()),
    };
    Ok(result)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderStrategy {
    /// `<|im_start|>role\ncontent<|im_end|>\n` turns (Qwen).
    ChatMl,
    /// Llama-3 header turns, prefixed with the BOS token.
    Llama3 { bos_token: String },
    /// The tokenizer's own template.
    Jinja(ChatTemplate),
}

impl RenderStrategy {
    pub fn render(&self, messages: &[Message], add_generation_prompt: bool) -> TrainingResult<String> {
        match self {
            Self::ChatMl => Ok(render_chatml(messages, add_generation_prompt)),
            Self::Llama3 { bos_token } => Ok(render_llama3(bos_token, messages, add_generation_prompt)),
            Self::Jinja(template) => template.render(messages, add_generation_prompt),
        }
    }

    /// Render the user question with and without the assistant reply.
    pub fn render_exchange(&self, question: &str, assistant_text: &str) -> TrainingResult<RenderedExchange> {
        let full = self.render(&[Message::user(question), Message::assistant(assistant_text)], false)?;
        let prompt = self.render(&[Message::user(question)], true)?;

        if !full.starts_with(&prompt) {
            return Err(TrainingError::InvariantViolation(
                "rendered prompt is not a prefix of the rendered exchange".to_string(),
            ));
        }

        Ok(RenderedExchange { full, prompt })
    }
}

fn render_chatml(messages: &[Message], add_generation_prompt: bool) -> String {
    let mut text = String::new();
    for msg in messages {
        text.push_str(CHATML_IM_START);
        text.push_str(msg.role.as_str());
        text.push('\n');
        text.push_str(&msg.content);
        text.push_str(CHATML_IM_END);
        text.push('\n');
    }
    if add_generation_prompt {
        text.push_str(CHATML_IM_START);
        text.push_str("assistant\n");
    }
    text
}

fn render_llama3(bos_token: &str, messages: &[Message], add_generation_prompt: bool) -> String {
    let mut text = String::from(bos_token);
    for msg in messages {
        push_llama3_header(&mut text, msg.role);
        text.push_str(msg.content.trim());
        text.push_str(LLAMA3_EOT);
    }
    if add_generation_prompt {
        push_llama3_header(&mut text, Role::Assistant);
    }
    text
}

fn push_llama3_header(text: &mut String, role: Role) {
    text.push_str(LLAMA3_START_HEADER);
    text.push_str(role.as_str());
    text.push_str(LLAMA3_END_HEADER);
    text.push_str("\n\n");
}
