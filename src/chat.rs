//! Retrieval-augmented chat.
//!
//! A [`ChatEngine`] answers a conversation by retrieving the chunks most
//! relevant to the last user message, placing them in a prompt together with
//! the flattened conversation, and sending that prompt to a [`ChatModel`].
//!
//! Also provides the terminal chat loop used by `repo-chat chat` and
//! [`fragments`], which turns a finished answer into the lazy stream of text
//! pieces the HTTP server sends as SSE events.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::{Config, LlmConfig};
use crate::embedding::{OpenAiEmbedder, RetryPolicy};
use crate::error::ChatError;
use crate::models::ScoredChunk;
use crate::retrieve::{Retriever, VectorRetriever};
use crate::vector_store::QdrantStore;

/// First line shown by the terminal chat.
pub const GREETING: &str = "I am ready to help you";

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Sampling settings for one completion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionOptions {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// A language model that completes a list of messages.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[Message], options: &CompletionOptions) -> Result<String>;
    fn model_name(&self) -> &str;
}

// ============ OpenAI ============

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: Message,
}

/// [`ChatModel`] over an OpenAI-compatible `POST /chat/completions`.
pub struct OpenAiChat {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    /// # Errors
    ///
    /// Returns an error if no API key is configured or the HTTP client
    /// cannot be built.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let Some(api_key) = config.api_key.clone() else {
            bail!("OPENAI_API_KEY is not set");
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn complete(&self, messages: &[Message], options: &CompletionOptions) -> Result<String> {
        let body = CompletionRequest {
            model: &self.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text.trim());
        }

        let parsed: CompletionResponse = response.json().await?;
        match parsed.choices.into_iter().next() {
            Some(choice) => Ok(choice.message.content),
            None => bail!("OpenAI API returned no choices"),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ============ Prompting ============

/// The conversation as `role: content` lines.
pub fn flatten_conversation(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}\n", m.role, m.content))
        .collect()
}

/// Content of the last message with role `user`.
pub fn last_user_message(messages: &[Message]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.as_str())
}

/// Assemble the prompt sent to the model.
pub fn build_prompt(
    conversation: &str,
    question: &str,
    chunks: &[ScoredChunk],
    instruction: Option<&str>,
) -> String {
    let mut prompt = String::from(
        "Use the following pieces of context from the repository to answer the question \
         at the end. If you don't know the answer, say that you don't know instead of \
         making one up.\n\n",
    );
    for chunk in chunks {
        prompt.push_str(&format!("--- {}\n{}\n\n", chunk.source_path, chunk.text));
    }
    if !conversation.is_empty() {
        prompt.push_str("Conversation so far:\n");
        prompt.push_str(conversation);
        prompt.push('\n');
    }
    if let Some(instruction) = instruction.filter(|i| !i.trim().is_empty()) {
        prompt.push_str(instruction.trim());
        prompt.push('\n');
    }
    prompt.push_str(&format!("Question: {}\nHelpful Answer:", question));
    prompt
}

/// Retrieval plus generation.
pub struct ChatEngine {
    retriever: Arc<dyn Retriever>,
    model: Arc<dyn ChatModel>,
    top_k: usize,
    instruction: Option<String>,
}

impl ChatEngine {
    pub fn new(retriever: Arc<dyn Retriever>, model: Arc<dyn ChatModel>, top_k: usize) -> Self {
        Self {
            retriever,
            model,
            top_k,
            instruction: None,
        }
    }

    pub fn with_instruction(mut self, instruction: Option<String>) -> Self {
        self.instruction = instruction;
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Answer the last user message of `messages`.
    pub async fn answer(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<String, ChatError> {
        if messages.is_empty() {
            return Err(ChatError::NoMessages);
        }
        let question = last_user_message(messages).ok_or(ChatError::NoUserMessage)?;
        let conversation = flatten_conversation(messages);

        let chunks = self
            .retriever
            .retrieve(question, self.top_k)
            .await
            .map_err(ChatError::Retrieval)?;
        tracing::debug!("Answering with {} context chunks", chunks.len());

        let prompt = build_prompt(
            &conversation,
            question,
            &chunks,
            self.instruction.as_deref(),
        );
        self.model
            .complete(&[Message::user(prompt)], options)
            .await
            .map_err(ChatError::Model)
    }
}

/// Split an answer into single-character fragments, waiting `delay` between
/// them. The stream is lazy: dropping it stops production.
pub fn fragments(answer: String, delay: Duration) -> impl Stream<Item = String> {
    let pieces: Vec<String> = answer.chars().map(String::from).collect();
    stream::iter(pieces.into_iter().enumerate()).then(move |(i, piece)| async move {
        if i > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        piece
    })
}

// ============ Terminal ============

/// Read questions line by line and print answers until `exit`, `quit` or EOF.
///
/// The whole conversation is kept and sent with every question.
pub async fn chat_loop<R, W>(
    engine: &ChatEngine,
    options: &CompletionOptions,
    input: R,
    mut output: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut history: Vec<Message> = Vec::new();
    let mut lines = input.lines();

    output.write_all(format!("{}\n> ", GREETING).as_bytes()).await?;
    output.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let question = line.trim();
        if question.is_empty() {
            output.write_all(b"> ").await?;
            output.flush().await?;
            continue;
        }
        if question == "exit" || question == "quit" {
            break;
        }

        history.push(Message::user(question));
        match engine.answer(&history, options).await {
            Ok(answer) => {
                output.write_all(format!("{}\n> ", answer).as_bytes()).await?;
                history.push(Message::assistant(answer));
            }
            Err(e) => {
                tracing::error!("Chat request failed: {}", e);
                history.pop();
                output.write_all(format!("error: {}\n> ", e).as_bytes()).await?;
            }
        }
        output.flush().await?;
    }

    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}

/// Build a chat engine for `collection` from configuration.
pub fn engine_from_config(config: &Config, collection: &str) -> Result<ChatEngine> {
    let embedder = Arc::new(OpenAiEmbedder::new(&config.embedding)?);
    let store = Arc::new(QdrantStore::new(&config.qdrant)?);
    let retriever = VectorRetriever::new(embedder, store, collection)
        .with_retry_policy(RetryPolicy::from_config(&config.embedding));
    let model = OpenAiChat::new(&config.llm)?;

    Ok(
        ChatEngine::new(Arc::new(retriever), Arc::new(model), config.retrieval.top_k)
            .with_instruction(config.llm.instruction.clone()),
    )
}

/// Run the `chat` command against stdin/stdout.
pub async fn run_chat(config: &Config, collection: &str) -> Result<()> {
    let engine = engine_from_config(config, collection)?;
    let options = CompletionOptions::from_config(&config.llm);
    println!("{} GPT", collection);

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    chat_loop(&engine, &options, stdin, tokio::io::stdout()).await
}
