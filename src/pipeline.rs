//! Chat orchestration: session resolution, retrieval, generation,
//! persistence.
//!
//! A turn persists the visitor's message before anything else; if that
//! write fails the turn fails. Everything after that point degrades
//! instead of failing: generation errors and empty responses fall back
//! to a canned message that is still persisted, so the transcript never
//! ends on a visitor message.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use tracing::{info, instrument, warn};

use crate::errors::AppError;
use crate::governor::ToolUsageGovernor;
use crate::llm::{ChatMessage, GenerationRequest, LanguageModel, StreamChunk};
use crate::prompt::{context_block, system_prompt, FALLBACK_MESSAGE};
use crate::retrieval::{ContextToolRunner, Retriever};
use crate::store::sessions::{
    GenerationMetadata, MessageRole, NewMessage, SessionMetadata, SessionStore,
};

/// One visitor request.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub query: String,
    pub session_id: Option<String>,
    pub client_id: String,
    pub metadata: SessionMetadata,
    /// Client-supplied prior turns. Used to seed the prompt when the turn
    /// starts a fresh session (the client kept history the server never
    /// saw); ignored for known sessions and never persisted.
    pub seed_history: Vec<ChatMessage>,
}

/// What flows back to the client. The stream itself is infallible;
/// failures surface as `Error` events followed by `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Delta(String),
    Done { session_id: String },
    Error(String),
}

pub type ChatStream = Pin<Box<dyn Stream<Item = ChatEvent> + Send>>;

#[derive(Clone)]
pub struct ChatPipeline {
    sessions: SessionStore,
    retriever: Retriever,
    governor: Arc<ToolUsageGovernor>,
    model: Arc<dyn LanguageModel>,
    owner: String,
    history_window: i64,
    max_tool_steps: usize,
}

impl ChatPipeline {
    #[must_use]
    pub fn new(
        sessions: SessionStore,
        retriever: Retriever,
        governor: Arc<ToolUsageGovernor>,
        model: Arc<dyn LanguageModel>,
        owner: impl Into<String>,
        history_window: i64,
        max_tool_steps: usize,
    ) -> Self {
        Self {
            sessions,
            retriever,
            governor,
            model,
            owner: owner.into(),
            history_window,
            max_tool_steps,
        }
    }

    /// Run one chat turn. Returns the (possibly fresh) session id and
    /// the event stream for the response.
    #[instrument(skip(self, turn), fields(client_id = %turn.client_id))]
    pub async fn respond(&self, turn: ChatTurn) -> Result<(String, ChatStream), AppError> {
        let query = turn.query.trim().to_string();
        if query.is_empty() {
            return Err(AppError::validation("query must not be empty"));
        }

        let (session_id, fresh_session) = match turn.session_id {
            Some(id) if self.sessions.session_exists(&id).await? => (id, false),
            Some(id) => {
                warn!(session_id = %id, "unknown session id, starting a fresh session");
                let created = self
                    .sessions
                    .create_session(&turn.client_id, &turn.metadata)
                    .await?;
                (created, true)
            }
            None => {
                let created = self
                    .sessions
                    .create_session(&turn.client_id, &turn.metadata)
                    .await?;
                (created, true)
            }
        };

        // The visitor's message must land before generation starts.
        self.sessions
            .add_message(
                &session_id,
                &NewMessage {
                    role: MessageRole::User,
                    content: query.clone(),
                    metadata: GenerationMetadata::default(),
                },
            )
            .await?;

        let context = self.retriever.retrieve(&query, None).await?;
        let system = format!("{}{}", system_prompt(&self.owner), context_block(&context));

        let history = self
            .sessions
            .recent_messages(&session_id, self.history_window)
            .await?;
        let mut messages: Vec<ChatMessage> = Vec::new();
        if fresh_session && !turn.seed_history.is_empty() {
            let window = self.history_window.max(0) as usize;
            let skip = turn.seed_history.len().saturating_sub(window);
            messages.extend(turn.seed_history.into_iter().skip(skip));
        }
        messages.extend(history.into_iter().map(|message| match message.role {
            MessageRole::User => ChatMessage::user(message.content),
            MessageRole::Assistant => ChatMessage::assistant(message.content),
        }));

        let runner = Arc::new(ContextToolRunner::new(
            self.retriever.clone(),
            self.governor.clone(),
            session_id.clone(),
        ));

        let model = self.model.clone();
        let sessions = self.sessions.clone();
        let max_tool_steps = self.max_tool_steps;
        let stream_session_id = session_id.clone();

        let events = stream! {
            let started = Instant::now();
            let mut answer = String::new();
            let mut failed = false;

            match model
                .stream_generate(GenerationRequest { system, messages }, runner, max_tool_steps)
                .await
            {
                Ok(mut chunks) => {
                    while let Some(chunk) = chunks.next().await {
                        match chunk {
                            Ok(StreamChunk::TextDelta(delta)) => {
                                answer.push_str(&delta);
                                yield ChatEvent::Delta(delta);
                            }
                            Ok(StreamChunk::Finished { .. }) => break,
                            Err(err) => {
                                warn!(error = %err, "generation stream failed mid-turn");
                                failed = true;
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "generation could not start");
                    failed = true;
                }
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;

            if failed || answer.trim().is_empty() {
                let persisted = sessions
                    .add_message(
                        &stream_session_id,
                        &NewMessage {
                            role: MessageRole::Assistant,
                            content: FALLBACK_MESSAGE.to_string(),
                            metadata: GenerationMetadata {
                                processing_time_ms: Some(elapsed_ms),
                                ..GenerationMetadata::default()
                            },
                        },
                    )
                    .await;
                if let Err(err) = persisted {
                    warn!(error = %err, "failed to persist fallback message");
                }
                yield ChatEvent::Error(FALLBACK_MESSAGE.to_string());
            } else {
                let persisted = sessions
                    .add_message(
                        &stream_session_id,
                        &NewMessage {
                            role: MessageRole::Assistant,
                            content: answer.clone(),
                            metadata: GenerationMetadata {
                                model: Some(model.model_name().to_string()),
                                processing_time_ms: Some(elapsed_ms),
                                tokens: None,
                            },
                        },
                    )
                    .await;
                match persisted {
                    Ok(_) => info!(
                        session_id = %stream_session_id,
                        chars = answer.len(),
                        elapsed_ms,
                        "chat turn complete"
                    ),
                    Err(err) => {
                        warn!(error = %err, "failed to persist assistant message");
                        yield ChatEvent::Error("Response could not be saved.".to_string());
                    }
                }
            }

            yield ChatEvent::Done { session_id: stream_session_id.clone() };
        };

        Ok((session_id, Box::pin(events)))
    }
}
