//! Gemini streaming chat provider with function calling.
//!
//! Talks to `streamGenerateContent` with `alt=sse` and parses the event
//! stream incrementally. Tool calls are executed between model invocations:
//! each round appends the model's `functionCall` content and our
//! `functionResponse` content to the conversation, then re-invokes the
//! model. The final permitted step never declares tools, which forces a
//! text answer and guarantees termination.

use std::sync::Arc;

use async_stream::try_stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::sse::{SseEvent, SseLineBuffer};
use super::{
    ChatMessage, GenerationRequest, GenerationStream, LanguageModel, MessageRole, StreamChunk,
    ToolRunner, ToolSpec,
};
use crate::errors::AppError;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Serialize)]
struct GenerateBody {
    contents: Vec<Content>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDeclarations>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponse,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ToolDeclarations {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StreamingResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

/// Gemini chat client.
#[derive(Clone)]
pub struct GeminiChat {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl std::fmt::Debug for GeminiChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiChat")
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl GeminiChat {
    #[must_use]
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: GEMINI_API_BASE.to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Point the client at a different API base (tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn initial_contents(messages: &[ChatMessage]) -> Vec<Content> {
        messages
            .iter()
            .map(|message| Content {
                role: Some(
                    match message.role {
                        MessageRole::Assistant => "model",
                        // Gemini has no system role in contents; the system
                        // instruction travels in its own field.
                        MessageRole::User | MessageRole::System => "user",
                    }
                    .to_string(),
                ),
                parts: vec![Part::Text {
                    text: message.content.clone(),
                }],
            })
            .collect()
    }

    fn declarations(specs: &[ToolSpec]) -> Option<Vec<ToolDeclarations>> {
        if specs.is_empty() {
            return None;
        }
        Some(vec![ToolDeclarations {
            function_declarations: specs
                .iter()
                .map(|spec| FunctionDeclaration {
                    name: spec.name.clone(),
                    description: spec.description.clone(),
                    parameters: spec.parameters.clone(),
                })
                .collect(),
        }])
    }

    async fn step_request(
        &self,
        contents: &[Content],
        system: &str,
        specs: &[ToolSpec],
    ) -> Result<reqwest::Response, AppError> {
        let body = GenerateBody {
            contents: contents.to_vec(),
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part::Text {
                    text: system.to_string(),
                }],
            }),
            tools: Self::declarations(specs),
        };

        let url = format!(
            "{}/models/{}:streamGenerateContent",
            self.base_url, self.model
        );
        let response = self
            .client
            .post(&url)
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::provider(format!(
                "generation API returned {status}: {detail}"
            )));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl LanguageModel for GeminiChat {
    #[instrument(skip_all, fields(model = %self.model, history = request.messages.len()))]
    async fn stream_generate(
        &self,
        request: GenerationRequest,
        tools: Arc<dyn ToolRunner>,
        max_steps: usize,
    ) -> Result<GenerationStream, AppError> {
        let provider = self.clone();
        let total_steps = max_steps.max(1);

        let stream = try_stream! {
            let mut contents = GeminiChat::initial_contents(&request.messages);

            for step in 0..total_steps {
                let final_step = step + 1 == total_steps;
                // The governor-backed runner decides what is still allowed;
                // the last step never declares tools so text must follow.
                let specs = if final_step { Vec::new() } else { tools.available() };

                let response = provider
                    .step_request(&contents, &request.system, &specs)
                    .await?;

                let mut byte_stream = response.bytes_stream();
                let mut buffer = SseLineBuffer::new();
                let mut calls: Vec<FunctionCall> = Vec::new();
                let mut finish_reason = None;

                while let Some(chunk) = byte_stream.next().await {
                    let bytes = chunk
                        .map_err(|err| AppError::provider(format!("stream read failed: {err}")))?;

                    for event in buffer.feed(&bytes) {
                        let SseEvent::Data(payload) = event else {
                            continue;
                        };
                        let parsed: StreamingResponse = match serde_json::from_str(&payload) {
                            Ok(parsed) => parsed,
                            Err(err) => {
                                warn!(error = %err, "skipping malformed stream chunk");
                                continue;
                            }
                        };
                        let Some(candidate) = parsed
                            .candidates
                            .and_then(|mut candidates| {
                                if candidates.is_empty() {
                                    None
                                } else {
                                    Some(candidates.remove(0))
                                }
                            })
                        else {
                            continue;
                        };

                        if let Some(reason) = candidate.finish_reason {
                            finish_reason = Some(reason);
                        }
                        let Some(content) = candidate.content else {
                            continue;
                        };
                        for part in content.parts {
                            match part {
                                Part::Text { text } => {
                                    if !text.is_empty() {
                                        yield StreamChunk::TextDelta(text);
                                    }
                                }
                                Part::FunctionCall { function_call } => calls.push(function_call),
                                Part::FunctionResponse { .. } => {}
                            }
                        }
                    }
                }

                if calls.is_empty() || final_step {
                    yield StreamChunk::Finished { reason: finish_reason };
                    break;
                }

                // Tool round: echo the calls as model content, execute them,
                // attach the responses, and go around again.
                contents.push(Content {
                    role: Some("model".to_string()),
                    parts: calls
                        .iter()
                        .cloned()
                        .map(|function_call| Part::FunctionCall { function_call })
                        .collect(),
                });

                let mut response_parts = Vec::with_capacity(calls.len());
                for call in calls {
                    debug!(tool = %call.name, "executing model-requested tool");
                    let result = match tools.run(&call.name, call.args.clone()).await {
                        Ok(result) => result,
                        Err(err) => {
                            warn!(tool = %call.name, error = %err, "tool execution failed");
                            json!({
                                "success": false,
                                "message": "Error searching for context information.",
                                "results": [],
                            })
                        }
                    };
                    response_parts.push(Part::FunctionResponse {
                        function_response: FunctionResponse {
                            name: call.name,
                            response: result,
                        },
                    });
                }
                contents.push(Content {
                    role: Some("user".to_string()),
                    parts: response_parts,
                });
            }
        };

        Ok(Box::pin(stream))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
