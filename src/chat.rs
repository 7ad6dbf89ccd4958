//! Retrieval-grounded question answering.
//!
//! One retrieval, one dispatcher call, no retry. The answer comes back with
//! the documents it was grounded on.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::Config;
use crate::context::ContextStore;
use crate::dispatch::TextGenerator;
use crate::models::{Document, GenerationRequest, GenerationResult};
use crate::modules::MAX_COUNT;

const SYSTEM_PROMPT: &str = "You are an assistant for African healthcare, biotech and \
investment data. Use the provided context when it is relevant and say so when it is not.";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatAnswer {
    pub answer: String,
    pub sources: Vec<Document>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ChatError {
    #[error("query must not be empty")]
    EmptyQuery,

    #[error("AI service unavailable")]
    Unavailable { reason: String },
}

pub struct ChatService {
    generator: Arc<dyn TextGenerator>,
    context: Option<Arc<dyn ContextStore>>,
    temperature: f64,
    max_tokens: u32,
    default_top_k: usize,
    timeout: Duration,
}

impl ChatService {
    pub fn new(
        config: &Config,
        generator: Arc<dyn TextGenerator>,
        context: Option<Arc<dyn ContextStore>>,
    ) -> Self {
        Self {
            generator,
            context,
            temperature: config.generation.chat_temperature,
            max_tokens: config.generation.chat_max_tokens,
            default_top_k: config.retrieval.top_k,
            timeout: Duration::from_secs(config.server.request_timeout_secs),
        }
    }

    pub async fn answer(
        &self,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<ChatAnswer, ChatError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ChatError::EmptyQuery);
        }
        let deadline = Instant::now() + self.timeout;

        let sources = match self.context {
            Some(ref store) => {
                let k = top_k.unwrap_or(self.default_top_k).clamp(1, MAX_COUNT);
                store.query(query, k).await.unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "context query failed; answering without context");
                    Vec::new()
                })
            }
            None => Vec::new(),
        };

        let request = GenerationRequest {
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            user_prompt: user_message(query, &sources),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        match self.generator.generate(&request, Some(deadline)).await {
            GenerationResult::Success { text } => Ok(ChatAnswer {
                answer: text,
                sources,
            }),
            GenerationResult::Unavailable { reason } => Err(ChatError::Unavailable { reason }),
            GenerationResult::Malformed { .. } => Err(ChatError::Unavailable {
                reason: "malformed backend response".to_string(),
            }),
        }
    }
}

fn user_message(query: &str, sources: &[Document]) -> String {
    if sources.is_empty() {
        return format!("QUESTION: {}", query);
    }
    let context: Vec<String> = sources.iter().map(|d| format!("- {}", d.text)).collect();
    format!("CONTEXT:\n{}\n\nQUESTION: {}", context.join("\n"), query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InMemoryContextStore;
    use crate::dispatch::ScriptedGenerator;
    use crate::models::NewDocument;

    async fn store_with(text: &str) -> Arc<InMemoryContextStore> {
        let store = Arc::new(InMemoryContextStore::new());
        store
            .upsert(&[NewDocument {
                id: Some("doc-1".into()),
                text: text.into(),
                metadata: Default::default(),
            }])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_answer_carries_sources() {
        let store = store_with("mPharma operates pharmacies in Ghana and Kenya").await;
        let generator = Arc::new(ScriptedGenerator::replying("mPharma runs pharmacies."));
        let chat = ChatService::new(&Config::default(), generator.clone(), Some(store));

        let answer = chat.answer("Where does mPharma operate?", None).await.unwrap();
        assert_eq!(answer.answer, "mPharma runs pharmacies.");
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.sources[0].id, "doc-1");

        let request = &generator.requests()[0];
        assert!(request.user_prompt.starts_with("CONTEXT:\n- mPharma"));
        assert!(request.user_prompt.ends_with("QUESTION: Where does mPharma operate?"));
        assert_eq!(request.temperature, 0.7);
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let generator = Arc::new(ScriptedGenerator::new(vec![]));
        let chat = ChatService::new(&Config::default(), generator, None);
        let err = chat.answer("anything", Some(3)).await.unwrap_err();
        assert!(matches!(err, ChatError::Unavailable { .. }));
        assert_eq!(err.to_string(), "AI service unavailable");
    }

    #[tokio::test]
    async fn test_oversized_top_k_is_clamped() {
        struct RecordingStore(std::sync::Mutex<Vec<usize>>);

        #[async_trait::async_trait]
        impl ContextStore for RecordingStore {
            async fn query(&self, _text: &str, k: usize) -> anyhow::Result<Vec<Document>> {
                self.0.lock().unwrap().push(k);
                Ok(Vec::new())
            }
            async fn upsert(
                &self,
                _docs: &[NewDocument],
            ) -> anyhow::Result<crate::models::UpsertSummary> {
                unreachable!()
            }
        }

        let store = Arc::new(RecordingStore(Default::default()));
        let ok = || GenerationResult::Success {
            text: "ok".to_string(),
        };
        let generator = Arc::new(ScriptedGenerator::new(vec![ok(), ok()]));
        let chat = ChatService::new(&Config::default(), generator, Some(store.clone()));

        chat.answer("anything", Some(usize::MAX)).await.unwrap();
        chat.answer("anything", Some(0)).await.unwrap();
        assert_eq!(*store.0.lock().unwrap(), vec![MAX_COUNT, 1]);
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let generator = Arc::new(ScriptedGenerator::replying("x"));
        let chat = ChatService::new(&Config::default(), generator.clone(), None);
        assert_eq!(chat.answer("   ", None).await.unwrap_err(), ChatError::EmptyQuery);
        assert!(generator.requests().is_empty());
    }
}
