//! Retrieval and answer generation.
//!
//! `answer` embeds the question, pulls the top-K chunks, builds the chat
//! request and hands generation to a spawned task. The task forwards model
//! fragments over a channel in arrival order and finishes with exactly one
//! terminal event. Citations are fixed before generation starts and only
//! cover the chunks retrieved for this question.

use crate::citations::collect_citations;
use crate::embeddings::Embedder;
use crate::error::{RetrievalError, StoreError};
use crate::llm::{ChatMessage, LanguageModel};
use crate::models::{ChatRole, ChatTurn, RetrievalOptions, RetrievedChunk};
use crate::traits::ChunkStore;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum AnswerEvent {
    Fragment(String),
    Completed,
    Failed(RetrievalError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<String>,
}

/// A generation in flight.
pub struct AnswerStream {
    citations: Vec<String>,
    sources: Vec<RetrievedChunk>,
    events: mpsc::Receiver<AnswerEvent>,
}

impl AnswerStream {
    pub fn citations(&self) -> &[String] {
        &self.citations
    }

    pub fn sources(&self) -> &[RetrievedChunk] {
        &self.sources
    }

    /// Next event; `None` only after the terminal event has been taken.
    pub async fn next_event(&mut self) -> Option<AnswerEvent> {
        self.events.recv().await
    }

    pub async fn collect(mut self) -> Result<Answer, RetrievalError> {
        let mut text = String::new();
        while let Some(event) = self.next_event().await {
            match event {
                AnswerEvent::Fragment(fragment) => text.push_str(&fragment),
                AnswerEvent::Completed => {
                    return Ok(Answer {
                        text,
                        citations: self.citations,
                    })
                }
                AnswerEvent::Failed(error) => return Err(error),
            }
        }
        Err(producer_vanished())
    }
}

pub(crate) fn producer_vanished() -> RetrievalError {
    RetrievalError::Generation(crate::error::GenerationError::MalformedStream(
        "generation ended without a completion signal".to_string(),
    ))
}

pub struct AnswerEngine {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn ChunkStore>,
    model: Arc<dyn LanguageModel>,
    options: RetrievalOptions,
}

impl AnswerEngine {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn ChunkStore>,
        model: Arc<dyn LanguageModel>,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            embedder,
            store,
            model,
            options,
        }
    }

    pub fn options(&self) -> &RetrievalOptions {
        &self.options
    }

    pub async fn retrieve(&self, question: &str) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        if question.trim().is_empty() {
            return Err(RetrievalError::EmptyQuestion);
        }

        let query_vector = self.embedder.embed(question).await?;
        if query_vector.len() != self.options.embedding_dimensions {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.options.embedding_dimensions,
                actual: query_vector.len(),
            });
        }

        if let Some(stored) = self.store.stored_dimensions().await? {
            if stored != query_vector.len() {
                return Err(RetrievalError::DimensionMismatch {
                    expected: stored,
                    actual: query_vector.len(),
                });
            }
        }

        let hits = self
            .store
            .search(&query_vector, self.options.top_k)
            .await
            .map_err(|error| match error {
                StoreError::DimensionMismatch { expected, actual } => {
                    RetrievalError::DimensionMismatch { expected, actual }
                }
                other => RetrievalError::Store(other),
            })?;

        let hits: Vec<RetrievedChunk> = match self.options.similarity_cutoff {
            Some(cutoff) => hits.into_iter().filter(|hit| hit.score >= cutoff).collect(),
            None => hits,
        };

        for hit in &hits {
            debug!(
                document_id = %hit.chunk.document_id,
                chunk_index = hit.chunk.chunk_index,
                score = hit.score,
                "retrieved chunk"
            );
        }
        Ok(hits)
    }

    pub fn build_messages(
        &self,
        question: &str,
        history: &[ChatTurn],
        hits: &[RetrievedChunk],
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::new(ChatRole::System, &self.options.system_prompt));

        messages.extend(
            history
                .iter()
                .filter(|turn| turn.role != ChatRole::System)
                .map(|turn| ChatMessage::new(turn.role, &turn.content)),
        );

        let context = assemble_context(hits, self.options.context_max_chars);
        let prompt = if context.is_empty() {
            question.to_string()
        } else {
            format!(
                "Context information is below.\n\
                 ---------------------\n\
                 {context}\n\
                 ---------------------\n\
                 Given the context information and not prior knowledge, answer the query.\n\
                 Query: {question}\n\
                 Answer: "
            )
        };
        messages.push(ChatMessage::new(ChatRole::User, prompt));
        messages
    }

    pub async fn answer(
        &self,
        question: &str,
        history: &[ChatTurn],
    ) -> Result<AnswerStream, RetrievalError> {
        let hits = self.retrieve(question).await?;
        let citations = collect_citations(&hits);
        let messages = self.build_messages(question, history, &hits);

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let model = Arc::clone(&self.model);
        let timeout = self.options.generation_timeout;

        tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, forward(model, messages, &sender)).await;
            let terminal = match outcome {
                Ok(Ok(())) => AnswerEvent::Completed,
                Ok(Err(error)) => AnswerEvent::Failed(error),
                Err(_) => {
                    warn!(seconds = timeout.as_secs(), "answer generation timed out");
                    AnswerEvent::Failed(RetrievalError::Timeout {
                        seconds: timeout.as_secs(),
                    })
                }
            };
            // A closed channel means the consumer gave up on this answer.
            let _ = sender.send(terminal).await;
        });

        Ok(AnswerStream {
            citations,
            sources: hits,
            events: receiver,
        })
    }
}

async fn forward(
    model: Arc<dyn LanguageModel>,
    messages: Vec<ChatMessage>,
    sender: &mpsc::Sender<AnswerEvent>,
) -> Result<(), RetrievalError> {
    let mut fragments = model.stream_chat(messages).await?;
    while let Some(fragment) = fragments.next().await {
        let fragment = fragment?;
        if sender.send(AnswerEvent::Fragment(fragment)).await.is_err() {
            return Ok(());
        }
    }
    Ok(())
}

/// Joins chunk texts in rank order, cutting the last one so the whole
/// context stays within `max_chars` characters.
pub fn assemble_context(hits: &[RetrievedChunk], max_chars: usize) -> String {
    const SEPARATOR: &str = "\n\n";
    let mut context = String::new();
    let mut used = 0usize;

    for hit in hits {
        let separator_len = if context.is_empty() { 0 } else { SEPARATOR.len() };
        if used + separator_len >= max_chars {
            break;
        }
        if separator_len > 0 {
            context.push_str(SEPARATOR);
            used += separator_len;
        }

        let remaining = max_chars - used;
        let piece: String = hit.chunk.text.chars().take(remaining).collect();
        used += piece.chars().count();
        context.push_str(&piece);
    }

    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::GenerationError;
    use crate::llm::FragmentStream;
    use crate::models::{Chunk, Metadata};
    use crate::stores::InMemoryStore;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::Mutex;
    use std::time::Duration;

    const DIMS: usize = 64;

    #[derive(Default)]
    struct ScriptedModel {
        fragments: Vec<String>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn stream_chat(
            &self,
            messages: Vec<ChatMessage>,
        ) -> Result<FragmentStream, GenerationError> {
            self.seen.lock().unwrap().push(messages);
            let items: Vec<Result<String, GenerationError>> =
                self.fragments.iter().cloned().map(Ok).collect();
            Ok(stream::iter(items).boxed())
        }
    }

    struct StalledModel;

    #[async_trait]
    impl LanguageModel for StalledModel {
        async fn stream_chat(
            &self,
            _messages: Vec<ChatMessage>,
        ) -> Result<FragmentStream, GenerationError> {
            Ok(stream::pending().boxed())
        }
    }

    fn hit(name: &str, text: &str) -> RetrievedChunk {
        let mut metadata = Metadata::new();
        metadata.insert("file_name".to_string(), name.to_string());
        RetrievedChunk {
            chunk: Chunk {
                chunk_id: format!("{name}-0"),
                document_id: name.to_string(),
                chunk_index: 0,
                text: text.to_string(),
                metadata,
                embedding: Vec::new(),
            },
            score: 1.0,
        }
    }

    fn engine(model: Arc<dyn LanguageModel>, store: Arc<InMemoryStore>) -> AnswerEngine {
        let options = RetrievalOptions {
            embedding_dimensions: DIMS,
            generation_timeout: Duration::from_secs(120),
            ..RetrievalOptions::default()
        };
        AnswerEngine::new(Arc::new(CharacterNgramEmbedder::new(DIMS)), store, model, options)
    }

    #[test]
    fn context_respects_character_budget() {
        let hits = vec![hit("a", "abcdef"), hit("b", "ghijkl")];
        assert_eq!(assemble_context(&hits, 100), "abcdef\n\nghijkl");
        assert_eq!(assemble_context(&hits, 10), "abcdef\n\ngh");
        assert_eq!(assemble_context(&hits, 4), "abcd");
        assert_eq!(assemble_context(&[], 10), "");
    }

    #[test]
    fn prompt_carries_system_history_and_context() {
        let model = Arc::new(ScriptedModel::default());
        let engine = engine(model, Arc::new(InMemoryStore::new(DIMS)));
        let history = vec![ChatTurn::user("hi"), ChatTurn::assistant("hello")];

        let messages = engine.build_messages(
            "What is the capital of Bulgaria?",
            &history,
            &[hit("notes.txt", "The capital of Bulgaria is Sofia.")],
        );

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, ChatRole::System);
        assert_eq!(messages[1].content, "hi");
        assert_eq!(messages[2].role, ChatRole::Assistant);
        assert!(messages[3].content.contains("The capital of Bulgaria is Sofia."));
        assert!(messages[3].content.contains("Query: What is the capital of Bulgaria?"));
    }

    #[test]
    fn prompt_without_hits_is_the_bare_question() {
        let engine = engine(Arc::new(ScriptedModel::default()), Arc::new(InMemoryStore::new(DIMS)));
        let messages = engine.build_messages("Anyone there?", &[], &[]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Anyone there?");
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let engine = engine(Arc::new(ScriptedModel::default()), Arc::new(InMemoryStore::new(DIMS)));
        assert!(matches!(
            engine.answer("   ", &[]).await,
            Err(RetrievalError::EmptyQuestion)
        ));
    }

    #[tokio::test]
    async fn fragments_arrive_in_order_before_completion() {
        let model = Arc::new(ScriptedModel {
            fragments: vec!["one ".to_string(), "two ".to_string(), "three".to_string()],
            ..ScriptedModel::default()
        });
        let engine = engine(model, Arc::new(InMemoryStore::new(DIMS)));

        let mut stream = engine.answer("count", &[]).await.unwrap();
        let mut seen = Vec::new();
        while let Some(event) = stream.next_event().await {
            match event {
                AnswerEvent::Fragment(text) => seen.push(text),
                AnswerEvent::Completed => break,
                AnswerEvent::Failed(error) => panic!("unexpected failure: {error}"),
            }
        }
        assert_eq!(seen, vec!["one ", "two ", "three"]);
        assert!(stream.citations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_generation_times_out() {
        let store = Arc::new(InMemoryStore::new(DIMS));
        let options = RetrievalOptions {
            embedding_dimensions: DIMS,
            generation_timeout: Duration::from_secs(120),
            ..RetrievalOptions::default()
        };
        let engine = AnswerEngine::new(
            Arc::new(CharacterNgramEmbedder::new(DIMS)),
            store,
            Arc::new(StalledModel),
            options,
        );

        let result = engine.answer("hello?", &[]).await.unwrap().collect().await;
        assert!(matches!(result, Err(RetrievalError::Timeout { seconds: 120 })));
    }

    async fn store_with(texts: &[(&str, &str)]) -> Arc<InMemoryStore> {
        let embedder = CharacterNgramEmbedder::new(DIMS);
        let store = Arc::new(InMemoryStore::new(DIMS));
        for (name, text) in texts {
            let mut stored = hit(name, text).chunk;
            stored.embedding = embedder.embed_sync(text);
            store.replace_document(name, &[stored]).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn hits_below_the_cutoff_are_dropped_with_their_citations() {
        let texts = [
            ("rivers.txt", "Rivers carry sediment downstream to the delta."),
            ("compilers.txt", "Compilers translate source code into machine instructions."),
        ];
        let question = "Compilers translate source code into machine instructions.";

        let open = engine(Arc::new(ScriptedModel::default()), store_with(&texts).await);
        let stream = open.answer(question, &[]).await.unwrap();
        assert_eq!(stream.citations().len(), 2);

        let options = RetrievalOptions {
            embedding_dimensions: DIMS,
            similarity_cutoff: Some(0.99),
            ..RetrievalOptions::default()
        };
        let strict = AnswerEngine::new(
            Arc::new(CharacterNgramEmbedder::new(DIMS)),
            store_with(&texts).await,
            Arc::new(ScriptedModel::default()),
            options,
        );
        let stream = strict.answer(question, &[]).await.unwrap();
        assert_eq!(stream.citations().to_vec(), vec!["compilers.txt"]);
        assert!(stream.sources().iter().all(|source| source.score >= 0.99));
    }
}
