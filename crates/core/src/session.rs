use crate::citations::{format_citations, DEFAULT_CITATION_HEADING};
use crate::engine::{producer_vanished, AnswerEngine, AnswerEvent};
use crate::error::{RetrievalError, SessionError};
use crate::models::ChatTurn;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingAnswer,
}

/// One conversation. History is append-only and every assistant turn is
/// stored exactly as it was shown, citation block included.
#[derive(Debug)]
pub struct ChatSession {
    id: Uuid,
    history: Vec<ChatTurn>,
    state: SessionState,
    greeting_turns: usize,
    citation_heading: String,
}

impl ChatSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            history: Vec::new(),
            state: SessionState::Idle,
            greeting_turns: 0,
            citation_heading: DEFAULT_CITATION_HEADING.to_string(),
        }
    }

    /// Starts the conversation with an assistant greeting. The greeting is
    /// shown and kept in history but never sent to the model.
    pub fn with_greeting(greeting: impl Into<String>) -> Self {
        let mut session = Self::new();
        session.history.push(ChatTurn::assistant(greeting));
        session.greeting_turns = 1;
        session
    }

    pub fn with_citation_heading(mut self, heading: impl Into<String>) -> Self {
        self.citation_heading = heading.into();
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Asks one question. `on_fragment` sees answer text as it is produced;
    /// the citation block, if any, is passed to it once generation completes.
    /// On failure no assistant turn is recorded.
    pub async fn ask<F>(
        &mut self,
        engine: &AnswerEngine,
        question: &str,
        mut on_fragment: F,
    ) -> Result<&ChatTurn, SessionError>
    where
        F: FnMut(&str),
    {
        if self.state != SessionState::Idle {
            return Err(SessionError::Busy);
        }
        self.state = SessionState::AwaitingAnswer;

        let result = self.run_turn(engine, question, &mut on_fragment).await;
        self.state = SessionState::Idle;

        match result {
            Ok(content) => {
                self.history.push(ChatTurn::assistant(content));
                info!(session_id = %self.id, turns = self.history.len(), "answer recorded");
                Ok(&self.history[self.history.len() - 1])
            }
            Err(failure) => {
                error!(session_id = %self.id, error = %failure, "answer failed");
                Err(SessionError::Retrieval(failure))
            }
        }
    }

    async fn run_turn(
        &mut self,
        engine: &AnswerEngine,
        question: &str,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<String, RetrievalError> {
        let prior = self.history[self.greeting_turns..].to_vec();
        if question.trim().is_empty() {
            return Err(RetrievalError::EmptyQuestion);
        }
        self.history.push(ChatTurn::user(question));

        let mut stream = engine.answer(question, &prior).await?;
        let mut answer = String::new();

        loop {
            match stream.next_event().await {
                Some(AnswerEvent::Fragment(fragment)) => {
                    on_fragment(&fragment);
                    answer.push_str(&fragment);
                }
                Some(AnswerEvent::Completed) => break,
                Some(AnswerEvent::Failed(failure)) => return Err(failure),
                None => return Err(producer_vanished()),
            }
        }

        if let Some(block) = format_citations(stream.citations(), &self.citation_heading) {
            on_fragment(&block);
            answer.push_str(&block);
        }
        Ok(answer)
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}
