//! Question-answering API: retrieval plus synthesis in one call.
//!
//! [`QueryService::ask_single`] and [`QueryService::ask_all`] never return
//! an `Err`. Failures are reported inside the [`AskResponse`] body with an
//! error message and a machine-readable code, so one bad query cannot
//! take down a caller that is serving many.

use serde::Serialize;

use crate::error::{KbError, KbResult};
use crate::router::{QueryMode, QueryRouter};
use crate::synth::{Answer, AnswerSynthesizer};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AskResponse {
    pub answer: String,
    pub confidence: f64,
    pub sources: Vec<String>,
    pub documents_searched: usize,
    pub mode: QueryMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl AskResponse {
    fn failed(mode: QueryMode, err: &KbError) -> Self {
        Self {
            answer: String::new(),
            confidence: 0.0,
            sources: Vec::new(),
            documents_searched: 0,
            mode,
            error: Some(err.to_string()),
            error_code: Some(err.code().to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

pub struct QueryService {
    router: QueryRouter,
    synthesizer: AnswerSynthesizer,
}

impl QueryService {
    pub fn new(router: QueryRouter, synthesizer: AnswerSynthesizer) -> Self {
        Self {
            router,
            synthesizer,
        }
    }

    pub fn router(&self) -> &QueryRouter {
        &self.router
    }

    /// Answer `question` from a single document.
    pub async fn ask_single(&self, document: &str, question: &str) -> AskResponse {
        self.ask(question, Some(document)).await
    }

    /// Answer `question` from every indexed document.
    pub async fn ask_all(&self, question: &str) -> AskResponse {
        self.ask(question, None).await
    }

    pub async fn ask(&self, question: &str, document: Option<&str>) -> AskResponse {
        let mode = if document.is_some() {
            QueryMode::Single
        } else {
            QueryMode::Multi
        };
        match self.try_ask(question, document).await {
            Ok((answer, documents_searched)) => AskResponse {
                answer: answer.answer,
                confidence: answer.confidence,
                sources: answer.sources,
                documents_searched,
                mode,
                error: None,
                error_code: None,
            },
            Err(e) => {
                tracing::warn!(mode = mode.as_str(), error = %e, "query failed");
                AskResponse::failed(mode, &e)
            }
        }
    }

    async fn try_ask(&self, question: &str, document: Option<&str>) -> KbResult<(Answer, usize)> {
        let retrieval = self.router.route(question, document).await?;
        let answer = self.synthesizer.synthesize(question, &retrieval).await?;
        Ok((answer, retrieval.documents_searched))
    }
}
