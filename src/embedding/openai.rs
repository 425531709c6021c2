use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::EmbeddingGenerator;
use crate::context::RequestContext;
use crate::utils::http::send_checked_json;
use crate::{CalciferError, Result};

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";

// Ada v2 and Small v3 vs Large v3.
const DIMENSION_STANDARD: usize = 1536;
const DIMENSION_LARGE: usize = 3072;

#[derive(Clone)]
pub struct OpenAiEmbeddings {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbeddings {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(CalciferError::InvalidArgument(
                "OpenAI API key is required".to_string(),
            ));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            base_url: crate::providers::openai::DEFAULT_BASE_URL.to_string(),
            api_key,
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }

    fn embeddings_url(&self) -> String {
        format!("{}/embeddings", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Serialize)]
struct EmbeddingsBody<'a> {
    input: [&'a str; 1],
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f64>,
}

#[async_trait]
impl EmbeddingGenerator for OpenAiEmbeddings {
    fn name(&self) -> &str {
        "openai"
    }

    fn dimension(&self) -> usize {
        match self.model.as_str() {
            "text-embedding-ada-002" | "text-embedding-3-small" => DIMENSION_STANDARD,
            "text-embedding-3-large" => DIMENSION_LARGE,
            _ => DIMENSION_STANDARD,
        }
    }

    async fn generate(&self, cx: &RequestContext, text: &str) -> Result<Vec<f64>> {
        if text.is_empty() {
            return Err(CalciferError::InvalidArgument(
                "text cannot be empty".to_string(),
            ));
        }

        let body = EmbeddingsBody {
            input: [text],
            model: &self.model,
        };
        let req = self
            .http
            .post(self.embeddings_url())
            .bearer_auth(&self.api_key)
            .json(&body);
        let parsed: EmbeddingsResponse = cx.run(send_checked_json(req)).await?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|entry| entry.embedding)
            .ok_or_else(|| CalciferError::InvalidResponse("no embeddings returned".to_string()))
    }
}
