//! HTTP clients for the integrations gateway
//!
//! Both services authenticate with `X-Gateway-Authorization: Bearer <key>`.
//! Non-success statuses are classified by [`CallError::from_status`].

use super::sse::{SseDecoder, SseItem};
use super::{CompletionRequest, CompletionService, OcrService};
use crate::resilience::CallError;
use crate::store::ChatRole;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

const GATEWAY_AUTH_HEADER: &str = "X-Gateway-Authorization";

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

impl<'a> GenerateRequest<'a> {
    fn from_request(request: &'a CompletionRequest) -> Self {
        let mut contents: Vec<Content<'a>> = request
            .history
            .iter()
            .map(|m| Content {
                role: match m.role {
                    ChatRole::User => "user",
                    ChatRole::Model => "model",
                },
                parts: vec![Part { text: &m.text }],
            })
            .collect();
        contents.push(Content {
            role: "user",
            parts: vec![Part { text: &request.prompt }],
        });
        Self { contents }
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, CallError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| CallError::Permanent(format!("failed to build HTTP client: {}", e)))
}

pub struct GatewayCompletionClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl GatewayCompletionClient {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Result<Self, CallError> {
        Ok(Self {
            client: build_client(Duration::from_secs(120))?,
            url: url.into(),
            api_key,
        })
    }

    async fn open(&self, request: &CompletionRequest) -> Result<reqwest::Response, CallError> {
        let mut builder = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&GenerateRequest::from_request(request));
        if let Some(key) = &self.api_key {
            builder = builder.header(GATEWAY_AUTH_HEADER, format!("Bearer {}", key));
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::from_status("Completion", status.as_u16(), &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionService for GatewayCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CallError> {
        let mut response = self.open(request).await?;
        let mut decoder = SseDecoder::new();
        let mut full = String::new();

        'body: while let Some(chunk) = response.chunk().await? {
            for item in decoder.feed(&chunk) {
                match item {
                    SseItem::Text(text) => full.push_str(&text),
                    SseItem::Done => break 'body,
                }
            }
        }
        if let Some(SseItem::Text(text)) = decoder.finish() {
            full.push_str(&text);
        }

        Ok(full)
    }

    async fn stream(&self, request: &CompletionRequest, chunks: mpsc::Sender<String>) -> Result<(), CallError> {
        if chunks.is_closed() {
            return Err(CallError::Cancelled);
        }

        let mut response = self.open(request).await?;
        let mut decoder = SseDecoder::new();

        while let Some(chunk) = response.chunk().await? {
            for item in decoder.feed(&chunk) {
                match item {
                    SseItem::Text(text) => chunks.send(text).await.map_err(|_| CallError::Cancelled)?,
                    SseItem::Done => return Ok(()),
                }
            }
        }
        if let Some(SseItem::Text(text)) = decoder.finish() {
            chunks.send(text).await.map_err(|_| CallError::Cancelled)?;
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(rename = "ParsedResults", default)]
    parsed_results: Option<Vec<ParsedResult>>,
}

#[derive(Debug, Deserialize)]
struct ParsedResult {
    #[serde(rename = "ParsedText", default)]
    parsed_text: Option<String>,
}

pub struct GatewayOcrClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl GatewayOcrClient {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Result<Self, CallError> {
        Ok(Self {
            client: build_client(Duration::from_secs(120))?,
            url: url.into(),
            api_key,
        })
    }
}

/// First parsed text block, `None` when missing or blank
fn first_parsed_text(body: &str) -> Result<Option<String>, CallError> {
    let parsed: OcrResponse = serde_json::from_str(body)
        .map_err(|e| CallError::Permanent(format!("OCR response not understood: {}", e)))?;
    Ok(parsed
        .parsed_results
        .and_then(|results| results.into_iter().next())
        .and_then(|r| r.parsed_text)
        .filter(|text| !text.trim().is_empty()))
}

#[async_trait]
impl OcrService for GatewayOcrClient {
    async fn extract_text(&self, document_url: &str) -> Result<Option<String>, CallError> {
        let mut builder = self
            .client
            .post(&self.url)
            .form(&[("url", document_url), ("language", "eng"), ("isTable", "true")]);
        if let Some(key) = &self.api_key {
            builder = builder.header(GATEWAY_AUTH_HEADER, format!("Bearer {}", key));
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CallError::from_status("OCR", status.as_u16(), &body));
        }

        first_parsed_text(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChatMessage;

    #[test]
    fn test_request_body_shape() {
        let request = CompletionRequest {
            prompt: "How much on dining?".to_string(),
            history: vec![
                ChatMessage {
                    role: ChatRole::User,
                    text: "hi".to_string(),
                },
                ChatMessage {
                    role: ChatRole::Model,
                    text: "hello".to_string(),
                },
            ],
        };

        let body = serde_json::to_value(GenerateRequest::from_request(&request)).unwrap();
        assert_eq!(body["contents"].as_array().unwrap().len(), 3);
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][2]["parts"][0]["text"], "How much on dining?");
    }

    #[test]
    fn test_ocr_text_extraction() {
        let body = r#"{"ParsedResults":[{"ParsedText":"TOTAL 250.00"}],"OCRExitCode":1}"#;
        assert_eq!(first_parsed_text(body).unwrap(), Some("TOTAL 250.00".to_string()));

        assert_eq!(first_parsed_text(r#"{"ParsedResults":[{"ParsedText":"  \n"}]}"#).unwrap(), None);
        assert_eq!(first_parsed_text(r#"{"ParsedResults":[]}"#).unwrap(), None);
        assert_eq!(first_parsed_text("{}").unwrap(), None);
        assert!(first_parsed_text("<html>").is_err());
    }
}
