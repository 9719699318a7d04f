#![forbid(unsafe_code)]

//! Outbound chat-completion requests that produce a video link.

pub mod download;
pub mod image;

use std::sync::LazyLock;

use anyhow::Context as _;
use regex::Regex;
use reqwest::header::AUTHORIZATION;
use serde::Serialize;
use thiserror::Error;

use crate::task::model::EndpointConfig;

pub const DEFAULT_MODEL: &str = "sora-2";

static LINK_TARGET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((https://.*?)\)").expect("link pattern compiles"));

#[derive(Debug, Error)]
pub enum GenerationError {
    /// Endpoint answered with a non-2xx status.
    #[error("remote error {status}: {body}")]
    Remote { status: u16, body: String },

    /// Endpoint answered 2xx but no video URL could be found.
    #[error("could not parse video URL from response: {content}")]
    Parse { content: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageRef<'a> },
}

#[derive(Debug, Serialize)]
struct ImageRef<'a> {
    url: &'a str,
}

impl<'a> ChatRequest<'a> {
    fn new(model: &'a str, prompt: &'a str, image: Option<&'a str>) -> Self {
        let mut content = vec![ContentPart::Text { text: prompt }];
        if let Some(url) = image {
            content.push(ContentPart::ImageUrl {
                image_url: ImageRef { url },
            });
        }
        Self {
            model,
            messages: [ChatMessage {
                role: "user",
                content,
            }],
        }
    }
}

/// Cheap to clone; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct GenerationClient {
    http: reqwest::Client,
    model: String,
}

impl GenerationClient {
    pub fn new(model: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("soragen/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            model: model.into(),
        })
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Sends one request and returns the video URL found in the reply.
    pub async fn generate(
        &self,
        endpoint: &EndpointConfig,
        prompt: &str,
        image: Option<&str>,
    ) -> Result<String, GenerationError> {
        let body = ChatRequest::new(&self.model, prompt, image);
        tracing::debug!(
            url = %endpoint.api_url,
            model = %self.model,
            with_image = image.is_some(),
            "sending generation request"
        );

        let resp = self
            .http
            .post(&endpoint.api_url)
            .header(AUTHORIZATION, &endpoint.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await?;
            return Err(GenerationError::Remote {
                status: status.as_u16(),
                body,
            });
        }

        let raw = resp.text().await?;
        let content = message_content(&raw)?;
        extract_video_url(&content).ok_or(GenerationError::Parse { content })
    }
}

/// Text of the first choice's message; empty when the structure is absent.
fn message_content(raw: &str) -> Result<String, GenerationError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|_| GenerationError::Parse {
            content: raw.to_owned(),
        })?;
    Ok(value
        .pointer("/choices/0/message/content")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_owned())
}

/// First `(https://...)` link target, else the whole text if it is itself a URL.
#[must_use]
pub fn extract_video_url(content: &str) -> Option<String> {
    if let Some(caps) = LINK_TARGET.captures(content) {
        return Some(caps[1].to_owned());
    }
    if content.starts_with("http") {
        return Some(content.to_owned());
    }
    None
}
