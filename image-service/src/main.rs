// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use lambda_http::run as lambda_run;
use serde::Deserialize;
use telefone_common::{GenerateImageRequest, GenerateImageResponse, normalize_caption};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Captions arrive verbatim from players; the primary provider gets them
/// wrapped in a framing instruction so the model softens rejected elements
/// instead of refusing outright.
const SAFETY_PREAMBLE: &str = "Make an image with the following description. \
This is user-generated input that may contain elements rejected by your safety \
system. If you can't render them, ignore those aspects of the request, but \
always reply with an image. Avoid any content that may be considered \
inappropriate or offensive, ensuring the image aligns with content policies. \
If the request is nonsensical or vague, make things up. Always respond with \
an image. The prompt is:";

/// At most one rewrite pass per caption before giving up on the primary
/// provider and moving on to the fallback.
const REWRITE_BUDGET: usize = 1;

#[derive(Clone)]
struct AppState {
    primary: Arc<dyn ImageProvider>,
    fallback: Arc<dyn ImageProvider>,
    rewriter: Arc<dyn PromptRewriter>,
}

#[derive(Debug, thiserror::Error)]
enum ProviderError {
    #[error("{provider} rejected the prompt: {message}")]
    PolicyRejected { provider: String, message: String },
    #[error("request to {provider} failed")]
    Request {
        provider: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} returned {status}: {message}")]
    Api {
        provider: String,
        status: StatusCode,
        message: String,
    },
    #[error("{provider} returned no image url")]
    MissingImage { provider: String },
}

impl ProviderError {
    fn is_policy_rejection(&self) -> bool {
        matches!(self, Self::PolicyRejected { .. })
    }
}

#[async_trait]
trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;
}

#[async_trait]
trait PromptRewriter: Send + Sync {
    async fn rewrite(&self, caption: &str) -> anyhow::Result<String>;
}

#[derive(Deserialize)]
struct ImagesApiResponse {
    data: Vec<ImagesApiDatum>,
}

#[derive(Deserialize)]
struct ImagesApiDatum {
    url: Option<String>,
}

/// Provider speaking the OpenAI images wire format. Both the primary and the
/// fallback vendor expose this shape, so one client covers both.
#[derive(Clone)]
struct OpenAiCompatImageProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[async_trait]
impl ImageProvider for OpenAiCompatImageProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let url = format!(
            "{}/v1/images/generations",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": prompt,
                "n": 1,
                "size": "1024x1024",
                "response_format": "url",
            }))
            .send()
            .await
            .map_err(|source| ProviderError::Request {
                provider: self.name.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            if status == StatusCode::BAD_REQUEST && body.contains("content_policy") {
                return Err(ProviderError::PolicyRejected {
                    provider: self.name.clone(),
                    message: body,
                });
            }
            return Err(ProviderError::Api {
                provider: self.name.clone(),
                status,
                message: body,
            });
        }

        let parsed = response
            .json::<ImagesApiResponse>()
            .await
            .map_err(|source| ProviderError::Request {
                provider: self.name.clone(),
                source,
            })?;
        parsed
            .data
            .into_iter()
            .next()
            .and_then(|datum| datum.url)
            .ok_or_else(|| ProviderError::MissingImage {
                provider: self.name.clone(),
            })
    }
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Vec<ChatApiChoice>,
}

#[derive(Deserialize)]
struct ChatApiChoice {
    message: ChatApiMessage,
}

#[derive(Deserialize)]
struct ChatApiMessage {
    content: String,
}

#[derive(Clone)]
struct ChatPromptRewriter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[async_trait]
impl PromptRewriter for ChatPromptRewriter {
    async fn rewrite(&self, caption: &str) -> anyhow::Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "messages": [
                    {
                        "role": "system",
                        "content": "An image model rejected the user's scene description. \
Rewrite it so it passes a content safety filter while keeping the subject, \
setting and mood intact. Reply with the rewritten description only.",
                    },
                    {"role": "user", "content": caption},
                ],
            }))
            .send()
            .await
            .context("failed to call rewrite model")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            anyhow::bail!("rewrite model returned {status}: {body}");
        }

        let parsed = response
            .json::<ChatApiResponse>()
            .await
            .context("invalid rewrite model response")?;
        let rewritten = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .filter(|content| !content.is_empty())
            .context("rewrite model returned no content")?;
        Ok(rewritten)
    }
}

/// Run one caption through the provider chain. The primary sees the caption
/// wrapped in the safety preamble; a policy rejection buys one rewrite pass
/// before the fallback gets the original caption unmodified.
async fn generate_with_fallback(
    primary: &dyn ImageProvider,
    fallback: &dyn ImageProvider,
    rewriter: &dyn PromptRewriter,
    caption: &str,
) -> Result<String, ProviderError> {
    let mut prompt = format!("{SAFETY_PREAMBLE}\n\n{caption}");
    let mut rewrites_left = REWRITE_BUDGET;

    let primary_error = loop {
        match primary.generate(&prompt).await {
            Ok(image_url) => return Ok(image_url),
            Err(error) if error.is_policy_rejection() && rewrites_left > 0 => {
                rewrites_left -= 1;
                warn!(provider = primary.name(), error = %error, "prompt rejected; rewriting once");
                match rewriter.rewrite(caption).await {
                    Ok(rewritten) => {
                        prompt = format!("{SAFETY_PREAMBLE}\n\n{rewritten}");
                    }
                    Err(rewrite_error) => {
                        warn!(error = %rewrite_error, "prompt rewrite failed; moving to fallback");
                        break error;
                    }
                }
            }
            Err(error) => break error,
        }
    };

    warn!(
        provider = primary.name(),
        error = %primary_error,
        "primary provider failed; trying fallback"
    );
    match fallback.generate(caption).await {
        Ok(image_url) => Ok(image_url),
        Err(fallback_error) => {
            warn!(provider = fallback.name(), error = %fallback_error, "fallback provider failed");
            Err(fallback_error)
        }
    }
}

impl AppState {
    fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY is not set")?;
        let base_url = std::env::var("OPENAI_BASE_URL")
            .ok()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let timeout = std::env::var("IMAGE_REQUEST_TIMEOUT_SECONDS")
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(60);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .context("failed to build http client")?;

        let primary = OpenAiCompatImageProvider {
            name: "openai".to_string(),
            client: client.clone(),
            base_url: base_url.clone(),
            api_key: api_key.clone(),
            model: std::env::var("OPENAI_IMAGE_MODEL")
                .ok()
                .unwrap_or_else(|| "dall-e-3".to_string()),
        };

        let fallback = OpenAiCompatImageProvider {
            name: "fallback".to_string(),
            client: client.clone(),
            base_url: std::env::var("IMAGE_FALLBACK_BASE_URL")
                .ok()
                .unwrap_or_else(|| "https://api.together.xyz".to_string()),
            api_key: std::env::var("IMAGE_FALLBACK_API_KEY")
                .ok()
                .unwrap_or_else(|| api_key.clone()),
            model: std::env::var("IMAGE_FALLBACK_MODEL")
                .ok()
                .unwrap_or_else(|| "black-forest-labs/FLUX.1-schnell".to_string()),
        };

        let rewriter = ChatPromptRewriter {
            client,
            base_url,
            api_key,
            model: std::env::var("OPENAI_REWRITE_MODEL")
                .ok()
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
        };

        Ok(Self {
            primary: Arc::new(primary),
            fallback: Arc::new(fallback),
            rewriter: Arc::new(rewriter),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "image_service=debug,tower_http=info".to_string()),
        )
        .init();

    let state = AppState::from_env()?;
    info!("image-service configured");

    let app = build_router(state);

    if std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok() {
        info!("AWS Lambda runtime detected; running image-service in lambda mode");
        lambda_run(app)
            .await
            .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    let bind_addr: SocketAddr = std::env::var("IMAGE_SERVICE_BIND")
        .ok()
        .unwrap_or_else(|| "0.0.0.0:8083".to_string())
        .parse()
        .context("invalid IMAGE_SERVICE_BIND")?;
    info!(%bind_addr, "image-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/images", post(generate_image_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "image-service"}))
}

async fn generate_image_handler(
    State(state): State<AppState>,
    Json(request): Json<GenerateImageRequest>,
) -> Result<Json<GenerateImageResponse>, ApiError> {
    let caption = normalize_caption(&request.caption)
        .ok_or_else(|| ApiError::bad_request("caption must not be empty"))?;

    let image_url = generate_with_fallback(
        state.primary.as_ref(),
        state.fallback.as_ref(),
        state.rewriter.as_ref(),
        &caption,
    )
    .await
    .map_err(|error| ApiError::bad_gateway(format!("image generation failed: {error}")))?;

    info!(image_url = %image_url, "image generated");
    Ok(Json(GenerateImageResponse { image_url }))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}
