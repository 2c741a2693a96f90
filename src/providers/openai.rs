//! OpenAI-compatible chat completions over HTTP.

use crate::client::HttpClient;
use crate::errors::{ProviderError, SelectionError};
use crate::models::{ChatRequest, ChatResponse};
use crate::target::AuthType;
use crate::traits::{ProviderFactory, ProviderHealth, ProviderModule, ProviderSlot};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, trace};
use url::Url;

/// Upstream bodies larger than this are rejected.
const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

/// Error bodies are cut to this many characters before they end up in health state and logs.
const MAX_ERROR_CHARS: usize = 512;

const API_KEY_HEADER: &str = "api-key";

pub struct OpenAiCompatibleProvider {
    id: String,
    endpoint: String,
    auth: AuthType,
    api_key: Option<String>,
    client: Arc<dyn HttpClient>,
}

impl fmt::Debug for OpenAiCompatibleProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiCompatibleProvider")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("auth", &self.auth)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl OpenAiCompatibleProvider {
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        auth: AuthType,
        api_key: Option<String>,
        client: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            auth,
            api_key,
            client,
        }
    }

    fn url(&self, path: &str) -> Result<Url, ProviderError> {
        // Without the trailing slash `join` would replace the last path segment (`/v1`)
        let mut base = self.endpoint.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        Url::parse(&base)
            .and_then(|url| url.join(path))
            .map_err(|e| ProviderError::Transport(format!("invalid endpoint '{}': {}", self.endpoint, e)))
    }

    fn request(&self, method: Method, path: &str, body: Body) -> Result<Request<Body>, ProviderError> {
        let url = self.url(path)?;
        let mut builder = Request::builder()
            .method(method)
            .uri(url.as_str())
            .header(header::CONTENT_TYPE, "application/json");

        match (&self.auth, &self.api_key) {
            (AuthType::Bearer, Some(key)) => {
                builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
            }
            (AuthType::ApiKey, Some(key)) => {
                builder = builder.header(API_KEY_HEADER, key.as_str());
            }
            _ => debug!("No credential configured for provider {}", self.id),
        }

        builder
            .body(body)
            .map_err(|e| ProviderError::Transport(e.to_string()))
    }
}

#[async_trait]
impl ProviderModule for OpenAiCompatibleProvider {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip(self, request), fields(provider = %self.id, model = %request.model))]
    async fn process(&self, mut request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        // Responses are read whole, so upstream streaming is switched off
        if request.stream.take().is_some() {
            trace!("Dropping stream flag for upstream call");
        }

        let body = serde_json::to_vec(&request)
            .map_err(|e| ProviderError::Transport(format!("failed to encode request: {e}")))?;
        let http_request = self.request(Method::POST, "chat/completions", Body::from(body))?;

        let response = self
            .client
            .request(http_request)
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), MAX_RESPONSE_BYTES)
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !status.is_success() {
            let message: String = String::from_utf8_lossy(&bytes)
                .chars()
                .take(MAX_ERROR_CHARS)
                .collect();
            if status == StatusCode::SERVICE_UNAVAILABLE {
                return Err(ProviderError::Unavailable(message));
            }
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }

    async fn health(&self) -> ProviderHealth {
        let request = match self.request(Method::GET, "models", Body::empty()) {
            Ok(request) => request,
            Err(e) => return ProviderHealth::Unhealthy(e.to_string()),
        };

        match self.client.request(request).await {
            Ok(response) if response.status().is_success() => ProviderHealth::Healthy,
            Ok(response) => {
                ProviderHealth::Unhealthy(format!("models endpoint returned {}", response.status()))
            }
            Err(e) => ProviderHealth::Unhealthy(e.to_string()),
        }
    }
}

/// Builds `OpenAiCompatibleProvider`s that share one HTTP client.
#[derive(Debug, Clone)]
pub struct OpenAiProviderFactory {
    client: Arc<dyn HttpClient>,
}

impl OpenAiProviderFactory {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client }
    }
}

impl ProviderFactory for OpenAiProviderFactory {
    fn create(&self, slot: ProviderSlot<'_>) -> Result<Arc<dyn ProviderModule>, SelectionError> {
        // Unrecognized auth types are reported by pipeline validation, not here
        let auth = slot.provider.auth_type().unwrap_or(AuthType::None);
        Ok(Arc::new(OpenAiCompatibleProvider::new(
            slot.provider_id,
            slot.provider.endpoint.clone(),
            auth,
            slot.api_key().filter(|k| !k.is_empty()).map(str::to_string),
            Arc::clone(&self.client),
        )))
    }
}
