// Gateway source client
// Talks to a JSON integration layer that fronts the real data sources:
//   POST {base_url}/sources/{source_id}/query   { "params": { ... } }
//   200 -> { "records": [ RawRecord, ... ] }

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{QueryParams, RawRecord, SourceClient, SourceRegistry};
use crate::config::SourcesConfig;
use crate::evidence::{SourceCategory, SourceId};
use crate::types::{AppError, AppResult, CallFailure};

pub struct GatewaySource {
    client: Client,
    base_url: String,
    source: SourceId,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct GatewayRequest<'a> {
    params: &'a QueryParams,
}

#[derive(Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    records: Vec<RawRecord>,
}

impl GatewaySource {
    pub fn new(base_url: &str, source: SourceId, timeout: Duration) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            source,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/sources/{}/query", self.base_url, self.source)
    }

    async fn send(&self, params: &QueryParams) -> Result<Vec<RawRecord>, CallFailure> {
        let mut request = self.client.post(self.endpoint()).json(&GatewayRequest { params });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CallFailure::unavailable(format!("{} request failed: {}", self.source, e)))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        let parsed: GatewayResponse = response
            .json()
            .await
            .map_err(|e| CallFailure::unavailable(format!("{} returned malformed body: {}", self.source, e)))?;
        debug!(source = %self.source, records = parsed.records.len(), "Gateway query succeeded");
        Ok(parsed.records)
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> CallFailure {
    let snippet: String = body.chars().take(200).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => CallFailure::rate_limited(retry_after),
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::UNPROCESSABLE_ENTITY => CallFailure::invalid(format!("{}: {}", status, snippet)),
        _ => CallFailure::unavailable(format!("{}: {}", status, snippet)),
    }
}

#[async_trait]
impl SourceClient for GatewaySource {
    async fn query(
        &self,
        params: &QueryParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawRecord>, CallFailure> {
        tokio::select! {
            _ = cancel.cancelled() => Err(CallFailure::cancelled()),
            result = self.send(params) => result,
        }
    }
}

/// Build a registry from `id:category` pairs served by one gateway.
pub fn gateway_registry(config: &SourcesConfig, ttl: Duration) -> AppResult<SourceRegistry> {
    let base_url = config
        .gateway_url
        .as_deref()
        .ok_or_else(|| AppError::Internal("SOURCE_GATEWAY_URL is not set".to_string()))?;

    let mut registry = SourceRegistry::new();
    for entry in &config.gateway_sources {
        let (id, category) = entry
            .split_once(':')
            .ok_or_else(|| AppError::Internal(format!("gateway source '{}' is not id:category", entry)))?;
        let category: SourceCategory = serde_json::from_value(serde_json::Value::String(category.trim().to_string()))
            .map_err(|_| AppError::Internal(format!("unknown source category in '{}'", entry)))?;
        let id = SourceId::new(id.trim());
        let client = GatewaySource::new(base_url, id.clone(), config.http_timeout)
            .with_api_key(config.gateway_api_key.clone());
        registry = registry.with_source(id, category, Arc::new(client), ttl);
    }
    Ok(registry)
}
