//! HTTP transport for the possync server API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::transport::{OperationResult, PullPage, Transport, TransportError, TransportResult};
use crate::models::{Operation, SyncCursor, TenantId};
use crate::util::{compact_text, is_http_url, normalize_text_option};

#[derive(Clone)]
pub struct HttpTransport {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Build a transport for `endpoint` (scheme required, trailing `/` ignored).
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> TransportResult<Self> {
        let endpoint = normalize_endpoint(endpoint.into())?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| TransportError::InvalidConfiguration(error.to_string()))?;
        Ok(Self {
            endpoint,
            token: normalize_text_option(token),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn tenant_url(&self, tenant: &TenantId, resource: &str) -> String {
        format!(
            "{}/v1/tenants/{}/{resource}",
            self.endpoint,
            urlencoding::encode(tenant.as_str())
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("Accept", "application/json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> TransportResult<T> {
        let response = self.authorize(request).send().await.map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = parse_api_error(status, &body);
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    TransportError::Unauthorized(message)
                }
                _ => TransportError::Status {
                    status: status.as_u16(),
                    message,
                },
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|error| TransportError::InvalidResponse(error.to_string()))
    }
}

#[derive(Serialize)]
struct PushRequest<'a> {
    operations: &'a [Operation],
}

#[derive(Deserialize)]
struct PushResponse {
    results: Vec<OperationResult>,
}

#[async_trait]
impl Transport for HttpTransport {
    async fn push(
        &self,
        tenant: &TenantId,
        operations: &[Operation],
    ) -> TransportResult<Vec<OperationResult>> {
        let request = self
            .client
            .post(self.tenant_url(tenant, "operations"))
            .json(&PushRequest { operations });
        let response: PushResponse = self.send(request).await?;
        Ok(response.results)
    }

    async fn pull(
        &self,
        tenant: &TenantId,
        cursor: &SyncCursor,
        limit: usize,
    ) -> TransportResult<PullPage> {
        let url = format!(
            "{}?cursor={}&limit={limit}",
            self.tenant_url(tenant, "changes"),
            urlencoding::encode(cursor.as_str())
        );
        self.send(self.client.get(url)).await
    }
}

fn request_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_decode() {
        TransportError::InvalidResponse(error.to_string())
    } else if error.is_builder() {
        TransportError::InvalidConfiguration(error.to_string())
    } else {
        TransportError::Network(error.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", compact_text(&message), status.as_u16());
        }
    }

    // proxies answer with whole HTML pages; keep only the start
    let compacted = compact_text(body);
    if compacted.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", compacted, status.as_u16())
    }
}

fn normalize_endpoint(raw: String) -> TransportResult<String> {
    let endpoint = normalize_text_option(Some(raw)).ok_or_else(|| {
        TransportError::InvalidConfiguration("endpoint must not be empty".to_string())
    })?;
    if is_http_url(&endpoint) {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(TransportError::InvalidConfiguration(
            "endpoint must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> HttpTransport {
        HttpTransport::new(
            "https://sync.example.com/",
            Some("secret".to_string()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn normalize_endpoint_rejects_invalid_values() {
        assert!(normalize_endpoint(String::new()).is_err());
        assert!(normalize_endpoint("sync.example.com".to_string()).is_err());
        assert_eq!(
            normalize_endpoint(" https://sync.example.com/ ".to_string()).unwrap(),
            "https://sync.example.com"
        );
    }

    #[test]
    fn tenant_is_encoded_into_the_path() {
        let tenant = TenantId::new("bistro one").unwrap();
        assert_eq!(
            transport().tenant_url(&tenant, "changes"),
            "https://sync.example.com/v1/tenants/bistro%20one/changes"
        );
    }

    #[test]
    fn debug_redacts_token() {
        let debug = format!("{:?}", transport());
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn api_errors_prefer_message_field() {
        assert_eq!(
            parse_api_error(StatusCode::CONFLICT, r#"{"message":" order closed "}"#),
            "order closed (409)"
        );
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, ""), "HTTP 502");
        assert_eq!(
            parse_api_error(StatusCode::BAD_REQUEST, "nope"),
            "nope (400)"
        );
    }

    #[test]
    fn long_error_bodies_are_shortened() {
        let page = format!("<html>{}</html>", "gateway timeout ".repeat(40));
        let message = parse_api_error(StatusCode::GATEWAY_TIMEOUT, &page);
        assert_eq!(message.chars().count(), 180 + " (504)".len());
        assert!(message.starts_with("<html>gateway timeout"));
        assert!(message.ends_with(" (504)"));

        let json = format!(r#"{{"error":"{}"}}"#, "x".repeat(400));
        let message = parse_api_error(StatusCode::BAD_REQUEST, &json);
        assert_eq!(message, format!("{} (400)", "x".repeat(180)));
    }
}
