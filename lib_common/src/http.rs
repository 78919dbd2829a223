//! Generic HTTP API client with retry middleware, the foundation both
//! provider adapters build their broker REST calls on.

#![forbid(unsafe_code)]

use std::time::Duration;

use reqwest::{
    header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE},
    Method, Url,
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{GatewayError, Result};

/// Default upper bound on a provider HTTP call, propagated from the caller
/// per the concurrency model's cancellation rules.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one API call: either a typed payload or the raw error body,
/// distinguished by HTTP status so callers can branch without matching on
/// error variants for ordinary 4xx/5xx broker responses.
#[derive(Debug)]
pub struct ApiResponse<T> {
    pub data: Option<T>,
    pub error_body: Option<String>,
    pub status: u16,
    pub success: bool,
    pub headers: HeaderMap,
}

/// A client for making HTTP requests to a specified base URL, with
/// automatic retry on transient failures and optional Bearer auth.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
}

impl ApiClient {
    /// # Panics
    /// If `base_url` is not a valid absolute URL.
    pub fn new(base_url: &str, auth_token: Option<String>) -> Self {
        let url = Url::parse(base_url).expect("invalid base URL (must be absolute)");
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let inner = ClientBuilder::new(
            reqwest::Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .expect("failed to build reqwest client"),
        )
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build();

        Self {
            inner,
            base_url: url,
            auth_token,
        }
    }

    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<B>,
        headers: Option<HeaderMap>,
    ) -> Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let full_url = self
            .base_url
            .join(path)
            .map_err(|e| GatewayError::InvalidPayload(format!("bad path {path}: {e}")))?;
        let mut req = self.inner.request(method, full_url);

        if let Some(h) = headers {
            req = req.headers(h);
        }
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(b) = body {
            let json_body = serde_json::to_string(&b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        let response = req.send().await.map_err(|e| GatewayError::ProviderError {
            message: e.to_string(),
            retryable: true,
        })?;
        let status = response.status();
        let resp_headers = response.headers().clone();
        let success = status.is_success();

        if success {
            let data = response.json::<T>().await.map_err(|e| GatewayError::ProviderError {
                message: format!("decode failure: {e}"),
                retryable: false,
            })?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<T>> {
        self.request::<T, ()>(Method::GET, path, None, None).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ApiResponse<T>> {
        self.request(Method::POST, path, Some(body), None).await
    }
}
