//! Outbound HTTP via `reqwest`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::{BackendError, BackendResult, FetchRequest, FetchResponse, NetworkBackend};

/// [`NetworkBackend`] performing real HTTP requests.
#[derive(Debug, Clone)]
pub struct HttpNetworkBackend {
    client: reqwest::Client,
    max_response_bytes: usize,
}

impl HttpNetworkBackend {
    /// Build a client with a per-request timeout and a response body cap.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration, max_response_bytes: usize) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::new(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            max_response_bytes,
        })
    }
}

#[async_trait]
impl NetworkBackend for HttpNetworkBackend {
    async fn fetch(&self, request: FetchRequest) -> BackendResult<FetchResponse> {
        let url = request.url.as_str();
        let mut builder = match request.method.to_uppercase().as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            "PATCH" => self.client.patch(url),
            "HEAD" => self.client.head(url),
            other => {
                return Err(BackendError::new(format!(
                    "unsupported HTTP method: {other}"
                )));
            },
        };

        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| BackendError::new(format!("HTTP request failed: {e}")))?;

        let status = resp.status().as_u16();
        let headers: BTreeMap<String, String> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        let mut body = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| BackendError::new(format!("failed to read HTTP response body: {e}")))?;
            if body.len().saturating_add(chunk.len()) > self.max_response_bytes {
                return Err(BackendError::new(format!(
                    "response body exceeds {} bytes",
                    self.max_response_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchResponse {
            status,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}
