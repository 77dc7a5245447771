// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! CRL HTTP fetching.
//!
//! The cache talks to the network only through the [`CrlSource`] trait so
//! that refresh behavior can be exercised without a server.
//!
//! # Security Considerations
//!
//! - **Size limits**: Default 10 MB limit prevents memory exhaustion
//! - **Timeouts**: Every request carries the caller's timeout
//! - **URL validation**: Only `http` and `https` are accepted

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::{AgentError, Result};

/// Default maximum CRL size (10 MB).
pub const DEFAULT_MAX_CRL_SIZE: usize = 10 * 1024 * 1024;

/// A place CRL blobs can be downloaded from.
#[async_trait]
pub trait CrlSource: Send + Sync {
    /// Download the CRL at `url`, giving up after `timeout`.
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>>;
}

/// HTTP(S) CRL source backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpCrlSource {
    client: reqwest::Client,
    max_size: usize,
}

impl HttpCrlSource {
    /// Create a source with the default size limit.
    pub fn new() -> Result<Self> {
        Self::with_max_size(DEFAULT_MAX_CRL_SIZE)
    }

    /// Create a source with a custom size limit in bytes.
    pub fn with_max_size(max_size: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .user_agent(crate::USER_AGENT)
            .build()
            .map_err(|e| AgentError::crl_fetch(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, max_size })
    }
}

#[async_trait]
impl CrlSource for HttpCrlSource {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>> {
        let parsed = Url::parse(url).map_err(|e| AgentError::invalid_url(format!("{url}: {e}")))?;

        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(AgentError::invalid_url(format!(
                    "Unsupported URL scheme '{scheme}' (must be http or https)"
                )));
            }
        }

        tracing::debug!("GET {}", url);

        let mut response = self
            .client
            .get(parsed)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, url, timeout))?;

        if !response.status().is_success() {
            return Err(AgentError::crl_fetch(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        if let Some(len) = response.content_length() {
            if len as usize > self.max_size {
                return Err(AgentError::CrlTooLarge(len as usize, self.max_size));
            }
        }

        // Chunked bodies carry no length; stop reading once over the cap
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| classify(e, url, timeout))?
        {
            let received = body.len() + chunk.len();
            if received > self.max_size {
                return Err(AgentError::CrlTooLarge(received, self.max_size));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

fn classify(err: reqwest::Error, url: &str, timeout: Duration) -> AgentError {
    if err.is_timeout() {
        AgentError::CrlTimeout(timeout.as_secs())
    } else {
        AgentError::crl_fetch(format!("GET {url} failed: {err}"))
    }
}
