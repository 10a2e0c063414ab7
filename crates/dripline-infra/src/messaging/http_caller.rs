//! Bounded-timeout HTTP executor for ExternalCall steps.
//!
//! Each request carries its own deadline (already capped by the engine
//! config) so one slow endpoint cannot stall a tick batch. Timeouts and
//! connection failures classify as transient; everything that produced a
//! response -- any status code -- is a success at this layer, because the
//! step stores the structured response for later conditions to inspect.

use std::collections::HashMap;
use std::str::FromStr;

use futures_util::future::BoxFuture;
use reqwest::Method;

use dripline_core::collaborator::{
    CollaboratorError, HttpCallRequest, HttpCallResponse, HttpCaller,
};

/// reqwest-backed implementation of `HttpCaller`.
pub struct ReqwestHttpCaller {
    client: reqwest::Client,
}

impl ReqwestHttpCaller {
    pub fn new() -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .user_agent("dripline-engine/0.1")
            .build()
            .map_err(|e| CollaboratorError::Permanent(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

impl HttpCaller for ReqwestHttpCaller {
    fn call(
        &self,
        request: HttpCallRequest,
    ) -> BoxFuture<'_, Result<HttpCallResponse, CollaboratorError>> {
        Box::pin(async move {
            let method = Method::from_str(&request.method)
                .map_err(|_| CollaboratorError::Permanent(format!(
                    "unsupported HTTP method '{}'",
                    request.method
                )))?;

            let mut builder = self
                .client
                .request(method, &request.url)
                .timeout(request.timeout);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    CollaboratorError::Transient(e.to_string())
                } else {
                    CollaboratorError::Permanent(e.to_string())
                }
            })?;

            let status = response.status().as_u16();
            let headers: HashMap<String, String> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.to_string(), v.to_string()))
                })
                .collect();
            let body = response
                .text()
                .await
                .map_err(|e| CollaboratorError::Transient(format!("reading body: {e}")))?;

            tracing::debug!(url = request.url.as_str(), status, "external call completed");

            Ok(HttpCallResponse {
                status,
                headers,
                body,
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
