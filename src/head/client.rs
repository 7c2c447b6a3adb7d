//! Signing HTTP client for head→node calls.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use reqwest::Method;
use serde_json::Value;

use crate::config::NodeTarget;
use crate::error::ApiError;
use crate::security::EnvelopeSigner;
use crate::security::envelope::{META_HEADER, SIGNATURE_HEADER};

/// What a node answered: relayed verbatim by most head routes.
#[derive(Debug, Clone)]
pub struct NodeReply {
    pub status: StatusCode,
    pub body: Value,
}

impl NodeReply {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

pub struct NodeClient {
    signer: Arc<EnvelopeSigner>,
    http: reqwest::Client,
    timeout: Duration,
}

impl NodeClient {
    pub fn new(signer: Arc<EnvelopeSigner>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            signer,
            http,
            timeout,
        }
    }

    /// Send one signed request. The envelope covers exactly the
    /// path-and-query appended to the node's base URL, so both sides see
    /// the same canonical string.
    pub async fn call(
        &self,
        node: &NodeTarget,
        method: Method,
        path_and_query: &str,
        body: Option<&Value>,
    ) -> Result<NodeReply, ApiError> {
        let body_bytes = match body {
            Some(value) => serde_json::to_vec(value)
                .map_err(|error| ApiError::internal(error.into()))?,
            None => Vec::new(),
        };
        let envelope = self
            .signer
            .sign(method.as_str(), path_and_query, &body_bytes);

        let url = format!("{}{}", node.base_url, path_and_query);
        let mut request = self
            .http
            .request(method, &url)
            .timeout(self.timeout)
            .header(SIGNATURE_HEADER, envelope.signature)
            .header(META_HEADER, envelope.meta);
        if body.is_some() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body_bytes);
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                ApiError::NodeTimeout {
                    node_id: node.id.clone(),
                }
            } else {
                ApiError::NodeUnreachable {
                    node_id: node.id.clone(),
                    detail: error.to_string(),
                }
            }
        })?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let bytes = response.bytes().await.map_err(|error| {
            ApiError::NodeUnreachable {
                node_id: node.id.clone(),
                detail: error.to_string(),
            }
        })?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        Ok(NodeReply { status, body })
    }
}
