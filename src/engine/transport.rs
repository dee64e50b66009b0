//! Seams between the retry loop and the network
//!
//! [`Transport`] issues one request through an optional egress proxy.
//! [`SessionFactory`] builds a fresh transport bound to an identity.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::error::Result;
use crate::models::Identity;
use crate::proxy::Egress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// One logical request, reused unchanged across attempts
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Short label used in logs, e.g. `wallet_stats`
    pub endpoint: String,
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(endpoint: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: HttpMethod::Get,
            url: url.into(),
            body: None,
        }
    }

    pub fn post(endpoint: impl Into<String>, url: impl Into<String>, body: Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: HttpMethod::Post,
            url: url.into(),
            body: Some(body),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network-level failure of a single attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("response body could not be decoded: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        // Strip the URL; it may carry proxy credentials
        let err = err.without_url();
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_decode() || err.is_body() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue the request, through `egress` when given or directly otherwise
    async fn send(
        &self,
        request: &ApiRequest,
        egress: Option<&Egress>,
    ) -> std::result::Result<ApiResponse, TransportError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Build a new session presenting `identity`
    async fn open(&self, identity: &Identity) -> Result<Arc<dyn Transport>>;
}
