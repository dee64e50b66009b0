//! reqwest-backed sessions
//!
//! One session exists per identity. It keeps a direct client plus one cached
//! client per egress proxy, all sharing the identity's default headers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, ORIGIN, REFERER};
use reqwest::Client;
use tracing::debug;

use super::transport::{ApiRequest, ApiResponse, HttpMethod, SessionFactory, Transport, TransportError};
use crate::error::{HarvestError, Result};
use crate::models::Identity;
use crate::proxy::address::expose;
use crate::proxy::Egress;

pub struct HttpSession {
    identity: Identity,
    headers: HeaderMap,
    timeout: Duration,
    direct: Client,
    /// Clients keyed by proxy URL
    proxied: DashMap<String, Client>,
}

impl HttpSession {
    pub fn new(identity: Identity, headers: HeaderMap, timeout: Duration) -> Result<Self> {
        let direct = build_client(&identity, &headers, timeout, None)?;
        Ok(Self {
            identity,
            headers,
            timeout,
            direct,
            proxied: DashMap::new(),
        })
    }

    fn client_for(&self, egress: Option<&Egress>) -> std::result::Result<Client, TransportError> {
        let Some(egress) = egress else {
            return Ok(self.direct.clone());
        };
        let url = expose(&egress.url);
        if let Some(client) = self.proxied.get(url) {
            return Ok(client.clone());
        }

        let proxy = reqwest::Proxy::all(url)
            .map_err(|e| TransportError::Other(format!("invalid proxy {}: {}", egress.masked, e.without_url())))?;
        let client = build_client(&self.identity, &self.headers, self.timeout, Some(proxy))
            .map_err(|e| TransportError::Other(e.to_string()))?;
        debug!(proxy = %egress.masked, "Built proxied client");
        self.proxied.insert(url.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Transport for HttpSession {
    async fn send(
        &self,
        request: &ApiRequest,
        egress: Option<&Egress>,
    ) -> std::result::Result<ApiResponse, TransportError> {
        let client = self.client_for(egress)?;
        let builder = match request.method {
            HttpMethod::Get => client.get(&request.url),
            HttpMethod::Post => client.post(&request.url),
        };
        let builder = match &request.body {
            Some(body) => builder.json(body),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(ApiResponse { status, body })
    }
}

fn build_client(
    identity: &Identity,
    headers: &HeaderMap,
    timeout: Duration,
    proxy: Option<reqwest::Proxy>,
) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(identity.user_agent.as_str())
        .default_headers(headers.clone())
        .connect_timeout(timeout.min(Duration::from_secs(20)))
        .timeout(timeout)
        .pool_max_idle_per_host(8)
        .tcp_keepalive(Duration::from_secs(60));
    if let Some(proxy) = proxy {
        builder = builder.proxy(proxy);
    }
    Ok(builder.build()?)
}

/// Builds [`HttpSession`]s with browser-like headers
pub struct HttpSessionFactory {
    origin: Option<String>,
    timeout: Duration,
}

impl HttpSessionFactory {
    pub fn new(timeout: Duration) -> Self {
        Self {
            origin: None,
            timeout,
        }
    }

    /// Send `Origin` and `Referer` matching the target site
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    fn headers(&self, identity: &Identity) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert("sec-ch-ua-platform", HeaderValue::from_static(identity.platform()));
        if let Some(hints) = identity.client_hints() {
            let value = HeaderValue::from_str(&hints)
                .map_err(|e| HarvestError::SessionBuild(format!("invalid client hints: {}", e)))?;
            headers.insert("sec-ch-ua", value);
            headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
        }
        headers.insert("sec-fetch-dest", HeaderValue::from_static("empty"));
        headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
        headers.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));

        if let Some(origin) = &self.origin {
            let value = HeaderValue::from_str(origin)
                .map_err(|e| HarvestError::SessionBuild(format!("invalid origin header: {}", e)))?;
            headers.insert(ORIGIN, value);
            let referer = HeaderValue::from_str(&format!("{}/", origin.trim_end_matches('/')))
                .map_err(|e| HarvestError::SessionBuild(format!("invalid referer header: {}", e)))?;
            headers.insert(REFERER, referer);
        }
        Ok(headers)
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn open(&self, identity: &Identity) -> Result<Arc<dyn Transport>> {
        let headers = self.headers(identity)?;
        let session = HttpSession::new(identity.clone(), headers, self.timeout)?;
        Ok(Arc::new(session))
    }
}
