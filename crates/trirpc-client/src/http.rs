//! Request/response clients over HTTP.
//!
//! - [`UriClient`]: `GET /{method}?arg=<json>`
//! - [`JsonRpcClient`]: `POST /` with a JSON-RPC envelope

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use trirpc_core::{Codec, ListenAddr, Request, Response};

use crate::error::{ClientError, Result};
use crate::params::Params;

/// A client that performs one HTTP round trip per call.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Call `method` and return the raw result value.
    async fn call_value(&self, method: &str, params: &Params) -> Result<Value>;

    /// Codec used to decode results.
    fn codec(&self) -> &Codec;

    /// Call `method` and decode the result as `R`.
    async fn call<R>(&self, method: &str, params: &Params) -> Result<R>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let value = self.call_value(method, params).await?;
        Ok(self.codec().from_value(value)?)
    }
}

/// `http://host:port` for a `tcp://` address; plain `http(s)://` URLs pass through.
fn base_url(remote: &str) -> Result<String> {
    if remote.starts_with("http://") || remote.starts_with("https://") {
        return Ok(remote.trim_end_matches('/').to_owned());
    }
    let addr: ListenAddr = remote.parse()?;
    addr.http_base()
        .ok_or_else(|| ClientError::UnsupportedAddr(remote.to_owned()))
}

fn build_http() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().build()?)
}

async fn read_response(resp: reqwest::Response) -> Result<Response> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClientError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp.json::<Response>().await?)
}

// ── URI client ──────────────────────────────────────────────────────

/// Calls direct endpoints, passing arguments in the query string.
#[derive(Clone, Debug)]
pub struct UriClient {
    base: String,
    http: reqwest::Client,
    codec: Arc<Codec>,
}

impl UriClient {
    /// Client for `remote` (`tcp://host:port` or an `http://` URL).
    pub fn new(remote: &str) -> Result<Self> {
        Self::with_codec(remote, Arc::new(Codec::new()))
    }

    /// Client decoding results with `codec`.
    pub fn with_codec(remote: &str, codec: Arc<Codec>) -> Result<Self> {
        Ok(Self {
            base: base_url(remote)?,
            http: build_http()?,
            codec,
        })
    }
}

#[async_trait]
impl HttpClient for UriClient {
    async fn call_value(&self, method: &str, params: &Params) -> Result<Value> {
        let url = format!("{}/{method}", self.base);
        let pairs = params.to_query_pairs()?;
        debug!(%url, args = pairs.len(), "uri call");
        let resp = self.http.get(&url).query(&pairs).send().await?;
        read_response(resp)
            .await?
            .into_result()
            .map_err(ClientError::Rpc)
    }

    fn codec(&self) -> &Codec {
        &self.codec
    }
}

// ── JSON-RPC client ─────────────────────────────────────────────────

/// Posts JSON-RPC envelopes to `/`.
#[derive(Clone, Debug)]
pub struct JsonRpcClient {
    base: String,
    http: reqwest::Client,
    codec: Arc<Codec>,
}

impl JsonRpcClient {
    /// Client for `remote` (`tcp://host:port` or an `http://` URL).
    pub fn new(remote: &str) -> Result<Self> {
        Self::with_codec(remote, Arc::new(Codec::new()))
    }

    /// Client decoding results with `codec`.
    pub fn with_codec(remote: &str, codec: Arc<Codec>) -> Result<Self> {
        Ok(Self {
            base: base_url(remote)?,
            http: build_http()?,
            codec,
        })
    }

    /// Send an envelope and return the response as-is.
    pub async fn send(&self, request: &Request) -> Result<Response> {
        let resp = self
            .http
            .post(format!("{}/", self.base))
            .json(request)
            .send()
            .await?;
        read_response(resp).await
    }

    /// Fire a notification; the server executes it and sends nothing back.
    pub async fn notify(&self, method: &str, params: &Params) -> Result<()> {
        let request = Request::notification(method, Some(params.to_named()));
        let resp = self
            .http
            .post(format!("{}/", self.base))
            .json(&request)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            })
        }
    }
}

#[async_trait]
impl HttpClient for JsonRpcClient {
    async fn call_value(&self, method: &str, params: &Params) -> Result<Value> {
        let id = uuid::Uuid::now_v7().to_string();
        let request = Request::new(id.clone(), method, Some(params.to_named()));
        debug!(%id, method, "json-rpc call");
        let response = self.send(&request).await?;
        if response.id != id {
            return Err(ClientError::IdMismatch {
                expected: id,
                actual: response.id,
            });
        }
        response.into_result().map_err(ClientError::Rpc)
    }

    fn codec(&self) -> &Codec {
        &self.codec
    }
}
