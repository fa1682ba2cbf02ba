//! Signed order transport.
//!
//! Adapters own the venue quirks (parameter shaping, retry rules, unit
//! conversion); the wire-level concern of signing and dispatching private
//! calls is a pluggable capability behind `OrderTransport`. The default
//! implementation signs each venue's REST scheme directly; tests swap in
//! scripted transports.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::{VenueCredential, VenueError, VenueId, VenueResult};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

const DEFAULT_ORDER_TIMEOUT: Duration = Duration::from_secs(10);

/// One signed venue call. `params` become the query string or JSON body
/// depending on the venue's signing scheme.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: &'static str,
    pub path: String,
    pub params: serde_json::Map<String, Value>,
}

impl SignedRequest {
    pub fn post(path: impl Into<String>, params: serde_json::Map<String, Value>) -> Self {
        Self {
            method: "POST",
            path: path.into(),
            params,
        }
    }

    pub fn delete(path: impl Into<String>, params: serde_json::Map<String, Value>) -> Self {
        Self {
            method: "DELETE",
            path: path.into(),
            params,
        }
    }
}

/// Pluggable signed-call capability for private venue endpoints.
#[async_trait]
pub trait OrderTransport: Send + Sync {
    async fn execute(
        &self,
        venue: VenueId,
        credential: &VenueCredential,
        request: SignedRequest,
    ) -> VenueResult<Value>;
}

/// Default REST transport signing each venue's private API scheme.
pub struct RestOrderTransport {
    client: reqwest::Client,
    base_urls: HashMap<VenueId, String>,
}

impl RestOrderTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_ORDER_TIMEOUT)
            .build()
            .expect("reqwest client");

        let mut base_urls = HashMap::new();
        base_urls.insert(VenueId::Binance, "https://fapi.binance.com".to_string());
        base_urls.insert(VenueId::Okx, "https://www.okx.com".to_string());
        base_urls.insert(VenueId::Bybit, "https://api.bybit.com".to_string());
        base_urls.insert(VenueId::Bitget, "https://api.bitget.com".to_string());
        base_urls.insert(VenueId::Gateio, "https://api.gateio.ws".to_string());

        Self { client, base_urls }
    }

    /// Override a venue's base URL (tests and testnet routing).
    pub fn with_base_url(mut self, venue: VenueId, base_url: impl Into<String>) -> Self {
        self.base_urls.insert(venue, base_url.into());
        self
    }

    fn base_url(&self, venue: VenueId) -> &str {
        self.base_urls
            .get(&venue)
            .map(String::as_str)
            .unwrap_or_default()
    }

    async fn dispatch(&self, builder: reqwest::RequestBuilder) -> VenueResult<Value> {
        let response = builder.send().await.map_err(VenueError::from)?;
        let status = response.status();
        let body = response.text().await.map_err(VenueError::from)?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|err| VenueError::fatal(format!("malformed venue response: {err}")));
        }

        debug!(%status, %body, "venue order call rejected");
        let message = format!("http {}: {}", status.as_u16(), body);
        if status.as_u16() == 429 || status.is_server_error() {
            Err(VenueError::transient(message))
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            Err(VenueError::auth(message))
        } else {
            Err(VenueError::fatal(message))
        }
    }
}

impl Default for RestOrderTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderTransport for RestOrderTransport {
    async fn execute(
        &self,
        venue: VenueId,
        credential: &VenueCredential,
        request: SignedRequest,
    ) -> VenueResult<Value> {
        let base = self.base_url(venue).to_string();
        match venue {
            VenueId::Binance => self.execute_binance(&base, credential, request).await,
            VenueId::Okx => self.execute_okx(&base, credential, request).await,
            VenueId::Bybit => self.execute_bybit(&base, credential, request).await,
            VenueId::Bitget => self.execute_bitget(&base, credential, request).await,
            VenueId::Gateio => self.execute_gateio(&base, credential, request).await,
        }
    }
}

impl RestOrderTransport {
    async fn execute_binance(
        &self,
        base: &str,
        credential: &VenueCredential,
        request: SignedRequest,
    ) -> VenueResult<Value> {
        let mut query = encode_query(&request.params);
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}", Utc::now().timestamp_millis()));
        let signature = hmac_sha256_hex(credential.api_secret(), &query);
        let url = format!("{base}{}?{query}&signature={signature}", request.path);

        let builder = self
            .client
            .request(parse_method(request.method), url)
            .header("X-MBX-APIKEY", credential.api_key());
        self.dispatch(builder).await
    }

    async fn execute_okx(
        &self,
        base: &str,
        credential: &VenueCredential,
        request: SignedRequest,
    ) -> VenueResult<Value> {
        let body = Value::Object(request.params.clone()).to_string();
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let prehash = format!("{timestamp}{}{}{body}", request.method, request.path);
        let signature = hmac_sha256_base64(credential.api_secret(), &prehash);

        let mut builder = self
            .client
            .request(parse_method(request.method), format!("{base}{}", request.path))
            .header("OK-ACCESS-KEY", credential.api_key())
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header(
                "OK-ACCESS-PASSPHRASE",
                credential.passphrase().unwrap_or_default(),
            )
            .header("Content-Type", "application/json")
            .body(body);
        if credential.testnet {
            builder = builder.header("x-simulated-trading", "1");
        }
        self.dispatch(builder).await
    }

    async fn execute_bybit(
        &self,
        base: &str,
        credential: &VenueCredential,
        request: SignedRequest,
    ) -> VenueResult<Value> {
        let body = Value::Object(request.params.clone()).to_string();
        let timestamp = Utc::now().timestamp_millis().to_string();
        let recv_window = "5000";
        let prehash = format!("{timestamp}{}{recv_window}{body}", credential.api_key());
        let signature = hmac_sha256_hex(credential.api_secret(), &prehash);

        let builder = self
            .client
            .request(parse_method(request.method), format!("{base}{}", request.path))
            .header("X-BAPI-API-KEY", credential.api_key())
            .header("X-BAPI-TIMESTAMP", timestamp)
            .header("X-BAPI-RECV-WINDOW", recv_window)
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(body);
        self.dispatch(builder).await
    }

    async fn execute_bitget(
        &self,
        base: &str,
        credential: &VenueCredential,
        request: SignedRequest,
    ) -> VenueResult<Value> {
        let body = Value::Object(request.params.clone()).to_string();
        let timestamp = Utc::now().timestamp_millis().to_string();
        let prehash = format!("{timestamp}{}{}{body}", request.method, request.path);
        let signature = hmac_sha256_base64(credential.api_secret(), &prehash);

        let builder = self
            .client
            .request(parse_method(request.method), format!("{base}{}", request.path))
            .header("ACCESS-KEY", credential.api_key())
            .header("ACCESS-SIGN", signature)
            .header("ACCESS-TIMESTAMP", timestamp)
            .header(
                "ACCESS-PASSPHRASE",
                credential.passphrase().unwrap_or_default(),
            )
            .header("Content-Type", "application/json")
            .body(body);
        self.dispatch(builder).await
    }

    async fn execute_gateio(
        &self,
        base: &str,
        credential: &VenueCredential,
        request: SignedRequest,
    ) -> VenueResult<Value> {
        let body = Value::Object(request.params.clone()).to_string();
        let timestamp = Utc::now().timestamp().to_string();
        let body_hash = hex_encode(&Sha512::digest(body.as_bytes()));
        let prehash = format!(
            "{}\n{}\n\n{body_hash}\n{timestamp}",
            request.method, request.path
        );
        let signature = hmac_sha512_hex(credential.api_secret(), &prehash);

        let builder = self
            .client
            .request(parse_method(request.method), format!("{base}{}", request.path))
            .header("KEY", credential.api_key())
            .header("Timestamp", timestamp)
            .header("SIGN", signature)
            .header("Content-Type", "application/json")
            .body(body);
        self.dispatch(builder).await
    }
}

fn parse_method(method: &str) -> reqwest::Method {
    match method {
        "DELETE" => reqwest::Method::DELETE,
        "GET" => reqwest::Method::GET,
        _ => reqwest::Method::POST,
    }
}

fn encode_query(params: &serde_json::Map<String, Value>) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(params.len());
    for (key, value) in params {
        let rendered = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        parts.push(format!("{key}={rendered}"));
    }
    parts.join("&")
}

fn hmac_sha256_hex(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

fn hmac_sha256_base64(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

fn hmac_sha512_hex(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha512::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
