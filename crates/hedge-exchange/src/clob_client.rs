//! CLOB REST client (spec.md §4.7 "Order Executor", §4.10 "Collateral
//! Operations" gateway calls): order submission, cancellation, and a fresh
//! order-book HTTP probe, all routed through the shared
//! `RateLimitedGateway` under the `clob-general` category. L2 (HMAC-SHA256)
//! request signing is grounded on the teacher's
//! `exchange-polymarket::arbitrage::clob_auth::L2Auth`; EIP-712 order
//! signing itself is out of this crate's scope — callers hand in an
//! already-signed `OrderRequest.signature`.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE as BASE64_URL_SAFE};
use base64::Engine;
use chrono::Utc;
use hedge_core::events::{OrderSide, TimeInForce};
use hedge_gateway::{ClassifyGatewayError, RateLimitSignal, RateLimitedGateway};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const CLOB_API_URL: &str = "https://clob.polymarket.com";
const GATEWAY_CATEGORY: &str = "clob-general";
const MARKET_DATA_CATEGORY: &str = "clob-market-data";
const FRESH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

/// L2 (HMAC-SHA256) request signer, identical wire format to the venue's
/// Python/TypeScript reference clients: `HMAC(secret, "{ts}{method}{path}{body}")`
/// base64url-encoded.
#[derive(Clone)]
struct L2Auth {
    creds: ApiCredentials,
    address: String,
}

struct L2Headers {
    address: String,
    signature: String,
    timestamp: String,
    api_key: String,
    passphrase: String,
}

#[derive(Debug, Error)]
pub enum ClobAuthError {
    #[error("invalid base64 secret: {0}")]
    Base64(String),
    #[error("invalid hmac key length: {0}")]
    HmacKeyLength(String),
}

impl L2Auth {
    fn headers(&self, method: &str, path: &str, body: &str) -> Result<L2Headers, ClobAuthError> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = self.compute_hmac(&timestamp, method, path, body)?;
        Ok(L2Headers {
            address: self.address.clone(),
            signature,
            timestamp,
            api_key: self.creds.api_key.clone(),
            passphrase: self.creds.passphrase.clone(),
        })
    }

    fn compute_hmac(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String, ClobAuthError> {
        let secret_bytes = BASE64_URL_SAFE
            .decode(&self.creds.secret)
            .or_else(|_| BASE64_STANDARD.decode(&self.creds.secret))
            .map_err(|e| ClobAuthError::Base64(e.to_string()))?;
        let mut message = format!("{timestamp}{method}{path}");
        if !body.is_empty() {
            message.push_str(body);
        }
        let mut mac =
            HmacSha256::new_from_slice(&secret_bytes).map_err(|e| ClobAuthError::HmacKeyLength(e.to_string()))?;
        mac.update(message.as_bytes());
        Ok(BASE64_URL_SAFE.encode(mac.finalize().into_bytes()))
    }
}

#[derive(Debug, Error)]
pub enum ClobClientError {
    #[error("clob api http error {status}: {body}")]
    Http { status: u16, body: String },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Auth(#[from] ClobAuthError),
    #[error("fresh order-book probe timed out after {0:?}")]
    ProbeTimeout(Duration),
}

impl ClassifyGatewayError for ClobClientError {
    fn rate_limit_signal(&self) -> Option<RateLimitSignal> {
        match self {
            Self::Http { status: 429, .. } => Some(RateLimitSignal { reset_after: None }),
            _ => None,
        }
    }
}

/// A fully-prepared, pre-signed order ready for submission (spec.md §4.7).
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub token_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub time_in_force: TimeInForce,
    pub signature: String,
    pub salt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    #[serde(default)]
    pub order_id: Option<String>,
    pub success: bool,
    #[serde(default, rename = "takingAmount")]
    pub taking_amount: Option<String>,
    #[serde(default, rename = "makingAmount")]
    pub making_amount: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "errorMsg")]
    pub error_msg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelResponse {
    #[serde(default)]
    pub canceled: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookLevelWire {
    pub price: String,
    pub size: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderBookWire {
    #[serde(default)]
    pub bids: Vec<BookLevelWire>,
    #[serde(default)]
    pub asks: Vec<BookLevelWire>,
}

/// One resting order as reported by the venue's open-orders snapshot
/// (spec.md §4.11 "User-channel reconnect").
#[derive(Debug, Clone, Deserialize)]
pub struct OpenOrderWire {
    pub id: String,
    pub asset_id: String,
    #[serde(default)]
    pub size_matched: String,
    #[serde(default)]
    pub original_size: String,
}

/// Cheap to clone: `reqwest::Client` and `Arc<RateLimitedGateway>` are
/// reference-counted internally, `L2Auth`/`String` clone their small owned
/// fields. Cloned into each gateway-dispatched closure below so the produced
/// future is `Send + 'static` and can be spawned by the gateway (spec.md
/// §4.1 cancellation-safety contract).
#[derive(Clone)]
pub struct ClobClient {
    http: Client,
    base_url: String,
    auth: L2Auth,
    gateway: Arc<RateLimitedGateway>,
}

impl ClobClient {
    #[must_use]
    pub fn new(creds: ApiCredentials, address: String, gateway: Arc<RateLimitedGateway>) -> Self {
        Self {
            http: Client::new(),
            base_url: CLOB_API_URL.to_string(),
            auth: L2Auth { creds, address },
            gateway,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Submits `order` (spec.md §4.7 `precise_buy` step 3: "Submit an
    /// IOC-style order"). Routed through `clob-general`.
    pub async fn submit_order(&self, order: &OrderRequest) -> Result<OrderResponse, ClobClientError> {
        let path = "/order";
        let body = serde_json::to_string(order).map_err(|e| ClobClientError::Http {
            status: 0,
            body: format!("serialize order: {e}"),
        })?;
        let this = self.clone();
        self.gateway
            .execute(GATEWAY_CATEGORY, "submit_order", move || {
                let this = this.clone();
                let body = body.clone();
                async move { this.post(path, &body).await }
            })
            .await
    }

    /// `cancel_orders(condition_id, token_id?)` (spec.md §4.7): a zero-length
    /// `canceled` list means the order had already filled before the
    /// cancellation reached the venue — not treated as an error here.
    pub async fn cancel_orders(&self, condition_id: &str, token_id: Option<&str>) -> Result<usize, ClobClientError> {
        let path = "/orders";
        let body = serde_json::to_string(&serde_json::json!({
            "market": condition_id,
            "asset_id": token_id,
        }))
        .expect("static shape serializes");
        let this = self.clone();
        let response: CancelResponse = self
            .gateway
            .execute(GATEWAY_CATEGORY, "cancel_orders", move || {
                let this = this.clone();
                let body = body.clone();
                async move { this.delete(path, &body).await }
            })
            .await?;
        Ok(response.canceled.len())
    }

    /// Fetches the venue's open-orders snapshot for `condition_id`, used by
    /// the strategy loop to reconcile state after a User-Channel reconnect
    /// (spec.md §4.11, §5 "Reconnect and recovery").
    pub async fn get_open_orders(&self, condition_id: &str) -> Result<Vec<OpenOrderWire>, ClobClientError> {
        let path = format!("/orders?market={condition_id}");
        let this = self.clone();
        self.gateway
            .execute(GATEWAY_CATEGORY, "get_open_orders", move || {
                let this = this.clone();
                let path = path.clone();
                async move { this.get(&path).await }
            })
            .await
    }

    /// Single-order status read (spec.md §6 "a follow-up order read"),
    /// issued after a `"delayed"`-status response's post-wait elapses.
    pub async fn get_order_status(&self, order_id: &str) -> Result<OrderResponse, ClobClientError> {
        let path = format!("/data/order/{order_id}");
        let this = self.clone();
        self.gateway
            .execute(GATEWAY_CATEGORY, "get_order_status", move || {
                let this = this.clone();
                let path = path.clone();
                async move { this.get(&path).await }
            })
            .await
    }

    /// `fetch_fresh_price` support and game-end/probe confirmation (spec.md
    /// §4.6, §4.7): fetches the current order book directly over HTTP,
    /// bypassing the (possibly stale) WS cache, bounded to a 5-second
    /// timeout.
    pub async fn fetch_order_book(&self, token_id: &str) -> Result<OrderBookWire, ClobClientError> {
        let path = format!("/book?token_id={token_id}");
        let this = self.clone();
        let fut = self.gateway.execute(MARKET_DATA_CATEGORY, "fetch_order_book", move || {
            let this = this.clone();
            let path = path.clone();
            async move { this.get(&path).await }
        });
        tokio::time::timeout(FRESH_PROBE_TIMEOUT, fut)
            .await
            .map_err(|_| ClobClientError::ProbeTimeout(FRESH_PROBE_TIMEOUT))?
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ClobClientError> {
        let headers = self.auth.headers("GET", path, "")?;
        let url = format!("{}{}", self.base_url, path);
        let response = self.apply_auth(self.http.get(&url), &headers).send().await?;
        Self::parse_response(response).await
    }

    async fn post<T: serde::de::DeserializeOwned>(&self, path: &str, body: &str) -> Result<T, ClobClientError> {
        let headers = self.auth.headers("POST", path, body)?;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .apply_auth(self.http.post(&url), &headers)
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn delete<T: serde::de::DeserializeOwned>(&self, path: &str, body: &str) -> Result<T, ClobClientError> {
        let headers = self.auth.headers("DELETE", path, body)?;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .apply_auth(self.http.delete(&url), &headers)
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .await?;
        Self::parse_response(response).await
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder, headers: &L2Headers) -> reqwest::RequestBuilder {
        builder
            .header("POLY_ADDRESS", &headers.address)
            .header("POLY_SIGNATURE", &headers.signature)
            .header("POLY_TIMESTAMP", &headers.timestamp)
            .header("POLY_API_KEY", &headers.api_key)
            .header("POLY_PASSPHRASE", &headers.passphrase)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, ClobClientError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ClobClientError::Http { status, body });
        }
        Ok(response.json::<T>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gw() -> Arc<RateLimitedGateway> {
        Arc::new(RateLimitedGateway::disabled())
    }

    fn creds() -> ApiCredentials {
        ApiCredentials {
            api_key: "key".to_string(),
            secret: BASE64_URL_SAFE.encode(b"secret-bytes"),
            passphrase: "pass".to_string(),
        }
    }

    #[test]
    fn l2_hmac_signature_is_deterministic_and_url_safe() {
        let auth = L2Auth { creds: creds(), address: "0xabc".to_string() };
        let s1 = auth.compute_hmac("1000", "GET", "/order", "").unwrap();
        let s2 = auth.compute_hmac("1000", "GET", "/order", "").unwrap();
        assert_eq!(s1, s2);
        assert!(!s1.contains('+') && !s1.contains('/'));
    }

    #[test]
    fn l2_hmac_differs_by_method() {
        let auth = L2Auth { creds: creds(), address: "0xabc".to_string() };
        let get_sig = auth.compute_hmac("1000", "GET", "/order", "").unwrap();
        let post_sig = auth.compute_hmac("1000", "POST", "/order", "{}").unwrap();
        assert_ne!(get_sig, post_sig);
    }

    #[tokio::test]
    async fn submit_order_posts_and_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/order"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orderID": "o-1",
                "order_id": "o-1",
                "success": true,
                "status": "matched",
            })))
            .mount(&server)
            .await;

        let client = ClobClient::new(creds(), "0xabc".to_string(), gw()).with_base_url(server.uri());
        let order = OrderRequest {
            token_id: "tok-up".to_string(),
            side: OrderSide::Buy,
            price: Decimal::new(47, 2),
            size: Decimal::new(10, 0),
            time_in_force: TimeInForce::Fak,
            signature: "0xsig".to_string(),
            salt: "1".to_string(),
        };
        let response = client.submit_order(&order).await.unwrap();
        assert!(response.success);
        assert_eq!(response.order_id.as_deref(), Some("o-1"));
    }

    #[tokio::test]
    async fn cancel_orders_with_zero_count_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"canceled": []})))
            .mount(&server)
            .await;

        let client = ClobClient::new(creds(), "0xabc".to_string(), gw()).with_base_url(server.uri());
        let count = client.cancel_orders("0xcond", Some("tok-up")).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn fetch_order_book_parses_levels() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/book"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "bids": [{"price": "0.48", "size": "10"}],
                "asks": [{"price": "0.52", "size": "5"}],
            })))
            .mount(&server)
            .await;

        let client = ClobClient::new(creds(), "0xabc".to_string(), gw()).with_base_url(server.uri());
        let book = client.fetch_order_book("tok-up").await.unwrap();
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.asks[0].price, "0.52");
    }
}
