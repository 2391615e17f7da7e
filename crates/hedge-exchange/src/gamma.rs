//! Gamma API client for 15-minute market discovery (spec.md §3 "Market",
//! §4.1 "Rate-Limited Gateway" category `gamma`). Grounded on the teacher's
//! `exchange-polymarket::gamma::GammaClient`, generalized from its
//! coin-enum discovery to a plain market-slug lookup and rewired through
//! the shared `RateLimitedGateway` instead of a private `governor`
//! instance.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use hedge_core::market::{BidAsk, MarketCategory, MarketDescriptor};
use hedge_gateway::{ClassifyGatewayError, RateLimitSignal, RateLimitedGateway};
use reqwest::Client;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

pub const GAMMA_API_URL: &str = "https://gamma-api.polymarket.com";
const GATEWAY_CATEGORY: &str = "gamma";

/// Cheap to clone (`reqwest::Client`/`Arc<RateLimitedGateway>` are
/// reference-counted); cloned into the gateway-dispatched closure in
/// [`GammaClient::get`] so the produced future is `Send + 'static` and can be
/// spawned by the gateway (spec.md §4.1 cancellation-safety contract).
#[derive(Clone)]
pub struct GammaClient {
    http: Client,
    base_url: String,
    gateway: Arc<RateLimitedGateway>,
}

#[derive(Debug, thiserror::Error)]
pub enum GammaError {
    #[error("gamma api http error {status}: {body}")]
    Http { status: u16, body: String },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl ClassifyGatewayError for GammaError {
    fn rate_limit_signal(&self) -> Option<RateLimitSignal> {
        match self {
            Self::Http { status: 429, .. } => Some(RateLimitSignal { reset_after: None }),
            _ => None,
        }
    }
}

impl GammaClient {
    #[must_use]
    pub fn new(gateway: Arc<RateLimitedGateway>) -> Self {
        Self { http: Client::new(), base_url: GAMMA_API_URL.to_string(), gateway }
    }

    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Aligns `time` to the start of its 15-minute window (spec.md §3
    /// "crypto-15min"). Formula: `floor(unix / 900) * 900`.
    #[must_use]
    pub fn calculate_window_timestamp(time: DateTime<Utc>) -> i64 {
        (time.timestamp() / 900) * 900
    }

    #[must_use]
    pub fn generate_event_slug(coin_prefix: &str, window_timestamp: i64) -> String {
        format!("{coin_prefix}-updown-15m-{window_timestamp}")
    }

    async fn get<T: serde::de::DeserializeOwned + Send + 'static>(&self, path: &str) -> Result<T, GammaError> {
        let url = format!("{}{}", self.base_url, path);
        let http = self.http.clone();
        self.gateway
            .execute(GATEWAY_CATEGORY, "gamma.get", move || {
                let http = http.clone();
                let url = url.clone();
                async move {
                    let response = http.get(&url).header("Accept", "application/json").send().await?;
                    if !response.status().is_success() {
                        let status = response.status().as_u16();
                        let body = response.text().await.unwrap_or_default();
                        return Err(GammaError::Http { status, body });
                    }
                    response.json::<T>().await.map_err(GammaError::from)
                }
            })
            .await
    }

    /// Fetches the 15-minute market event for a coin prefix (`btc`, `eth`,
    /// `sol`, `xrp`) and aligns it to the window containing `time`.
    pub async fn get_15min_event(&self, coin_prefix: &str, time: DateTime<Utc>) -> Result<GammaEvent> {
        let window_timestamp = Self::calculate_window_timestamp(time);
        let slug = Self::generate_event_slug(coin_prefix, window_timestamp);
        let path = format!("/events?slug={slug}");
        let events: Vec<GammaEvent> = self.get(&path).await?;
        events.into_iter().next().ok_or_else(|| anyhow!("no event found for slug: {slug}"))
    }

    /// Returns the current 15-minute `MarketDescriptor` for `coin_prefix`,
    /// or `None` if the Gamma response lacks enough fields to build one.
    pub async fn get_current_15min_market(&self, coin_prefix: &str) -> Result<Option<MarketDescriptor>> {
        let event = self.get_15min_event(coin_prefix, Utc::now()).await?;
        Ok(event.markets.into_iter().next().and_then(|m| m.into_descriptor(coin_prefix)))
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct GammaEvent {
    pub slug: String,
    #[serde(default)]
    pub title: String,
    pub markets: Vec<GammaMarket>,
}

#[derive(Debug, serde::Deserialize)]
pub struct GammaMarket {
    #[serde(rename = "conditionId")]
    pub condition_id: String,
    #[serde(default, rename = "outcomePrices")]
    pub outcome_prices: Option<String>,
    #[serde(rename = "clobTokenIds")]
    pub clob_token_ids: String,
    #[serde(default)]
    pub question: String,
    #[serde(default, rename = "endDate")]
    pub end_date: Option<String>,
    #[serde(default, rename = "negRisk")]
    pub neg_risk: bool,
}

impl GammaMarket {
    fn token_ids(&self) -> Option<(String, String)> {
        let parsed: Vec<String> = serde_json::from_str(&self.clob_token_ids).ok()?;
        if parsed.len() != 2 {
            return None;
        }
        Some((parsed[0].clone(), parsed[1].clone()))
    }

    #[must_use]
    pub fn parse_outcome_prices(&self) -> Option<(Decimal, Decimal)> {
        let raw = self.outcome_prices.as_ref()?;
        let parsed: Vec<String> = serde_json::from_str(raw).ok()?;
        if parsed.len() != 2 {
            return None;
        }
        Some((parsed[0].parse().ok()?, parsed[1].parse().ok()?))
    }

    fn into_descriptor(self, coin_prefix: &str) -> Option<MarketDescriptor> {
        let (up_token_id, down_token_id) = self.token_ids()?;
        let end_time = self
            .end_date
            .as_deref()
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Some(MarketDescriptor {
            market_slug: format!("{coin_prefix}-updown-15m"),
            condition_id: self.condition_id,
            up_token_id,
            down_token_id,
            question: self.question,
            up_label: "UP".to_string(),
            down_label: "DOWN".to_string(),
            up_book: BidAsk::default(),
            down_book: BidAsk::default(),
            end_time,
            category: MarketCategory::crypto_15min(),
            neg_risk: self.neg_risk,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_timestamp_rounds_down_to_quarter_hour() {
        let time = Utc.with_ymd_and_hms(2026, 1, 31, 12, 7, 30).unwrap();
        let ts = GammaClient::calculate_window_timestamp(time);
        let expected = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap().timestamp();
        assert_eq!(ts, expected);
    }

    #[test]
    fn event_slug_uses_coin_prefix_and_window() {
        assert_eq!(GammaClient::generate_event_slug("btc", 1769860800), "btc-updown-15m-1769860800");
    }

    #[test]
    fn gamma_market_parses_token_ids_and_prices() {
        let market = GammaMarket {
            condition_id: "0xabc".to_string(),
            outcome_prices: Some("[\"0.53\", \"0.47\"]".to_string()),
            clob_token_ids: "[\"tok-up\", \"tok-down\"]".to_string(),
            question: "Will BTC go up?".to_string(),
            end_date: Some("2026-01-31T12:15:00Z".to_string()),
            neg_risk: false,
        };
        assert_eq!(market.parse_outcome_prices(), Some((Decimal::new(53, 2), Decimal::new(47, 2))));
        let descriptor = market.into_descriptor("btc").expect("descriptor");
        assert_eq!(descriptor.up_token_id, "tok-up");
        assert_eq!(descriptor.down_token_id, "tok-down");
    }

    #[test]
    fn gamma_market_without_token_ids_yields_no_descriptor() {
        let market = GammaMarket {
            condition_id: "0xabc".to_string(),
            outcome_prices: None,
            clob_token_ids: "not-json".to_string(),
            question: String::new(),
            end_date: None,
            neg_risk: false,
        };
        assert!(market.into_descriptor("btc").is_none());
    }
}
