//! Order API client. Upstream returns snake_case JSON with a lowercase status, float money
//! and nullable dates; [`Order`] is the normalized record.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{AdapterError, HttpUpstream, OrderId};

/// Amount in cents. Displays as `$149.99`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Money {
    pub cents: i64,
}

impl Money {
    pub fn from_major(amount: f64) -> Self {
        Self {
            cents: (amount * 100.0).round() as i64,
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.cents < 0 { "-" } else { "" };
        let abs = self.cents.unsigned_abs();
        write!(f, "{}${}.{:02}", sign, abs / 100, abs % 100)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderItem {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub order_id: String,
    /// Display form, e.g. "Shipped".
    pub status: String,
    pub items: Vec<OrderItem>,
    pub total: Money,
    pub order_date: Option<NaiveDate>,
    pub shipping_date: Option<NaiveDate>,
    pub delivery_date: Option<NaiveDate>,
}

#[async_trait]
pub trait OrderApi: Send + Sync {
    async fn get_order(&self, id: &OrderId) -> Result<Order, AdapterError>;
}

#[derive(Debug, Clone, Deserialize)]
struct RawItem {
    product_id: String,
    #[serde(default = "one")]
    quantity: u32,
    #[serde(default)]
    price: f64,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
struct RawOrder {
    order_id: String,
    status: String,
    #[serde(default)]
    items: Vec<RawItem>,
    total: Option<f64>,
    order_date: Option<String>,
    shipping_date: Option<String>,
    delivery_date: Option<String>,
}

/// "shipped" → "Shipped", "out_for_delivery" → "Out for delivery".
pub(super) fn display_status(raw: &str) -> String {
    let spaced = raw.trim().replace(['_', '-'], " ").to_lowercase();
    let mut chars = spaced.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => "Unknown".to_string(),
    }
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp; anything else is treated as absent.
pub(super) fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    let s = raw?.trim();
    if s.is_empty() {
        return None;
    }
    let day = s.split('T').next().unwrap_or(s);
    match NaiveDate::parse_from_str(day, "%Y-%m-%d") {
        Ok(d) => Some(d),
        Err(_) => {
            log::debug!("ignoring unparseable upstream date {:?}", s);
            None
        }
    }
}

impl RawOrder {
    fn normalize(self) -> Order {
        let items: Vec<OrderItem> = self
            .items
            .into_iter()
            .map(|i| OrderItem {
                product_id: i.product_id,
                quantity: i.quantity,
                unit_price: Money::from_major(i.price),
            })
            .collect();
        // Some upstream records omit the total; derive it from the line items.
        let total = match self.total {
            Some(t) => Money::from_major(t),
            None => Money {
                cents: items.iter().map(|i| i.unit_price.cents * i.quantity as i64).sum(),
            },
        };
        Order {
            order_id: self.order_id.trim().to_ascii_uppercase(),
            status: display_status(&self.status),
            items,
            total,
            order_date: parse_date(self.order_date.as_deref()),
            shipping_date: parse_date(self.shipping_date.as_deref()),
            delivery_date: parse_date(self.delivery_date.as_deref()),
        }
    }
}

/// Order API over a fixture map (`{ "ORD-12345": { ... } }`). Counts lookups.
pub struct StubOrderApi {
    orders: HashMap<String, RawOrder>,
    calls: AtomicUsize,
}

impl StubOrderApi {
    pub fn from_json(json: &str) -> Result<Self> {
        let orders: HashMap<String, RawOrder> = serde_json::from_str(json)?;
        Ok(Self {
            orders: orders
                .into_iter()
                .map(|(k, v)| (k.to_ascii_uppercase(), v))
                .collect(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading order fixtures {}", path.display()))?;
        Self::from_json(&s).with_context(|| format!("parsing order fixtures {}", path.display()))
    }

    /// Number of `get_order` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderApi for StubOrderApi {
    async fn get_order(&self, id: &OrderId) -> Result<Order, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.orders
            .get(id.as_str())
            .cloned()
            .map(RawOrder::normalize)
            .ok_or_else(|| AdapterError::NotFound(format!("order {}", id)))
    }
}

/// Live Order API: `GET {base}/orders/{id}`.
pub struct HttpOrderApi {
    upstream: HttpUpstream,
}

impl HttpOrderApi {
    pub fn new(upstream: HttpUpstream) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl OrderApi for HttpOrderApi {
    async fn get_order(&self, id: &OrderId) -> Result<Order, AdapterError> {
        let what = format!("order {}", id);
        let raw: RawOrder = self
            .upstream
            .get_json(&format!("orders/{}", id), &what)
            .await?;
        Ok(raw.normalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "ORD-12345": {
            "order_id": "ORD-12345", "status": "shipped",
            "items": [{ "product_id": "cm-pro", "quantity": 1, "price": 149.99 }],
            "total": 149.99, "order_date": "2023-09-10", "shipping_date": "2023-09-12T08:00:00Z",
            "delivery_date": null
        },
        "ORD-9999": {
            "order_id": "ord-9999", "status": "out_for_delivery",
            "items": [{ "product_id": "a", "quantity": 2, "price": 10.01 }]
        }
    }"#;

    #[test]
    fn money_formats_with_two_decimals() {
        assert_eq!(Money::from_major(149.99).to_string(), "$149.99");
        assert_eq!(Money::from_major(0.5).to_string(), "$0.50");
        assert_eq!(Money { cents: -250 }.to_string(), "-$2.50");
    }

    #[tokio::test]
    async fn stub_normalizes_status_total_and_dates() {
        let api = StubOrderApi::from_json(FIXTURE).unwrap();
        let order = api.get_order(&OrderId::parse("ORD-12345").unwrap()).await.unwrap();
        assert_eq!(order.status, "Shipped");
        assert_eq!(order.total.to_string(), "$149.99");
        assert_eq!(order.shipping_date, NaiveDate::from_ymd_opt(2023, 9, 12));
        assert_eq!(order.delivery_date, None);
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn missing_total_is_derived_from_items() {
        let api = StubOrderApi::from_json(FIXTURE).unwrap();
        let order = api.get_order(&OrderId::parse("ORD-9999").unwrap()).await.unwrap();
        assert_eq!(order.order_id, "ORD-9999");
        assert_eq!(order.status, "Out for delivery");
        assert_eq!(order.total.to_string(), "$20.02");
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let api = StubOrderApi::from_json(FIXTURE).unwrap();
        let err = api.get_order(&OrderId::parse("ORD-00000").unwrap()).await.unwrap_err();
        assert!(matches!(err, AdapterError::NotFound(_)));
    }
}
