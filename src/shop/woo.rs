use crate::http::build_client;
use crate::models::is_truthy;
use crate::shop::{LineItem, MAX_PAGE_SIZE, Order, OrderId, OrderSource, Product, ShopError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::warn;

pub const TAGGED_META_KEY: &str = "_is_mautic_tagged";

#[derive(Debug, Deserialize)]
struct WooOrder {
    id: u64,
    #[serde(default)]
    date_created_gmt: Option<String>,
    #[serde(default)]
    date_completed_gmt: Option<String>,
    #[serde(default)]
    customer_id: u64,
    #[serde(default)]
    billing: WooBilling,
    #[serde(default)]
    line_items: Vec<WooLineItem>,
    #[serde(default)]
    meta_data: Vec<WooMeta>,
}

#[derive(Debug, Default, Deserialize)]
struct WooBilling {
    #[serde(default)]
    email: String,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
}

#[derive(Debug, Deserialize)]
struct WooLineItem {
    id: u64,
    #[serde(default)]
    product_id: u64,
}

#[derive(Debug, Deserialize)]
struct WooMeta {
    key: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct WooProduct {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    categories: Vec<WooTerm>,
    #[serde(default)]
    brands: Vec<WooTerm>,
}

#[derive(Debug, Deserialize)]
struct WooTerm {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WooOrderRef {
    id: u64,
}

fn parse_gmt(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|value| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").ok())
        .map(|naive| naive.and_utc())
}

/// WooCommerce REST (`/wp-json/wc/v3`) order source.
#[derive(Clone)]
pub struct WooClient {
    base_url: String,
    consumer_key: String,
    consumer_secret: String,
    http: Client,
}

impl WooClient {
    pub fn new(
        base_url: impl Into<String>,
        consumer_key: impl Into<String>,
        consumer_secret: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            http: build_client(),
        }
    }

    /// `None` unless the shop url and API keys are all present.
    pub fn from_env() -> Option<Self> {
        use crate::config::{WOO_BASE_URL, WOO_CONSUMER_KEY, WOO_CONSUMER_SECRET};
        if WOO_BASE_URL.is_empty() || WOO_CONSUMER_KEY.is_empty() || WOO_CONSUMER_SECRET.is_empty()
        {
            return None;
        }
        Some(Self::new(
            WOO_BASE_URL.as_str(),
            WOO_CONSUMER_KEY.as_str(),
            WOO_CONSUMER_SECRET.as_str(),
        ))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/wp-json/wc/v3/{}", self.base_url, path)
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Response, ShopError> {
        self.http
            .get(self.url(path))
            .basic_auth(&self.consumer_key, Some(&self.consumer_secret))
            .query(query)
            .send()
            .await
            .map_err(|err| ShopError::Request(err.to_string()))
    }

    async fn product(&self, id: u64) -> Result<Option<Product>, ShopError> {
        let response = self.get(&format!("products/{id}"), &[]).await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => return Err(ShopError::Status(status.as_u16())),
            _ => {}
        }
        let product: WooProduct = response
            .json()
            .await
            .map_err(|err| ShopError::Deserialize(err.to_string()))?;
        Ok(Some(Product {
            id: product.id,
            name: product.name,
            categories: product.categories.into_iter().map(|t| t.name).collect(),
            brands: product.brands.into_iter().map(|t| t.name).collect(),
        }))
    }
}

#[async_trait]
impl OrderSource for WooClient {
    async fn order(&self, id: OrderId) -> Result<Option<Order>, ShopError> {
        let response = self.get(&format!("orders/{id}"), &[]).await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => return Err(ShopError::Status(status.as_u16())),
            _ => {}
        }
        let raw: WooOrder = response
            .json()
            .await
            .map_err(|err| ShopError::Deserialize(err.to_string()))?;

        let mut products: HashMap<u64, Option<Product>> = HashMap::new();
        let mut items = Vec::with_capacity(raw.line_items.len());
        for item in &raw.line_items {
            let product = if item.product_id == 0 {
                None
            } else if let Some(cached) = products.get(&item.product_id) {
                cached.clone()
            } else {
                // Only a deleted product reads as `None`; anything else fails the order.
                let fetched = self.product(item.product_id).await.inspect_err(|err| {
                    warn!(
                        target = "mautic_sync.shop",
                        order_id = id,
                        product_id = item.product_id,
                        error = %err,
                        "product lookup failed"
                    );
                })?;
                products.insert(item.product_id, fetched.clone());
                fetched
            };
            items.push(LineItem {
                id: item.id,
                product,
            });
        }

        Ok(Some(Order {
            id: raw.id,
            created_at: parse_gmt(raw.date_created_gmt.as_deref()),
            completed_at: parse_gmt(raw.date_completed_gmt.as_deref()),
            billing_email: raw.billing.email,
            billing_first_name: raw.billing.first_name,
            billing_last_name: raw.billing.last_name,
            user_id: (raw.customer_id > 0).then_some(raw.customer_id),
            items,
            is_tagged: raw
                .meta_data
                .iter()
                .any(|meta| meta.key == TAGGED_META_KEY && is_truthy(&meta.value)),
        }))
    }

    async fn count_completed(&self) -> Result<u64, ShopError> {
        let response = self
            .get(
                "orders",
                &[
                    ("status", "completed".to_string()),
                    ("per_page", "1".to_string()),
                    ("_fields", "id".to_string()),
                ],
            )
            .await?;
        if !response.status().is_success() {
            return Err(ShopError::Status(response.status().as_u16()));
        }
        response
            .headers()
            .get("X-WP-Total")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| ShopError::Deserialize("missing X-WP-Total header".into()))
    }

    async fn completed_before(
        &self,
        before: DateTime<Utc>,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<OrderId>, ShopError> {
        let response = self
            .get(
                "orders",
                &[
                    ("status", "completed".to_string()),
                    ("before", before.format("%Y-%m-%dT%H:%M:%S").to_string()),
                    ("dates_are_gmt", "true".to_string()),
                    ("orderby", "date".to_string()),
                    ("order", "asc".to_string()),
                    ("offset", offset.to_string()),
                    ("per_page", limit.clamp(1, MAX_PAGE_SIZE).to_string()),
                    ("_fields", "id".to_string()),
                ],
            )
            .await?;
        if !response.status().is_success() {
            return Err(ShopError::Status(response.status().as_u16()));
        }
        let refs: Vec<WooOrderRef> = response
            .json()
            .await
            .map_err(|err| ShopError::Deserialize(err.to_string()))?;
        Ok(refs.into_iter().map(|r| r.id).collect())
    }

    async fn mark_tagged(&self, id: OrderId) -> Result<(), ShopError> {
        let response = self
            .http
            .put(self.url(&format!("orders/{id}")))
            .basic_auth(&self.consumer_key, Some(&self.consumer_secret))
            .json(&json!({ "meta_data": [{ "key": TAGGED_META_KEY, "value": "1" }] }))
            .send()
            .await
            .map_err(|err| ShopError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ShopError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}
