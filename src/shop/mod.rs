pub mod woo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub use woo::WooClient;

pub type OrderId = u64;

/// WooCommerce rejects `per_page` above this.
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum ShopError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Product {
    pub id: u64,
    pub name: String,
    pub categories: Vec<String>,
    pub brands: Vec<String>,
}

/// A line item keeps its product only while that product still exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LineItem {
    pub id: u64,
    pub product: Option<Product>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub created_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub billing_email: String,
    pub billing_first_name: String,
    pub billing_last_name: String,
    /// `None` for guest checkouts.
    pub user_id: Option<u64>,
    pub items: Vec<LineItem>,
    pub is_tagged: bool,
}

/// Read access to the shop's orders plus the write-once tagged marker.
#[async_trait]
pub trait OrderSource: Send + Sync {
    async fn order(&self, id: OrderId) -> Result<Option<Order>, ShopError>;

    async fn count_completed(&self) -> Result<u64, ShopError>;

    /// Completed orders created before `before`, oldest first.
    async fn completed_before(
        &self,
        before: DateTime<Utc>,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<OrderId>, ShopError>;

    async fn mark_tagged(&self, id: OrderId) -> Result<(), ShopError>;
}
