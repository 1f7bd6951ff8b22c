//! Fakes shared by unit tests.

use crate::mautic::{
    ContactId, ContactSearch, ContactUpdate, ContactsApi, MauticError, NewContact, RemoteContact,
};
use crate::settings::{self, Settings, TaggingSource};
use crate::shop::{LineItem, Order, OrderId, OrderSource, Product, ShopError};
use crate::store::{KeyValueStore, MemoryStore};
use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, Duration, Utc};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

/// Serves `router` on an ephemeral local port and returns its base url.
pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

pub fn configured_settings(sources: &[TaggingSource]) -> Settings {
    Settings {
        base_url: "https://mautic.test".into(),
        client_id: "id".into(),
        client_secret: "secret".into(),
        order_tagging: sources.iter().copied().collect(),
        ..Settings::default()
    }
}

pub async fn store_with(settings: &Settings) -> Arc<dyn KeyValueStore> {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    settings::save(store.as_ref(), settings)
        .await
        .expect("save settings");
    store
}

#[derive(Default)]
pub struct FakeContacts {
    by_email: Mutex<HashMap<String, Vec<ContactId>>>,
    missing: Mutex<HashSet<ContactId>>,
    create_status: Mutex<Option<u16>>,
    unavailable: AtomicBool,
    pub searches: Mutex<Vec<String>>,
    pub edits: Mutex<Vec<(ContactId, ContactUpdate)>>,
    pub creates: Mutex<Vec<NewContact>>,
}

impl FakeContacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contact(self, email: &str, id: ContactId) -> Self {
        self.by_email
            .lock()
            .unwrap()
            .entry(email.to_string())
            .or_default()
            .push(id);
        self
    }

    /// Edits against `id` answer 404.
    pub fn with_missing(self, id: ContactId) -> Self {
        self.missing.lock().unwrap().insert(id);
        self
    }

    pub fn with_create_status(self, status: u16) -> Self {
        *self.create_status.lock().unwrap() = Some(status);
        self
    }

    pub fn set_unavailable(&self, value: bool) {
        self.unavailable.store(value, Ordering::SeqCst);
    }

    pub fn search_count(&self) -> usize {
        self.searches.lock().unwrap().len()
    }

    pub fn edit_count(&self) -> usize {
        self.edits.lock().unwrap().len()
    }

    fn check(&self) -> Result<(), MauticError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MauticError::Token("token endpoint down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContactsApi for FakeContacts {
    async fn ready(&self) -> Result<(), MauticError> {
        self.check()
    }

    async fn search_contacts(&self, email: &str) -> Result<ContactSearch, MauticError> {
        self.check()?;
        self.searches.lock().unwrap().push(email.to_string());
        let ids = self
            .by_email
            .lock()
            .unwrap()
            .get(email)
            .cloned()
            .unwrap_or_default();
        Ok(ContactSearch {
            total: ids.len() as u64,
            contacts: ids
                .into_iter()
                .map(|id| RemoteContact {
                    id,
                    email: Some(email.to_string()),
                    ..RemoteContact::default()
                })
                .collect(),
        })
    }

    async fn edit_contact(&self, id: ContactId, update: &ContactUpdate) -> Result<(), MauticError> {
        self.check()?;
        self.edits.lock().unwrap().push((id, update.clone()));
        if self.missing.lock().unwrap().contains(&id) {
            return Err(MauticError::NotFound);
        }
        Ok(())
    }

    async fn create_contact(&self, contact: &NewContact) -> Result<u16, MauticError> {
        self.check()?;
        self.creates.lock().unwrap().push(contact.clone());
        let status = self.create_status.lock().unwrap().unwrap_or(201);
        if status == 200 || status == 201 {
            Ok(status)
        } else {
            Err(MauticError::Status(status))
        }
    }
}

#[derive(Default)]
pub struct MemoryOrders {
    orders: Mutex<BTreeMap<OrderId, Order>>,
    pub marked: Mutex<Vec<OrderId>>,
}

impl MemoryOrders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, order: Order) {
        self.orders.lock().unwrap().insert(order.id, order);
    }

    /// `count` completed orders with ascending creation times in the past.
    pub fn with_completed(count: u64) -> Self {
        let orders = Self::new();
        let base = Utc::now() - Duration::days(30);
        for id in 1..=count {
            orders.insert(Order {
                created_at: Some(base + Duration::minutes(id as i64)),
                ..order_with_items(id, &format!("buyer{id}@example.com"), None, vec![product_item(
                    id,
                    &["Gear"],
                    &[],
                )])
            });
        }
        orders
    }

    pub fn get(&self, id: OrderId) -> Option<Order> {
        self.orders.lock().unwrap().get(&id).cloned()
    }
}

#[async_trait]
impl OrderSource for MemoryOrders {
    async fn order(&self, id: OrderId) -> Result<Option<Order>, ShopError> {
        Ok(self.get(id))
    }

    async fn count_completed(&self) -> Result<u64, ShopError> {
        Ok(self
            .orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.completed_at.is_some())
            .count() as u64)
    }

    async fn completed_before(
        &self,
        before: DateTime<Utc>,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<OrderId>, ShopError> {
        let guard = self.orders.lock().unwrap();
        let mut eligible: Vec<&Order> = guard
            .values()
            .filter(|o| o.completed_at.is_some())
            .filter(|o| o.created_at.is_some_and(|at| at < before))
            .collect();
        eligible.sort_by_key(|o| (o.created_at, o.id));
        Ok(eligible
            .into_iter()
            .skip(offset as usize)
            .take(limit)
            .map(|o| o.id)
            .collect())
    }

    async fn mark_tagged(&self, id: OrderId) -> Result<(), ShopError> {
        if let Some(order) = self.orders.lock().unwrap().get_mut(&id) {
            order.is_tagged = true;
        }
        self.marked.lock().unwrap().push(id);
        Ok(())
    }
}

pub fn product_item(id: u64, categories: &[&str], brands: &[&str]) -> LineItem {
    LineItem {
        id,
        product: Some(Product {
            id: 1000 + id,
            name: format!("Product {id}"),
            categories: categories.iter().map(|s| s.to_string()).collect(),
            brands: brands.iter().map(|s| s.to_string()).collect(),
        }),
    }
}

pub fn order_with_items(
    id: OrderId,
    email: &str,
    user_id: Option<u64>,
    items: Vec<LineItem>,
) -> Order {
    let now = Utc::now() - Duration::days(1);
    Order {
        id,
        created_at: Some(now),
        completed_at: Some(now),
        billing_email: email.to_string(),
        billing_first_name: "Ann".into(),
        billing_last_name: "Lee".into(),
        user_id,
        items,
        is_tagged: false,
    }
}
