use crate::mautic::{ContactId, ContactsApi};
use crate::store::{KeyValueStore, keys};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Maps a local user (or a bare email) to a Mautic contact id, caching the
/// answer per user.
#[derive(Clone)]
pub struct ContactResolver {
    api: Arc<dyn ContactsApi>,
    store: Arc<dyn KeyValueStore>,
}

impl ContactResolver {
    pub fn new(api: Arc<dyn ContactsApi>, store: Arc<dyn KeyValueStore>) -> Self {
        Self { api, store }
    }

    pub async fn resolve(
        &self,
        email: &str,
        user_id: Option<u64>,
        cache_enabled: bool,
    ) -> Option<ContactId> {
        if cache_enabled
            && let Some(user_id) = user_id
            && let Some(cached) = self.cached(user_id).await
        {
            debug!(
                target = "mautic_sync.resolver",
                user_id,
                contact_id = cached,
                "cached contact id found"
            );
            return Some(cached);
        }

        if email.trim().is_empty() {
            debug!(target = "mautic_sync.resolver", "no email to search for");
            return None;
        }

        debug!(target = "mautic_sync.resolver", email, "searching contact");
        let search = match self.api.search_contacts(email).await {
            Ok(search) => search,
            Err(err) => {
                error!(
                    target = "mautic_sync.resolver",
                    email,
                    error = %err,
                    "failed to get contact id"
                );
                return None;
            }
        };

        if search.total == 0 {
            debug!(
                target = "mautic_sync.resolver",
                email, "no contact found, they may not be subscribed"
            );
            return None;
        }

        // Whatever the API lists first wins; the API documents no ordering.
        let Some(contact) = search.contacts.first() else {
            warn!(
                target = "mautic_sync.resolver",
                email,
                total = search.total,
                "search reported matches but listed no contacts"
            );
            return None;
        };

        debug!(
            target = "mautic_sync.resolver",
            email,
            total = search.total,
            contact_id = contact.id,
            contact_email = ?contact.email,
            first_name = ?contact.first_name,
            last_name = ?contact.last_name,
            last_active = ?contact.last_active,
            existing_tags = contact.tags.len(),
            "contact found"
        );
        if let Some(user_id) = user_id {
            debug!(
                target = "mautic_sync.resolver",
                user_id,
                contact_id = contact.id,
                "caching contact id"
            );
            if let Err(err) = self
                .store
                .set(&keys::contact_id(user_id), &contact.id.to_string(), None)
                .await
            {
                warn!(target = "mautic_sync.resolver", user_id, error = %err, "failed to cache contact id");
            }
        }
        Some(contact.id)
    }

    pub async fn invalidate(&self, user_id: u64) {
        if let Err(err) = self.store.delete(&keys::contact_id(user_id)).await {
            warn!(target = "mautic_sync.resolver", user_id, error = %err, "failed to drop cached contact id");
        }
    }

    async fn cached(&self, user_id: u64) -> Option<ContactId> {
        match self.store.get(&keys::contact_id(user_id)).await {
            Ok(value) => value.and_then(|raw| raw.trim().parse::<ContactId>().ok()),
            Err(err) => {
                warn!(target = "mautic_sync.resolver", user_id, error = %err, "contact cache unavailable");
                None
            }
        }
    }
}
