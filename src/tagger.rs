use crate::mautic::{ContactId, ContactUpdate, ContactsApi, MauticError};
use crate::resolver::ContactResolver;
use crate::settings::{self, MissingTermsPolicy, TaggingSource};
use crate::shop::{Order, OrderId, OrderSource};
use crate::store::KeyValueStore;
use serde::Serialize;
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TagOutcome {
    Disabled,
    OrderUnavailable,
    AlreadyTagged,
    ContactUnresolved,
    NoTerms {
        source: TaggingSource,
    },
    Tagged {
        contact_id: ContactId,
        tags: Vec<String>,
    },
    /// The cached contact answered 404; `replacement` is the re-resolved id.
    ContactGone {
        previous: ContactId,
        replacement: Option<ContactId>,
    },
    Failed {
        reason: String,
    },
}

impl TagOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::OrderUnavailable => "order_unavailable",
            Self::AlreadyTagged => "already_tagged",
            Self::ContactUnresolved => "contact_unresolved",
            Self::NoTerms { .. } => "no_terms",
            Self::Tagged { .. } => "tagged",
            Self::ContactGone { .. } => "contact_gone",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Collect the terms one source contributes across all line items.
pub fn terms_for(order: &Order, source: TaggingSource) -> Vec<String> {
    let mut terms = Vec::new();
    for item in &order.items {
        let Some(product) = item.product.as_ref() else {
            warn!(
                target = "mautic_sync.tagger",
                order_id = order.id,
                item_id = item.id,
                "product not found for item"
            );
            continue;
        };
        let found: Vec<&String> = match source {
            TaggingSource::Categories => product.categories.iter().collect(),
            TaggingSource::Brands => product.brands.iter().collect(),
            TaggingSource::Products => vec![&product.name],
        };
        if found.is_empty() {
            debug!(
                target = "mautic_sync.tagger",
                order_id = order.id,
                item_id = item.id,
                source = source.as_str(),
                "item has no terms"
            );
        }
        terms.extend(
            found
                .into_iter()
                .map(|term| term.trim().to_string())
                .filter(|term| !term.is_empty()),
        );
    }
    terms
}

/// Union of the enabled sources. `Err` names the source that came up empty
/// when the policy forbids a partial tag set.
pub fn build_tags(
    order: &Order,
    sources: &BTreeSet<TaggingSource>,
    policy: MissingTermsPolicy,
) -> Result<Vec<String>, TaggingSource> {
    let mut tags = BTreeSet::new();
    let mut first_empty = None;
    for source in sources {
        let terms = terms_for(order, *source);
        if terms.is_empty() {
            debug!(
                target = "mautic_sync.tagger",
                order_id = order.id,
                source = source.as_str(),
                "no terms detected on order"
            );
            if policy == MissingTermsPolicy::Abort {
                return Err(*source);
            }
            first_empty.get_or_insert(*source);
            continue;
        }
        tags.extend(terms);
    }
    match (tags.is_empty(), first_empty) {
        (true, Some(source)) => Err(source),
        _ => Ok(tags.into_iter().collect()),
    }
}

#[derive(Clone)]
pub struct OrderTagger {
    orders: Arc<dyn OrderSource>,
    api: Arc<dyn ContactsApi>,
    resolver: ContactResolver,
    store: Arc<dyn KeyValueStore>,
}

impl OrderTagger {
    pub fn new(
        orders: Arc<dyn OrderSource>,
        api: Arc<dyn ContactsApi>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            resolver: ContactResolver::new(api.clone(), store.clone()),
            orders,
            api,
            store,
        }
    }

    pub fn orders(&self) -> &Arc<dyn OrderSource> {
        &self.orders
    }

    pub fn api(&self) -> &Arc<dyn ContactsApi> {
        &self.api
    }

    /// Tag the buyer of one order; an order is tagged at most once.
    pub async fn tag(&self, order_id: OrderId) -> TagOutcome {
        let outcome = self.tag_inner(order_id).await;
        crate::metrics::order_outcome(outcome.label());
        outcome
    }

    async fn tag_inner(&self, order_id: OrderId) -> TagOutcome {
        let settings = match settings::load(self.store.as_ref()).await {
            Ok(settings) => settings,
            Err(err) => {
                error!(target = "mautic_sync.tagger", order_id, error = %err, "settings unavailable");
                return TagOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };
        if !settings.tagging_enabled() {
            debug!(target = "mautic_sync.tagger", order_id, "order tagging disabled");
            return TagOutcome::Disabled;
        }

        let order = match self.orders.order(order_id).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                error!(target = "mautic_sync.tagger", order_id, "failed to tag order: unable to retrieve order");
                return TagOutcome::OrderUnavailable;
            }
            Err(err) => {
                error!(target = "mautic_sync.tagger", order_id, error = %err, "failed to tag order: unable to retrieve order");
                return TagOutcome::OrderUnavailable;
            }
        };

        if order.is_tagged {
            debug!(target = "mautic_sync.tagger", order_id, "order was already tagged");
            return TagOutcome::AlreadyTagged;
        }

        let Some(contact_id) = self
            .resolver
            .resolve(&order.billing_email, order.user_id, true)
            .await
        else {
            debug!(
                target = "mautic_sync.tagger",
                order_id,
                email = %order.billing_email,
                "unable to get contact id, buyer may not be subscribed"
            );
            return TagOutcome::ContactUnresolved;
        };

        let tags = match build_tags(&order, &settings.order_tagging, settings.missing_terms) {
            Ok(tags) => tags,
            Err(source) => return TagOutcome::NoTerms { source },
        };

        let update = ContactUpdate {
            tags: tags.clone(),
            firstname: order.billing_first_name.trim().to_string(),
            lastname: order.billing_last_name.trim().to_string(),
        };
        debug!(target = "mautic_sync.tagger", order_id, contact_id, ?tags, "updating contact tags");

        match self.api.edit_contact(contact_id, &update).await {
            Ok(()) => {
                info!(target = "mautic_sync.tagger", order_id, contact_id, "contact tags updated");
                if let Err(err) = self.orders.mark_tagged(order_id).await {
                    // Tags are merged remotely, so a later retry is harmless.
                    error!(target = "mautic_sync.tagger", order_id, error = %err, "failed to persist tagged marker");
                }
                TagOutcome::Tagged { contact_id, tags }
            }
            Err(MauticError::NotFound) => {
                debug!(
                    target = "mautic_sync.tagger",
                    order_id,
                    contact_id,
                    "cached contact id is no longer valid, re-resolving"
                );
                if let Some(user_id) = order.user_id {
                    self.resolver.invalidate(user_id).await;
                }
                let replacement = self
                    .resolver
                    .resolve(&order.billing_email, order.user_id, false)
                    .await;
                match replacement {
                    Some(new_id) => debug!(
                        target = "mautic_sync.tagger",
                        previous = contact_id,
                        replacement = new_id,
                        "updated contact id"
                    ),
                    None => error!(
                        target = "mautic_sync.tagger",
                        order_id,
                        user_id = ?order.user_id,
                        "failed to get new contact id, buyer may no longer be a contact"
                    ),
                }
                TagOutcome::ContactGone {
                    previous: contact_id,
                    replacement,
                }
            }
            Err(err) => {
                error!(target = "mautic_sync.tagger", order_id, contact_id, error = %err, "contact update failed");
                TagOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }
}
