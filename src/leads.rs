use crate::mautic::{ContactsApi, MauticError, NewContact};
use std::sync::Arc;
use tracing::{error, info};

/// Tag applied to contacts who opt in at checkout.
pub const CHECKOUT_TAG: &str = "WooCommerce";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadOutcome {
    Added { status: u16 },
    Rejected { status: u16 },
    Unavailable { reason: String },
}

#[derive(Clone)]
pub struct LeadService {
    api: Arc<dyn ContactsApi>,
}

impl LeadService {
    pub fn new(api: Arc<dyn ContactsApi>) -> Self {
        Self { api }
    }

    /// Create (or let Mautic merge by email) a contact with `tags`.
    pub async fn add_lead(&self, source: &'static str, email: &str, tags: Vec<String>) -> LeadOutcome {
        let tags: Vec<String> = tags.iter().filter_map(|tag| sanitize_text(tag)).collect();
        self.submit(source, NewContact::now(email, tags)).await
    }

    /// Checkout opt-in: shop tag plus the billing names.
    pub async fn add_checkout_lead(&self, email: &str, first: &str, last: &str) -> LeadOutcome {
        let contact = NewContact::now(email, vec![CHECKOUT_TAG.to_string()]).with_names(first, last);
        self.submit("checkout", contact).await
    }

    async fn submit(&self, source: &'static str, contact: NewContact) -> LeadOutcome {
        let email = contact.email.as_str();
        let outcome = match self.api.create_contact(&contact).await {
            Ok(status) => {
                info!(target = "mautic_sync.leads", source, email, "added lead");
                LeadOutcome::Added { status }
            }
            Err(MauticError::Status(status)) => {
                error!(target = "mautic_sync.leads", source, email, status, "failed to add lead");
                LeadOutcome::Rejected { status }
            }
            Err(err) => {
                error!(target = "mautic_sync.leads", source, email, error = %err, "failed to add lead");
                LeadOutcome::Unavailable {
                    reason: err.to_string(),
                }
            }
        };
        crate::metrics::lead_result(
            source,
            match outcome {
                LeadOutcome::Added { .. } => "added",
                LeadOutcome::Rejected { .. } => "rejected",
                LeadOutcome::Unavailable { .. } => "unavailable",
            },
        );
        outcome
    }
}

/// Trimmed address when it looks deliverable, `None` otherwise.
pub fn sanitize_email(raw: &str) -> Option<String> {
    let email = raw.trim();
    if email.len() < 6 || email.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return None;
    }
    let (local, domain) = email.split_once('@')?;
    if local.is_empty() || domain.contains('@') {
        return None;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2
        || labels
            .iter()
            .any(|label| label.is_empty() || label.starts_with('-') || label.ends_with('-'))
    {
        return None;
    }
    Some(email.to_string())
}

/// Drops markup and control characters and collapses whitespace.
pub fn sanitize_text(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut in_tag = false;
    for c in raw.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if in_tag => {}
            c if c.is_control() || c.is_whitespace() => out.push(' '),
            c => out.push(c),
        }
    }
    let collapsed = out.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeContacts;

    #[test]
    fn email_validation() {
        assert_eq!(sanitize_email("  a@b.com "), Some("a@b.com".into()));
        assert_eq!(sanitize_email(""), None);
        assert_eq!(sanitize_email("no-at-sign.com"), None);
        assert_eq!(sanitize_email("a@b"), None);
        assert_eq!(sanitize_email("a b@c.com"), None);
        assert_eq!(sanitize_email("a@@c.com"), None);
    }

    #[test]
    fn text_sanitizing() {
        assert_eq!(sanitize_text(" launch <b>day</b>\n"), Some("launch day".into()));
        assert_eq!(sanitize_text("<script></script>"), None);
        assert_eq!(sanitize_text("spring\tsale"), Some("spring sale".into()));
    }

    #[tokio::test]
    async fn add_lead_sends_clean_tags() {
        let api = Arc::new(FakeContacts::new());
        let service = LeadService::new(api.clone());
        let outcome = service
            .add_lead("form", "a@b.com", vec!["launch".into(), "  ".into()])
            .await;
        assert_eq!(outcome, LeadOutcome::Added { status: 201 });
        let creates = api.creates.lock().unwrap();
        assert_eq!(creates[0].tags, vec!["launch"]);
        assert_eq!(creates[0].email, "a@b.com");
    }

    #[tokio::test]
    async fn remote_status_and_outage_are_reported() {
        let api = Arc::new(FakeContacts::new().with_create_status(500));
        let service = LeadService::new(api.clone());
        assert_eq!(
            service.add_lead("form", "a@b.com", vec![]).await,
            LeadOutcome::Rejected { status: 500 }
        );
        api.set_unavailable(true);
        assert!(matches!(
            service.add_checkout_lead("a@b.com", "", "").await,
            LeadOutcome::Unavailable { .. }
        ));
    }

    #[tokio::test]
    async fn checkout_leads_carry_shop_tag() {
        let api = Arc::new(FakeContacts::new());
        let service = LeadService::new(api.clone());
        service.add_checkout_lead("a@b.com", " Ann ", "").await;
        let creates = api.creates.lock().unwrap();
        assert_eq!(creates[0].tags, vec![CHECKOUT_TAG]);
        assert_eq!(creates[0].firstname.as_deref(), Some("Ann"));
        assert_eq!(creates[0].lastname, None);
    }
}
