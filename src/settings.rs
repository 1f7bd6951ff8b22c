use crate::store::{self, KeyValueStore, StoreError, keys};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, env, path::Path};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutOptin {
    #[default]
    Disabled,
    Unchecked,
    Checked,
}

impl CheckoutOptin {
    pub fn from_raw(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "disabled" => Some(Self::Disabled),
            "unchecked" => Some(Self::Unchecked),
            "checked" => Some(Self::Checked),
            _ => None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaggingSource {
    Categories,
    Brands,
    Products,
}

impl TaggingSource {
    pub fn from_raw(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "categories" => Some(Self::Categories),
            "brands" => Some(Self::Brands),
            "products" => Some(Self::Products),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Categories => "categories",
            Self::Brands => "brands",
            Self::Products => "products",
        }
    }
}

/// What the tagger does when an enabled source finds no terms on an order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissingTermsPolicy {
    /// Skip the order entirely; it stays untagged.
    #[default]
    Abort,
    /// Send whatever the other sources produced.
    Partial,
}

/// Placeholder shown instead of the client secret.
pub const REDACTED: &str = "********";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub checkout_optin: CheckoutOptin,
    #[serde(default)]
    pub order_tagging: BTreeSet<TaggingSource>,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default)]
    pub missing_terms: MissingTermsPolicy,
}

impl Settings {
    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    pub fn tagging_enabled(&self) -> bool {
        !self.order_tagging.is_empty()
    }

    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.client_secret.is_empty() {
            copy.client_secret = REDACTED.into();
        }
        copy
    }

    /// Seed values from `MAUTIC_*` variables.
    pub fn update_from_env() -> SettingsUpdate {
        let var = |key: &str| env::var(key).ok().filter(|v| !v.trim().is_empty());
        SettingsUpdate {
            base_url: var("MAUTIC_BASE_URL"),
            client_id: var("MAUTIC_CLIENT_ID"),
            client_secret: var("MAUTIC_CLIENT_SECRET"),
            checkout_optin: var("MAUTIC_CHECKOUT_OPTIN"),
            order_tagging: var("MAUTIC_ORDER_TAGGING")
                .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect()),
            debug_mode: var("MAUTIC_DEBUG").map(|v| matches!(v.as_str(), "1" | "true" | "on")),
            missing_terms: None,
            resync_past_orders: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(String),
    #[error("invalid settings file: {0}")]
    Parse(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A settings submission. Absent fields keep their previous value.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub checkout_optin: Option<String>,
    #[serde(default)]
    pub order_tagging: Option<Vec<String>>,
    #[serde(default)]
    pub debug_mode: Option<bool>,
    #[serde(default)]
    pub missing_terms: Option<MissingTermsPolicy>,
    #[serde(default)]
    pub resync_past_orders: Option<bool>,
}

impl SettingsUpdate {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|err| SettingsError::Io(err.to_string()))?;
        serde_yaml::from_str(&raw).map_err(|err| SettingsError::Parse(err.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct Sanitized {
    pub settings: Settings,
    pub warnings: Vec<String>,
    pub resync_requested: bool,
}

pub fn sanitize(update: SettingsUpdate, previous: &Settings) -> Sanitized {
    let mut settings = previous.clone();
    let mut warnings = Vec::new();

    if let Some(id) = update.client_id.map(|v| clean_text(&v)) {
        settings.client_id = id;
    }
    if let Some(secret) = update
        .client_secret
        .map(|v| clean_text(&v))
        .filter(|v| v != REDACTED)
    {
        settings.client_secret = secret;
    }
    if let Some(raw) = update.base_url {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            settings.base_url = String::new();
        } else {
            match validate_base_url(trimmed) {
                Some(url) => settings.base_url = url,
                None => warnings.push(format!("Invalid URL: {trimmed}")),
            }
        }
    }
    if let Some(raw) = update.checkout_optin {
        settings.checkout_optin = CheckoutOptin::from_raw(&raw).unwrap_or_default();
    }
    if let Some(sources) = update.order_tagging {
        settings.order_tagging = sources
            .iter()
            .filter_map(|raw| {
                let parsed = TaggingSource::from_raw(raw);
                if parsed.is_none() && !raw.trim().is_empty() {
                    warnings.push(format!("Unknown order tagging source: {}", raw.trim()));
                }
                parsed
            })
            .collect();
    }
    if let Some(debug) = update.debug_mode {
        settings.debug_mode = debug;
    }
    if let Some(policy) = update.missing_terms {
        settings.missing_terms = policy;
    }

    Sanitized {
        settings,
        warnings,
        resync_requested: update.resync_past_orders.unwrap_or(false),
    }
}

fn validate_base_url(raw: &str) -> Option<String> {
    let url = reqwest::Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    Some(url.as_str().trim_end_matches('/').to_string())
}

fn clean_text(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

pub async fn load(store: &dyn KeyValueStore) -> Result<Settings, StoreError> {
    Ok(store::get_json(store, keys::SETTINGS)
        .await?
        .unwrap_or_default())
}

pub async fn save(store: &dyn KeyValueStore, settings: &Settings) -> Result<(), StoreError> {
    store::set_json(store, keys::SETTINGS, settings, None).await
}

/// First-boot seeding: stored settings win; otherwise the YAML file, then env.
pub async fn bootstrap(
    store: &dyn KeyValueStore,
    file: Option<&str>,
) -> Result<Settings, SettingsError> {
    if let Some(existing) = store::get_json::<Settings>(store, keys::SETTINGS).await? {
        return Ok(existing);
    }
    let update = match file {
        Some(path) => {
            info!(target = "mautic_sync.settings", path, "seeding settings from file");
            SettingsUpdate::from_yaml_file(path)?
        }
        None => Settings::update_from_env(),
    };
    let sanitized = sanitize(update, &Settings::default());
    for warning in &sanitized.warnings {
        warn!(target = "mautic_sync.settings", "{warning}");
    }
    save(store, &sanitized.settings).await?;
    Ok(sanitized.settings)
}

/// Routes under the pre-release namespaces stay reachable for sites that
/// still carry settings from that version.
pub async fn has_legacy_settings(store: &dyn KeyValueStore) -> bool {
    matches!(store.get(keys::LEGACY_SETTINGS).await, Ok(Some(_)))
}
