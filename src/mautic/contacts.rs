use crate::http::{build_client, is_success};
use crate::mautic::{MauticError, TokenProvider};
use crate::settings::{self, Settings};
use crate::store::KeyValueStore;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DisplayFromStr, PickFirst, serde_as};
use std::sync::Arc;
use urlencoding::encode;

pub type ContactId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteContact {
    pub id: ContactId,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub tags: Vec<String>,
    pub last_active: Option<String>,
}

impl RemoteContact {
    fn from_value(id: ContactId, value: &Value) -> Self {
        let field = |name: &str| {
            value
                .pointer(&format!("/fields/all/{name}"))
                .and_then(Value::as_str)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let tags = value
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(|tag| tag.get("tag").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            id,
            email: field("email"),
            first_name: field("firstname"),
            last_name: field("lastname"),
            tags,
            last_active: value
                .get("lastActive")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

/// Result of a contact search, contacts in the order the API listed them.
#[derive(Debug, Clone, Default)]
pub struct ContactSearch {
    pub total: u64,
    pub contacts: Vec<RemoteContact>,
}

#[serde_as]
#[derive(Deserialize)]
struct SearchResponse {
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    total: u64,
    #[serde(default)]
    contacts: Value,
}

impl SearchResponse {
    fn into_search(self) -> ContactSearch {
        // An empty result arrives as `[]` rather than `{}`.
        let contacts = match self.contacts {
            Value::Object(map) => map
                .iter()
                .filter_map(|(key, value)| {
                    key.parse::<ContactId>()
                        .ok()
                        .map(|id| RemoteContact::from_value(id, value))
                })
                .collect(),
            _ => Vec::new(),
        };
        ContactSearch {
            total: self.total,
            contacts,
        }
    }
}

/// Tag/name merge sent with PATCH; Mautic appends tags rather than replacing.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContactUpdate {
    pub tags: Vec<String>,
    pub firstname: String,
    pub lastname: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewContact {
    pub email: String,
    #[serde(rename = "lastActive")]
    pub last_active: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firstname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lastname: Option<String>,
}

impl NewContact {
    pub fn now(email: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            email: email.into(),
            last_active: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            tags,
            firstname: None,
            lastname: None,
        }
    }

    /// Blank names are left out so they never overwrite remote values.
    pub fn with_names(mut self, first: &str, last: &str) -> Self {
        let clean = |v: &str| Some(v.trim().to_string()).filter(|v| !v.is_empty());
        self.firstname = clean(first);
        self.lastname = clean(last);
        self
    }
}

#[async_trait]
pub trait ContactsApi: Send + Sync {
    /// Succeeds when settings are complete and a token can be obtained.
    async fn ready(&self) -> Result<(), MauticError>;

    async fn search_contacts(&self, email: &str) -> Result<ContactSearch, MauticError>;

    /// `NotFound` when the contact no longer exists.
    async fn edit_contact(&self, id: ContactId, update: &ContactUpdate) -> Result<(), MauticError>;

    /// Returns the remote status code on 200/201.
    async fn create_contact(&self, contact: &NewContact) -> Result<u16, MauticError>;
}

#[derive(Clone)]
pub struct MauticClient {
    store: Arc<dyn KeyValueStore>,
    tokens: TokenProvider,
    http: Client,
}

impl MauticClient {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            tokens: TokenProvider::new(store.clone()),
            store,
            http: build_client(),
        }
    }

    pub fn tokens(&self) -> &TokenProvider {
        &self.tokens
    }

    async fn authorize(&self) -> Result<(Settings, String), MauticError> {
        let settings = settings::load(self.store.as_ref()).await?;
        let token = self.tokens.get_token(&settings).await?;
        Ok((settings, token))
    }
}

#[async_trait]
impl ContactsApi for MauticClient {
    async fn ready(&self) -> Result<(), MauticError> {
        self.authorize().await.map(|_| ())
    }

    async fn search_contacts(&self, email: &str) -> Result<ContactSearch, MauticError> {
        let (settings, token) = self.authorize().await?;
        let url = format!("{}/api/contacts?search={}", settings.base_url, encode(email));
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| MauticError::Request(err.to_string()))?;

        if !is_success(response.status()) {
            return Err(MauticError::Status(response.status().as_u16()));
        }

        let payload: SearchResponse = response
            .json()
            .await
            .map_err(|err| MauticError::Deserialize(err.to_string()))?;
        Ok(payload.into_search())
    }

    async fn edit_contact(&self, id: ContactId, update: &ContactUpdate) -> Result<(), MauticError> {
        let (settings, token) = self.authorize().await?;
        let url = format!("{}/api/contacts/{}/edit", settings.base_url, id);
        let response = self
            .http
            .patch(url)
            .bearer_auth(token)
            .json(update)
            .send()
            .await
            .map_err(|err| MauticError::Request(err.to_string()))?;

        match response.status() {
            status if is_success(status) => Ok(()),
            StatusCode::NOT_FOUND => Err(MauticError::NotFound),
            status => Err(MauticError::Status(status.as_u16())),
        }
    }

    async fn create_contact(&self, contact: &NewContact) -> Result<u16, MauticError> {
        let (settings, token) = self.authorize().await?;
        let url = format!("{}/api/contacts/new", settings.base_url);
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(contact)
            .send()
            .await
            .map_err(|err| MauticError::Request(err.to_string()))?;

        let status = response.status();
        if is_success(status) {
            Ok(status.as_u16())
        } else {
            Err(MauticError::Status(status.as_u16()))
        }
    }
}
