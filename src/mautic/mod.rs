pub mod auth;
pub mod contacts;

use crate::store::StoreError;
use thiserror::Error;

pub use auth::TokenProvider;
pub use contacts::{
    ContactId, ContactSearch, ContactUpdate, ContactsApi, MauticClient, NewContact, RemoteContact,
};

#[derive(Debug, Error)]
pub enum MauticError {
    #[error("mautic base url or credentials are not configured")]
    Unconfigured,
    #[error("access token unavailable: {0}")]
    Token(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("contact not found")]
    NotFound,
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
