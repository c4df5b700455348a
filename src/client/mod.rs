//! Elasticsearch API client and authentication.
//!
//! This module provides the [`ElasticsearchClient`] used by the document
//! store, along with authentication types ([`Auth`], [`AuthType`]) and the
//! [`CredentialRef`] that job files use to name secrets.

mod auth;
mod elasticsearch;

pub use auth::{Auth, AuthType, CredentialRef};
pub use elasticsearch::{ElasticsearchClient, is_not_found, json_body};
