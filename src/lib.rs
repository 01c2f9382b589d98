//! Authenticated Jira Cloud and Bitbucket Cloud clients.
//!
//! [`ClientManager`] caches one client per provider, refreshing OAuth
//! credentials through a [`TokenRefresher`] and persisting them in an
//! [`AuthStore`].

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod manager;

pub use auth::{AuthInfo, AuthProvider, AuthStore, TokenRefresher};
pub use client::{BitbucketClient, JiraClient, ProviderClient};
pub use config::{Config, ConfigChangeEvent};
pub use manager::{ClientError, ClientManager, CLIENT_TTL};
