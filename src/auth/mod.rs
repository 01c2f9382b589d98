//! Credentials and the collaborators that obtain and persist them.

mod oauth;
mod store;

pub use oauth::{AtlassianRefresher, AuthorizationPrompt, TokenRefresher};
pub use store::{AuthStore, FileAuthStore, MemoryAuthStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A product/environment combination with its own credentials and client.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum AuthProvider {
  #[serde(rename = "jiracloud")]
  #[value(name = "jira", alias = "jiracloud")]
  JiraCloud,
  #[serde(rename = "bbcloud")]
  #[value(name = "bitbucket", alias = "bbcloud")]
  BitbucketCloud,
}

impl AuthProvider {
  pub const ALL: [AuthProvider; 2] = [AuthProvider::JiraCloud, AuthProvider::BitbucketCloud];

  /// Stable identifier used as the cache and store key.
  pub fn id(self) -> &'static str {
    match self {
      AuthProvider::JiraCloud => "jiracloud",
      AuthProvider::BitbucketCloud => "bbcloud",
    }
  }

  pub fn display_name(self) -> &'static str {
    match self {
      AuthProvider::JiraCloud => "Jira Cloud",
      AuthProvider::BitbucketCloud => "Bitbucket Cloud",
    }
  }
}

impl fmt::Display for AuthProvider {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.display_name())
  }
}

/// Token bundle for one provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
  pub access: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub refresh: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expires_at: Option<DateTime<Utc>>,
  /// Cloud sites the token can reach (Jira is addressed by cloud id)
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub accessible_resources: Option<Vec<AccessibleResource>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user: Option<UserInfo>,
}

impl AuthInfo {
  pub fn new(access: impl Into<String>) -> Self {
    Self {
      access: access.into(),
      refresh: None,
      expires_at: None,
      accessible_resources: None,
      user: None,
    }
  }

  /// Cloud id of the first accessible resource, if any.
  pub fn cloud_id(&self) -> Option<&str> {
    self
      .accessible_resources
      .as_ref()
      .and_then(|resources| resources.first())
      .map(|resource| resource.id.as_str())
  }
}

// Tokens stay out of logs
impl fmt::Debug for AuthInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AuthInfo")
      .field("access", &"<redacted>")
      .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
      .field("expires_at", &self.expires_at)
      .field("accessible_resources", &self.accessible_resources)
      .field("user", &self.user)
      .finish()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessibleResource {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub url: String,
  #[serde(default)]
  pub scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
  pub id: String,
  pub display_name: String,
}

/// Emitted when credentials for a provider appear or are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthChangeEvent {
  pub provider: AuthProvider,
  pub kind: AuthChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthChangeKind {
  LoggedIn,
  LoggedOut,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cloud_id_uses_first_resource() {
    let mut info = AuthInfo::new("token");
    assert_eq!(info.cloud_id(), None);

    info.accessible_resources = Some(vec![
      AccessibleResource {
        id: "first".into(),
        name: "one".into(),
        url: String::new(),
        scopes: vec![],
      },
      AccessibleResource {
        id: "second".into(),
        name: "two".into(),
        url: String::new(),
        scopes: vec![],
      },
    ]);
    assert_eq!(info.cloud_id(), Some("first"));
  }

  #[test]
  fn test_debug_redacts_tokens() {
    let mut info = AuthInfo::new("secret-access");
    info.refresh = Some("secret-refresh".into());

    let printed = format!("{:?}", info);
    assert!(!printed.contains("secret-access"));
    assert!(!printed.contains("secret-refresh"));
  }

  #[test]
  fn test_provider_ids_serialize_stably() {
    assert_eq!(
      serde_json::to_string(&AuthProvider::JiraCloud).unwrap(),
      "\"jiracloud\""
    );
    assert_eq!(AuthProvider::BitbucketCloud.id(), "bbcloud");
  }
}
