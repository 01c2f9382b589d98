use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use url::Url;

use super::HttpOptions;
use crate::auth::AuthInfo;

const JIRA_API_GATEWAY: &str = "https://api.atlassian.com/ex/jira/";

/// Jira Cloud REST client authenticated with an OAuth access token.
///
/// Requests go through the Atlassian API gateway, addressed by the cloud id
/// of the site the token was issued for.
#[derive(Clone)]
pub struct JiraClient {
  http: reqwest::Client,
  base_url: Url,
  access: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JiraUser {
  pub account_id: String,
  pub display_name: String,
  pub email_address: Option<String>,
}

impl JiraClient {
  /// Build a client from stored credentials.
  ///
  /// Without any accessible resource the cloud id is left empty; requests will
  /// then fail at the gateway rather than here.
  pub fn from_auth(info: &AuthInfo, options: &HttpOptions) -> Result<Self> {
    let cloud_id = info.cloud_id().unwrap_or_default();
    let base_url = Url::parse(&format!("{}{}/rest/", JIRA_API_GATEWAY, cloud_id))
      .map_err(|e| eyre!("Invalid Jira cloud id {:?}: {}", cloud_id, e))?;

    Ok(Self {
      http: options.http_client()?,
      base_url,
      access: info.access.clone(),
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// GET a path relative to `/rest/` and decode the JSON body.
  pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
    let url = self
      .base_url
      .join(path)
      .map_err(|e| eyre!("Invalid Jira path {}: {}", path, e))?;

    self
      .http
      .get(url)
      .bearer_auth(&self.access)
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(|e| eyre!("Jira request {} failed: {}", path, e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse Jira response {}: {}", path, e))
  }

  /// The user the token belongs to
  pub async fn current_user(&self) -> Result<JiraUser> {
    self.get("api/3/myself").await
  }
}

impl fmt::Debug for JiraClient {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JiraClient")
      .field("base_url", &self.base_url.as_str())
      .finish_non_exhaustive()
  }
}
