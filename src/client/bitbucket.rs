use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use url::Url;

use super::HttpOptions;
use crate::auth::AuthInfo;

const BITBUCKET_API: &str = "https://api.bitbucket.org/2.0/";

/// Bitbucket Cloud REST client authenticated with an OAuth access token.
#[derive(Clone)]
pub struct BitbucketClient {
  http: reqwest::Client,
  base_url: Url,
  access: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitbucketUser {
  pub uuid: String,
  pub display_name: String,
  pub nickname: Option<String>,
}

impl BitbucketClient {
  pub fn from_auth(info: &AuthInfo, options: &HttpOptions) -> Result<Self> {
    let base_url = Url::parse(BITBUCKET_API)?;

    Ok(Self {
      http: options.http_client()?,
      base_url,
      access: info.access.clone(),
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// GET a path relative to `/2.0/` and decode the JSON body.
  pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
    let url = self
      .base_url
      .join(path)
      .map_err(|e| eyre!("Invalid Bitbucket path {}: {}", path, e))?;

    self
      .http
      .get(url)
      .bearer_auth(&self.access)
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(|e| eyre!("Bitbucket request {} failed: {}", path, e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse Bitbucket response {}: {}", path, e))
  }

  pub async fn current_user(&self) -> Result<BitbucketUser> {
    self.get("user").await
  }
}

impl fmt::Debug for BitbucketClient {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BitbucketClient")
      .field("base_url", &self.base_url.as_str())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_base_url_is_api_root() {
    let client = BitbucketClient::from_auth(&AuthInfo::new("token"), &HttpOptions::default()).unwrap();
    assert_eq!(client.base_url().as_str(), "https://api.bitbucket.org/2.0/");
    assert_eq!(
      client.base_url().join("user").unwrap().as_str(),
      "https://api.bitbucket.org/2.0/user"
    );
  }

  #[test]
  fn test_debug_hides_token() {
    let client =
      BitbucketClient::from_auth(&AuthInfo::new("s3cret"), &HttpOptions::default()).unwrap();
    let shown = format!("{:?}", client);
    assert!(!shown.contains("s3cret"));
    assert!(shown.contains("api.bitbucket.org"));
  }
}
