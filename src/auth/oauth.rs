//! OAuth 2.0 token acquisition for Atlassian Cloud and Bitbucket Cloud.
//!
//! The authorization-code grant needs a user to approve access in a browser.
//! That interaction is delegated to an [`AuthorizationPrompt`], which only has
//! to hand back the code; everything around it (building the authorize URL,
//! exchanging codes and refresh tokens, discovering Jira cloud sites) lives
//! here.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::sync::Arc;
use url::Url;

use super::{AccessibleResource, AuthInfo, AuthProvider, UserInfo};
use crate::config::{Config, OAuthClientConfig};

const JIRA_AUTHORIZE_URL: &str = "https://auth.atlassian.com/authorize";
const JIRA_TOKEN_URL: &str = "https://auth.atlassian.com/oauth/token";
const JIRA_RESOURCES_URL: &str = "https://api.atlassian.com/oauth/token/accessible-resources";
const JIRA_ME_URL: &str = "https://api.atlassian.com/me";
const JIRA_SCOPES: &str = "read:jira-user read:jira-work write:jira-work offline_access";

const BITBUCKET_AUTHORIZE_URL: &str = "https://bitbucket.org/site/oauth2/authorize";
const BITBUCKET_TOKEN_URL: &str = "https://bitbucket.org/site/oauth2/access_token";
const BITBUCKET_USER_URL: &str = "https://api.bitbucket.org/2.0/user";

/// Obtains credentials, interactively or by refreshing existing ones.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
  /// Run the full authorization-code flow for `provider`.
  async fn do_dance(&self, provider: AuthProvider) -> Result<AuthInfo>;

  /// Exchange the stored refresh token for a new access token.
  async fn refresh(&self, provider: AuthProvider, info: &AuthInfo) -> Result<AuthInfo>;
}

/// Sends the user to `authorize_url` and returns the authorization code.
#[async_trait]
pub trait AuthorizationPrompt: Send + Sync {
  async fn authorization_code(&self, provider: AuthProvider, authorize_url: &Url)
    -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
  access_token: String,
  refresh_token: Option<String>,
  /// Lifetime in seconds
  expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
  error: String,
  error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtlassianMe {
  account_id: String,
  name: String,
}

#[derive(Debug, Deserialize)]
struct BitbucketUser {
  uuid: String,
  display_name: String,
}

enum Grant<'a> {
  AuthorizationCode(&'a str),
  RefreshToken(&'a str),
}

impl Grant<'_> {
  fn params(&self) -> [(&'static str, &str); 2] {
    match self {
      Grant::AuthorizationCode(code) => [("grant_type", "authorization_code"), ("code", *code)],
      Grant::RefreshToken(token) => [("grant_type", "refresh_token"), ("refresh_token", *token)],
    }
  }
}

/// [`TokenRefresher`] talking to the real Atlassian and Bitbucket endpoints.
pub struct AtlassianRefresher {
  http: reqwest::Client,
  config: Config,
  prompt: Arc<dyn AuthorizationPrompt>,
}

impl AtlassianRefresher {
  pub fn new(config: Config, prompt: Arc<dyn AuthorizationPrompt>) -> Result<Self> {
    let http = reqwest::Client::builder()
      .user_agent(concat!("atlclients/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      config,
      prompt,
    })
  }

  fn client_config(&self, provider: AuthProvider) -> Result<(&OAuthClientConfig, &str)> {
    let client = self.config.oauth_client(provider);
    let client_id = client
      .client_id
      .as_deref()
      .ok_or_else(|| eyre!("No OAuth client id configured for {}", provider))?;
    Ok((client, client_id))
  }

  async fn exchange(&self, provider: AuthProvider, grant: Grant<'_>) -> Result<TokenResponse> {
    let (client, client_id) = self.client_config(provider)?;
    let secret = self.config.client_secret(provider);

    let request = match provider {
      AuthProvider::JiraCloud => {
        let mut body = serde_json::Map::new();
        for (key, value) in grant.params() {
          body.insert(key.into(), value.into());
        }
        body.insert("client_id".into(), client_id.into());
        if let Some(secret) = &secret {
          body.insert("client_secret".into(), secret.as_str().into());
        }
        if let (Grant::AuthorizationCode(_), Some(redirect)) = (&grant, &client.redirect_uri) {
          body.insert("redirect_uri".into(), redirect.as_str().into());
        }
        self.http.post(JIRA_TOKEN_URL).json(&body)
      }
      AuthProvider::BitbucketCloud => self
        .http
        .post(BITBUCKET_TOKEN_URL)
        .basic_auth(client_id, secret)
        .form(&grant.params()[..]),
    };

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Token request to {} failed: {}", provider, e))?;
    let status = response.status();
    let body = response
      .text()
      .await
      .map_err(|e| eyre!("Failed to read token response from {}: {}", provider, e))?;

    if !status.is_success() {
      return Err(token_error(provider, status, &body));
    }

    serde_json::from_str(&body)
      .map_err(|e| eyre!("Unexpected token response from {}: {}", provider, e))
  }

  async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, access: &str) -> Result<T> {
    self
      .http
      .get(url)
      .bearer_auth(access)
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))
  }

  /// Fill in the cloud sites and user behind a freshly issued token.
  async fn describe(&self, provider: AuthProvider, info: &mut AuthInfo) -> Result<()> {
    match provider {
      AuthProvider::JiraCloud => {
        let resources: Vec<AccessibleResource> =
          self.get_json(JIRA_RESOURCES_URL, &info.access).await?;
        if resources.is_empty() {
          tracing::warn!("token grants access to no Jira sites");
        }
        let me: AtlassianMe = self.get_json(JIRA_ME_URL, &info.access).await?;
        info.accessible_resources = Some(resources);
        info.user = Some(UserInfo {
          id: me.account_id,
          display_name: me.name,
        });
      }
      AuthProvider::BitbucketCloud => {
        let user: BitbucketUser = self.get_json(BITBUCKET_USER_URL, &info.access).await?;
        info.user = Some(UserInfo {
          id: user.uuid,
          display_name: user.display_name,
        });
      }
    }
    Ok(())
  }
}

#[async_trait]
impl TokenRefresher for AtlassianRefresher {
  async fn do_dance(&self, provider: AuthProvider) -> Result<AuthInfo> {
    let (client, client_id) = self.client_config(provider)?;
    let url = authorize_url(provider, client_id, client.redirect_uri.as_deref())?;

    tracing::info!(%provider, "starting interactive authorization");
    let code = self.prompt.authorization_code(provider, &url).await?;
    let code = code.trim();
    if code.is_empty() {
      return Err(eyre!("Authorization for {} was cancelled", provider));
    }

    let tokens = self
      .exchange(provider, Grant::AuthorizationCode(code))
      .await?;
    let mut info = apply_tokens(None, tokens);
    self.describe(provider, &mut info).await?;

    tracing::info!(%provider, "authorization complete");
    Ok(info)
  }

  async fn refresh(&self, provider: AuthProvider, info: &AuthInfo) -> Result<AuthInfo> {
    let refresh = info
      .refresh
      .as_deref()
      .ok_or_else(|| eyre!("No refresh token stored for {}", provider))?;

    let tokens = self.exchange(provider, Grant::RefreshToken(refresh)).await?;
    tracing::debug!(%provider, "refreshed access token");
    Ok(apply_tokens(Some(info), tokens))
  }
}

/// Build the URL the user must visit to approve access.
fn authorize_url(
  provider: AuthProvider,
  client_id: &str,
  redirect_uri: Option<&str>,
) -> Result<Url> {
  let mut url = match provider {
    AuthProvider::JiraCloud => {
      let mut url = Url::parse(JIRA_AUTHORIZE_URL)?;
      url
        .query_pairs_mut()
        .append_pair("audience", "api.atlassian.com")
        .append_pair("client_id", client_id)
        .append_pair("scope", JIRA_SCOPES)
        .append_pair("response_type", "code")
        .append_pair("prompt", "consent");
      url
    }
    AuthProvider::BitbucketCloud => {
      let mut url = Url::parse(BITBUCKET_AUTHORIZE_URL)?;
      url
        .query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("response_type", "code");
      url
    }
  };

  if let Some(redirect) = redirect_uri {
    url.query_pairs_mut().append_pair("redirect_uri", redirect);
  }
  Ok(url)
}

/// Merge a token response into the previous credentials, if any.
///
/// Providers may or may not rotate refresh tokens; when none comes back the
/// old one stays valid.
fn apply_tokens(previous: Option<&AuthInfo>, tokens: TokenResponse) -> AuthInfo {
  let mut info = previous.cloned().unwrap_or_else(|| AuthInfo::new(""));
  info.access = tokens.access_token;
  if tokens.refresh_token.is_some() {
    info.refresh = tokens.refresh_token;
  }
  info.expires_at = tokens
    .expires_in
    .map(|secs| Utc::now() + Duration::seconds(secs));
  info
}

fn token_error(provider: AuthProvider, status: reqwest::StatusCode, body: &str) -> color_eyre::Report {
  match serde_json::from_str::<OAuthErrorResponse>(body) {
    Ok(err) => eyre!(
      "{} rejected the token request ({}): {} {}",
      provider,
      status,
      err.error,
      err.error_description.unwrap_or_default()
    ),
    Err(_) => eyre!("{} rejected the token request ({})", provider, status),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tokens(json: &str) -> TokenResponse {
    serde_json::from_str(json).unwrap()
  }

  #[test]
  fn test_jira_authorize_url() {
    let url = authorize_url(
      AuthProvider::JiraCloud,
      "client",
      Some("http://127.0.0.1:9090/callback"),
    )
    .unwrap();
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();

    assert_eq!(url.host_str(), Some("auth.atlassian.com"));
    assert!(pairs.contains(&("audience".into(), "api.atlassian.com".into())));
    assert!(pairs.contains(&("scope".into(), JIRA_SCOPES.into())));
    assert!(pairs.contains(&(
      "redirect_uri".into(),
      "http://127.0.0.1:9090/callback".into()
    )));
  }

  #[test]
  fn test_bitbucket_authorize_url_without_redirect() {
    let url = authorize_url(AuthProvider::BitbucketCloud, "client", None).unwrap();
    assert_eq!(
      url.as_str(),
      "https://bitbucket.org/site/oauth2/authorize?client_id=client&response_type=code"
    );
  }

  #[test]
  fn test_refresh_keeps_unrotated_refresh_token() {
    let mut previous = AuthInfo::new("old");
    previous.refresh = Some("keep-me".into());
    previous.accessible_resources = Some(vec![]);

    let info = apply_tokens(
      Some(&previous),
      tokens(r#"{"access_token": "new", "expires_in": 3600}"#),
    );

    assert_eq!(info.access, "new");
    assert_eq!(info.refresh.as_deref(), Some("keep-me"));
    assert_eq!(info.accessible_resources, Some(vec![]));
    assert!(info.expires_at.unwrap() > Utc::now());
  }

  #[test]
  fn test_refresh_takes_rotated_refresh_token() {
    let mut previous = AuthInfo::new("old");
    previous.refresh = Some("stale".into());

    let info = apply_tokens(
      Some(&previous),
      tokens(r#"{"access_token": "new", "refresh_token": "rotated"}"#),
    );

    assert_eq!(info.refresh.as_deref(), Some("rotated"));
    assert!(info.expires_at.is_none());
  }

  #[test]
  fn test_token_error_includes_oauth_reason() {
    let err = token_error(
      AuthProvider::JiraCloud,
      reqwest::StatusCode::FORBIDDEN,
      r#"{"error": "invalid_grant", "error_description": "Unknown or invalid refresh token."}"#,
    );
    let message = err.to_string();
    assert!(message.contains("invalid_grant"));
    assert!(message.contains("Unknown or invalid refresh token."));
  }

  #[tokio::test]
  async fn test_refresh_without_refresh_token_fails() {
    struct NeverPrompt;

    #[async_trait]
    impl AuthorizationPrompt for NeverPrompt {
      async fn authorization_code(&self, _: AuthProvider, _: &Url) -> Result<String> {
        Err(eyre!("not interactive"))
      }
    }

    let refresher = AtlassianRefresher::new(Config::default(), Arc::new(NeverPrompt)).unwrap();
    let err = refresher
      .refresh(AuthProvider::JiraCloud, &AuthInfo::new("token"))
      .await
      .unwrap_err();
    assert!(err.to_string().contains("No refresh token"));
  }
}
