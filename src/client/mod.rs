//! Authenticated REST clients, one variant per provider.

mod bitbucket;
mod jira;

pub use bitbucket::{BitbucketClient, BitbucketUser};
pub use jira::{JiraClient, JiraUser};

use color_eyre::{eyre::eyre, Result};
use std::path::Path;

use crate::auth::AuthProvider;
use crate::config::{ConfigChangeEvent, DebugConfig};

/// Every client the manager knows how to cache.
#[derive(Debug, Clone)]
pub enum ProviderClient {
  Jira(JiraClient),
  Bitbucket(BitbucketClient),
}

impl ProviderClient {
  pub fn provider(&self) -> AuthProvider {
    match self {
      ProviderClient::Jira(_) => AuthProvider::JiraCloud,
      ProviderClient::Bitbucket(_) => AuthProvider::BitbucketCloud,
    }
  }
}

/// A concrete client type that can live in a [`ProviderClient`] slot.
pub trait AuthenticatedClient: Clone + Send + Sync + 'static {
  fn into_provider_client(self) -> ProviderClient;

  /// Borrow back the concrete client, `None` if the variant differs.
  fn from_provider_client(client: &ProviderClient) -> Option<Self>;
}

impl AuthenticatedClient for JiraClient {
  fn into_provider_client(self) -> ProviderClient {
    ProviderClient::Jira(self)
  }

  fn from_provider_client(client: &ProviderClient) -> Option<Self> {
    match client {
      ProviderClient::Jira(jira) => Some(jira.clone()),
      _ => None,
    }
  }
}

impl AuthenticatedClient for BitbucketClient {
  fn into_provider_client(self) -> ProviderClient {
    ProviderClient::Bitbucket(self)
  }

  fn from_provider_client(client: &ProviderClient) -> Option<Self> {
    match client {
      ProviderClient::Bitbucket(bb) => Some(bb.clone()),
      _ => None,
    }
  }
}

/// Outbound HTTP settings shared by all client factories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpOptions {
  pub proxy: Option<DebugProxy>,
}

/// A local intercepting proxy (e.g. Charles) used to inspect API traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugProxy {
  pub url: String,
  /// PEM bundle of the proxy's CA, trusted in addition to the system roots
  pub ca_pem: Option<Vec<u8>>,
}

impl DebugProxy {
  pub fn from_config(debug: &DebugConfig) -> Result<Self> {
    let ca_pem = debug.ca_cert.as_deref().map(read_ca).transpose()?;

    Ok(Self {
      url: format!("http://{}:{}", debug.proxy_host, debug.proxy_port),
      ca_pem,
    })
  }
}

fn read_ca(path: &Path) -> Result<Vec<u8>> {
  let pem = std::fs::read(path)
    .map_err(|e| eyre!("Failed to read proxy CA {}: {}", path.display(), e))?;
  reqwest::Certificate::from_pem(&pem)
    .map_err(|e| eyre!("Invalid proxy CA {}: {}", path.display(), e))?;
  Ok(pem)
}

impl HttpOptions {
  /// Derive the options implied by a configuration change.
  ///
  /// A proxy that cannot be set up is logged and left disabled rather than
  /// failing every client build.
  pub fn from_change(event: &ConfigChangeEvent) -> Self {
    let proxy = event
      .debug_proxy()
      .and_then(|debug| match DebugProxy::from_config(debug) {
        Ok(proxy) => Some(proxy),
        Err(e) => {
          tracing::warn!("debug proxy disabled: {:#}", e);
          None
        }
      });

    if let Some(proxy) = &proxy {
      tracing::info!(url = %proxy.url, "routing API traffic through debug proxy");
    }
    Self { proxy }
  }

  /// Build an HTTP client honouring these options.
  pub fn http_client(&self) -> Result<reqwest::Client> {
    let mut builder =
      reqwest::Client::builder().user_agent(concat!("atlclients/", env!("CARGO_PKG_VERSION")));

    if let Some(proxy) = &self.proxy {
      builder = builder.proxy(
        reqwest::Proxy::all(&proxy.url).map_err(|e| eyre!("Invalid proxy {}: {}", proxy.url, e))?,
      );
      if let Some(pem) = &proxy.ca_pem {
        let cert = reqwest::Certificate::from_pem(pem)
          .map_err(|e| eyre!("Invalid proxy CA: {}", e))?;
        builder = builder.add_root_certificate(cert);
      }
    }

    builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::auth::AuthInfo;
  use crate::config::Config;

  fn charles_event(ca_cert: Option<&Path>) -> ConfigChangeEvent {
    let mut config = Config::default();
    config.debug.enable_charles = true;
    config.debug.ca_cert = ca_cert.map(Path::to_path_buf);
    ConfigChangeEvent::new(config, true)
  }

  #[test]
  fn test_no_proxy_by_default() {
    let options = HttpOptions::from_change(&ConfigChangeEvent::initializing(Config::default(), true));
    assert_eq!(options, HttpOptions::default());
  }

  #[test]
  fn test_charles_proxy_when_debugging() {
    let options = HttpOptions::from_change(&charles_event(None));
    let proxy = options.proxy.unwrap();
    assert_eq!(proxy.url, "http://127.0.0.1:8888");
    assert!(proxy.ca_pem.is_none());
  }

  #[test]
  fn test_unreadable_ca_disables_proxy() {
    let options = HttpOptions::from_change(&charles_event(Some(Path::new("/no/such/ca.pem"))));
    assert!(options.proxy.is_none());
  }

  #[test]
  fn test_variant_access_is_typed() {
    let options = HttpOptions::default();
    let jira = JiraClient::from_auth(&AuthInfo::new("token"), &options).unwrap();
    let slot = jira.into_provider_client();

    assert_eq!(slot.provider(), AuthProvider::JiraCloud);
    assert!(JiraClient::from_provider_client(&slot).is_some());
    assert!(BitbucketClient::from_provider_client(&slot).is_none());
  }
}
