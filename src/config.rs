use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::auth::AuthProvider;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub oauth: OAuthConfig,
  #[serde(default)]
  pub debug: DebugConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthConfig {
  #[serde(default)]
  pub jira: OAuthClientConfig,
  #[serde(default)]
  pub bitbucket: OAuthClientConfig,
  /// Fall back to the interactive flow when a silent refresh is rejected
  #[serde(default)]
  pub reauthenticate_on_refresh_failure: bool,
}

/// OAuth application registered with Atlassian or Bitbucket.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthClientConfig {
  pub client_id: Option<String>,
  /// May also come from ATLCLIENTS_<PROVIDER>_CLIENT_SECRET
  pub client_secret: Option<String>,
  pub redirect_uri: Option<String>,
}

/// Settings for routing outbound API traffic through a local debugging proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct DebugConfig {
  /// Route traffic through Charles (or any MITM proxy) while debugging
  #[serde(default)]
  pub enable_charles: bool,
  #[serde(default = "default_proxy_host")]
  pub proxy_host: String,
  #[serde(default = "default_proxy_port")]
  pub proxy_port: u16,
  /// PEM certificate of the proxy's signing CA
  pub ca_cert: Option<PathBuf>,
}

fn default_proxy_host() -> String {
  "127.0.0.1".to_string()
}

fn default_proxy_port() -> u16 {
  8888
}

impl Default for DebugConfig {
  fn default() -> Self {
    Self {
      enable_charles: false,
      proxy_host: default_proxy_host(),
      proxy_port: default_proxy_port(),
      ca_cert: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./atlclients.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/atlclients/config.yaml
  ///
  /// Without an explicit path, a missing file yields the defaults.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        tracing::debug!("no configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("atlclients.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("atlclients").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    // An empty document deserializes to unit, not a mapping
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  /// OAuth application settings for `provider`.
  pub fn oauth_client(&self, provider: AuthProvider) -> &OAuthClientConfig {
    match provider {
      AuthProvider::JiraCloud => &self.oauth.jira,
      AuthProvider::BitbucketCloud => &self.oauth.bitbucket,
    }
  }

  /// Get the OAuth client secret for `provider`.
  ///
  /// The environment variable wins over the config file.
  pub fn client_secret(&self, provider: AuthProvider) -> Option<String> {
    let var = format!(
      "ATLCLIENTS_{}_CLIENT_SECRET",
      provider.id().to_ascii_uppercase()
    );
    std::env::var(var)
      .ok()
      .or_else(|| self.oauth_client(provider).client_secret.clone())
  }
}

/// A change to the configuration, delivered on the change feed.
#[derive(Debug, Clone)]
pub struct ConfigChangeEvent {
  /// Configuration after the change
  pub config: Config,
  /// Whether the process runs in a debugging session
  pub is_debugging: bool,
  /// True for the synthetic event applied once at startup
  pub initializing: bool,
}

impl ConfigChangeEvent {
  pub fn new(config: Config, is_debugging: bool) -> Self {
    Self {
      config,
      is_debugging,
      initializing: false,
    }
  }

  /// The event applied when a consumer first subscribes.
  pub fn initializing(config: Config, is_debugging: bool) -> Self {
    Self {
      initializing: true,
      ..Self::new(config, is_debugging)
    }
  }

  /// The debugging proxy settings, if this change enables one.
  pub fn debug_proxy(&self) -> Option<&DebugConfig> {
    (self.is_debugging && self.config.debug.enable_charles).then_some(&self.config.debug)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_yaml_is_default() {
    let config = Config::from_yaml("").unwrap();
    assert!(!config.debug.enable_charles);
    assert_eq!(config.debug.proxy_host, "127.0.0.1");
    assert_eq!(config.debug.proxy_port, 8888);
    assert!(config.oauth.jira.client_id.is_none());
  }

  #[test]
  fn test_parse_full_config() {
    let config = Config::from_yaml(
      r#"
oauth:
  jira:
    client_id: abc
    redirect_uri: http://127.0.0.1:9090/callback
  bitbucket:
    client_id: def
    client_secret: shh
  reauthenticate_on_refresh_failure: true
debug:
  enable_charles: true
  proxy_port: 9999
  ca_cert: /tmp/charles.pem
"#,
    )
    .unwrap();

    assert_eq!(config.oauth.jira.client_id.as_deref(), Some("abc"));
    assert_eq!(
      config.oauth_client(AuthProvider::BitbucketCloud).client_id.as_deref(),
      Some("def")
    );
    assert!(config.oauth.reauthenticate_on_refresh_failure);
    assert!(config.debug.enable_charles);
    assert_eq!(config.debug.proxy_host, "127.0.0.1");
    assert_eq!(config.debug.proxy_port, 9999);
    assert_eq!(config.debug.ca_cert, Some(PathBuf::from("/tmp/charles.pem")));
  }

  #[test]
  fn test_debug_proxy_requires_debugging_session() {
    let mut config = Config::default();
    config.debug.enable_charles = true;

    assert!(ConfigChangeEvent::new(config.clone(), false)
      .debug_proxy()
      .is_none());
    assert!(ConfigChangeEvent::new(config, true).debug_proxy().is_some());
    assert!(ConfigChangeEvent::new(Config::default(), true)
      .debug_proxy()
      .is_none());
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
