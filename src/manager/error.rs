use thiserror::Error;

use crate::auth::AuthProvider;

/// Why no client could be produced for a provider.
///
/// Callers should treat any of these as "feature unavailable for this
/// provider" rather than fatal. Reasons are flattened to strings so a single
/// failed population can be reported to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
  #[error("no credentials available for {provider}: {reason}")]
  CredentialUnavailable {
    provider: AuthProvider,
    reason: String,
  },

  #[error("refreshing the {provider} token failed: {reason}")]
  RefreshFailed {
    provider: AuthProvider,
    reason: String,
  },

  #[error("could not build the {provider} client: {reason}")]
  Factory {
    provider: AuthProvider,
    reason: String,
  },

  #[error("credential store error for {provider}: {reason}")]
  Store {
    provider: AuthProvider,
    reason: String,
  },

  #[error("cached {provider} client has a different type than requested")]
  ClientMismatch { provider: AuthProvider },

  #[error("fetching the {provider} client was aborted: {reason}")]
  Aborted {
    provider: AuthProvider,
    reason: String,
  },
}

impl ClientError {
  pub fn provider(&self) -> AuthProvider {
    match self {
      ClientError::CredentialUnavailable { provider, .. }
      | ClientError::RefreshFailed { provider, .. }
      | ClientError::Factory { provider, .. }
      | ClientError::Store { provider, .. }
      | ClientError::ClientMismatch { provider }
      | ClientError::Aborted { provider, .. } => *provider,
    }
  }
}

/// Render a report with its whole cause chain.
pub(crate) fn reason(err: &color_eyre::Report) -> String {
  format!("{:#}", err)
}
