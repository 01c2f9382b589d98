//! Credential persistence.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{AuthInfo, AuthProvider};

/// Persists and retrieves per-provider credentials.
#[async_trait]
pub trait AuthStore: Send + Sync {
  async fn get_auth_info(&self, provider: AuthProvider) -> Result<Option<AuthInfo>>;

  async fn save_auth_info(&self, provider: AuthProvider, info: &AuthInfo) -> Result<()>;

  async fn remove_auth_info(&self, provider: AuthProvider) -> Result<()>;
}

/// Store that keeps credentials for the lifetime of the process only.
#[derive(Default)]
pub struct MemoryAuthStore {
  infos: Mutex<HashMap<AuthProvider, AuthInfo>>,
}

impl MemoryAuthStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
  async fn get_auth_info(&self, provider: AuthProvider) -> Result<Option<AuthInfo>> {
    Ok(self.infos.lock().await.get(&provider).cloned())
  }

  async fn save_auth_info(&self, provider: AuthProvider, info: &AuthInfo) -> Result<()> {
    self.infos.lock().await.insert(provider, info.clone());
    Ok(())
  }

  async fn remove_auth_info(&self, provider: AuthProvider) -> Result<()> {
    self.infos.lock().await.remove(&provider);
    Ok(())
  }
}

/// Store backed by a JSON file readable only by the current user.
///
/// The whole file is rewritten on every save. Writes go through a temporary
/// file and a rename so a crash never leaves a truncated store behind.
pub struct FileAuthStore {
  path: PathBuf,
  /// Serializes read-modify-write cycles
  lock: Mutex<()>,
}

impl FileAuthStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Ok(Self::at(Self::default_path()?))
  }

  pub fn at(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      lock: Mutex::new(()),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Get the default store path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("atlclients").join("auth.json"))
  }

  async fn read_all(&self) -> Result<HashMap<AuthProvider, AuthInfo>> {
    let contents = match tokio::fs::read(&self.path).await {
      Ok(contents) => contents,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
      Err(e) => {
        return Err(eyre!(
          "Failed to read credential store {}: {}",
          self.path.display(),
          e
        ))
      }
    };

    serde_json::from_slice(&contents)
      .map_err(|e| eyre!("Corrupt credential store {}: {}", self.path.display(), e))
  }

  async fn write_all(&self, infos: &HashMap<AuthProvider, AuthInfo>) -> Result<()> {
    if let Some(parent) = self.path.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| eyre!("Failed to create credential directory: {}", e))?;
    }

    let data = serde_json::to_vec_pretty(infos)
      .map_err(|e| eyre!("Failed to serialize credentials: {}", e))?;
    let tmp = self.path.with_extension("json.tmp");

    // A leftover from an interrupted write may carry looser permissions
    match tokio::fs::remove_file(&tmp).await {
      Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
        return Err(eyre!("Failed to remove stale {}: {}", tmp.display(), e))
      }
      _ => {}
    }

    let mut file = create_private(&tmp)
      .await
      .map_err(|e| eyre!("Failed to create {}: {}", tmp.display(), e))?;
    file
      .write_all(&data)
      .await
      .map_err(|e| eyre!("Failed to write {}: {}", tmp.display(), e))?;
    file
      .sync_all()
      .await
      .map_err(|e| eyre!("Failed to flush {}: {}", tmp.display(), e))?;
    drop(file);

    tokio::fs::rename(&tmp, &self.path)
      .await
      .map_err(|e| eyre!("Failed to replace {}: {}", self.path.display(), e))?;

    Ok(())
  }
}

/// Create a file only the current user can read, before anything is written.
async fn create_private(path: &Path) -> std::io::Result<tokio::fs::File> {
  let mut options = tokio::fs::OpenOptions::new();
  options.write(true).create_new(true);
  #[cfg(unix)]
  options.mode(0o600);
  options.open(path).await
}

#[async_trait]
impl AuthStore for FileAuthStore {
  async fn get_auth_info(&self, provider: AuthProvider) -> Result<Option<AuthInfo>> {
    let _guard = self.lock.lock().await;
    Ok(self.read_all().await?.remove(&provider))
  }

  async fn save_auth_info(&self, provider: AuthProvider, info: &AuthInfo) -> Result<()> {
    let _guard = self.lock.lock().await;
    let mut infos = self.read_all().await?;
    infos.insert(provider, info.clone());
    self.write_all(&infos).await?;

    tracing::debug!(provider = provider.id(), "saved credentials");
    Ok(())
  }

  async fn remove_auth_info(&self, provider: AuthProvider) -> Result<()> {
    let _guard = self.lock.lock().await;
    let mut infos = self.read_all().await?;
    if infos.remove(&provider).is_some() {
      self.write_all(&infos).await?;
      tracing::debug!(provider = provider.id(), "removed credentials");
    }
    Ok(())
  }
}
