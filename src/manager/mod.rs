//! Per-provider authenticated client cache.
//!
//! [`ClientManager`] hands out one ready-to-use client per provider and keeps
//! it for [`CLIENT_TTL`]. On a miss it loads stored credentials and refreshes
//! them silently, or runs the interactive flow when there are none. Concurrent
//! misses for the same provider share a single population, and so do
//! concurrent rebuilds.
//!
//! Configuration changes (such as switching the debug proxy on) bump a
//! generation counter. A cached client built at an older generation is rebuilt
//! from the stored credentials on its next access, without another token
//! exchange and without resetting its TTL.

mod error;

pub use error::ClientError;

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{AuthChangeEvent, AuthChangeKind, AuthInfo, AuthProvider, AuthStore, TokenRefresher};
use crate::cache::ExpiringCache;
use crate::client::{AuthenticatedClient, BitbucketClient, HttpOptions, JiraClient, ProviderClient};
use crate::config::ConfigChangeEvent;
use error::reason;

/// How long a client is reused before its credentials are refreshed again.
///
/// Comfortably shorter than Atlassian access tokens live, so a cached client
/// never carries a dead token.
pub const CLIENT_TTL: Duration = Duration::from_secs(45 * 60);

type Factory<C> = Arc<dyn Fn(&AuthInfo, &HttpOptions) -> color_eyre::Result<C> + Send + Sync>;
type Population = Shared<BoxFuture<'static, Result<CachedClient, ClientError>>>;

#[derive(Debug, Clone)]
struct CachedClient {
  client: ProviderClient,
  /// Configuration generation the client was built under
  generation: u64,
}

/// What a population does once it has the provider to itself.
enum Job {
  Load,
  Rebuild(CachedClient),
}

struct CacheState {
  clients: ExpiringCache<CachedClient>,
  generation: u64,
  /// Bumped by every logout, per provider
  auth_epochs: HashMap<AuthProvider, u64>,
}

impl CacheState {
  fn auth_epoch(&self, provider: AuthProvider) -> u64 {
    self.auth_epochs.get(&provider).copied().unwrap_or(0)
  }
}

struct Inner {
  store: Arc<dyn AuthStore>,
  refresher: Arc<dyn TokenRefresher>,
  /// Never held across an await
  state: Mutex<CacheState>,
  /// Populations and rebuilds currently running, one per provider
  in_flight: Mutex<HashMap<AuthProvider, Population>>,
  /// Held while saving or removing credentials
  auth_write: tokio::sync::Mutex<()>,
  http_options: RwLock<HttpOptions>,
  reauthenticate_on_refresh_failure: AtomicBool,
  auth_events: broadcast::Sender<AuthChangeEvent>,
}

/// Produces and caches authenticated clients.
///
/// Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct ClientManager {
  inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn signed_out(provider: AuthProvider) -> ClientError {
  ClientError::CredentialUnavailable {
    provider,
    reason: "signed out while the client was being fetched".into(),
  }
}

impl ClientManager {
  pub fn new(store: Arc<dyn AuthStore>, refresher: Arc<dyn TokenRefresher>) -> Self {
    let (auth_events, _) = broadcast::channel(16);

    Self {
      inner: Arc::new(Inner {
        store,
        refresher,
        state: Mutex::new(CacheState {
          clients: ExpiringCache::new(),
          generation: 0,
          auth_epochs: HashMap::new(),
        }),
        in_flight: Mutex::new(HashMap::new()),
        auth_write: tokio::sync::Mutex::new(()),
        http_options: RwLock::new(HttpOptions::default()),
        reauthenticate_on_refresh_failure: AtomicBool::new(false),
        auth_events,
      }),
    }
  }

  /// Apply `initial` and follow the configuration feed until it closes.
  pub fn configure(
    &self,
    initial: ConfigChangeEvent,
    mut feed: mpsc::UnboundedReceiver<ConfigChangeEvent>,
  ) -> JoinHandle<()> {
    self.on_configuration_changed(&initial);

    let manager = self.clone();
    tokio::spawn(async move {
      while let Some(event) = feed.recv().await {
        // Reading the debug proxy CA touches the filesystem
        let applied = manager.clone();
        if let Err(e) =
          tokio::task::spawn_blocking(move || applied.on_configuration_changed(&event)).await
        {
          warn!("applying configuration change failed: {}", e);
        }
      }
      debug!("configuration feed closed");
    })
  }

  /// React to a configuration change.
  ///
  /// Every change invalidates the cached clients, whether or not it touched
  /// a setting they depend on.
  pub fn on_configuration_changed(&self, event: &ConfigChangeEvent) {
    // Options first: a population that sees the new generation must also
    // see the options that came with it
    let options = HttpOptions::from_change(event);
    *self
      .inner
      .http_options
      .write()
      .unwrap_or_else(PoisonError::into_inner) = options;
    self.inner.reauthenticate_on_refresh_failure.store(
      event.config.oauth.reauthenticate_on_refresh_failure,
      Ordering::Relaxed,
    );

    let generation = {
      let mut state = lock(&self.inner.state);
      state.generation += 1;
      state.generation
    };
    debug!(
      generation,
      initializing = event.initializing,
      "configuration changed, cached clients are stale"
    );
  }

  /// Current configuration generation.
  pub fn generation(&self) -> u64 {
    self.inner.generation()
  }

  /// Get the client for `provider`, building it with `factory` when needed.
  pub async fn get_client<C, F>(&self, provider: AuthProvider, factory: F) -> Result<C, ClientError>
  where
    C: AuthenticatedClient,
    F: Fn(&AuthInfo, &HttpOptions) -> color_eyre::Result<C> + Send + Sync + 'static,
  {
    let factory: Factory<C> = Arc::new(factory);

    let cached = match self.inner.cached(provider) {
      Some(cached) => cached,
      None => self.populate(provider, Job::Load, Arc::clone(&factory)).await?,
    };

    let cached = if cached.generation < self.inner.generation() {
      self.populate(provider, Job::Rebuild(cached), factory).await?
    } else {
      cached
    };

    C::from_provider_client(&cached.client).ok_or(ClientError::ClientMismatch { provider })
  }

  pub async fn jira_client(&self) -> Result<JiraClient, ClientError> {
    debug!("getting jira client");
    self
      .get_client(AuthProvider::JiraCloud, JiraClient::from_auth)
      .await
  }

  pub async fn bitbucket_client(&self) -> Result<BitbucketClient, ClientError> {
    debug!("getting bitbucket client");
    self
      .get_client(AuthProvider::BitbucketCloud, BitbucketClient::from_auth)
      .await
  }

  /// Whether credentials are stored for `provider`.
  pub async fn is_authenticated(&self, provider: AuthProvider) -> Result<bool, ClientError> {
    let info = self
      .inner
      .store
      .get_auth_info(provider)
      .await
      .map_err(|e| ClientError::Store {
        provider,
        reason: reason(&e),
      })?;
    Ok(info.is_some())
  }

  /// Forget the credentials and cached client for `provider`.
  ///
  /// A population already running for `provider` neither saves its
  /// credentials nor caches its client afterwards.
  pub async fn clear_auth(&self, provider: AuthProvider) -> Result<(), ClientError> {
    let _write = self.inner.auth_write.lock().await;
    {
      let mut state = lock(&self.inner.state);
      *state.auth_epochs.entry(provider).or_default() += 1;
      state.clients.clear(provider.id());
    }

    self
      .inner
      .store
      .remove_auth_info(provider)
      .await
      .map_err(|e| ClientError::Store {
        provider,
        reason: reason(&e),
      })?;

    info!(%provider, "cleared credentials");
    self.inner.notify(provider, AuthChangeKind::LoggedOut);
    Ok(())
  }

  /// Listen for logins and logouts.
  pub fn subscribe_auth_changes(&self) -> broadcast::Receiver<AuthChangeEvent> {
    self.inner.auth_events.subscribe()
  }

  /// TTL the cached client for `provider` was stored with, if one is cached.
  pub fn client_ttl(&self, provider: AuthProvider) -> Option<Duration> {
    lock(&self.inner.state).clients.ttl(provider.id())
  }

  /// Join the running population for `provider` or start one for `job`.
  async fn populate<C: AuthenticatedClient>(
    &self,
    provider: AuthProvider,
    job: Job,
    factory: Factory<C>,
  ) -> Result<CachedClient, ClientError> {
    let population = {
      let mut in_flight = lock(&self.inner.in_flight);

      if let Some(running) = in_flight.get(&provider) {
        debug!(%provider, "joining in-flight client population");
        running.clone()
      } else if let Some(cached) = self.inner.settled(provider, &job) {
        // Another population finished between the cache check and here
        return Ok(cached);
      } else {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
          let result = match job {
            Job::Load => inner.load(provider, factory).await,
            Job::Rebuild(stale) => inner.rebuild(provider, stale, &factory).await,
          };
          lock(&inner.in_flight).remove(&provider);
          result
        });

        let inner = Arc::clone(&self.inner);
        let population = async move {
          task.await.unwrap_or_else(|e| {
            // The task never got to unregister itself
            lock(&inner.in_flight).remove(&provider);
            Err(ClientError::Aborted {
              provider,
              reason: e.to_string(),
            })
          })
        }
        .boxed()
        .shared();

        in_flight.insert(provider, population.clone());
        population
      }
    };

    population.await
  }
}

impl Inner {
  fn generation(&self) -> u64 {
    lock(&self.state).generation
  }

  fn cached(&self, provider: AuthProvider) -> Option<CachedClient> {
    lock(&self.state).clients.get(provider.id()).cloned()
  }

  /// The cached client, if `job` has nothing left to do.
  fn settled(&self, provider: AuthProvider, job: &Job) -> Option<CachedClient> {
    let mut state = lock(&self.state);
    let generation = state.generation;
    let cached = state.clients.get(provider.id())?.clone();
    match job {
      Job::Load => Some(cached),
      Job::Rebuild(_) => (cached.generation >= generation).then_some(cached),
    }
  }

  fn notify(&self, provider: AuthProvider, kind: AuthChangeKind) {
    // No subscribers is fine
    let _ = self.auth_events.send(AuthChangeEvent { provider, kind });
  }

  /// Obtain credentials, build the client and cache it.
  async fn load<C: AuthenticatedClient>(
    &self,
    provider: AuthProvider,
    factory: Factory<C>,
  ) -> Result<CachedClient, ClientError> {
    // Read before the options so a concurrent change can only make this
    // client look older than it is
    let (generation, epoch) = {
      let state = lock(&self.state);
      (state.generation, state.auth_epoch(provider))
    };

    let info = self.credentials(provider, epoch).await?;
    let client = self.build(provider, &info, &factory)?;
    let cached = CachedClient { client, generation };

    {
      let mut state = lock(&self.state);
      if state.auth_epoch(provider) != epoch {
        return Err(signed_out(provider));
      }
      state
        .clients
        .set(provider.id(), cached.clone(), Some(CLIENT_TTL));
    }
    debug!(%provider, generation, "cached new client");

    Ok(cached)
  }

  /// Refresh stored credentials, or run the interactive flow if there are none.
  async fn credentials(&self, provider: AuthProvider, epoch: u64) -> Result<AuthInfo, ClientError> {
    let stored = self
      .store
      .get_auth_info(provider)
      .await
      .map_err(|e| ClientError::Store {
        provider,
        reason: reason(&e),
      })?;

    let (info, logged_in) = match stored {
      None => (self.dance(provider).await?, true),
      Some(stored) => match self.refresher.refresh(provider, &stored).await {
        Ok(info) => (info, false),
        Err(e) if self.reauthenticate_on_refresh_failure.load(Ordering::Relaxed) => {
          warn!(%provider, "token refresh failed, reauthenticating: {:#}", e);
          (self.dance(provider).await?, true)
        }
        Err(e) => {
          return Err(ClientError::RefreshFailed {
            provider,
            reason: reason(&e),
          })
        }
      },
    };

    let _write = self.auth_write.lock().await;
    if lock(&self.state).auth_epoch(provider) != epoch {
      info!(%provider, "signed out while fetching credentials, discarding them");
      return Err(signed_out(provider));
    }
    self
      .store
      .save_auth_info(provider, &info)
      .await
      .map_err(|e| ClientError::Store {
        provider,
        reason: reason(&e),
      })?;

    if logged_in {
      self.notify(provider, AuthChangeKind::LoggedIn);
    }
    Ok(info)
  }

  async fn dance(&self, provider: AuthProvider) -> Result<AuthInfo, ClientError> {
    self
      .refresher
      .do_dance(provider)
      .await
      .map_err(|e| ClientError::CredentialUnavailable {
        provider,
        reason: reason(&e),
      })
  }

  fn build<C: AuthenticatedClient>(
    &self,
    provider: AuthProvider,
    info: &AuthInfo,
    factory: &Factory<C>,
  ) -> Result<ProviderClient, ClientError> {
    let options = self
      .http_options
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();

    factory(info, &options)
      .map(C::into_provider_client)
      .map_err(|e| ClientError::Factory {
        provider,
        reason: reason(&e),
      })
  }

  /// Rebuild a stale client from stored credentials, keeping its TTL.
  async fn rebuild<C: AuthenticatedClient>(
    &self,
    provider: AuthProvider,
    stale: CachedClient,
    factory: &Factory<C>,
  ) -> Result<CachedClient, ClientError> {
    let (generation, epoch) = {
      let state = lock(&self.state);
      (state.generation, state.auth_epoch(provider))
    };
    let stored = self
      .store
      .get_auth_info(provider)
      .await
      .map_err(|e| ClientError::Store {
        provider,
        reason: reason(&e),
      })?;

    let Some(info) = stored else {
      warn!(%provider, "no stored credentials to rebuild with, keeping existing client");
      if let Some(entry) = lock(&self.state).clients.get_mut(provider.id()) {
        entry.generation = generation;
      }
      return Ok(CachedClient { generation, ..stale });
    };

    let rebuilt = CachedClient {
      client: self.build(provider, &info, factory)?,
      generation,
    };

    let updated = {
      let mut state = lock(&self.state);
      state.auth_epoch(provider) == epoch && state.clients.update(provider.id(), rebuilt.clone())
    };
    if !updated {
      warn!(%provider, "client expired or was cleared during rebuild, not caching it");
    }
    debug!(%provider, generation, "rebuilt client after configuration change");

    Ok(rebuilt)
  }
}
