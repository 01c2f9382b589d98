use async_trait::async_trait;
use atlclients::auth::{AtlassianRefresher, AuthorizationPrompt, FileAuthStore};
use atlclients::{AuthProvider, ClientManager, Config, ConfigChangeEvent};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "atlclients")]
#[command(about = "Sign in to Jira Cloud and Bitbucket Cloud and check the cached clients")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/atlclients/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Treat this run as a debugging session (enables the debug proxy if configured)
  #[arg(long)]
  debug: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show which providers have stored credentials
  Status,
  /// Authenticate with a provider
  Login { provider: AuthProvider },
  /// Forget the stored credentials for a provider
  Logout { provider: AuthProvider },
  /// Print the user behind the stored credentials
  Whoami { provider: AuthProvider },
}

/// Prints the authorize URL and reads the code the user pastes back.
struct StdinPrompt;

#[async_trait]
impl AuthorizationPrompt for StdinPrompt {
  async fn authorization_code(&self, provider: AuthProvider, authorize_url: &Url) -> Result<String> {
    println!("Open this URL to authorize {}:\n\n  {}\n", provider, authorize_url);
    println!("Paste the authorization code and press Enter (empty to cancel):");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let code = lines
      .next_line()
      .await?
      .ok_or_else(|| eyre!("Authorization for {} was cancelled", provider))?;
    Ok(code)
  }
}

fn init_logging() -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("atlclients");

  let appender = tracing_appender::rolling::never(log_dir, "atlclients.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("atlclients=info")),
    )
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = init_logging()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let store = Arc::new(FileAuthStore::open()?);
  let refresher = Arc::new(AtlassianRefresher::new(config.clone(), Arc::new(StdinPrompt))?);
  let manager = ClientManager::new(store, refresher);
  manager.on_configuration_changed(&ConfigChangeEvent::initializing(config, args.debug));

  match args.command {
    Command::Status => {
      for provider in AuthProvider::ALL {
        let state = if manager.is_authenticated(provider).await? {
          "signed in"
        } else {
          "signed out"
        };
        println!("{:<16} {}", provider.display_name(), state);
      }
    }
    Command::Login { provider } => {
      if manager.is_authenticated(provider).await? {
        println!("Already signed in to {}. Use `logout` first to switch accounts.", provider);
        return Ok(());
      }
      println!("Signed in as {}", current_user(&manager, provider).await?);
    }
    Command::Logout { provider } => {
      manager.clear_auth(provider).await?;
      println!("Signed out of {}", provider);
    }
    Command::Whoami { provider } => match whoami(&manager, provider).await? {
      Some(name) => println!("{}", name),
      None => println!("Not signed in to {}. Use `login` first.", provider),
    },
  }

  Ok(())
}

/// The signed-in user, without starting a login when there is none.
async fn whoami(manager: &ClientManager, provider: AuthProvider) -> Result<Option<String>> {
  if !manager.is_authenticated(provider).await? {
    return Ok(None);
  }
  current_user(manager, provider).await.map(Some)
}

async fn current_user(manager: &ClientManager, provider: AuthProvider) -> Result<String> {
  let name = match provider {
    AuthProvider::JiraCloud => manager.jira_client().await?.current_user().await?.display_name,
    AuthProvider::BitbucketCloud => {
      manager
        .bitbucket_client()
        .await?
        .current_user()
        .await?
        .display_name
    }
  };
  Ok(name)
}

#[cfg(test)]
mod tests {
  use super::*;
  use atlclients::auth::MemoryAuthStore;
  use atlclients::{AuthInfo, TokenRefresher};
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Default)]
  struct CountingRefresher {
    dances: AtomicUsize,
  }

  #[async_trait]
  impl TokenRefresher for CountingRefresher {
    async fn do_dance(&self, _provider: AuthProvider) -> Result<AuthInfo> {
      self.dances.fetch_add(1, Ordering::SeqCst);
      Err(eyre!("no browser in tests"))
    }

    async fn refresh(&self, _provider: AuthProvider, info: &AuthInfo) -> Result<AuthInfo> {
      Ok(info.clone())
    }
  }

  #[tokio::test]
  async fn test_whoami_signed_out_does_not_log_in() {
    let refresher = Arc::new(CountingRefresher::default());
    let manager = ClientManager::new(Arc::new(MemoryAuthStore::default()), refresher.clone());

    for provider in AuthProvider::ALL {
      assert!(whoami(&manager, provider).await.unwrap().is_none());
    }
    assert_eq!(refresher.dances.load(Ordering::SeqCst), 0);
  }
}
