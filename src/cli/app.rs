use crate::cli::commands::{Cli, Commands, ConfigCommand};
use crate::link::{Link, LinkEvent};
use crate::messages::{OperationKind, WireConfig, MAX_MESSAGE_SIZE};
use crate::network::backoff::RetryConfig;
use crate::network::client::{ClientOptions, WsClient};
use crate::network::connection::{WsConnector, DEFAULT_CONNECT_TIMEOUT};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_URL: &str = "ws://127.0.0.1:2022";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server WebSocket URL
    pub url: String,
    /// Draining connections older than this are force-closed; 0 disables
    pub stale_connection_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Largest frame accepted or sent, in bytes
    pub max_message_size: usize,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            stale_connection_timeout_ms: 0,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            max_message_size: MAX_MESSAGE_SIZE,
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Get the default config directory
    pub fn default_config_dir() -> Result<PathBuf> {
        ProjectDirs::from("dev", "wsrpc", "wsrpc")
            .map(|proj_dirs| proj_dirs.config_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
    }

    /// Get the default config file path
    pub fn default_config_file() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file: {}", path.display()))
    }

    /// Load `path` if given (it must exist), otherwise the default file if present,
    /// otherwise built-in defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let default_file = Self::default_config_file()?;
        if default_file.exists() {
            Self::load(&default_file)
        } else {
            debug!("No configuration file at {}, using defaults", default_file.display());
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write configuration file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_client_options(&self) -> ClientOptions {
        let stale = Duration::from_millis(self.stale_connection_timeout_ms);
        ClientOptions::new(self.url.clone())
            .with_connector(Arc::new(WsConnector::with_connect_timeout(
                Duration::from_millis(self.connect_timeout_ms),
            )))
            .with_retry_delay(self.retry.to_retry_delay())
            .with_stale_connection_timeout(Some(stale))
            .with_wire_config(WireConfig::with_max_message_size(self.max_message_size))
    }
}

/// Command-line input: JSON when it parses, a plain string otherwise
pub fn parse_input(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn render(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Connected application state
pub struct App {
    pub config: Config,
    link: Link,
}

impl App {
    /// Start a client session for `config`. Must run inside a tokio runtime.
    pub fn new(config: Config) -> Self {
        info!("Connecting to {}", config.url);
        let client = WsClient::new(config.to_client_options());
        Self {
            config,
            link: Link::new(client),
        }
    }

    /// Handle the 'query' and 'mutation' commands
    pub async fn handle_call(
        &self,
        kind: OperationKind,
        path: &str,
        input: Option<&str>,
    ) -> Result<()> {
        let input = input.map(parse_input);
        let result = match kind {
            OperationKind::Mutation => self.link.mutation(path, input).await,
            _ => self.link.query(path, input).await,
        }
        .with_context(|| format!("{} '{}' failed", kind, path))?;

        println!("{}", render(&result));
        Ok(())
    }

    /// Handle the 'subscribe' command
    pub async fn handle_subscribe(
        &self,
        path: &str,
        input: Option<&str>,
        count: Option<usize>,
    ) -> Result<()> {
        let mut subscription = self
            .link
            .subscription(path, input.map(parse_input))
            .with_context(|| format!("subscription '{}' failed", path))?;
        let mut received = 0usize;

        loop {
            tokio::select! {
                event = subscription.next() => match event {
                    Some(LinkEvent::Started) => info!("Subscription started"),
                    Some(LinkEvent::Data(value)) => {
                        println!("{}", render(&value));
                        received += 1;
                        if count.is_some_and(|limit| received >= limit) {
                            break;
                        }
                    }
                    Some(LinkEvent::Stopped) => {
                        info!("Server stopped the subscription");
                        break;
                    }
                    Some(LinkEvent::Error(e)) if e.is_interrupted() || e.is_closed_prematurely() => {
                        warn!("Subscription interrupted, resubscribing: {}", e);
                    }
                    Some(LinkEvent::Error(e)) => {
                        return Err(e).with_context(|| format!("subscription '{}' failed", path));
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
            }
        }

        subscription.unsubscribe();
        info!("Received {} data events", received);
        Ok(())
    }

    /// Close the session and wait briefly for it to drain
    pub async fn shutdown(&self) {
        let client = self.link.client();
        client.close();
        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            while !client.is_stopped() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            debug!("Session still draining at exit");
        }
    }
}

/// Handle the 'config' command
pub fn handle_config(command: &ConfigCommand, config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => Config::default_config_file()?,
    };

    match command {
        ConfigCommand::Path => {
            println!("{}", path.display());
            if !path.exists() {
                println!("(file does not exist, run 'wsrpc config init' to create it)");
            }
        }
        ConfigCommand::Show => {
            let config = Config::load_or_default(config_path)?;
            let content =
                toml::to_string_pretty(&config).context("Failed to serialize configuration")?;
            print!("{}", content);
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Configuration already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(&path)?;
            info!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}

/// Dispatch a parsed command line
pub async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();

    if let Commands::Config { command } = &cli.command {
        return handle_config(command, config_path);
    }

    let mut config = Config::load_or_default(config_path)?;
    if let Some(url) = cli.url {
        config.url = url;
    }
    let app = App::new(config);

    let outcome = match &cli.command {
        Commands::Query { path, input } => {
            app.handle_call(OperationKind::Query, path, input.as_deref())
                .await
        }
        Commands::Mutation { path, input } => {
            app.handle_call(OperationKind::Mutation, path, input.as_deref())
                .await
        }
        Commands::Subscribe { path, input, count } => {
            app.handle_subscribe(path, input.as_deref(), *count).await
        }
        Commands::Config { .. } => Ok(()),
    };

    app.shutdown().await;
    outcome
}
