//! Settings and the factory turning them into connections, consumers and
//! workers.
//!
//! # Sources
//!
//! Settings are read from an optional file (YAML, TOML or JSON, by extension)
//! followed by environment variables prefixed `COURIER` with `__` as the
//! nesting separator, e.g. `COURIER__WORKER__MAX_TRIES=5`.
//!
//! ```yaml
//! connections:
//!   main:
//!     driver: database
//!     url: sqlite://jobs.db?mode=rwc
//!     reservation_timeout: 300
//!   cache:
//!     driver: redis
//!     url: redis://localhost:6379
//! destinations:
//!   emails:
//!     connection: main
//!     queue: emails
//!     middlewares: [no_failure, store, "retry:3:10"]
//!   billing:
//!     connection: cache
//!     topic: orders
//!     group: billing
//! failer:
//!   driver: database
//!   url: sqlite://jobs.db?mode=rwc
//! worker:
//!   poll_duration_secs: 3
//!   max_tries: 3
//! ```
//!
//! AMQP and log connections run over transports supplied by the application
//! through [`ConnectionFactory::register_amqp_channel`] and
//! [`ConnectionFactory::register_log_client`].

use crate::consumer::QueueConsumer;
use crate::driver::{Connection, Destination, QueueDriver};
use crate::drivers::{
    AmqpChannel, AmqpDriver, AmqpOptions, DatabaseDriver, DatabaseOptions, LogClient, LogDriver,
    LogOptions, MemoryDriver, RedisDriver, RedisOptions,
};
use crate::error::{ConfigurationError, QueueError};
use crate::failer::{DatabaseFailedJobStore, FailedJobStore, MemoryFailedJobStore};
use crate::handler::HandlerRegistry;
use crate::receiver::{Middleware, ReceiverBuilder, RetryPolicy};
use crate::worker::{Worker, WorkerOptions};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "COURIER";

// ============================================================================
// Settings
// ============================================================================

/// Backend of a named connection
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum ConnectionSettings {
    Memory,
    Database {
        url: String,
        #[serde(flatten)]
        options: DatabaseOptions,
    },
    Redis {
        url: String,
        #[serde(flatten)]
        options: RedisOptions,
    },
    Amqp {
        #[serde(flatten)]
        options: AmqpOptions,
    },
    Log {
        #[serde(flatten)]
        options: LogOptions,
    },
}

/// A consumer source: connection, queue or topic, and its middlewares
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationSettings {
    pub connection: String,
    #[serde(flatten)]
    pub target: Destination,
    /// Middleware names, outermost first
    #[serde(default)]
    pub middlewares: Vec<String>,
}

/// Backend of the failed job store
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum FailerSettings {
    Memory,
    Database {
        url: String,
        #[serde(default = "default_failed_table")]
        table: String,
    },
}

fn default_failed_table() -> String {
    "failed_jobs".to_string()
}

/// Worker loop and default retry settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub poll_duration_secs: f64,
    /// Default of `retry` middlewares without an explicit count
    pub max_tries: u32,
    /// Default delay of `retry` middlewares, in seconds
    pub retry_delay: u64,
    pub stop_on_error: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_duration_secs: 3.0,
            max_tries: 3,
            retry_delay: 0,
            stop_on_error: true,
        }
    }
}

impl WorkerSettings {
    pub fn worker_options(&self) -> Result<WorkerOptions, ConfigurationError> {
        let duration =
            crate::worker::seconds(self.poll_duration_secs).ok_or_else(|| ConfigurationError::Invalid {
                message: format!(
                    "worker.poll_duration_secs: {} is not a valid number of seconds",
                    self.poll_duration_secs
                ),
            })?;
        Ok(WorkerOptions {
            duration,
            stop_on_error: self.stop_on_error,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_tries, Duration::from_secs(self.retry_delay))
    }
}

/// Root settings tree
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub connections: BTreeMap<String, ConnectionSettings>,
    pub destinations: BTreeMap<String, DestinationSettings>,
    pub failer: Option<FailerSettings>,
    pub worker: WorkerSettings,
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        ConfigurationError::Parsing {
            message: err.to_string(),
        }
    }
}

impl QueueSettings {
    /// Load from an optional file plus `COURIER__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading queue configuration");
            builder = builder.add_source(File::from(path).required(true));
        }

        let settings: Self = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a string in `format`
    pub fn parse(content: &str, format: FileFormat) -> Result<Self, ConfigurationError> {
        let settings: Self = Config::builder()
            .add_source(File::from_str(content, format))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check references and middleware names
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (name, destination) in &self.destinations {
            if !self.connections.contains_key(&destination.connection) {
                return Err(ConfigurationError::Invalid {
                    message: format!(
                        "destination '{}' references unknown connection '{}'",
                        name, destination.connection
                    ),
                });
            }

            let target_empty = match &destination.target {
                Destination::Queue { queue } => queue.is_empty(),
                Destination::Topic { topic, group } => topic.is_empty() || group.is_empty(),
            };
            if target_empty {
                return Err(ConfigurationError::Missing {
                    key: format!("destinations.{}.queue", name),
                });
            }

            for entry in &destination.middlewares {
                let middleware: Middleware = entry.parse()?;
                if middleware == Middleware::Store && self.failer.is_none() {
                    return Err(ConfigurationError::Missing {
                        key: format!("failer (destination '{}' uses 'store')", name),
                    });
                }
            }
        }

        self.worker.worker_options()?;

        if let Some(FailerSettings::Database { table, .. }) = &self.failer {
            crate::drivers::database::validate_table_name(table)?;
        }
        for settings in self.connections.values() {
            if let ConnectionSettings::Database { options, .. } = settings {
                crate::drivers::database::validate_table_name(&options.table)?;
            }
        }

        Ok(())
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds and caches connections, and assembles consumers from settings
pub struct ConnectionFactory {
    settings: QueueSettings,
    amqp_channels: HashMap<String, Arc<dyn AmqpChannel>>,
    log_clients: HashMap<String, Arc<dyn LogClient>>,
    connections: Mutex<HashMap<String, Connection>>,
    failer: OnceCell<Option<Arc<dyn FailedJobStore>>>,
}

impl ConnectionFactory {
    pub fn new(settings: QueueSettings) -> Result<Self, ConfigurationError> {
        settings.validate()?;
        Ok(Self {
            settings,
            amqp_channels: HashMap::new(),
            log_clients: HashMap::new(),
            connections: Mutex::new(HashMap::new()),
            failer: OnceCell::new(),
        })
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Transport of the AMQP connection `name`
    pub fn register_amqp_channel(
        &mut self,
        name: impl Into<String>,
        channel: Arc<dyn AmqpChannel>,
    ) -> &mut Self {
        self.amqp_channels.insert(name.into(), channel);
        self
    }

    /// Transport of the log connection `name`
    pub fn register_log_client(
        &mut self,
        name: impl Into<String>,
        client: Arc<dyn LogClient>,
    ) -> &mut Self {
        self.log_clients.insert(name.into(), client);
        self
    }

    /// The connection `name`, opened on first use
    pub async fn connection(&self, name: &str) -> Result<Connection, QueueError> {
        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.get(name) {
            return Ok(connection.clone());
        }

        let settings = self
            .settings
            .connections
            .get(name)
            .ok_or_else(|| ConfigurationError::Missing {
                key: format!("connections.{}", name),
            })?;
        let driver = self.open(name, settings).await?;
        let connection = Connection::new(name, driver);

        debug!(connection = %name, driver = %connection.driver().kind(), "Opened connection");
        connections.insert(name.to_string(), connection.clone());
        Ok(connection)
    }

    async fn open(
        &self,
        name: &str,
        settings: &ConnectionSettings,
    ) -> Result<Arc<dyn QueueDriver>, QueueError> {
        let missing = |transport: &str| ConfigurationError::MissingTransport {
            connection: name.to_string(),
            transport: transport.to_string(),
        };

        let driver: Arc<dyn QueueDriver> = match settings {
            ConnectionSettings::Memory => Arc::new(MemoryDriver::new()),
            ConnectionSettings::Database { url, options } => {
                Arc::new(DatabaseDriver::connect(url, options.clone()).await?)
            }
            ConnectionSettings::Redis { url, options } => {
                Arc::new(RedisDriver::connect(url, options.clone()).await?)
            }
            ConnectionSettings::Amqp { options } => {
                let channel = self.amqp_channels.get(name).ok_or_else(|| missing("AMQP channel"))?;
                Arc::new(AmqpDriver::new(channel.clone(), options.clone()))
            }
            ConnectionSettings::Log { options } => {
                let client = self.log_clients.get(name).ok_or_else(|| missing("log client"))?;
                Arc::new(LogDriver::new(client.clone(), options.clone()))
            }
        };
        Ok(driver)
    }

    /// The configured failed job store, if any
    pub async fn failer(&self) -> Result<Option<Arc<dyn FailedJobStore>>, QueueError> {
        self.failer
            .get_or_try_init(|| async {
                let store: Option<Arc<dyn FailedJobStore>> = match &self.settings.failer {
                    None => None,
                    Some(FailerSettings::Memory) => Some(Arc::new(MemoryFailedJobStore::new())),
                    Some(FailerSettings::Database { url, table }) => {
                        Some(Arc::new(DatabaseFailedJobStore::connect(url, table.clone()).await?))
                    }
                };
                Ok::<_, QueueError>(store)
            })
            .await
            .cloned()
    }

    /// Consumer of the destination `name` with its configured middlewares
    pub async fn consumer(
        &self,
        name: &str,
        handlers: HandlerRegistry,
    ) -> Result<QueueConsumer, QueueError> {
        let destination = self
            .settings
            .destinations
            .get(name)
            .ok_or_else(|| ConfigurationError::Missing {
                key: format!("destinations.{}", name),
            })?;

        let mut builder = ReceiverBuilder::new().with_retry_policy(self.settings.worker.retry_policy());
        if let Some(store) = self.failer().await? {
            builder = builder.with_failer(store);
        }
        let pipeline = builder
            .parse_middlewares(&destination.middlewares)?
            .build_pipeline(handlers)?;

        let connection = self.connection(&destination.connection).await?;
        QueueConsumer::for_destination(connection, &destination.target, Arc::new(pipeline)).await
    }

    /// Worker over the destination `name`, using the worker settings
    pub async fn worker(&self, name: &str, handlers: HandlerRegistry) -> Result<Worker, QueueError> {
        let consumer = self.consumer(name, handlers).await?;
        Ok(Worker::new(consumer, self.settings.worker.worker_options()?))
    }
}
