//! Assembly of receiver chains from middleware names and custom receivers.
//!
//! Middlewares are listed outermost first; the processor always closes the
//! chain. Configuration strings:
//!
//! | Name                  | Receiver                                          |
//! |-----------------------|---------------------------------------------------|
//! | `retry[:N[:S]]`       | retry up to `N` times, `S` seconds apart          |
//! | `store`               | store failures in the configured failed job store |
//! | `no_failure`          | swallow non-fatal failures                        |
//! | `stop_when_empty`     | stop on the first empty poll                      |
//! | `limit:N`             | stop after `N` handled messages                   |
//! | `memory:SIZE`         | stop above `SIZE` resident memory (`128M`, `1G`)  |
//! | `expire:S`            | stop after running `S` seconds                    |
//! | `rate:N:S`            | pause `S` seconds after every `N` messages        |
//! | `log`                 | log every delivery                                |
//! | `bench`               | aggregate handling times                          |

use super::{
    BenchReceiver, MemoryLimiterReceiver, MemoryGauge, MessageCountLimiterReceiver,
    MessageLoggerReceiver, NoFailureReceiver, Pipeline, ProcessorReceiver, RateLimiterReceiver,
    Receiver, RetryPolicy, RetryReceiver, Stack, StopWhenEmptyReceiver, StoreFailedReceiver,
    TimeLimiterReceiver,
};
use crate::error::ConfigurationError;
use crate::failer::FailedJobStore;
use crate::handler::HandlerRegistry;
use crate::worker::seconds;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
#[path = "builder_tests.rs"]
mod tests;

// ============================================================================
// Middleware names
// ============================================================================

/// A named policy receiver as written in configuration
#[derive(Debug, Clone, PartialEq)]
pub enum Middleware {
    Retry {
        max_tries: Option<u32>,
        delay: Option<u64>,
    },
    Store,
    NoFailure,
    StopWhenEmpty,
    Limit(u64),
    Memory(u64),
    Expire(Duration),
    Rate { limit: u64, sleep: Duration },
    Log,
    Bench,
}

fn malformed(entry: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::Invalid {
        message: format!("middleware '{}': {}", entry, reason),
    }
}

fn number<T: FromStr>(entry: &str, value: Option<&str>, what: &str) -> Result<T, ConfigurationError> {
    let value = value.ok_or_else(|| malformed(entry, &format!("missing {}", what)))?;
    value
        .trim()
        .parse()
        .map_err(|_| malformed(entry, &format!("'{}' is not a valid {}", value, what)))
}

/// Parse sizes like `512`, `64K`, `128M` or `1G` into bytes
pub(crate) fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.char_indices().last()? {
        (i, 'k' | 'K') => (&value[..i], 1024),
        (i, 'm' | 'M') => (&value[..i], 1024 * 1024),
        (i, 'g' | 'G') => (&value[..i], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}

impl FromStr for Middleware {
    type Err = ConfigurationError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let mut parts = entry.trim().split(':');
        let name = parts.next().unwrap_or_default().to_ascii_lowercase().replace('-', "_");
        let first = parts.next();
        let second = parts.next();
        if parts.next().is_some() {
            return Err(malformed(entry, "too many arguments"));
        }

        let middleware = match name.as_str() {
            "retry" => Self::Retry {
                max_tries: first.map(|_| number(entry, first, "max tries")).transpose()?,
                delay: second.map(|_| number(entry, second, "delay")).transpose()?,
            },
            "store" => Self::Store,
            "no_failure" => Self::NoFailure,
            "stop_when_empty" => Self::StopWhenEmpty,
            "limit" => Self::Limit(number(entry, first, "message count")?),
            "memory" => {
                let size = first.ok_or_else(|| malformed(entry, "missing size"))?;
                Self::Memory(parse_size(size).ok_or_else(|| malformed(entry, "invalid size"))?)
            }
            "expire" => Self::Expire(Duration::from_secs(number(entry, first, "seconds")?)),
            "rate" => Self::Rate {
                limit: number(entry, first, "message count")?,
                sleep: seconds(number(entry, second, "seconds")?)
                    .ok_or_else(|| malformed(entry, "sleep is out of range"))?,
            },
            "log" => Self::Log,
            "bench" => Self::Bench,
            _ => {
                return Err(ConfigurationError::UnknownMiddleware {
                    name: entry.to_string(),
                })
            }
        };

        let takes_arguments = matches!(
            middleware,
            Self::Retry { .. }
                | Self::Limit(_)
                | Self::Memory(_)
                | Self::Expire(_)
                | Self::Rate { .. }
        );
        if !takes_arguments && first.is_some() {
            return Err(malformed(entry, "takes no arguments"));
        }

        Ok(middleware)
    }
}

// ============================================================================
// Builder
// ============================================================================

enum Layer {
    Named(Middleware),
    Custom(Arc<dyn Receiver>),
}

/// Composes receivers around a [`ProcessorReceiver`]
///
/// # Examples
///
/// ```rust
/// use queue_courier::failer::MemoryFailedJobStore;
/// use queue_courier::handler::{handler_fn, HandlerRegistry};
/// use queue_courier::receiver::ReceiverBuilder;
/// use std::sync::Arc;
///
/// let handlers = HandlerRegistry::single(handler_fn(|_message| async { Ok(()) }));
/// let pipeline = ReceiverBuilder::new()
///     .with_failer(Arc::new(MemoryFailedJobStore::new()))
///     .parse_middlewares(["no_failure", "store", "retry:3:10"])
///     .unwrap()
///     .build_pipeline(handlers)
///     .unwrap();
/// assert_eq!(pipeline.len(), 4);
/// ```
pub struct ReceiverBuilder {
    layers: Vec<Layer>,
    failer: Option<Arc<dyn FailedJobStore>>,
    memory_gauge: Option<Arc<dyn MemoryGauge>>,
    retry_policy: RetryPolicy,
}

impl Default for ReceiverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiverBuilder {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            failer: None,
            memory_gauge: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Store used by the `store` middleware
    pub fn with_failer(mut self, store: Arc<dyn FailedJobStore>) -> Self {
        self.failer = Some(store);
        self
    }

    /// Gauge read by the `memory` middleware
    pub fn with_memory_gauge(mut self, gauge: Arc<dyn MemoryGauge>) -> Self {
        self.memory_gauge = Some(gauge);
        self
    }

    /// Policy of `retry` middlewares; explicit arguments override its fields
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Append a named middleware inside the ones already added
    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.layers.push(Layer::Named(middleware));
        self
    }

    /// Parse and append middleware names, outermost first
    pub fn parse_middlewares<I, S>(mut self, names: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            let middleware = name.as_ref().parse()?;
            self.layers.push(Layer::Named(middleware));
        }
        Ok(self)
    }

    /// Append an application-defined receiver inside the ones already added
    pub fn receiver(mut self, receiver: Arc<dyn Receiver>) -> Self {
        self.layers.push(Layer::Custom(receiver));
        self
    }

    /// Receivers outermost first, processor last
    fn resolve(self, handlers: HandlerRegistry) -> Result<Vec<Arc<dyn Receiver>>, ConfigurationError> {
        let mut receivers: Vec<Arc<dyn Receiver>> = Vec::with_capacity(self.layers.len() + 1);

        for layer in self.layers {
            let receiver: Arc<dyn Receiver> = match layer {
                Layer::Custom(receiver) => receiver,
                Layer::Named(middleware) => match middleware {
                    Middleware::Retry { max_tries, delay } => {
                        let mut policy = match delay {
                            Some(delay) => RetryPolicy::fixed(
                                self.retry_policy.max_tries,
                                Duration::from_secs(delay),
                            ),
                            None => self.retry_policy.clone(),
                        };
                        if let Some(max_tries) = max_tries {
                            policy.max_tries = max_tries;
                        }
                        Arc::new(RetryReceiver::new(policy))
                    }
                    Middleware::Store => {
                        let store = self.failer.clone().ok_or_else(|| ConfigurationError::Missing {
                            key: "failer (required by the 'store' middleware)".to_string(),
                        })?;
                        Arc::new(StoreFailedReceiver::new(store))
                    }
                    Middleware::NoFailure => Arc::new(NoFailureReceiver::new()),
                    Middleware::StopWhenEmpty => Arc::new(StopWhenEmptyReceiver::new()),
                    Middleware::Limit(limit) => Arc::new(MessageCountLimiterReceiver::new(limit)),
                    Middleware::Memory(bytes) => match &self.memory_gauge {
                        Some(gauge) => Arc::new(MemoryLimiterReceiver::with_gauge(bytes, gauge.clone())),
                        None => Arc::new(MemoryLimiterReceiver::new(bytes)),
                    },
                    Middleware::Expire(limit) => Arc::new(TimeLimiterReceiver::new(limit)),
                    Middleware::Rate { limit, sleep } => Arc::new(RateLimiterReceiver::new(limit, sleep)),
                    Middleware::Log => Arc::new(MessageLoggerReceiver::new()),
                    Middleware::Bench => Arc::new(BenchReceiver::new()),
                },
            };
            receivers.push(receiver);
        }

        receivers.push(Arc::new(ProcessorReceiver::new(handlers)));
        Ok(receivers)
    }

    /// Cursor-traversed chain
    pub fn build_pipeline(self, handlers: HandlerRegistry) -> Result<Pipeline, ConfigurationError> {
        Ok(Pipeline::new(self.resolve(handlers)?))
    }

    /// Decorator chain with the same order as [`ReceiverBuilder::build_pipeline`]
    pub fn build_stack(self, handlers: HandlerRegistry) -> Result<Stack, ConfigurationError> {
        let receivers = self.resolve(handlers)?;
        Ok(receivers
            .into_iter()
            .rev()
            .fold(Stack::new(), |stack, receiver| stack.push(receiver)))
    }
}
