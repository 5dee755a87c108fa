//! QueueBuilder - キューの構築とワイヤリング
//!
//! # 方針
//! - handler registry は起動時に一度だけ構築する
//! - 起動時検証（Fail-fast）: 期待する handler が揃っていなければ build() が失敗する
//! - store / clock / decider は注入する（グローバル状態なし）

use std::sync::Arc;

use super::consumer::Consumer;
use super::dispatcher::Dispatcher;
use super::enqueuer::Enqueuer;
use super::fetcher::BatchFetcher;
use super::lock::LockManager;
use crate::config::{ConfigError, QueueConfig};
use crate::domain::{Decider, DefaultDecider, HandlerName};
use crate::ports::{Clock, StreamStore, SystemClock, UlidGenerator};
use crate::typed::{Handler, HandlerRegistry, RegistryError, TaskHandler, TaskPayload};

/// Builds a [`Queue`].
///
/// # 使用例
/// ```ignore
/// let queue = QueueBuilder::new(QueueConfig::from_env()?)
///     .store(Arc::new(RedisStore::connect(&url).await?))
///     .register_typed::<SendEmail, _>(EmailHandler)?
///     .expect_handlers(&["EmailHandler"])
///     .build()?;
/// ```
pub struct QueueBuilder {
    config: QueueConfig,
    store: Option<Arc<dyn StreamStore>>,
    registry: HandlerRegistry,
    expected_handlers: Option<Vec<HandlerName>>,
    clock: Arc<dyn Clock>,
    decider: Option<Arc<dyn Decider>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing handlers: {0:?}. These handlers were expected but not registered.")]
    MissingHandlers(Vec<String>),

    #[error("no stream store configured")]
    MissingStore,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl QueueBuilder {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            store: None,
            registry: HandlerRegistry::new(),
            expected_handlers: None,
            clock: Arc::new(SystemClock),
            decider: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn StreamStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn register<H: TaskHandler + 'static>(
        mut self,
        name: impl Into<HandlerName>,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register(name, handler)?;
        Ok(self)
    }

    /// Register the handler built by `factory` (called once, here).
    pub fn register_with<H, F>(
        mut self,
        name: impl Into<HandlerName>,
        factory: F,
    ) -> Result<Self, RegistryError>
    where
        H: TaskHandler + 'static,
        F: FnOnce() -> H,
    {
        self.registry.register_with(name, factory)?;
        Ok(self)
    }

    pub fn register_typed<P: TaskPayload, H: Handler<P> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register_typed::<P, H>(handler)?;
        Ok(self)
    }

    /// Handler names that must be registered for `build()` to succeed.
    pub fn expect_handlers(mut self, names: &[&str]) -> Self {
        self.expected_handlers = Some(names.iter().map(|&name| HandlerName::new(name)).collect());
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the retry decider (default: countdown with the configured backoff).
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn build(self) -> Result<Queue, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_handlers {
            let registered = self.registry.registered_names();
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !registered.contains(name))
                .map(ToString::to_string)
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingHandlers(missing));
            }
        }

        let store = self.store.ok_or(BuildError::MissingStore)?;
        let config = self.config;
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(config.retry_backoff)));

        let enqueuer = Enqueuer::new(
            store.clone(),
            config.stream_key.clone(),
            Arc::new(UlidGenerator::new(self.clock.clone())),
            self.clock.clone(),
        );
        let registry = Arc::new(self.registry);
        let locks = LockManager::new(store.clone(), config.lock_prefix.clone(), config.lock_margin());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            registry.clone(),
            locks.clone(),
            enqueuer.clone(),
            decider,
            self.clock,
            config.dead_letter_key.clone(),
        ));
        let fetcher = BatchFetcher::new(
            store,
            config.stream_key.clone(),
            config.batch_count,
            config.block_timeout(),
        );

        Ok(Queue {
            config,
            registry,
            enqueuer,
            locks,
            fetcher,
            dispatcher,
        })
    }
}

/// A wired queue: hands out producers and consumers sharing one store.
pub struct Queue {
    config: QueueConfig,
    registry: Arc<HandlerRegistry>,
    enqueuer: Enqueuer,
    locks: LockManager,
    fetcher: BatchFetcher,
    dispatcher: Arc<Dispatcher>,
}

impl Queue {
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn enqueuer(&self) -> Enqueuer {
        self.enqueuer.clone()
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn consumer(&self) -> Consumer {
        Consumer::new(
            self.fetcher.clone(),
            self.dispatcher.clone(),
            self.config.idle_interval(),
        )
    }
}
