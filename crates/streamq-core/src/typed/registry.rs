//! HandlerRegistry - handler 名から handler インスタンスへの対応表
//!
//! 起動時に構築（mutable）し、実行時は `Arc<HandlerRegistry>` として共有（immutable）。
//! dispatch のたびに handler を生成することはありません。

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{Handler, TaskHandler, TypedHandler};
use super::payload::TaskPayload;
use crate::domain::HandlerName;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler '{0}' is already registered")]
    AlreadyRegistered(HandlerName),
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerName, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: TaskHandler + 'static>(
        &mut self,
        name: impl Into<HandlerName>,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.insert(name.into(), Arc::new(handler))
    }

    /// Register the value produced by `factory`. The factory runs once, now.
    pub fn register_with<H, F>(
        &mut self,
        name: impl Into<HandlerName>,
        factory: F,
    ) -> Result<(), RegistryError>
    where
        H: TaskHandler + 'static,
        F: FnOnce() -> H,
    {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.insert(name, Arc::new(factory()))
    }

    /// Register a typed handler under `P::HANDLER`.
    pub fn register_typed<P: TaskPayload, H: Handler<P> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.insert(
            HandlerName::new(P::HANDLER),
            Arc::new(TypedHandler::<P, H>::new(handler)),
        )
    }

    fn insert(&mut self, name: HandlerName, handler: Arc<dyn TaskHandler>) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &HandlerName) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn registered_names(&self) -> Vec<HandlerName> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
