//! Handler traits
//!
//! # 二層構造
//! - **TaskHandler**: object-safe。registry には `Arc<dyn TaskHandler>` として格納
//! - **Handler<P>**: 型付き。`TypedHandler<P, H>` で TaskHandler に型消去する

use std::marker::PhantomData;

use async_trait::async_trait;

use super::payload::TaskPayload;
use crate::domain::{Outcome, Task};
use crate::error::HandlerError;

/// The capability every registered handler exposes.
///
/// Return `Ok(Outcome::Failure(..))` for expected failures and `Err` for
/// unexpected ones. Both consume one retry. Handlers must tolerate being run
/// more than once for the same task id.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<Outcome, HandlerError>;
}

/// Typed handler: receives the payload already decoded into `P`.
#[async_trait]
pub trait Handler<P: TaskPayload>: Send + Sync {
    async fn handle(&self, payload: P, task: &Task) -> Result<Outcome, HandlerError>;
}

pub struct TypedHandler<P: TaskPayload, H: Handler<P>> {
    handler: H,
    _marker: PhantomData<P>,
}

impl<P: TaskPayload, H: Handler<P>> TypedHandler<P, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<P: TaskPayload, H: Handler<P>> TaskHandler for TypedHandler<P, H> {
    async fn handle(&self, task: &Task) -> Result<Outcome, HandlerError> {
        let payload: P = serde_json::from_value(task.data.clone())
            .map_err(|e| HandlerError::new(format!("payload decode for {}: {e}", P::HANDLER)))?;
        self.handler.handle(payload, task).await
    }
}
