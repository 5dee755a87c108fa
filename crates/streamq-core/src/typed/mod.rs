//! Typed - handler API
//!
//! handler 名の typo を型で排除し、payload 型との対応付けを静的に保証します。

pub mod handler;
pub mod payload;
pub mod registry;

pub use self::handler::{Handler, TaskHandler, TypedHandler};
pub use self::payload::TaskPayload;
pub use self::registry::{HandlerRegistry, RegistryError};
