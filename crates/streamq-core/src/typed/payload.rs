//! TaskPayload trait - handler 名と payload 型の対応付け
//!
//! # Trait Bounds
//! - `Serialize`: enqueue 時に `data` へ変換するため
//! - `DeserializeOwned`: dispatch 時に `data` から復元するため
//! - `Send + Sync + 'static`: Arc に格納した handler から使うため

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A payload type bound to one handler name.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// impl TaskPayload for SendEmail {
///     const HANDLER: &'static str = "EmailHandler";
/// }
/// ```
pub trait TaskPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const HANDLER: &'static str;
}
