//! Task trait: binds a payload type to its persisted tag.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A concrete kind of background task.
///
/// # Example
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     user_id: i64,
///     message_id: i64,
/// }
///
/// impl Task for SendEmail {
///     const TYPE: &'static str = "notify.email.send.v1";
/// }
/// ```
///
/// `TYPE` is the discriminator written to the store. Changing it orphans the
/// rows already stored under the old tag.
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}
