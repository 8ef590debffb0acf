//! Typed - 型付き Task API
//!
//! Ties a payload type to its stored tag and its handler at compile time.
//!
//! # Two layers
//! - **Typed**: `Task`, `Handler<T>`, `Envelope<T>` - what business modules see
//! - **Dyn**: `DynHandler` - object-safe, works on raw `TaskRecord`s

pub mod codec;
pub mod handler;
pub mod registry;
pub mod task;

pub use self::codec::PayloadCodec;
pub use self::handler::{DynHandler, Envelope, Handler, TypedHandler};
pub use self::registry::{Registration, RegistryError, TypedRegistry};
pub use self::task::Task;
