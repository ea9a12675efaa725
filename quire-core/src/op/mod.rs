//! Typed request/response/subscription RPC over a duplex channel.
//!
//! ```text
//! ┌────────────┐  op / op:subscribe / op:cancel  ┌────────────┐
//! │ OpProducer │ ──────────────────────────────► │ OpConsumer │
//! │  (client)  │ ◄────────────────────────────── │ (storages) │
//! └────────────┘  op:return / op:next / op:cancel└────────────┘
//! ```
//!
//! Operations are dispatched by name. An [`Op`] binds a name to its input
//! and output types; handlers are registered on the consumer per name.

pub mod channel;
pub mod consumer;
pub mod message;
pub mod producer;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use channel::{MessageChannel, Port, PortSender};
pub use consumer::{Emitter, OpConsumer, Subscription};
pub use message::OpMessage;
pub use producer::{OpProducer, OpSubscription, PendingOp};

/// A named operation with typed payload and result.
pub trait Op: Send + Sync + 'static {
    /// Dispatch key.
    const NAME: &'static str;
    type Input: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;
}

/// Declare unit structs implementing [`Op`].
#[macro_export]
macro_rules! define_ops {
    ($($(#[$meta:meta])* $name:ident: $input:ty => $output:ty;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, Default)]
            pub struct $name;

            impl $crate::op::Op for $name {
                const NAME: &'static str = stringify!($name);
                type Input = $input;
                type Output = $output;
            }
        )*
    };
}
