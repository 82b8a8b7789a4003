#![forbid(unsafe_code)]
//! Shared protocol core for plugtest.
//!
//! The harness and the bridge inside the editor speak msgpack-rpc over one
//! [`StreamTransport`]. Both sides wrap it in an [`RpcSession`]: calls and
//! responses correlated by id, notifies, and a [`DispatchTable`] answering the
//! peer. On top sits the [`Invoke`] envelope that carries [`Host`] operations.

mod address;
mod dispatch;
mod error;
mod invoke;
mod message;
mod session;

pub mod host;
pub mod transport;

pub use address::*;
pub use dispatch::*;
pub use error::*;
pub use host::{BatchCall, Context, Host, HostKind, HostMode, META_FUNCTION, Meta, Platform};
pub use invoke::*;
pub use message::*;
pub use session::*;
pub use transport::{StreamTransport, Transport};

pub use rmpv::{self, Value};
