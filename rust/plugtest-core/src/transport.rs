//! Transport trait.
//!
//! A transport moves whole msgpack values. Framing is the encoding itself: each
//! frame is one self-delimiting msgpack value written back to back on a byte stream.

use std::future::Future;

use rmpv::Value;

use crate::TransportError;

mod stream;
pub use stream::StreamTransport;

/// Trait for transport implementations.
///
/// Async methods use RPITIT so sessions monomorphize over the concrete transport.
pub trait Transport: Send + Sync + Clone + 'static {
    /// Send one frame.
    fn send_frame(&self, frame: Value)
    -> impl Future<Output = Result<(), TransportError>> + Send + '_;

    /// Receive the next frame. Returns [`TransportError::Closed`] at end of stream.
    ///
    /// Must be cancel-safe: dropping the future keeps partially read bytes for the next call.
    fn recv_frame(&self) -> impl Future<Output = Result<Value, TransportError>> + Send + '_;

    /// Close the write side so the peer observes end of stream.
    ///
    /// After closing, `send_frame` and `recv_frame` return `TransportError::Closed`.
    fn close(&self) -> impl Future<Output = ()> + Send + '_;

    fn is_closed(&self) -> bool;
}
