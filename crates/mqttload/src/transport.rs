use mqttload_protocol::{Packet, Result};
use std::future::Future;

/// One decoded-packet connection to a broker.
///
/// Encoding, sockets and TLS live behind this trait. A session owns exactly
/// one transport for its whole life.
pub trait Transport: Send + 'static {
    /// Sends a packet
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is broken
    fn send(&mut self, packet: Packet) -> impl Future<Output = Result<()>> + Send;

    /// Receives the next packet, `None` once the broker closed the connection.
    ///
    /// Must be cancel-safe: the session polls it inside `select!`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is broken
    fn recv(&mut self) -> impl Future<Output = Result<Option<Packet>>> + Send;

    /// Closes the connection
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be closed cleanly
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Opens transports to an endpoint.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be reached
    fn open(&self, endpoint: &str) -> impl Future<Output = Result<Self::Transport>> + Send;
}
