// Bilateral Firmware - Peer Transport
//
// Opaque frames between the two nodes. Receipt timestamps are taken as close
// to the radio as possible (in the receive callback on target) so beacon
// latency estimates are not polluted by task scheduling.

pub mod loopback;

#[cfg(target_os = "espidf")]
pub mod espnow;

pub use loopback::{pair, LinkConfig, LinkControl, LoopbackEndpoint};

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub payload: Vec<u8>,
    /// Local clock at receipt, microseconds.
    pub local_rx_us: u64,
}

pub trait Transport: Send {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError>;

    /// Next received frame, if any. Never blocks.
    fn try_recv(&mut self) -> Result<Option<Received>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        (**self).send(payload)
    }

    fn try_recv(&mut self) -> Result<Option<Received>, TransportError> {
        (**self).try_recv()
    }
}
