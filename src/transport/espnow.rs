// Bilateral Firmware - ESP-NOW Peer Link
//
// Connectionless 2.4 GHz link between the two nodes. The receive callback
// runs in the Wi-Fi task: it stamps the frame with esp_timer and hands it to
// a bounded queue that the sync task drains.

use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};

use esp_idf_svc::espnow::{EspNow, PeerInfo};

use crate::config::*;
use crate::error::TransportError;
use crate::transport::{Received, Transport};

pub struct EspNowLink {
    espnow: EspNow<'static>,
    peer: [u8; 6],
    rx: Receiver<Received>,
}

impl EspNowLink {
    /// Requires Wi-Fi to be started (STA mode) before the call.
    pub fn new(peer: [u8; 6]) -> Result<Self, TransportError> {
        let espnow = EspNow::take().map_err(|e| TransportError::Driver(e.code()))?;
        espnow
            .add_peer(PeerInfo {
                peer_addr: peer,
                channel: 0,
                encrypt: false,
                ..Default::default()
            })
            .map_err(|e| TransportError::Driver(e.code()))?;

        let (tx, rx): (SyncSender<Received>, Receiver<Received>) = mpsc::sync_channel(QUEUE_DEPTH);
        espnow
            .register_recv_cb(move |info, data| {
                if peer != BROADCAST_MAC && info.src_addr != &peer {
                    return;
                }
                let local_rx_us = unsafe { esp_idf_sys::esp_timer_get_time() as u64 };
                // Never block the Wi-Fi task; a full queue drops the frame.
                let _ = tx.try_send(Received { payload: data.to_vec(), local_rx_us });
            })
            .map_err(|e| TransportError::Driver(e.code()))?;

        log::info!(target: "transport", "ESP-NOW link up, peer {:02X?}", peer);
        Ok(Self { espnow, peer, rx })
    }
}

impl Transport for EspNowLink {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.espnow
            .send(self.peer, payload)
            .map_err(|e| TransportError::Driver(e.code()))
    }

    fn try_recv(&mut self) -> Result<Option<Received>, TransportError> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }
}
