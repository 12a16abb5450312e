//! A scripted in-memory transport for tests.

use core::convert::Infallible;
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use crate::hci;
use crate::types::ConnHandle;
use crate::Transport;

struct Inner {
    to_host: Channel<CriticalSectionRawMutex, Vec<u8>, 32>,
    from_host: Channel<CriticalSectionRawMutex, Vec<u8>, 32>,
}

/// Both ends of a fake controller link. Clones share the queues: the
/// test side plays controller with [`MockTransport::controller_sends`]
/// and [`MockTransport::host_packet`].
#[derive(Clone)]
pub(crate) struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                to_host: Channel::new(),
                from_host: Channel::new(),
            }),
        }
    }

    /// Queue a controller-to-host packet.
    pub async fn controller_sends(&self, packet: &[u8]) {
        self.inner.to_host.send(packet.to_vec()).await;
    }

    /// The next host-to-controller packet.
    pub async fn host_packet(&self) -> Vec<u8> {
        self.inner.from_host.receive().await
    }

    pub fn try_host_packet(&self) -> Option<Vec<u8>> {
        self.inner.from_host.try_receive().ok()
    }

    /// Build an event packet.
    pub fn event(code: u8, params: &[u8]) -> Vec<u8> {
        let mut pkt = vec![hci::HCI_PACKET_EVENT, code, params.len() as u8];
        pkt.extend_from_slice(params);
        pkt
    }

    /// Build a Command Complete event for `opcode`.
    pub fn command_complete(opcode: hci::Opcode, return_params: &[u8]) -> Vec<u8> {
        let mut params = vec![1];
        params.extend_from_slice(&opcode.0.to_le_bytes());
        params.extend_from_slice(return_params);
        Self::event(hci::EVT_COMMAND_COMPLETE, &params)
    }

    /// Build a Command Status event for `opcode`.
    pub fn command_status(opcode: hci::Opcode, status: u8) -> Vec<u8> {
        let mut params = vec![status, 1];
        params.extend_from_slice(&opcode.0.to_le_bytes());
        Self::event(hci::EVT_COMMAND_STATUS, &params)
    }

    /// Build an ACL data packet (first fragment carrying a complete
    /// L2CAP PDU unless `continuing`).
    pub fn acl(handle: ConnHandle, continuing: bool, payload: &[u8]) -> Vec<u8> {
        let pb: u16 = if continuing { 0b01 } else { 0b10 };
        let mut pkt = vec![hci::HCI_PACKET_ACL_DATA];
        pkt.extend_from_slice(&(handle.raw() | (pb << 12)).to_le_bytes());
        pkt.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        pkt.extend_from_slice(payload);
        pkt
    }

    /// Wrap an ATT PDU in a complete single-fragment ACL packet.
    pub fn acl_att(handle: ConnHandle, att_pdu: &[u8]) -> Vec<u8> {
        let mut l2cap = Vec::with_capacity(4 + att_pdu.len());
        l2cap.extend_from_slice(&(att_pdu.len() as u16).to_le_bytes());
        l2cap.extend_from_slice(&0x0004u16.to_le_bytes());
        l2cap.extend_from_slice(att_pdu);
        Self::acl(handle, false, &l2cap)
    }

    /// Build a Number Of Completed Packets event for one handle.
    pub fn completed_packets(handle: ConnHandle, count: u16) -> Vec<u8> {
        let mut params = vec![1];
        params.extend_from_slice(&handle.raw().to_le_bytes());
        params.extend_from_slice(&count.to_le_bytes());
        Self::event(hci::EVT_NUMBER_OF_COMPLETED_PACKETS, &params)
    }

    /// Build an LE Connection Complete meta event.
    pub fn le_connection_complete(handle: ConnHandle, role: u8, peer: [u8; 6]) -> Vec<u8> {
        let mut params = vec![hci::LE_CONNECTION_COMPLETE, 0x00];
        params.extend_from_slice(&handle.raw().to_le_bytes());
        params.push(role);
        params.push(0x00); // public peer
        params.extend_from_slice(&peer);
        params.extend_from_slice(&0x0028u16.to_le_bytes());
        params.extend_from_slice(&0u16.to_le_bytes());
        params.extend_from_slice(&0x00C8u16.to_le_bytes());
        params.push(0);
        Self::event(hci::EVT_LE_META, &params)
    }

    /// Build a Disconnection Complete event.
    pub fn disconnection_complete(handle: ConnHandle, reason: u8) -> Vec<u8> {
        let mut params = vec![0x00];
        params.extend_from_slice(&handle.raw().to_le_bytes());
        params.push(reason);
        Self::event(hci::EVT_DISCONNECTION_COMPLETE, &params)
    }
}

impl embedded_io::ErrorType for MockTransport {
    type Error = Infallible;
}

impl Transport for MockTransport {
    async fn write(&self, packet: &[u8]) -> Result<(), Self::Error> {
        self.inner.from_host.send(packet.to_vec()).await;
        Ok(())
    }

    async fn read<'a>(&self, buf: &'a mut [u8]) -> Result<&'a [u8], Self::Error> {
        let packet = self.inner.to_host.receive().await;
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(&buf[..packet.len()])
    }
}
