//! A handle to an established ACL connection.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{with_timeout, Duration, Instant};

use crate::att::{AttReq, ATT_ERROR_RSP};
use crate::codec::{Encode, Type};
use crate::config;
use crate::connection_manager::{AttSessionState, Pdu};
pub use crate::connection_manager::Notification;
use crate::hci::ConnParams;
use crate::host::{Adapter, Completion};
use crate::types::l2cap::L2CAP_CID_ATT;
use crate::types::{ConnHandle, DisconnectReason, Role, SecurityLevel};
use crate::{Address, BleHostError, Error, Transport};

/// Connection parameters in effect after an update.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionParams {
    /// Connection interval, 1.25 ms units.
    pub interval: u16,
    /// Peripheral latency in connection events.
    pub latency: u16,
    /// Supervision timeout, 10 ms units.
    pub supervision_timeout: u16,
}

/// Version information of the remote device.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RemoteVersion {
    pub version: u8,
    pub manufacturer: u16,
    pub subversion: u16,
}

/// Out-of-band happenings on a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The link is gone; the reason byte comes from the controller.
    Disconnected { reason: u8 },
    /// The controller asks for the long term key identified by
    /// `rand`/`ediv`. Answer with
    /// [`Adapter::le_long_term_key_request_reply`] or its negative
    /// sibling.
    LongTermKeyRequest { rand: u64, ediv: u16 },
    /// The connection parameters changed.
    ConnParamsUpdated(ConnectionParams),
    /// The PHY changed.
    PhyUpdated { tx_phy: u8, rx_phy: u8 },
    /// Link encryption was enabled or disabled.
    EncryptionChanged { enabled: bool },
    /// A security manager PDU arrived (CID 0x0006). Pairing is handled
    /// outside this stack.
    SmpData { data: Vec<u8> },
}

/// Handle to an ACL connection.
///
/// Clones share the same underlying connection; the slot is recycled
/// once the link is down and the last clone is dropped.
pub struct Connection<'d, M: RawMutex, T: Transport> {
    adapter: &'d Adapter<M, T>,
    index: usize,
    generation: u32,
    handle: ConnHandle,
}

impl<'d, M: RawMutex, T: Transport> Clone for Connection<'d, M, T> {
    fn clone(&self) -> Self {
        self.adapter.connections.inc_ref(self.index);
        Self {
            adapter: self.adapter,
            index: self.index,
            generation: self.generation,
            handle: self.handle,
        }
    }
}

impl<'d, M: RawMutex, T: Transport> Drop for Connection<'d, M, T> {
    fn drop(&mut self) {
        self.adapter.connections.dec_ref(self.index);
    }
}

impl<'d, M: RawMutex, T: Transport> Connection<'d, M, T> {
    pub(crate) fn new(adapter: &'d Adapter<M, T>, index: usize, generation: u32) -> Self {
        adapter.connections.inc_ref(index);
        let handle = adapter
            .connections
            .with_state_any(index, generation, |s| s.handle)
            .unwrap_or(ConnHandle::new(0));
        Self {
            adapter,
            index,
            generation,
            handle,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// The controller's handle for this connection.
    pub fn handle(&self) -> ConnHandle {
        self.handle
    }

    /// Our role on this connection.
    pub fn role(&self) -> Result<Role, Error> {
        self.adapter.connections.with_state(self.index, self.generation, |s| s.role)
    }

    /// The peer's address as reported on connection establishment.
    pub fn peer_address(&self) -> Result<Address, Error> {
        self.adapter.connections.with_state(self.index, self.generation, |s| s.peer)
    }

    /// Whether the link is still up.
    pub fn is_connected(&self) -> bool {
        self.adapter
            .connections
            .with_state(self.index, self.generation, |_| ())
            .is_ok()
    }

    /// The encryption state the ATT permission checks consult.
    pub fn security(&self) -> Result<SecurityLevel, Error> {
        self.adapter
            .connections
            .with_state(self.index, self.generation, |s| s.security)
    }

    /// Record the properties of the key material in use. Called by the
    /// security manager once pairing has finished.
    pub fn set_key_properties(&self, mitm: bool, secure_connections: bool) -> Result<(), Error> {
        self.adapter.connections.with_state(self.index, self.generation, |s| {
            s.security.mitm = mitm;
            s.security.secure_connections = secure_connections;
        })
    }

    /// Mark the peer as bonded (keys stored). Drives CCCD persistence in
    /// the GATT server.
    pub fn set_bonded(&self, bonded: bool) -> Result<(), Error> {
        self.adapter
            .connections
            .with_state(self.index, self.generation, |s| s.bonded = bonded)
    }

    /// Whether the peer is bonded.
    pub fn is_bonded(&self) -> bool {
        self.adapter
            .connections
            .with_state(self.index, self.generation, |s| s.bonded)
            .unwrap_or(false)
    }

    /// The current ATT MTU.
    pub fn att_mtu(&self) -> u16 {
        self.adapter
            .connections
            .with_state(self.index, self.generation, |s| s.att.mtu)
            .unwrap_or(config::ATT_DEFAULT_MTU)
    }

    pub(crate) fn with_att<R>(&self, f: impl FnOnce(&mut AttSessionState) -> R) -> Result<R, Error> {
        self.adapter
            .connections
            .with_state(self.index, self.generation, |s| f(&mut s.att))
    }

    /// The local controller address, as learned during adapter init.
    pub(crate) fn local_address(&self) -> Option<Address> {
        self.adapter.own_address()
    }

    /// Wake tasks held back by an MTU exchange on this connection.
    pub(crate) fn signal_mtu_done(&self) {
        self.adapter.connections.slot(self.index).mtu_done.signal(());
    }

    /// Request disconnection.
    pub async fn disconnect(&self, reason: DisconnectReason) -> Result<(), BleHostError<T::Error>> {
        self.adapter.disconnect(self.handle, reason).await
    }

    /// The next out-of-band event on this connection.
    pub async fn next_event(&self) -> ConnectionEvent {
        self.adapter.connections.slot(self.index).events.receive().await
    }

    /// The next notification or indication received from the peer.
    pub async fn notification(&self) -> Notification {
        self.adapter.connections.slot(self.index).notifications.receive().await
    }

    /// Send an L2CAP PDU on `cid`. Resolves when the last fragment has
    /// been handed to the controller; the returned [`Completion`]
    /// resolves when the controller reports the fragments complete.
    pub async fn send(&self, cid: u16, payload: &[u8]) -> Result<Completion<'d, M, T>, Error> {
        self.adapter.send_l2cap(self.index, self.generation, cid, payload).await
    }

    pub(crate) fn send_nowait(&self, cid: u16, payload: &[u8]) -> Result<(), Error> {
        self.adapter.send_l2cap_nowait(self.index, self.generation, cid, payload)
    }

    /// Update the connection parameters, waiting for the controller to
    /// apply them.
    pub async fn update_params(&self, params: &ConnParams) -> Result<ConnectionParams, BleHostError<T::Error>> {
        let slot = self.adapter.connections.slot(self.index);
        slot.conn_update.reset();
        self.adapter.le_conn_update(self.handle, params).await?;
        Ok(slot.conn_update.wait().await?)
    }

    /// Read the LE feature set of the remote device.
    pub async fn read_remote_features(&self) -> Result<u64, BleHostError<T::Error>> {
        let slot = self.adapter.connections.slot(self.index);
        slot.remote_features.reset();
        self.adapter.le_read_remote_features(self.handle).await?;
        Ok(slot.remote_features.wait().await?)
    }

    /// Read the remote version information.
    pub async fn read_remote_version(&self) -> Result<RemoteVersion, BleHostError<T::Error>> {
        let slot = self.adapter.connections.slot(self.index);
        slot.remote_version.reset();
        self.adapter.read_remote_version(self.handle).await?;
        Ok(slot.remote_version.wait().await?)
    }

    /// Start link encryption with a stored LTK. Central role only.
    pub async fn encrypt(&self, rand: u64, ediv: u16, ltk: &[u8; 16]) -> Result<bool, BleHostError<T::Error>> {
        if self.role()? != Role::Central {
            return Err(Error::NotSupported.into());
        }
        let slot = self.adapter.connections.slot(self.index);
        slot.encryption.reset();
        self.adapter.le_start_encryption(self.handle, rand, ediv, ltk).await?;
        Ok(slot.encryption.wait().await?)
    }

    /// Change the preferred PHY, waiting for the update to take effect.
    pub async fn set_phy(&self, tx_phys: u8, rx_phys: u8) -> Result<(u8, u8), BleHostError<T::Error>> {
        let slot = self.adapter.connections.slot(self.index);
        slot.phy.reset();
        self.adapter.le_set_phy(self.handle, tx_phys, rx_phys).await?;
        Ok(slot.phy.wait().await?)
    }

    /// Read the PHY in use.
    pub async fn read_phy(&self) -> Result<(u8, u8), BleHostError<T::Error>> {
        self.adapter.le_read_phy(self.handle).await
    }

    /// Issue an ATT request and wait for its response.
    ///
    /// One request is outstanding at a time per connection; responses
    /// that do not answer the request are discarded. A request that goes
    /// unanswered for 30 seconds poisons the bearer: the connection is
    /// useless for further ATT traffic.
    pub(crate) async fn att_request(&self, req: &AttReq<'_>) -> Result<Pdu, Error> {
        let slot = self.adapter.connections.slot(self.index);
        let _guard = slot.request_lock.lock().await;
        if self.with_att(|att| att.timed_out)? {
            return Err(Error::Timeout);
        }

        let mut pdu = vec![0u8; req.size()];
        req.encode(&mut pdu)?;
        let expected = req.opcode() + 1;

        slot.att_response.reset();
        self.send(L2CAP_CID_ATT, &pdu).await?;
        if !req.expects_response() {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + config::ATT_TIMEOUT;
        loop {
            let now = Instant::now();
            let remaining = if deadline > now {
                deadline - now
            } else {
                Duration::from_ticks(0)
            };
            match with_timeout(remaining, slot.att_response.wait()).await {
                Ok(rsp) => {
                    let opcode = rsp.first().copied().unwrap_or(0);
                    if opcode == expected || opcode == ATT_ERROR_RSP {
                        return Ok(rsp);
                    }
                    debug!("[att] discarding unexpected response {:02x}", opcode);
                }
                Err(_) => {
                    warn!("[att] request {:02x} timed out, bearer is dead", req.opcode());
                    let _ = self.with_att(|att| att.timed_out = true);
                    return Err(Error::Timeout);
                }
            }
        }
    }
}
