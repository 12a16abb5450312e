//! GATT server implementation.
//!
//! The server owns the attribute table, processes inbound ATT traffic
//! against it and pushes notifications and indications out. Bonded
//! peers get their CCCD subscriptions persisted through the
//! [`Store`] and restored when they reconnect.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::with_timeout;

use crate::att::{self, AttErrorCode, AttReq};
use crate::attribute::{
    AttributeTable, AttributeValue, Characteristic, CharacteristicHandle, CharacteristicProp, Permission, Service,
    ServiceHandle, CHARACTERISTIC_APPEARANCE_UUID16, CHARACTERISTIC_DEVICE_NAME_UUID16,
    CHARACTERISTIC_SERVICE_CHANGED_UUID16, GENERIC_ACCESS_SERVICE_UUID16, GENERIC_ATTRIBUTE_SERVICE_UUID16,
};
use crate::attribute_server::{cccd_for_value_handle, AttributeServer, SubscriptionTable};
use crate::config;
use crate::connection::Connection;
use crate::cursor::WriteCursor;
use crate::host::Adapter;
use crate::store::Store;
use crate::types::l2cap::L2CAP_CID_ATT;
use crate::types::uuid::Uuid;
use crate::types::ConnHandle;
use crate::{Error, Transport};

pub mod client;

/// Identifies the attribute a [`GattHandler`] call is about.
pub struct AttrDesc<'a> {
    /// The attribute UUID.
    pub uuid: &'a Uuid,
    /// The attribute handle.
    pub handle: u16,
    /// The connection performing the operation.
    pub conn: ConnHandle,
}

/// User hooks for externally handled attribute values.
///
/// Every capability is optional: the defaults authorize everything and
/// refuse reads and writes, matching a server whose values all live in
/// the table.
pub trait GattHandler {
    /// Authorize a read of an attribute with `Permission::Custom`.
    async fn authorize_read(&mut self, attr: &AttrDesc<'_>) -> Result<(), AttErrorCode> {
        let _ = attr;
        Ok(())
    }

    /// Authorize a write of an attribute with `Permission::Custom`.
    async fn authorize_write(&mut self, attr: &AttrDesc<'_>) -> Result<(), AttErrorCode> {
        let _ = attr;
        Ok(())
    }

    /// Read an externally handled value, starting at `offset`. Returns
    /// the number of bytes placed into `data`.
    async fn read(&mut self, attr: &AttrDesc<'_>, offset: usize, data: &mut [u8]) -> Result<usize, AttErrorCode> {
        let _ = (attr, offset, data);
        Err(AttErrorCode::ReadNotPermitted)
    }

    /// Write an externally handled value at `offset`.
    async fn write(&mut self, attr: &AttrDesc<'_>, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        let _ = (attr, offset, data);
        Err(AttErrorCode::WriteNotPermitted)
    }

    /// A peer subscribed to or unsubscribed from a characteristic.
    ///
    /// `from_write` is true when caused by an actual CCCD write, false
    /// when restored from storage on reconnect or cleared on disconnect.
    fn subscription_changed(&mut self, attr: &AttrDesc<'_>, notifications: bool, indications: bool, from_write: bool) {
        let _ = (attr, notifications, indications, from_write);
    }
}

impl<T> GattHandler for &mut T
where
    T: GattHandler,
{
    async fn authorize_read(&mut self, attr: &AttrDesc<'_>) -> Result<(), AttErrorCode> {
        (**self).authorize_read(attr).await
    }

    async fn authorize_write(&mut self, attr: &AttrDesc<'_>) -> Result<(), AttErrorCode> {
        (**self).authorize_write(attr).await
    }

    async fn read(&mut self, attr: &AttrDesc<'_>, offset: usize, data: &mut [u8]) -> Result<usize, AttErrorCode> {
        (**self).read(attr, offset, data).await
    }

    async fn write(&mut self, attr: &AttrDesc<'_>, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        (**self).write(attr, offset, data).await
    }

    fn subscription_changed(&mut self, attr: &AttrDesc<'_>, notifications: bool, indications: bool, from_write: bool) {
        (**self).subscription_changed(attr, notifications, indications, from_write)
    }
}

/// A no-op handler for servers whose values all live in the table.
pub struct NoHandler;

impl GattHandler for NoHandler {}

/// A GATT server over the connections of one adapter.
pub struct GattServer<'d, M: RawMutex, T: Transport> {
    adapter: &'d Adapter<M, T>,
    table: AttributeTable<M>,
    subscriptions: SubscriptionTable<M>,
    store: Option<&'d Store>,
    device_name: CharacteristicHandle,
    appearance: CharacteristicHandle,
    service_changed: CharacteristicHandle,
}

impl<'d, M: RawMutex, T: Transport> GattServer<'d, M, T> {
    /// Create a server with the mandatory GATT and GAP services in
    /// place. `store` enables CCCD persistence for bonded peers.
    pub fn new(adapter: &'d Adapter<M, T>, store: Option<&'d Store>) -> Result<Self, Error> {
        let table = AttributeTable::new();

        let gatt = table.add_services(vec![Service::new(GENERIC_ATTRIBUTE_SERVICE_UUID16).characteristic(
            Characteristic::new(CHARACTERISTIC_SERVICE_CHANGED_UUID16, [CharacteristicProp::Indicate])
                .max_len(4)
                .value(AttributeValue::Bytes(Vec::new())),
        )])?;
        let gap = table.add_services(vec![Service::new(GENERIC_ACCESS_SERVICE_UUID16)
            .characteristic(
                Characteristic::new(CHARACTERISTIC_DEVICE_NAME_UUID16, [CharacteristicProp::Read])
                    .read_perm(Permission::Open)
                    .max_len(248)
                    .value(AttributeValue::Str(String::new())),
            )
            .characteristic(
                Characteristic::new(CHARACTERISTIC_APPEARANCE_UUID16, [CharacteristicProp::Read])
                    .read_perm(Permission::Open)
                    .max_len(2)
                    .value(AttributeValue::Bytes(vec![0, 0])),
            )])?;

        Ok(Self {
            adapter,
            table,
            subscriptions: SubscriptionTable::new(),
            store,
            device_name: gap[0].characteristics[0],
            appearance: gap[0].characteristics[1],
            service_changed: gatt[0].characteristics[0],
        })
    }

    /// The attribute table backing this server.
    pub fn table(&self) -> &AttributeTable<M> {
        &self.table
    }

    /// Add user services. Either the whole batch is placed or nothing.
    pub fn add_services(&self, services: Vec<Service>) -> Result<Vec<ServiceHandle>, Error> {
        self.table.add_services(services)
    }

    /// Remove the service starting at `start`.
    ///
    /// Signalling Service Changed to subscribed peers is the caller's
    /// business, via [`GattServer::indicate`] on
    /// [`GattServer::service_changed_characteristic`].
    pub fn remove_service(&self, start: u16) -> Result<(), Error> {
        self.table.remove_service(start)
    }

    /// Set the GAP Device Name (up to 248 bytes of UTF-8).
    pub fn set_device_name(&self, name: &str) -> Result<(), Error> {
        if name.len() > 248 {
            return Err(Error::InvalidArgument);
        }
        self.table
            .write_stored(self.device_name.value, 0, name.as_bytes())
            .map_err(Error::Att)
    }

    /// Set the GAP Appearance value.
    pub fn set_appearance(&self, appearance: u16) -> Result<(), Error> {
        self.table
            .write_stored(self.appearance.value, 0, &appearance.to_le_bytes())
            .map_err(Error::Att)
    }

    /// The Service Changed characteristic of the mandatory GATT service.
    pub fn service_changed_characteristic(&self) -> CharacteristicHandle {
        self.service_changed
    }

    fn server(&self) -> AttributeServer<'_, M> {
        AttributeServer {
            table: &self.table,
            subscriptions: &self.subscriptions,
            store: self.store,
            own: self.adapter.own_address(),
        }
    }

    fn ltk_stored(&self, conn: &Connection<'_, M, T>) -> bool {
        match (self.store, self.adapter.own_address(), conn.peer_address()) {
            (Some(store), Some(own), Ok(peer)) => store
                .get_keys(own, peer)
                .map(|keys| keys.local_ltk.is_some() || keys.peer_ltk.is_some())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Process inbound ATT requests with the supplied handler. Run this
    /// for as long as the server lives.
    pub async fn run<H: GattHandler>(&self, handler: &mut H) -> Result<(), Error> {
        let server = self.server();
        loop {
            let (index, generation, pdu) = self.adapter.att_inbound.receive().await;
            let conn = Connection::new(self.adapter, index, generation);
            if !conn.is_connected() {
                continue;
            }
            let req = match AttReq::decode(&pdu) {
                Ok(req) => req,
                Err(_) => {
                    // Malformed PDUs are dropped; the peer times out.
                    debug!("[gatt] dropping malformed att pdu");
                    continue;
                }
            };

            let expects_response = req.expects_response();
            if expects_response && conn.with_att(|att| att.server_busy).unwrap_or(true) {
                continue;
            }
            if expects_response {
                let _ = conn.with_att(|att| att.server_busy = true);
            }

            let mut rx = vec![0u8; config::ATT_SERVER_RX_MTU as usize];
            let ltk_stored = self.ltk_stored(&conn);
            let result = server.process(&conn, ltk_stored, &req, &mut rx, handler).await;
            let _ = conn.with_att(|att| att.server_busy = false);

            match result {
                Ok(Some(len)) => {
                    if let Err(e) = conn.send(L2CAP_CID_ATT, &rx[..len]).await {
                        debug!("[gatt] response not sent: {:?}", e);
                    }
                }
                Ok(None) => {}
                Err(Error::Disconnected) => {}
                Err(e) => {
                    warn!("[gatt] error processing request: {:?}", e);
                }
            }
        }
    }

    /// Notify a connection with a new characteristic value.
    ///
    /// A connection that has not subscribed is silently skipped. While
    /// our own MTU exchange is in flight the notification is held back
    /// and flushed, in order, when the exchange settles.
    pub async fn notify(
        &self,
        conn: &Connection<'_, M, T>,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<(), Error> {
        let cccd = characteristic
            .cccd
            .or_else(|| cccd_for_value_handle(&self.table, characteristic.value))
            .ok_or(Error::NotSupported)?;
        if self.subscriptions.get(cccd, conn.handle()) & 0x01 == 0 {
            return Ok(());
        }

        let mtu = conn.att_mtu() as usize;
        let mut pdu = vec![0u8; (3 + value.len()).min(mtu)];
        let mut w = WriteCursor::new(&mut pdu);
        w.write(att::ATT_HANDLE_VALUE_NTF)?;
        w.write(characteristic.value)?;
        let room = w.available().min(value.len());
        w.append(&value[..room])?;
        let len = w.len();
        pdu.truncate(len);

        let deferred = conn.with_att(|att| {
            if att.mtu_exchange_pending {
                att.held_notifications.push_back(pdu.clone());
                true
            } else {
                false
            }
        })?;
        if deferred {
            return Ok(());
        }
        conn.send(L2CAP_CID_ATT, &pdu).await?;
        Ok(())
    }

    /// Indicate a new characteristic value and wait for the peer's
    /// confirmation. Indications are serialized per connection; an
    /// unconfirmed indication times out after 30 seconds and poisons
    /// the bearer.
    pub async fn indicate(
        &self,
        conn: &Connection<'_, M, T>,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<(), Error> {
        let cccd = characteristic
            .cccd
            .or_else(|| cccd_for_value_handle(&self.table, characteristic.value))
            .ok_or(Error::NotSupported)?;
        if self.subscriptions.get(cccd, conn.handle()) & 0x02 == 0 {
            return Ok(());
        }

        let slot = self.adapter.connections.slot(conn.index());
        let _guard = slot.indication_lock.lock().await;
        if conn.with_att(|att| att.timed_out)? {
            return Err(Error::Timeout);
        }
        // Indications queued during an MTU exchange are released after
        // the held notifications.
        while conn.with_att(|att| att.mtu_exchange_pending)? {
            slot.mtu_done.wait().await;
        }

        let mtu = conn.att_mtu() as usize;
        let mut pdu = vec![0u8; (3 + value.len()).min(mtu)];
        let mut w = WriteCursor::new(&mut pdu);
        w.write(att::ATT_HANDLE_VALUE_IND)?;
        w.write(characteristic.value)?;
        let room = w.available().min(value.len());
        w.append(&value[..room])?;
        let len = w.len();
        pdu.truncate(len);

        slot.att_confirm.reset();
        conn.with_att(|att| att.indication_pending = true)?;
        conn.send(L2CAP_CID_ATT, &pdu).await?;

        match with_timeout(config::ATT_TIMEOUT, slot.att_confirm.wait()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!("[gatt] indication unconfirmed for 30s, bearer is dead");
                let _ = conn.with_att(|att| {
                    att.indication_pending = false;
                    att.timed_out = true;
                });
                Err(Error::Timeout)
            }
        }
    }

    /// First connection phase for a bonded peer: restore its persisted
    /// CCCD values.
    pub fn connection_opened(&self, conn: &Connection<'_, M, T>) -> Result<(), Error> {
        if !conn.is_bonded() {
            return Ok(());
        }
        let (Some(store), Some(own), Ok(peer)) = (self.store, self.adapter.own_address(), conn.peer_address()) else {
            return Ok(());
        };
        for (cccd, _, _, _) in self.table.cccd_handles() {
            if let Some(value) = store.get_cccd(own, peer, cccd) {
                self.subscriptions.set(cccd, conn.handle(), value);
            }
        }
        Ok(())
    }

    /// Second connection phase: report restored subscriptions to the
    /// handler, before any ATT traffic is processed for the peer.
    pub fn connection_ready<H: GattHandler>(&self, conn: &Connection<'_, M, T>, handler: &mut H) -> Result<(), Error> {
        for (cccd, value_handle, _, _) in self.table.cccd_handles() {
            let value = self.subscriptions.get(cccd, conn.handle());
            if value != 0 {
                if let Some(uuid) = self.table.with_attr(value_handle, |a| a.uuid.clone()) {
                    handler.subscription_changed(
                        &AttrDesc {
                            uuid: &uuid,
                            handle: value_handle,
                            conn: conn.handle(),
                        },
                        value & 0x01 != 0,
                        value & 0x02 != 0,
                        false,
                    );
                }
            }
        }
        Ok(())
    }

    /// Tear down per-connection subscription state after a disconnect.
    pub fn connection_closed<H: GattHandler>(&self, conn: ConnHandle, handler: &mut H) {
        for (cccd, value) in self.subscriptions.remove_conn(conn) {
            if value == 0 {
                continue;
            }
            let Some(value_handle) = self
                .table
                .cccd_handles()
                .into_iter()
                .find(|(c, _, _, _)| *c == cccd)
                .map(|(_, vh, _, _)| vh)
            else {
                continue;
            };
            if let Some(uuid) = self.table.with_attr(value_handle, |a| a.uuid.clone()) {
                handler.subscription_changed(
                    &AttrDesc {
                        uuid: &uuid,
                        handle: value_handle,
                        conn,
                    },
                    false,
                    false,
                    false,
                );
            }
        }
    }

    /// Persist the current CCCD values of a peer that just bonded.
    pub fn bond_established(&self, conn: &Connection<'_, M, T>) -> Result<(), Error> {
        let (Some(store), Some(own), Ok(peer)) = (self.store, self.adapter.own_address(), conn.peer_address()) else {
            return Ok(());
        };
        for (cccd, value) in self.subscriptions.entries_for_conn(conn.handle()) {
            store.store_cccd(own, peer, cccd, value);
        }
        Ok(())
    }
}
