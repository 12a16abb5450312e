//! The ATT server: dispatches request PDUs against the attribute table.

use core::cell::RefCell;
use std::collections::HashMap;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::att::{self, AttErrorCode, AttReq};
use crate::attribute::{AttrSnapshot, AttributeTable, Permission, PRIMARY_SERVICE_UUID16, SECONDARY_SERVICE_UUID16};
use crate::config;
use crate::connection::Connection;
use crate::connection_manager::PreparedWrite;
use crate::cursor::WriteCursor;
use crate::gatt::{AttrDesc, GattHandler};
use crate::store::Store;
use crate::types::uuid::Uuid;
use crate::types::ConnHandle;
use crate::{Address, Error, Transport};

/// Per-connection CCCD values, keyed by descriptor handle and connection.
pub(crate) struct SubscriptionTable<M: RawMutex> {
    state: Mutex<M, RefCell<HashMap<(u16, ConnHandle), u8>>>,
}

impl<M: RawMutex> SubscriptionTable<M> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn get(&self, cccd: u16, conn: ConnHandle) -> u8 {
        self.state.lock(|s| s.borrow().get(&(cccd, conn)).copied().unwrap_or(0))
    }

    pub fn set(&self, cccd: u16, conn: ConnHandle, value: u8) {
        self.state.lock(|s| {
            s.borrow_mut().insert((cccd, conn), value);
        });
    }

    /// Drop all entries of `conn`, returning `(cccd, value)` pairs.
    pub fn remove_conn(&self, conn: ConnHandle) -> Vec<(u16, u8)> {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let doomed: Vec<(u16, ConnHandle)> = s.keys().filter(|(_, c)| *c == conn).copied().collect();
            doomed
                .into_iter()
                .map(|key| {
                    let value = s.remove(&key).unwrap_or(0);
                    (key.0, value)
                })
                .collect()
        })
    }

    pub fn entries_for_conn(&self, conn: ConnHandle) -> Vec<(u16, u8)> {
        self.state.lock(|s| {
            s.borrow()
                .iter()
                .filter(|((_, c), _)| *c == conn)
                .map(|((cccd, _), v)| (*cccd, *v))
                .collect()
        })
    }
}

/// Error classes of a Read Multiple, most severe first.
fn error_rank(code: AttErrorCode) -> u8 {
    match code {
        AttErrorCode::InsufficientAuthorization => 0,
        AttErrorCode::InsufficientAuthentication => 1,
        AttErrorCode::InsufficientEncryptionKeySize => 2,
        AttErrorCode::InsufficientEncryption => 3,
        AttErrorCode::ReadNotPermitted => 4,
        _ => 5,
    }
}

/// Processes ATT requests for one attribute table.
pub(crate) struct AttributeServer<'a, M: RawMutex> {
    pub table: &'a AttributeTable<M>,
    pub subscriptions: &'a SubscriptionTable<M>,
    pub store: Option<&'a Store>,
    pub own: Option<Address>,
}

impl<'a, M: RawMutex> AttributeServer<'a, M> {
    fn error_response(mut w: WriteCursor<'_>, opcode: u8, handle: u16, code: AttErrorCode) -> Result<usize, Error> {
        w.reset();
        w.write(att::ATT_ERROR_RSP)?;
        w.write(opcode)?;
        w.write(handle)?;
        w.write(code.to_raw())?;
        Ok(w.len())
    }

    fn desc<'c, T: Transport>(conn: &'c Connection<'_, M, T>, snap: &'c AttrSnapshot) -> AttrDesc<'c> {
        AttrDesc {
            uuid: &snap.uuid,
            handle: snap.handle,
            conn: conn.handle(),
        }
    }

    /// Read an attribute's value through its dispatcher. The permission
    /// check against the link security has already happened; this runs
    /// the authorize hook for custom permissions and routes stored,
    /// external and CCCD values.
    async fn dispatch_read<H: GattHandler, T: Transport>(
        &self,
        conn: &Connection<'_, M, T>,
        handler: &mut H,
        snap: &AttrSnapshot,
        offset: usize,
    ) -> Result<Vec<u8>, AttErrorCode> {
        if snap.read_perm == Permission::Custom {
            handler.authorize_read(&Self::desc(conn, snap)).await?;
        }
        if snap.is_cccd {
            let value = self.subscriptions.get(snap.handle, conn.handle());
            let bytes = [value, 0x00];
            if offset > bytes.len() {
                return Err(AttErrorCode::InvalidOffset);
            }
            return Ok(bytes[offset..].to_vec());
        }
        if snap.external {
            let mut buf = vec![0u8; config::ATT_MAX_VALUE_LEN];
            let len = handler.read(&Self::desc(conn, snap), offset, &mut buf).await?;
            buf.truncate(len.min(config::ATT_MAX_VALUE_LEN));
            return Ok(buf);
        }
        self.table.read_stored(snap.handle, offset)
    }

    /// Write an attribute's value through its dispatcher.
    async fn dispatch_write<H: GattHandler, T: Transport>(
        &self,
        conn: &Connection<'_, M, T>,
        handler: &mut H,
        snap: &AttrSnapshot,
        offset: usize,
        data: &[u8],
        authorize: bool,
    ) -> Result<(), AttErrorCode> {
        if authorize && snap.write_perm == Permission::Custom {
            handler.authorize_write(&Self::desc(conn, snap)).await?;
        }
        if snap.is_cccd {
            return self.cccd_write(conn, handler, snap, offset, data).await;
        }
        if offset > snap.max_len {
            return Err(AttErrorCode::InvalidOffset);
        }
        if offset + data.len() > snap.max_len {
            return Err(AttErrorCode::InvalidAttributeValueLength);
        }
        if snap.external {
            return handler.write(&Self::desc(conn, snap), offset, data).await;
        }
        self.table.write_stored(snap.handle, offset, data)
    }

    /// The CCCD write rules: exactly two bytes at offset zero, the upper
    /// byte clear, and each bit backed by the matching characteristic
    /// property.
    async fn cccd_write<H: GattHandler, T: Transport>(
        &self,
        conn: &Connection<'_, M, T>,
        handler: &mut H,
        snap: &AttrSnapshot,
        offset: usize,
        data: &[u8],
    ) -> Result<(), AttErrorCode> {
        if offset != 0 {
            return Err(AttErrorCode::InvalidOffset);
        }
        if data.len() != 2 || data[1] != 0 || data[0] > 0x03 {
            return Err(AttErrorCode::CccdImproperlyConfigured);
        }
        let value = data[0];
        let notifications = value & 0x01 != 0;
        let indications = value & 0x02 != 0;
        let (value_handle, notify_allowed, indicate_allowed) = self
            .table
            .with_attr(snap.handle, |a| match a.data {
                crate::attribute::AttributeData::Cccd {
                    value_handle,
                    notify_allowed,
                    indicate_allowed,
                } => (value_handle, notify_allowed, indicate_allowed),
                _ => (0, false, false),
            })
            .ok_or(AttErrorCode::InvalidHandle)?;
        if (notifications && !notify_allowed) || (indications && !indicate_allowed) {
            return Err(AttErrorCode::CccdImproperlyConfigured);
        }

        let previous = self.subscriptions.get(snap.handle, conn.handle());
        self.subscriptions.set(snap.handle, conn.handle(), value);

        if previous != value && conn.is_bonded() {
            if let (Some(store), Some(own), Ok(peer)) = (self.store, self.own, conn.peer_address()) {
                store.store_cccd(own, peer, snap.handle, value);
            }
        }
        // The change is reported against the characteristic value, not
        // the descriptor.
        let uuid = self
            .table
            .with_attr(value_handle, |a| a.uuid.clone())
            .ok_or(AttErrorCode::InvalidHandle)?;
        handler.subscription_changed(
            &AttrDesc {
                uuid: &uuid,
                handle: value_handle,
                conn: conn.handle(),
            },
            notifications,
            indications,
            true,
        );
        Ok(())
    }

    async fn handle_exchange_mtu<T: Transport>(
        &self,
        conn: &Connection<'_, M, T>,
        client_mtu: u16,
        rx: &mut [u8],
    ) -> Result<usize, Error> {
        conn.with_att(|att| att.apply_mtu(client_mtu, config::ATT_SERVER_RX_MTU))?;
        let mut w = WriteCursor::new(rx);
        w.write(att::ATT_EXCHANGE_MTU_RSP)?;
        w.write(config::ATT_SERVER_RX_MTU)?;
        Ok(w.len())
    }

    async fn handle_find_information<T: Transport>(
        &self,
        conn: &Connection<'_, M, T>,
        start: u16,
        end: u16,
        rx: &mut [u8],
    ) -> Result<usize, Error> {
        let mtu = conn.att_mtu() as usize;
        let w = WriteCursor::new(rx);
        if start == 0 || start > end {
            return Self::error_response(w, att::ATT_FIND_INFORMATION_REQ, start, AttErrorCode::InvalidHandle);
        }

        let snaps = self.table.snapshot_range(start, end);
        let mut format = 0u8;
        let mut entries: Vec<(u16, Uuid)> = Vec::new();
        let mut used = 2usize;
        for snap in snaps {
            let entry_format = snap.uuid.get_type();
            if format == 0 {
                format = entry_format;
            } else if format != entry_format {
                // One format per response.
                break;
            }
            let entry_len = 2 + snap.uuid.as_raw().len();
            if used + entry_len > mtu {
                break;
            }
            used += entry_len;
            entries.push((snap.handle, snap.uuid));
        }

        if entries.is_empty() {
            return Self::error_response(w, att::ATT_FIND_INFORMATION_REQ, start, AttErrorCode::AttributeNotFound);
        }
        let mut w = w;
        w.write(att::ATT_FIND_INFORMATION_RSP)?;
        w.write(format)?;
        for (handle, uuid) in entries {
            w.write(handle)?;
            w.append(uuid.as_raw())?;
        }
        Ok(w.len())
    }

    async fn handle_find_by_type_value<H: GattHandler, T: Transport>(
        &self,
        conn: &Connection<'_, M, T>,
        handler: &mut H,
        ltk_stored: bool,
        start: u16,
        end: u16,
        att_type: u16,
        att_value: &[u8],
        rx: &mut [u8],
    ) -> Result<usize, Error> {
        let mtu = conn.att_mtu() as usize;
        let w = WriteCursor::new(rx);
        if start == 0 || start > end {
            return Self::error_response(w, att::ATT_FIND_BY_TYPE_VALUE_REQ, start, AttErrorCode::InvalidHandle);
        }
        let security = conn.security().unwrap_or_default();
        let wanted = Uuid::new_short(att_type);
        let cap = (mtu - 1) / 4;

        let mut found: Vec<(u16, u16)> = Vec::new();
        for snap in self.table.snapshot_range(start, end) {
            if found.len() >= cap {
                break;
            }
            if !snap.uuid.matches(&wanted) {
                continue;
            }
            if snap.read_perm.check(&security, ltk_stored, false).is_err() {
                continue;
            }
            let value = match self.dispatch_read(conn, handler, &snap, 0).await {
                Ok(value) => value,
                Err(_) => continue,
            };
            if value == att_value {
                found.push((snap.handle, snap.group_end.unwrap_or(snap.handle)));
            }
        }

        if found.is_empty() {
            return Self::error_response(w, att::ATT_FIND_BY_TYPE_VALUE_REQ, start, AttErrorCode::AttributeNotFound);
        }
        let mut w = w;
        w.write(att::ATT_FIND_BY_TYPE_VALUE_RSP)?;
        for (handle, group_end) in found {
            w.write(handle)?;
            w.write(group_end)?;
        }
        Ok(w.len())
    }

    async fn handle_read_by_type<H: GattHandler, T: Transport>(
        &self,
        conn: &Connection<'_, M, T>,
        handler: &mut H,
        ltk_stored: bool,
        start: u16,
        end: u16,
        attribute_type: &Uuid,
        rx: &mut [u8],
    ) -> Result<usize, Error> {
        let mtu = conn.att_mtu() as usize;
        let w = WriteCursor::new(rx);
        if start == 0 || start > end {
            return Self::error_response(w, att::ATT_READ_BY_TYPE_REQ, start, AttErrorCode::InvalidHandle);
        }
        let security = conn.security().unwrap_or_default();

        let mut entries: Vec<(u16, Vec<u8>)> = Vec::new();
        let mut value_len = 0usize;
        let mut used = 2usize;
        for snap in self.table.snapshot_range(start, end) {
            if !snap.uuid.matches(attribute_type) {
                continue;
            }
            if let Err(code) = snap.read_perm.check(&security, ltk_stored, false) {
                if entries.is_empty() {
                    return Self::error_response(w, att::ATT_READ_BY_TYPE_REQ, snap.handle, code);
                }
                break;
            }
            let mut value = match self.dispatch_read(conn, handler, &snap, 0).await {
                Ok(value) => value,
                Err(code) => {
                    if entries.is_empty() {
                        return Self::error_response(w, att::ATT_READ_BY_TYPE_REQ, snap.handle, code);
                    }
                    break;
                }
            };
            value.truncate((mtu - 4).min(253));

            if entries.is_empty() {
                value_len = value.len();
            } else if value.len() != value_len {
                // All values in one response share a length.
                break;
            }
            if used + 2 + value_len > mtu {
                break;
            }
            used += 2 + value_len;
            entries.push((snap.handle, value));
        }

        if entries.is_empty() {
            return Self::error_response(w, att::ATT_READ_BY_TYPE_REQ, start, AttErrorCode::AttributeNotFound);
        }
        let mut w = w;
        w.write(att::ATT_READ_BY_TYPE_RSP)?;
        w.write((2 + value_len) as u8)?;
        for (handle, value) in entries {
            w.write(handle)?;
            w.append(&value)?;
        }
        Ok(w.len())
    }

    async fn handle_read<H: GattHandler, T: Transport>(
        &self,
        conn: &Connection<'_, M, T>,
        handler: &mut H,
        ltk_stored: bool,
        handle: u16,
        offset: usize,
        blob: bool,
        rx: &mut [u8],
    ) -> Result<usize, Error> {
        let mtu = conn.att_mtu() as usize;
        let (req_opcode, rsp_opcode) = if blob {
            (att::ATT_READ_BLOB_REQ, att::ATT_READ_BLOB_RSP)
        } else {
            (att::ATT_READ_REQ, att::ATT_READ_RSP)
        };
        let w = WriteCursor::new(rx);
        let Some(snap) = self.table.snapshot(handle) else {
            return Self::error_response(w, req_opcode, handle, AttErrorCode::InvalidHandle);
        };
        let security = conn.security().unwrap_or_default();
        if let Err(code) = snap.read_perm.check(&security, ltk_stored, false) {
            return Self::error_response(w, req_opcode, handle, code);
        }
        match self.dispatch_read(conn, handler, &snap, offset).await {
            Ok(mut value) => {
                value.truncate(mtu - 1);
                let mut w = w;
                w.write(rsp_opcode)?;
                w.append(&value)?;
                Ok(w.len())
            }
            Err(code) => Self::error_response(w, req_opcode, handle, code),
        }
    }

    async fn handle_read_multiple<H: GattHandler, T: Transport>(
        &self,
        conn: &Connection<'_, M, T>,
        handler: &mut H,
        ltk_stored: bool,
        handles: &[u8],
        rx: &mut [u8],
    ) -> Result<usize, Error> {
        let mtu = conn.att_mtu() as usize;
        let security = conn.security().unwrap_or_default();

        let mut values = Vec::new();
        let mut worst: Option<(u8, u16, AttErrorCode)> = None;
        let mut record = |handle: u16, code: AttErrorCode, worst: &mut Option<(u8, u16, AttErrorCode)>| {
            let rank = error_rank(code);
            if worst.map(|(r, _, _)| rank < r).unwrap_or(true) {
                *worst = Some((rank, handle, code));
            }
        };

        for pair in handles.chunks(2) {
            let handle = u16::from_le_bytes([pair[0], pair[1]]);
            let Some(snap) = self.table.snapshot(handle) else {
                record(handle, AttErrorCode::InvalidHandle, &mut worst);
                continue;
            };
            if let Err(code) = snap.read_perm.check(&security, ltk_stored, false) {
                record(handle, code, &mut worst);
                continue;
            }
            match self.dispatch_read(conn, handler, &snap, 0).await {
                Ok(value) => values.extend_from_slice(&value),
                Err(code) => record(handle, code, &mut worst),
            }
        }

        let w = WriteCursor::new(rx);
        if let Some((_, handle, code)) = worst {
            return Self::error_response(w, att::ATT_READ_MULTIPLE_REQ, handle, code);
        }
        values.truncate(mtu - 1);
        let mut w = w;
        w.write(att::ATT_READ_MULTIPLE_RSP)?;
        w.append(&values)?;
        Ok(w.len())
    }

    async fn handle_read_by_group_type<T: Transport>(
        &self,
        conn: &Connection<'_, M, T>,
        start: u16,
        end: u16,
        group_type: &Uuid,
        rx: &mut [u8],
    ) -> Result<usize, Error> {
        let mtu = conn.att_mtu() as usize;
        let w = WriteCursor::new(rx);
        if start == 0 || start > end {
            return Self::error_response(w, att::ATT_READ_BY_GROUP_TYPE_REQ, start, AttErrorCode::InvalidHandle);
        }
        if !group_type.matches(&PRIMARY_SERVICE_UUID16) && !group_type.matches(&SECONDARY_SERVICE_UUID16) {
            return Self::error_response(
                w,
                att::ATT_READ_BY_GROUP_TYPE_REQ,
                start,
                AttErrorCode::UnsupportedGroupType,
            );
        }

        let mut entries: Vec<(u16, u16, Vec<u8>)> = Vec::new();
        let mut value_len = 0usize;
        let mut used = 2usize;
        for snap in self.table.snapshot_range(start, end) {
            if !snap.uuid.matches(group_type) {
                continue;
            }
            let value = match self.table.read_stored(snap.handle, 0) {
                Ok(value) => value,
                Err(_) => continue,
            };
            if entries.is_empty() {
                value_len = value.len();
            } else if value.len() != value_len {
                break;
            }
            if used + 4 + value_len > mtu {
                break;
            }
            used += 4 + value_len;
            entries.push((snap.handle, snap.group_end.unwrap_or(snap.handle), value));
        }

        if entries.is_empty() {
            return Self::error_response(
                w,
                att::ATT_READ_BY_GROUP_TYPE_REQ,
                start,
                AttErrorCode::AttributeNotFound,
            );
        }
        let mut w = w;
        w.write(att::ATT_READ_BY_GROUP_TYPE_RSP)?;
        w.write((4 + value_len) as u8)?;
        for (handle, group_end, value) in entries {
            w.write(handle)?;
            w.write(group_end)?;
            w.append(&value)?;
        }
        Ok(w.len())
    }

    async fn handle_write<H: GattHandler, T: Transport>(
        &self,
        conn: &Connection<'_, M, T>,
        handler: &mut H,
        ltk_stored: bool,
        handle: u16,
        data: &[u8],
        needs_response: bool,
        rx: &mut [u8],
    ) -> Result<usize, Error> {
        let w = WriteCursor::new(rx);
        let fail = |w: WriteCursor<'_>, code: AttErrorCode| {
            if needs_response {
                Self::error_response(w, att::ATT_WRITE_REQ, handle, code)
            } else {
                // Write commands fail silently.
                Ok(0)
            }
        };

        let Some(snap) = self.table.snapshot(handle) else {
            return fail(w, AttErrorCode::InvalidHandle);
        };
        let security = conn.security().unwrap_or_default();
        if let Err(code) = snap.write_perm.check(&security, ltk_stored, true) {
            return fail(w, code);
        }
        match self.dispatch_write(conn, handler, &snap, 0, data, true).await {
            Ok(()) => {
                if needs_response {
                    let mut w = w;
                    w.write(att::ATT_WRITE_RSP)?;
                    Ok(w.len())
                } else {
                    Ok(0)
                }
            }
            Err(code) => fail(w, code),
        }
    }

    async fn handle_prepare_write<H: GattHandler, T: Transport>(
        &self,
        conn: &Connection<'_, M, T>,
        handler: &mut H,
        ltk_stored: bool,
        handle: u16,
        offset: u16,
        value: &[u8],
        rx: &mut [u8],
    ) -> Result<usize, Error> {
        let w = WriteCursor::new(rx);
        let Some(snap) = self.table.snapshot(handle) else {
            return Self::error_response(w, att::ATT_PREPARE_WRITE_REQ, handle, AttErrorCode::InvalidHandle);
        };
        let security = conn.security().unwrap_or_default();
        if let Err(code) = snap.write_perm.check(&security, ltk_stored, true) {
            return Self::error_response(w, att::ATT_PREPARE_WRITE_REQ, handle, code);
        }
        if snap.write_perm == Permission::Custom {
            if let Err(code) = handler.authorize_write(&Self::desc(conn, &snap)).await {
                return Self::error_response(w, att::ATT_PREPARE_WRITE_REQ, handle, code);
            }
        }

        let queued = conn.with_att(|att| {
            // A chunk continuing the previous one for the same handle
            // extends it in place instead of burning a queue slot.
            if let Some(tail) = att.prepare_queue.last_mut() {
                if tail.handle == handle && offset as usize == tail.offset as usize + tail.value.len() {
                    tail.value.extend_from_slice(value);
                    return Ok(());
                }
            }
            if att.prepare_queue.len() >= config::PREPARE_WRITE_QUEUE_SIZE {
                return Err(AttErrorCode::PrepareQueueFull);
            }
            att.prepare_queue.push(PreparedWrite {
                handle,
                offset,
                value: value.to_vec(),
            });
            Ok(())
        })?;
        if let Err(code) = queued {
            return Self::error_response(w, att::ATT_PREPARE_WRITE_REQ, handle, code);
        }

        // The response echoes the request.
        let mut w = w;
        w.write(att::ATT_PREPARE_WRITE_RSP)?;
        w.write(handle)?;
        w.write(offset)?;
        w.append(value)?;
        Ok(w.len())
    }

    async fn handle_execute_write<H: GattHandler, T: Transport>(
        &self,
        conn: &Connection<'_, M, T>,
        handler: &mut H,
        flags: u8,
        rx: &mut [u8],
    ) -> Result<usize, Error> {
        let queue = conn.with_att(|att| core::mem::take(&mut att.prepare_queue))?;
        let w = WriteCursor::new(rx);

        if flags == 0 || queue.is_empty() {
            let mut w = w;
            w.write(att::ATT_EXECUTE_WRITE_RSP)?;
            return Ok(w.len());
        }

        // Validate every entry before committing anything.
        for entry in &queue {
            let Some(snap) = self.table.snapshot(entry.handle) else {
                return Self::error_response(
                    w,
                    att::ATT_EXECUTE_WRITE_REQ,
                    entry.handle,
                    AttErrorCode::InvalidHandle,
                );
            };
            if entry.offset as usize > snap.max_len {
                return Self::error_response(w, att::ATT_EXECUTE_WRITE_REQ, entry.handle, AttErrorCode::InvalidOffset);
            }
            if entry.offset as usize + entry.value.len() > snap.max_len {
                return Self::error_response(
                    w,
                    att::ATT_EXECUTE_WRITE_REQ,
                    entry.handle,
                    AttErrorCode::InvalidAttributeValueLength,
                );
            }
        }

        // Commit. All writes are issued; the response reflects the first
        // failure, and only one response is ever sent.
        let mut first_error: Option<(u16, AttErrorCode)> = None;
        for entry in &queue {
            if let Some(snap) = self.table.snapshot(entry.handle) {
                if let Err(code) = self
                    .dispatch_write(conn, handler, &snap, entry.offset as usize, &entry.value, false)
                    .await
                {
                    if first_error.is_none() {
                        first_error = Some((entry.handle, code));
                    }
                }
            }
        }
        match first_error {
            Some((handle, code)) => Self::error_response(w, att::ATT_EXECUTE_WRITE_REQ, handle, code),
            None => {
                let mut w = w;
                w.write(att::ATT_EXECUTE_WRITE_RSP)?;
                Ok(w.len())
            }
        }
    }

    /// Process one inbound PDU and produce a response when the protocol
    /// calls for one.
    pub(crate) async fn process<H: GattHandler, T: Transport>(
        &self,
        conn: &Connection<'_, M, T>,
        ltk_stored: bool,
        req: &AttReq<'_>,
        rx: &mut [u8],
        handler: &mut H,
    ) -> Result<Option<usize>, Error> {
        let len = match req {
            AttReq::ExchangeMtu { mtu } => self.handle_exchange_mtu(conn, *mtu, rx).await?,
            AttReq::FindInformation {
                start_handle,
                end_handle,
            } => self.handle_find_information(conn, *start_handle, *end_handle, rx).await?,
            AttReq::FindByTypeValue {
                start_handle,
                end_handle,
                att_type,
                att_value,
            } => {
                self.handle_find_by_type_value(
                    conn,
                    handler,
                    ltk_stored,
                    *start_handle,
                    *end_handle,
                    *att_type,
                    att_value,
                    rx,
                )
                .await?
            }
            AttReq::ReadByType {
                start,
                end,
                attribute_type,
            } => {
                self.handle_read_by_type(conn, handler, ltk_stored, *start, *end, attribute_type, rx)
                    .await?
            }
            AttReq::Read { handle } => {
                self.handle_read(conn, handler, ltk_stored, *handle, 0, false, rx).await?
            }
            AttReq::ReadBlob { handle, offset } => {
                self.handle_read(conn, handler, ltk_stored, *handle, *offset as usize, true, rx)
                    .await?
            }
            AttReq::ReadMultiple { handles } => {
                self.handle_read_multiple(conn, handler, ltk_stored, handles, rx).await?
            }
            AttReq::ReadByGroupType { start, end, group_type } => {
                self.handle_read_by_group_type(conn, *start, *end, group_type, rx).await?
            }
            AttReq::Write { handle, data } => {
                self.handle_write(conn, handler, ltk_stored, *handle, data, true, rx)
                    .await?
            }
            AttReq::WriteCmd { handle, data } => {
                self.handle_write(conn, handler, ltk_stored, *handle, data, false, rx)
                    .await?
            }
            AttReq::PrepareWrite { handle, offset, value } => {
                self.handle_prepare_write(conn, handler, ltk_stored, *handle, *offset, value, rx)
                    .await?
            }
            AttReq::ExecuteWrite { flags } => self.handle_execute_write(conn, handler, *flags, rx).await?,
            // Accepted and ignored: signed writes are not supported.
            AttReq::SignedWrite { .. } => 0,
            AttReq::Confirmation => 0,
        };
        if len > 0 {
            Ok(Some(len))
        } else {
            Ok(None)
        }
    }
}

/// Look up the CCCD subscription of a characteristic value handle.
pub(crate) fn cccd_for_value_handle<M: RawMutex>(table: &AttributeTable<M>, value_handle: u16) -> Option<u16> {
    table
        .cccd_handles()
        .into_iter()
        .find(|(_, vh, _, _)| *vh == value_handle)
        .map(|(cccd, _, _, _)| cccd)
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::att::AttReq;
    use crate::attribute::{AttributeValue, Characteristic, CharacteristicProp, Service};
    use crate::gatt::NoHandler;
    use crate::host::Adapter;
    use crate::mock_transport::MockTransport;
    use crate::types::Role;
    use crate::Address;

    type TestAdapter = Adapter<NoopRawMutex, MockTransport>;

    fn adapter() -> TestAdapter {
        Adapter::new(MockTransport::new(), StdRng::seed_from_u64(3))
    }

    fn conn(adapter: &TestAdapter) -> Connection<'_, NoopRawMutex, MockTransport> {
        let (index, generation) = adapter
            .connections
            .connect(ConnHandle::new(1), Role::Peripheral, Address::public([1, 2, 3, 4, 5, 6]))
            .unwrap();
        Connection::new(adapter, index, generation)
    }

    fn process(
        table: &AttributeTable<NoopRawMutex>,
        subscriptions: &SubscriptionTable<NoopRawMutex>,
        conn: &Connection<'_, NoopRawMutex, MockTransport>,
        req: &AttReq<'_>,
    ) -> Option<Vec<u8>> {
        let server = AttributeServer {
            table,
            subscriptions,
            store: None,
            own: None,
        };
        let mut rx = [0u8; 517];
        let len = block_on(server.process(conn, false, req, &mut rx, &mut NoHandler)).unwrap()?;
        Some(rx[..len].to_vec())
    }

    fn error_of(rsp: &[u8]) -> (u8, u16, u8) {
        assert_eq!(rsp[0], att::ATT_ERROR_RSP);
        (rsp[1], u16::from_le_bytes([rsp[2], rsp[3]]), rsp[4])
    }

    fn writable(uuid: u16, max_len: usize) -> Characteristic {
        Characteristic::new(uuid, [CharacteristicProp::Write])
            .write_perm(Permission::Open)
            .max_len(max_len)
            .value(AttributeValue::Bytes(Vec::new()))
    }

    #[test]
    fn read_by_group_type_keeps_equal_lengths() {
        let a = adapter();
        let c = conn(&a);
        let table = AttributeTable::new();
        let long: Uuid = "6e400001-b5a3-f393-e0a9-e50e24dcca9e".parse().unwrap();
        table
            .add_services(vec![
                Service::new(0x180Fu16),
                Service::new(0x1810u16),
                Service::new(long),
            ])
            .unwrap();
        let subs = SubscriptionTable::new();
        let rsp = process(
            &table,
            &subs,
            &c,
            &AttReq::ReadByGroupType {
                start: 1,
                end: 0xFFFF,
                group_type: PRIMARY_SERVICE_UUID16,
            },
        )
        .unwrap();
        assert_eq!(rsp[0], att::ATT_READ_BY_GROUP_TYPE_RSP);
        // Two 16-bit entries; the 128-bit service ends the response.
        assert_eq!(rsp[1], 6);
        assert_eq!((rsp.len() - 2) / 6, 2);
    }

    #[test]
    fn read_by_group_type_rejects_other_groups() {
        let a = adapter();
        let c = conn(&a);
        let table = AttributeTable::new();
        table.add_services(vec![Service::new(0x180Fu16)]).unwrap();
        let subs = SubscriptionTable::new();
        let rsp = process(
            &table,
            &subs,
            &c,
            &AttReq::ReadByGroupType {
                start: 1,
                end: 0xFFFF,
                group_type: Uuid::new_short(0x2803),
            },
        )
        .unwrap();
        assert_eq!(
            error_of(&rsp),
            (att::ATT_READ_BY_GROUP_TYPE_REQ, 1, AttErrorCode::UnsupportedGroupType.to_raw())
        );
    }

    #[test]
    fn find_information_locks_onto_one_format() {
        let a = adapter();
        let c = conn(&a);
        let table = AttributeTable::new();
        let long: Uuid = "6e400002-b5a3-f393-e0a9-e50e24dcca9e".parse().unwrap();
        table
            .add_services(vec![Service::new(0x180Fu16).characteristic(
                Characteristic::new(long, [CharacteristicProp::Read, CharacteristicProp::Notify])
                    .read_perm(Permission::Open)
                    .value(AttributeValue::Bytes(vec![1])),
            )])
            .unwrap();
        let subs = SubscriptionTable::new();

        // Handles: 1 decl16, 2 chardecl16, 3 value(128), 4 cccd16.
        let rsp = process(
            &table,
            &subs,
            &c,
            &AttReq::FindInformation {
                start_handle: 1,
                end_handle: 4,
            },
        )
        .unwrap();
        assert_eq!(rsp[0], att::ATT_FIND_INFORMATION_RSP);
        assert_eq!(rsp[1], 0x01);
        assert_eq!((rsp.len() - 2) / 4, 2);

        let rsp = process(
            &table,
            &subs,
            &c,
            &AttReq::FindInformation {
                start_handle: 3,
                end_handle: 4,
            },
        )
        .unwrap();
        assert_eq!(rsp[1], 0x02);
        assert_eq!((rsp.len() - 2) / 18, 1);
    }

    #[test]
    fn find_by_type_value_returns_group_ranges() {
        let a = adapter();
        let c = conn(&a);
        let table = AttributeTable::new();
        let placed = table
            .add_services(vec![Service::new(0x180Fu16).characteristic(
                Characteristic::new(0x2A19u16, [CharacteristicProp::Read])
                    .read_perm(Permission::Open)
                    .value(AttributeValue::Bytes(vec![1])),
            )])
            .unwrap();
        let subs = SubscriptionTable::new();
        let rsp = process(
            &table,
            &subs,
            &c,
            &AttReq::FindByTypeValue {
                start_handle: 1,
                end_handle: 0xFFFF,
                att_type: 0x2800,
                att_value: &[0x0F, 0x18],
            },
        )
        .unwrap();
        assert_eq!(rsp[0], att::ATT_FIND_BY_TYPE_VALUE_RSP);
        assert_eq!(u16::from_le_bytes([rsp[1], rsp[2]]), placed[0].start);
        assert_eq!(u16::from_le_bytes([rsp[3], rsp[4]]), placed[0].end);
    }

    #[test]
    fn prepare_queue_saturates_at_its_cap() {
        let a = adapter();
        let c = conn(&a);
        let table = AttributeTable::new();
        let placed = table
            .add_services(vec![Service::new(0x180Fu16).characteristic(writable(0x2A19, 512))])
            .unwrap();
        let handle = placed[0].characteristics[0].value;
        let subs = SubscriptionTable::new();

        for i in 0..config::PREPARE_WRITE_QUEUE_SIZE {
            let value = [i as u8];
            let rsp = process(
                &table,
                &subs,
                &c,
                &AttReq::PrepareWrite {
                    handle,
                    offset: 0,
                    value: &value,
                },
            )
            .unwrap();
            // Each response echoes its request.
            assert_eq!(rsp[0], att::ATT_PREPARE_WRITE_RSP);
            assert_eq!(rsp[5], i as u8);
        }
        let rsp = process(
            &table,
            &subs,
            &c,
            &AttReq::PrepareWrite {
                handle,
                offset: 0,
                value: &[0xFF],
            },
        )
        .unwrap();
        assert_eq!(
            error_of(&rsp),
            (att::ATT_PREPARE_WRITE_REQ, handle, AttErrorCode::PrepareQueueFull.to_raw())
        );

        // Cancelling empties the queue again.
        let rsp = process(&table, &subs, &c, &AttReq::ExecuteWrite { flags: 0 }).unwrap();
        assert_eq!(rsp, vec![att::ATT_EXECUTE_WRITE_RSP]);
        let rsp = process(
            &table,
            &subs,
            &c,
            &AttReq::PrepareWrite {
                handle,
                offset: 0,
                value: &[0x00],
            },
        )
        .unwrap();
        assert_eq!(rsp[0], att::ATT_PREPARE_WRITE_RSP);
    }

    #[test]
    fn contiguous_prepares_coalesce_into_one_entry() {
        let a = adapter();
        let c = conn(&a);
        let table = AttributeTable::new();
        let placed = table
            .add_services(vec![Service::new(0x180Fu16).characteristic(writable(0x2A19, 512))])
            .unwrap();
        let handle = placed[0].characteristics[0].value;
        let subs = SubscriptionTable::new();

        process(
            &table,
            &subs,
            &c,
            &AttReq::PrepareWrite {
                handle,
                offset: 0,
                value: &[1, 2],
            },
        )
        .unwrap();
        process(
            &table,
            &subs,
            &c,
            &AttReq::PrepareWrite {
                handle,
                offset: 2,
                value: &[3, 4],
            },
        )
        .unwrap();
        let entries = c.with_att(|att| att.prepare_queue.clone()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, vec![1, 2, 3, 4]);

        let rsp = process(&table, &subs, &c, &AttReq::ExecuteWrite { flags: 1 }).unwrap();
        assert_eq!(rsp, vec![att::ATT_EXECUTE_WRITE_RSP]);
        assert_eq!(table.read_stored(handle, 0).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn execute_write_validates_offsets_before_committing() {
        let a = adapter();
        let c = conn(&a);
        let table = AttributeTable::new();
        let placed = table
            .add_services(vec![Service::new(0x180Fu16).characteristic(
                writable(0x2A19, 4).value(AttributeValue::Bytes(vec![9, 9])),
            )])
            .unwrap();
        let handle = placed[0].characteristics[0].value;
        let subs = SubscriptionTable::new();

        process(
            &table,
            &subs,
            &c,
            &AttReq::PrepareWrite {
                handle,
                offset: 600,
                value: &[1],
            },
        )
        .unwrap();
        let rsp = process(&table, &subs, &c, &AttReq::ExecuteWrite { flags: 1 }).unwrap();
        assert_eq!(
            error_of(&rsp),
            (att::ATT_EXECUTE_WRITE_REQ, handle, AttErrorCode::InvalidOffset.to_raw())
        );
        // Nothing was committed.
        assert_eq!(table.read_stored(handle, 0).unwrap(), vec![9, 9]);

        process(
            &table,
            &subs,
            &c,
            &AttReq::PrepareWrite {
                handle,
                offset: 3,
                value: &[1, 2],
            },
        )
        .unwrap();
        let rsp = process(&table, &subs, &c, &AttReq::ExecuteWrite { flags: 1 }).unwrap();
        assert_eq!(
            error_of(&rsp),
            (
                att::ATT_EXECUTE_WRITE_REQ,
                handle,
                AttErrorCode::InvalidAttributeValueLength.to_raw()
            )
        );
        assert_eq!(table.read_stored(handle, 0).unwrap(), vec![9, 9]);
    }

    #[test]
    fn read_multiple_reports_the_most_severe_error() {
        let a = adapter();
        let c = conn(&a);
        let table = AttributeTable::new();
        let placed = table
            .add_services(vec![Service::new(0x180Fu16)
                .characteristic(
                    Characteristic::new(0x2A19u16, [CharacteristicProp::Read])
                        .read_perm(Permission::Encrypted)
                        .value(AttributeValue::Bytes(vec![1])),
                )
                .characteristic(
                    Characteristic::new(0x2A1Au16, [CharacteristicProp::Write])
                        .write_perm(Permission::Open)
                        .value(AttributeValue::Bytes(vec![2])),
                )])
            .unwrap();
        let encrypted_only = placed[0].characteristics[0].value;
        let unreadable = placed[0].characteristics[1].value;
        let subs = SubscriptionTable::new();

        let mut handles = Vec::new();
        handles.extend_from_slice(&unreadable.to_le_bytes());
        handles.extend_from_slice(&encrypted_only.to_le_bytes());
        let rsp = process(&table, &subs, &c, &AttReq::ReadMultiple { handles: &handles }).unwrap();
        // Authentication outranks read-not-permitted, despite coming
        // second in the request.
        assert_eq!(
            error_of(&rsp),
            (
                att::ATT_READ_MULTIPLE_REQ,
                encrypted_only,
                AttErrorCode::InsufficientAuthentication.to_raw()
            )
        );
    }

    #[test]
    fn cccd_writes_are_validated_bit_by_bit() {
        let a = adapter();
        let c = conn(&a);
        let table = AttributeTable::new();
        let placed = table
            .add_services(vec![Service::new(0x180Fu16).characteristic(
                Characteristic::new(0x2A19u16, [CharacteristicProp::Read, CharacteristicProp::Notify])
                    .read_perm(Permission::Open)
                    .value(AttributeValue::Bytes(vec![1])),
            )])
            .unwrap();
        let cccd = placed[0].characteristics[0].cccd.unwrap();
        let subs = SubscriptionTable::new();

        // Indications are not supported by this characteristic.
        let rsp = process(
            &table,
            &subs,
            &c,
            &AttReq::Write {
                handle: cccd,
                data: &[0x02, 0x00],
            },
        )
        .unwrap();
        assert_eq!(error_of(&rsp).2, AttErrorCode::CccdImproperlyConfigured.to_raw());

        // Wrong length and nonzero second byte.
        for bad in [&[0x01u8][..], &[0x01, 0x00, 0x00][..], &[0x01, 0x01][..]] {
            let rsp = process(&table, &subs, &c, &AttReq::Write { handle: cccd, data: bad }).unwrap();
            assert_eq!(error_of(&rsp).2, AttErrorCode::CccdImproperlyConfigured.to_raw());
        }

        let rsp = process(
            &table,
            &subs,
            &c,
            &AttReq::Write {
                handle: cccd,
                data: &[0x01, 0x00],
            },
        )
        .unwrap();
        assert_eq!(rsp, vec![att::ATT_WRITE_RSP]);
        assert_eq!(subs.get(cccd, c.handle()), 0x01);

        let rsp = process(&table, &subs, &c, &AttReq::Read { handle: cccd }).unwrap();
        assert_eq!(rsp, vec![att::ATT_READ_RSP, 0x01, 0x00]);
    }

    #[test]
    fn write_commands_fail_silently() {
        let a = adapter();
        let c = conn(&a);
        let table = AttributeTable::new();
        let subs = SubscriptionTable::new();
        let rsp = process(
            &table,
            &subs,
            &c,
            &AttReq::WriteCmd {
                handle: 0x1234,
                data: &[1],
            },
        );
        assert!(rsp.is_none());
    }

    #[test]
    fn exchange_mtu_responds_with_server_rx_mtu() {
        let a = adapter();
        let c = conn(&a);
        let table = AttributeTable::new();
        let subs = SubscriptionTable::new();
        let rsp = process(&table, &subs, &c, &AttReq::ExchangeMtu { mtu: 50 }).unwrap();
        assert_eq!(rsp, vec![att::ATT_EXCHANGE_MTU_RSP, 0x05, 0x02]);
        assert_eq!(c.att_mtu(), 50);
    }

    #[test]
    fn read_blob_beyond_the_value_is_an_invalid_offset() {
        let a = adapter();
        let c = conn(&a);
        let table = AttributeTable::new();
        let placed = table
            .add_services(vec![Service::new(0x180Fu16).characteristic(
                Characteristic::new(0x2A19u16, [CharacteristicProp::Read])
                    .read_perm(Permission::Open)
                    .value(AttributeValue::Bytes(vec![1, 2, 3, 4, 5])),
            )])
            .unwrap();
        let handle = placed[0].characteristics[0].value;
        let subs = SubscriptionTable::new();
        let rsp = process(&table, &subs, &c, &AttReq::ReadBlob { handle, offset: 10 }).unwrap();
        assert_eq!(error_of(&rsp).2, AttErrorCode::InvalidOffset.to_raw());
        let rsp = process(&table, &subs, &c, &AttReq::ReadBlob { handle, offset: 3 }).unwrap();
        assert_eq!(rsp, vec![att::ATT_READ_BLOB_RSP, 4, 5]);
    }
}
