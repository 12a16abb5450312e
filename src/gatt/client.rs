//! GATT client: discovery with a persistent range cache, reads, writes
//! and reliable write sessions against a remote server.

use core::cell::RefCell;
use std::collections::HashMap;

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::att::{AttErrorCode, AttReq, AttRsp};
use crate::attribute::{
    CharacteristicProp, CharacteristicProps, CHARACTERISTIC_CCCD_UUID16, CHARACTERISTIC_SERVICE_CHANGED_UUID16,
    CHARACTERISTIC_UUID16, GENERIC_ATTRIBUTE_SERVICE_UUID16, INCLUDE_SERVICE_UUID16, PRIMARY_SERVICE_UUID16,
};
use crate::config;
use crate::connection::Connection;
use crate::connection_manager::Notification;
use crate::store::{
    CachedCharacteristic, CachedDescriptor, CachedInclude, CachedRange, CachedService, GattCacheFile, Store, UuidRange,
};
use crate::types::range_map::RangeMap;
use crate::types::uuid::Uuid;
use crate::{Error, Transport};

/// A discovered service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub start: u16,
    pub end: u16,
    pub secondary: bool,
}

/// A discovered characteristic.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicInfo {
    pub declaration: u16,
    pub value: u16,
    /// Last handle belonging to this characteristic.
    pub end: u16,
    pub props: CharacteristicProps,
    pub uuid: Uuid,
}

/// A discovered descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorInfo {
    pub handle: u16,
    pub uuid: Uuid,
}

#[derive(Debug, Clone)]
struct RemoteCharacteristic {
    info: CharacteristicInfo,
    descriptors: Option<Vec<DescriptorInfo>>,
}

#[derive(Debug, Clone)]
struct RemoteService {
    info: ServiceInfo,
    includes: Option<Vec<ServiceInfo>>,
    characteristics: Option<Vec<RemoteCharacteristic>>,
}

/// The discovery cache: verified services, verified gaps (`None`
/// intervals) and per-UUID scan results.
#[derive(Default)]
struct ClientCache {
    has_all_primary: bool,
    all_primary: RangeMap<Option<usize>>,
    secondary: RangeMap<Option<usize>>,
    by_uuid: HashMap<Uuid, RangeMap<bool>>,
    services: Vec<Option<RemoteService>>,
}

impl ClientCache {
    fn insert_service(&mut self, info: ServiceInfo) -> usize {
        // A service first met through an include declaration may later
        // turn out to be primary; move it between the maps.
        if !info.secondary {
            self.promote_to_primary(info.start);
        }
        // Reuse an existing slab entry for the same range.
        let existing = {
            let map = if info.secondary { &self.secondary } else { &self.all_primary };
            match map.get(info.start) {
                Some((s, e, Some(idx))) if s == info.start && e == info.end => Some(*idx),
                _ => None,
            }
        };
        let idx = match existing {
            Some(idx) if self.services.get(idx).map(|s| s.is_some()).unwrap_or(false) => {
                self.services[idx].as_mut().unwrap().info = info.clone();
                idx
            }
            _ => {
                let idx = self.services.len();
                self.services.push(Some(RemoteService {
                    info: info.clone(),
                    includes: None,
                    characteristics: None,
                }));
                let map = if info.secondary {
                    &mut self.secondary
                } else {
                    &mut self.all_primary
                };
                map.insert(info.start, info.end, Some(idx));
                idx
            }
        };
        if !info.secondary {
            self.by_uuid
                .entry(info.uuid.clone())
                .or_default()
                .insert(info.start, info.end, true);
        }
        idx
    }

    fn service_at(&self, start: u16) -> Option<&RemoteService> {
        let idx = match self.all_primary.get(start) {
            Some((s, _, Some(idx))) if s == start => Some(*idx),
            _ => match self.secondary.get(start) {
                Some((s, _, Some(idx))) if s == start => Some(*idx),
                _ => None,
            },
        }?;
        self.services.get(idx)?.as_ref()
    }

    fn service_at_mut(&mut self, start: u16) -> Option<&mut RemoteService> {
        let idx = match self.all_primary.get(start) {
            Some((s, _, Some(idx))) if s == start => Some(*idx),
            _ => match self.secondary.get(start) {
                Some((s, _, Some(idx))) if s == start => Some(*idx),
                _ => None,
            },
        }?;
        self.services.get_mut(idx)?.as_mut()
    }

    /// Move a service discovered as secondary into the primary map.
    fn promote_to_primary(&mut self, start: u16) {
        if let Some((s, e, Some(idx))) = self.secondary.get(start).map(|(s, e, v)| (s, e, *v)) {
            if s == start {
                self.secondary.remove_overlapping(s, e);
                if let Some(service) = self.services.get_mut(idx).and_then(|v| v.as_mut()) {
                    service.info.secondary = false;
                }
                self.all_primary.insert(s, e, Some(idx));
            }
        }
    }

    /// Whether the peer exposes the GATT service with a Service Changed
    /// characteristic, meaning its database may change between
    /// connections.
    fn has_service_changed(&self) -> bool {
        for service in self.services.iter().flatten() {
            if !service.info.uuid.matches(&GENERIC_ATTRIBUTE_SERVICE_UUID16) {
                continue;
            }
            if let Some(chars) = &service.characteristics {
                if chars
                    .iter()
                    .any(|c| c.info.uuid.matches(&CHARACTERISTIC_SERVICE_CHANGED_UUID16))
                {
                    return true;
                }
            }
        }
        false
    }
}

/// A GATT client on one connection.
pub struct GattClient<'d, M: RawMutex, T: Transport> {
    conn: Connection<'d, M, T>,
    store: Option<&'d Store>,
    state: RefCell<ClientState>,
}

struct ClientState {
    cache: ClientCache,
    reliable_write: bool,
}

impl<'d, M: RawMutex, T: Transport> GattClient<'d, M, T> {
    /// Create a client, restoring any persisted discovery cache for the
    /// peer.
    pub fn new(conn: Connection<'d, M, T>, store: Option<&'d Store>) -> Self {
        let mut cache = ClientCache::default();
        if let Some(store) = store {
            if let (Some(own), Ok(peer)) = (conn_own(&conn), conn.peer_address()) {
                if let Some(file) = store.get_gatt_cache(own, peer, conn.is_bonded()) {
                    cache = cache_from_file(file);
                }
            }
        }
        Self {
            conn,
            store,
            state: RefCell::new(ClientState {
                cache,
                reliable_write: false,
            }),
        }
    }

    /// The connection this client operates on.
    pub fn connection(&self) -> &Connection<'d, M, T> {
        &self.conn
    }

    /// The next notification or indication from the server.
    pub async fn notification(&self) -> Notification {
        self.conn.notification().await
    }

    fn mtu(&self) -> usize {
        self.conn.att_mtu() as usize
    }

    /// Exchange the ATT MTU. Runs at most once per connection; the
    /// effective MTU is returned either way.
    pub async fn exchange_mtu(&self, client_rx_mtu: u16) -> Result<u16, Error> {
        let already = self.conn.with_att(|att| att.mtu_changed)?;
        if already {
            return Ok(self.conn.att_mtu());
        }
        self.conn.with_att(|att| att.mtu_exchange_pending = true)?;
        let result = self.conn.att_request(&AttReq::ExchangeMtu { mtu: client_rx_mtu }).await;
        let mtu = match result {
            Ok(pdu) => match AttRsp::decode(&pdu) {
                Ok(AttRsp::ExchangeMtu { mtu: server_rx }) => {
                    self.conn.with_att(|att| att.apply_mtu(client_rx_mtu, server_rx))?
                }
                // A rejected or malformed exchange leaves the MTU alone.
                _ => self.conn.att_mtu(),
            },
            Err(e) => {
                self.settle_mtu_exchange();
                return Err(e);
            }
        };
        self.settle_mtu_exchange();
        Ok(mtu)
    }

    /// Clear the exchange flag and release any held notifications, in
    /// order, then wake queued indications.
    fn settle_mtu_exchange(&self) {
        let held = self
            .conn
            .with_att(|att| {
                att.mtu_exchange_pending = false;
                core::mem::take(&mut att.held_notifications)
            })
            .unwrap_or_default();
        for pdu in held {
            let _ = self.conn.send_nowait(crate::types::l2cap::L2CAP_CID_ATT, &pdu);
        }
        self.conn.signal_mtu_done();
    }

    async fn request(&self, req: &AttReq<'_>) -> Result<Vec<u8>, Error> {
        self.conn.att_request(req).await
    }

    // --- Service discovery ---

    /// Discover every primary service, from cache where verified.
    pub async fn discover_all_primary_services(&self) -> Result<Vec<ServiceInfo>, Error> {
        self.discover_primary_services(None, None).await
    }

    /// Discover primary services with `uuid`, stopping early once
    /// `num_to_find` are known.
    pub async fn discover_services_by_uuid(
        &self,
        uuid: &Uuid,
        num_to_find: Option<usize>,
    ) -> Result<Vec<ServiceInfo>, Error> {
        self.discover_primary_services(Some(uuid), num_to_find).await
    }

    async fn discover_primary_services(
        &self,
        uuid: Option<&Uuid>,
        num_to_find: Option<usize>,
    ) -> Result<Vec<ServiceInfo>, Error> {
        let mut found: Vec<ServiceInfo> = Vec::new();
        let mut gaps: Vec<(u16, u16)> = Vec::new();
        {
            let state = self.state.borrow();
            let cache = &state.cache;
            match uuid {
                None => {
                    for (_, _, idx) in cache.all_primary.iter() {
                        if let Some(idx) = idx {
                            if let Some(Some(service)) = cache.services.get(*idx) {
                                found.push(service.info.clone());
                            }
                        }
                    }
                    if !cache.has_all_primary {
                        gaps = cache.all_primary.gaps(1, 0xFFFF);
                    }
                }
                Some(uuid) => {
                    if let Some(map) = cache.by_uuid.get(uuid) {
                        for (start, _, exists) in map.iter() {
                            if *exists {
                                if let Some(service) = cache.service_at(start) {
                                    found.push(service.info.clone());
                                }
                            }
                        }
                        if !cache.has_all_primary {
                            gaps = map.gaps(1, 0xFFFF);
                        }
                    } else if !cache.has_all_primary {
                        gaps = vec![(1, 0xFFFF)];
                    }
                }
            }
        }

        let enough = |found: &Vec<ServiceInfo>| num_to_find.map(|n| found.len() >= n).unwrap_or(false);
        if enough(&found) {
            found.truncate(num_to_find.unwrap_or(found.len()));
            return Ok(found);
        }

        let uuid_value = uuid.map(|u| u.as_raw().to_vec());
        let mut mutated = false;
        'gaps: for (gap_start, gap_end) in gaps {
            let mut cursor = gap_start;
            while cursor <= gap_end {
                if enough(&found) {
                    // Stop scanning without marking further holes.
                    break 'gaps;
                }
                let req = match &uuid_value {
                    None => AttReq::ReadByGroupType {
                        start: cursor,
                        end: gap_end,
                        group_type: PRIMARY_SERVICE_UUID16,
                    },
                    Some(value) => AttReq::FindByTypeValue {
                        start_handle: cursor,
                        end_handle: gap_end,
                        att_type: 0x2800,
                        att_value: value.as_slice(),
                    },
                };
                let pdu = self.request(&req).await?;
                let mut last_end = None;
                match AttRsp::decode(&pdu)? {
                    AttRsp::Error { code, .. } => {
                        if code == AttErrorCode::AttributeNotFound {
                            // The remainder of the gap is verified empty.
                            let mut state = self.state.borrow_mut();
                            match uuid {
                                None => state.cache.all_primary.insert(cursor, gap_end, None),
                                Some(uuid) => state
                                    .cache
                                    .by_uuid
                                    .entry(uuid.clone())
                                    .or_default()
                                    .insert(cursor, gap_end, false),
                            }
                            mutated = true;
                            break;
                        }
                        return Err(Error::Att(code));
                    }
                    AttRsp::ReadByGroupType { mut it } => {
                        while let Some(entry) = it.next() {
                            let (start, end, value) = entry?;
                            let info = ServiceInfo {
                                uuid: Uuid::decode_service_value(value)?,
                                start,
                                end,
                                secondary: false,
                            };
                            let mut state = self.state.borrow_mut();
                            state.cache.insert_service(info.clone());
                            mutated = true;
                            found.push(info);
                            last_end = Some(end);
                        }
                    }
                    AttRsp::FindByTypeValue { mut it } => {
                        while let Some(entry) = it.next() {
                            let (start, end) = entry?;
                            let info = ServiceInfo {
                                uuid: uuid.cloned().unwrap_or(PRIMARY_SERVICE_UUID16),
                                start,
                                end,
                                secondary: false,
                            };
                            let mut state = self.state.borrow_mut();
                            state.cache.insert_service(info.clone());
                            mutated = true;
                            found.push(info);
                            last_end = Some(end);
                        }
                    }
                    _ => return Err(Error::InvalidValue),
                }
                match last_end {
                    Some(end) if end < gap_end => cursor = end + 1,
                    _ => break,
                }
            }
        }

        if uuid.is_none() && !enough(&found) {
            let mut state = self.state.borrow_mut();
            if state.cache.all_primary.covers(1, 0xFFFF) && !state.cache.has_all_primary {
                state.cache.has_all_primary = true;
                mutated = true;
            }
        }
        if mutated {
            self.persist();
        }
        if let Some(n) = num_to_find {
            found.truncate(n);
        }
        Ok(found)
    }

    /// Discover the services included by `service`.
    pub async fn find_included_services(&self, service: &ServiceInfo) -> Result<Vec<ServiceInfo>, Error> {
        if let Some(includes) = self
            .state
            .borrow()
            .cache
            .service_at(service.start)
            .and_then(|s| s.includes.clone())
        {
            return Ok(includes);
        }

        let mut includes = Vec::new();
        let mut cursor = service.start;
        loop {
            let pdu = self
                .request(&AttReq::ReadByType {
                    start: cursor,
                    end: service.end,
                    attribute_type: INCLUDE_SERVICE_UUID16,
                })
                .await?;
            let mut last_handle = None;
            match AttRsp::decode(&pdu)? {
                AttRsp::Error { code, .. } => {
                    if code == AttErrorCode::AttributeNotFound {
                        break;
                    }
                    return Err(Error::Att(code));
                }
                AttRsp::ReadByType { mut it } => {
                    while let Some(entry) = it.next() {
                        let (handle, value) = entry?;
                        last_handle = Some(handle);
                        match value.len() {
                            6 => {
                                let start = u16::from_le_bytes([value[0], value[1]]);
                                let end = u16::from_le_bytes([value[2], value[3]]);
                                let uuid = Uuid::new_short(u16::from_le_bytes([value[4], value[5]]));
                                includes.push(ServiceInfo {
                                    uuid,
                                    start,
                                    end,
                                    secondary: true,
                                });
                            }
                            4 => {
                                let start = u16::from_le_bytes([value[0], value[1]]);
                                let end = u16::from_le_bytes([value[2], value[3]]);
                                // 128-bit include: fetch the UUID from the
                                // included service declaration.
                                let uuid = self.read_service_uuid(start).await?;
                                includes.push(ServiceInfo {
                                    uuid,
                                    start,
                                    end,
                                    secondary: true,
                                });
                            }
                            _ => return Err(Error::InvalidValue),
                        }
                    }
                }
                _ => return Err(Error::InvalidValue),
            }
            match last_handle {
                Some(h) if h < service.end => cursor = h + 1,
                _ => break,
            }
        }

        {
            let mut state = self.state.borrow_mut();
            for include in &includes {
                // Already known as primary: keep it there.
                let known_primary = matches!(
                    state.cache.all_primary.get(include.start),
                    Some((s, _, Some(_))) if s == include.start
                );
                if !known_primary && state.cache.service_at(include.start).is_none() {
                    state.cache.insert_service(include.clone());
                }
            }
            if state.cache.service_at(service.start).is_none() {
                state.cache.insert_service(service.clone());
            }
            if let Some(entry) = state.cache.service_at_mut(service.start) {
                entry.includes = Some(includes.clone());
            }
        }
        self.persist();
        Ok(includes)
    }

    async fn read_service_uuid(&self, decl_handle: u16) -> Result<Uuid, Error> {
        let pdu = self.request(&AttReq::Read { handle: decl_handle }).await?;
        match AttRsp::decode(&pdu)? {
            AttRsp::Read { data } => Uuid::decode_service_value(data),
            AttRsp::Error { code, .. } => Err(Error::Att(code)),
            _ => Err(Error::InvalidValue),
        }
    }

    /// Discover the characteristics of `service`.
    pub async fn discover_characteristics(&self, service: &ServiceInfo) -> Result<Vec<CharacteristicInfo>, Error> {
        if let Some(chars) = self
            .state
            .borrow()
            .cache
            .service_at(service.start)
            .and_then(|s| s.characteristics.as_ref())
            .map(|cs| cs.iter().map(|c| c.info.clone()).collect::<Vec<_>>())
        {
            return Ok(chars);
        }

        let mut raw: Vec<(u16, u8, u16, Uuid)> = Vec::new();
        let mut cursor = service.start;
        loop {
            let pdu = self
                .request(&AttReq::ReadByType {
                    start: cursor,
                    end: service.end,
                    attribute_type: CHARACTERISTIC_UUID16,
                })
                .await?;
            let mut last_handle = None;
            match AttRsp::decode(&pdu)? {
                AttRsp::Error { code, .. } => {
                    if code == AttErrorCode::AttributeNotFound {
                        break;
                    }
                    return Err(Error::Att(code));
                }
                AttRsp::ReadByType { mut it } => {
                    while let Some(entry) = it.next() {
                        let (handle, value) = entry?;
                        last_handle = Some(handle);
                        if value.len() != 5 && value.len() != 19 {
                            return Err(Error::InvalidValue);
                        }
                        let props = value[0];
                        let value_handle = u16::from_le_bytes([value[1], value[2]]);
                        let uuid = Uuid::from_slice(&value[3..]);
                        raw.push((handle, props, value_handle, uuid));
                    }
                }
                _ => return Err(Error::InvalidValue),
            }
            match last_handle {
                Some(h) if h < service.end => cursor = h + 1,
                _ => break,
            }
        }

        let mut chars = Vec::with_capacity(raw.len());
        for (i, (decl, props, value_handle, uuid)) in raw.iter().enumerate() {
            let end = raw.get(i + 1).map(|next| next.0 - 1).unwrap_or(service.end);
            chars.push(CharacteristicInfo {
                declaration: *decl,
                value: *value_handle,
                end,
                props: CharacteristicProps(*props),
                uuid: uuid.clone(),
            });
        }

        {
            let mut state = self.state.borrow_mut();
            if state.cache.service_at(service.start).is_none() {
                state.cache.insert_service(service.clone());
            }
            if let Some(entry) = state.cache.service_at_mut(service.start) {
                entry.characteristics = Some(
                    chars
                        .iter()
                        .map(|c| RemoteCharacteristic {
                            info: c.clone(),
                            descriptors: None,
                        })
                        .collect(),
                );
            }
        }
        self.persist();
        Ok(chars)
    }

    /// Discover the descriptors of `characteristic`.
    pub async fn discover_descriptors(&self, characteristic: &CharacteristicInfo) -> Result<Vec<DescriptorInfo>, Error> {
        if let Some(cached) = self.cached_descriptors(characteristic) {
            return Ok(cached);
        }
        if characteristic.value >= characteristic.end {
            self.cache_descriptors(characteristic, Vec::new());
            return Ok(Vec::new());
        }

        let mut descriptors = Vec::new();
        let mut cursor = characteristic.value + 1;
        loop {
            let pdu = self
                .request(&AttReq::FindInformation {
                    start_handle: cursor,
                    end_handle: characteristic.end,
                })
                .await?;
            let mut last_handle = None;
            match AttRsp::decode(&pdu)? {
                AttRsp::Error { code, .. } => {
                    if code == AttErrorCode::AttributeNotFound {
                        break;
                    }
                    return Err(Error::Att(code));
                }
                AttRsp::FindInformation { mut it, .. } => {
                    while let Some(entry) = it.next() {
                        let (handle, uuid) = entry?;
                        last_handle = Some(handle);
                        descriptors.push(DescriptorInfo { handle, uuid });
                    }
                }
                _ => return Err(Error::InvalidValue),
            }
            match last_handle {
                Some(h) if h < characteristic.end => cursor = h + 1,
                _ => break,
            }
        }

        self.cache_descriptors(characteristic, descriptors.clone());
        self.persist();
        Ok(descriptors)
    }

    fn cached_descriptors(&self, characteristic: &CharacteristicInfo) -> Option<Vec<DescriptorInfo>> {
        let state = self.state.borrow();
        for service in state.cache.services.iter().flatten() {
            if let Some(chars) = &service.characteristics {
                for c in chars {
                    if c.info.declaration == characteristic.declaration {
                        return c.descriptors.clone();
                    }
                }
            }
        }
        None
    }

    fn cache_descriptors(&self, characteristic: &CharacteristicInfo, descriptors: Vec<DescriptorInfo>) {
        let mut state = self.state.borrow_mut();
        for service in state.cache.services.iter_mut().flatten() {
            if let Some(chars) = &mut service.characteristics {
                for c in chars {
                    if c.info.declaration == characteristic.declaration {
                        c.descriptors = Some(descriptors.clone());
                        return;
                    }
                }
            }
        }
    }

    // --- Reads ---

    /// Read an attribute value, continuing with Read Blob requests while
    /// full responses keep coming, up to the 512-byte attribute limit.
    pub async fn read(&self, handle: u16) -> Result<Vec<u8>, Error> {
        let mut value = self.read_short(handle).await?;
        let mtu = self.mtu();
        while value.len() % (mtu - 1) == 0 && !value.is_empty() && value.len() < config::ATT_MAX_VALUE_LEN {
            match self.read_long(handle, value.len() as u16).await {
                Ok(chunk) => {
                    if chunk.is_empty() {
                        break;
                    }
                    let short = chunk.len() < mtu - 1;
                    value.extend_from_slice(&chunk);
                    if short {
                        break;
                    }
                }
                Err(Error::Att(AttErrorCode::InvalidOffset)) | Err(Error::Att(AttErrorCode::AttributeNotLong)) => break,
                Err(e) => return Err(e),
            }
        }
        value.truncate(config::ATT_MAX_VALUE_LEN);
        Ok(value)
    }

    /// Read with a single Read Request; at most MTU-1 bytes.
    pub async fn read_short(&self, handle: u16) -> Result<Vec<u8>, Error> {
        let pdu = self.request(&AttReq::Read { handle }).await?;
        match AttRsp::decode(&pdu)? {
            AttRsp::Read { data } => Ok(data.to_vec()),
            AttRsp::Error { code, .. } => Err(Error::Att(code)),
            _ => Err(Error::InvalidValue),
        }
    }

    /// Read starting at `offset` with a Read Blob Request.
    pub async fn read_long(&self, handle: u16, offset: u16) -> Result<Vec<u8>, Error> {
        let pdu = self.request(&AttReq::ReadBlob { handle, offset }).await?;
        match AttRsp::decode(&pdu)? {
            AttRsp::ReadBlob { data } => Ok(data.to_vec()),
            AttRsp::Error { code, .. } => Err(Error::Att(code)),
            _ => Err(Error::InvalidValue),
        }
    }

    /// Read the first attribute with `uuid` inside `service`.
    pub async fn read_by_uuid(&self, service: &ServiceInfo, uuid: &Uuid) -> Result<(u16, Vec<u8>), Error> {
        let pdu = self
            .request(&AttReq::ReadByType {
                start: service.start,
                end: service.end,
                attribute_type: uuid.clone(),
            })
            .await?;
        match AttRsp::decode(&pdu)? {
            AttRsp::ReadByType { mut it } => match it.next() {
                Some(entry) => {
                    let (handle, value) = entry?;
                    Ok((handle, value.to_vec()))
                }
                None => Err(Error::Att(AttErrorCode::AttributeNotFound)),
            },
            AttRsp::Error { code, .. } => Err(Error::Att(code)),
            _ => Err(Error::InvalidValue),
        }
    }

    // --- Writes ---

    /// Write an attribute value. Values that fit a single request use
    /// Write Request; longer values (or any write inside a reliable
    /// write session) go through Prepare/Execute.
    pub async fn write(&self, handle: u16, value: &[u8]) -> Result<(), Error> {
        let in_session = self.state.borrow().reliable_write;
        if !in_session && value.len() + 3 <= self.mtu() {
            let pdu = self.request(&AttReq::Write { handle, data: value }).await?;
            return match AttRsp::decode(&pdu)? {
                AttRsp::Write => Ok(()),
                AttRsp::Error { code, .. } => Err(Error::Att(code)),
                _ => Err(Error::InvalidValue),
            };
        }
        self.write_long(handle, 0, value).await
    }

    /// Write without response. The value must fit a single PDU.
    pub async fn write_command(&self, handle: u16, value: &[u8]) -> Result<(), Error> {
        if value.len() + 3 > self.mtu() {
            return Err(Error::InvalidArgument);
        }
        self.request(&AttReq::WriteCmd { handle, data: value }).await?;
        Ok(())
    }

    /// Write `value` at `offset` with a Prepare/Execute sequence.
    ///
    /// Outside a reliable write session the queue is committed (or, on
    /// error, cancelled) immediately. Inside a session the commit waits
    /// for [`GattClient::commit_reliable_write`], and a prepare echo
    /// mismatch aborts the whole session.
    pub async fn write_long(&self, handle: u16, offset: u16, value: &[u8]) -> Result<(), Error> {
        let in_session = self.state.borrow().reliable_write;
        let chunk_size = self.mtu() - 5;
        let mut pos = 0usize;
        while pos < value.len() || (pos == 0 && value.is_empty()) {
            let chunk = &value[pos..(pos + chunk_size).min(value.len())];
            let chunk_offset = offset + pos as u16;
            match self.prepare_write(handle, chunk_offset, chunk).await {
                Ok(()) => {}
                Err(e) => {
                    // Drop whatever was queued.
                    let _ = self.execute_write(false).await;
                    if in_session {
                        self.state.borrow_mut().reliable_write = false;
                        return Err(Error::ReliableWriteAborted);
                    }
                    return Err(e);
                }
            }
            if chunk.is_empty() {
                break;
            }
            pos += chunk.len();
        }

        if in_session {
            return Ok(());
        }
        self.execute_write(true).await
    }

    async fn prepare_write(&self, handle: u16, offset: u16, value: &[u8]) -> Result<(), Error> {
        let pdu = self
            .request(&AttReq::PrepareWrite { handle, offset, value })
            .await?;
        match AttRsp::decode(&pdu)? {
            AttRsp::PrepareWrite {
                handle: rsp_handle,
                offset: rsp_offset,
                value: rsp_value,
            } => {
                // The server must echo the request exactly.
                if rsp_handle != handle || rsp_offset != offset || rsp_value != value {
                    return Err(Error::ReliableWriteAborted);
                }
                Ok(())
            }
            AttRsp::Error { code, .. } => Err(Error::Att(code)),
            _ => Err(Error::InvalidValue),
        }
    }

    async fn execute_write(&self, commit: bool) -> Result<(), Error> {
        let pdu = self
            .request(&AttReq::ExecuteWrite {
                flags: commit as u8,
            })
            .await?;
        match AttRsp::decode(&pdu)? {
            AttRsp::ExecuteWrite => Ok(()),
            AttRsp::Error { code, .. } => Err(Error::Att(code)),
            _ => Err(Error::InvalidValue),
        }
    }

    /// Start a reliable write session: subsequent writes queue on the
    /// server until committed or cancelled.
    pub fn begin_reliable_write(&self) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        if state.reliable_write {
            return Err(Error::InvalidState);
        }
        state.reliable_write = true;
        Ok(())
    }

    /// Commit the queued reliable writes.
    pub async fn commit_reliable_write(&self) -> Result<(), Error> {
        if !self.state.borrow().reliable_write {
            return Err(Error::InvalidState);
        }
        let result = self.execute_write(true).await;
        self.state.borrow_mut().reliable_write = false;
        result
    }

    /// Cancel the session, discarding the queued writes.
    pub async fn cancel_reliable_write(&self) -> Result<(), Error> {
        if !self.state.borrow().reliable_write {
            return Err(Error::InvalidState);
        }
        let result = self.execute_write(false).await;
        self.state.borrow_mut().reliable_write = false;
        result
    }

    /// Write a descriptor value. Long descriptor writes are not allowed
    /// while a reliable write session is open.
    pub async fn write_descriptor(&self, descriptor: &DescriptorInfo, value: &[u8]) -> Result<(), Error> {
        if value.len() + 3 > self.mtu() && self.state.borrow().reliable_write {
            return Err(Error::NotSupported);
        }
        self.write(descriptor.handle, value).await
    }

    /// Configure notifications/indications by writing the CCCD of
    /// `characteristic`, discovering its descriptors if needed.
    pub async fn write_cccd(
        &self,
        characteristic: &CharacteristicInfo,
        enable_notifications: bool,
        enable_indications: bool,
    ) -> Result<(), Error> {
        if enable_notifications && !characteristic.props.any(&[CharacteristicProp::Notify]) {
            return Err(Error::InvalidArgument);
        }
        if enable_indications && !characteristic.props.any(&[CharacteristicProp::Indicate]) {
            return Err(Error::InvalidArgument);
        }
        let descriptors = self.discover_descriptors(characteristic).await?;
        let cccd = descriptors
            .iter()
            .find(|d| d.uuid.matches(&CHARACTERISTIC_CCCD_UUID16))
            .ok_or(Error::Att(AttErrorCode::AttributeNotFound))?;
        let value = [
            (enable_notifications as u8) | ((enable_indications as u8) << 1),
            0,
        ];
        self.write(cccd.handle, &value).await
    }

    // --- Cache management ---

    /// Drop every cached service overlapping `[start, end]`, refresh
    /// include references into the dropped range, and persist.
    pub fn invalidate_services(&self, start: u16, end: u16) {
        {
            let mut state = self.state.borrow_mut();
            let cache = &mut state.cache;
            for (_, _, idx) in cache.all_primary.remove_overlapping(start, end) {
                if let Some(idx) = idx {
                    cache.services[idx] = None;
                }
            }
            for (_, _, idx) in cache.secondary.remove_overlapping(start, end) {
                if let Some(idx) = idx {
                    cache.services[idx] = None;
                }
            }
            for map in cache.by_uuid.values_mut() {
                map.remove_overlapping(start, end);
            }
            cache.has_all_primary = false;

            // Any survivor that included something in the dropped range
            // must rediscover its includes.
            for service in cache.services.iter_mut().flatten() {
                if let Some(includes) = &service.includes {
                    if includes.iter().any(|i| i.start <= end && i.end >= start) {
                        service.includes = None;
                    }
                }
            }
        }
        self.persist();
    }

    /// Serialize and store the cache, unless the peer's address rotates
    /// (resolvable random) or an unbonded peer advertises a changeable
    /// database (Service Changed present).
    fn persist(&self) {
        let Some(store) = self.store else {
            return;
        };
        let (Some(own), Ok(peer)) = (conn_own(&self.conn), self.conn.peer_address()) else {
            return;
        };
        if peer.is_resolvable_random() {
            return;
        }
        let bonded = self.conn.is_bonded();
        let state = self.state.borrow();
        if !bonded && state.cache.has_service_changed() {
            return;
        }
        let file = cache_to_file(&state.cache);
        store.store_gatt_cache(own, peer, bonded, file);
    }
}

fn conn_own<M: RawMutex, T: Transport>(conn: &Connection<'_, M, T>) -> Option<crate::Address> {
    conn.local_address()
}

impl Uuid {
    /// Decode the 2- or 16-byte value of a service declaration.
    pub(crate) fn decode_service_value(value: &[u8]) -> Result<Uuid, Error> {
        match value.len() {
            2 | 16 => Ok(Uuid::from_slice(value)),
            _ => Err(Error::InvalidValue),
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn cache_to_file(cache: &ClientCache) -> GattCacheFile {
    let serialize_map = |map: &RangeMap<Option<usize>>| {
        map.iter()
            .map(|(start, end, idx)| CachedRange {
                start,
                end,
                service: idx
                    .and_then(|idx| cache.services.get(idx))
                    .and_then(|s| s.as_ref())
                    .map(service_to_file),
            })
            .collect()
    };
    GattCacheFile {
        has_all_primary_services: cache.has_all_primary,
        all_primary_services: serialize_map(&cache.all_primary),
        secondary_services: serialize_map(&cache.secondary),
        primary_services_by_uuid: cache
            .by_uuid
            .iter()
            .map(|(uuid, map)| {
                (
                    uuid.to_string(),
                    map.iter()
                        .map(|(start, end, exists)| UuidRange {
                            start,
                            end,
                            exists: *exists,
                        })
                        .collect(),
                )
            })
            .collect(),
        timestamp: now_ms(),
    }
}

fn service_to_file(service: &RemoteService) -> CachedService {
    CachedService {
        uuid: service.info.uuid.to_string(),
        start: service.info.start,
        end: service.info.end,
        secondary: service.info.secondary,
        includes: service.includes.as_ref().map(|includes| {
            includes
                .iter()
                .map(|i| CachedInclude {
                    start: i.start,
                    end: i.end,
                    uuid: Some(i.uuid.to_string()),
                })
                .collect()
        }),
        characteristics: service.characteristics.as_ref().map(|chars| {
            chars
                .iter()
                .map(|c| CachedCharacteristic {
                    decl: c.info.declaration,
                    value: c.info.value,
                    end: c.info.end,
                    props: c.info.props.raw(),
                    uuid: c.info.uuid.to_string(),
                    descriptors: c.descriptors.as_ref().map(|descriptors| {
                        descriptors
                            .iter()
                            .map(|d| CachedDescriptor {
                                handle: d.handle,
                                uuid: d.uuid.to_string(),
                            })
                            .collect()
                    }),
                })
                .collect()
        }),
    }
}

fn cache_from_file(file: GattCacheFile) -> ClientCache {
    let mut cache = ClientCache {
        has_all_primary: file.has_all_primary_services,
        ..Default::default()
    };

    let mut load_map = |ranges: Vec<CachedRange>, secondary: bool, cache: &mut ClientCache| {
        for range in ranges {
            match range.service {
                None => {
                    let map = if secondary {
                        &mut cache.secondary
                    } else {
                        &mut cache.all_primary
                    };
                    map.insert(range.start, range.end, None);
                }
                Some(service) => {
                    let Ok(uuid) = service.uuid.parse::<Uuid>() else {
                        continue;
                    };
                    let idx = cache.insert_service(ServiceInfo {
                        uuid,
                        start: service.start,
                        end: service.end,
                        secondary,
                    });
                    let entry = cache.services[idx].as_mut().unwrap();
                    entry.includes = service.includes.map(|includes| {
                        includes
                            .into_iter()
                            .filter_map(|i| {
                                Some(ServiceInfo {
                                    uuid: i.uuid.as_deref().and_then(|u| u.parse().ok())?,
                                    start: i.start,
                                    end: i.end,
                                    secondary: true,
                                })
                            })
                            .collect()
                    });
                    entry.characteristics = service.characteristics.map(|chars| {
                        chars
                            .into_iter()
                            .filter_map(|c| {
                                Some(RemoteCharacteristic {
                                    info: CharacteristicInfo {
                                        declaration: c.decl,
                                        value: c.value,
                                        end: c.end,
                                        props: CharacteristicProps(c.props),
                                        uuid: c.uuid.parse().ok()?,
                                    },
                                    descriptors: c.descriptors.map(|descriptors| {
                                        descriptors
                                            .into_iter()
                                            .filter_map(|d| {
                                                Some(DescriptorInfo {
                                                    handle: d.handle,
                                                    uuid: d.uuid.parse().ok()?,
                                                })
                                            })
                                            .collect()
                                    }),
                                })
                            })
                            .collect()
                    });
                }
            }
        }
    };
    load_map(file.all_primary_services, false, &mut cache);
    load_map(file.secondary_services, true, &mut cache);

    for (uuid, ranges) in file.primary_services_by_uuid {
        let Ok(uuid) = uuid.parse::<Uuid>() else {
            continue;
        };
        let map = cache.by_uuid.entry(uuid).or_default();
        for range in ranges {
            map.insert(range.start, range.end, range.exists);
        }
    }
    cache
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use embassy_futures::select::{select, Either};
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::att::{
        ATT_ERROR_RSP, ATT_EXECUTE_WRITE_REQ, ATT_EXECUTE_WRITE_RSP, ATT_FIND_INFORMATION_REQ,
        ATT_FIND_INFORMATION_RSP, ATT_PREPARE_WRITE_REQ, ATT_PREPARE_WRITE_RSP, ATT_READ_BY_TYPE_REQ,
        ATT_READ_BY_TYPE_RSP, ATT_READ_REQ, ATT_READ_RSP, ATT_WRITE_REQ, ATT_WRITE_RSP,
    };
    use crate::host::Adapter;
    use crate::mock_transport::MockTransport;
    use crate::tests::{att_from_acl, connect_peer, init_stack, TestAdapter};
    use crate::types::{ConnHandle, Role};
    use crate::Address;

    fn adapter(mock: &MockTransport) -> TestAdapter {
        Adapter::new(mock.clone(), StdRng::seed_from_u64(0x77))
    }

    /// A connection registered directly with the manager, for tests that
    /// never touch the wire.
    fn direct_conn<'a>(
        adapter: &'a TestAdapter,
        handle: u16,
        peer: Address,
    ) -> Connection<'a, NoopRawMutex, MockTransport> {
        let (index, generation) = adapter
            .connections
            .connect(ConnHandle::new(handle), Role::Central, peer)
            .unwrap();
        Connection::new(adapter, index, generation)
    }

    #[tokio::test]
    async fn long_writes_chunk_at_mtu_minus_five() {
        let mock = MockTransport::new();
        let a = adapter(&mock);
        let runner = a.runner();
        let handle = ConnHandle::new(0x0040);

        let main = async {
            init_stack(&mock, &a, 8).await;
            let conn = connect_peer(&mock, &a, 0x0040, [1, 2, 3, 4, 5, 6]).await;
            let client = GattClient::new(conn.clone(), None);

            let seen: RefCell<Vec<(u16, Vec<u8>)>> = RefCell::new(Vec::new());
            let executed: Cell<Option<u8>> = Cell::new(None);
            let value: Vec<u8> = (0..40).map(|i| i as u8).collect();

            let remote = async {
                loop {
                    let req = att_from_acl(&mock.host_packet().await);
                    match req[0] {
                        ATT_PREPARE_WRITE_REQ => {
                            assert_eq!(u16::from_le_bytes([req[1], req[2]]), 0x0050);
                            let offset = u16::from_le_bytes([req[3], req[4]]);
                            seen.borrow_mut().push((offset, req[5..].to_vec()));
                            let mut rsp = req.clone();
                            rsp[0] = ATT_PREPARE_WRITE_RSP;
                            mock.controller_sends(&MockTransport::acl_att(handle, &rsp)).await;
                        }
                        ATT_EXECUTE_WRITE_REQ => {
                            executed.set(Some(req[1]));
                            mock.controller_sends(&MockTransport::acl_att(handle, &[ATT_EXECUTE_WRITE_RSP]))
                                .await;
                        }
                        other => panic!("unexpected request {other:02x}"),
                    }
                }
            };

            let body = async {
                client.write(0x0050, &value).await.unwrap();
                // MTU 23: chunks of 18 at increasing offsets.
                let seen = seen.borrow();
                assert_eq!(seen.len(), 3);
                assert_eq!(seen[0], (0, value[..18].to_vec()));
                assert_eq!(seen[1], (18, value[18..36].to_vec()));
                assert_eq!(seen[2], (36, value[36..].to_vec()));
                // Committed, not cancelled.
                assert_eq!(executed.get(), Some(1));
            };
            match select(remote, body).await {
                Either::First(()) => unreachable!(),
                Either::Second(()) => {}
            }
        };
        let result = select(runner.run(), main).await;
        assert!(matches!(result, Either::Second(())));
    }

    #[tokio::test]
    async fn cccd_writes_validate_and_reuse_discovered_descriptors() {
        let mock = MockTransport::new();
        let a = adapter(&mock);
        let runner = a.runner();
        let handle = ConnHandle::new(0x0040);

        let main = async {
            init_stack(&mock, &a, 8).await;
            let conn = connect_peer(&mock, &a, 0x0040, [1, 2, 3, 4, 5, 6]).await;
            let client = GattClient::new(conn.clone(), None);

            let characteristic = CharacteristicInfo {
                declaration: 0x0F,
                value: 0x10,
                end: 0x12,
                props: CharacteristicProps::from([CharacteristicProp::Notify]),
                uuid: Uuid::new_short(0x2A19),
            };
            // Indications are not a property of this characteristic;
            // refused without touching the wire.
            assert!(matches!(
                client.write_cccd(&characteristic, false, true).await,
                Err(Error::InvalidArgument)
            ));

            // Descriptor discovery needs the characteristic in the cache.
            {
                let mut state = client.state.borrow_mut();
                let idx = state.cache.insert_service(ServiceInfo {
                    uuid: Uuid::new_short(0x180F),
                    start: 0x0E,
                    end: 0x12,
                    secondary: false,
                });
                state.cache.services[idx].as_mut().unwrap().characteristics = Some(vec![RemoteCharacteristic {
                    info: characteristic.clone(),
                    descriptors: None,
                }]);
            }

            let find_infos = Cell::new(0u32);
            let remote = async {
                loop {
                    let req = att_from_acl(&mock.host_packet().await);
                    match req[0] {
                        ATT_FIND_INFORMATION_REQ => {
                            find_infos.set(find_infos.get() + 1);
                            assert_eq!(u16::from_le_bytes([req[1], req[2]]), 0x0011);
                            let rsp = [
                                ATT_FIND_INFORMATION_RSP,
                                0x01,
                                0x11,
                                0x00,
                                0x01,
                                0x29,
                                0x12,
                                0x00,
                                0x02,
                                0x29,
                            ];
                            mock.controller_sends(&MockTransport::acl_att(handle, &rsp)).await;
                        }
                        ATT_WRITE_REQ => {
                            assert_eq!(u16::from_le_bytes([req[1], req[2]]), 0x0012);
                            assert_eq!(&req[3..], &[0x01, 0x00]);
                            mock.controller_sends(&MockTransport::acl_att(handle, &[ATT_WRITE_RSP])).await;
                        }
                        other => panic!("unexpected request {other:02x}"),
                    }
                }
            };

            let body = async {
                client.write_cccd(&characteristic, true, false).await.unwrap();
                // The second write finds the CCCD in the cache.
                client.write_cccd(&characteristic, true, false).await.unwrap();
                assert_eq!(find_infos.get(), 1);
            };
            match select(remote, body).await {
                Either::First(()) => unreachable!(),
                Either::Second(()) => {}
            }
        };
        let result = select(runner.run(), main).await;
        assert!(matches!(result, Either::Second(())));
    }

    #[tokio::test]
    async fn included_services_resolve_full_uuids_and_cache() {
        let root = std::env::temp_dir().join(format!("bluehost-includes-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        let store = Store::new(&root);

        let mock = MockTransport::new();
        let a = adapter(&mock);
        let runner = a.runner();
        let handle = ConnHandle::new(0x0040);

        let main = async {
            init_stack(&mock, &a, 8).await;
            let conn = connect_peer(&mock, &a, 0x0040, [1, 2, 3, 4, 5, 6]).await;
            let client = GattClient::new(conn.clone(), Some(&store));

            let service = ServiceInfo {
                uuid: Uuid::new_short(0x1809),
                start: 0x20,
                end: 0x30,
                secondary: false,
            };
            let long: Uuid = "6e400001-b5a3-f393-e0a9-e50e24dcca9e".parse().unwrap();

            let requests = Cell::new(0u32);
            let remote = async {
                loop {
                    let req = att_from_acl(&mock.host_packet().await);
                    requests.set(requests.get() + 1);
                    let rsp: Vec<u8> = match req[0] {
                        ATT_READ_BY_TYPE_REQ => match u16::from_le_bytes([req[1], req[2]]) {
                            // A 16-bit include carries its uuid inline.
                            0x20 => vec![ATT_READ_BY_TYPE_RSP, 8, 0x21, 0x00, 0x01, 0x00, 0x07, 0x00, 0x0A, 0x18],
                            // A 128-bit include does not.
                            0x22 => vec![ATT_READ_BY_TYPE_RSP, 6, 0x22, 0x00, 0x40, 0x00, 0x48, 0x00],
                            0x23 => vec![ATT_ERROR_RSP, ATT_READ_BY_TYPE_REQ, 0x23, 0x00, 0x0A],
                            other => panic!("unexpected scan start {other:#06x}"),
                        },
                        ATT_READ_REQ => {
                            // Follow-up read of the included declaration.
                            assert_eq!(u16::from_le_bytes([req[1], req[2]]), 0x0040);
                            let mut rsp = vec![ATT_READ_RSP];
                            rsp.extend_from_slice(long.as_raw());
                            rsp
                        }
                        other => panic!("unexpected request {other:02x}"),
                    };
                    mock.controller_sends(&MockTransport::acl_att(handle, &rsp)).await;
                }
            };

            let body = async {
                let includes = client.find_included_services(&service).await.unwrap();
                assert_eq!(includes.len(), 2);
                assert_eq!(
                    includes[0],
                    ServiceInfo {
                        uuid: Uuid::new_short(0x180A),
                        start: 1,
                        end: 7,
                        secondary: true,
                    }
                );
                assert_eq!(includes[1].uuid, long);
                assert_eq!((includes[1].start, includes[1].end), (0x40, 0x48));

                // The result is cached; asking again stays off the wire.
                let on_wire = requests.get();
                let again = client.find_included_services(&service).await.unwrap();
                assert_eq!(again, includes);
                assert_eq!(requests.get(), on_wire);

                // A stable public peer gets its table persisted.
                let own = a.own_address().unwrap();
                let peer = conn.peer_address().unwrap();
                assert!(store.get_gatt_cache(own, peer, false).is_some());
            };
            match select(remote, body).await {
                Either::First(()) => unreachable!(),
                Either::Second(()) => {}
            }
        };
        let result = select(runner.run(), main).await;
        assert!(matches!(result, Either::Second(())));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn primary_discovery_promotes_included_secondaries() {
        let mut cache = ClientCache::default();
        let idx = cache.insert_service(ServiceInfo {
            uuid: Uuid::new_short(0x180A),
            start: 1,
            end: 7,
            secondary: true,
        });
        cache.services[idx].as_mut().unwrap().characteristics = Some(Vec::new());

        let promoted = cache.insert_service(ServiceInfo {
            uuid: Uuid::new_short(0x180A),
            start: 1,
            end: 7,
            secondary: false,
        });
        assert_eq!(promoted, idx);
        assert!(cache.secondary.is_empty());
        let entry = cache.service_at(1).unwrap();
        assert!(!entry.info.secondary);
        // Discovery state survives the move between the maps.
        assert!(entry.characteristics.is_some());
        assert!(cache
            .by_uuid
            .get(&Uuid::new_short(0x180A))
            .map(|m| m.covers(1, 7))
            .unwrap_or(false));
    }

    #[test]
    fn invalidation_drops_ranges_and_included_references() {
        let mock = MockTransport::new();
        let a = adapter(&mock);
        let conn = direct_conn(&a, 0x0040, Address::public([1, 2, 3, 4, 5, 6]));
        let client = GattClient::new(conn, None);

        {
            let mut state = client.state.borrow_mut();
            let target = ServiceInfo {
                uuid: Uuid::new_short(0x180A),
                start: 1,
                end: 7,
                secondary: true,
            };
            state.cache.insert_service(target.clone());
            let survivor = state.cache.insert_service(ServiceInfo {
                uuid: Uuid::new_short(0x1809),
                start: 20,
                end: 30,
                secondary: false,
            });
            state.cache.services[survivor].as_mut().unwrap().includes = Some(vec![target]);
            state.cache.all_primary.insert(8, 19, None);
            state.cache.has_all_primary = true;
        }

        client.invalidate_services(1, 10);

        let state = client.state.borrow();
        assert!(state.cache.service_at(1).is_none());
        assert!(state.cache.secondary.is_empty());
        assert!(!state.cache.has_all_primary);
        // The verified gap overlapping the range is forgotten too.
        assert!(state.cache.all_primary.get(9).is_none());
        let survivor = state.cache.service_at(20).unwrap();
        // Its include into the dropped range must be rediscovered.
        assert!(survivor.includes.is_none());
        assert!(state
            .cache
            .by_uuid
            .get(&Uuid::new_short(0x1809))
            .map(|m| m.covers(20, 30))
            .unwrap_or(false));
    }

    #[test]
    fn cache_serialization_round_trips() {
        let mut cache = ClientCache::default();
        cache.has_all_primary = true;
        let idx = cache.insert_service(ServiceInfo {
            uuid: Uuid::new_short(0x1809),
            start: 20,
            end: 40,
            secondary: false,
        });
        {
            let entry = cache.services[idx].as_mut().unwrap();
            entry.includes = Some(vec![ServiceInfo {
                uuid: "6e400001-b5a3-f393-e0a9-e50e24dcca9e".parse().unwrap(),
                start: 1,
                end: 7,
                secondary: true,
            }]);
            entry.characteristics = Some(vec![RemoteCharacteristic {
                info: CharacteristicInfo {
                    declaration: 21,
                    value: 22,
                    end: 25,
                    props: CharacteristicProps::from([CharacteristicProp::Read, CharacteristicProp::Notify]),
                    uuid: Uuid::new_short(0x2A19),
                },
                descriptors: Some(vec![DescriptorInfo {
                    handle: 23,
                    uuid: Uuid::new_short(0x2902),
                }]),
            }]);
        }
        cache.insert_service(ServiceInfo {
            uuid: Uuid::new_short(0x180A),
            start: 1,
            end: 7,
            secondary: true,
        });
        cache.all_primary.insert(41, 0xFFFF, None);

        let mut file = cache_to_file(&cache);
        file.timestamp = 7;
        let mut again = cache_to_file(&cache_from_file(file.clone()));
        again.timestamp = 7;
        assert_eq!(file, again);
    }

    #[tokio::test]
    async fn persistence_skips_rotating_and_changeable_peers() {
        let root = std::env::temp_dir().join(format!("bluehost-skip-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        let store = Store::new(&root);

        let mock = MockTransport::new();
        let a = adapter(&mock);
        let runner = a.runner();

        let main = async {
            init_stack(&mock, &a, 8).await;
            let own = a.own_address().unwrap();

            // Resolvable random addresses rotate between connections.
            let rotating = Address::parse("01:42:1F:9A:AA:BB:CC").unwrap();
            let client = GattClient::new(direct_conn(&a, 0x0041, rotating), Some(&store));
            client.invalidate_services(1, 2);
            assert!(store.get_gatt_cache(own, rotating, false).is_none());

            // An unbonded peer exposing Service Changed may reshuffle its
            // table between sessions.
            let changeable = Address::public([7, 7, 7, 7, 7, 7]);
            let client = GattClient::new(direct_conn(&a, 0x0042, changeable), Some(&store));
            {
                let mut state = client.state.borrow_mut();
                let idx = state.cache.insert_service(ServiceInfo {
                    uuid: GENERIC_ATTRIBUTE_SERVICE_UUID16,
                    start: 1,
                    end: 4,
                    secondary: false,
                });
                state.cache.services[idx].as_mut().unwrap().characteristics = Some(vec![RemoteCharacteristic {
                    info: CharacteristicInfo {
                        declaration: 2,
                        value: 3,
                        end: 4,
                        props: CharacteristicProps::from([CharacteristicProp::Indicate]),
                        uuid: CHARACTERISTIC_SERVICE_CHANGED_UUID16,
                    },
                    descriptors: None,
                }]);
            }
            client.invalidate_services(0x10, 0x11);
            assert!(store.get_gatt_cache(own, changeable, false).is_none());

            // A plain static peer is persisted.
            let stable = Address::public([8, 8, 8, 8, 8, 8]);
            let client = GattClient::new(direct_conn(&a, 0x0043, stable), Some(&store));
            {
                let mut state = client.state.borrow_mut();
                state.cache.insert_service(ServiceInfo {
                    uuid: Uuid::new_short(0x180F),
                    start: 1,
                    end: 4,
                    secondary: false,
                });
            }
            client.invalidate_services(0x10, 0x11);
            assert!(store.get_gatt_cache(own, stable, false).is_some());
        };
        let result = select(runner.run(), main).await;
        assert!(matches!(result, Either::Second(())));
        let _ = std::fs::remove_dir_all(&root);
    }
}
