//! The GATT server attribute database.
//!
//! Services are described with [`Service`], [`Characteristic`] and
//! [`Descriptor`] values and laid out into a sparse, handle-indexed
//! [`AttributeTable`]. The table places each service into the first gap
//! that fits (honoring start-handle hints), emits declaration attributes
//! and auto-inserts the CCCD and Extended Properties descriptors.

use core::cell::RefCell;
use std::collections::BTreeMap;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::att::AttErrorCode;
use crate::config;
use crate::cursor::WriteCursor;
use crate::types::uuid::Uuid;
use crate::types::SecurityLevel;
use crate::Error;

/// UUID for generic access service
pub const GENERIC_ACCESS_SERVICE_UUID16: Uuid = Uuid::new_short(0x1800);

/// UUID for generic attribute service
pub const GENERIC_ATTRIBUTE_SERVICE_UUID16: Uuid = Uuid::new_short(0x1801);

/// UUID for device name characteristic
pub const CHARACTERISTIC_DEVICE_NAME_UUID16: Uuid = Uuid::new_short(0x2A00);

/// UUID for appearance characteristic
pub const CHARACTERISTIC_APPEARANCE_UUID16: Uuid = Uuid::new_short(0x2A01);

/// UUID for service changed characteristic
pub const CHARACTERISTIC_SERVICE_CHANGED_UUID16: Uuid = Uuid::new_short(0x2A05);

/// UUID for primary service declarations
pub const PRIMARY_SERVICE_UUID16: Uuid = Uuid::new_short(0x2800);

/// UUID for secondary service declarations
pub const SECONDARY_SERVICE_UUID16: Uuid = Uuid::new_short(0x2801);

/// UUID for include declarations
pub const INCLUDE_SERVICE_UUID16: Uuid = Uuid::new_short(0x2802);

/// UUID for characteristic declarations
pub const CHARACTERISTIC_UUID16: Uuid = Uuid::new_short(0x2803);

/// UUID for the extended properties descriptor
pub const CHARACTERISTIC_EXT_PROPS_UUID16: Uuid = Uuid::new_short(0x2900);

/// UUID for the client characteristic configuration descriptor
pub const CHARACTERISTIC_CCCD_UUID16: Uuid = Uuid::new_short(0x2902);

/// Characteristic properties.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CharacteristicProp {
    /// Broadcast
    Broadcast = 0x01,
    /// Read
    Read = 0x02,
    /// Write without response
    WriteWithoutResponse = 0x04,
    /// Write
    Write = 0x08,
    /// Notify
    Notify = 0x10,
    /// Indicate
    Indicate = 0x20,
    /// Authenticated signed writes. Rejected at service-add time; signed
    /// writes are not supported.
    AuthenticatedSignedWrites = 0x40,
    /// Extended properties present. Derived, never set directly.
    Extended = 0x80,
}

/// A property bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharacteristicProps(pub(crate) u8);

impl CharacteristicProps {
    /// Check if any of the given properties are set.
    pub fn any(&self, props: &[CharacteristicProp]) -> bool {
        for p in props {
            if (*p as u8) & self.0 != 0 {
                return true;
            }
        }
        false
    }

    pub(crate) fn raw(&self) -> u8 {
        self.0
    }
}

impl<'a> From<&'a [CharacteristicProp]> for CharacteristicProps {
    fn from(props: &'a [CharacteristicProp]) -> Self {
        let mut val: u8 = 0;
        for prop in props {
            val |= *prop as u8;
        }
        CharacteristicProps(val)
    }
}

impl<const T: usize> From<[CharacteristicProp; T]> for CharacteristicProps {
    fn from(props: [CharacteristicProp; T]) -> Self {
        CharacteristicProps::from(&props[..])
    }
}

/// Access requirement of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Permission {
    /// Never allowed.
    #[default]
    NotPermitted,
    /// Always allowed.
    Open,
    /// Requires an encrypted link.
    Encrypted,
    /// Requires an encrypted link with an authenticated (MITM) key.
    EncryptedMitm,
    /// Requires an encrypted link with an authenticated key from LE
    /// Secure Connections pairing.
    EncryptedMitmSc,
    /// Deferred to the authorize hooks of the handler.
    Custom,
}

impl Permission {
    /// Evaluate this permission against the link's security state.
    ///
    /// `ltk_stored` selects between `INSUFFICIENT_ENCRYPTION` (we have a
    /// key and could encrypt) and `INSUFFICIENT_AUTHENTICATION` (pairing
    /// needed first) when the link is plaintext.
    pub(crate) fn check(&self, security: &SecurityLevel, ltk_stored: bool, write: bool) -> Result<(), AttErrorCode> {
        match self {
            Permission::Open | Permission::Custom => Ok(()),
            Permission::NotPermitted => Err(if write {
                AttErrorCode::WriteNotPermitted
            } else {
                AttErrorCode::ReadNotPermitted
            }),
            Permission::Encrypted | Permission::EncryptedMitm | Permission::EncryptedMitmSc => {
                if !security.encrypted {
                    return Err(if ltk_stored {
                        AttErrorCode::InsufficientEncryption
                    } else {
                        AttErrorCode::InsufficientAuthentication
                    });
                }
                let need_mitm = matches!(self, Permission::EncryptedMitm | Permission::EncryptedMitmSc);
                let need_sc = matches!(self, Permission::EncryptedMitmSc);
                if (need_mitm && !security.mitm) || (need_sc && !security.secure_connections) {
                    return Err(AttErrorCode::InsufficientAuthentication);
                }
                Ok(())
            }
        }
    }
}

/// The storage behind a characteristic or descriptor value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// A byte value stored in the table.
    Bytes(Vec<u8>),
    /// A UTF-8 value stored in the table. Writes keep the string type.
    Str(String),
    /// Reads and writes are routed to the [`GattHandler`](crate::gatt::GattHandler).
    External,
}

impl AttributeValue {
    pub(crate) fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            AttributeValue::Bytes(b) => Some(b),
            AttributeValue::Str(s) => Some(s.as_bytes()),
            AttributeValue::External => None,
        }
    }
}

/// A descriptor definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub read_perm: Permission,
    pub write_perm: Permission,
    pub max_len: usize,
    pub value: AttributeValue,
}

impl Descriptor {
    /// A readable descriptor holding `value`.
    pub fn read_only(uuid: impl Into<Uuid>, value: impl Into<Vec<u8>>) -> Self {
        let value: Vec<u8> = value.into();
        Self {
            uuid: uuid.into(),
            read_perm: Permission::Open,
            write_perm: Permission::NotPermitted,
            max_len: value.len(),
            value: AttributeValue::Bytes(value),
        }
    }
}

/// A characteristic definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub props: CharacteristicProps,
    /// Reliable Write extended property.
    pub reliable_write: bool,
    /// Writable Auxiliaries extended property.
    pub writable_auxiliaries: bool,
    pub read_perm: Permission,
    pub write_perm: Permission,
    pub max_len: usize,
    pub value: AttributeValue,
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    /// A characteristic with the given properties, externally handled by
    /// default.
    pub fn new(uuid: impl Into<Uuid>, props: impl Into<CharacteristicProps>) -> Self {
        Self {
            uuid: uuid.into(),
            props: props.into(),
            reliable_write: false,
            writable_auxiliaries: false,
            read_perm: Permission::NotPermitted,
            write_perm: Permission::NotPermitted,
            max_len: config::ATT_MAX_VALUE_LEN,
            value: AttributeValue::External,
            descriptors: Vec::new(),
        }
    }

    pub fn read_perm(mut self, perm: Permission) -> Self {
        self.read_perm = perm;
        self
    }

    pub fn write_perm(mut self, perm: Permission) -> Self {
        self.write_perm = perm;
        self
    }

    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn value(mut self, value: AttributeValue) -> Self {
        self.value = value;
        self
    }

    pub fn reliable_write(mut self) -> Self {
        self.reliable_write = true;
        self
    }

    pub fn writable_auxiliaries(mut self) -> Self {
        self.writable_auxiliaries = true;
        self
    }

    pub fn descriptor(mut self, descriptor: Descriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

/// A service definition handed to [`AttributeTable::add_services`].
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub uuid: Uuid,
    pub secondary: bool,
    /// Preferred start handle; honored when it fits an available gap.
    pub start_handle: Option<u16>,
    /// Start handles of previously added services to include.
    pub includes: Vec<u16>,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    /// Create a new primary service definition.
    pub fn new(uuid: impl Into<Uuid>) -> Self {
        Self {
            uuid: uuid.into(),
            secondary: false,
            start_handle: None,
            includes: Vec::new(),
            characteristics: Vec::new(),
        }
    }

    pub fn secondary(mut self) -> Self {
        self.secondary = true;
        self
    }

    pub fn start_handle(mut self, handle: u16) -> Self {
        self.start_handle = Some(handle);
        self
    }

    pub fn include(mut self, start_handle: u16) -> Self {
        self.includes.push(start_handle);
        self
    }

    pub fn characteristic(mut self, characteristic: Characteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

/// Handle layout of a placed characteristic.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharacteristicHandle {
    /// The declaration attribute.
    pub decl: u16,
    /// The value attribute.
    pub value: u16,
    /// The CCCD, when the characteristic supports notify or indicate.
    pub cccd: Option<u16>,
    /// Last handle belonging to the characteristic.
    pub end: u16,
}

/// Handle layout of a placed service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceHandle {
    pub start: u16,
    pub end: u16,
    pub characteristics: Vec<CharacteristicHandle>,
}

/// What an attribute is, beyond its stored bytes.
pub(crate) enum AttributeData {
    ServiceDecl {
        secondary: bool,
        uuid: Uuid,
    },
    IncludeDecl {
        start: u16,
        end: u16,
        uuid16: Option<u16>,
    },
    CharacteristicDecl {
        props: u8,
        value_handle: u16,
        uuid: Uuid,
    },
    Value {
        backing: AttributeValue,
    },
    Descriptor {
        backing: AttributeValue,
    },
    Cccd {
        /// Value handle of the owning characteristic.
        value_handle: u16,
        notify_allowed: bool,
        indicate_allowed: bool,
    },
    ExtendedProps {
        value: u16,
    },
}

/// One attribute in the table.
pub(crate) struct Attribute {
    pub uuid: Uuid,
    pub handle: u16,
    /// Set on service declarations: last handle of the group.
    pub group_end: Option<u16>,
    pub read_perm: Permission,
    pub write_perm: Permission,
    pub max_len: usize,
    pub data: AttributeData,
}

/// Metadata snapshot used by the ATT engine while the table lock is not
/// held (handlers may suspend).
#[derive(Clone)]
pub(crate) struct AttrSnapshot {
    pub handle: u16,
    pub uuid: Uuid,
    pub group_end: Option<u16>,
    pub read_perm: Permission,
    pub write_perm: Permission,
    pub max_len: usize,
    pub external: bool,
    pub is_cccd: bool,
}

struct ServiceRecord {
    start: u16,
    end: u16,
}

struct Inner {
    attributes: BTreeMap<u16, Attribute>,
    services: Vec<ServiceRecord>,
}

/// A sparse table of attributes indexed by handle.
pub struct AttributeTable<M: RawMutex> {
    inner: Mutex<M, RefCell<Inner>>,
}

impl<M: RawMutex> Default for AttributeTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex> AttributeTable<M> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                attributes: BTreeMap::new(),
                services: Vec::new(),
            })),
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        self.inner.lock(|inner| f(&mut inner.borrow_mut()))
    }

    /// Number of handles the service will occupy once placed.
    fn number_of_handles(service: &Service) -> Result<usize, Error> {
        let mut n = 1 + service.includes.len();
        for c in &service.characteristics {
            n += 2 + c.descriptors.len();
            if Self::wants_cccd(c)? {
                n += 1;
            }
            if c.reliable_write || c.writable_auxiliaries {
                n += 1;
            }
        }
        Ok(n)
    }

    fn wants_cccd(c: &Characteristic) -> Result<bool, Error> {
        let user_cccds = c
            .descriptors
            .iter()
            .filter(|d| d.uuid == CHARACTERISTIC_CCCD_UUID16)
            .count();
        if user_cccds > 1 {
            return Err(Error::InvalidArgument);
        }
        Ok(c.props.any(&[CharacteristicProp::Notify, CharacteristicProp::Indicate]) && user_cccds == 0)
    }

    fn validate(&self, service: &Service) -> Result<(), Error> {
        for c in &service.characteristics {
            if c.props.any(&[CharacteristicProp::AuthenticatedSignedWrites]) {
                return Err(Error::InvalidArgument);
            }
            if c.max_len > config::ATT_MAX_VALUE_LEN {
                return Err(Error::InvalidArgument);
            }
            // Properties and permissions must agree, both ways.
            let readable = c.props.any(&[CharacteristicProp::Read]);
            if readable != (c.read_perm != Permission::NotPermitted) {
                return Err(Error::InvalidArgument);
            }
            let writable = c.props.any(&[
                CharacteristicProp::Write,
                CharacteristicProp::WriteWithoutResponse,
            ]) || c.reliable_write;
            if writable != (c.write_perm != Permission::NotPermitted) {
                return Err(Error::InvalidArgument);
            }
            let subscribable = c.props.any(&[CharacteristicProp::Notify, CharacteristicProp::Indicate]);
            for d in &c.descriptors {
                if d.uuid == CHARACTERISTIC_EXT_PROPS_UUID16 {
                    // Always derived from the extended property flags.
                    return Err(Error::InvalidArgument);
                }
                if d.uuid == CHARACTERISTIC_CCCD_UUID16 && !subscribable {
                    return Err(Error::InvalidArgument);
                }
                if d.max_len > config::ATT_MAX_VALUE_LEN {
                    return Err(Error::InvalidArgument);
                }
            }
            Self::wants_cccd(c)?;
        }
        for include in &service.includes {
            let known = self.with_inner(|inner| {
                inner
                    .attributes
                    .get(include)
                    .map(|a| matches!(a.data, AttributeData::ServiceDecl { .. }))
                    .unwrap_or(false)
            });
            if !known {
                return Err(Error::InvalidArgument);
            }
        }
        Ok(())
    }

    /// Find a start handle for `count` handles, preferring `hint` when it
    /// fits a gap. `occupied` is the sorted list of taken ranges.
    fn place(occupied: &[(u16, u16)], hint: Option<u16>, count: usize) -> Option<u16> {
        let count = count as u32;
        let mut gaps: Vec<(u32, u32)> = Vec::new();
        let mut cursor: u32 = 1;
        for &(start, end) in occupied {
            if (start as u32) > cursor {
                gaps.push((cursor, start as u32 - 1));
            }
            cursor = end as u32 + 1;
        }
        if cursor <= 0xFFFF {
            gaps.push((cursor, 0xFFFF));
        }

        if let Some(hint) = hint {
            let hint = hint as u32;
            if hint >= 1 {
                for &(gs, ge) in &gaps {
                    if hint >= gs && hint + count - 1 <= ge {
                        return Some(hint as u16);
                    }
                }
            }
        }
        for &(gs, ge) in &gaps {
            if ge - gs + 1 >= count {
                return Some(gs as u16);
            }
        }
        None
    }

    /// Add a batch of services. Either all of them are placed or none.
    pub fn add_services(&self, services: Vec<Service>) -> Result<Vec<ServiceHandle>, Error> {
        for service in &services {
            self.validate(service)?;
        }

        // Dry-run placement against a scratch occupancy list so a late
        // failure leaves the table untouched.
        let mut occupied: Vec<(u16, u16)> =
            self.with_inner(|inner| inner.services.iter().map(|s| (s.start, s.end)).collect());
        occupied.sort_unstable();
        let mut placements = Vec::with_capacity(services.len());
        for service in &services {
            let count = Self::number_of_handles(service)?;
            let start = Self::place(&occupied, service.start_handle, count).ok_or(Error::InsufficientSpace)?;
            let end = start + count as u16 - 1;
            occupied.push((start, end));
            occupied.sort_unstable();
            placements.push(start);
        }

        let mut result = Vec::with_capacity(services.len());
        for (service, start) in services.into_iter().zip(placements) {
            result.push(self.emit(service, start)?);
        }
        Ok(result)
    }

    /// Emit the attributes of `service` starting at `start`.
    fn emit(&self, service: Service, start: u16) -> Result<ServiceHandle, Error> {
        let count = Self::number_of_handles(&service)? as u16;
        let end = start + count - 1;
        self.with_inner(|inner| {
            let mut handle = start;
            let decl_uuid = if service.secondary {
                SECONDARY_SERVICE_UUID16
            } else {
                PRIMARY_SERVICE_UUID16
            };
            inner.attributes.insert(
                handle,
                Attribute {
                    uuid: decl_uuid,
                    handle,
                    group_end: Some(end),
                    read_perm: Permission::Open,
                    write_perm: Permission::NotPermitted,
                    max_len: service.uuid.as_raw().len(),
                    data: AttributeData::ServiceDecl {
                        secondary: service.secondary,
                        uuid: service.uuid.clone(),
                    },
                },
            );
            handle += 1;

            for include in &service.includes {
                let (inc_end, inc_uuid16) = {
                    let attr = inner.attributes.get(include).expect("validated include");
                    let uuid16 = match &attr.data {
                        AttributeData::ServiceDecl { uuid, .. } => uuid.as_short(),
                        _ => None,
                    };
                    (attr.group_end.unwrap_or(*include), uuid16)
                };
                inner.attributes.insert(
                    handle,
                    Attribute {
                        uuid: INCLUDE_SERVICE_UUID16,
                        handle,
                        group_end: None,
                        read_perm: Permission::Open,
                        write_perm: Permission::NotPermitted,
                        max_len: if inc_uuid16.is_some() { 6 } else { 4 },
                        data: AttributeData::IncludeDecl {
                            start: *include,
                            end: inc_end,
                            uuid16: inc_uuid16,
                        },
                    },
                );
                handle += 1;
            }

            let mut placed_chars = Vec::with_capacity(service.characteristics.len());
            for c in service.characteristics {
                let auto_cccd = Self::wants_cccd(&c).expect("validated characteristic");
                let extended = c.reliable_write || c.writable_auxiliaries;
                let mut props = c.props.raw();
                if extended {
                    props |= CharacteristicProp::Extended as u8;
                }

                let decl = handle;
                let value_handle = handle + 1;
                inner.attributes.insert(
                    decl,
                    Attribute {
                        uuid: CHARACTERISTIC_UUID16,
                        handle: decl,
                        group_end: None,
                        read_perm: Permission::Open,
                        write_perm: Permission::NotPermitted,
                        max_len: 3 + c.uuid.as_raw().len(),
                        data: AttributeData::CharacteristicDecl {
                            props,
                            value_handle,
                            uuid: c.uuid.clone(),
                        },
                    },
                );
                inner.attributes.insert(
                    value_handle,
                    Attribute {
                        uuid: c.uuid.clone(),
                        handle: value_handle,
                        group_end: None,
                        read_perm: c.read_perm,
                        write_perm: c.write_perm,
                        max_len: c.max_len,
                        data: AttributeData::Value { backing: c.value },
                    },
                );
                handle += 2;

                let notify_allowed = c.props.any(&[CharacteristicProp::Notify]);
                let indicate_allowed = c.props.any(&[CharacteristicProp::Indicate]);
                let mut cccd = None;
                if auto_cccd {
                    inner.attributes.insert(
                        handle,
                        Attribute {
                            uuid: CHARACTERISTIC_CCCD_UUID16,
                            handle,
                            group_end: None,
                            read_perm: Permission::Open,
                            write_perm: Permission::Open,
                            max_len: 2,
                            data: AttributeData::Cccd {
                                value_handle,
                                notify_allowed,
                                indicate_allowed,
                            },
                        },
                    );
                    cccd = Some(handle);
                    handle += 1;
                }

                for d in c.descriptors {
                    let data = if d.uuid == CHARACTERISTIC_CCCD_UUID16 {
                        cccd = Some(handle);
                        AttributeData::Cccd {
                            value_handle,
                            notify_allowed,
                            indicate_allowed,
                        }
                    } else {
                        AttributeData::Descriptor { backing: d.value }
                    };
                    inner.attributes.insert(
                        handle,
                        Attribute {
                            uuid: d.uuid.clone(),
                            handle,
                            group_end: None,
                            read_perm: d.read_perm,
                            write_perm: d.write_perm,
                            max_len: d.max_len,
                            data,
                        },
                    );
                    handle += 1;
                }

                if extended {
                    let mut value = 0u16;
                    if c.reliable_write {
                        value |= 0x0001;
                    }
                    if c.writable_auxiliaries {
                        value |= 0x0002;
                    }
                    inner.attributes.insert(
                        handle,
                        Attribute {
                            uuid: CHARACTERISTIC_EXT_PROPS_UUID16,
                            handle,
                            group_end: None,
                            read_perm: Permission::Open,
                            write_perm: Permission::NotPermitted,
                            max_len: 2,
                            data: AttributeData::ExtendedProps { value },
                        },
                    );
                    handle += 1;
                }

                placed_chars.push(CharacteristicHandle {
                    decl,
                    value: value_handle,
                    cccd,
                    end: handle - 1,
                });
            }
            debug_assert_eq!(handle - 1, end);

            let pos = inner.services.partition_point(|s| s.start < start);
            inner.services.insert(pos, ServiceRecord { start, end });
            Ok(ServiceHandle {
                start,
                end,
                characteristics: placed_chars,
            })
        })
    }

    /// Remove the service starting at `start` and every attribute in its
    /// range.
    pub fn remove_service(&self, start: u16) -> Result<(), Error> {
        self.with_inner(|inner| {
            let pos = inner
                .services
                .iter()
                .position(|s| s.start == start)
                .ok_or(Error::NotFound)?;
            let record = inner.services.remove(pos);
            let doomed: Vec<u16> = inner
                .attributes
                .range(record.start..=record.end)
                .map(|(&h, _)| h)
                .collect();
            for h in doomed {
                inner.attributes.remove(&h);
            }
            Ok(())
        })
    }

    /// Snapshot the attribute metadata in `[start, end]`, in handle order.
    pub(crate) fn snapshot_range(&self, start: u16, end: u16) -> Vec<AttrSnapshot> {
        self.with_inner(|inner| {
            inner
                .attributes
                .range(start..=end)
                .map(|(_, a)| AttrSnapshot {
                    handle: a.handle,
                    uuid: a.uuid.clone(),
                    group_end: a.group_end,
                    read_perm: a.read_perm,
                    write_perm: a.write_perm,
                    max_len: a.max_len,
                    external: matches!(
                        a.data,
                        AttributeData::Value {
                            backing: AttributeValue::External
                        } | AttributeData::Descriptor {
                            backing: AttributeValue::External
                        }
                    ),
                    is_cccd: matches!(a.data, AttributeData::Cccd { .. }),
                })
                .collect()
        })
    }

    pub(crate) fn snapshot(&self, handle: u16) -> Option<AttrSnapshot> {
        let mut v = self.snapshot_range(handle, handle);
        v.pop()
    }

    pub(crate) fn with_attr<R>(&self, handle: u16, f: impl FnOnce(&Attribute) -> R) -> Option<R> {
        self.with_inner(|inner| inner.attributes.get(&handle).map(f))
    }

    /// Every CCCD handle in the table, with its owning value handle and
    /// allowed bits.
    pub(crate) fn cccd_handles(&self) -> Vec<(u16, u16, bool, bool)> {
        self.with_inner(|inner| {
            inner
                .attributes
                .values()
                .filter_map(|a| match a.data {
                    AttributeData::Cccd {
                        value_handle,
                        notify_allowed,
                        indicate_allowed,
                    } => Some((a.handle, value_handle, notify_allowed, indicate_allowed)),
                    _ => None,
                })
                .collect()
        })
    }

    /// Read a stored (non-external, non-CCCD) attribute value starting at
    /// `offset`. Declarations encode their wire value on the fly.
    pub(crate) fn read_stored(&self, handle: u16, offset: usize) -> Result<Vec<u8>, AttErrorCode> {
        self.with_inner(|inner| {
            let attr = inner.attributes.get(&handle).ok_or(AttErrorCode::InvalidHandle)?;
            let value: Vec<u8> = match &attr.data {
                AttributeData::ServiceDecl { uuid, .. } => uuid.as_raw().to_vec(),
                AttributeData::IncludeDecl { start, end, uuid16 } => {
                    let mut buf = [0u8; 6];
                    let mut w = WriteCursor::new(&mut buf);
                    w.write(*start).map_err(|_| AttErrorCode::UnlikelyError)?;
                    w.write(*end).map_err(|_| AttErrorCode::UnlikelyError)?;
                    if let Some(uuid16) = uuid16 {
                        w.write(*uuid16).map_err(|_| AttErrorCode::UnlikelyError)?;
                    }
                    let len = w.len();
                    buf[..len].to_vec()
                }
                AttributeData::CharacteristicDecl {
                    props,
                    value_handle,
                    uuid,
                } => {
                    let mut buf = vec![0u8; 3 + uuid.as_raw().len()];
                    let mut w = WriteCursor::new(&mut buf);
                    w.write(*props).map_err(|_| AttErrorCode::UnlikelyError)?;
                    w.write(*value_handle).map_err(|_| AttErrorCode::UnlikelyError)?;
                    w.append(uuid.as_raw()).map_err(|_| AttErrorCode::UnlikelyError)?;
                    buf
                }
                AttributeData::ExtendedProps { value } => value.to_le_bytes().to_vec(),
                AttributeData::Value { backing } | AttributeData::Descriptor { backing } => {
                    backing.as_bytes().ok_or(AttErrorCode::UnlikelyError)?.to_vec()
                }
                AttributeData::Cccd { .. } => return Err(AttErrorCode::UnlikelyError),
            };
            if offset > value.len() {
                return Err(AttErrorCode::InvalidOffset);
            }
            Ok(value[offset..].to_vec())
        })
    }

    /// Write a stored attribute value at `offset`, replacing the tail and
    /// preserving the value's type tag.
    pub(crate) fn write_stored(&self, handle: u16, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        self.with_inner(|inner| {
            let attr = inner.attributes.get_mut(&handle).ok_or(AttErrorCode::InvalidHandle)?;
            if offset > attr.max_len {
                return Err(AttErrorCode::InvalidOffset);
            }
            if offset + data.len() > attr.max_len {
                return Err(AttErrorCode::InvalidAttributeValueLength);
            }
            let backing = match &mut attr.data {
                AttributeData::Value { backing } | AttributeData::Descriptor { backing } => backing,
                _ => return Err(AttErrorCode::WriteNotPermitted),
            };
            match backing {
                AttributeValue::Bytes(value) => {
                    let mut next = Vec::with_capacity(offset + data.len());
                    next.extend_from_slice(&value[..offset.min(value.len())]);
                    next.resize(offset, 0);
                    next.extend_from_slice(data);
                    *value = next;
                }
                AttributeValue::Str(value) => {
                    let bytes = value.as_bytes();
                    let mut next = Vec::with_capacity(offset + data.len());
                    next.extend_from_slice(&bytes[..offset.min(bytes.len())]);
                    next.resize(offset, 0);
                    next.extend_from_slice(data);
                    *value = String::from_utf8_lossy(&next).into_owned();
                }
                AttributeValue::External => return Err(AttErrorCode::UnlikelyError),
            }
            Ok(())
        })
    }
}
