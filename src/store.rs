//! Filesystem persistence for security keys, server CCCD values and
//! GATT client caches.
//!
//! Layout, per own address (`TT-AA-AA-AA-BB-BB-BB`):
//!
//! ```text
//! <root>/<own>/bonds/<peer>/keys.json
//! <root>/<own>/bonds/<peer>/gatt_client_cache.json
//! <root>/<own>/bonds/<peer>/gatt_server_cccds/XXXX.json
//! <root>/<own>/unbonded/<peer>/gatt_client_cache.json
//! ```
//!
//! All file I/O is best effort: a failed write is logged and forgotten,
//! unreadable or corrupt files are ignored on load. Concurrent access
//! to one root from multiple processes is not supported.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use serde::{Deserialize, Serialize};

use crate::config;
use crate::dedup::DuplicateCache;
use crate::types::AddrKind;
use crate::{Address, Error};

/// A long term key with its identifying pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ltk {
    pub rand: u64,
    pub ediv: u16,
    pub ltk: [u8; 16],
}

/// The key material stored for a bonded peer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Keys {
    /// The keys were produced by an authenticated (MITM) pairing.
    pub mitm: bool,
    /// The keys were produced by LE Secure Connections pairing.
    pub sc: bool,
    /// The peer's identity resolving key.
    pub irk: Option<[u8; 16]>,
    pub local_ltk: Option<Ltk>,
    pub peer_ltk: Option<Ltk>,
}

#[derive(Serialize, Deserialize)]
struct LtkFile {
    rand: String,
    ediv: u16,
    ltk: String,
}

#[derive(Serialize, Deserialize)]
struct KeysFile {
    mitm: bool,
    sc: bool,
    irk: Option<String>,
    #[serde(rename = "localLtk")]
    local_ltk: Option<LtkFile>,
    #[serde(rename = "peerLtk")]
    peer_ltk: Option<LtkFile>,
}

/// Serialized form of a cached range map entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedRange {
    pub start: u16,
    pub end: u16,
    /// `None` records a verified gap.
    pub service: Option<CachedService>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedService {
    pub uuid: String,
    pub start: u16,
    pub end: u16,
    pub secondary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub includes: Option<Vec<CachedInclude>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub characteristics: Option<Vec<CachedCharacteristic>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedInclude {
    pub start: u16,
    pub end: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedCharacteristic {
    pub decl: u16,
    pub value: u16,
    pub end: u16,
    pub props: u8,
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptors: Option<Vec<CachedDescriptor>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedDescriptor {
    pub handle: u16,
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UuidRange {
    pub start: u16,
    pub end: u16,
    pub exists: bool,
}

/// Serialized GATT client cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GattCacheFile {
    #[serde(rename = "hasAllPrimaryServices")]
    pub has_all_primary_services: bool,
    #[serde(rename = "allPrimaryServices")]
    pub all_primary_services: Vec<CachedRange>,
    #[serde(rename = "secondaryServices")]
    pub secondary_services: Vec<CachedRange>,
    #[serde(rename = "primaryServicesByUUID")]
    pub primary_services_by_uuid: HashMap<String, Vec<UuidRange>>,
    /// Milliseconds since the epoch; orders the unbonded FIFO on load.
    pub timestamp: u64,
}

struct StoredKeys {
    keys: Keys,
    /// AES-128 keyed with the byte-reversed IRK, ready for address
    /// resolution.
    cipher: Option<Aes128>,
}

struct OwnStore {
    keys: HashMap<Address, StoredKeys>,
    cccds: HashMap<(Address, u16), u8>,
    bonded_caches: HashMap<Address, GattCacheFile>,
    unbonded_caches: DuplicateCache<Address, GattCacheFile>,
}

impl OwnStore {
    fn new() -> Self {
        Self {
            keys: HashMap::new(),
            cccds: HashMap::new(),
            bonded_caches: HashMap::new(),
            unbonded_caches: DuplicateCache::new(config::UNBONDED_GATT_CACHE_CAP),
        }
    }
}

fn hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn unhex<const N: usize>(s: &str) -> Option<[u8; N]> {
    if s.len() != N * 2 {
        return None;
    }
    let mut out = [0u8; N];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

fn addr_dirname(addr: Address) -> String {
    let b = addr.to_bytes();
    format!(
        "{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}",
        b[0], b[1], b[2], b[3], b[4], b[5], b[6]
    )
}

fn addr_from_dirname(name: &str) -> Option<Address> {
    Address::parse(&name.replace('-', ":")).ok()
}

/// Build an [`Address`] from its kind and `AA:BB:CC:DD:EE:FF` text form.
pub fn construct_address(kind: AddrKind, addr: &str) -> Result<Address, Error> {
    let full = format!("{:02X}:{}", kind.into_inner(), addr);
    Address::parse(&full)
}

/// Persistent storage rooted at a directory, shared by the GATT server
/// and clients of one stack instance.
///
/// Construct one and pass it down; state is cached in memory per own
/// address and lazily loaded from disk on first access.
pub struct Store {
    root: PathBuf,
    state: Mutex<HashMap<Address, OwnStore>>,
}

impl Store {
    /// Open a store rooted at `root`. The directory is created on first
    /// write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(HashMap::new()),
        }
    }

    fn own_dir(&self, own: Address) -> PathBuf {
        self.root.join(addr_dirname(own))
    }

    fn bond_dir(&self, own: Address, peer: Address) -> PathBuf {
        self.own_dir(own).join("bonds").join(addr_dirname(peer))
    }

    fn unbonded_dir(&self, own: Address, peer: Address) -> PathBuf {
        self.own_dir(own).join("unbonded").join(addr_dirname(peer))
    }

    fn with_own<R>(&self, own: Address, f: impl FnOnce(&mut OwnStore) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        if !state.contains_key(&own) {
            let mut store = OwnStore::new();
            self.load(own, &mut store);
            state.insert(own, store);
        }
        f(state.get_mut(&own).unwrap())
    }

    fn load(&self, own: Address, store: &mut OwnStore) {
        let bonds = self.own_dir(own).join("bonds");
        if let Ok(entries) = std::fs::read_dir(&bonds) {
            for entry in entries.flatten() {
                let Some(peer) = entry.file_name().to_str().and_then(addr_from_dirname) else {
                    continue;
                };
                let dir = entry.path();
                if let Some(keys) = read_keys_file(&dir.join("keys.json")) {
                    store.keys.insert(peer, prepare_keys(keys));
                }
                if let Some(cache) = read_json::<GattCacheFile>(&dir.join("gatt_client_cache.json")) {
                    store.bonded_caches.insert(peer, cache);
                }
                if let Ok(cccds) = std::fs::read_dir(dir.join("gatt_server_cccds")) {
                    for cccd in cccds.flatten() {
                        let name = cccd.file_name();
                        let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                            continue;
                        };
                        let Ok(handle) = u16::from_str_radix(stem, 16) else {
                            continue;
                        };
                        if let Some(value) = read_json::<u8>(&cccd.path()) {
                            if value <= 3 {
                                store.cccds.insert((peer, handle), value);
                            }
                        }
                    }
                }
            }
        }

        let unbonded = self.own_dir(own).join("unbonded");
        let mut caches: Vec<(Address, GattCacheFile)> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&unbonded) {
            for entry in entries.flatten() {
                let Some(peer) = entry.file_name().to_str().and_then(addr_from_dirname) else {
                    continue;
                };
                if let Some(cache) = read_json::<GattCacheFile>(&entry.path().join("gatt_client_cache.json")) {
                    caches.push((peer, cache));
                }
            }
        }
        // Oldest first, so FIFO eviction hits the oldest entry.
        caches.sort_by_key(|(_, c)| c.timestamp);
        for (peer, cache) in caches {
            store.unbonded_caches.add(peer, cache);
        }
    }

    /// Store the pairing result for a peer, replacing any previous keys.
    pub fn store_keys(&self, own: Address, peer: Address, keys: Keys) {
        let file = KeysFile {
            mitm: keys.mitm,
            sc: keys.sc,
            irk: keys.irk.map(|k| hex(&k)),
            local_ltk: keys.local_ltk.map(ltk_to_file),
            peer_ltk: keys.peer_ltk.map(ltk_to_file),
        };
        let dir = self.bond_dir(own, peer);
        write_json(&dir.join("keys.json"), &file);
        self.with_own(own, |store| {
            store.keys.insert(peer, prepare_keys(keys));
        });
    }

    /// The stored keys for a peer, if any.
    pub fn get_keys(&self, own: Address, peer: Address) -> Option<Keys> {
        self.with_own(own, |store| store.keys.get(&peer).map(|k| k.keys.clone()))
    }

    /// Resolve a resolvable random address against the stored IRKs.
    ///
    /// Runs the AH function (AES-128 of the zero-padded prand under each
    /// IRK) and compares the 24-bit hash in constant time. Returns the
    /// peer's identity address on a match.
    pub fn resolve_address(&self, own: Address, random: Address) -> Option<Address> {
        if !random.is_resolvable_random() {
            return None;
        }
        let bytes = random.to_bytes();
        let prand = &bytes[1..4];
        let hash = &bytes[4..7];

        self.with_own(own, |store| {
            for (peer, stored) in store.keys.iter() {
                let Some(cipher) = &stored.cipher else {
                    continue;
                };
                let mut block = [0u8; 16];
                block[13..16].copy_from_slice(prand);
                let mut block = GenericArray::from(block);
                cipher.encrypt_block(&mut block);
                let mut diff = 0u8;
                for (a, b) in block[13..16].iter().zip(hash) {
                    diff |= a ^ b;
                }
                if diff == 0 {
                    return Some(*peer);
                }
            }
            None
        })
    }

    /// Store a CCCD value for a bonded peer. Values are in 0..=3; the
    /// file is only touched when the value changed.
    pub fn store_cccd(&self, own: Address, peer: Address, handle: u16, value: u8) {
        if value > 3 {
            return;
        }
        let changed = self.with_own(own, |store| store.cccds.insert((peer, handle), value) != Some(value));
        if changed {
            let path = self
                .bond_dir(own, peer)
                .join("gatt_server_cccds")
                .join(format!("{handle:04X}.json"));
            write_json(&path, &value);
        }
    }

    /// The stored CCCD value for a bonded peer.
    pub fn get_cccd(&self, own: Address, peer: Address, handle: u16) -> Option<u8> {
        self.with_own(own, |store| store.cccds.get(&(peer, handle)).copied())
    }

    /// Store a GATT client cache. Unbonded peers go through a bounded
    /// FIFO whose eviction also removes the file.
    pub fn store_gatt_cache(&self, own: Address, peer: Address, bonded: bool, cache: GattCacheFile) {
        if bonded {
            write_json(&self.bond_dir(own, peer).join("gatt_client_cache.json"), &cache);
            self.with_own(own, |store| {
                store.bonded_caches.insert(peer, cache);
            });
        } else {
            write_json(&self.unbonded_dir(own, peer).join("gatt_client_cache.json"), &cache);
            let evicted = self.with_own(own, |store| store.unbonded_caches.add(peer, cache).1);
            if let Some((evicted_peer, _)) = evicted {
                let dir = self.unbonded_dir(own, evicted_peer);
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    debug!("[store] could not remove evicted cache: {:?}", e);
                }
            }
        }
    }

    /// The stored GATT client cache for a peer.
    pub fn get_gatt_cache(&self, own: Address, peer: Address, bonded: bool) -> Option<GattCacheFile> {
        self.with_own(own, |store| {
            if bonded {
                store.bonded_caches.get(&peer).cloned()
            } else {
                store.unbonded_caches.get(&peer).cloned()
            }
        })
    }

    /// Forget a bond: keys, CCCDs and caches, in memory and on disk.
    pub fn remove_bond(&self, own: Address, peer: Address) {
        self.with_own(own, |store| {
            store.keys.remove(&peer);
            store.bonded_caches.remove(&peer);
            store.cccds.retain(|(p, _), _| *p != peer);
        });
        let dir = self.bond_dir(own, peer);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!("[store] could not remove bond directory: {:?}", e);
            }
        }
    }
}

fn prepare_keys(keys: Keys) -> StoredKeys {
    let cipher = keys.irk.map(|irk| {
        let mut key = irk;
        key.reverse();
        Aes128::new(&GenericArray::from(key))
    });
    StoredKeys { keys, cipher }
}

fn ltk_to_file(ltk: Ltk) -> LtkFile {
    LtkFile {
        rand: hex(&ltk.rand.to_le_bytes()),
        ediv: ltk.ediv,
        ltk: hex(&ltk.ltk),
    }
}

fn ltk_from_file(file: &LtkFile) -> Option<Ltk> {
    Some(Ltk {
        rand: u64::from_le_bytes(unhex::<8>(&file.rand)?),
        ediv: file.ediv,
        ltk: unhex::<16>(&file.ltk)?,
    })
}

fn read_keys_file(path: &Path) -> Option<Keys> {
    let file: KeysFile = read_json(path)?;
    Some(Keys {
        mitm: file.mitm,
        sc: file.sc,
        irk: file.irk.as_deref().and_then(unhex::<16>),
        local_ltk: file.local_ltk.as_ref().and_then(ltk_from_file),
        peer_ltk: file.peer_ltk.as_ref().and_then(ltk_from_file),
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let data = std::fs::read(path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(value) => Some(value),
        Err(e) => {
            // Corrupt files are treated as absent.
            debug!("[store] ignoring unreadable {:?}: {:?}", path, e);
            None
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) {
    let Some(parent) = path.parent() else {
        return;
    };
    if let Err(e) = std::fs::create_dir_all(parent) {
        warn!("[store] could not create {:?}: {:?}", parent, e);
        return;
    }
    match serde_json::to_vec(value) {
        Ok(data) => {
            if let Err(e) = std::fs::write(path, data) {
                warn!("[store] could not write {:?}: {:?}", path, e);
            }
        }
        Err(e) => warn!("[store] could not serialize {:?}: {:?}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "bluehost-store-{}-{}-{tag}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn own() -> Address {
        Address::parse("00:11:22:33:44:55:66").unwrap()
    }

    fn peer() -> Address {
        Address::parse("00:AA:BB:CC:DD:EE:FF").unwrap()
    }

    fn keys_with_irk(irk: [u8; 16]) -> Keys {
        Keys {
            mitm: true,
            sc: false,
            irk: Some(irk),
            local_ltk: Some(Ltk {
                rand: 0x0123456789ABCDEF,
                ediv: 0x1234,
                ltk: [0x42; 16],
            }),
            peer_ltk: None,
        }
    }

    #[test]
    fn keys_round_trip_through_disk() {
        let root = tmp_root("keys");
        let keys = keys_with_irk([7; 16]);
        {
            let store = Store::new(&root);
            store.store_keys(own(), peer(), keys.clone());
        }
        // A fresh instance must load from disk.
        let store = Store::new(&root);
        assert_eq!(store.get_keys(own(), peer()), Some(keys));
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn remove_bond_deletes_directory_and_memory() {
        let root = tmp_root("removebond");
        let store = Store::new(&root);
        store.store_keys(own(), peer(), keys_with_irk([1; 16]));
        store.store_cccd(own(), peer(), 0x0102, 1);
        let dir = store.bond_dir(own(), peer());
        assert!(dir.exists());
        store.remove_bond(own(), peer());
        assert!(store.get_keys(own(), peer()).is_none());
        assert!(!dir.exists());
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn cccd_round_trip_and_domain() {
        let root = tmp_root("cccd");
        {
            let store = Store::new(&root);
            store.store_keys(own(), peer(), keys_with_irk([1; 16]));
            for value in 0..=3 {
                store.store_cccd(own(), peer(), 0x0102, value);
                assert_eq!(store.get_cccd(own(), peer(), 0x0102), Some(value));
            }
            store.store_cccd(own(), peer(), 0x0104, 2);
            // Out of domain: ignored.
            store.store_cccd(own(), peer(), 0x0106, 9);
        }
        let store = Store::new(&root);
        assert_eq!(store.get_cccd(own(), peer(), 0x0102), Some(3));
        assert_eq!(store.get_cccd(own(), peer(), 0x0104), Some(2));
        assert_eq!(store.get_cccd(own(), peer(), 0x0106), None);
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn resolve_address_matches_ah_hash() {
        let root = tmp_root("resolve");
        let store = Store::new(&root);
        let irk: [u8; 16] = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10,
        ];
        store.store_keys(own(), peer(), keys_with_irk(irk));

        // Compute the expected hash for prand 42:1F:9A the same way the
        // resolver does, then check both the match and an off-by-one.
        let mut key = irk;
        key.reverse();
        let cipher = Aes128::new(&GenericArray::from(key));
        let mut block = [0u8; 16];
        block[13..16].copy_from_slice(&[0x42, 0x1F, 0x9A]);
        let mut block = GenericArray::from(block);
        cipher.encrypt_block(&mut block);

        let random = Address::parse(&format!(
            "01:42:1F:9A:{:02X}:{:02X}:{:02X}",
            block[13], block[14], block[15]
        ))
        .unwrap();
        assert_eq!(store.resolve_address(own(), random), Some(peer()));

        let miss = Address::parse(&format!(
            "01:42:1F:9A:{:02X}:{:02X}:{:02X}",
            block[13], block[14], block[15] ^ 1
        ))
        .unwrap();
        assert_eq!(store.resolve_address(own(), miss), None);

        // Non-resolvable addresses never match.
        let static_random = Address::parse("01:C2:1F:9A:00:00:00").unwrap();
        assert_eq!(store.resolve_address(own(), static_random), None);
        std::fs::remove_dir_all(root).unwrap();
    }

    fn cache(ts: u64) -> GattCacheFile {
        GattCacheFile {
            has_all_primary_services: false,
            all_primary_services: vec![CachedRange {
                start: 1,
                end: 7,
                service: None,
            }],
            secondary_services: Vec::new(),
            primary_services_by_uuid: HashMap::new(),
            timestamp: ts,
        }
    }

    #[test]
    fn unbonded_caches_evict_oldest_and_delete_files() {
        let root = tmp_root("unbonded");
        let store = Store::new(&root);
        let mut peers = Vec::new();
        for i in 0..=config::UNBONDED_GATT_CACHE_CAP {
            let peer = Address::parse(&format!("00:AA:BB:CC:DD:EE:{:02X}", i)).unwrap();
            peers.push(peer);
            store.store_gatt_cache(own(), peer, false, cache(i as u64));
        }
        // The first peer got evicted, file and all.
        assert!(store.get_gatt_cache(own(), peers[0], false).is_none());
        assert!(!store.unbonded_dir(own(), peers[0]).exists());
        assert!(store.get_gatt_cache(own(), peers[1], false).is_some());
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn unbonded_caches_reload_in_timestamp_order() {
        let root = tmp_root("reload");
        {
            let store = Store::new(&root);
            store.store_gatt_cache(own(), peer(), false, cache(100));
            let newer = Address::parse("00:AA:BB:CC:DD:EE:01").unwrap();
            store.store_gatt_cache(own(), newer, false, cache(200));
        }
        let store = Store::new(&root);
        // Filling to capacity evicts the older timestamp first.
        for i in 0..config::UNBONDED_GATT_CACHE_CAP - 1 {
            let p = Address::parse(&format!("00:11:22:33:44:55:{:02X}", i)).unwrap();
            store.store_gatt_cache(own(), p, false, cache(300 + i as u64));
        }
        assert!(store.get_gatt_cache(own(), peer(), false).is_none());
        std::fs::remove_dir_all(root).unwrap();
    }
}
