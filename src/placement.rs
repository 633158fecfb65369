//! Repository placement: which shard address owns a repository.

use std::collections::HashMap;

use md5::{Digest, Md5};

use crate::error::{Error, Result};
use crate::repo::placement_key;

/// Address list and pinned overrides, as read from configuration.
///
/// Two tables describe the same topology only if their address sequences
/// are equal in order: placement is index based, so a reorder moves
/// repositories just like a resize does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressTable {
    addresses: Vec<String>,
    pinned: HashMap<String, String>,
}

impl AddressTable {
    pub fn new(addresses: Vec<String>, pinned: HashMap<String, String>) -> Self {
        Self { addresses, pinned }
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn pinned(&self) -> &HashMap<String, String> {
        &self.pinned
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// True when both tables list the same addresses in the same order.
    pub fn same_addresses(&self, other: &AddressTable) -> bool {
        self.addresses == other.addresses
    }
}

/// Returns the address that owns `repo`.
///
/// The name is undeleted and normalized first, so a soft-deleted repository
/// stays on the shard it always lived on. Pins win over hashing.
pub fn addr_for_repo(repo: &str, table: &AddressTable) -> Result<String> {
    if table.is_empty() {
        return Err(Error::NoAddresses);
    }
    let key = placement_key(repo);
    if let Some(addr) = table.pinned.get(&key) {
        return Ok(addr.clone());
    }
    addr_for_key(&key, &table.addresses)
        .map(str::to_string)
        .ok_or(Error::NoAddresses)
}

/// Hashes an arbitrary key onto `addrs`: the first eight bytes of the MD5
/// digest, big endian, modulo the address count.
pub fn addr_for_key<'a>(key: &str, addrs: &'a [String]) -> Option<&'a str> {
    if addrs.is_empty() {
        return None;
    }
    let digest = Md5::digest(key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let index = u64::from_be_bytes(head) % addrs.len() as u64;
    addrs.get(index as usize).map(String::as_str)
}
