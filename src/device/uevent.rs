//! Uevent datagram codec.
//!
//! Two framings arrive on a `NETLINK_KOBJECT_UEVENT` socket:
//!
//! - kernel framing: `action@devpath\0KEY=VALUE\0KEY=VALUE\0...`
//! - libudev framing: a 40-byte header starting with `libudev\0`, followed by a
//!   NUL-separated property block. The header carries MurmurHash2 values of the
//!   subsystem and devtype plus a 64-bit tag bloom filter so that receivers can
//!   prune datagrams with a socket filter before they reach user space.
//!
//! Header layout (magic and filter words are big-endian, the rest native):
//!
//! | offset | field                  |
//! |--------|------------------------|
//! | 0      | `libudev\0`            |
//! | 8      | magic `0xfeedcafe`     |
//! | 12     | header size            |
//! | 16     | properties offset      |
//! | 20     | properties length      |
//! | 24     | subsystem hash         |
//! | 28     | devtype hash           |
//! | 32     | tag bloom, high word   |
//! | 36     | tag bloom, low word    |

use std::collections::BTreeMap;

use crate::error::DeviceError;

/// Prefix of libudev-framed datagrams.
pub const LIBUDEV_PREFIX: &[u8; 8] = b"libudev\0";
/// Protocol magic, in host order.
pub const UDEV_MONITOR_MAGIC: u32 = 0xfeed_cafe;
/// Size of the libudev header.
pub const HEADER_SIZE: usize = 40;

pub(crate) const OFFSET_MAGIC: u32 = 8;
pub(crate) const OFFSET_SUBSYSTEM_HASH: u32 = 24;
pub(crate) const OFFSET_DEVTYPE_HASH: u32 = 28;
pub(crate) const OFFSET_TAG_BLOOM_HI: u32 = 32;
pub(crate) const OFFSET_TAG_BLOOM_LO: u32 = 36;

/// Which framing a datagram used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Sent directly by the kernel.
    Kernel,
    /// Re-broadcast by udevd after rule processing.
    Udev,
}

/// A decoded datagram: its framing plus the property block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    pub framing: Framing,
    pub properties: BTreeMap<String, String>,
}

/// Decode one datagram.
///
/// # Errors
///
/// Returns `DeviceError::Malformed` when the framing is inconsistent.
pub fn parse(buf: &[u8]) -> Result<Uevent, DeviceError> {
    if buf.starts_with(LIBUDEV_PREFIX) {
        parse_udev(buf)
    } else {
        parse_kernel(buf)
    }
}

fn parse_udev(buf: &[u8]) -> Result<Uevent, DeviceError> {
    if buf.len() < HEADER_SIZE {
        return Err(malformed(format!("libudev datagram of {} bytes is shorter than its header", buf.len())));
    }

    let magic = read_be(buf, OFFSET_MAGIC as usize);
    if magic != UDEV_MONITOR_MAGIC {
        return Err(malformed(format!("unrecognized magic 0x{magic:08x}")));
    }

    let off = read_ne(buf, 16) as usize;
    let len = read_ne(buf, 20) as usize;
    let end = off
        .checked_add(len)
        .filter(|end| off >= HEADER_SIZE && *end <= buf.len())
        .ok_or_else(|| malformed(format!("property block {off}+{len} exceeds {} bytes", buf.len())))?;

    Ok(Uevent {
        framing: Framing::Udev,
        properties: parse_properties(&buf[off..end]),
    })
}

fn parse_kernel(buf: &[u8]) -> Result<Uevent, DeviceError> {
    let header_end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| malformed("kernel datagram lacks a NUL-terminated header".to_string()))?;

    if !buf[..header_end].contains(&b'@') {
        return Err(malformed("kernel datagram header lacks '@'".to_string()));
    }

    Ok(Uevent {
        framing: Framing::Kernel,
        properties: parse_properties(&buf[header_end + 1..]),
    })
}

fn parse_properties(block: &[u8]) -> BTreeMap<String, String> {
    block
        .split(|b| *b == 0)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let entry = String::from_utf8_lossy(entry);
            let (key, value) = entry.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn malformed(reason: String) -> DeviceError {
    DeviceError::Malformed { reason }
}

fn read_be(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_ne(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// MurmurHash2 with seed 0, as used for the subsystem/devtype header words.
#[must_use]
pub fn string_hash32(s: &str) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let data = s.as_bytes();
    let mut h = data.len() as u32;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() == 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// 64-bit bloom filter bits for one tag.
#[must_use]
pub fn string_bloom64(s: &str) -> u64 {
    let hash = string_hash32(s);
    let mut bits = 0u64;
    bits |= 1 << (hash & 63);
    bits |= 1 << ((hash >> 6) & 63);
    bits |= 1 << ((hash >> 12) & 63);
    bits |= 1 << ((hash >> 18) & 63);
    bits
}

/// Split a udev `TAGS` value (`:a:b:`) into tags.
pub fn split_tags(value: &str) -> impl Iterator<Item = &str> {
    value.split(':').filter(|t| !t.is_empty())
}

/// Builds datagrams in either framing.
///
/// Properties are emitted in insertion order; a later `property` call with the
/// same key replaces the earlier value in place.
#[derive(Debug, Clone, Default)]
pub struct UeventBuilder {
    properties: Vec<(String, String)>,
}

impl UeventBuilder {
    /// Builder with no properties.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a datagram with the three properties every device event carries.
    #[must_use]
    pub fn event(action: &str, devpath: &str, subsystem: &str) -> Self {
        Self::new()
            .property("ACTION", action)
            .property("DEVPATH", devpath)
            .property("SUBSYSTEM", subsystem)
    }

    /// Append `key=value`.
    #[must_use]
    pub fn property(mut self, key: &str, value: &str) -> Self {
        if let Some(slot) = self.properties.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value.to_string();
        } else {
            self.properties.push((key.to_string(), value.to_string()));
        }
        self
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn property_block(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (k, v) in &self.properties {
            out.extend_from_slice(k.as_bytes());
            out.push(b'=');
            out.extend_from_slice(v.as_bytes());
            out.push(0);
        }
        out
    }

    /// Encode with the libudev header, as udevd broadcasts it.
    #[must_use]
    pub fn encode_udev(&self) -> Vec<u8> {
        let block = self.property_block();

        let subsystem_hash = self.get("SUBSYSTEM").map_or(0, string_hash32);
        let devtype_hash = self.get("DEVTYPE").map_or(0, string_hash32);
        let bloom = self
            .get("TAGS")
            .map_or(0, |tags| split_tags(tags).fold(0u64, |acc, t| acc | string_bloom64(t)));

        let mut out = Vec::with_capacity(HEADER_SIZE + block.len());
        out.extend_from_slice(LIBUDEV_PREFIX);
        out.extend_from_slice(&UDEV_MONITOR_MAGIC.to_be_bytes());
        out.extend_from_slice(&(HEADER_SIZE as u32).to_ne_bytes());
        out.extend_from_slice(&(HEADER_SIZE as u32).to_ne_bytes());
        out.extend_from_slice(&(block.len() as u32).to_ne_bytes());
        out.extend_from_slice(&subsystem_hash.to_be_bytes());
        out.extend_from_slice(&devtype_hash.to_be_bytes());
        out.extend_from_slice(&((bloom >> 32) as u32).to_be_bytes());
        out.extend_from_slice(&((bloom & 0xffff_ffff) as u32).to_be_bytes());
        out.extend_from_slice(&block);
        out
    }

    /// Encode in the kernel's `action@devpath` framing.
    #[must_use]
    pub fn encode_kernel(&self) -> Vec<u8> {
        let action = self.get("ACTION").unwrap_or("change");
        let devpath = self.get("DEVPATH").unwrap_or("/");

        let mut out = format!("{action}@{devpath}").into_bytes();
        out.push(0);
        out.extend_from_slice(&self.property_block());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur_known_values() {
        assert_eq!(string_hash32(""), 0);
        // Stable across calls and sensitive to every tail length.
        let hashes: Vec<u32> = ["n", "ne", "net", "netw"].iter().map(|s| string_hash32(s)).collect();
        for (i, a) in hashes.iter().enumerate() {
            for b in &hashes[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(string_hash32("block"), string_hash32("block"));
    }

    #[test]
    fn bloom_sets_at_most_four_bits() {
        let bits = string_bloom64("systemd");
        assert!(bits != 0);
        assert!(bits.count_ones() <= 4);
    }

    #[test]
    fn udev_framing_decodes() {
        let buf = UeventBuilder::event("add", "/devices/virtual/net/lo", "net")
            .property("INTERFACE", "lo")
            .property("SEQNUM", "42")
            .encode_udev();

        assert_eq!(&buf[..8], LIBUDEV_PREFIX);
        let ev = parse(&buf).unwrap();
        assert_eq!(ev.framing, Framing::Udev);
        assert_eq!(ev.properties["ACTION"], "add");
        assert_eq!(ev.properties["INTERFACE"], "lo");
        assert_eq!(ev.properties["SEQNUM"], "42");
    }

    #[test]
    fn udev_header_carries_hashes() {
        let buf = UeventBuilder::event("add", "/devices/x", "block")
            .property("DEVTYPE", "disk")
            .property("TAGS", ":systemd:")
            .encode_udev();

        assert_eq!(read_be(&buf, OFFSET_SUBSYSTEM_HASH as usize), string_hash32("block"));
        assert_eq!(read_be(&buf, OFFSET_DEVTYPE_HASH as usize), string_hash32("disk"));
        let bloom = string_bloom64("systemd");
        assert_eq!(read_be(&buf, OFFSET_TAG_BLOOM_HI as usize), (bloom >> 32) as u32);
        assert_eq!(read_be(&buf, OFFSET_TAG_BLOOM_LO as usize), bloom as u32);
    }

    #[test]
    fn kernel_framing_decodes() {
        let buf = b"remove@/devices/virtual/block/loop0\0ACTION=remove\0DEVPATH=/devices/virtual/block/loop0\0SUBSYSTEM=block\0";
        let ev = parse(buf).unwrap();
        assert_eq!(ev.framing, Framing::Kernel);
        assert_eq!(ev.properties["SUBSYSTEM"], "block");
        assert_eq!(ev.properties.len(), 3);
    }

    #[test]
    fn kernel_framing_requires_header() {
        assert!(matches!(parse(b"no header here"), Err(DeviceError::Malformed { .. })));
        assert!(matches!(parse(b"plain\0A=B\0"), Err(DeviceError::Malformed { .. })));
    }

    #[test]
    fn udev_rejects_bad_magic_and_truncation() {
        let mut buf = UeventBuilder::event("add", "/devices/x", "net").encode_udev();
        let truncated = &buf[..HEADER_SIZE - 1];
        assert!(matches!(parse(truncated), Err(DeviceError::Malformed { .. })));

        buf[8] = 0;
        assert!(matches!(parse(&buf), Err(DeviceError::Malformed { .. })));
    }

    #[test]
    fn udev_rejects_oversized_property_block() {
        let mut buf = UeventBuilder::event("add", "/devices/x", "net").encode_udev();
        buf[20..24].copy_from_slice(&10_000u32.to_ne_bytes());
        assert!(matches!(parse(&buf), Err(DeviceError::Malformed { .. })));
    }

    #[test]
    fn builder_replaces_duplicate_keys() {
        let buf = UeventBuilder::event("add", "/devices/x", "net")
            .property("ACTION", "change")
            .encode_kernel();
        assert!(buf.starts_with(b"change@/devices/x\0"));
        let ev = parse(&buf).unwrap();
        assert_eq!(ev.properties["ACTION"], "change");
    }

    #[test]
    fn entries_without_equals_are_skipped() {
        let ev = parse(b"add@/d\0GARBAGE\0=nokey\0A=1\0").unwrap();
        assert_eq!(ev.properties.len(), 1);
        assert_eq!(ev.properties["A"], "1");
    }
}
