//! Device numbers (`dev_t`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// A device's major/minor number pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Devnum {
    major: u32,
    minor: u32,
}

impl Devnum {
    /// Build a device number from its components.
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn major(&self) -> u32 {
        self.major
    }

    #[allow(missing_docs)]
    #[must_use]
    pub const fn minor(&self) -> u32 {
        self.minor
    }

    /// Decode a Linux `dev_t` (glibc encoding).
    #[must_use]
    pub const fn from_raw(dev: u64) -> Self {
        let major = ((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0x0000_0fff);
        let minor = ((dev >> 12) & 0xffff_ff00) | (dev & 0x0000_00ff);
        Self {
            major: major as u32,
            minor: minor as u32,
        }
    }

    /// Encode as a Linux `dev_t`.
    #[must_use]
    pub const fn to_raw(&self) -> u64 {
        let major = self.major as u64;
        let minor = self.minor as u64;
        ((major & 0xffff_f000) << 32)
            | ((major & 0x0000_0fff) << 8)
            | ((minor & 0xffff_ff00) << 12)
            | (minor & 0x0000_00ff)
    }

    /// Parse the `MAJOR:MINOR` form used by sysfs `dev` files.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (major, minor) = s.trim().split_once(':')?;
        Some(Self::new(major.parse().ok()?, minor.parse().ok()?))
    }
}

impl fmt::Display for Devnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn major_minor() {
        let d = Devnum::new(1, 8);
        assert_eq!(d.major(), 1);
        assert_eq!(d.minor(), 8);
    }

    #[test]
    fn raw_encoding_matches_libc() {
        let d = Devnum::new(259, 70_000);
        assert_eq!(d.to_raw(), libc::makedev(259, 70_000) as u64);
        assert_eq!(Devnum::from_raw(d.to_raw()), d);
    }

    #[test]
    fn parse_sysfs_dev() {
        assert_eq!(Devnum::parse("8:16\n"), Some(Devnum::new(8, 16)));
        assert_eq!(Devnum::parse("8"), None);
        assert_eq!(Devnum::parse("a:b"), None);
    }
}
