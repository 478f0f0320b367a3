//! Interest channel bitsets
//!
//! A connection is interested in an entity through zero or more channels.
//! The union of channels is the entity's interest policy mask for that
//! connection; an empty mask means "not tracked".

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterestPolicies(u32);

impl InterestPolicies {
    pub const NONE: Self = Self(0);
    /// Entity is spatially close to the player
    pub const PROXIMITY: Self = Self(1 << 0);
    /// Entity belongs to a party member
    pub const PARTY: Self = Self(1 << 1);
    /// Player owns the entity
    pub const OWNER: Self = Self(1 << 2);
    /// Entity is part of an open trade
    pub const TRADER: Self = Self(1 << 3);
    /// Entity stays tracked once discovered (map markers)
    pub const DISCOVERY: Self = Self(1 << 4);
    /// Data only meaningful to the owning client
    pub const CLIENT_ONLY: Self = Self(1 << 5);
    /// Client simulates the entity on its own; tracked until destroyed
    pub const CLIENT_INDEPENDENT: Self = Self(1 << 6);
    /// Archive default policy: everything
    pub const ALL_CHANNELS: Self = Self(u32::MAX);
    /// Channels shown on the map
    pub const MAP_CHANNELS: Self = Self(Self::PARTY.0 | Self::DISCOVERY.0);

    const NAMES: [(Self, &'static str); 7] = [
        (Self::PROXIMITY, "Proximity"),
        (Self::PARTY, "Party"),
        (Self::OWNER, "Owner"),
        (Self::TRADER, "Trader"),
        (Self::DISCOVERY, "Discovery"),
        (Self::CLIENT_ONLY, "ClientOnly"),
        (Self::CLIENT_INDEPENDENT, "ClientIndependent"),
    ];

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every channel of `other` is set
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when any channel of `other` is set
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Channels in `self` that are not in `other`
    #[inline]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for InterestPolicies {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for InterestPolicies {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for InterestPolicies {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for InterestPolicies {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for InterestPolicies {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for InterestPolicies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("None");
        }
        if *self == Self::ALL_CHANNELS {
            return f.write_str("AllChannels");
        }
        let mut first = true;
        let mut known = Self::NONE;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
                known |= flag;
            }
        }
        let unknown = self.difference(known);
        if !unknown.is_empty() {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{:#x}", unknown.0)?;
        }
        Ok(())
    }
}

/// Channels gained and lost between two masks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDelta {
    pub added: InterestPolicies,
    pub removed: InterestPolicies,
}

impl PolicyDelta {
    pub fn between(previous: InterestPolicies, current: InterestPolicies) -> Self {
        Self {
            added: current.difference(previous),
            removed: previous.difference(current),
        }
    }

    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_values() {
        assert_eq!(InterestPolicies::PROXIMITY.bits(), 1);
        assert_eq!(InterestPolicies::OWNER.bits(), 4);
        assert_eq!(InterestPolicies::CLIENT_INDEPENDENT.bits(), 64);
        assert_eq!(
            InterestPolicies::MAP_CHANNELS,
            InterestPolicies::PARTY | InterestPolicies::DISCOVERY
        );
    }

    #[test]
    fn test_contains_and_intersects() {
        let mask = InterestPolicies::PROXIMITY | InterestPolicies::OWNER;
        assert!(mask.contains(InterestPolicies::OWNER));
        assert!(!mask.contains(InterestPolicies::OWNER | InterestPolicies::PARTY));
        assert!(mask.intersects(InterestPolicies::OWNER | InterestPolicies::PARTY));
        assert!(!mask.intersects(InterestPolicies::DISCOVERY));
        assert!(InterestPolicies::NONE.is_empty());
    }

    #[test]
    fn test_insert_remove() {
        let mut mask = InterestPolicies::NONE;
        mask.insert(InterestPolicies::DISCOVERY);
        mask.insert(InterestPolicies::PROXIMITY);
        mask.remove(InterestPolicies::PROXIMITY);
        assert_eq!(mask, InterestPolicies::DISCOVERY);
    }

    #[test]
    fn test_delta() {
        let old = InterestPolicies::OWNER | InterestPolicies::DISCOVERY;
        let new = InterestPolicies::OWNER | InterestPolicies::PROXIMITY;
        let delta = PolicyDelta::between(old, new);
        assert_eq!(delta.added, InterestPolicies::PROXIMITY);
        assert_eq!(delta.removed, InterestPolicies::DISCOVERY);
        assert!(!delta.is_unchanged());
        assert!(PolicyDelta::between(new, new).is_unchanged());
    }

    #[test]
    fn test_debug_format() {
        let mask = InterestPolicies::PROXIMITY | InterestPolicies::OWNER;
        assert_eq!(format!("{:?}", mask), "Proximity|Owner");
        assert_eq!(format!("{:?}", InterestPolicies::NONE), "None");
        assert_eq!(format!("{:?}", InterestPolicies::ALL_CHANNELS), "AllChannels");
        assert_eq!(format!("{:?}", InterestPolicies::from_bits(1 << 9)), "0x200");
    }
}
