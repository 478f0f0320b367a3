//! Low resolution minimap reveal state
//!
//! Each connection keeps a coarse bitmap over the region bounds. Texels
//! under the visible volume get revealed as the player moves; the bitmap
//! is sent with every environment update.

use bitvec::prelude::*;

use crate::game::constants::minimap::{MAX_TEXELS_PER_AXIS, TEXEL_SIZE};
use crate::net::archive::{ArchiveError, ArchiveReader, ArchiveWriter};
use crate::net::policy::InterestPolicies;
use crate::util::aabb2::Aabb2;

#[derive(Debug, Clone, PartialEq)]
pub struct LowResMap {
    reveal_all: bool,
    width: usize,
    height: usize,
    revealed: BitVec<u8, Lsb0>,
    bounds: Aabb2,
}

impl LowResMap {
    /// Empty map covering `bounds`
    pub fn new(bounds: Aabb2, reveal_all: bool) -> Self {
        let width = texels_for(bounds.width());
        let height = texels_for(bounds.height());
        Self {
            reveal_all,
            width,
            height,
            revealed: bitvec![u8, Lsb0; 0; width * height],
            bounds,
        }
    }

    pub fn is_reveal_all(&self) -> bool {
        self.reveal_all
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Reveal every texel touched by `volume`. Returns true if anything new
    /// was revealed.
    pub fn reveal(&mut self, volume: &Aabb2) -> bool {
        if self.reveal_all || self.revealed.is_empty() || !self.bounds.intersects(volume) {
            return false;
        }
        let (min_x, max_x) = texel_span(volume.min.x, volume.max.x, self.bounds.min.x, self.width);
        let (min_y, max_y) = texel_span(volume.min.y, volume.max.y, self.bounds.min.y, self.height);
        let mut changed = false;
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                let index = y * self.width + x;
                if !self.revealed[index] {
                    self.revealed.set(index, true);
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn is_revealed(&self, x: usize, y: usize) -> bool {
        if self.reveal_all {
            return true;
        }
        x < self.width && y < self.height && self.revealed[y * self.width + x]
    }

    pub fn revealed_count(&self) -> usize {
        if self.reveal_all {
            self.width * self.height
        } else {
            self.revealed.count_ones()
        }
    }

    /// Minimap archive: reveal-all flag, then the packed bitmap when needed
    pub fn to_archive(&self) -> Vec<u8> {
        let mut writer = ArchiveWriter::with_capacity(InterestPolicies::ALL_CHANNELS, 16 + self.revealed.len() / 8);
        writer.write_bool(self.reveal_all);
        if !self.reveal_all {
            writer.write_u32(self.width as u32);
            writer.write_u32(self.height as u32);
            writer.write_bytes(self.revealed.as_raw_slice());
        }
        writer.into_bytes()
    }

    /// Decode a minimap archive (client side / tooling)
    pub fn from_archive(data: &[u8]) -> Result<Self, ArchiveError> {
        let mut reader = ArchiveReader::new(data)?;
        let reveal_all = reader.read_bool()?;
        if reveal_all {
            reader.finish()?;
            return Ok(Self {
                reveal_all,
                width: 0,
                height: 0,
                revealed: BitVec::new(),
                bounds: Aabb2::ZERO,
            });
        }
        let width = reader.read_u32()? as usize;
        let height = reader.read_u32()? as usize;
        let raw = reader.read_bytes()?;
        reader.finish()?;

        let mut revealed = BitVec::<u8, Lsb0>::from_slice(raw);
        if revealed.len() < width * height {
            return Err(ArchiveError::InvalidValue {
                field: "minimap bitmap length",
                value: revealed.len() as u64,
            });
        }
        revealed.truncate(width * height);
        Ok(Self {
            reveal_all,
            width,
            height,
            revealed,
            bounds: Aabb2::ZERO,
        })
    }
}

fn texel_span(min: f32, max: f32, origin: f32, count: usize) -> (usize, usize) {
    let last = count.saturating_sub(1) as f32;
    let lo = ((min - origin) / TEXEL_SIZE).floor().clamp(0.0, last) as usize;
    let hi = ((max - origin) / TEXEL_SIZE).floor().clamp(0.0, last) as usize;
    (lo, hi)
}

fn texels_for(extent: f32) -> usize {
    ((extent / TEXEL_SIZE).ceil().max(1.0) as usize).min(MAX_TEXELS_PER_AXIS)
}
