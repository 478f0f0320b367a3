//! Replication archive encoding
//!
//! Archives are byte streams of protobuf-style varints:
//! - Header: replication policy (varint)
//! - Unsigned integers: LEB128 varints
//! - Signed integers: zigzag, then varint
//! - Fixed-point floats: `zigzag32((value * 2^precision) as i32)`
//! - Lists: element count (varint u64) followed by the elements
//!
//! The writer never fails. Readers return `ArchiveError` on truncated or
//! malformed input.

use crate::game::constants::archive::MAX_VARINT_BYTES;
use crate::net::policy::InterestPolicies;
use crate::util::vector::{Orientation, Vector3};

/// Errors that can occur while reading an archive
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArchiveError {
    #[error("Unexpected end of archive at byte {0}")]
    UnexpectedEof(usize),
    #[error("Varint too long at byte {0}")]
    VarintOverflow(usize),
    #[error("Value {value} at byte {position} does not fit in {target}")]
    OutOfRange {
        value: u64,
        position: usize,
        target: &'static str,
    },
    #[error("{0} trailing bytes after archive body")]
    TrailingBytes(usize),
    #[error("Invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: u64 },
}

// ============================================================================
// Primitive codecs
// ============================================================================

#[inline]
pub fn zigzag_encode32(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

#[inline]
pub fn zigzag_decode32(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

#[inline]
pub fn zigzag_encode64(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub fn zigzag_decode64(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[inline]
fn fixed_scale(precision: i32) -> f32 {
    if precision <= 0 {
        1.0
    } else {
        (1u32 << precision) as f32
    }
}

/// Float to zigzagged fixed-point
#[inline]
pub fn float_to_fixed(value: f32, precision: i32) -> u32 {
    zigzag_encode32((value * fixed_scale(precision)) as i32)
}

/// Zigzagged fixed-point to float
#[inline]
pub fn fixed_to_float(value: u32, precision: i32) -> f32 {
    zigzag_decode32(value) as f32 / fixed_scale(precision)
}

// ============================================================================
// Writer
// ============================================================================

/// Archive builder
///
/// Every archive starts with its replication policy so the reader knows
/// which channels the payload was filtered for.
#[derive(Debug)]
pub struct ArchiveWriter {
    buffer: Vec<u8>,
    replication_policy: InterestPolicies,
}

impl ArchiveWriter {
    pub fn new(replication_policy: InterestPolicies) -> Self {
        Self::with_capacity(replication_policy, 64)
    }

    pub fn with_capacity(replication_policy: InterestPolicies, capacity: usize) -> Self {
        let mut writer = Self {
            buffer: Vec::with_capacity(capacity),
            replication_policy,
        };
        writer.write_u32(replication_policy.bits());
        writer
    }

    pub fn replication_policy(&self) -> InterestPolicies {
        self.replication_policy
    }

    /// Write a raw LEB128 varint
    pub fn write_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buffer.push((value as u8 & 0x7F) | 0x80);
            value >>= 7;
        }
        self.buffer.push(value as u8);
    }

    #[inline]
    pub fn write_u64(&mut self, value: u64) {
        self.write_varint(value);
    }

    #[inline]
    pub fn write_u32(&mut self, value: u32) {
        self.write_varint(value as u64);
    }

    #[inline]
    pub fn write_i32(&mut self, value: i32) {
        self.write_u32(zigzag_encode32(value));
    }

    #[inline]
    pub fn write_i64(&mut self, value: i64) {
        self.write_varint(zigzag_encode64(value));
    }

    #[inline]
    pub fn write_bool(&mut self, value: bool) {
        self.write_varint(value as u64);
    }

    /// Raw float bits as a varint
    #[inline]
    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    #[inline]
    pub fn write_float_fixed(&mut self, value: f32, precision: i32) {
        self.write_u32(float_to_fixed(value, precision));
    }

    pub fn write_vector_fixed(&mut self, value: Vector3, precision: i32) {
        self.write_float_fixed(value.x, precision);
        self.write_float_fixed(value.y, precision);
        self.write_float_fixed(value.z, precision);
    }

    /// Yaw only, or yaw/pitch/roll
    pub fn write_orientation_fixed(&mut self, value: Orientation, yaw_only: bool, precision: i32) {
        self.write_float_fixed(value.yaw, precision);
        if !yaw_only {
            self.write_float_fixed(value.pitch, precision);
            self.write_float_fixed(value.roll, precision);
        }
    }

    pub fn write_u64_list(&mut self, values: &[u64]) {
        self.write_u64(values.len() as u64);
        for &value in values {
            self.write_u64(value);
        }
    }

    /// Length-prefixed raw bytes
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.write_u64(data.len() as u64);
        self.buffer.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Archive parser
pub struct ArchiveReader<'a> {
    data: &'a [u8],
    position: usize,
    replication_policy: InterestPolicies,
}

impl<'a> ArchiveReader<'a> {
    /// Open an archive and consume its header
    pub fn new(data: &'a [u8]) -> Result<Self, ArchiveError> {
        let mut reader = Self {
            data,
            position: 0,
            replication_policy: InterestPolicies::NONE,
        };
        reader.replication_policy = InterestPolicies::from_bits(reader.read_u32()?);
        Ok(reader)
    }

    pub fn replication_policy(&self) -> InterestPolicies {
        self.replication_policy
    }

    pub fn read_varint(&mut self) -> Result<u64, ArchiveError> {
        let start = self.position;
        let mut result = 0u64;
        for index in 0..MAX_VARINT_BYTES {
            let byte = *self
                .data
                .get(self.position)
                .ok_or(ArchiveError::UnexpectedEof(self.position))?;
            self.position += 1;
            result |= ((byte & 0x7F) as u64) << (7 * index);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(ArchiveError::VarintOverflow(start))
    }

    #[inline]
    pub fn read_u64(&mut self) -> Result<u64, ArchiveError> {
        self.read_varint()
    }

    pub fn read_u32(&mut self) -> Result<u32, ArchiveError> {
        let position = self.position;
        let value = self.read_varint()?;
        u32::try_from(value).map_err(|_| ArchiveError::OutOfRange {
            value,
            position,
            target: "u32",
        })
    }

    pub fn read_i32(&mut self) -> Result<i32, ArchiveError> {
        self.read_u32().map(zigzag_decode32)
    }

    pub fn read_i64(&mut self) -> Result<i64, ArchiveError> {
        self.read_varint().map(zigzag_decode64)
    }

    pub fn read_bool(&mut self) -> Result<bool, ArchiveError> {
        match self.read_varint()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ArchiveError::InvalidValue { field: "bool", value: other }),
        }
    }

    pub fn read_f32(&mut self) -> Result<f32, ArchiveError> {
        self.read_u32().map(f32::from_bits)
    }

    pub fn read_float_fixed(&mut self, precision: i32) -> Result<f32, ArchiveError> {
        self.read_u32().map(|raw| fixed_to_float(raw, precision))
    }

    pub fn read_vector_fixed(&mut self, precision: i32) -> Result<Vector3, ArchiveError> {
        Ok(Vector3::new(
            self.read_float_fixed(precision)?,
            self.read_float_fixed(precision)?,
            self.read_float_fixed(precision)?,
        ))
    }

    pub fn read_orientation_fixed(&mut self, yaw_only: bool, precision: i32) -> Result<Orientation, ArchiveError> {
        let yaw = self.read_float_fixed(precision)?;
        if yaw_only {
            return Ok(Orientation::from_yaw(yaw));
        }
        Ok(Orientation::new(
            yaw,
            self.read_float_fixed(precision)?,
            self.read_float_fixed(precision)?,
        ))
    }

    pub fn read_u64_list(&mut self) -> Result<Vec<u64>, ArchiveError> {
        let count = self.read_count()?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_u64()?);
        }
        Ok(values)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], ArchiveError> {
        let len = self.read_count()?;
        let end = self.position + len;
        if end > self.data.len() {
            return Err(ArchiveError::UnexpectedEof(self.data.len()));
        }
        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    /// Element count, bounded by the bytes left (every element takes at least one)
    pub fn read_count(&mut self) -> Result<usize, ArchiveError> {
        let position = self.position;
        let count = self.read_varint()?;
        if count > self.remaining() as u64 {
            return Err(ArchiveError::OutOfRange {
                value: count,
                position,
                target: "remaining archive",
            });
        }
        Ok(count as usize)
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Fail if anything is left unread
    pub fn finish(&self) -> Result<(), ArchiveError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ArchiveError::TrailingBytes(n)),
        }
    }
}
