//! Splitting of transfer and erase requests into protocol sized units.

use core::convert::TryFrom;
use core::ops::Range;
use std::num::ParseIntError;

use crate::error::{PlanError, Precondition, RangeError};
use crate::protocol::MAX_CHUNK;

/// Flash write and erase addresses must be word aligned
pub const ALIGNMENT: u32 = 4;

pub fn check_aligned(address: u32) -> Result<(), Precondition> {
    if address % ALIGNMENT != 0 {
        return Err(Precondition::Misaligned(address));
    }
    Ok(())
}

/// Ensure `address..address+length` stays within the 32-bit address space
pub fn check_range(address: u32, length: usize) -> Result<(), Precondition> {
    if address as u64 + length as u64 > 1 << 32 {
        return Err(Precondition::Overflow { address, length });
    }
    Ok(())
}

/// Length of a transfer as an erase length, rejecting lengths that do not fit 32 bits
pub fn erase_length(address: u32, length: usize) -> Result<u32, Precondition> {
    u32::try_from(length).map_err(|_| Precondition::Overflow { address, length })
}

/// Parse a decimal or `0x` prefixed hexadecimal value, as used in memory maps
pub fn parse_u32(s: &str) -> Result<u32, ParseIntError> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Single sub-range of a transfer
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Chunk {
    /// Offset from the start of the transfer
    pub offset: usize,
    pub address: u32,
    pub size: usize,
}

/// Ascending, contiguous chunks covering a transfer
#[derive(Clone, Debug, PartialEq, Default)]
pub struct TransferPlan {
    chunks: Vec<Chunk>,
}

impl TransferPlan {
    /// Greedily split `length` bytes from `address` into chunks of at most `max_chunk`
    pub fn new(address: u32, length: usize, max_chunk: usize) -> Result<Self, Precondition> {
        if max_chunk == 0 || max_chunk > MAX_CHUNK {
            return Err(Precondition::ChunkSize);
        }
        check_range(address, length)?;

        let mut chunks = Vec::with_capacity((length + max_chunk - 1) / max_chunk);
        let mut offset = 0;

        while offset < length {
            let size = usize::min(length - offset, max_chunk);
            chunks.push(Chunk {
                offset,
                address: address + offset as u32,
                size,
            });
            offset += size;
        }

        Ok(Self { chunks })
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Chunk> {
        self.chunks.iter()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total number of bytes covered
    pub fn total(&self) -> usize {
        self.chunks.iter().map(|c| c.size).sum()
    }
}

impl<'a> IntoIterator for &'a TransferPlan {
    type Item = &'a Chunk;
    type IntoIter = core::slice::Iter<'a, Chunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.iter()
    }
}

/// Erase unit of a flash memory map
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MemorySector {
    pub address: u32,
    pub size: u32,
}

impl MemorySector {
    pub fn new(address: u32, size: u32) -> Self {
        Self { address, size }
    }

    /// Build a sector from textual memory map fields
    pub fn parse(address: &str, size: &str) -> Result<Self, ParseIntError> {
        Ok(Self::new(parse_u32(address)?, parse_u32(size)?))
    }

    /// Exclusive end address
    pub fn end(&self) -> u64 {
        self.address as u64 + self.size as u64
    }

    fn intersects(&self, start: u64, end: u64) -> bool {
        (self.address as u64) < end && start < self.end()
    }
}

/// Flash to be erased for a request
#[derive(Clone, Debug, PartialEq)]
pub enum EraseSelection {
    /// Erase the whole flash array, used when no memory map is available
    Mass,
    /// Contiguous run of sector indices into the memory map
    Sectors(Range<usize>),
}

impl EraseSelection {
    /// Number of erase units, a mass erase counts as one
    pub fn units(&self) -> usize {
        match self {
            EraseSelection::Mass => 1,
            EraseSelection::Sectors(s) => s.len(),
        }
    }
}

/// Sectors must be non-empty, ascending and non-overlapping
pub fn check_map(sectors: &[MemorySector]) -> Result<(), Precondition> {
    for (i, s) in sectors.iter().enumerate() {
        if s.size == 0 || (i > 0 && (s.address as u64) < sectors[i - 1].end()) {
            return Err(Precondition::InvalidMap(i));
        }
    }
    Ok(())
}

/// Start address and length spanning a whole memory map
pub fn map_extent(sectors: &[MemorySector]) -> Result<(u32, usize), Precondition> {
    check_map(sectors)?;

    match (sectors.first(), sectors.last()) {
        (Some(first), Some(last)) => Ok((first.address, (last.end() - first.address as u64) as usize)),
        _ => Err(Precondition::ZeroLength),
    }
}

/// Select the sectors to erase so that `address..address+length` is fully
/// erased, rounding outwards to whole sectors.
///
/// Without a memory map the whole flash is erased.
pub fn plan_erase(
    address: u32,
    length: u32,
    sectors: Option<&[MemorySector]>,
) -> Result<EraseSelection, PlanError> {
    let sectors = match sectors {
        Some(s) => s,
        None => return Ok(EraseSelection::Mass),
    };

    if length == 0 {
        return Err(Precondition::ZeroLength.into());
    }

    check_map(sectors)?;

    let start = address as u64;
    let end = start + length as u64;
    let out_of_map = RangeError::OutOfMap { address, length };

    let (first, last) = match (sectors.first(), sectors.last()) {
        (Some(f), Some(l)) => (f, l),
        _ => return Err(out_of_map.into()),
    };
    if start < first.address as u64 || end > last.end() {
        return Err(out_of_map.into());
    }

    let gap = |at: u64| -> PlanError {
        RangeError::Gap {
            address,
            length,
            at,
        }
        .into()
    };

    let lo = sectors.iter().position(|s| s.intersects(start, end));
    let hi = sectors.iter().rposition(|s| s.intersects(start, end));
    let (lo, hi) = match (lo, hi) {
        (Some(lo), Some(hi)) => (lo, hi),
        _ => return Err(gap(start)),
    };

    if start < sectors[lo].address as u64 {
        return Err(gap(start));
    }
    for pair in sectors[lo..=hi].windows(2) {
        if pair[0].end() != pair[1].address as u64 {
            return Err(gap(pair[0].end()));
        }
    }
    if end > sectors[hi].end() {
        return Err(gap(sectors[hi].end()));
    }

    Ok(EraseSelection::Sectors(lo..hi + 1))
}
