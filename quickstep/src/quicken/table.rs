//! The quicken table: sorted (pc-range → step program) records over an
//! instruction pool.
//!
//! Records are sorted by `pc_start`, non-overlapping, and binary-searchable.
//! Pool entries are length-prefixed so identical programs can be shared by
//! many records.

use thiserror::Error;

use crate::arch::Arch;

/// One table record: a half-open image-relative pc range and the pool offset
/// of its step program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuickenRecord {
    pub pc_start: u32,
    pub pc_end: u32,
    pub instruction_offset: u32,
}

/// Structural defect found while assembling or loading a table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidTable {
    #[error("records out of order at index {0}")]
    OutOfOrder(usize),
    #[error("record {0} has an empty or inverted pc range")]
    EmptyRange(usize),
    #[error("record {0} points outside the instruction pool")]
    DanglingOffset(usize),
}

/// A complete per-image unwind table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickenTable {
    arch: Arch,
    records: Vec<QuickenRecord>,
    pool: Vec<u8>,
}

impl QuickenTable {
    /// Assemble a table, validating the sorted-records invariant and that
    /// every record points at a well-formed pool entry.
    ///
    /// # Errors
    /// Returns the first structural defect found.
    pub fn new(
        arch: Arch,
        records: Vec<QuickenRecord>,
        pool: Vec<u8>,
    ) -> Result<Self, InvalidTable> {
        for (i, record) in records.iter().enumerate() {
            if record.pc_start >= record.pc_end {
                return Err(InvalidTable::EmptyRange(i));
            }
            if i > 0 && records[i - 1].pc_end > record.pc_start {
                return Err(InvalidTable::OutOfOrder(i));
            }
            if stream_at(&pool, record.instruction_offset).is_none() {
                return Err(InvalidTable::DanglingOffset(i));
            }
        }
        Ok(Self { arch, records, pool })
    }

    /// Assemble a table directly from (pc-range → program) entries, encoding
    /// the programs into a shared pool. Identical programs share one pool
    /// entry. Entries must already be sorted and non-overlapping.
    ///
    /// # Errors
    /// Returns the first structural defect found.
    pub fn from_programs(
        arch: Arch,
        entries: &[(u32, u32, &[crate::quicken::instruction::Instruction])],
    ) -> Result<Self, InvalidTable> {
        use std::collections::HashMap;

        let mut pool = Vec::new();
        let mut offsets: HashMap<Vec<u8>, u32> = HashMap::new();
        let mut records = Vec::with_capacity(entries.len());
        for (i, (pc_start, pc_end, program)) in entries.iter().enumerate() {
            let stream = crate::quicken::instruction::encode_stream(program);
            let instruction_offset = match offsets.get(&stream) {
                Some(&offset) => offset,
                None => {
                    let offset = append_stream(&mut pool, &stream)
                        .ok_or(InvalidTable::DanglingOffset(i))?;
                    offsets.insert(stream, offset);
                    offset
                }
            };
            records.push(QuickenRecord {
                pc_start: *pc_start,
                pc_end: *pc_end,
                instruction_offset,
            });
        }
        Self::new(arch, records, pool)
    }

    #[must_use]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    #[must_use]
    pub fn records(&self) -> &[QuickenRecord] {
        &self.records
    }

    #[must_use]
    pub fn pool(&self) -> &[u8] {
        &self.pool
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Binary-search the step program covering `rel_pc`.
    ///
    /// Returns `None` for ranges with no metadata ("no info").
    #[must_use]
    pub fn lookup(&self, rel_pc: u64) -> Option<&[u8]> {
        let idx = self.records.partition_point(|r| u64::from(r.pc_start) <= rel_pc);
        let record = self.records.get(idx.checked_sub(1)?)?;
        if rel_pc < u64::from(record.pc_end) {
            stream_at(&self.pool, record.instruction_offset)
        } else {
            None
        }
    }
}

/// Append a program to the pool, returning its offset. Pool entries are
/// `u16` length-prefixed.
pub(crate) fn append_stream(pool: &mut Vec<u8>, stream: &[u8]) -> Option<u32> {
    let offset = u32::try_from(pool.len()).ok()?;
    let len = u16::try_from(stream.len()).ok()?;
    pool.extend_from_slice(&len.to_le_bytes());
    pool.extend_from_slice(stream);
    Some(offset)
}

/// Decode the pool entry at `offset`.
pub(crate) fn stream_at(pool: &[u8], offset: u32) -> Option<&[u8]> {
    let offset = offset as usize;
    let len_bytes = pool.get(offset..offset + 2)?;
    let len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
    pool.get(offset + 2..offset + 2 + len)
}
