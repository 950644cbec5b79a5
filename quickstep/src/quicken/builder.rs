//! Quicken-table generation from compiler-emitted call-frame information.
//!
//! Walks every function descriptor in an image's `.eh_frame`, evaluates the
//! unwind row state machine at each instruction boundary, and lowers each row
//! into a step program: restore the return address and callee-saved registers
//! with loads relative to the canonical frame address, then advance the stack
//! pointer. Rows the compact instruction set cannot express lower to the
//! single `Unsupported` opcode. Adjacent rows with identical programs
//! coalesce, and identical programs share one pool entry.

use std::collections::HashMap;

use gimli::{BaseAddresses, CfaRule, EhFrame, LittleEndian, Register, RegisterRule, UnwindSection};
use log::{debug, warn};
use object::{Object, ObjectSection, ObjectSegment};

use crate::arch::Arch;
use crate::error::CacheError;
use crate::quicken::instruction::{encode_stream, Instruction};
use crate::quicken::table::{append_stream, QuickenRecord, QuickenTable};

/// Counters accumulated during one build, surfaced in reports for offline
/// diagnosis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub fdes_total: u64,
    pub fdes_bad: u64,
    pub rows_total: u64,
    pub records_emitted: u64,
    pub records_coalesced: u64,
    pub unsupported_ranges: u64,
}

/// One evaluated row span before assembly into the final table.
struct RowSpan {
    start: u64,
    end: u64,
    stream: Vec<u8>,
}

/// Builds quicken tables for one architecture.
pub struct TableBuilder {
    arch: Arch,
}

impl TableBuilder {
    #[must_use]
    pub fn new(arch: Arch) -> Self {
        Self { arch }
    }

    /// Build a table from raw ELF bytes.
    ///
    /// # Errors
    /// `BuildFailed` when the bytes do not parse as ELF, the image carries no
    /// unwinding metadata, or no row yields a valid record.
    pub fn build_from_elf(&self, data: &[u8]) -> Result<(QuickenTable, BuildStats), CacheError> {
        let obj = object::File::parse(data)
            .map_err(|e| CacheError::BuildFailed(format!("not a valid ELF image: {e}")))?;

        // Link-time address of the first loadable segment; subtracted so
        // record pcs line up with the unwinder's bias-relative pcs.
        let base_vaddr = obj
            .segments()
            .find(|s| s.file_range().0 == 0)
            .map(|s| s.address())
            .unwrap_or(0);

        let section = obj
            .section_by_name(".eh_frame")
            .ok_or_else(|| CacheError::BuildFailed("no unwinding metadata".to_string()))?;
        let eh_frame_data = section
            .data()
            .map_err(|e| CacheError::BuildFailed(format!("unreadable .eh_frame: {e}")))?;

        self.build_from_cfi(eh_frame_data, section.address(), base_vaddr)
    }

    /// Build a table from a raw `.eh_frame` payload.
    ///
    /// # Errors
    /// `BuildFailed` when no row yields a valid record.
    pub fn build_from_cfi(
        &self,
        eh_frame_data: &[u8],
        eh_frame_addr: u64,
        base_vaddr: u64,
    ) -> Result<(QuickenTable, BuildStats), CacheError> {
        let eh_frame = EhFrame::new(eh_frame_data, LittleEndian);
        let bases = BaseAddresses::default().set_eh_frame(eh_frame_addr);

        let mut stats = BuildStats::default();
        let mut spans: Vec<RowSpan> = Vec::new();
        let mut ctx = gimli::UnwindContext::new();
        let mut cies = HashMap::new();

        let mut iter = eh_frame.entries(&bases);
        loop {
            let entry = match iter.next() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    // The section cursor is unrecoverable past a framing error.
                    warn!("corrupt call-frame metadata, stopping early: {e}");
                    stats.fdes_bad += 1;
                    break;
                }
            };
            match entry {
                gimli::CieOrFde::Cie(cie) => {
                    cies.insert(cie.offset(), cie);
                }
                gimli::CieOrFde::Fde(partial_fde) => {
                    stats.fdes_total += 1;
                    let fde = match partial_fde.parse(|_, bases, offset| {
                        if let Some(cie) = cies.get(&offset.0) {
                            Ok(cie.clone())
                        } else {
                            eh_frame.cie_from_offset(bases, offset)
                        }
                    }) {
                        Ok(fde) => fde,
                        Err(_) => {
                            stats.fdes_bad += 1;
                            continue;
                        }
                    };

                    let ra_register = fde.cie().return_address_register();
                    let mut table = match fde.rows(&eh_frame, &bases, &mut ctx) {
                        Ok(table) => table,
                        Err(_) => {
                            stats.fdes_bad += 1;
                            continue;
                        }
                    };

                    loop {
                        let row = match table.next_row() {
                            Ok(Some(row)) => row,
                            Ok(None) => break,
                            Err(_) => {
                                stats.fdes_bad += 1;
                                break;
                            }
                        };
                        stats.rows_total += 1;

                        let start = row.start_address().wrapping_sub(base_vaddr);
                        let end = row.end_address().wrapping_sub(base_vaddr);
                        if start >= end || end > u64::from(u32::MAX) {
                            continue;
                        }

                        let rules: Vec<(Register, RegisterRule<_>)> =
                            row.registers().map(|(r, rule)| (*r, rule.clone())).collect();
                        let program = self.lower_row(row.cfa(), &rules, ra_register);
                        if program == [Instruction::Unsupported] {
                            stats.unsupported_ranges += 1;
                        }
                        spans.push(RowSpan { start, end, stream: encode_stream(&program) });
                    }
                }
            }
        }

        let table = self.assemble(spans, &mut stats)?;
        debug!(
            "built quicken table: {} records from {} rows ({} fdes, {} bad, {} unsupported)",
            stats.records_emitted, stats.rows_total, stats.fdes_total, stats.fdes_bad,
            stats.unsupported_ranges
        );
        Ok((table, stats))
    }

    /// Lower one evaluated row into a step program.
    ///
    /// The program restores every register the row names with loads relative
    /// to the CFA base register, then advances the stack pointer to the CFA.
    /// A row whose return address is `Undefined` has no caller: the program
    /// is the single `Finish` opcode.
    fn lower_row<T: gimli::ReaderOffset>(
        &self,
        cfa: &CfaRule<T>,
        rules: &[(Register, RegisterRule<T>)],
        ra_register: Register,
    ) -> Vec<Instruction> {
        let sp = self.arch.sp();
        let ra = self.arch.ra();

        let CfaRule::RegisterAndOffset { register, offset: cfa_offset } = cfa else {
            return vec![Instruction::Unsupported];
        };
        if register.0 != u16::from(sp) {
            // CFA anchored anywhere but the stack pointer (frame-pointer
            // chains, expressions) is outside the compact vocabulary.
            return vec![Instruction::Unsupported];
        }
        let cfa_offset = *cfa_offset;

        let mut loads: Vec<(u8, i64)> = Vec::new();
        let mut finished = false;

        for (reg, rule) in rules {
            let is_ra = *reg == ra_register;
            match rule {
                RegisterRule::Offset(off) => {
                    if !is_ra && usize::from(reg.0) >= self.arch.register_count() {
                        continue;
                    }
                    let dst = if is_ra { ra } else { reg.0 as u8 };
                    if dst == sp {
                        // The CFA rule owns the stack pointer; a row that also
                        // stores it would clobber the load base.
                        return vec![Instruction::Unsupported];
                    }
                    loads.push((dst, cfa_offset + off));
                }
                RegisterRule::Undefined if is_ra => finished = true,
                RegisterRule::Undefined | RegisterRule::SameValue => {}
                RegisterRule::Register(src) if is_ra && *src == ra_register => {
                    // Return address still lives in the link register.
                }
                _ => return vec![Instruction::Unsupported],
            }
        }

        if finished {
            return vec![Instruction::Finish];
        }

        // Deterministic order so identical rows produce identical bytes.
        loads.sort_by_key(|&(dst, _)| dst);

        let mut program = Vec::with_capacity(loads.len() + 1);
        for (dst, offset) in loads {
            let Ok(offset) = i32::try_from(offset) else {
                return vec![Instruction::Unsupported];
            };
            program.push(Instruction::Load { dst, src: sp, offset });
        }
        let Ok(offset) = i32::try_from(cfa_offset) else {
            return vec![Instruction::Unsupported];
        };
        program.push(Instruction::Add { reg: sp, offset });
        program
    }

    /// Sort, resolve overlaps (narrowest range wins, ambiguous ranges drop),
    /// coalesce adjacent identical programs, and emit the final table with a
    /// deduplicated pool.
    fn assemble(
        &self,
        mut spans: Vec<RowSpan>,
        stats: &mut BuildStats,
    ) -> Result<QuickenTable, CacheError> {
        spans.sort_by_key(|s| (s.start, s.end - s.start));

        let mut kept: Vec<RowSpan> = Vec::with_capacity(spans.len());
        for span in spans {
            let Some(last) = kept.last_mut() else {
                kept.push(span);
                continue;
            };
            if span.start >= last.end {
                kept.push(span);
                continue;
            }
            // Overlap. Identical duplicates collapse; equal ranges that
            // disagree are ambiguous and produce no record; otherwise the
            // narrowest range wins the contested bytes.
            if span.start == last.start && span.end == last.end {
                if span.stream != last.stream {
                    kept.pop();
                }
                continue;
            }
            if span.end - span.start < last.end - last.start {
                last.end = span.start.max(last.start);
                let truncated_away = last.end == last.start;
                if truncated_away {
                    kept.pop();
                }
                kept.push(span);
            } else {
                let mut span = span;
                span.start = last.end;
                if span.start < span.end {
                    kept.push(span);
                }
            }
        }

        // Coalesce adjacent records whose programs are byte-identical.
        let mut coalesced: Vec<RowSpan> = Vec::with_capacity(kept.len());
        for span in kept {
            if let Some(last) = coalesced.last_mut() {
                if last.end == span.start && last.stream == span.stream {
                    last.end = span.end;
                    stats.records_coalesced += 1;
                    continue;
                }
            }
            coalesced.push(span);
        }

        if coalesced.is_empty() {
            return Err(CacheError::BuildFailed("no usable unwind rows".to_string()));
        }

        let mut pool = Vec::new();
        let mut offsets: HashMap<Vec<u8>, u32> = HashMap::new();
        let mut records = Vec::with_capacity(coalesced.len());
        for span in coalesced {
            let offset = match offsets.get(&span.stream) {
                Some(&offset) => offset,
                None => {
                    let offset = append_stream(&mut pool, &span.stream).ok_or_else(|| {
                        CacheError::BuildFailed("instruction pool overflow".to_string())
                    })?;
                    offsets.insert(span.stream, offset);
                    offset
                }
            };
            records.push(QuickenRecord {
                pc_start: span.start as u32,
                pc_end: span.end as u32,
                instruction_offset: offset,
            });
        }
        stats.records_emitted = records.len() as u64;

        QuickenTable::new(self.arch, records, pool)
            .map_err(|e| CacheError::BuildFailed(e.to_string()))
    }
}
