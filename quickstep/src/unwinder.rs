//! The stepping unwinder.
//!
//! Given a register file captured from a thread, walks frames by locating
//! the image covering the program counter, binary-searching the image's
//! quicken table, and executing the record's step program against thread
//! memory. Every failure truncates: the frames collected so far are returned
//! with the error kind annotated on the result, never propagated as a panic
//! or an `Err`.
//!
//! No allocation happens per step beyond the caller-visible frame vector,
//! which is reserved up front; table lookups borrow the cached table.

use std::ops::Range;
use std::sync::Arc;

use log::debug;

use crate::arch::{Arch, RegisterFile};
use crate::error::UnwindError;
use crate::maps::{Image, ImageRegistry};
use crate::memory::ProcessMemory;
use crate::quicken::instruction;
use crate::quicken::table::QuickenTable;
use crate::quicken::cache::TableCache;

/// One walked frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Absolute program counter, call-site adjusted.
    pub pc: u64,
    /// Image-relative program counter.
    pub rel_pc: u64,
    /// Image the counter resolved to; absent for sentinel frames.
    pub image: Option<Arc<Image>>,
    /// True when this frame is an interpreted-runtime program counter
    /// delivered through the side channel rather than a native return
    /// address.
    pub is_interpreted: bool,
}

/// Result of one unwind: the frames collected plus the reason the walk
/// stopped early, if any.
#[derive(Debug, Default)]
pub struct Unwound {
    pub frames: Vec<Frame>,
    pub error: Option<UnwindError>,
}

/// Register state being stepped, with the finished/error flags the step
/// programs and the walk maintain. Initial state is provided by the caller,
/// from a signal context or an explicit capture.
#[derive(Debug, Clone)]
pub struct UnwindCursor {
    pub regs: RegisterFile,
    pub finished: bool,
    pub last_error: Option<UnwindError>,
}

impl UnwindCursor {
    #[must_use]
    pub fn new(regs: RegisterFile) -> Self {
        Self { regs, finished: false, last_error: None }
    }
}

/// Side channel for interpreted program counters.
///
/// Sampled after stepping through an image flagged `maybe_interpreted`; a
/// returned counter is parked and emitted as an `is_interpreted` frame ahead
/// of the next native frame.
pub trait InterpretedPcSource {
    fn sample(&self, regs: &RegisterFile) -> Option<u64>;
}

/// How one frame is stepped. A single `step` dispatch switches on the tag.
enum StepVariant<'t> {
    /// Walk the frame-pointer chain; used when quicken unwinding is off.
    FramePointer,
    /// Execute the image's quicken record.
    Quicken(&'t QuickenTable),
    /// Quicken plus the interpreted-pc side channel.
    Jit(&'t QuickenTable),
}

/// Thumb 32-bit branch-with-link mask: both halfwords flag a 4-byte call.
const THUMB_BL_MASK: u32 = 0xe000_f000;

/// The stepping unwinder. Borrows the registry, cache, and process memory;
/// holds no state of its own, so one instance serves every thread.
pub struct Unwinder<'a> {
    registry: &'a ImageRegistry,
    cache: &'a TableCache,
    memory: &'a dyn ProcessMemory,
    interpreted: Option<&'a dyn InterpretedPcSource>,
    quicken_enabled: bool,
}

impl<'a> Unwinder<'a> {
    #[must_use]
    pub fn new(
        registry: &'a ImageRegistry,
        cache: &'a TableCache,
        memory: &'a dyn ProcessMemory,
    ) -> Self {
        Self { registry, cache, memory, interpreted: None, quicken_enabled: true }
    }

    /// Attach an interpreted-pc side channel.
    #[must_use]
    pub fn with_interpreted_source(mut self, source: &'a dyn InterpretedPcSource) -> Self {
        self.interpreted = Some(source);
        self
    }

    /// Disable quicken tables and fall back to frame-pointer walking.
    #[must_use]
    pub fn with_quicken(mut self, enabled: bool) -> Self {
        self.quicken_enabled = enabled;
        self
    }

    /// Walk frames from `cursor` until finished, an error, or `max_frames`.
    ///
    /// `stack` bounds every memory load performed by step programs; it is
    /// the current thread's stack range.
    pub fn unwind(
        &self,
        cursor: &mut UnwindCursor,
        stack: &Range<u64>,
        max_frames: usize,
    ) -> Unwound {
        let mut frames: Vec<Frame> = Vec::with_capacity(max_frames);
        let mut error: Option<UnwindError> = None;

        if self.registry.is_empty() {
            cursor.last_error = Some(UnwindError::MapsNull);
            return Unwound { frames, error: Some(UnwindError::MapsNull) };
        }

        let arch = cursor.regs.arch();
        let mut adjust_pc = false;
        let mut pending_interpreted: Option<u64> = None;
        let mut last_image: Option<Arc<Image>> = None;

        while frames.len() < max_frames {
            let cur_pc = cursor.regs.pc();
            let cur_sp = cursor.regs.sp();

            // Consecutive frames usually stay in one image; skip the
            // registry lookup when the memoized image still covers the pc.
            let image = match last_image.as_ref().filter(|i| i.contains(cur_pc)) {
                Some(image) => Arc::clone(image),
                None => match self.registry.find(cur_pc) {
                    Some(image) => {
                        last_image = Some(Arc::clone(&image));
                        image
                    }
                    None => {
                        frames.push(Frame {
                            pc: cur_pc.wrapping_sub(2),
                            rel_pc: cur_pc.wrapping_sub(2),
                            image: None,
                            is_interpreted: false,
                        });
                        error = Some(UnwindError::InvalidMap);
                        break;
                    }
                },
            };

            let table = if self.quicken_enabled {
                // An image already known to carry no metadata fails fast
                // without re-enqueuing a build request.
                let resolved =
                    if image.unwindable() { self.cache.table_for(&image).ok() } else { None };
                match resolved {
                    Some(table) => Some(table),
                    None => {
                        debug!("no table for {}", image.path);
                        frames.push(Frame {
                            pc: cur_pc.wrapping_sub(2),
                            rel_pc: image.rel_pc(cur_pc.wrapping_sub(2)),
                            image: Some(Arc::clone(&image)),
                            is_interpreted: false,
                        });
                        error = Some(UnwindError::InvalidElf);
                        break;
                    }
                }
            } else {
                None
            };

            let rel_pc = image.rel_pc(cur_pc);
            let adjustment =
                if adjust_pc { self.pc_adjustment(arch, &image, cur_pc, rel_pc) } else { 0 };
            let step_pc = rel_pc.wrapping_sub(adjustment);

            if let Some(interpreted_pc) = pending_interpreted.take() {
                frames.push(Frame {
                    pc: interpreted_pc,
                    rel_pc: interpreted_pc,
                    image: None,
                    is_interpreted: true,
                });
                if frames.len() >= max_frames {
                    error = Some(UnwindError::MaxFramesExceeded);
                    break;
                }
            }

            frames.push(Frame {
                pc: cur_pc.wrapping_sub(adjustment),
                rel_pc: step_pc,
                image: Some(Arc::clone(&image)),
                is_interpreted: false,
            });
            adjust_pc = true;
            if frames.len() >= max_frames {
                error = Some(UnwindError::MaxFramesExceeded);
                break;
            }

            let variant = match table.as_deref() {
                Some(table) if image.maybe_interpreted => StepVariant::Jit(table),
                Some(table) => StepVariant::Quicken(table),
                None => StepVariant::FramePointer,
            };
            match self.step(variant, step_pc, &mut cursor.regs, stack, &mut pending_interpreted)
            {
                Ok(true) => {
                    cursor.finished = true;
                    break;
                }
                Ok(false) => {}
                Err(err) => {
                    error = Some(err);
                    break;
                }
            }

            // If neither the pc nor the sp moved, consider everything stopped.
            if cursor.regs.pc() == cur_pc && cursor.regs.sp() == cur_sp {
                error = Some(UnwindError::RepeatedFrame);
                break;
            }
        }

        cursor.last_error = error;
        Unwound { frames, error }
    }

    fn step(
        &self,
        variant: StepVariant<'_>,
        step_pc: u64,
        regs: &mut RegisterFile,
        stack: &Range<u64>,
        pending_interpreted: &mut Option<u64>,
    ) -> Result<bool, UnwindError> {
        match variant {
            StepVariant::FramePointer => self.step_framepointer(regs, stack),
            StepVariant::Quicken(table) => self.step_quicken(table, step_pc, regs, stack),
            StepVariant::Jit(table) => {
                let finished = self.step_quicken(table, step_pc, regs, stack)?;
                if let Some(source) = self.interpreted {
                    *pending_interpreted = source.sample(regs);
                }
                Ok(finished)
            }
        }
    }

    fn step_quicken(
        &self,
        table: &QuickenTable,
        step_pc: u64,
        regs: &mut RegisterFile,
        stack: &Range<u64>,
    ) -> Result<bool, UnwindError> {
        let stream = table.lookup(step_pc).ok_or(UnwindError::InvalidElf)?;
        let finished = instruction::execute(stream, regs, self.memory, stack)?;
        if !finished {
            // The restored return address is the caller's program counter.
            regs.set_pc(regs.ra());
        }
        Ok(finished)
    }

    /// Walk one `{fp, lr}` pair up the frame-pointer chain.
    fn step_framepointer(
        &self,
        regs: &mut RegisterFile,
        stack: &Range<u64>,
    ) -> Result<bool, UnwindError> {
        let arch = regs.arch();
        let word = arch.word_size() as u64;
        let fp = regs.fp();
        if fp == 0 {
            return Ok(true);
        }
        if fp < stack.start || fp.wrapping_add(2 * word) > stack.end {
            return Err(UnwindError::InvalidMemory);
        }
        let new_fp = self.memory.read_word(fp, arch).ok_or(UnwindError::InvalidMemory)?;
        let new_lr =
            self.memory.read_word(fp + word, arch).ok_or(UnwindError::InvalidMemory)?;
        if new_fp == 0 || new_lr == 0 {
            return Ok(true);
        }
        regs.set(arch.fp(), new_fp);
        regs.set(arch.ra(), new_lr);
        regs.set_sp(fp + 2 * word);
        regs.set_pc(new_lr);
        Ok(false)
    }

    /// Convert a return address into its call-site address.
    ///
    /// Fixed 4-byte calls on arm64. On arm the two bytes preceding a Thumb
    /// return address distinguish 2- and 4-byte call encodings; whenever the
    /// inspection cannot be done safely the conservative choice is 2.
    fn pc_adjustment(&self, arch: Arch, image: &Image, pc: u64, rel_pc: u64) -> u64 {
        match arch {
            Arch::Arm64 => 4,
            Arch::Arm => {
                if rel_pc < 5 {
                    return if rel_pc < 2 { 0 } else { 2 };
                }
                if pc & 1 == 0 {
                    return 4;
                }
                // Thumb call, 2 or 4 bytes. Peek at the instruction ending at
                // the return address. The mapping was just validated, so the
                // unchecked reader is allowed here.
                let inspect = pc - 5;
                if !image.perms.read
                    || inspect < image.start
                    || inspect + 4 >= image.end
                {
                    return 2;
                }
                let mut buf = [0u8; 4];
                let readable = unsafe { self.memory.read_unchecked(inspect, &mut buf) };
                if readable && u32::from_le_bytes(buf) & THUMB_BL_MASK == THUMB_BL_MASK {
                    4
                } else {
                    2
                }
            }
        }
    }
}
