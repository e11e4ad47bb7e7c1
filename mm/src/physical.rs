//! Physical page frame allocation
//!
//! Every frame of the 32-bit physical address space is represented by one bit: set means used
//! (or unusable), clear means free. Frames start out used, so memory that the firmware never
//! reported stays untouchable. Available regions are released once at boot, after which
//! reserved regions are marked permanently.

use core::fmt::{Display, Formatter};
use core::ops::Range;

use arrayvec::ArrayVec;

use crate::addr::PhysAddr;
use crate::error::MemoryError;
use crate::layout::{MemoryLayout, FRAME_COUNT, PAGE_SIZE};

/// Reserved ranges remembered so that they can never be released again.
const RESERVED_RANGES: usize = 64;

/// Selects the part of physical memory an allocation is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionClass {
    /// Frames that are permanently mapped in every address space. Page tables and other memory
    /// that the kernel needs to touch at any time live here.
    Low,
    /// Everything above the low window. Reachable only through a mapping of its own.
    High,
}

impl Display for RegionClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::High => "high",
        })
    }
}

/// Frame usage numbers of one allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub low_free: u32,
    pub high_free: u32,
    pub used: u32,
}

pub struct FrameAllocator {
    bitmap: &'static mut [u32],
    /// Frames tracked by `bitmap`.
    frame_count: u32,
    /// First frame of the high window.
    low_frames: u32,
    /// Frame ranges marked by [`FrameAllocator::reserve`], merged when they touch.
    reserved: ArrayVec<Range<u32>, RESERVED_RANGES>,
}

impl FrameAllocator {
    /// Takes over `bitmap` and marks every frame it covers as used.
    pub fn new(bitmap: &'static mut [u32], layout: &MemoryLayout) -> Self {
        bitmap.fill(u32::MAX);
        let frame_count = (bitmap.len() as u64 * 32).min(FRAME_COUNT as u64) as u32;
        Self {
            bitmap,
            frame_count,
            low_frames: layout.low_frames().min(frame_count),
            reserved: ArrayVec::new(),
        }
    }

    /// Releases all whole frames inside `[base, base + length)`. Used for the firmware's
    /// available regions while booting.
    pub fn add_available(&mut self, base: u64, length: u64) {
        let first = base.div_ceil(PAGE_SIZE as u64);
        let end = base.saturating_add(length) / PAGE_SIZE as u64;
        for frame in self.clip(first..end) {
            if !self.is_reserved(frame) {
                self.clear_bit(frame);
            }
        }
    }

    /// Marks every frame touched by `[base, base + length)` as used for good. Calling this
    /// again for the same range changes nothing.
    pub fn reserve(&mut self, base: u64, length: u64) {
        if length == 0 {
            return;
        }
        let first = base / PAGE_SIZE as u64;
        let end = base.saturating_add(length).div_ceil(PAGE_SIZE as u64);
        let frames = self.clip(first..end);
        if frames.is_empty() {
            return;
        }

        log::debug!(
            "Reserving frames {:#x}..{:#x}",
            frames.start,
            frames.end
        );
        for frame in frames.clone() {
            self.set_bit(frame);
        }
        self.remember_reserved(frames);
    }

    /// Allocates `count` contiguous frames from the window of `class` and returns the physical
    /// address of the first one.
    pub fn allocate(&mut self, class: RegionClass, count: u32) -> Result<PhysAddr, MemoryError> {
        if count == 0 {
            return Err(MemoryError::ZeroSize);
        }

        let window = self.window(class);
        let mut run_start = window.start;
        let mut frame = window.start;
        while frame < window.end {
            if self.test_bit(frame) {
                // Skip fully used words in one step.
                frame += 1;
                while frame % 32 == 0 && frame + 32 <= window.end && self.word(frame) == u32::MAX
                {
                    frame += 32;
                }
                run_start = frame;
                continue;
            }

            frame += 1;
            if frame - run_start == count {
                for used in run_start..frame {
                    self.set_bit(used);
                }
                let base = PhysAddr::from_frame(run_start);
                log::trace!("Allocated {count} {class} frame(s) @ {base}");
                return Ok(base);
            }
        }

        Err(MemoryError::OutOfFrames(class))
    }

    /// Releases `count` frames starting at `base`. Nothing is released if one of them is free
    /// already or reserved.
    pub fn free(&mut self, base: PhysAddr, count: u32) -> Result<(), MemoryError> {
        if !base.is_page_aligned() {
            return Err(MemoryError::Misaligned(base.as_u32()));
        }
        let first = base.frame_number();
        let end = first
            .checked_add(count)
            .filter(|&end| end <= self.frame_count)
            .ok_or(MemoryError::OutOfRange(base.as_u32()))?;

        for frame in first..end {
            if self.is_reserved(frame) {
                return Err(MemoryError::ReservedFrame(PhysAddr::from_frame(frame).as_u32()));
            }
            if !self.test_bit(frame) {
                return Err(MemoryError::DoubleFree(PhysAddr::from_frame(frame).as_u32()));
            }
        }

        for frame in first..end {
            self.clear_bit(frame);
        }
        log::trace!("Freed {count} frame(s) @ {base}");
        Ok(())
    }

    /// Marks the frame containing `addr` as used.
    pub fn set_frame(&mut self, addr: PhysAddr) {
        if addr.frame_number() < self.frame_count {
            self.set_bit(addr.frame_number());
        }
    }

    /// Marks the frame containing `addr` as free.
    pub fn clear_frame(&mut self, addr: PhysAddr) {
        if addr.frame_number() < self.frame_count {
            self.clear_bit(addr.frame_number());
        }
    }

    /// Whether the frame containing `addr` is used. Frames outside the bitmap always are.
    pub fn test_frame(&self, addr: PhysAddr) -> bool {
        addr.frame_number() >= self.frame_count || self.test_bit(addr.frame_number())
    }

    pub fn is_reserved_frame(&self, addr: PhysAddr) -> bool {
        self.is_reserved(addr.frame_number())
    }

    pub fn stats(&self) -> FrameStats {
        let free_in = |frames: Range<u32>| frames.filter(|&f| !self.test_bit(f)).count() as u32;
        let low_free = free_in(0..self.low_frames);
        let high_free = free_in(self.low_frames..self.frame_count);
        FrameStats {
            low_free,
            high_free,
            used: self.frame_count - low_free - high_free,
        }
    }

    fn window(&self, class: RegionClass) -> Range<u32> {
        match class {
            // Frame zero is never handed out.
            RegionClass::Low => 1..self.low_frames,
            RegionClass::High => self.low_frames.max(1)..self.frame_count,
        }
    }

    fn clip(&self, frames: Range<u64>) -> Range<u32> {
        let limit = self.frame_count as u64;
        frames.start.min(limit) as u32..frames.end.min(limit) as u32
    }

    fn is_reserved(&self, frame: u32) -> bool {
        self.reserved.iter().any(|range| range.contains(&frame))
    }

    fn remember_reserved(&mut self, frames: Range<u32>) {
        let mut merged = frames;
        self.reserved.retain(|range| {
            let touches = range.start <= merged.end && merged.start <= range.end;
            if touches {
                merged = range.start.min(merged.start)..range.end.max(merged.end);
            }
            !touches
        });
        if self.reserved.try_push(merged.clone()).is_err() {
            log::warn!(
                "Too many reserved regions, frames {:#x}..{:#x} can be released by mistake",
                merged.start,
                merged.end
            );
        }
    }

    fn word(&self, frame: u32) -> u32 {
        self.bitmap[frame as usize / 32]
    }

    fn test_bit(&self, frame: u32) -> bool {
        self.bitmap[frame as usize / 32] & (1 << (frame % 32)) != 0
    }

    fn set_bit(&mut self, frame: u32) {
        self.bitmap[frame as usize / 32] |= 1 << (frame % 32);
    }

    fn clear_bit(&mut self, frame: u32) {
        self.bitmap[frame as usize / 32] &= !(1 << (frame % 32));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BITMAP_WORDS;

    const MIB: u64 = 1 << 20;

    /// 16 MiB of RAM, the lower 8 MiB of which form the low window.
    fn allocator() -> FrameAllocator {
        let layout = MemoryLayout {
            low_window_end: 8 << 20,
            ..MemoryLayout::DEFAULT
        };
        let bitmap = vec![0u32; BITMAP_WORDS].leak();
        let mut frames = FrameAllocator::new(bitmap, &layout);
        frames.add_available(0, 16 * MIB);
        frames
    }

    #[test]
    fn unreported_memory_is_used() {
        let frames = allocator();
        assert!(!frames.test_frame(PhysAddr::new(0x0010_0000)));
        assert!(frames.test_frame(PhysAddr::new(0x0100_0000)));
        assert!(frames.test_frame(PhysAddr::new(0xFFFF_F000)));
    }

    #[test]
    fn bitmap_round_trip() {
        let mut frames = allocator();
        for addr in [0x1000, 0x0020_0000, 0x00FF_F000].map(PhysAddr::new) {
            frames.clear_frame(addr);
            assert!(!frames.test_frame(addr));
            frames.set_frame(addr);
            assert!(frames.test_frame(addr));
        }
    }

    #[test]
    fn allocations_come_from_their_window() {
        let mut frames = allocator();
        let low = frames.allocate(RegionClass::Low, 4).unwrap();
        let high = frames.allocate(RegionClass::High, 4).unwrap();
        assert!(low.as_u32() < 8 << 20);
        assert!(high.as_u32() >= 8 << 20);
        for i in 0..4 {
            assert!(frames.test_frame(PhysAddr::new(low.as_u32() + i * PAGE_SIZE)));
            assert!(frames.test_frame(PhysAddr::new(high.as_u32() + i * PAGE_SIZE)));
        }
    }

    #[test]
    fn no_double_allocation() {
        let mut frames = allocator();
        let mut ranges: Vec<Range<u32>> = Vec::new();
        for count in [1, 3, 7, 1, 16, 2] {
            let base = frames.allocate(RegionClass::High, count).unwrap().as_u32();
            let range = base..base + count * PAGE_SIZE;
            assert!(ranges
                .iter()
                .all(|other| range.end <= other.start || other.end <= range.start));
            ranges.push(range);
        }
    }

    #[test]
    fn allocation_skips_used_frames() {
        let mut frames = allocator();
        let first = frames.allocate(RegionClass::High, 1).unwrap();
        frames.set_frame(PhysAddr::new(first.as_u32() + 2 * PAGE_SIZE));
        let run = frames.allocate(RegionClass::High, 2).unwrap();
        assert_eq!(run.as_u32(), first.as_u32() + 3 * PAGE_SIZE);
        let single = frames.allocate(RegionClass::High, 1).unwrap();
        assert_eq!(single.as_u32(), first.as_u32() + PAGE_SIZE);
    }

    #[test]
    fn exhausted_window_is_an_error() {
        let mut frames = allocator();
        assert_eq!(
            frames.allocate(RegionClass::High, 2049),
            Err(MemoryError::OutOfFrames(RegionClass::High))
        );
        assert!(frames.allocate(RegionClass::High, 2048).is_ok());
        assert_eq!(
            frames.allocate(RegionClass::High, 1),
            Err(MemoryError::OutOfFrames(RegionClass::High))
        );
        assert!(frames.allocate(RegionClass::Low, 1).is_ok());
        assert_eq!(frames.allocate(RegionClass::Low, 0), Err(MemoryError::ZeroSize));
    }

    #[test]
    fn free_makes_frames_reusable() {
        let mut frames = allocator();
        let base = frames.allocate(RegionClass::High, 8).unwrap();
        frames.free(base, 8).unwrap();
        assert!(!frames.test_frame(base));
        assert_eq!(frames.allocate(RegionClass::High, 8), Ok(base));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut frames = allocator();
        let base = frames.allocate(RegionClass::High, 2).unwrap();
        frames.free(base, 1).unwrap();
        assert_eq!(
            frames.free(base, 2),
            Err(MemoryError::DoubleFree(base.as_u32()))
        );
        // The second frame is still allocated.
        assert!(frames.test_frame(PhysAddr::new(base.as_u32() + PAGE_SIZE)));
    }

    #[test]
    fn reservation_is_permanent() {
        let mut frames = allocator();
        frames.reserve(0x0030_0800, 0x1000);
        let reserved = PhysAddr::new(0x0030_0000);
        assert!(frames.test_frame(reserved));
        assert!(frames.test_frame(PhysAddr::new(0x0030_1000)));
        assert!(!frames.test_frame(PhysAddr::new(0x0030_2000)));

        let other = frames.allocate(RegionClass::Low, 1).unwrap();
        frames.free(other, 1).unwrap();
        assert!(frames.test_frame(reserved));

        assert_eq!(
            frames.free(reserved, 1),
            Err(MemoryError::ReservedFrame(reserved.as_u32()))
        );
        frames.add_available(0x0030_0000, 0x2000);
        assert!(frames.test_frame(reserved));
    }

    #[test]
    fn reserve_is_idempotent() {
        let mut frames = allocator();
        frames.reserve(0x0010_0000, 4 * MIB);
        let stats = frames.stats();
        frames.reserve(0x0010_0000, 4 * MIB);
        frames.reserve(0x0020_0000, MIB);
        assert_eq!(frames.stats(), stats);
        assert_eq!(frames.reserved.len(), 1);
    }

    #[test]
    fn regions_beyond_four_gib_are_clipped() {
        let mut frames = allocator();
        frames.add_available(0x1_0000_0000, 4 * MIB);
        frames.reserve(0xFFFF_0000, 0x2_0000);
        assert!(frames.test_frame(PhysAddr::new(0xFFFF_F000)));
    }

    #[test]
    fn stats_count_windows() {
        let mut frames = allocator();
        let before = frames.stats();
        assert_eq!(before.low_free, 2048);
        assert_eq!(before.high_free, 2048);
        frames.allocate(RegionClass::Low, 3).unwrap();
        assert_eq!(frames.stats().low_free, 2045);
        assert_eq!(frames.stats().used, before.used + 3);
    }
}
