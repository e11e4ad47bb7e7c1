//! Kernel heap
//!
//! The heap is a contiguous run of kernel virtual memory starting at [`HEAP_BASE`], tiled by
//! blocks without gaps. Each block is bracketed by a 16-byte header and a 16-byte footer:
//!
//! ```text
//!  header                     payload                   footer
//! +------+--------+------+-------+---------------------+--------+----------+--------------+
//! | size | footer | used | magic |    `size` bytes     | header | reserved | magic (u64)  |
//! +------+--------+------+-------+---------------------+--------+----------+--------------+
//! ```
//!
//! Only free blocks are indexed: one sorted array holds their header addresses, a second one
//! their footer addresses. As blocks never overlap, entry `i` of both arrays belongs to the same
//! block, and whether a neighbour of some block is free is a single lookup next to the block's
//! insertion point.

use core::fmt::{Display, Formatter};

use crate::addr::{align_up, VirtAddr};
use crate::error::MemoryError;
use crate::layout::{FREE_INDEX_CAPACITY, HEAP_BASE, HEAP_LIMIT, PAGE_SIZE};
use crate::ordered::OrderedArray;
use crate::platform::{read_u32, read_u64, write_u32, write_u64, Platform};

/// Alignment of every pointer handed out, and granularity of block sizes.
pub const ALIGNMENT: u32 = 16;

const TAG_SIZE: u32 = 16;

/// Bytes taken by one header and one footer.
pub const OVERHEAD: u32 = 2 * TAG_SIZE;

const HEADER_MAGIC: u32 = 0xB10C_B10C;
const FOOTER_MAGIC: u64 = 0xB10C_B10C_B10C_B10C;

/// Header magic of a block that has been merged into a neighbour.
const RETIRED_MAGIC: u32 = 0xDEAD_B10C;

/// Source of the memory behind the heap.
pub trait HeapBacking {
    /// Makes `count` pages starting at the page-aligned `at` writable memory. Either all pages
    /// are mapped afterwards or none.
    fn map_pages(&mut self, at: VirtAddr, count: u32) -> Result<(), MemoryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub free_bytes: u32,
    pub free_blocks: usize,
    pub largest_free: u32,
}

impl Display for HeapStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "heap {}..{}: {} bytes free in {} block(s), largest {}",
            self.start, self.end, self.free_bytes, self.free_blocks, self.largest_free
        )
    }
}

/// Ways in which boundary tags can disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagError {
    HeaderMagic(u32),
    FooterMagic(u64),
    FooterOutOfBounds(u32),
    BackPointer(u32),
}

impl Display for TagError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::HeaderMagic(magic) => write!(f, "bad header magic {magic:#010x}"),
            Self::FooterMagic(magic) => write!(f, "bad footer magic {magic:#018x}"),
            Self::FooterOutOfBounds(footer) => {
                write!(f, "footer pointer {footer:#010x} outside of the heap")
            }
            Self::BackPointer(header) => {
                write!(f, "footer points back to {header:#010x}")
            }
        }
    }
}

/// A block whose boundary tags have been checked against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    header: VirtAddr,
    size: u32,
    used: bool,
}

impl Block {
    /// Writes matching header and footer for a block of `size` payload bytes at `header`.
    fn lay_down<P: Platform + ?Sized>(
        platform: &P,
        header: VirtAddr,
        size: u32,
        used: bool,
    ) -> Self {
        let block = Self { header, size, used };
        let footer = block.footer();
        write_u32(platform, header, size);
        write_u32(platform, header.add(4), footer.as_u32());
        write_u32(platform, header.add(8), used as u32);
        write_u32(platform, header.add(12), HEADER_MAGIC);
        write_u32(platform, footer, header.as_u32());
        write_u32(platform, footer.add(4), 0);
        write_u64(platform, footer.add(8), FOOTER_MAGIC);
        block
    }

    /// Reads the block at `header`, which must leave room for a header below `end`.
    fn read<P: Platform + ?Sized>(
        platform: &P,
        header: VirtAddr,
        end: VirtAddr,
    ) -> Result<Self, TagError> {
        if header.as_u32() as u64 + OVERHEAD as u64 > end.as_u32() as u64 {
            return Err(TagError::FooterOutOfBounds(header.as_u32()));
        }
        let magic = read_u32(platform, header.add(12));
        if magic != HEADER_MAGIC {
            return Err(TagError::HeaderMagic(magic));
        }
        let size = read_u32(platform, header);
        let footer = read_u32(platform, header.add(4));
        let expected = (header.as_u32() as u64) + TAG_SIZE as u64 + size as u64;
        if footer as u64 != expected || expected + TAG_SIZE as u64 > end.as_u32() as u64 {
            return Err(TagError::FooterOutOfBounds(footer));
        }
        let footer = VirtAddr::new(footer);
        let footer_magic = read_u64(platform, footer.add(8));
        if footer_magic != FOOTER_MAGIC {
            return Err(TagError::FooterMagic(footer_magic));
        }
        let back = read_u32(platform, footer);
        if back != header.as_u32() {
            return Err(TagError::BackPointer(back));
        }
        Ok(Self {
            header,
            size,
            used: read_u32(platform, header.add(8)) != 0,
        })
    }

    fn set_used<P: Platform + ?Sized>(&mut self, platform: &P, used: bool) {
        self.used = used;
        write_u32(platform, self.header.add(8), used as u32);
    }

    /// Invalidates the header of a block that has been absorbed by a neighbour.
    fn retire_header<P: Platform + ?Sized>(platform: &P, header: VirtAddr) {
        write_u32(platform, header.add(8), 0);
        write_u32(platform, header.add(12), RETIRED_MAGIC);
    }

    fn clear_footer<P: Platform + ?Sized>(platform: &P, footer: VirtAddr) {
        write_u32(platform, footer, 0);
        write_u64(platform, footer.add(8), 0);
    }

    fn payload(&self) -> VirtAddr {
        self.header.add(TAG_SIZE)
    }

    fn footer(&self) -> VirtAddr {
        self.header.add(TAG_SIZE + self.size)
    }

    /// First byte behind this block, i.e. the header of its right neighbour.
    fn end(&self) -> VirtAddr {
        self.header.add(OVERHEAD + self.size)
    }
}

pub struct Heap {
    start: VirtAddr,
    end: VirtAddr,
    limit: VirtAddr,
    headers: OrderedArray<FREE_INDEX_CAPACITY>,
    footers: OrderedArray<FREE_INDEX_CAPACITY>,
}

impl Heap {
    /// An empty heap occupying no memory yet.
    pub const fn new() -> Self {
        Self {
            start: VirtAddr::new(HEAP_BASE),
            end: VirtAddr::new(HEAP_BASE),
            limit: VirtAddr::new(HEAP_LIMIT),
            headers: OrderedArray::new(),
            footers: OrderedArray::new(),
        }
    }

    /// Maps the first `pages` pages of the heap and turns them into one free block.
    pub fn initialize<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        backing: &mut impl HeapBacking,
        pages: u32,
    ) -> Result<(), MemoryError> {
        self.grow(platform, backing, pages)?;
        log::debug!("Kernel heap ready: {}", self.stats(platform));
        Ok(())
    }

    /// Allocates at least `size` bytes and returns their 16-byte aligned address.
    pub fn allocate<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        backing: &mut impl HeapBacking,
        size: u32,
    ) -> Result<VirtAddr, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSize);
        }
        let size = align_up(size, ALIGNMENT).ok_or(MemoryError::HeapExhausted)?;

        if let Some(payload) = self.first_fit(platform, size) {
            return Ok(payload);
        }

        let pages = (size as u64 + OVERHEAD as u64).div_ceil(PAGE_SIZE as u64);
        let pages = u32::try_from(pages).map_err(|_| MemoryError::HeapExhausted)?;
        self.grow(platform, backing, pages)?;
        self.first_fit(platform, size)
            .ok_or(MemoryError::HeapExhausted)
    }

    /// Returns the block at `payload` to the heap and merges it with free neighbours.
    ///
    /// ## Panics
    ///
    /// If the boundary tags around `payload` are corrupted.
    pub fn free<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        payload: VirtAddr,
    ) -> Result<(), MemoryError> {
        if payload.as_u32() == 0 {
            return Err(MemoryError::NullPointer);
        }
        if !payload.is_aligned(ALIGNMENT) {
            return Err(MemoryError::Misaligned(payload.as_u32()));
        }
        if payload < self.start.add(TAG_SIZE) || payload.add(TAG_SIZE) >= self.end {
            return Err(MemoryError::OutOfRange(payload.as_u32()));
        }

        let header = payload.sub(TAG_SIZE);
        if read_u32(platform, header.add(12)) == RETIRED_MAGIC {
            return Err(MemoryError::DoubleFree(payload.as_u32()));
        }
        let block = self.load(platform, header);
        if !block.used {
            return Err(MemoryError::DoubleFree(payload.as_u32()));
        }
        self.release(platform, block).map(|_| ())
    }

    pub fn stats<P: Platform + ?Sized>(&self, platform: &P) -> HeapStats {
        let mut stats = HeapStats {
            start: self.start,
            end: self.end,
            free_bytes: 0,
            free_blocks: self.headers.len(),
            largest_free: 0,
        };
        for header in (0..self.headers.len()).filter_map(|i| self.headers.get(i)) {
            let block = self.load(platform, VirtAddr::new(header));
            stats.free_bytes += block.size;
            stats.largest_free = stats.largest_free.max(block.size);
        }
        stats
    }

    /// Walks every block of the heap and checks the tags, the tiling and the free indices.
    pub fn verify<P: Platform + ?Sized>(&self, platform: &P) -> Result<HeapStats, MemoryError> {
        let mut at = self.start;
        let mut free_index = 0;
        let mut previous_free = false;
        while at < self.end {
            let block = Block::read(platform, at, self.end)
                .map_err(|_| MemoryError::Corrupted(at.as_u32()))?;
            if !block.used {
                // Two free neighbours should have been merged.
                let indexed = self.headers.get(free_index) == Some(at.as_u32())
                    && self.footers.get(free_index) == Some(block.footer().as_u32());
                if previous_free || !indexed {
                    return Err(MemoryError::Corrupted(at.as_u32()));
                }
                free_index += 1;
            }
            previous_free = !block.used;
            at = block.end();
        }
        if at != self.end || free_index != self.headers.len() {
            return Err(MemoryError::Corrupted(at.as_u32()));
        }
        Ok(self.stats(platform))
    }

    /// Logs every block of the heap.
    pub fn dump<P: Platform + ?Sized>(&self, platform: &P) {
        log::debug!("{}", self.stats(platform));
        let mut at = self.start;
        while at < self.end {
            match Block::read(platform, at, self.end) {
                Ok(block) => {
                    log::debug!(
                        "├─ {} {:>8} bytes {}",
                        block.payload(),
                        block.size,
                        if block.used { "used" } else { "free" }
                    );
                    at = block.end();
                }
                Err(error) => {
                    log::debug!("└─ {at}: {error}");
                    return;
                }
            }
        }
        log::debug!("└─ end @ {}", self.end);
    }

    /// Maps `pages` more pages at the end of the heap and frees them as one block.
    fn grow<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        backing: &mut impl HeapBacking,
        pages: u32,
    ) -> Result<(), MemoryError> {
        let bytes = pages
            .checked_mul(PAGE_SIZE)
            .filter(|&bytes| bytes as u64 + self.end.as_u32() as u64 <= self.limit.as_u32() as u64)
            .ok_or(MemoryError::HeapExhausted)?;
        // The new block either extends a free tail or needs an index entry of its own.
        let free_tail = !self.footers.is_empty()
            && self.footers.get(self.footers.len() - 1) == Some(self.end.as_u32() - TAG_SIZE);
        if !free_tail && self.headers.is_full() {
            return Err(MemoryError::IndexFull);
        }
        backing.map_pages(self.end, pages)?;

        let block = Block::lay_down(platform, self.end, bytes - OVERHEAD, true);
        self.end = self.end.add(bytes);
        log::debug!("Kernel heap grown by {pages} page(s) to {}", self.end);
        self.release(platform, block).map(|_| ())
    }

    /// Takes the first free block with room for `size` bytes.
    fn first_fit<P: Platform + ?Sized>(&mut self, platform: &P, size: u32) -> Option<VirtAddr> {
        let mut index = 0;
        while let Some(header) = self.headers.get(index) {
            let block = self.load(platform, VirtAddr::new(header));
            if block.size >= size {
                return Some(self.take(platform, index, block, size));
            }
            index += 1;
        }
        None
    }

    /// Marks the free block at position `index` of the indices as used. The tail is split off
    /// into a new free block if it can hold at least one more aligned unit.
    fn take<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        index: usize,
        mut block: Block,
        size: u32,
    ) -> VirtAddr {
        if block.size >= size + OVERHEAD + ALIGNMENT {
            let used = Block::lay_down(platform, block.header, size, true);
            let rest = Block::lay_down(platform, used.end(), block.size - size - OVERHEAD, false);
            // The rest keeps the old footer, so only the header index changes.
            self.headers.replace(index, rest.header.as_u32());
            log::trace!("Heap: split {} into {size} + {} bytes", block.header, rest.size);
            used.payload()
        } else {
            self.headers.remove(index);
            self.footers.remove(index);
            block.set_used(platform, true);
            block.payload()
        }
    }

    /// Marks `block` free, merging it with free neighbours. Returns the resulting block.
    fn release<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        mut block: Block,
    ) -> Result<Block, MemoryError> {
        let index = self.headers.insertion_point(block.header.as_u32());
        let left = index
            .checked_sub(1)
            .filter(|&i| self.footers.get(i) == Some(block.header.as_u32() - TAG_SIZE))
            .and_then(|i| self.headers.get(i))
            .map(|header| self.load(platform, VirtAddr::new(header)));
        let right = self
            .headers
            .get(index)
            .filter(|&header| header == block.end().as_u32())
            .map(|header| self.load(platform, VirtAddr::new(header)));

        let merged = match (left, right) {
            (Some(left), Some(right)) => {
                Block::clear_footer(platform, left.footer());
                Block::retire_header(platform, block.header);
                Block::clear_footer(platform, block.footer());
                Block::retire_header(platform, right.header);
                self.headers.remove(index);
                self.footers.remove(index - 1);
                let size = right.end().as_u32() - left.header.as_u32() - OVERHEAD;
                Block::lay_down(platform, left.header, size, false)
            }
            (Some(left), None) => {
                Block::clear_footer(platform, left.footer());
                Block::retire_header(platform, block.header);
                self.footers.replace(index - 1, block.footer().as_u32());
                let size = block.end().as_u32() - left.header.as_u32() - OVERHEAD;
                Block::lay_down(platform, left.header, size, false)
            }
            (None, Some(right)) => {
                Block::clear_footer(platform, block.footer());
                Block::retire_header(platform, right.header);
                self.headers.replace(index, block.header.as_u32());
                let size = right.end().as_u32() - block.header.as_u32() - OVERHEAD;
                Block::lay_down(platform, block.header, size, false)
            }
            (None, None) => {
                if self.headers.is_full() {
                    log::warn!("Heap: free index full, leaking block {}", block.header);
                    return Err(MemoryError::IndexFull);
                }
                self.headers.insert(block.header.as_u32())?;
                self.footers.insert(block.footer().as_u32())?;
                block.set_used(platform, false);
                block
            }
        };
        log::trace!("Heap: freed {} ({} bytes)", merged.header, merged.size);
        Ok(merged)
    }

    /// Reads the block at `header`, halting on corrupted tags.
    fn load<P: Platform + ?Sized>(&self, platform: &P, header: VirtAddr) -> Block {
        if header < self.start || header.add(OVERHEAD) > self.end {
            panic!("heap integrity violation: block {header} outside of the heap");
        }
        match Block::read(platform, header, self.end) {
            Ok(block) => block,
            Err(error) => panic!("heap integrity violation at {header}: {error}"),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HeapArena;

    const KIB: u32 = 1024;

    fn heap(arena: &mut HeapArena, pages: u32) -> Heap {
        let mut heap = Heap::new();
        let platform = arena.platform();
        heap.initialize(&platform, arena, pages).unwrap();
        heap
    }

    #[test]
    fn initial_heap_is_one_free_block() {
        let mut arena = HeapArena::new(64);
        let heap = heap(&mut arena, 4);
        let stats = heap.verify(&arena.platform()).unwrap();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, 4 * PAGE_SIZE - OVERHEAD);
        assert_eq!(stats.end, VirtAddr::new(HEAP_BASE + 4 * PAGE_SIZE));
    }

    #[test]
    fn zero_size_is_rejected() {
        let mut arena = HeapArena::new(64);
        let mut heap = heap(&mut arena, 1);
        let platform = arena.platform();
        assert_eq!(
            heap.allocate(&platform, &mut arena, 0),
            Err(MemoryError::ZeroSize)
        );
    }

    #[test]
    fn round_trip_sizes() {
        let mut arena = HeapArena::new(1024);
        let mut heap = heap(&mut arena, 4);
        let platform = arena.platform();

        for size in [1, 15, 16, 17, 4 * KIB, 1024 * KIB] {
            let before = heap.stats(&platform);
            let ptr = heap.allocate(&platform, &mut arena, size).unwrap();
            assert!(ptr.is_aligned(ALIGNMENT));
            let block = heap.load(&platform, ptr.sub(TAG_SIZE));
            assert!(block.used && block.size >= size);

            let pattern: Vec<u8> = (0..size).map(|i| (i * 7 + size) as u8).collect();
            arena.write(ptr, &pattern);
            assert_eq!(arena.read(ptr, size as usize), pattern);

            heap.free(&platform, ptr).unwrap();
            let after = heap.stats(&platform);
            if after.end == before.end {
                assert_eq!(after, before);
            } else {
                // Growth hands out more memory, but everything is free again.
                assert_eq!(after.free_blocks, 1);
                assert_eq!(after.free_bytes, after.end.as_u32() - HEAP_BASE - OVERHEAD);
            }
            heap.verify(&platform).unwrap();
        }
    }

    #[test]
    fn small_remainders_are_not_split_off() {
        let mut arena = HeapArena::new(64);
        let mut heap = heap(&mut arena, 1);
        let platform = arena.platform();
        let whole = PAGE_SIZE - OVERHEAD;

        // 32 bytes of slack is not enough for a header, footer and one aligned unit.
        let ptr = heap
            .allocate(&platform, &mut arena, whole - OVERHEAD)
            .unwrap();
        assert_eq!(heap.load(&platform, ptr.sub(TAG_SIZE)).size, whole);
        assert_eq!(heap.stats(&platform).free_blocks, 0);
        heap.free(&platform, ptr).unwrap();

        let ptr = heap
            .allocate(&platform, &mut arena, whole - OVERHEAD - ALIGNMENT)
            .unwrap();
        assert_eq!(
            heap.load(&platform, ptr.sub(TAG_SIZE)).size,
            whole - OVERHEAD - ALIGNMENT
        );
        assert_eq!(heap.stats(&platform).largest_free, ALIGNMENT);
        heap.verify(&platform).unwrap();
    }

    #[test]
    fn first_fit_in_address_order() {
        let mut arena = HeapArena::new(64);
        let mut heap = heap(&mut arena, 4);
        let platform = arena.platform();
        let a = heap.allocate(&platform, &mut arena, 64).unwrap();
        let _b = heap.allocate(&platform, &mut arena, 64).unwrap();
        let c = heap.allocate(&platform, &mut arena, 256).unwrap();
        let _d = heap.allocate(&platform, &mut arena, 64).unwrap();
        heap.free(&platform, c).unwrap();
        heap.free(&platform, a).unwrap();

        assert_eq!(heap.allocate(&platform, &mut arena, 48).unwrap(), a);
        assert_eq!(heap.allocate(&platform, &mut arena, 128).unwrap(), c);
    }

    #[test]
    fn coalescing_in_every_order() {
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let mut arena = HeapArena::new(64);
            let mut heap = heap(&mut arena, 4);
            let platform = arena.platform();

            let blocks: Vec<VirtAddr> = (0..3)
                .map(|_| heap.allocate(&platform, &mut arena, 256).unwrap())
                .collect();
            // Use up the rest so that nothing but A, B and C can be freed.
            let rest = heap.stats(&platform).largest_free;
            heap.allocate(&platform, &mut arena, rest).unwrap();
            assert_eq!(heap.stats(&platform).free_blocks, 0);

            for i in order {
                heap.free(&platform, blocks[i]).unwrap();
            }
            let stats = heap.verify(&platform).unwrap();
            assert_eq!(stats.free_blocks, 1, "order {order:?}");
            assert_eq!(stats.free_bytes, 3 * 256 + 2 * OVERHEAD);

            let end = stats.end;
            let union = heap
                .allocate(&platform, &mut arena, 3 * 256 + 2 * OVERHEAD)
                .unwrap();
            assert_eq!(union, blocks[0]);
            assert_eq!(heap.stats(&platform).end, end, "heap must not grow");
        }
    }

    #[test]
    fn heap_grows_on_demand() {
        let mut arena = HeapArena::new(64);
        let mut heap = heap(&mut arena, 1);
        let platform = arena.platform();

        let ptr = heap.allocate(&platform, &mut arena, 8 * KIB).unwrap();
        let stats = heap.verify(&platform).unwrap();
        // The new pages are merged with the free initial page.
        assert_eq!(ptr, VirtAddr::new(HEAP_BASE + TAG_SIZE));
        assert_eq!(stats.end, VirtAddr::new(HEAP_BASE + 4 * PAGE_SIZE));
        assert_eq!(arena.mapped_pages(), 4);
    }

    #[test]
    fn growth_failure_leaves_heap_untouched() {
        let mut arena = HeapArena::new(8);
        let mut heap = heap(&mut arena, 4);
        let platform = arena.platform();
        let before = heap.stats(&platform);

        assert_eq!(
            heap.allocate(&platform, &mut arena, 64 * KIB),
            Err(MemoryError::OutOfFrames(crate::physical::RegionClass::High))
        );
        assert_eq!(heap.stats(&platform), before);
        assert!(heap.allocate(&platform, &mut arena, KIB).is_ok());
    }

    #[test]
    fn invalid_frees_are_rejected() {
        let mut arena = HeapArena::new(64);
        let mut heap = heap(&mut arena, 4);
        let platform = arena.platform();
        let ptr = heap.allocate(&platform, &mut arena, 32).unwrap();

        assert_eq!(
            heap.free(&platform, VirtAddr::new(0)),
            Err(MemoryError::NullPointer)
        );
        assert_eq!(
            heap.free(&platform, ptr.add(8)),
            Err(MemoryError::Misaligned(ptr.as_u32() + 8))
        );
        assert_eq!(
            heap.free(&platform, VirtAddr::new(0x1000)),
            Err(MemoryError::OutOfRange(0x1000))
        );
        let beyond = VirtAddr::new(HEAP_BASE + 4 * PAGE_SIZE);
        assert_eq!(
            heap.free(&platform, beyond),
            Err(MemoryError::OutOfRange(beyond.as_u32()))
        );
    }

    #[test]
    fn double_free_is_detected() {
        let mut arena = HeapArena::new(64);
        let mut heap = heap(&mut arena, 4);
        let platform = arena.platform();
        let a = heap.allocate(&platform, &mut arena, 64).unwrap();
        let b = heap.allocate(&platform, &mut arena, 64).unwrap();
        let _guard = heap.allocate(&platform, &mut arena, 64).unwrap();

        heap.free(&platform, a).unwrap();
        assert_eq!(heap.free(&platform, a), Err(MemoryError::DoubleFree(a.as_u32())));

        // `b` is absorbed by `a` and its header retired.
        heap.free(&platform, b).unwrap();
        assert_eq!(heap.free(&platform, b), Err(MemoryError::DoubleFree(b.as_u32())));
        heap.verify(&platform).unwrap();
    }

    #[test]
    #[should_panic(expected = "heap integrity violation")]
    fn overrun_is_fatal() {
        let mut arena = HeapArena::new(64);
        let mut heap = heap(&mut arena, 4);
        let platform = arena.platform();
        let ptr = heap.allocate(&platform, &mut arena, 32).unwrap();
        // Write past the payload into the footer.
        arena.write(ptr, &[0xAA; 48]);
        let _ = heap.free(&platform, ptr);
    }

    #[test]
    fn verify_reports_corruption() {
        let mut arena = HeapArena::new(64);
        let mut heap = heap(&mut arena, 4);
        let platform = arena.platform();
        let ptr = heap.allocate(&platform, &mut arena, 32).unwrap();
        assert!(heap.verify(&platform).is_ok());
        arena.write(ptr.sub(4), &[0; 4]);
        assert_eq!(
            heap.verify(&platform),
            Err(MemoryError::Corrupted(HEAP_BASE))
        );
    }

    #[test]
    fn full_index_leaks_the_block() {
        let mut arena = HeapArena::new(256);
        let mut heap = heap(&mut arena, 4);
        let platform = arena.platform();

        let blocks: Vec<VirtAddr> = (0..2 * FREE_INDEX_CAPACITY)
            .map(|_| heap.allocate(&platform, &mut arena, 16).unwrap())
            .collect();
        // Every other block, each one isolated by used neighbours. The heap's tail already
        // takes up one index entry.
        let mut isolated = blocks.iter().step_by(2);
        for ptr in isolated.by_ref().take(FREE_INDEX_CAPACITY - 1) {
            heap.free(&platform, *ptr).unwrap();
        }
        let last = *isolated.next().unwrap();
        assert_eq!(heap.free(&platform, last), Err(MemoryError::IndexFull));
        // Merging needs no new entry.
        assert_eq!(heap.free(&platform, blocks[1]), Ok(()));
        let stats = heap.verify(&platform).unwrap();
        assert_eq!(stats.free_blocks, FREE_INDEX_CAPACITY - 1);
    }

    #[test]
    fn growth_needing_an_index_entry_fails_early() {
        let mut arena = HeapArena::new(256);
        let mut heap = heap(&mut arena, 4);
        let platform = arena.platform();

        let blocks: Vec<VirtAddr> = (0..2 * FREE_INDEX_CAPACITY)
            .map(|_| heap.allocate(&platform, &mut arena, 16).unwrap())
            .collect();
        let mut isolated = blocks.iter().step_by(2);
        for ptr in isolated.by_ref().take(FREE_INDEX_CAPACITY - 1) {
            heap.free(&platform, *ptr).unwrap();
        }
        // Use up the free tail, then fill its index entry with an isolated block.
        let stats = heap.stats(&platform);
        let tail = heap.allocate(&platform, &mut arena, stats.largest_free).unwrap();
        assert_eq!(tail.add(stats.largest_free + TAG_SIZE), stats.end);
        heap.free(&platform, *isolated.next().unwrap()).unwrap();

        let before = heap.verify(&platform).unwrap();
        let mapped = arena.mapped_pages();
        assert_eq!(
            heap.allocate(&platform, &mut arena, 64 * KIB),
            Err(MemoryError::IndexFull)
        );
        assert_eq!(arena.mapped_pages(), mapped);
        assert_eq!(heap.verify(&platform).unwrap(), before);
    }
}
