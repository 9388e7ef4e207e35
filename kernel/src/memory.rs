use bootproto::{MemoryRegion, MemoryRegionKind};
use heapless::Vec;

use crate::error::InitError;

pub const FRAME_SIZE: u64 = 4096;

/// Most distinct regions kept after merging the firmware map.
pub const MAX_REGIONS: usize = 64;

/// Physical memory tracked by the frame allocator: the low 128 MiB.
pub const TRACKED_FRAMES: usize = 32 * 1024;

// Real-mode IVT, BIOS data area and the trampoline page stay untouched.
const BOOT_RESERVED_FRAMES: usize = 4;

const BITMAP_WORDS: usize = TRACKED_FRAMES / 64;

/// The firmware memory map, sorted by base with adjacent same-kind regions
/// merged.
#[derive(Clone, Debug)]
pub struct MemoryMap {
    regions: Vec<MemoryRegion, MAX_REGIONS>,
}

impl MemoryMap {
    pub fn from_regions(raw: &[MemoryRegion]) -> Result<Self, InitError> {
        let mut sorted: Vec<MemoryRegion, MAX_REGIONS> = Vec::new();
        for region in raw.iter().filter(|region| region.length != 0) {
            sorted
                .push(*region)
                .map_err(|_| InitError::Exhausted("memory map entries"))?;
        }
        if sorted.is_empty() {
            return Err(InitError::Missing("memory map"));
        }
        sorted.sort_unstable_by_key(|region| region.base);

        let mut regions: Vec<MemoryRegion, MAX_REGIONS> = Vec::new();
        for region in sorted {
            if let Some(last) = regions.last_mut() {
                if last.kind == region.kind && region.base <= last.end() {
                    let end = last.end().max(region.end());
                    last.length = end - last.base;
                    continue;
                }
            }
            // Cannot fail: never more entries than `sorted` had.
            let _ = regions.push(region);
        }

        Ok(Self { regions })
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn usable(&self) -> impl Iterator<Item = &MemoryRegion> + '_ {
        self.regions
            .iter()
            .filter(|region| region.kind == MemoryRegionKind::UsableRam)
    }

    pub fn usable_bytes(&self) -> u64 {
        self.usable().map(|region| region.length).sum()
    }

    /// First address past the highest usable region.
    pub fn top_of_usable(&self) -> u64 {
        self.usable().map(MemoryRegion::end).max().unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame(u32);

impl Frame {
    pub const fn number(&self) -> u32 {
        self.0
    }

    pub const fn start_addr(&self) -> u64 {
        self.0 as u64 * FRAME_SIZE
    }
}

/// Bitmap allocator over the low [`TRACKED_FRAMES`] frames. A set bit is a
/// frame in use or never usable.
pub struct FrameAllocator {
    bitmap: [u64; BITMAP_WORDS],
    next: usize,
    free: usize,
}

impl FrameAllocator {
    /// An allocator with nothing to hand out.
    pub const fn new() -> Self {
        Self {
            bitmap: [u64::MAX; BITMAP_WORDS],
            next: 0,
            free: 0,
        }
    }

    /// Frees every whole frame of usable memory, except the boot-reserved
    /// low frames.
    pub fn from_map(map: &MemoryMap) -> Self {
        let mut allocator = Self::new();
        for region in map.usable() {
            // Partial frames at either edge are not usable.
            let first = region.base.div_ceil(FRAME_SIZE);
            let last = region.end() / FRAME_SIZE;
            for frame in first..last.min(TRACKED_FRAMES as u64) {
                allocator.mark_free(frame as usize);
            }
        }
        for frame in 0..BOOT_RESERVED_FRAMES {
            allocator.mark_used(frame);
        }
        allocator.next = BOOT_RESERVED_FRAMES;
        allocator
    }

    pub fn allocate(&mut self) -> Option<Frame> {
        for offset in 0..TRACKED_FRAMES {
            let idx = (self.next + offset) % TRACKED_FRAMES;
            if !self.is_used(idx) {
                self.mark_used(idx);
                self.next = (idx + 1) % TRACKED_FRAMES;
                return Some(Frame(idx as u32));
            }
        }
        None
    }

    /// Returns `false` for frames that were not handed out.
    pub fn release(&mut self, frame: Frame) -> bool {
        let idx = frame.number() as usize;
        if idx >= TRACKED_FRAMES || idx < BOOT_RESERVED_FRAMES || !self.is_used(idx) {
            return false;
        }
        self.mark_free(idx);
        true
    }

    pub fn free_frames(&self) -> usize {
        self.free
    }

    fn is_used(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn mark_used(&mut self, idx: usize) {
        if !self.is_used(idx) {
            self.bitmap[idx / 64] |= 1 << (idx % 64);
            self.free -= 1;
        }
    }

    fn mark_free(&mut self, idx: usize) {
        if self.is_used(idx) {
            self.bitmap[idx / 64] &= !(1 << (idx % 64));
            self.free += 1;
        }
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(base: u64, length: u64, kind: MemoryRegionKind) -> MemoryRegion {
        MemoryRegion { base, length, kind }
    }

    #[test]
    fn map_is_sorted_and_merged() {
        let map = MemoryMap::from_regions(&[
            region(0x10_0000, 0x10_0000, MemoryRegionKind::UsableRam),
            region(0x0, 0x9_f000, MemoryRegionKind::UsableRam),
            region(0x20_0000, 0x20_0000, MemoryRegionKind::UsableRam),
            region(0xf_0000, 0x1_0000, MemoryRegionKind::Reserved),
            region(0x50_0000, 0, MemoryRegionKind::UsableRam),
        ])
        .unwrap();

        assert_eq!(map.regions().len(), 3);
        assert_eq!(map.regions()[2], region(0x10_0000, 0x30_0000, MemoryRegionKind::UsableRam));
        assert_eq!(map.usable_bytes(), 0x9_f000 + 0x30_0000);
        assert_eq!(map.top_of_usable(), 0x40_0000);
    }

    #[test]
    fn empty_map_is_missing() {
        assert_eq!(
            MemoryMap::from_regions(&[]).err(),
            Some(InitError::Missing("memory map"))
        );
    }

    #[test]
    fn allocator_hands_out_usable_frames_only() {
        let map = MemoryMap::from_regions(&[
            region(0x0, 0x8000, MemoryRegionKind::UsableRam),
            region(0x8000, 0x1000, MemoryRegionKind::Reserved),
            region(0x9000, 0x1800, MemoryRegionKind::UsableRam),
        ])
        .unwrap();
        let mut frames = FrameAllocator::from_map(&map);

        // Frames 4..8 plus frame 9; the half frame at 0xa000 is dropped.
        assert_eq!(frames.free_frames(), 5);
        let got: std::vec::Vec<u64> = core::iter::from_fn(|| frames.allocate())
            .map(|frame| frame.start_addr())
            .collect();
        assert_eq!(got, [0x4000, 0x5000, 0x6000, 0x7000, 0x9000]);
        assert_eq!(frames.free_frames(), 0);

        assert!(frames.release(Frame(5)));
        assert!(!frames.release(Frame(5)));
        assert!(!frames.release(Frame(1)));
        assert_eq!(frames.allocate(), Some(Frame(5)));
    }
}
