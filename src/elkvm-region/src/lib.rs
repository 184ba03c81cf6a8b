//! Region allocator: carves chunk-backed host memory into sized, free-listed regions.
//!
//! Regions are kept on sixteen power-of-two-indexed free lists by size class
//! (`index = clamp(ceil(log2(pages)), 0, 15)`); allocation is best-fit within a class, with
//! carve-out slicing of larger regions. No coalescing is performed on free: the allocator
//! trades fragmentation for O(1) amortized allocation within a class, mirroring the
//! `RegionManager`/`Region` design of the C ancestor of this core (`region.h`).

use elkvm_chunk::ChunkTable;
use elkvm_pager::PAGE_SIZE;
use kvm_ioctls::VmFd;
use tracing::trace;

const NUM_FREE_LIST_CLASSES: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("chunk table error: {0}")]
    Chunk(#[from] elkvm_chunk::Error),
    #[error("region id {0} does not exist")]
    NoSuchRegion(u32),
    #[error("requested size must be non-zero")]
    ZeroSize,
    #[error("region {0} is still referenced and cannot be freed")]
    StillInUse(u32),
    #[error("a freshly added chunk did not yield a free region large enough for {0} pages")]
    AllocationRaceOrBug(u64),
}

/// A contiguous sub-range of a chunk. `guest_virt` is assigned only once the region is
/// handed out to a mapping, never at creation.
#[derive(Debug, Clone)]
pub struct Region {
    pub id: u32,
    pub chunk_slot: u32,
    pub host_base: usize,
    pub size: u64,
    pub free: bool,
    pub guest_virt: Option<u64>,
}

impl Region {
    pub fn base_address(&self) -> usize {
        self.host_base
    }

    pub fn last_valid_address(&self) -> usize {
        self.host_base + self.size as usize - 1
    }

    pub fn contains_host(&self, p: usize) -> bool {
        p >= self.host_base && p <= self.last_valid_address()
    }

    pub fn contains_guest(&self, addr: u64) -> bool {
        match self.guest_virt {
            Some(base) => addr >= base && addr < base + self.size,
            None => false,
        }
    }

    pub fn space_after_host(&self, p: usize) -> usize {
        self.last_valid_address() - p + 1
    }

    pub fn set_guest_addr(&mut self, addr: u64) {
        self.guest_virt = Some(addr);
    }

    fn pages(&self) -> u64 {
        self.size / PAGE_SIZE
    }
}

fn freelist_class(pages: u64) -> usize {
    if pages <= 1 {
        return 0;
    }
    let idx = (64 - (pages - 1).leading_zeros()) as usize;
    idx.min(NUM_FREE_LIST_CLASSES - 1)
}

pub struct RegionAllocator {
    regions: Vec<Region>,
    free_lists: [Vec<u32>; NUM_FREE_LIST_CLASSES],
}

impl RegionAllocator {
    pub fn new() -> Self {
        RegionAllocator {
            regions: Vec::new(),
            free_lists: Default::default(),
        }
    }

    fn insert_free(&mut self, region: Region) -> u32 {
        let id = region.id;
        let class = freelist_class(region.pages());
        self.free_lists[class].push(id);
        self.regions.push(region);
        id
    }

    /// Register a new chunk with the hypervisor and carve it into one large free region.
    pub fn add_chunk(&mut self, chunks: &mut ChunkTable, vm: &VmFd, size: u64) -> Result<u32, Error> {
        let slot = chunks.add(vm, size, 0)?;
        let chunk = *chunks.get(slot)?;
        let id = self.regions.len() as u32;
        self.insert_free(Region {
            id,
            chunk_slot: slot,
            host_base: chunk.host_base,
            size: chunk.size,
            free: true,
            guest_virt: None,
        });
        Ok(slot)
    }

    fn find_free_region(&self, pages: u64) -> Option<(usize, usize)> {
        let start_class = freelist_class(pages);
        for class in start_class..NUM_FREE_LIST_CLASSES {
            if let Some(pos) = self.free_lists[class]
                .iter()
                .position(|&rid| self.regions[rid as usize].pages() >= pages)
            {
                return Some((class, pos));
            }
        }
        None
    }

    /// Allocate a region of at least `size` bytes (rounded up to the page size),
    /// carving a larger free region if necessary and adding a fresh chunk if no free
    /// region anywhere is big enough.
    pub fn allocate(&mut self, chunks: &mut ChunkTable, vm: &VmFd, size: u64) -> Result<u32, Error> {
        if size == 0 {
            return Err(Error::ZeroSize);
        }
        let size = elkvm_utils::page_round_up(size, PAGE_SIZE);
        let pages = size / PAGE_SIZE;

        if self.find_free_region(pages).is_none() {
            let chunk_size = std::cmp::max(elkvm_chunk::DEFAULT_CHUNK_SIZE, size);
            self.add_chunk(chunks, vm, chunk_size)?;
        }

        let (class, pos) = self
            .find_free_region(pages)
            .ok_or(Error::AllocationRaceOrBug(pages))?;
        let region_id = self.free_lists[class].remove(pos);

        let used_id = self.slice_begin(region_id, size)?;
        trace!(region = used_id, size, "region allocated");
        Ok(used_id)
    }

    /// Carve the first `n` bytes off free region `region_id` into a new used region,
    /// leaving the remainder (if any) on the appropriate free list.
    fn slice_begin(&mut self, region_id: u32, n: u64) -> Result<u32, Error> {
        let parent_size;
        let parent_host_base;
        let parent_chunk_slot;
        {
            let parent = self
                .regions
                .get_mut(region_id as usize)
                .ok_or(Error::NoSuchRegion(region_id))?;
            parent_size = parent.size;
            parent_host_base = parent.host_base;
            parent_chunk_slot = parent.chunk_slot;
        }

        let used_id = self.regions.len() as u32;
        let used = Region {
            id: used_id,
            chunk_slot: parent_chunk_slot,
            host_base: parent_host_base,
            size: n,
            free: false,
            guest_virt: None,
        };
        self.regions.push(used);

        let remainder = parent_size - n;
        if remainder == 0 {
            // The parent is fully consumed; replace it in place with the used region's
            // metadata so `region_id` stays a valid (but now unused) identifier.
            self.regions[region_id as usize] = self.regions[used_id as usize].clone();
            return Ok(region_id);
        }

        let remainder_region = Region {
            id: region_id,
            chunk_slot: parent_chunk_slot,
            host_base: parent_host_base + n as usize,
            size: remainder,
            free: true,
            guest_virt: None,
        };
        self.regions[region_id as usize] = remainder_region;
        let class = freelist_class(remainder / PAGE_SIZE);
        self.free_lists[class].push(region_id);

        Ok(used_id)
    }

    /// Split `region_id` into `[begin, center, end)` where `center` covers
    /// `[off, off+len)` relative to the region's start. Returns the center region's id;
    /// the side slices (if non-empty) are pushed back to their free lists.
    pub fn slice_center(&mut self, region_id: u32, off: u64, len: u64) -> Result<u32, Error> {
        let region = self
            .regions
            .get(region_id as usize)
            .ok_or(Error::NoSuchRegion(region_id))?
            .clone();

        let begin_len = off;
        let end_len = region.size - off - len;

        let center_id = self.regions.len() as u32;
        self.regions.push(Region {
            id: center_id,
            chunk_slot: region.chunk_slot,
            host_base: region.host_base + off as usize,
            size: len,
            free: false,
            guest_virt: None,
        });

        if begin_len > 0 {
            let begin_id = self.regions.len() as u32;
            self.regions.push(Region {
                id: begin_id,
                chunk_slot: region.chunk_slot,
                host_base: region.host_base,
                size: begin_len,
                free: true,
                guest_virt: None,
            });
            let class = freelist_class(begin_len / PAGE_SIZE);
            self.free_lists[class].push(begin_id);
        }

        if end_len > 0 {
            let end_id = self.regions.len() as u32;
            self.regions.push(Region {
                id: end_id,
                chunk_slot: region.chunk_slot,
                host_base: region.host_base + (off + len) as usize,
                size: end_len,
                free: true,
                guest_virt: None,
            });
            let class = freelist_class(end_len / PAGE_SIZE);
            self.free_lists[class].push(end_id);
        }

        self.regions[region_id as usize].free = true;
        self.regions[region_id as usize].size = 0;

        Ok(center_id)
    }

    /// Carve a new region covering `[rel_offset, rel_offset+len)` of `parent_id`'s host
    /// backing, without mutating `parent_id` itself. Used when a mapping is split (by a
    /// partial `munmap`/`mprotect`) into pieces that must keep referring to the same host
    /// bytes as before.
    pub fn sub_region(&mut self, parent_id: u32, rel_offset: u64, len: u64, free: bool) -> Result<u32, Error> {
        let parent = self
            .regions
            .get(parent_id as usize)
            .ok_or(Error::NoSuchRegion(parent_id))?
            .clone();
        let id = self.regions.len() as u32;
        self.regions.push(Region {
            id,
            chunk_slot: parent.chunk_slot,
            host_base: parent.host_base + rel_offset as usize,
            size: len,
            free,
            guest_virt: None,
        });
        if free && len > 0 {
            let class = freelist_class(len / PAGE_SIZE);
            self.free_lists[class].push(id);
        }
        Ok(id)
    }

    /// Mark a region permanently inert: zero its size and mark it free without placing it
    /// on any free list, so it is never matched by `find_by_host`/`find_by_guest` nor
    /// handed out by `allocate`. Used once a region has been fully carved into sub-regions
    /// by [`Self::sub_region`] and no longer corresponds to anything live.
    pub fn retire(&mut self, region_id: u32) -> Result<(), Error> {
        let region = self
            .regions
            .get_mut(region_id as usize)
            .ok_or(Error::NoSuchRegion(region_id))?;
        region.size = 0;
        region.free = true;
        Ok(())
    }

    /// Return a used region to its free list. No coalescing is attempted.
    pub fn free(&mut self, region_id: u32) -> Result<(), Error> {
        let region = self
            .regions
            .get_mut(region_id as usize)
            .ok_or(Error::NoSuchRegion(region_id))?;
        region.free = true;
        region.guest_virt = None;
        let pages = region.pages();
        let class = freelist_class(pages);
        self.free_lists[class].push(region_id);
        Ok(())
    }

    pub fn get(&self, region_id: u32) -> Result<&Region, Error> {
        self.regions
            .get(region_id as usize)
            .filter(|r| !r.free)
            .ok_or(Error::NoSuchRegion(region_id))
    }

    pub fn get_mut(&mut self, region_id: u32) -> Result<&mut Region, Error> {
        self.regions
            .get_mut(region_id as usize)
            .ok_or(Error::NoSuchRegion(region_id))
    }

    pub fn find_by_host(&self, host_p: usize) -> Option<&Region> {
        self.regions
            .iter()
            .find(|r| !r.free && r.contains_host(host_p))
    }

    pub fn find_by_guest(&self, guest_addr: u64) -> Option<&Region> {
        self.regions
            .iter()
            .find(|r| !r.free && r.contains_guest(guest_addr))
    }
}

impl Default for RegionAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_ioctls::Kvm;

    fn setup() -> Option<(VmFd, ChunkTable, RegionAllocator)> {
        let kvm = Kvm::new().ok()?;
        let vm = kvm.create_vm().ok()?;
        let chunks = ChunkTable::new();
        let allocator = RegionAllocator::new();
        Some((vm, chunks, allocator))
    }

    #[test]
    fn freelist_class_buckets() {
        assert_eq!(freelist_class(1), 0);
        assert_eq!(freelist_class(2), 1);
        assert_eq!(freelist_class(3), 2);
        assert_eq!(freelist_class(4), 2);
        assert_eq!(freelist_class(1 << 20), 15);
    }

    #[test]
    fn allocate_carves_and_leaves_remainder() {
        let Some((vm, mut chunks, mut alloc)) = setup() else {
            return;
        };
        alloc.add_chunk(&mut chunks, &vm, 0x10000).unwrap();
        let id = alloc.allocate(&mut chunks, &vm, 0x1000).unwrap();
        let region = alloc.get(id).unwrap();
        assert_eq!(region.size, 0x1000);

        // remainder should still be available for further allocation
        let id2 = alloc.allocate(&mut chunks, &vm, 0x1000).unwrap();
        assert_ne!(id, id2);
    }

    #[test]
    fn allocate_grows_chunk_table_when_exhausted() {
        let Some((vm, mut chunks, mut alloc)) = setup() else {
            return;
        };
        alloc.add_chunk(&mut chunks, &vm, 0x1000).unwrap();
        // bigger than the only chunk: must add a new one
        let id = alloc.allocate(&mut chunks, &vm, 8 * 1024 * 1024).unwrap();
        assert!(alloc.get(id).is_ok());
        assert_eq!(chunks.count(), 2);
    }

    #[test]
    fn free_does_not_coalesce() {
        let Some((vm, mut chunks, mut alloc)) = setup() else {
            return;
        };
        alloc.add_chunk(&mut chunks, &vm, 0x10000).unwrap();
        let id = alloc.allocate(&mut chunks, &vm, 0x1000).unwrap();
        alloc.free(id).unwrap();
        assert!(alloc.get(id).is_err());
    }
}
