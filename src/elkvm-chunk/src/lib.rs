//! Chunk table: host-allocated, page-aligned memory blocks registered with the hypervisor
//! as contiguous guest physical RAM.
//!
//! Chunks are appended; a new chunk's `guest_phys_base` equals the running total of all
//! prior chunk sizes, so guest physical address space is always a contiguous prefix with
//! no gaps. Slot 0 is the *system chunk*, which carries the page-table region, GDT/IDT/TSS,
//! the three flat blobs, and the early kernel stack (see [`SYSTEM_CHUNK_PAGE_TABLE_RESERVE`]).
//!
//! Host-pointer translation is never cached outside this table: page-table entries and
//! region bookkeeping store guest-physical addresses only, and every host-pointer lookup
//! walks the chunk list again.

use std::sync::Arc;

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;
use tracing::debug;
use vm_memory::{GuestAddress, GuestRegionMmap, MmapRegion, VolatileSlice};

pub use elkvm_utils::memory::GuestMemoryExt;

/// Slot number of the system chunk; always the first chunk created.
pub const SYSTEM_CHUNK_SLOT: u32 = 0;

/// Fixed reserve, inside the system chunk, for the four-level page-table region.
pub const SYSTEM_CHUNK_PAGE_TABLE_RESERVE: u64 = 0x0040_0000;

/// Default size for a chunk created implicitly by an `mmap` that overflows existing chunks.
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("chunk size {0:#x} is not page-aligned")]
    UnalignedSize(u64),
    #[error("failed to allocate {0:#x} bytes of host memory")]
    HostAlloc(u64),
    #[error("failed to build guest memory layout: {0}")]
    GuestMemory(#[from] vm_memory::GuestMemoryError),
    #[error("kernel rejected the memory region: {0}")]
    SetUserMemoryRegion(#[source] kvm_ioctls::Error),
    #[error("chunk slot {0} does not exist")]
    NoSuchChunk(u32),
    #[error("remap is only supported for the most recently added chunk (slot {last}), got {requested}")]
    RemapNotLastChunk { requested: u32, last: u32 },
    #[error("guest-physical address {0:#x} is not backed by any chunk")]
    Unbacked(u64),
}

/// Metadata for one chunk. The backing storage is a separate `GuestRegionMmap` kept
/// alongside in the table; `host_base` is cached here for cheap host-pointer-range
/// membership checks.
#[derive(Debug, Clone, Copy)]
pub struct Chunk {
    pub slot: u32,
    pub guest_phys_base: u64,
    pub size: u64,
    pub host_base: usize,
    pub flags: u32,
}

impl Chunk {
    pub fn contains_host(&self, host_p: usize) -> bool {
        host_p >= self.host_base && host_p < self.host_base + self.size as usize
    }

    pub fn contains_guest_phys(&self, pa: u64) -> bool {
        pa >= self.guest_phys_base && pa < self.guest_phys_base + self.size
    }

    pub fn is_system(&self) -> bool {
        self.slot == SYSTEM_CHUNK_SLOT
    }

    pub fn kvm_region(&self) -> kvm_userspace_memory_region {
        kvm_userspace_memory_region {
            slot: self.slot,
            guest_phys_addr: self.guest_phys_base,
            memory_size: self.size,
            userspace_addr: self.host_base as u64,
            flags: self.flags,
        }
    }
}

pub struct ChunkTable {
    chunks: Vec<Chunk>,
    regions: Vec<Arc<GuestRegionMmap>>,
    total_size: u64,
}

impl ChunkTable {
    pub fn new() -> Self {
        ChunkTable {
            chunks: Vec::new(),
            regions: Vec::new(),
            total_size: 0,
        }
    }

    /// Allocate a new chunk of `size` bytes and register it with the hypervisor. Returns
    /// the assigned slot number.
    pub fn add(&mut self, vm: &VmFd, size: u64, flags: u32) -> Result<u32, Error> {
        if size == 0 || size % elkvm_utils::PAGE_SIZE != 0 {
            return Err(Error::UnalignedSize(size));
        }

        let guest_phys_base = self.total_size;
        let slot = self.chunks.len() as u32;

        let mmap_region = MmapRegion::new(size as usize).map_err(|_| Error::HostAlloc(size))?;
        let host_base = mmap_region.as_ptr() as usize;
        let guest_region = GuestRegionMmap::new(mmap_region, GuestAddress(guest_phys_base))?;

        let chunk = Chunk {
            slot,
            guest_phys_base,
            size,
            host_base,
            flags,
        };

        // Safe: `host_base` addresses a `size`-byte anonymous mapping owned by
        // `self.regions` for the lifetime of the VM; KVM only reads/writes within that
        // range, which it is told about here.
        unsafe { vm.set_user_memory_region(chunk.kvm_region()) }
            .map_err(Error::SetUserMemoryRegion)?;

        self.regions.push(Arc::new(guest_region));
        self.chunks.push(chunk);
        self.total_size += size;

        debug!(slot, guest_phys_base, size, "chunk added");
        Ok(slot)
    }

    /// Release the old host allocation backing `slot`, allocate a fresh one of `new_size`,
    /// and re-submit it to the hypervisor at the same guest-physical base. Only supported
    /// for the most recently added chunk: resizing an interior chunk would shift every
    /// chunk after it and break the contiguous, non-overlapping invariant.
    pub fn remap(&mut self, vm: &VmFd, slot: u32, new_size: u64) -> Result<(), Error> {
        let last = self.chunks.len() as u32 - 1;
        if slot != last {
            return Err(Error::RemapNotLastChunk {
                requested: slot,
                last,
            });
        }
        if new_size == 0 || new_size % elkvm_utils::PAGE_SIZE != 0 {
            return Err(Error::UnalignedSize(new_size));
        }

        let old = self.chunks[slot as usize];

        let mut unregister = old.kvm_region();
        unregister.memory_size = 0;
        unsafe { vm.set_user_memory_region(unregister) }.map_err(Error::SetUserMemoryRegion)?;

        let mmap_region = MmapRegion::new(new_size as usize).map_err(|_| Error::HostAlloc(new_size))?;
        let host_base = mmap_region.as_ptr() as usize;
        let guest_region = GuestRegionMmap::new(mmap_region, GuestAddress(old.guest_phys_base))?;

        let new_chunk = Chunk {
            slot,
            guest_phys_base: old.guest_phys_base,
            size: new_size,
            host_base,
            flags: old.flags,
        };
        unsafe { vm.set_user_memory_region(new_chunk.kvm_region()) }
            .map_err(Error::SetUserMemoryRegion)?;

        self.total_size = self.total_size - old.size + new_size;
        self.regions[slot as usize] = Arc::new(guest_region);
        self.chunks[slot as usize] = new_chunk;

        debug!(slot, new_size, "chunk remapped");
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.chunks.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    pub fn get(&self, slot: u32) -> Result<&Chunk, Error> {
        self.chunks
            .get(slot as usize)
            .ok_or(Error::NoSuchChunk(slot))
    }

    pub fn system_chunk(&self) -> &Chunk {
        &self.chunks[SYSTEM_CHUNK_SLOT as usize]
    }

    pub fn find_by_host(&self, host_p: usize) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.contains_host(host_p))
    }

    pub fn find_by_guest_phys(&self, pa: u64) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.contains_guest_phys(pa))
    }

    pub fn host_to_guest_phys(&self, host_p: usize) -> Option<u64> {
        let chunk = self.find_by_host(host_p)?;
        Some(chunk.guest_phys_base + (host_p - chunk.host_base) as u64)
    }

    pub fn guest_phys_to_host(&self, pa: u64) -> Option<usize> {
        let chunk = self.find_by_guest_phys(pa)?;
        Some(chunk.host_base + (pa - chunk.guest_phys_base) as usize)
    }

    /// A bounds-checked volatile slice of `len` bytes starting at guest-physical `pa`.
    /// Returns `Unbacked` if `pa` (or the full span) does not lie within a single chunk —
    /// callers that must cross chunk boundaries (the syscall proxy's scatter/gather path)
    /// clamp their own requests to a chunk at a time before calling this.
    pub fn get_slice(&self, pa: u64, len: usize) -> Result<VolatileSlice, Error> {
        let chunk = self.find_by_guest_phys(pa).ok_or(Error::Unbacked(pa))?;
        let region = &self.regions[chunk.slot as usize];
        let offset = pa - chunk.guest_phys_base;
        region
            .get_slice_fast(offset, len)
            .map_err(|_| Error::Unbacked(pa))
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }
}

impl Default for ChunkTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_ioctls::Kvm;

    fn vm() -> Option<VmFd> {
        let kvm = Kvm::new().ok()?;
        kvm.create_vm().ok()
    }

    #[test]
    fn appended_chunks_are_contiguous() {
        let Some(vmfd) = vm() else { return };
        let mut table = ChunkTable::new();
        let slot0 = table.add(&vmfd, 0x10000, 0).unwrap();
        let slot1 = table.add(&vmfd, 0x20000, 0).unwrap();
        assert_eq!(slot0, 0);
        assert_eq!(slot1, 1);
        assert_eq!(table.get(1).unwrap().guest_phys_base, 0x10000);
        assert_eq!(table.total_size(), 0x30000);
    }

    #[test]
    fn host_roundtrip() {
        let Some(vmfd) = vm() else { return };
        let mut table = ChunkTable::new();
        table.add(&vmfd, 0x10000, 0).unwrap();
        let chunk = *table.get(0).unwrap();
        let host = chunk.host_base + 0x100;
        let pa = table.host_to_guest_phys(host).unwrap();
        assert_eq!(table.guest_phys_to_host(pa).unwrap(), host);
    }

    #[test]
    fn remap_only_allowed_on_last_chunk() {
        let Some(vmfd) = vm() else { return };
        let mut table = ChunkTable::new();
        table.add(&vmfd, 0x10000, 0).unwrap();
        table.add(&vmfd, 0x10000, 0).unwrap();
        assert!(matches!(
            table.remap(&vmfd, 0, 0x20000),
            Err(Error::RemapNotLastChunk { .. })
        ));
    }
}
