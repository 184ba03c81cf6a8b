//! Four-level (PML4 -> PDPT -> PD -> PT) x86-64 page-table walker and mutator over the
//! chunk table. Ported from the bit-split walk in `pager.c` of the C ancestor of this
//! core: each level consumes 9 bits of the guest-virtual address, with the final 12 bits
//! selecting a byte within the leaf 4 KiB page.

use bitflags::bitflags;
use elkvm_chunk::ChunkTable;
use kvm_ioctls::VmFd;
use tracing::{debug, trace};

pub const PAGE_SIZE: u64 = elkvm_utils::PAGE_SIZE;

const PT_BIT_PRESENT: u64 = 1 << 0;
const PT_BIT_WRITABLE: u64 = 1 << 1;
const PT_BIT_USER: u64 = 1 << 2;
const PT_BIT_NX: u64 = 1 << 63;
const PT_PHYS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Top of the canonical higher half, where kernel-mode mappings (GDT/IDT/TSS/flat blobs,
/// page tables themselves are not mapped here but the flats loaded next to them are) are
/// handed out by `map_kernel`, bump-allocated upward.
pub const KERNEL_SPACE_BOTTOM: u64 = 0xFFFF_8000_0000_0000;

bitflags! {
    /// A `{Writable, Exec}` option set: absence of `WRITABLE` leaves bit 1 clear; absence of
    /// `EXEC` sets NX.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtOpts: u32 {
        const WRITABLE = 1 << 0;
        const EXEC     = 1 << 1;
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("chunk table error: {0}")]
    Chunk(#[from] elkvm_chunk::Error),
    #[error("the system chunk's page-table reserve is exhausted")]
    PageTableReserveExhausted,
    #[error("guest-virtual address {0:#x} is not mapped")]
    NotMapped(u64),
    #[error("host pointer {0:#x} is not backed by any registered chunk")]
    HostNotBacked(usize),
    #[error("host pointer {host:#x} and guest-virtual address {guest:#x} have mismatched page offsets")]
    MisalignedOffsets { host: usize, guest: u64 },
    #[error("guest-virtual address {guest:#x} is already mapped to a different physical page ({existing:#x} != {requested:#x})")]
    MappingConflict {
        guest: u64,
        existing: u64,
        requested: u64,
    },
    #[error("host pointer {0:#x} lies inside the page-table reserve, which cannot be mapped into the guest")]
    HostInPageTableReserve(usize),
}

/// One level of the four-level walk: `(high_bit, low_bit)` of the 9-bit index this level
/// consumes, most significant level first.
const LEVELS: [(u32, u32); 4] = [(47, 39), (38, 30), (29, 21), (20, 12)];

/// Outcome of [`Pager::handle_pagefault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultOutcome {
    /// The faulting address is already installed; the fault needs no further action from
    /// the pager itself (it may still be a protection violation the caller must classify).
    Handled,
    /// Not present and not something the pager alone can resolve.
    Fatal,
}

pub struct Pager {
    host_pml4_p: usize,
    host_next_free_tbl_p: usize,
    host_tbl_reserve_end: usize,
    guest_next_free: u64,
    brk_addr: u64,
}

impl Pager {
    /// Reserve the system chunk's page-table region and zero it. `chunks` must not yet
    /// contain any chunk; this always creates slot 0.
    pub fn initialize(chunks: &mut ChunkTable, vm: &VmFd) -> Result<Self, Error> {
        let slot = chunks.add(vm, elkvm_chunk::SYSTEM_CHUNK_PAGE_TABLE_RESERVE, 0)?;
        debug_assert_eq!(slot, elkvm_chunk::SYSTEM_CHUNK_SLOT);
        let system = chunks.system_chunk();
        let host_pml4_p = system.host_base;

        // SAFETY: `host_pml4_p` addresses exactly `SYSTEM_CHUNK_PAGE_TABLE_RESERVE` freshly
        // mmap'd bytes owned by the chunk we just created.
        unsafe {
            std::ptr::write_bytes(
                host_pml4_p as *mut u8,
                0,
                elkvm_chunk::SYSTEM_CHUNK_PAGE_TABLE_RESERVE as usize,
            );
        }

        debug!(host_pml4_p, "pager initialized");
        Ok(Pager {
            host_pml4_p,
            host_next_free_tbl_p: host_pml4_p + PAGE_SIZE as usize,
            host_tbl_reserve_end: host_pml4_p
                + elkvm_chunk::SYSTEM_CHUNK_PAGE_TABLE_RESERVE as usize,
            guest_next_free: KERNEL_SPACE_BOTTOM,
            brk_addr: 0,
        })
    }

    fn create_table(&mut self) -> Result<usize, Error> {
        if self.host_next_free_tbl_p + PAGE_SIZE as usize > self.host_tbl_reserve_end {
            return Err(Error::PageTableReserveExhausted);
        }
        let table = self.host_next_free_tbl_p;
        unsafe { std::ptr::write_bytes(table as *mut u8, 0, PAGE_SIZE as usize) };
        self.host_next_free_tbl_p += PAGE_SIZE as usize;
        Ok(table)
    }

    fn find_table_entry(table_base: usize, guest_virtual: u64, low: u32, high: u32) -> *mut u64 {
        let off = elkvm_utils::extract_bits_64!(guest_virtual, low, high - low + 1);
        (table_base as *mut u64).wrapping_add(off as usize)
    }

    /// Walk the four levels for `guest_virtual`, returning a pointer to the level-1 (leaf)
    /// entry. Missing intermediate tables are allocated from the bump cursor when `create`
    /// is set; an intermediate entry that is present but narrower than what this request
    /// needs (write requested over read-only, or exec requested over NX) is *widened*,
    /// never narrowed, matching the walker's original semantics.
    pub fn walk(
        &mut self,
        chunks: &ChunkTable,
        guest_virtual: u64,
        opts: PtOpts,
        create: bool,
    ) -> Result<*mut u64, Error> {
        let mut table_base = self.host_pml4_p;

        for (i, &(high, low)) in LEVELS.iter().enumerate() {
            let entry_ptr = Self::find_table_entry(table_base, guest_virtual, low, high);
            let entry = unsafe { *entry_ptr };
            let present = entry & PT_BIT_PRESENT != 0;
            let is_leaf = i == LEVELS.len() - 1;

            if is_leaf {
                return Ok(entry_ptr);
            }

            if !present {
                if !create {
                    return Err(Error::NotMapped(guest_virtual));
                }
                let new_table_host = self.create_table()?;
                let new_table_phys = chunks
                    .host_to_guest_phys(new_table_host)
                    .ok_or(Error::HostNotBacked(new_table_host))?;
                let mut value = (new_table_phys & !0xFFF) | PT_BIT_USER | PT_BIT_PRESENT;
                if opts.contains(PtOpts::WRITABLE) {
                    value |= PT_BIT_WRITABLE;
                }
                if !opts.contains(PtOpts::EXEC) {
                    value |= PT_BIT_NX;
                }
                unsafe { *entry_ptr = value };
                table_base = new_table_host;
            } else {
                let mut value = entry;
                if create && opts.contains(PtOpts::WRITABLE) && value & PT_BIT_WRITABLE == 0 {
                    value |= PT_BIT_WRITABLE;
                }
                if create && opts.contains(PtOpts::EXEC) && value & PT_BIT_NX != 0 {
                    value &= !PT_BIT_NX;
                }
                if value != entry {
                    unsafe { *entry_ptr = value };
                }
                let table_phys = value & PT_PHYS_MASK;
                table_base = chunks
                    .guest_phys_to_host(table_phys)
                    .ok_or(Error::HostNotBacked(table_phys as usize))?;
            }
        }

        unreachable!("loop always returns at the leaf level")
    }

    fn create_entry(entry_ptr: *mut u64, guest_phys: u64, opts: PtOpts) {
        let mut value = guest_phys & !0xFFF;
        value |= PT_BIT_USER;
        if opts.contains(PtOpts::WRITABLE) {
            value |= PT_BIT_WRITABLE;
        }
        if !opts.contains(PtOpts::EXEC) {
            value |= PT_BIT_NX;
        }
        value |= PT_BIT_PRESENT;
        unsafe { *entry_ptr = value };
    }

    /// Map `host_p` (a host pointer inside a registered, non-page-table chunk) at guest
    /// address `guest_virt`. Re-mapping the same (host, guest) pair with matching physical
    /// bits is a no-op; mapping a different physical page at an already-mapped `guest_virt`
    /// is an error.
    pub fn map_user(
        &mut self,
        chunks: &ChunkTable,
        host_p: usize,
        guest_virt: u64,
        opts: PtOpts,
    ) -> Result<(), Error> {
        let system = chunks.system_chunk();
        if host_p >= system.host_base && host_p < self.host_tbl_reserve_end {
            return Err(Error::HostInPageTableReserve(host_p));
        }
        if host_p & 0xFFF != guest_virt as usize & 0xFFF {
            return Err(Error::MisalignedOffsets {
                host: host_p,
                guest: guest_virt,
            });
        }
        let guest_phys = chunks
            .host_to_guest_phys(host_p)
            .ok_or(Error::HostNotBacked(host_p))?;

        let entry_ptr = self.walk(chunks, guest_virt, opts, true)?;
        let existing = unsafe { *entry_ptr };
        if existing & PT_BIT_PRESENT != 0 {
            let existing_phys = existing & PT_PHYS_MASK;
            let requested_phys = guest_phys & !0xFFF;
            if existing_phys != requested_phys {
                return Err(Error::MappingConflict {
                    guest: guest_virt,
                    existing: existing_phys,
                    requested: requested_phys,
                });
            }
            trace!(guest_virt, "re-map of identical physical page is a no-op");
            return Ok(());
        }

        Self::create_entry(entry_ptr, guest_phys, opts);
        Ok(())
    }

    /// Assign the next free kernel-half guest-virtual address to `host_p` and map it.
    /// Returns the assigned address.
    pub fn map_kernel(
        &mut self,
        chunks: &ChunkTable,
        host_p: usize,
        opts: PtOpts,
    ) -> Result<u64, Error> {
        let guest_phys = chunks
            .host_to_guest_phys(host_p)
            .ok_or(Error::HostNotBacked(host_p))?;

        let mut guest_virtual = (self.guest_next_free & !0xFFF) | (guest_phys & 0xFFF);
        loop {
            match self.walk(chunks, guest_virtual, PtOpts::empty(), false) {
                Ok(entry_ptr) if unsafe { *entry_ptr } & PT_BIT_PRESENT != 0 => {
                    guest_virtual += PAGE_SIZE;
                }
                _ => break,
            }
        }

        let entry_ptr = self.walk(chunks, guest_virtual, opts, true)?;
        Self::create_entry(entry_ptr, guest_phys, opts);
        self.guest_next_free = guest_virtual + PAGE_SIZE;
        Ok(guest_virtual)
    }

    /// Clear the leaf entry for `guest_virt`, if present. No-op if already unmapped.
    pub fn unmap(&mut self, chunks: &ChunkTable, guest_virt: u64) -> Result<(), Error> {
        match self.walk(chunks, guest_virt, PtOpts::empty(), false) {
            Ok(entry_ptr) => {
                unsafe { *entry_ptr = 0 };
                Ok(())
            }
            Err(Error::NotMapped(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn is_present(&mut self, chunks: &ChunkTable, guest_virt: u64) -> bool {
        match self.walk(chunks, guest_virt, PtOpts::empty(), false) {
            Ok(entry_ptr) => unsafe { *entry_ptr } & PT_BIT_PRESENT != 0,
            Err(_) => false,
        }
    }

    /// Pager-local slice of page-fault resolution: is `pfla` already backed by a present
    /// leaf entry? The Pager alone cannot decide the other two spec-documented resolution
    /// paths (growing a user stack's guard window, lazily installing a file-backed
    /// mapping's pages) since those require state (`UserStack`, `Heap`) that lives in
    /// crates layered on top of this one and cannot be depended on here without an import
    /// cycle. Callers compose this with their own higher-level checks before concluding a
    /// fault is fatal; see `elkvm-proxy`'s hypercall dispatch.
    pub fn handle_pagefault(&mut self, chunks: &ChunkTable, pfla: u64, _err_code: u64) -> PageFaultOutcome {
        if self.is_present(chunks, pfla) {
            debug!(pfla, "page fault address already present, nothing to resolve");
            PageFaultOutcome::Handled
        } else {
            PageFaultOutcome::Fatal
        }
    }

    pub fn guest_virt_to_host(&mut self, chunks: &ChunkTable, guest_virt: u64) -> Result<usize, Error> {
        let entry_ptr = self.walk(chunks, guest_virt, PtOpts::empty(), false)?;
        let entry = unsafe { *entry_ptr };
        if entry & PT_BIT_PRESENT == 0 {
            return Err(Error::NotMapped(guest_virt));
        }
        let guest_phys = (entry & PT_PHYS_MASK) | (guest_virt & 0xFFF);
        chunks
            .guest_phys_to_host(guest_phys)
            .ok_or(Error::HostNotBacked(guest_phys as usize))
    }

    /// Rewrite an already-present leaf entry's protection bits in place, widening any
    /// intermediate table entries that need it along the way. Used by `mprotect`, which
    /// (unlike `map_user`) is allowed to narrow a leaf's permissions.
    pub fn set_protection(
        &mut self,
        chunks: &ChunkTable,
        guest_virt: u64,
        opts: PtOpts,
    ) -> Result<(), Error> {
        let entry_ptr = self.walk(chunks, guest_virt, opts, true)?;
        let entry = unsafe { *entry_ptr };
        if entry & PT_BIT_PRESENT == 0 {
            return Err(Error::NotMapped(guest_virt));
        }
        let mut value = entry & (PT_PHYS_MASK | PT_BIT_PRESENT | PT_BIT_USER);
        if opts.contains(PtOpts::WRITABLE) {
            value |= PT_BIT_WRITABLE;
        }
        if !opts.contains(PtOpts::EXEC) {
            value |= PT_BIT_NX;
        }
        unsafe { *entry_ptr = value };
        Ok(())
    }

    pub fn set_brk(&mut self, addr: u64) {
        self.brk_addr = addr;
    }

    pub fn brk(&self) -> u64 {
        self.brk_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_ioctls::Kvm;

    fn setup() -> Option<(VmFd, ChunkTable, Pager)> {
        let kvm = Kvm::new().ok()?;
        let vm = kvm.create_vm().ok()?;
        let mut chunks = ChunkTable::new();
        let pager = Pager::initialize(&mut chunks, &vm).ok()?;
        Some((vm, chunks, pager))
    }

    #[test]
    fn map_and_resolve_user_page() {
        let Some((vm, mut chunks, mut pager)) = setup() else {
            return;
        };
        chunks.add(&vm, 64 * 1024 * 1024, 0).unwrap();
        let user_chunk = *chunks.get(1).unwrap();
        let host_p = user_chunk.host_base + 0x1000;

        pager
            .map_user(&chunks, host_p, 0x0040_0000, PtOpts::WRITABLE)
            .unwrap();

        assert_eq!(pager.guest_virt_to_host(&chunks, 0x0040_0000).unwrap(), host_p);
        assert!(pager.is_present(&chunks, 0x0040_0000));
    }

    #[test]
    fn remap_same_physical_page_is_noop() {
        let Some((vm, mut chunks, mut pager)) = setup() else {
            return;
        };
        chunks.add(&vm, 64 * 1024 * 1024, 0).unwrap();
        let user_chunk = *chunks.get(1).unwrap();
        let host_p = user_chunk.host_base + 0x2000;

        pager
            .map_user(&chunks, host_p, 0x0050_0000, PtOpts::WRITABLE)
            .unwrap();
        pager
            .map_user(&chunks, host_p, 0x0050_0000, PtOpts::empty())
            .unwrap();
        assert!(pager.is_present(&chunks, 0x0050_0000));
    }

    #[test]
    fn remap_conflicting_physical_page_errors() {
        let Some((vm, mut chunks, mut pager)) = setup() else {
            return;
        };
        chunks.add(&vm, 64 * 1024 * 1024, 0).unwrap();
        let user_chunk = *chunks.get(1).unwrap();

        pager
            .map_user(&chunks, user_chunk.host_base, 0x0060_0000, PtOpts::WRITABLE)
            .unwrap();
        let err = pager
            .map_user(
                &chunks,
                user_chunk.host_base + 0x1000,
                0x0060_0000,
                PtOpts::WRITABLE,
            )
            .unwrap_err();
        assert!(matches!(err, Error::MappingConflict { .. }));
    }

    #[test]
    fn handle_pagefault_present_page_is_handled() {
        let Some((vm, mut chunks, mut pager)) = setup() else {
            return;
        };
        chunks.add(&vm, 64 * 1024 * 1024, 0).unwrap();
        let user_chunk = *chunks.get(1).unwrap();
        pager
            .map_user(&chunks, user_chunk.host_base, 0x0080_0000, PtOpts::WRITABLE)
            .unwrap();

        assert_eq!(
            pager.handle_pagefault(&chunks, 0x0080_0000, 0),
            PageFaultOutcome::Handled
        );
    }

    #[test]
    fn handle_pagefault_unmapped_address_is_fatal() {
        let Some((vm, mut chunks, mut pager)) = setup() else {
            return;
        };
        chunks.add(&vm, 64 * 1024 * 1024, 0).unwrap();
        assert_eq!(
            pager.handle_pagefault(&chunks, 0x0090_0000, 0),
            PageFaultOutcome::Fatal
        );
    }

    #[test]
    fn unmap_clears_presence() {
        let Some((vm, mut chunks, mut pager)) = setup() else {
            return;
        };
        chunks.add(&vm, 64 * 1024 * 1024, 0).unwrap();
        let user_chunk = *chunks.get(1).unwrap();
        pager
            .map_user(&chunks, user_chunk.host_base, 0x0070_0000, PtOpts::WRITABLE)
            .unwrap();
        pager.unmap(&chunks, 0x0070_0000).unwrap();
        assert!(!pager.is_present(&chunks, 0x0070_0000));
    }
}
