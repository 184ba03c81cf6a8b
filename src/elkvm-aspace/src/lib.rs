//! Mapping and heap layer: `mmap`/`munmap`/`mprotect`/`mremap`/`brk` built on top of the
//! region allocator and the pager, matching the semantics (including the two Non-goal
//! corrections — no `popd`-style stack bugs, and no region coalescing) laid out for the
//! heap manager and mapping layer.

use bitflags::bitflags;
use elkvm_chunk::ChunkTable;
use elkvm_pager::{Pager, PtOpts, PAGE_SIZE};
use elkvm_region::RegionAllocator;
use kvm_ioctls::VmFd;
use tracing::debug;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ  = libc::PROT_READ as u32;
        const WRITE = libc::PROT_WRITE as u32;
        const EXEC  = libc::PROT_EXEC as u32;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmapFlags: u32 {
        const FIXED     = libc::MAP_FIXED as u32;
        const ANONYMOUS = libc::MAP_ANONYMOUS as u32;
        const PRIVATE   = libc::MAP_PRIVATE as u32;
        const SHARED    = libc::MAP_SHARED as u32;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MremapFlags: u32 {
        const MAYMOVE = libc::MREMAP_MAYMOVE as u32;
        const FIXED   = libc::MREMAP_FIXED as u32;
    }
}

impl Prot {
    fn to_pt_opts(self) -> PtOpts {
        let mut opts = PtOpts::empty();
        if self.contains(Prot::WRITE) {
            opts |= PtOpts::WRITABLE;
        }
        if self.contains(Prot::EXEC) {
            opts |= PtOpts::EXEC;
        }
        opts
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("chunk table error: {0}")]
    Chunk(#[from] elkvm_chunk::Error),
    #[error("pager error: {0}")]
    Pager(#[from] elkvm_pager::Error),
    #[error("region allocator error: {0}")]
    Region(#[from] elkvm_region::Error),
    #[error("out of memory")]
    NoMemory,
    #[error("no mapping contains guest address {0:#x}")]
    NotMapped(u64),
    #[error("invalid argument")]
    InvalidArgument,
    #[error("host read of backing file failed: {0}")]
    HostIo(#[source] std::io::Error),
}

impl Error {
    /// Negative errno this should be reported to the guest as, per the core's
    /// error-kind-to-`-errno` translation.
    pub fn errno(&self) -> i64 {
        match self {
            Error::NoMemory => -libc::ENOMEM as i64,
            Error::NotMapped(_) | Error::InvalidArgument => -libc::EINVAL as i64,
            Error::HostIo(e) => -(e.raw_os_error().unwrap_or(libc::EIO)) as i64,
            Error::Chunk(_) | Error::Pager(_) | Error::Region(_) => -libc::ENOMEM as i64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    Anonymous,
    FileBacked { fd: i32, offset: i64 },
}

#[derive(Debug, Clone)]
pub struct Mapping {
    pub guest_addr: u64,
    pub length: u64,
    pub prot: Prot,
    pub kind: MappingKind,
    pub backing_region: u32,
}

impl Mapping {
    fn end(&self) -> u64 {
        self.guest_addr + self.length
    }

    fn overlaps(&self, addr: u64, length: u64) -> bool {
        addr < self.end() && addr + length > self.guest_addr
    }
}

/// Hooks the embedder may install around `mmap`, mirroring the handler table's
/// `mmap_before`/`mmap_after` slots. Default implementations are no-ops (transparent
/// pass-through).
pub trait MmapHooks {
    /// Called before installation; may rewrite `addr`/`length`/`prot` in place. Returning a
    /// different `addr`/`length`/`prot` than what was passed in causes the mapping to be
    /// unmapped and re-installed with the new parameters.
    fn mmap_before(&self, addr: u64, length: u64, prot: Prot) -> (u64, u64, Prot) {
        (addr, length, prot)
    }

    fn mmap_after(&self, _mapping: &Mapping) {}
}

pub struct NoopMmapHooks;
impl MmapHooks for NoopMmapHooks {}

/// One brk-growth increment, tracked separately so a later shrink can free exactly the
/// vacated tail without disturbing earlier increments still in use.
#[derive(Debug, Clone, Copy)]
struct BrkRegion {
    region_id: u32,
    guest_addr: u64,
    length: u64,
}

pub struct Heap {
    brk_base: u64,
    brk_current: u64,
    brk_regions: Vec<BrkRegion>,
    mmap_base: u64,
    mmap_next: u64,
    mappings: Vec<Mapping>,
}

impl Heap {
    pub fn new(brk_base: u64, mmap_base: u64) -> Self {
        Heap {
            brk_base,
            brk_current: brk_base,
            brk_regions: Vec::new(),
            mmap_base,
            mmap_next: mmap_base,
            mappings: Vec::new(),
        }
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub fn contains_address(&self, addr: u64) -> bool {
        (addr >= self.brk_base && addr < self.brk_current)
            || self.mappings.iter().any(|m| m.overlaps(addr, 1))
    }

    pub fn find_mapping(&self, addr: u64) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.overlaps(addr, 1))
    }

    fn install_pages(
        &self,
        chunks: &ChunkTable,
        pager: &mut Pager,
        host_base: usize,
        guest_addr: u64,
        length: u64,
        opts: PtOpts,
    ) -> Result<(), Error> {
        let pages = length / PAGE_SIZE;
        for i in 0..pages {
            pager.map_user(
                chunks,
                host_base + (i * PAGE_SIZE) as usize,
                guest_addr + i * PAGE_SIZE,
                opts,
            )?;
        }
        Ok(())
    }

    fn unmap_pages(&self, chunks: &ChunkTable, pager: &mut Pager, guest_addr: u64, length: u64) -> Result<(), Error> {
        let pages = length / PAGE_SIZE;
        for i in 0..pages {
            pager.unmap(chunks, guest_addr + i * PAGE_SIZE)?;
        }
        Ok(())
    }

    /// Remove (or shrink/split) every mapping overlapping `[addr, addr+length)`.
    fn clear_overlap(
        &mut self,
        chunks: &ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        addr: u64,
        length: u64,
    ) -> Result<(), Error> {
        let overlapping: Vec<usize> = self
            .mappings
            .iter()
            .enumerate()
            .filter(|(_, m)| m.overlaps(addr, length))
            .map(|(i, _)| i)
            .collect();

        for idx in overlapping.into_iter().rev() {
            let m = self.mappings[idx].clone();
            self.unmap_pages(chunks, pager, m.guest_addr, m.length)?;
            self.mappings.remove(idx);

            let clip_start = addr.max(m.guest_addr);
            let clip_end = (addr + length).min(m.end());
            let prefix_len = clip_start - m.guest_addr;
            let suffix_len = m.end() - clip_end;
            let middle_len = clip_end - clip_start;

            regions.sub_region(m.backing_region, prefix_len, middle_len, true)?;

            if prefix_len > 0 {
                let prefix_region = regions.sub_region(m.backing_region, 0, prefix_len, false)?;
                regions.get_mut(prefix_region)?.set_guest_addr(m.guest_addr);
                self.install_pages(
                    chunks,
                    pager,
                    regions.get(prefix_region)?.base_address(),
                    m.guest_addr,
                    prefix_len,
                    m.prot.to_pt_opts(),
                )?;
                self.mappings.push(Mapping {
                    guest_addr: m.guest_addr,
                    length: prefix_len,
                    prot: m.prot,
                    kind: m.kind,
                    backing_region: prefix_region,
                });
            }

            if suffix_len > 0 {
                let suffix_offset = prefix_len + middle_len;
                let suffix_region = regions.sub_region(m.backing_region, suffix_offset, suffix_len, false)?;
                regions.get_mut(suffix_region)?.set_guest_addr(clip_end);
                self.install_pages(
                    chunks,
                    pager,
                    regions.get(suffix_region)?.base_address(),
                    clip_end,
                    suffix_len,
                    m.prot.to_pt_opts(),
                )?;
                self.mappings.push(Mapping {
                    guest_addr: clip_end,
                    length: suffix_len,
                    prot: m.prot,
                    kind: m.kind,
                    backing_region: suffix_region,
                });
            }

            regions.retire(m.backing_region)?;

            if prefix_len > 0 || suffix_len > 0 {
                debug!(guest = m.guest_addr, "partial unmap split mapping");
            }
        }
        Ok(())
    }

    pub fn mmap(
        &mut self,
        chunks: &mut ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        vm: &VmFd,
        addr: u64,
        length: u64,
        prot: Prot,
        flags: MmapFlags,
        kind: MappingKind,
        hooks: &dyn MmapHooks,
    ) -> Result<u64, Error> {
        let length = elkvm_utils::page_round_up(length, PAGE_SIZE);

        let (mut addr, mut length, mut prot) = hooks.mmap_before(addr, length, prot);
        loop {
            if flags.contains(MmapFlags::FIXED) {
                self.clear_overlap(chunks, pager, regions, addr, length)?;
            }

            let guest_addr = if flags.contains(MmapFlags::FIXED) {
                addr
            } else {
                let g = self.mmap_next;
                self.mmap_next += length;
                g
            };

            let region_id = regions.allocate(chunks, vm, length)?;
            {
                let region = regions.get_mut(region_id)?;
                region.set_guest_addr(guest_addr);
            }
            let host_base = regions.get(region_id)?.base_address();

            self.install_pages(chunks, pager, host_base, guest_addr, length, prot.to_pt_opts())?;

            if let MappingKind::FileBacked { fd, offset } = kind {
                let n = unsafe {
                    libc::pread(
                        fd,
                        host_base as *mut libc::c_void,
                        length as usize,
                        offset,
                    )
                };
                if n < 0 {
                    return Err(Error::HostIo(std::io::Error::last_os_error()));
                }
            }

            let mapping = Mapping {
                guest_addr,
                length,
                prot,
                kind,
                backing_region: region_id,
            };

            let (new_addr, new_length, new_prot) = hooks.mmap_before(guest_addr, length, prot);
            if new_addr != guest_addr || new_length != length || new_prot != prot {
                // `mmap_before` changed its mind after seeing the resolved address; undo
                // this attempt and retry with the new parameters, per the handler-table
                // contract.
                self.unmap_pages(chunks, pager, guest_addr, length)?;
                regions.free(region_id)?;
                addr = new_addr;
                length = new_length;
                prot = new_prot;
                continue;
            }

            self.mappings.push(mapping.clone());
            hooks.mmap_after(&mapping);
            debug!(guest_addr, length, "mmap installed");
            return Ok(guest_addr);
        }
    }

    /// If `[addr, addr+length)` exactly matches an existing mapping, rewrite its
    /// protection in place. Otherwise split the mapping(s) at `addr` and/or `addr+length`
    /// and apply the new protection only to the middle piece; already-mapped pages
    /// outside the target range keep their page-table entries untouched.
    pub fn mprotect(
        &mut self,
        chunks: &ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        addr: u64,
        length: u64,
        prot: Prot,
    ) -> Result<(), Error> {
        let length = elkvm_utils::page_round_up(length, PAGE_SIZE);
        let opts = prot.to_pt_opts();

        let overlapping: Vec<usize> = self
            .mappings
            .iter()
            .enumerate()
            .filter(|(_, m)| m.overlaps(addr, length))
            .map(|(i, _)| i)
            .collect();
        if overlapping.is_empty() {
            return Err(Error::NotMapped(addr));
        }

        for idx in overlapping.into_iter().rev() {
            let m = self.mappings[idx].clone();

            if m.guest_addr == addr && m.length == length {
                let pages = length / PAGE_SIZE;
                for i in 0..pages {
                    pager.set_protection(chunks, addr + i * PAGE_SIZE, opts)?;
                }
                self.mappings[idx].prot = prot;
                continue;
            }

            self.mappings.remove(idx);
            let clip_start = addr.max(m.guest_addr);
            let clip_end = (addr + length).min(m.end());
            let prefix_len = clip_start - m.guest_addr;
            let suffix_len = m.end() - clip_end;
            let middle_len = clip_end - clip_start;

            let middle_pages = middle_len / PAGE_SIZE;
            for i in 0..middle_pages {
                pager.set_protection(chunks, clip_start + i * PAGE_SIZE, opts)?;
            }
            let middle_region = regions.sub_region(m.backing_region, prefix_len, middle_len, false)?;
            regions.get_mut(middle_region)?.set_guest_addr(clip_start);
            self.mappings.push(Mapping {
                guest_addr: clip_start,
                length: middle_len,
                prot,
                kind: m.kind,
                backing_region: middle_region,
            });

            if prefix_len > 0 {
                let prefix_region = regions.sub_region(m.backing_region, 0, prefix_len, false)?;
                regions.get_mut(prefix_region)?.set_guest_addr(m.guest_addr);
                self.mappings.push(Mapping {
                    guest_addr: m.guest_addr,
                    length: prefix_len,
                    prot: m.prot,
                    kind: m.kind,
                    backing_region: prefix_region,
                });
            }
            if suffix_len > 0 {
                let suffix_offset = prefix_len + middle_len;
                let suffix_region = regions.sub_region(m.backing_region, suffix_offset, suffix_len, false)?;
                regions.get_mut(suffix_region)?.set_guest_addr(clip_end);
                self.mappings.push(Mapping {
                    guest_addr: clip_end,
                    length: suffix_len,
                    prot: m.prot,
                    kind: m.kind,
                    backing_region: suffix_region,
                });
            }

            regions.retire(m.backing_region)?;
        }

        Ok(())
    }

    pub fn munmap(
        &mut self,
        chunks: &ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        addr: u64,
        length: u64,
    ) -> Result<(), Error> {
        let length = elkvm_utils::page_round_up(length, PAGE_SIZE);
        self.clear_overlap(chunks, pager, regions, addr, length)
    }

    pub fn brk(
        &mut self,
        chunks: &mut ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        vm: &VmFd,
        req: u64,
    ) -> Result<u64, Error> {
        if req == 0 {
            return Ok(self.brk_current);
        }
        if req < self.brk_base {
            return Err(Error::InvalidArgument);
        }

        if req < self.brk_current {
            let shrink_from = elkvm_utils::page_round_up(req, PAGE_SIZE);
            self.unmap_pages(chunks, pager, shrink_from, self.brk_current - shrink_from)?;
            self.free_brk_range(regions, shrink_from)?;
            self.brk_current = req;
            return Ok(req);
        }

        let grow_from = elkvm_utils::page_round_up(self.brk_current, PAGE_SIZE);
        let grow_len = elkvm_utils::page_round_up(req - grow_from, PAGE_SIZE);
        if grow_len > 0 {
            let region_id = regions
                .allocate(chunks, vm, grow_len)
                .map_err(|_| Error::NoMemory)?;
            {
                let region = regions.get_mut(region_id)?;
                region.set_guest_addr(grow_from);
            }
            let host_base = regions.get(region_id)?.base_address();
            self.install_pages(
                chunks,
                pager,
                host_base,
                grow_from,
                grow_len,
                PtOpts::WRITABLE,
            )?;
            self.brk_regions.push(BrkRegion {
                region_id,
                guest_addr: grow_from,
                length: grow_len,
            });
        }

        self.brk_current = req;
        Ok(req)
    }

    /// Reclaim the capacity of every tracked brk-growth region wholly at or past
    /// `shrink_from`, and split the one region straddling it into a kept prefix and a
    /// freed suffix, mirroring `clear_overlap`'s prefix/middle/suffix split for `munmap`.
    fn free_brk_range(&mut self, regions: &mut RegionAllocator, shrink_from: u64) -> Result<(), Error> {
        while let Some(last) = self.brk_regions.last().copied() {
            let end = last.guest_addr + last.length;
            if end <= shrink_from {
                break;
            }

            self.brk_regions.pop();

            if last.guest_addr >= shrink_from {
                // Wholly vacated: return the entire region to its free list.
                regions.free(last.region_id)?;
                continue;
            }

            // Straddles the new break: keep the prefix, free the suffix.
            let keep_len = shrink_from - last.guest_addr;
            let vacate_len = last.length - keep_len;
            regions.sub_region(last.region_id, keep_len, vacate_len, true)?;
            let prefix_region = regions.sub_region(last.region_id, 0, keep_len, false)?;
            regions.get_mut(prefix_region)?.set_guest_addr(last.guest_addr);
            regions.retire(last.region_id)?;

            self.brk_regions.push(BrkRegion {
                region_id: prefix_region,
                guest_addr: last.guest_addr,
                length: keep_len,
            });
            break;
        }
        Ok(())
    }

    pub fn mremap(
        &mut self,
        chunks: &mut ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        vm: &VmFd,
        old_addr: u64,
        old_size: u64,
        new_size: u64,
        flags: MremapFlags,
        new_addr: u64,
    ) -> Result<u64, Error> {
        let old_size = elkvm_utils::page_round_up(old_size, PAGE_SIZE);
        let new_size = elkvm_utils::page_round_up(new_size, PAGE_SIZE);

        let idx = self
            .mappings
            .iter()
            .position(|m| m.guest_addr == old_addr && m.length == old_size)
            .ok_or(Error::NotMapped(old_addr))?;

        if new_size <= old_size {
            let shrink_from = old_addr + new_size;
            self.unmap_pages(chunks, pager, shrink_from, old_size - new_size)?;
            self.mappings[idx].length = new_size;
            return Ok(old_addr);
        }

        let grow_len = new_size - old_size;
        let grow_addr = old_addr + old_size;
        let collision = self.mappings.iter().any(|m| m.overlaps(grow_addr, grow_len));

        if !collision && !flags.contains(MremapFlags::FIXED) {
            let region_id = regions.allocate(chunks, vm, grow_len)?;
            {
                let region = regions.get_mut(region_id)?;
                region.set_guest_addr(grow_addr);
            }
            let host_base = regions.get(region_id)?.base_address();
            let opts = self.mappings[idx].prot.to_pt_opts();
            self.install_pages(chunks, pager, host_base, grow_addr, grow_len, opts)?;
            self.mappings[idx].length = new_size;
            return Ok(old_addr);
        }

        if !flags.contains(MremapFlags::MAYMOVE) {
            return Err(Error::NoMemory);
        }

        let target = if flags.contains(MremapFlags::FIXED) {
            new_addr
        } else {
            let g = self.mmap_next;
            self.mmap_next += new_size;
            g
        };

        let mapping = self.mappings[idx].clone();
        let region_id = regions
            .allocate(chunks, vm, new_size)
            .map_err(|_| Error::NoMemory)?;
        {
            let region = regions.get_mut(region_id)?;
            region.set_guest_addr(target);
        }
        let new_host_base = regions.get(region_id)?.base_address();
        let old_host_base = regions.get(mapping.backing_region)?.base_address();

        // Best-effort copy: a file-backed mapping whose pages were never faulted in is
        // still a plain host-memory copy at this point since every page was installed
        // eagerly by `mmap`, so there is nothing more to re-read from the backing fd here.
        unsafe {
            std::ptr::copy_nonoverlapping(
                old_host_base as *const u8,
                new_host_base as *mut u8,
                old_size as usize,
            );
        }

        self.install_pages(
            chunks,
            pager,
            new_host_base,
            target,
            old_size,
            mapping.prot.to_pt_opts(),
        )?;

        self.unmap_pages(chunks, pager, old_addr, old_size)?;
        regions.free(mapping.backing_region)?;

        self.mappings[idx] = Mapping {
            guest_addr: target,
            length: new_size,
            prot: mapping.prot,
            kind: mapping.kind,
            backing_region: region_id,
        };

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elkvm_chunk::ChunkTable;
    use elkvm_pager::Pager;
    use elkvm_region::RegionAllocator;
    use kvm_ioctls::Kvm;

    fn setup() -> Option<(VmFd, ChunkTable, Pager, RegionAllocator)> {
        let kvm = Kvm::new().ok()?;
        let vm = kvm.create_vm().ok()?;
        let mut chunks = ChunkTable::new();
        let pager = Pager::initialize(&mut chunks, &vm).ok()?;
        let regions = RegionAllocator::new();
        Some((vm, chunks, pager, regions))
    }

    #[test]
    fn brk_grows_and_returns_current() {
        let Some((vm, mut chunks, mut pager, mut regions)) = setup() else {
            return;
        };
        let mut heap = Heap::new(0x1000_0000, 0x2000_0000);
        let cur = heap.brk(&mut chunks, &mut pager, &mut regions, &vm, 0).unwrap();
        assert_eq!(cur, 0x1000_0000);

        let grown = heap
            .brk(&mut chunks, &mut pager, &mut regions, &vm, 0x1000_3000)
            .unwrap();
        assert_eq!(grown, 0x1000_3000);
        assert_eq!(
            heap.brk(&mut chunks, &mut pager, &mut regions, &vm, 0).unwrap(),
            0x1000_3000
        );
    }

    #[test]
    fn brk_shrink_then_regrow_reuses_freed_capacity() {
        let Some((vm, mut chunks, mut pager, mut regions)) = setup() else {
            return;
        };
        let mut heap = Heap::new(0x1000_0000, 0x2000_0000);

        heap.brk(&mut chunks, &mut pager, &mut regions, &vm, 0x1000_3000)
            .unwrap();
        assert_eq!(heap.brk_regions.len(), 1);

        // Shrink back to the base: the grown region must be freed, not merely unmapped,
        // and no longer tracked.
        heap.brk(&mut chunks, &mut pager, &mut regions, &vm, 0x1000_0000)
            .unwrap();
        assert!(heap.brk_regions.is_empty());
        let chunk_count_after_shrink = chunks.count();

        // Grow again by the same amount repeatedly; if the first grow's region had
        // leaked, each of these would force a fresh chunk allocation instead of reusing
        // the freed capacity.
        for _ in 0..4 {
            heap.brk(&mut chunks, &mut pager, &mut regions, &vm, 0x1000_0000)
                .unwrap();
            heap.brk(&mut chunks, &mut pager, &mut regions, &vm, 0x1000_3000)
                .unwrap();
        }
        assert_eq!(chunks.count(), chunk_count_after_shrink);
    }

    #[test]
    fn brk_partial_shrink_keeps_prefix_of_last_growth() {
        let Some((vm, mut chunks, mut pager, mut regions)) = setup() else {
            return;
        };
        let mut heap = Heap::new(0x1000_0000, 0x2000_0000);

        heap.brk(&mut chunks, &mut pager, &mut regions, &vm, 0x1000_1000)
            .unwrap();
        heap.brk(&mut chunks, &mut pager, &mut regions, &vm, 0x1000_3000)
            .unwrap();
        assert_eq!(heap.brk_regions.len(), 2);

        // Shrink into the middle of the second growth increment: the first increment
        // must be left untouched, and the second must be split rather than dropped
        // wholesale.
        heap.brk(&mut chunks, &mut pager, &mut regions, &vm, 0x1000_2000)
            .unwrap();
        assert_eq!(heap.brk_regions.len(), 2);
        let kept = heap.brk_regions.last().unwrap();
        assert_eq!(kept.guest_addr, 0x1000_1000);
        assert_eq!(kept.length, 0x1000);
        assert!(regions.get(kept.region_id).is_ok());
    }

    #[test]
    fn mmap_then_munmap_round_trips() {
        let Some((vm, mut chunks, mut pager, mut regions)) = setup() else {
            return;
        };
        let mut heap = Heap::new(0x1000_0000, 0x2000_0000);
        let addr = heap
            .mmap(
                &mut chunks,
                &mut pager,
                &mut regions,
                &vm,
                0,
                0x3000,
                Prot::READ | Prot::WRITE,
                MmapFlags::ANONYMOUS | MmapFlags::PRIVATE,
                MappingKind::Anonymous,
                &NoopMmapHooks,
            )
            .unwrap();
        assert!(heap.find_mapping(addr).is_some());

        heap.munmap(&chunks, &mut pager, &mut regions, addr, 0x3000)
            .unwrap();
        assert!(heap.find_mapping(addr).is_none());
    }

    #[test]
    fn mprotect_middle_page_splits_into_three() {
        let Some((vm, mut chunks, mut pager, mut regions)) = setup() else {
            return;
        };
        let mut heap = Heap::new(0x1000_0000, 0x2000_0000);
        let addr = heap
            .mmap(
                &mut chunks,
                &mut pager,
                &mut regions,
                &vm,
                0,
                3 * 0x1000,
                Prot::READ | Prot::WRITE,
                MmapFlags::ANONYMOUS | MmapFlags::PRIVATE,
                MappingKind::Anonymous,
                &NoopMmapHooks,
            )
            .unwrap();

        heap.mprotect(&chunks, &mut pager, &mut regions, addr + 0x1000, 0x1000, Prot::READ)
            .unwrap();

        let mut sorted: Vec<&Mapping> = heap.mappings().iter().collect();
        sorted.sort_by_key(|m| m.guest_addr);
        assert_eq!(sorted.len(), 3);
        assert_eq!(sorted[0].prot, Prot::READ | Prot::WRITE);
        assert_eq!(sorted[1].prot, Prot::READ);
        assert_eq!(sorted[2].prot, Prot::READ | Prot::WRITE);
    }
}
