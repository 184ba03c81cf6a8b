//! Kernel and user stacks. Ported from the push/pop/expand trio in `stack.c` of the C
//! ancestor of this core, generalized to two independently managed stacks (kernel, for the
//! ISR/syscall trampoline; user, growing on fault from `LINUX_64_STACK_BASE`) and to an
//! ABI frame builder standing in for `environ.cc`'s `Environment::create`.

use elkvm_chunk::ChunkTable;
use elkvm_pager::{Pager, PtOpts, PAGE_SIZE};
use elkvm_region::RegionAllocator;
use kvm_ioctls::VmFd;
use tracing::{debug, trace};

/// 64-bit Linux places the initial stack just below bit 47; mirrors `LINUX_64_STACK_BASE`.
pub const LINUX_64_STACK_BASE: u64 = 0x8000_0000_0000;

/// Default growth cap if the embedder does not override it (matches a typical
/// `RLIMIT_STACK`); see the stack-cap design note.
pub const DEFAULT_STACK_MAX: u64 = 8 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("chunk table error: {0}")]
    Chunk(#[from] elkvm_chunk::Error),
    #[error("pager error: {0}")]
    Pager(#[from] elkvm_pager::Error),
    #[error("region allocator error: {0}")]
    Region(#[from] elkvm_region::Error),
    #[error("user stack exhausted its {0:#x}-byte growth cap")]
    StackOverflow(u64),
    #[error("string table has no room left for a {0}-byte string")]
    StringTableFull(usize),
    #[error("kernel stack underflow/overflow at {0:#x}")]
    KernelStackBounds(u64),
}

/// The downward-growing user stack. Starts with a single mapped page at
/// `LINUX_64_STACK_BASE - PAGE_SIZE`; [`Self::grow`] maps one additional page at a time,
/// bounded by `cap`.
pub struct UserStack {
    lowest_mapped: u64,
    cap_pages: u64,
    regions: Vec<u32>,
}

impl UserStack {
    pub fn new(
        chunks: &mut ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        vm: &VmFd,
        cap: u64,
    ) -> Result<Self, Error> {
        let top_page = LINUX_64_STACK_BASE - PAGE_SIZE;
        let region_id = regions.allocate(chunks, vm, PAGE_SIZE)?;
        regions.get_mut(region_id)?.set_guest_addr(top_page);
        let host = regions.get(region_id)?.base_address();
        pager.map_user(chunks, host, top_page, PtOpts::WRITABLE)?;
        debug!(top_page, "user stack initial page mapped");
        Ok(UserStack {
            lowest_mapped: top_page,
            cap_pages: cap / PAGE_SIZE,
            regions: vec![region_id],
        })
    }

    pub fn lowest_mapped(&self) -> u64 {
        self.lowest_mapped
    }

    pub fn top(&self) -> u64 {
        LINUX_64_STACK_BASE
    }

    /// True if `pfla` lies on the page directly below the lowest currently mapped page,
    /// i.e. this fault should be resolved by [`Self::grow`] rather than treated as fatal.
    pub fn is_stack_expansion(&self, pfla: u64) -> bool {
        let below = self.lowest_mapped.wrapping_sub(PAGE_SIZE);
        pfla >= below && pfla < self.lowest_mapped
    }

    /// Map one additional page directly below the lowest mapped page, writable and
    /// non-executable.
    pub fn grow(
        &mut self,
        chunks: &mut ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        vm: &VmFd,
    ) -> Result<(), Error> {
        if self.regions.len() as u64 >= self.cap_pages {
            return Err(Error::StackOverflow(self.cap_pages * PAGE_SIZE));
        }
        let new_page = self.lowest_mapped - PAGE_SIZE;
        let region_id = regions.allocate(chunks, vm, PAGE_SIZE)?;
        regions.get_mut(region_id)?.set_guest_addr(new_page);
        let host = regions.get(region_id)?.base_address();
        pager.map_user(chunks, host, new_page, PtOpts::WRITABLE)?;
        self.regions.push(region_id);
        self.lowest_mapped = new_page;
        debug!(new_page, "user stack expanded");
        Ok(())
    }

    /// Decrement `rsp` by 8 and store `val`, expanding the stack first if the new address
    /// falls below the lowest mapped page.
    pub fn pushq(
        &mut self,
        chunks: &mut ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        vm: &VmFd,
        rsp: u64,
        val: u64,
    ) -> Result<u64, Error> {
        let new_rsp = rsp - 8;
        if new_rsp < self.lowest_mapped {
            self.grow(chunks, pager, regions, vm)?;
        }
        let host = pager.guest_virt_to_host(chunks, new_rsp)?;
        unsafe { *(host as *mut u64) = val };
        Ok(new_rsp)
    }

    /// Read the 64-bit word at `rsp` and return it along with `rsp + 8`. Does not shrink
    /// the mapped range; pages below the stack pointer stay mapped, matching the
    /// no-coalescing stance the region allocator takes elsewhere.
    pub fn popq(&self, chunks: &ChunkTable, pager: &mut Pager, rsp: u64) -> Result<(u64, u64), Error> {
        let host = pager.guest_virt_to_host(chunks, rsp)?;
        let val = unsafe { *(host as *const u64) };
        Ok((rsp + 8, val))
    }
}

/// Fixed-size kernel-mode stack used by the ISR/syscall trampoline. Lives in the kernel
/// half of guest-virtual address space via [`Pager::map_kernel`] and never grows.
pub struct KernelStack {
    base: u64,
    top: u64,
}

impl KernelStack {
    pub fn new(
        chunks: &mut ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        vm: &VmFd,
        size: u64,
    ) -> Result<Self, Error> {
        let size = elkvm_utils::page_round_up(size, PAGE_SIZE);
        let region_id = regions.allocate(chunks, vm, size)?;
        let host_base = regions.get(region_id)?.base_address();
        let pages = size / PAGE_SIZE;
        let mut base = 0u64;
        for i in 0..pages {
            let addr = pager.map_kernel(chunks, host_base + (i * PAGE_SIZE) as usize, PtOpts::WRITABLE)?;
            if i == 0 {
                base = addr;
            }
        }
        debug!(base, size, "kernel stack mapped");
        Ok(KernelStack {
            base,
            top: base + size,
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn top(&self) -> u64 {
        self.top
    }

    pub fn pushq(&self, chunks: &ChunkTable, pager: &mut Pager, rsp: u64, val: u64) -> Result<u64, Error> {
        let new_rsp = rsp - 8;
        if new_rsp < self.base {
            return Err(Error::KernelStackBounds(new_rsp));
        }
        let host = pager.guest_virt_to_host(chunks, new_rsp)?;
        unsafe { *(host as *mut u64) = val };
        Ok(new_rsp)
    }

    pub fn popq(&self, chunks: &ChunkTable, pager: &mut Pager, rsp: u64) -> Result<(u64, u64), Error> {
        if rsp + 8 > self.top {
            return Err(Error::KernelStackBounds(rsp));
        }
        let host = pager.guest_virt_to_host(chunks, rsp)?;
        let val = unsafe { *(host as *const u64) };
        Ok((rsp + 8, val))
    }
}

/// Backing store for argv/envp string bodies, written from the high end of a dedicated
/// region downward. Only pointers into this table ever go on the stack. Mirrors
/// `EnvRegion::write_str`.
pub struct StringTable {
    host_base: usize,
    guest_base: u64,
    offset: u64,
}

impl StringTable {
    pub fn new(
        chunks: &mut ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        vm: &VmFd,
        guest_addr: u64,
        size: u64,
    ) -> Result<Self, Error> {
        let size = elkvm_utils::page_round_up(size, PAGE_SIZE);
        let region_id = regions.allocate(chunks, vm, size)?;
        regions.get_mut(region_id)?.set_guest_addr(guest_addr);
        let host_base = regions.get(region_id)?.base_address();
        let pages = size / PAGE_SIZE;
        for i in 0..pages {
            pager.map_user(
                chunks,
                host_base + (i * PAGE_SIZE) as usize,
                guest_addr + i * PAGE_SIZE,
                PtOpts::WRITABLE,
            )?;
        }
        Ok(StringTable {
            host_base,
            guest_base: guest_addr,
            offset: size,
        })
    }

    /// Copy `s` (with a trailing NUL) into the table and return its guest address.
    pub fn write_str(&mut self, s: &str) -> Result<u64, Error> {
        let bytes = s.as_bytes();
        let needed = bytes.len() as u64 + 1;
        if needed > self.offset {
            return Err(Error::StringTableFull(bytes.len()));
        }
        let new_offset = self.offset - needed;
        unsafe {
            let dst = (self.host_base as *mut u8).add(new_offset as usize);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            *dst.add(bytes.len()) = 0;
        }
        self.offset = new_offset;
        Ok(self.guest_base + new_offset)
    }
}

/// One auxiliary-vector entry. String-valued types (`AT_PLATFORM`, `AT_EXECFN`) are not
/// represented; binary/ELF loading is handled by the embedder, not this crate.
#[derive(Debug, Clone, Copy)]
pub struct AuxvEntry {
    pub a_type: u64,
    pub a_val: u64,
}

/// Build the initial process frame: auxv (terminator first), envp (null then pointers),
/// argv (null then pointers), argc — laid out top-down on `stack`, with string bodies
/// written into `strings`. Returns the final `RSP`, which points at `argc`.
#[allow(clippy::too_many_arguments)]
pub fn build_initial_frame(
    chunks: &mut ChunkTable,
    pager: &mut Pager,
    regions: &mut RegionAllocator,
    vm: &VmFd,
    stack: &mut UserStack,
    strings: &mut StringTable,
    argv: &[String],
    envp: &[String],
    auxv: &[AuxvEntry],
) -> Result<u64, Error> {
    let mut rsp = stack.top();

    // auxv terminator (type = val = 0) sits at the very top of the frame.
    rsp = stack.pushq(chunks, pager, regions, vm, rsp, 0)?;
    rsp = stack.pushq(chunks, pager, regions, vm, rsp, 0)?;

    for entry in auxv.iter().rev() {
        rsp = stack.pushq(chunks, pager, regions, vm, rsp, entry.a_val)?;
        rsp = stack.pushq(chunks, pager, regions, vm, rsp, entry.a_type)?;
    }

    // envp null terminator, then the pointers in reverse so forward order reads low-to-high.
    rsp = stack.pushq(chunks, pager, regions, vm, rsp, 0)?;
    for s in envp.iter().rev() {
        let ptr = strings.write_str(s)?;
        rsp = stack.pushq(chunks, pager, regions, vm, rsp, ptr)?;
    }

    // argv null terminator, then pointers.
    rsp = stack.pushq(chunks, pager, regions, vm, rsp, 0)?;
    for s in argv.iter().rev() {
        let ptr = strings.write_str(s)?;
        rsp = stack.pushq(chunks, pager, regions, vm, rsp, ptr)?;
    }

    rsp = stack.pushq(chunks, pager, regions, vm, rsp, argv.len() as u64)?;

    trace!(rsp, argc = argv.len(), "initial frame built");
    Ok(rsp)
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn user_stack_starts_with_top_page_mapped() {
        let Some((vm, mut chunks, mut pager, mut regions)) = setup() else {
            return;
        };
        let stack = UserStack::new(&mut chunks, &mut pager, &mut regions, &vm, DEFAULT_STACK_MAX).unwrap();
        assert!(pager.is_present(&chunks, stack.top() - PAGE_SIZE));
        assert!(stack.is_stack_expansion(stack.top() - PAGE_SIZE - 1));
    }

    #[test]
    fn pushq_expands_stack_across_a_page_boundary() {
        let Some((vm, mut chunks, mut pager, mut regions)) = setup() else {
            return;
        };
        let mut stack = UserStack::new(&mut chunks, &mut pager, &mut regions, &vm, DEFAULT_STACK_MAX).unwrap();
        let mut rsp = stack.top();
        for i in 0..(PAGE_SIZE / 8 + 4) {
            rsp = stack.pushq(&mut chunks, &mut pager, &mut regions, &vm, rsp, i).unwrap();
        }
        assert!(pager.is_present(&chunks, stack.top() - 2 * PAGE_SIZE));
        let (_, val) = stack.popq(&chunks, &mut pager, rsp).unwrap();
        assert_eq!(val, PAGE_SIZE / 8 + 3);
    }

    #[test]
    fn growth_past_cap_is_an_error() {
        let Some((vm, mut chunks, mut pager, mut regions)) = setup() else {
            return;
        };
        let mut stack = UserStack::new(&mut chunks, &mut pager, &mut regions, &vm, 2 * PAGE_SIZE).unwrap();
        stack.grow(&mut chunks, &mut pager, &mut regions, &vm).unwrap();
        let err = stack.grow(&mut chunks, &mut pager, &mut regions, &vm).unwrap_err();
        assert!(matches!(err, Error::StackOverflow(_)));
    }

    #[test]
    fn initial_frame_leaves_rsp_at_argc() {
        let Some((vm, mut chunks, mut pager, mut regions)) = setup() else {
            return;
        };
        let mut stack = UserStack::new(&mut chunks, &mut pager, &mut regions, &vm, DEFAULT_STACK_MAX).unwrap();
        let strings_addr = stack.top() - DEFAULT_STACK_MAX - 0x1000;
        let mut strings = StringTable::new(&mut chunks, &mut pager, &mut regions, &vm, strings_addr, 0x1000).unwrap();

        let argv = vec!["prog".to_string()];
        let envp = vec!["HOME=/root".to_string()];
        let auxv = vec![AuxvEntry { a_type: 6, a_val: 0x1000 }]; // AT_PAGESZ

        let rsp = build_initial_frame(
            &mut chunks, &mut pager, &mut regions, &vm, &mut stack, &mut strings, &argv, &envp, &auxv,
        )
        .unwrap();

        let (after_argc, argc) = stack.popq(&chunks, &mut pager, rsp).unwrap();
        assert_eq!(argc, 1);
        let (after_argv0, argv0_ptr) = stack.popq(&chunks, &mut pager, after_argc).unwrap();
        assert!(argv0_ptr >= strings_addr);
        let (_, argv_null) = stack.popq(&chunks, &mut pager, after_argv0).unwrap();
        assert_eq!(argv_null, 0);
    }
}
