//! Public API: `Vm`, `VmBuilder`, the default handler table, and the run loop that ties the
//! pager, region allocator, heap, stack, VCPU, and hypercall proxy crates together into a
//! single "libOS in a VM" instance. ELF parsing, GDT/IDT byte encoding, and the
//! ISR/entry/signal flat kernel blobs are supplied by the embedder through [`GuestLoader`]
//! and three fixed-address blob slots — this crate only maps what it is handed, the way
//! `vm_internals.cc`'s `load_flat`/`load_binary` do in the C ancestor of this core.

use elkvm_aspace::{Heap, MappingKind, MmapFlags, NoopMmapHooks, Prot};
use elkvm_chunk::ChunkTable;
use elkvm_pager::{Pager, PtOpts, PAGE_SIZE};
use elkvm_proxy::{DispatchOutcome, Dispatcher, HostSlice, SignalQueue, SyscallArgs, SyscallHandlers};
use elkvm_region::RegionAllocator;
use elkvm_stack::{AuxvEntry, KernelStack, StringTable, UserStack};
use elkvm_vcpu::{LongModeInit, SegmentDesc, Vcpu, VcpuExit};
use kvm_ioctls::{Kvm, VmFd};
use tracing::{debug, debug_span, error, warn};

/// Default kernel stack reserve: the ISR/syscall-trampoline needs very little of its own
/// stack since it only marshals a hypercall and returns.
pub const DEFAULT_KERNEL_STACK_SIZE: u64 = 16 * PAGE_SIZE;
pub const DEFAULT_BRK_BASE: u64 = 0x0000_0000_1000_0000;
pub const DEFAULT_MMAP_BASE: u64 = 0x0000_7000_0000_0000;
const ENVIRONMENT_REGION_SIZE: u64 = 16 * PAGE_SIZE;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("kvm ioctl failed: {0}")]
    Kvm(#[source] kvm_ioctls::Error),
    #[error("chunk table error: {0}")]
    Chunk(#[from] elkvm_chunk::Error),
    #[error("pager error: {0}")]
    Pager(#[from] elkvm_pager::Error),
    #[error("region allocator error: {0}")]
    Region(#[from] elkvm_region::Error),
    #[error("aspace error: {0}")]
    Aspace(#[from] elkvm_aspace::Error),
    #[error("stack error: {0}")]
    Stack(#[from] elkvm_stack::Error),
    #[error("vcpu error: {0}")]
    Vcpu(#[from] elkvm_vcpu::Error),
    #[error("proxy error: {0}")]
    Proxy(#[from] elkvm_proxy::Error),
    #[error("unresolvable guest fault:\n{0}")]
    GuestFault(String),
    #[error("{0} must be set via VmBuilder before build()")]
    MissingBlob(&'static str),
}

/// One ELF-style loadable segment. `data` is copied in and the remainder of `length` (if
/// longer than `data`) is left zeroed, matching a `.bss`-style segment tail.
pub struct LoadSegment {
    pub guest_addr: u64,
    pub data: Vec<u8>,
    pub length: u64,
    pub prot: Prot,
}

/// Descriptor-table bytes and bases the embedder has already encoded; this core only maps
/// them into guest memory and copies the segment registers from them into sregs.
pub struct DescriptorTables {
    pub gdt_base: u64,
    pub gdt_bytes: Vec<u8>,
    pub gdt_limit: u16,
    pub idt_base: u64,
    pub idt_bytes: Vec<u8>,
    pub idt_limit: u16,
    pub code_seg: SegmentDesc,
    pub data_seg: SegmentDesc,
    pub tss_seg: SegmentDesc,
}

/// The embedder-supplied program image and long-mode setup. ELF parsing itself is out of
/// scope; this trait is handed pre-parsed segments and an entry point.
pub trait GuestLoader {
    fn segments(&self) -> Vec<LoadSegment>;
    fn entry_point(&self) -> u64;
    fn descriptor_tables(&self) -> DescriptorTables;
}

/// A fixed-guest-address flat binary image: one of the ISR, syscall-entry, or
/// signal-cleanup blobs. The address is chosen by the embedder, since it
/// must agree with whatever the embedder encoded into the IDT / `LSTAR` expectations.
pub struct FlatBlob {
    pub guest_addr: u64,
    pub bytes: Vec<u8>,
}

/// `read`/`write` wired to the host libc equivalents, `everything else -ENOSYS` — the
/// "transparent pass-through" default table. A full table covering every Linux syscall
/// is the embedder's responsibility; this only covers the two syscalls the proxy already
/// translates buffers for.
pub struct PassthroughHandlers;

impl SyscallHandlers for PassthroughHandlers {
    fn read(&self, fd: i32, bufs: &[HostSlice]) -> i64 {
        host_rw_loop(bufs, |buf| unsafe {
            libc::read(fd, buf.ptr as *mut libc::c_void, buf.len)
        })
    }

    fn write(&self, fd: i32, bufs: &[HostSlice]) -> i64 {
        host_rw_loop(bufs, |buf| unsafe {
            libc::write(fd, buf.ptr as *const libc::c_void, buf.len) as isize
        })
    }

    fn raw(&self, args: &SyscallArgs) -> i64 {
        warn!(nr = args.nr, "unhandled syscall forwarded to raw fallback");
        -(libc::ENOSYS as i64)
    }
}

fn host_rw_loop(bufs: &[HostSlice], mut call: impl FnMut(&HostSlice) -> isize) -> i64 {
    let mut total: i64 = 0;
    for buf in bufs {
        let n = call(buf);
        if n < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
            return if total > 0 { total } else { -(errno as i64) };
        }
        total += n as i64;
        if (n as usize) < buf.len {
            break;
        }
    }
    total
}

/// Builder-pattern configuration surface: validated at
/// [`Self::build`] rather than parsed from a file, since this core has no CLI of its own.
pub struct VmBuilder {
    stack_limit: u64,
    brk_base: u64,
    mmap_base: u64,
    argv: Vec<String>,
    envp: Vec<String>,
    auxv: Vec<AuxvEntry>,
    isr: Option<FlatBlob>,
    entry: Option<FlatBlob>,
    signal: Option<FlatBlob>,
}

impl Default for VmBuilder {
    fn default() -> Self {
        VmBuilder {
            stack_limit: elkvm_stack::DEFAULT_STACK_MAX,
            brk_base: DEFAULT_BRK_BASE,
            mmap_base: DEFAULT_MMAP_BASE,
            argv: Vec::new(),
            envp: Vec::new(),
            auxv: Vec::new(),
            isr: None,
            entry: None,
            signal: None,
        }
    }
}

impl VmBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stack_limit(mut self, limit: u64) -> Self {
        self.stack_limit = limit;
        self
    }

    pub fn brk_base(mut self, addr: u64) -> Self {
        self.brk_base = addr;
        self
    }

    pub fn mmap_base(mut self, addr: u64) -> Self {
        self.mmap_base = addr;
        self
    }

    pub fn arg(mut self, s: impl Into<String>) -> Self {
        self.argv.push(s.into());
        self
    }

    pub fn env(mut self, s: impl Into<String>) -> Self {
        self.envp.push(s.into());
        self
    }

    pub fn auxv_entry(mut self, a_type: u64, a_val: u64) -> Self {
        self.auxv.push(AuxvEntry { a_type, a_val });
        self
    }

    pub fn isr_blob(mut self, guest_addr: u64, bytes: Vec<u8>) -> Self {
        self.isr = Some(FlatBlob { guest_addr, bytes });
        self
    }

    pub fn entry_blob(mut self, guest_addr: u64, bytes: Vec<u8>) -> Self {
        self.entry = Some(FlatBlob { guest_addr, bytes });
        self
    }

    pub fn signal_blob(mut self, guest_addr: u64, bytes: Vec<u8>) -> Self {
        self.signal = Some(FlatBlob { guest_addr, bytes });
        self
    }

    /// Bring up a VM: creates `/dev/kvm` handles, maps the loaded program and flat blobs,
    /// builds the initial stack frame, and brings the VCPU into long mode ready to run.
    pub fn build(
        self,
        loader: &dyn GuestLoader,
        handlers: Box<dyn SyscallHandlers>,
    ) -> Result<Vm, Error> {
        let isr = self.isr.ok_or(Error::MissingBlob("isr_blob"))?;
        let entry = self.entry.ok_or(Error::MissingBlob("entry_blob"))?;
        let signal = self.signal.ok_or(Error::MissingBlob("signal_blob"))?;

        let kvm = Kvm::new().map_err(Error::Kvm)?;
        let vm_fd = kvm.create_vm().map_err(Error::Kvm)?;

        let mut chunks = ChunkTable::new();
        let mut pager = Pager::initialize(&mut chunks, &vm_fd)?;
        let mut regions = RegionAllocator::new();

        if let Ok(supported) = Vcpu::supported_msrs(&kvm) {
            let have = |idx: u32| supported.as_slice().contains(&idx);
            if !(have(elkvm_vcpu::MSR_STAR)
                && have(elkvm_vcpu::MSR_LSTAR)
                && have(elkvm_vcpu::MSR_CSTAR)
                && have(elkvm_vcpu::MSR_SFMASK))
            {
                warn!("host does not report full SYSCALL MSR support");
            }
        }

        let mut vcpu = Vcpu::create(&vm_fd, 0)?;

        let kernel_stack = KernelStack::new(&mut chunks, &mut pager, &mut regions, &vm_fd, DEFAULT_KERNEL_STACK_SIZE)?;
        vcpu.set_kernel_stack_base(kernel_stack.base());

        load_flat_at(&mut chunks, &mut pager, &mut regions, &vm_fd, isr.guest_addr, &isr.bytes)?;
        load_flat_at(&mut chunks, &mut pager, &mut regions, &vm_fd, entry.guest_addr, &entry.bytes)?;
        load_flat_at(&mut chunks, &mut pager, &mut regions, &vm_fd, signal.guest_addr, &signal.bytes)?;

        let tables = loader.descriptor_tables();
        load_flat_at(&mut chunks, &mut pager, &mut regions, &vm_fd, tables.gdt_base, &tables.gdt_bytes)?;
        load_flat_at(&mut chunks, &mut pager, &mut regions, &vm_fd, tables.idt_base, &tables.idt_bytes)?;

        let mut heap = Heap::new(self.brk_base, self.mmap_base);
        for seg in loader.segments() {
            map_segment(&mut chunks, &mut pager, &mut regions, &vm_fd, &mut heap, seg)?;
        }

        let mut user_stack = UserStack::new(&mut chunks, &mut pager, &mut regions, &vm_fd, self.stack_limit)?;
        let strings_addr = user_stack.top() - self.stack_limit - ENVIRONMENT_REGION_SIZE;
        let mut strings = StringTable::new(&mut chunks, &mut pager, &mut regions, &vm_fd, strings_addr, ENVIRONMENT_REGION_SIZE)?;

        let initial_rsp = elkvm_stack::build_initial_frame(
            &mut chunks,
            &mut pager,
            &mut regions,
            &vm_fd,
            &mut user_stack,
            &mut strings,
            &self.argv,
            &self.envp,
            &self.auxv,
        )?;

        let init = LongModeInit {
            gdt_base: tables.gdt_base,
            gdt_limit: tables.gdt_limit,
            idt_base: tables.idt_base,
            idt_limit: tables.idt_limit,
            code_seg: tables.code_seg,
            data_seg: tables.data_seg,
            tss_seg: tables.tss_seg,
            syscall_entry: entry.guest_addr,
            entry_rip: loader.entry_point(),
            initial_rsp,
        };
        vcpu.initialize_long_mode(&init)?;

        debug!(entry = init.entry_rip, rsp = initial_rsp, "vm built and ready to run");

        Ok(Vm {
            chunks,
            pager,
            regions,
            heap,
            user_stack,
            _kernel_stack: kernel_stack,
            vcpu,
            dispatcher: Dispatcher::new(),
            signals: SignalQueue::new(signal.guest_addr),
            handlers,
            vm_fd,
        })
    }
}

fn load_flat_at(
    chunks: &mut ChunkTable,
    pager: &mut Pager,
    regions: &mut RegionAllocator,
    vm: &VmFd,
    guest_addr: u64,
    bytes: &[u8],
) -> Result<(), Error> {
    let size = elkvm_utils::page_round_up(bytes.len().max(1) as u64, PAGE_SIZE);
    let region_id = regions.allocate(chunks, vm, size)?;
    regions.get_mut(region_id)?.set_guest_addr(guest_addr);
    let host_base = regions.get(region_id)?.base_address();

    unsafe {
        std::ptr::write_bytes(host_base as *mut u8, 0, size as usize);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), host_base as *mut u8, bytes.len());
    }

    let pages = size / PAGE_SIZE;
    for i in 0..pages {
        pager.map_user(
            chunks,
            host_base + (i * PAGE_SIZE) as usize,
            guest_addr + i * PAGE_SIZE,
            PtOpts::WRITABLE | PtOpts::EXEC,
        )?;
    }
    Ok(())
}

fn map_segment(
    chunks: &mut ChunkTable,
    pager: &mut Pager,
    regions: &mut RegionAllocator,
    vm: &VmFd,
    heap: &mut Heap,
    seg: LoadSegment,
) -> Result<(), Error> {
    let length = std::cmp::max(seg.length, seg.data.len() as u64);
    heap.mmap(
        chunks,
        pager,
        regions,
        vm,
        seg.guest_addr,
        length,
        Prot::READ | Prot::WRITE,
        MmapFlags::FIXED | MmapFlags::ANONYMOUS | MmapFlags::PRIVATE,
        MappingKind::Anonymous,
        &NoopMmapHooks,
    )?;

    let host = pager.guest_virt_to_host(chunks, seg.guest_addr)?;
    unsafe {
        std::ptr::copy_nonoverlapping(seg.data.as_ptr(), host as *mut u8, seg.data.len());
    }

    if !seg.prot.contains(Prot::WRITE) {
        heap.mprotect(chunks, pager, regions, seg.guest_addr, length, seg.prot)?;
    }
    Ok(())
}

/// A running (or halted) VM instance: the guest address-space substrate plus the VCPU and
/// hypercall proxy driving it.
pub struct Vm {
    chunks: ChunkTable,
    pager: Pager,
    regions: RegionAllocator,
    heap: Heap,
    user_stack: UserStack,
    _kernel_stack: KernelStack,
    vcpu: Vcpu,
    dispatcher: Dispatcher,
    signals: SignalQueue,
    handlers: Box<dyn SyscallHandlers>,
    vm_fd: VmFd,
}

impl Vm {
    /// Queue a host signal for delivery at the next hypercall boundary. No-op if the
    /// guest has not registered a handler for `signo` by the time it is next checked.
    pub fn queue_signal(&mut self, signo: i32) {
        self.signals.enqueue(signo);
    }

    pub fn set_signal_handler(&mut self, signo: i32, guest_addr: Option<u64>) {
        self.signals.set_handler(signo, guest_addr);
    }

    /// Drive the VCPU until `exit_group`, an `EXIT` hypercall, or a fatal fault. Returns the
    /// guest's exit status on a clean termination.
    pub fn run(&mut self) -> Result<i32, Error> {
        let _span = debug_span!("vm_run").entered();
        loop {
            match self.vcpu.run_once()? {
                VcpuExit::Hypercall => match self.step_hypercall()? {
                    Some(code) => return Ok(code),
                    None => continue,
                },
                VcpuExit::Debug => {
                    debug!("guest debug trap");
                    self.vcpu.resume();
                }
                VcpuExit::Fatal(fault) => {
                    let report = self.fault_report(&format!("{:?}", fault));
                    self.vcpu.halt();
                    error!(%report, "fatal vcpu exit");
                    return Err(Error::GuestFault(report));
                }
            }
        }
    }

    fn step_hypercall(&mut self) -> Result<Option<i32>, Error> {
        let dispatched = self.dispatcher.dispatch(
            &mut self.chunks,
            &mut self.pager,
            &mut self.regions,
            &self.vm_fd,
            &mut self.vcpu,
            &mut self.heap,
            &mut self.user_stack,
            &mut self.signals,
            self.handlers.as_ref(),
        );

        match dispatched {
            Ok(DispatchOutcome::Continue) => {
                self.vcpu.advance_past_vmcall()?;
                Ok(None)
            }
            Ok(DispatchOutcome::Exit(code)) => {
                self.vcpu.halt();
                Ok(Some(code))
            }
            Err(elkvm_proxy::Error::UnresolvedFault { address, vector, error_code }) => {
                let report = self.fault_report(&format!(
                    "unresolved fault at {address:#x} (vector {vector:#x}, error code {error_code:#x})"
                ));
                self.vcpu.halt();
                error!(%report, "fatal page fault");
                Err(Error::GuestFault(report))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Build the diagnostic snapshot the fatal-fault path reports: registers, page-table
    /// lookup at `RIP`, and the current stack-growth window. `anyhow`'s context chaining is
    /// used here only, at the outermost embedder-facing diagnostic boundary, then flattened
    /// to a string for the typed `Error::GuestFault` variant.
    fn fault_report(&mut self, cause: &str) -> String {
        let err = anyhow::anyhow!("{cause}")
            .context(self.vcpu.dump_registers())
            .context(self.vcpu.dump_page_tables(&self.chunks, &mut self.pager))
            .context(format!(
                "user stack: lowest_mapped={:#x} top={:#x}",
                self.user_stack.lowest_mapped(),
                self.user_stack.top()
            ));
        format!("{err:#}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyLoader;
    impl GuestLoader for EmptyLoader {
        fn segments(&self) -> Vec<LoadSegment> {
            Vec::new()
        }
        fn entry_point(&self) -> u64 {
            0x0040_0000
        }
        fn descriptor_tables(&self) -> DescriptorTables {
            DescriptorTables {
                gdt_base: 0xFFFF_8000_0010_0000,
                gdt_bytes: vec![0u8; 24],
                gdt_limit: 23,
                idt_base: 0xFFFF_8000_0020_0000,
                idt_bytes: vec![0u8; 16],
                idt_limit: 15,
                code_seg: SegmentDesc {
                    selector: 0x08,
                    type_: 0x0b,
                    present: 1,
                    dpl: 0,
                    db: 0,
                    s: 1,
                    l: 1,
                    g: 1,
                    limit: 0xFFFFF,
                    ..Default::default()
                },
                data_seg: SegmentDesc {
                    selector: 0x10,
                    type_: 0x03,
                    present: 1,
                    s: 1,
                    g: 1,
                    limit: 0xFFFFF,
                    ..Default::default()
                },
                tss_seg: SegmentDesc {
                    selector: 0x18,
                    type_: 0x0b,
                    present: 1,
                    limit: 0x67,
                    ..Default::default()
                },
            }
        }
    }

    fn kvm_available() -> bool {
        Kvm::new().is_ok()
    }

    #[test]
    fn build_succeeds_with_empty_program() {
        if !kvm_available() {
            return;
        }
        let builder = VmBuilder::new()
            .arg("prog")
            .env("HOME=/root")
            .isr_blob(0xFFFF_8000_0030_0000, vec![0xf4]) // hlt
            .entry_blob(0xFFFF_8000_0040_0000, vec![0xf4])
            .signal_blob(0xFFFF_8000_0050_0000, vec![0xf4]);
        let vm = builder.build(&EmptyLoader, Box::new(PassthroughHandlers));
        assert!(vm.is_ok());
    }
}
