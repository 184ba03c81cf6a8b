//! VCPU: register state, the hypervisor run-loop/exit classification, and long-mode
//! initialization. Ported from the `get_regs`/`set_regs`/`initialize_regs` trio and the
//! `hypercall_exit` constant of `vcpu.h`/`vcpu.cc` in the C ancestor of this core; the
//! `Segment` value object there becomes [`SegmentDesc`], a plain record rather than a class.

use elkvm_chunk::ChunkTable;
use elkvm_pager::Pager;
use kvm_bindings::{kvm_guest_debug, kvm_regs, kvm_segment, kvm_sregs, Msrs, MsrList};
use kvm_ioctls::{VcpuExit as KvmVcpuExit, VcpuFd, VmFd};
use tracing::{debug, debug_span, trace, warn};

/// STAR: segment selectors for `SYSCALL`/`SYSRET`.
pub const MSR_STAR: u32 = 0xC000_0081;
/// LSTAR: guest `RIP` target of `SYSCALL` in 64-bit mode — set to the syscall entry blob.
pub const MSR_LSTAR: u32 = 0xC000_0082;
/// CSTAR: `RIP` target of `SYSCALL` from compatibility mode. Unused (no 32-bit guest
/// support) but still probed/set so `SYSCALL` behaves predictably if ever hit from there.
pub const MSR_CSTAR: u32 = 0xC000_0083;
/// SFMASK: `RFLAGS` bits cleared by `SYSCALL`.
pub const MSR_SFMASK: u32 = 0xC000_0084;
pub const MSR_EFER: u32 = 0xC000_0080;
pub const MSR_FS_BASE: u32 = 0xC000_0100;
pub const MSR_GS_BASE: u32 = 0xC000_0101;
pub const MSR_KERNEL_GS_BASE: u32 = 0xC000_0102;

const EFER_SCE: u64 = 1 << 0;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;
const CR0_PE: u64 = 1 << 0;
const CR0_PG: u64 = 1 << 31;
const CR4_PAE: u64 = 1 << 5;
const CR4_OSFXSR: u64 = 1 << 9;

/// A plain record mirroring one `kvm_segment`; GDT byte layout itself is built by the
/// embedder's loader, this crate only copies the resulting descriptor fields into sregs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentDesc {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
}

impl From<SegmentDesc> for kvm_segment {
    fn from(s: SegmentDesc) -> kvm_segment {
        kvm_segment {
            base: s.base,
            limit: s.limit,
            selector: s.selector,
            type_: s.type_,
            present: s.present,
            dpl: s.dpl,
            db: s.db,
            s: s.s,
            l: s.l,
            g: s.g,
            avl: s.avl,
            unusable: 0,
            padding: 0,
        }
    }
}

/// Everything the embedder's loader must hand over to bring a VCPU into long mode: the
/// descriptor table bases/limits (bytes already written into guest memory by the loader)
/// and the segment descriptors for the four selectors this core cares about.
pub struct LongModeInit {
    pub gdt_base: u64,
    pub gdt_limit: u16,
    pub idt_base: u64,
    pub idt_limit: u16,
    pub code_seg: SegmentDesc,
    pub data_seg: SegmentDesc,
    pub tss_seg: SegmentDesc,
    /// Guest address of the syscall entry trampoline blob; becomes `LSTAR`.
    pub syscall_entry: u64,
    pub entry_rip: u64,
    pub initial_rsp: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("kvm ioctl failed: {0}")]
    Kvm(#[source] kvm_ioctls::Error),
    #[error("chunk table error: {0}")]
    Chunk(#[from] elkvm_chunk::Error),
    #[error("pager error: {0}")]
    Pager(#[from] elkvm_pager::Error),
    #[error("{0} MSRs were rejected by the kernel (wrote {1})")]
    MsrRejected(usize, usize),
    #[error("operation {0} is invalid in state {1:?}")]
    InvalidState(&'static str, VcpuState),
}

/// `NEW -> READY -> RUNNING <-> EXITED -> (RUNNING | HALTED)`, per the VCPU state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    New,
    Ready,
    Running,
    Exited,
    Halted,
}

/// What the run-loop observed on one `KVM_RUN` exit, classified the way the hypercall
/// dispatcher and the fault path expect to consume it. Page faults and `#GP`/`#SS` are not
/// raw KVM exit reasons here: the guest's ISR blob catches them and re-enters the host via
/// the same `INTERRUPT` hypercall path as any other trap, so they surface as `Hypercall`
/// too; only a genuine `KVM_RUN` exit (hypercall instruction, guest debug stop, or
/// something this core has no handler for) reaches this enum directly.
#[derive(Debug)]
pub enum VcpuExit {
    /// The guest executed `VMCALL`. The hypercall tag and payload live on the guest stack;
    /// the caller is expected to pop and dispatch, then advance `RIP` by 3.
    Hypercall,
    /// A guest single-step or breakpoint trap (`KVM_GUESTDBG_*`).
    Debug,
    /// Anything this core does not model: an I/O port access, an MMIO access, a shutdown
    /// (e.g. triple fault), or an internal KVM error. Always fatal.
    Fatal(FatalExit),
}

#[derive(Debug)]
pub enum FatalExit {
    Shutdown,
    UnhandledIo { port: u16, is_write: bool },
    UnhandledMmio { addr: u64 },
    InternalError,
    Unknown,
}

pub struct Vcpu {
    fd: VcpuFd,
    state: VcpuState,
    kernel_stack_base: u64,
    singlestepping: bool,
}

impl Vcpu {
    pub fn create(vm: &VmFd, id: u64) -> Result<Self, Error> {
        let fd = vm.create_vcpu(id).map_err(Error::Kvm)?;
        Ok(Vcpu {
            fd,
            state: VcpuState::New,
            kernel_stack_base: 0,
            singlestepping: false,
        })
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    /// Read every MSR index the host kernel supports, for the startup-time sanity check
    /// that `STAR`/`LSTAR`/`CSTAR`/`SFMASK` are settable before long-mode is committed to
    /// (mirrors `elkvm_dump_valid_msrs`).
    pub fn supported_msrs(kvm: &kvm_ioctls::Kvm) -> Result<MsrList, Error> {
        kvm.get_msr_index_list().map_err(Error::Kvm)
    }

    /// Bring the VCPU into 64-bit long mode and point `LSTAR` at the syscall entry blob.
    /// `kernel_stack_top` is only recorded for diagnostics (`dump_registers`); the kernel
    /// stack itself is owned by `elkvm-stack`.
    pub fn initialize_long_mode(&mut self, init: &LongModeInit) -> Result<(), Error> {
        if self.state != VcpuState::New {
            return Err(Error::InvalidState("initialize_long_mode", self.state));
        }

        let mut sregs = self.fd.get_sregs().map_err(Error::Kvm)?;
        sregs.cs = init.code_seg.into();
        sregs.ds = init.data_seg.into();
        sregs.es = init.data_seg.into();
        sregs.fs = init.data_seg.into();
        sregs.gs = init.data_seg.into();
        sregs.ss = init.data_seg.into();
        sregs.tr = init.tss_seg.into();
        sregs.gdt.base = init.gdt_base;
        sregs.gdt.limit = init.gdt_limit;
        sregs.idt.base = init.idt_base;
        sregs.idt.limit = init.idt_limit;

        sregs.cr0 |= CR0_PE | CR0_PG;
        sregs.cr4 |= CR4_PAE | CR4_OSFXSR;
        sregs.efer |= EFER_LME | EFER_LMA | EFER_SCE;

        self.fd.set_sregs(&sregs).map_err(Error::Kvm)?;

        let msrs = Msrs::from_entries(&[
            kvm_bindings::kvm_msr_entry {
                index: MSR_STAR,
                data: 0,
                ..Default::default()
            },
            kvm_bindings::kvm_msr_entry {
                index: MSR_LSTAR,
                data: init.syscall_entry,
                ..Default::default()
            },
            kvm_bindings::kvm_msr_entry {
                index: MSR_CSTAR,
                data: init.syscall_entry,
                ..Default::default()
            },
            kvm_bindings::kvm_msr_entry {
                index: MSR_SFMASK,
                data: 0,
                ..Default::default()
            },
        ])
        .map_err(|_| Error::MsrRejected(4, 0))?;
        let written = self.fd.set_msrs(&msrs).map_err(Error::Kvm)?;
        if written != 4 {
            return Err(Error::MsrRejected(4, written));
        }

        let regs = kvm_regs {
            rip: init.entry_rip,
            rsp: init.initial_rsp,
            rflags: 0x2, // bit 1 is reserved-as-1
            ..Default::default()
        };
        self.fd.set_regs(&regs).map_err(Error::Kvm)?;

        self.state = VcpuState::Ready;
        debug!(rip = init.entry_rip, rsp = init.initial_rsp, "vcpu initialized for long mode");
        Ok(())
    }

    pub fn read_regs(&self) -> Result<kvm_regs, Error> {
        self.fd.get_regs().map_err(Error::Kvm)
    }

    pub fn write_regs(&mut self, regs: &kvm_regs) -> Result<(), Error> {
        self.fd.set_regs(regs).map_err(Error::Kvm)
    }

    pub fn read_sregs(&self) -> Result<kvm_sregs, Error> {
        self.fd.get_sregs().map_err(Error::Kvm)
    }

    pub fn write_sregs(&mut self, sregs: &kvm_sregs) -> Result<(), Error> {
        self.fd.set_sregs(sregs).map_err(Error::Kvm)
    }

    /// `arch_prctl(ARCH_GET_FS/GS)`: read a segment base directly from sregs rather than
    /// through a host handler.
    pub fn segment_base(&self, which: FsGs) -> Result<u64, Error> {
        let sregs = self.read_sregs()?;
        Ok(match which {
            FsGs::Fs => sregs.fs.base,
            FsGs::Gs => sregs.gs.base,
        })
    }

    /// `arch_prctl(ARCH_SET_FS/GS)`: write a segment base directly into sregs.
    pub fn set_segment_base(&mut self, which: FsGs, base: u64) -> Result<(), Error> {
        let mut sregs = self.read_sregs()?;
        match which {
            FsGs::Fs => sregs.fs.base = base,
            FsGs::Gs => sregs.gs.base = base,
        }
        self.write_sregs(&sregs)
    }

    pub fn set_singlestep(&mut self, on: bool) -> Result<(), Error> {
        let dbg = kvm_guest_debug {
            control: if on {
                kvm_bindings::KVM_GUESTDBG_ENABLE | kvm_bindings::KVM_GUESTDBG_SINGLESTEP
            } else {
                0
            },
            ..Default::default()
        };
        self.fd.set_guest_debug(&dbg).map_err(Error::Kvm)?;
        self.singlestepping = on;
        Ok(())
    }

    pub fn is_singlestepping(&self) -> bool {
        self.singlestepping
    }

    /// Enter the hypervisor once and classify the exit. On `Hypercall`, `RIP` is NOT yet
    /// advanced past the three-byte `VMCALL` — the caller does that after dispatching, per
    /// the "VMCALL is emulated by advancing RIP" rule.
    pub fn run_once(&mut self) -> Result<VcpuExit, Error> {
        if self.state != VcpuState::Ready && self.state != VcpuState::Exited {
            return Err(Error::InvalidState("run_once", self.state));
        }
        self.state = VcpuState::Running;

        let _span = debug_span!("vcpu_run").entered();
        let exit = self.fd.run().map_err(Error::Kvm)?;
        self.state = VcpuState::Exited;

        let classified = match exit {
            KvmVcpuExit::Hypercall => VcpuExit::Hypercall,
            KvmVcpuExit::Debug(_) => VcpuExit::Debug,
            KvmVcpuExit::Shutdown => VcpuExit::Fatal(FatalExit::Shutdown),
            KvmVcpuExit::IoIn(port, _) => {
                VcpuExit::Fatal(FatalExit::UnhandledIo { port, is_write: false })
            }
            KvmVcpuExit::IoOut(port, _) => {
                VcpuExit::Fatal(FatalExit::UnhandledIo { port, is_write: true })
            }
            KvmVcpuExit::MmioRead(addr, _) => VcpuExit::Fatal(FatalExit::UnhandledMmio { addr }),
            KvmVcpuExit::MmioWrite(addr, _) => VcpuExit::Fatal(FatalExit::UnhandledMmio { addr }),
            KvmVcpuExit::InternalError => VcpuExit::Fatal(FatalExit::InternalError),
            other => {
                warn!(?other, "unclassified KVM_RUN exit reason");
                VcpuExit::Fatal(FatalExit::Unknown)
            }
        };
        trace!(?classified, "vcpu exit classified");
        Ok(classified)
    }

    /// Advance `RIP` past the three-byte `VMCALL` instruction, the "emulation" of the
    /// hypercall once the host has finished servicing it, and mark the VCPU runnable again.
    pub fn advance_past_vmcall(&mut self) -> Result<(), Error> {
        let mut regs = self.read_regs()?;
        regs.rip += 3;
        self.write_regs(&regs)?;
        self.state = VcpuState::Ready;
        Ok(())
    }

    pub fn halt(&mut self) {
        self.state = VcpuState::Halted;
    }

    /// Flip back to `Ready` without touching `RIP` — used wherever the exit that just
    /// happened needs no register-level emulation (a debug trap, or a restored signal
    /// frame whose `RIP` was already set by the restore itself).
    pub fn resume(&mut self) {
        self.state = VcpuState::Ready;
    }

    pub fn resume_after_signal_return(&mut self) {
        self.resume();
    }

    /// A register + page-table diagnostic dump for the fatal-fault path.
    /// Kept as a plain function rather than an interactive debugger command (out of scope).
    pub fn dump_registers(&self) -> String {
        let regs = self.fd.get_regs();
        let sregs = self.fd.get_sregs();
        match (regs, sregs) {
            (Ok(r), Ok(s)) => format!(
                "rip={:#018x} rsp={:#018x} rflags={:#018x} rax={:#018x} rdi={:#018x}\n\
                 cr0={:#018x} cr3={:#018x} cr4={:#018x} efer={:#018x}",
                r.rip, r.rsp, r.rflags, r.rax, r.rdi, s.cr0, s.cr3, s.cr4, s.efer
            ),
            _ => "<failed to read vcpu state>".to_string(),
        }
    }

    pub fn dump_page_tables(&self, chunks: &ChunkTable, pager: &mut Pager) -> String {
        let regs = match self.fd.get_regs() {
            Ok(r) => r,
            Err(_) => return "<failed to read vcpu state>".to_string(),
        };
        let present = pager.is_present(chunks, regs.rip);
        format!("rip={:#018x} present={}", regs.rip, present)
    }

    pub fn set_kernel_stack_base(&mut self, base: u64) {
        self.kernel_stack_base = base;
    }

    pub fn kernel_stack_base(&self) -> u64 {
        self.kernel_stack_base
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsGs {
    Fs,
    Gs,
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
    fn new_vcpu_starts_in_new_state() {
        let Some(vmfd) = vm() else { return };
        let vcpu = Vcpu::create(&vmfd, 0).unwrap();
        assert_eq!(vcpu.state(), VcpuState::New);
    }

    #[test]
    fn run_before_ready_is_rejected() {
        let Some(vmfd) = vm() else { return };
        let mut vcpu = Vcpu::create(&vmfd, 0).unwrap();
        assert!(matches!(vcpu.run_once(), Err(Error::InvalidState(..))));
    }

    #[test]
    fn fs_gs_base_roundtrip() {
        let Some(vmfd) = vm() else { return };
        let mut vcpu = Vcpu::create(&vmfd, 0).unwrap();
        vcpu.set_segment_base(FsGs::Fs, 0xdead_beef).unwrap();
        assert_eq!(vcpu.segment_base(FsGs::Fs).unwrap(), 0xdead_beef);
    }
}
