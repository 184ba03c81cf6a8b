//! Hypercall dispatch: pop the tag the guest pushed before `VMCALL`, resolve it, and hand
//! control back with `RIP` left exactly three bytes before where the guest re-enters.
//! Ported from `get_hypercall_type`/the syscall switch in `vm_internals.cc`/`syscall.cc`.

use elkvm_aspace::{Heap, MappingKind, MmapFlags, MremapFlags, NoopMmapHooks, Prot};
use elkvm_chunk::ChunkTable;
use elkvm_pager::Pager;
use elkvm_region::RegionAllocator;
use elkvm_stack::UserStack;
use elkvm_vcpu::{FsGs, Vcpu};
use kvm_ioctls::VmFd;
use tracing::{debug, trace, warn};

use crate::signal::SignalQueue;
use crate::syscall::{translate_buffer, HostBuf, SyscallArgs, SyscallHandlers};
use crate::{raw_popq, Error, HypercallTag};

/// What the run loop should do after one hypercall has been serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Continue,
    Exit(i32),
}

const IOVEC_SIZE: u64 = 16;

/// Stateless dispatcher; all mutable state it touches is borrowed in per call, matching the
/// calling convention of every other crate in this core.
#[derive(Default)]
pub struct Dispatcher;

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher
    }

    /// Service exactly one hypercall. The guest must already be stopped at `VMCALL` (i.e.
    /// the caller just got [`elkvm_vcpu::VcpuExit::Hypercall`] from `run_once`); this does
    /// not itself advance `RIP`, so the caller still calls
    /// [`elkvm_vcpu::Vcpu::advance_past_vmcall`] afterwards on `Continue`.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch(
        &self,
        chunks: &mut ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        vm: &VmFd,
        vcpu: &mut Vcpu,
        heap: &mut Heap,
        user_stack: &mut UserStack,
        signals: &mut SignalQueue,
        handlers: &dyn SyscallHandlers,
    ) -> Result<DispatchOutcome, Error> {
        let mut regs = vcpu.read_regs()?;
        let (rsp, tag_val) = raw_popq(chunks, pager, regs.rsp)?;
        let tag = HypercallTag::from_u64(tag_val).ok_or(Error::UnknownHypercallTag(tag_val))?;
        trace!(?tag, "hypercall dispatched");

        let outcome = match tag {
            HypercallTag::Syscall => {
                let args = SyscallArgs::from_regs(&regs);
                let ret = self.dispatch_syscall(
                    chunks, pager, regions, vm, vcpu, heap, user_stack, signals, handlers, &args,
                )?;
                match ret {
                    SyscallResult::Value(v) => {
                        regs.rax = v as u64;
                        regs.rsp = rsp;
                        vcpu.write_regs(&regs)?;
                        DispatchOutcome::Continue
                    }
                    SyscallResult::Exit(code) => DispatchOutcome::Exit(code),
                    SyscallResult::SignalReturn => DispatchOutcome::Continue,
                }
            }
            HypercallTag::Interrupt => {
                let (rsp, vector) = raw_popq(chunks, pager, rsp)?;
                let (rsp, error_code) = raw_popq(chunks, pager, rsp)?;
                self.handle_interrupt(chunks, pager, regions, vm, vcpu, heap, user_stack, vector, error_code)?;
                regs.rsp = rsp;
                vcpu.write_regs(&regs)?;
                DispatchOutcome::Continue
            }
            HypercallTag::Exit => {
                let (_, code) = raw_popq(chunks, pager, rsp)?;
                return Ok(DispatchOutcome::Exit(code as i32));
            }
        };

        if outcome == DispatchOutcome::Continue {
            signals.deliver_pending(chunks, pager, regions, vm, user_stack, vcpu)?;
        }

        handlers.bp_callback(vcpu.read_regs()?.rip);
        Ok(outcome)
    }

    fn handle_interrupt(
        &self,
        chunks: &mut ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        vm: &VmFd,
        vcpu: &mut Vcpu,
        heap: &Heap,
        user_stack: &mut UserStack,
        vector: u64,
        error_code: u64,
    ) -> Result<(), Error> {
        if vector != crate::VECTOR_PAGE_FAULT {
            warn!(vector, error_code, "unhandled interrupt vector delivered as hypercall");
            return Err(Error::UnresolvedFault {
                address: 0,
                vector,
                error_code,
            });
        }

        let sregs = vcpu.read_sregs()?;
        let pfla = sregs.cr2;

        if user_stack.is_stack_expansion(pfla) {
            user_stack.grow(chunks, pager, regions, vm)?;
            debug!(pfla, "resolved page fault by growing user stack");
            return Ok(());
        }

        // `Pager::handle_pagefault` only decides whether the leaf entry is already
        // present; it cannot on its own distinguish a lazy-fill candidate from a genuine
        // protection violation. `Heap::mmap` installs every page of a mapping eagerly at
        // mmap time, so there is no "mapped but not yet installed" state left for a
        // lazy-fill branch to resolve, and a present fault inside a heap mapping is always
        // an access violation (write to read-only, or executing NX; this core does not
        // implement copy-on-write). Either way the fault is unresolved; `heap` is consulted
        // only to make the diagnostic precise about which case this was.
        let outcome = pager.handle_pagefault(chunks, pfla, error_code);
        if outcome == elkvm_pager::PageFaultOutcome::Handled && heap.contains_address(pfla) {
            warn!(pfla, vector, error_code, "access violation inside an installed heap mapping");
        } else {
            warn!(pfla, vector, error_code, ?outcome, "unresolved page fault");
        }
        Err(Error::UnresolvedFault {
            address: pfla,
            vector,
            error_code,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_syscall(
        &self,
        chunks: &mut ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        vm: &VmFd,
        vcpu: &mut Vcpu,
        heap: &mut Heap,
        user_stack: &mut UserStack,
        signals: &mut SignalQueue,
        handlers: &dyn SyscallHandlers,
        args: &SyscallArgs,
    ) -> Result<SyscallResult, Error> {
        let ret = match args.nr {
            crate::SYS_ARCH_PRCTL => self.arch_prctl(chunks, pager, vcpu, args)?,
            crate::SYS_MMAP => self.sys_mmap(chunks, pager, regions, vm, heap, args),
            crate::SYS_MPROTECT => self.sys_mprotect(chunks, pager, regions, heap, args),
            crate::SYS_MUNMAP => self.sys_munmap(chunks, pager, regions, heap, args),
            crate::SYS_BRK => self.sys_brk(chunks, pager, regions, vm, heap, args),
            crate::SYS_MREMAP => self.sys_mremap(chunks, pager, regions, vm, heap, args),
            crate::SYS_READ => {
                let bufs = translate_buffer(chunks, pager, args.arg1, args.arg2)?;
                handlers.read(args.arg0 as i32, &bufs)
            }
            crate::SYS_WRITE => {
                let bufs = translate_buffer(chunks, pager, args.arg1, args.arg2)?;
                handlers.write(args.arg0 as i32, &bufs)
            }
            crate::SYS_READV => {
                let bufs = self.translate_iovecs(chunks, pager, args.arg1, args.arg2)?;
                handlers.readv(args.arg0 as i32, &bufs)
            }
            crate::SYS_WRITEV => {
                let bufs = self.translate_iovecs(chunks, pager, args.arg1, args.arg2)?;
                handlers.writev(args.arg0 as i32, &bufs)
            }
            crate::SYS_RT_SIGRETURN => {
                signals.handle_sigreturn(vcpu)?;
                return Ok(SyscallResult::SignalReturn);
            }
            crate::SYS_EXIT_GROUP => {
                return Ok(SyscallResult::Exit(args.arg0 as i32));
            }
            _ => handlers.raw(args),
        };
        Ok(SyscallResult::Value(ret))
    }

    fn arch_prctl(
        &self,
        chunks: &mut ChunkTable,
        pager: &mut Pager,
        vcpu: &mut Vcpu,
        args: &SyscallArgs,
    ) -> Result<i64, Error> {
        let ret = match args.arg0 {
            crate::ARCH_SET_FS => {
                vcpu.set_segment_base(FsGs::Fs, args.arg1)?;
                0
            }
            crate::ARCH_SET_GS => {
                vcpu.set_segment_base(FsGs::Gs, args.arg1)?;
                0
            }
            crate::ARCH_GET_FS => {
                let base = vcpu.segment_base(FsGs::Fs)?;
                self.write_u64_to_guest(chunks, pager, args.arg1, base)?;
                0
            }
            crate::ARCH_GET_GS => {
                let base = vcpu.segment_base(FsGs::Gs)?;
                self.write_u64_to_guest(chunks, pager, args.arg1, base)?;
                0
            }
            other => {
                warn!(code = other, "unknown arch_prctl code");
                -(libc::EINVAL as i64)
            }
        };
        Ok(ret)
    }

    fn write_u64_to_guest(
        &self,
        chunks: &ChunkTable,
        pager: &mut Pager,
        guest_addr: u64,
        val: u64,
    ) -> Result<(), Error> {
        let host = pager.guest_virt_to_host(chunks, guest_addr)?;
        unsafe { *(host as *mut u64) = val };
        Ok(())
    }

    fn translate_iovecs(
        &self,
        chunks: &ChunkTable,
        pager: &mut Pager,
        iov_base: u64,
        iovcnt: u64,
    ) -> Result<HostBuf, Error> {
        let mut out = HostBuf::new();
        for i in 0..iovcnt {
            let entry_addr = iov_base + i * IOVEC_SIZE;
            let host = pager.guest_virt_to_host(chunks, entry_addr)?;
            let base = unsafe { *(host as *const u64) };
            let len = unsafe { *((host as *const u64).add(1)) };
            out.extend(translate_buffer(chunks, pager, base, len)?);
        }
        Ok(out)
    }

    fn sys_mmap(
        &self,
        chunks: &mut ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        vm: &VmFd,
        heap: &mut Heap,
        args: &SyscallArgs,
    ) -> i64 {
        let prot = Prot::from_bits_truncate(args.arg2 as u32);
        let flags = MmapFlags::from_bits_truncate(args.arg3 as u32);
        let kind = if flags.contains(MmapFlags::ANONYMOUS) {
            MappingKind::Anonymous
        } else {
            MappingKind::FileBacked {
                fd: args.arg4 as i32,
                offset: args.arg5 as i64,
            }
        };
        match heap.mmap(
            chunks, pager, regions, vm, args.arg0, args.arg1, prot, flags, kind, &NoopMmapHooks,
        ) {
            Ok(addr) => addr as i64,
            Err(e) => e.errno(),
        }
    }

    fn sys_mprotect(
        &self,
        chunks: &ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        heap: &mut Heap,
        args: &SyscallArgs,
    ) -> i64 {
        let prot = Prot::from_bits_truncate(args.arg2 as u32);
        match heap.mprotect(chunks, pager, regions, args.arg0, args.arg1, prot) {
            Ok(()) => 0,
            Err(e) => e.errno(),
        }
    }

    fn sys_munmap(
        &self,
        chunks: &ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        heap: &mut Heap,
        args: &SyscallArgs,
    ) -> i64 {
        match heap.munmap(chunks, pager, regions, args.arg0, args.arg1) {
            Ok(()) => 0,
            Err(e) => e.errno(),
        }
    }

    fn sys_brk(
        &self,
        chunks: &mut ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        vm: &VmFd,
        heap: &mut Heap,
        args: &SyscallArgs,
    ) -> i64 {
        match heap.brk(chunks, pager, regions, vm, args.arg0) {
            Ok(addr) => addr as i64,
            Err(e) => e.errno(),
        }
    }

    fn sys_mremap(
        &self,
        chunks: &mut ChunkTable,
        pager: &mut Pager,
        regions: &mut RegionAllocator,
        vm: &VmFd,
        heap: &mut Heap,
        args: &SyscallArgs,
    ) -> i64 {
        let flags = MremapFlags::from_bits_truncate(args.arg3 as u32);
        match heap.mremap(chunks, pager, regions, vm, args.arg0, args.arg1, args.arg2, flags, args.arg4) {
            Ok(addr) => addr as i64,
            Err(e) => e.errno(),
        }
    }
}

enum SyscallResult {
    Value(i64),
    Exit(i32),
    SignalReturn,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_is_zero_sized() {
        assert_eq!(std::mem::size_of::<Dispatcher>(), 0);
    }
}
