//! Signal delivery: a host-queued signal is delivered to the guest by rewriting
//! VCPU state to trampoline into a registered guest handler, with the pre-signal register
//! file saved for `rt_sigreturn` to restore. Ported from `elkvm-signal.h`'s queue plus the
//! cleanup-flat handoff in `vm_internals.cc`.

use std::collections::{HashMap, VecDeque};

use elkvm_chunk::ChunkTable;
use elkvm_pager::Pager;
use elkvm_stack::UserStack;
use elkvm_vcpu::Vcpu;
use kvm_ioctls::VmFd;

use crate::Error;

/// A host signal waiting to be delivered at the next hypercall boundary.
#[derive(Debug, Clone, Copy)]
pub struct PendingSignal {
    pub signo: i32,
}

/// Saved pre-signal register file, restored on `rt_sigreturn`.
#[derive(Debug, Clone, Copy)]
struct SavedFrame {
    regs: kvm_bindings::kvm_regs,
}

pub struct SignalQueue {
    pending: VecDeque<PendingSignal>,
    handlers: HashMap<i32, u64>,
    cleanup_blob: u64,
    saved: Option<SavedFrame>,
}

impl SignalQueue {
    pub fn new(cleanup_blob: u64) -> Self {
        SignalQueue {
            pending: VecDeque::new(),
            handlers: HashMap::new(),
            cleanup_blob,
            saved: None,
        }
    }

    /// Register (or clear, passing `None`) the guest handler address for `signo`.
    pub fn set_handler(&mut self, signo: i32, guest_addr: Option<u64>) {
        match guest_addr {
            Some(addr) => {
                self.handlers.insert(signo, addr);
            }
            None => {
                self.handlers.remove(&signo);
            }
        }
    }

    pub fn enqueue(&mut self, signo: i32) {
        self.pending.push_back(PendingSignal { signo });
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Already inside a handler and awaiting its `rt_sigreturn`.
    pub fn is_in_handler(&self) -> bool {
        self.saved.is_some()
    }

    /// Called once per hypercall boundary, after the current hypercall has been serviced.
    /// If a signal is pending and the guest has registered a handler for it, rewrites the
    /// VCPU's `RIP`/`RDI` to enter the handler and pushes the cleanup-blob return address
    /// onto the user stack, saving the pre-signal register file for later restoration. A
    /// pending signal with no registered handler is dropped (default-ignore policy; the
    /// core does not model default terminating actions — that is the embedder's call via
    /// `exit_group`).
    pub fn deliver_pending(
        &mut self,
        chunks: &mut ChunkTable,
        pager: &mut Pager,
        regions: &mut elkvm_region::RegionAllocator,
        vm: &VmFd,
        user_stack: &mut UserStack,
        vcpu: &mut Vcpu,
    ) -> Result<bool, Error> {
        if self.is_in_handler() {
            return Ok(false);
        }
        let Some(pending) = self.pending.pop_front() else {
            return Ok(false);
        };
        let Some(&handler_addr) = self.handlers.get(&pending.signo) else {
            return Ok(false);
        };

        let mut regs = vcpu.read_regs()?;
        self.saved = Some(SavedFrame { regs });

        let new_rsp = user_stack.pushq(chunks, pager, regions, vm, regs.rsp, self.cleanup_blob)?;

        regs.rsp = new_rsp;
        regs.rip = handler_addr;
        regs.rdi = pending.signo as u64;
        vcpu.write_regs(&regs)?;

        Ok(true)
    }

    /// `rt_sigreturn`: restore the saved pre-signal register file. Errors if called with
    /// no frame saved (guest bug, or a spurious hypercall).
    pub fn handle_sigreturn(&mut self, vcpu: &mut Vcpu) -> Result<(), Error> {
        let frame = self.saved.take().ok_or(Error::NoSignalFrameSaved)?;
        vcpu.write_regs(&frame.regs)?;
        vcpu.resume_after_signal_return();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_signal_is_dropped() {
        let mut q = SignalQueue::new(0x1000);
        q.enqueue(10);
        assert!(q.has_pending());
        // Nothing registered for signal 10; `deliver_pending` would pop and discard it.
        // We only check the bookkeeping here since delivery itself needs a live VM.
        assert!(q.handlers.get(&10).is_none());
    }

    #[test]
    fn set_handler_then_clear() {
        let mut q = SignalQueue::new(0x1000);
        q.set_handler(10, Some(0x5000));
        assert_eq!(q.handlers.get(&10), Some(&0x5000));
        q.set_handler(10, None);
        assert!(q.handlers.get(&10).is_none());
    }
}
