//! Per-syscall marshalling: guest-register read, guest-pointer-to-host-pointer
//! translation (including scatter/gather across region/chunk boundaries), and the
//! embedder-facing handler trait.

use elkvm_chunk::ChunkTable;
use elkvm_pager::Pager;

use crate::Error;

/// The six System V argument registers plus the syscall number, read verbatim off the
/// guest register file (`rax, rdi, rsi, rdx, r10, r8, r9`).
#[derive(Debug, Clone, Copy)]
pub struct SyscallArgs {
    pub nr: u64,
    pub arg0: u64,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
    pub arg4: u64,
    pub arg5: u64,
}

impl SyscallArgs {
    pub fn from_regs(regs: &kvm_bindings::kvm_regs) -> Self {
        SyscallArgs {
            nr: regs.rax,
            arg0: regs.rdi,
            arg1: regs.rsi,
            arg2: regs.rdx,
            arg3: regs.r10,
            arg4: regs.r8,
            arg5: regs.r9,
        }
    }
}

/// One contiguous host-memory slice backing part of a guest buffer.
#[derive(Debug, Clone, Copy)]
pub struct HostSlice {
    pub ptr: *mut u8,
    pub len: usize,
}

/// A guest buffer translated to host memory, possibly as more than one contiguous run —
/// the scatter/gather case, where the buffer straddles a region or chunk
/// boundary in host memory even though it is one contiguous run in guest-virtual space.
pub type HostBuf = Vec<HostSlice>;

/// Translate `[guest_addr, guest_addr+len)` into one or more contiguous host slices,
/// splitting wherever the next guest page's host translation is not physically adjacent
/// to the last one. Walks page by page; the first and last slice may be a partial page.
pub fn translate_buffer(
    chunks: &ChunkTable,
    pager: &mut Pager,
    guest_addr: u64,
    len: u64,
) -> Result<HostBuf, Error> {
    if len == 0 {
        return Ok(Vec::new());
    }
    const PAGE: u64 = elkvm_pager::PAGE_SIZE;

    let mut spans: HostBuf = Vec::new();
    let mut remaining = len;
    let mut addr = guest_addr;

    while remaining > 0 {
        let page_base = elkvm_utils::page_round_down(addr, PAGE);
        let page_off = addr - page_base;
        let chunk_len = std::cmp::min(remaining, PAGE - page_off);

        let host = pager.guest_virt_to_host(chunks, addr)?;

        if let Some(last) = spans.last_mut() {
            let expected = unsafe { last.ptr.add(last.len) };
            if expected == host as *mut u8 {
                last.len += chunk_len as usize;
                addr += chunk_len;
                remaining -= chunk_len;
                continue;
            }
        }

        spans.push(HostSlice {
            ptr: host as *mut u8,
            len: chunk_len as usize,
        });
        addr += chunk_len;
        remaining -= chunk_len;
    }

    Ok(spans)
}

/// Embedder-installed handler table. Methods operate on already host-translated buffers;
/// the dispatcher has done the guest-pointer walk and scatter/gather split before calling
/// in. Each method returns a libc-style result: non-negative on success, `-errno` on
/// failure. A default `NoopHandlers` (all slots `-ENOSYS`) is provided for embedders that
/// only need a subset; a full pass-through implementation wiring every slot to host libc
/// is the embedder's responsibility.
pub trait SyscallHandlers {
    /// Scatter/gather read: call host `read`/`pread` once per contiguous host slice,
    /// summing bytes until a short read or the slices are exhausted.
    fn read(&self, fd: i32, bufs: &[HostSlice]) -> i64 {
        let _ = (fd, bufs);
        -(libc::ENOSYS as i64)
    }

    fn write(&self, fd: i32, bufs: &[HostSlice]) -> i64 {
        let _ = (fd, bufs);
        -(libc::ENOSYS as i64)
    }

    /// `readv`/`writev`: each guest `iovec` is itself translated and gathered before
    /// reaching here, so `bufs` is the flattened, in-order list of host slices across all
    /// iovecs.
    fn readv(&self, fd: i32, bufs: &[HostSlice]) -> i64 {
        self.read(fd, bufs)
    }

    fn writev(&self, fd: i32, bufs: &[HostSlice]) -> i64 {
        self.write(fd, bufs)
    }

    /// Anything not individually marshalled by the dispatcher: forwarded with guest
    /// register values completely untranslated, standing in for the opaque
    /// `pass_read`/`pass_write`-style host syscall adapters. An embedder
    /// that needs pointer arguments translated for one of these must still translate them
    /// itself inside its `raw` implementation.
    fn raw(&self, args: &SyscallArgs) -> i64 {
        let _ = args;
        -(libc::ENOSYS as i64)
    }

    /// Called once per hypercall boundary, after dispatch, purely for debug tracing or a
    /// breakpoint table lookup (`bp_callback`); does not affect control flow.
    fn bp_callback(&self, _rip: u64) {}
}

/// All-`ENOSYS` handler table, useful as a base to override piecemeal or in tests.
pub struct NoopHandlers;
impl SyscallHandlers for NoopHandlers {}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_ioctls::Kvm;

    fn setup() -> Option<(ChunkTable, Pager)> {
        let kvm = Kvm::new().ok()?;
        let vm = kvm.create_vm().ok()?;
        let mut chunks = ChunkTable::new();
        let pager = Pager::initialize(&mut chunks, &vm).ok()?;
        Some((chunks, pager))
    }

    #[test]
    fn translate_buffer_zero_length_is_empty_without_touching_the_pager() {
        // len == 0 must short-circuit before any pager lookup, since guest_addr may be
        // garbage (e.g. a null pointer passed to read(fd, NULL, 0)).
        let Some((chunks, mut pager)) = setup() else { return };
        let bufs = translate_buffer(&chunks, &mut pager, 0, 0).unwrap();
        assert!(bufs.is_empty());
    }
}
