use vm_memory::{ByteValued, GuestMemoryRegion, GuestRegionMmap, MemoryRegionAddress, VolatileSlice};

/// Fast unaligned/volatile accessors over a single [`GuestRegionMmap`]. The chunk table
/// picks which region a guest-physical address falls into; this trait only deals with the
/// offset-within-region access once that lookup has been done, mirroring how the pager's C
/// ancestor always resolves a chunk first and only then indexes into it.
pub trait GuestMemoryExt {
    fn get_slice_fast(
        &self,
        offset: u64,
        len: usize,
    ) -> vm_memory::GuestMemoryResult<VolatileSlice>;

    unsafe fn get_obj_ptr_unaligned<T: ByteValued>(
        &self,
        offset: u64,
    ) -> vm_memory::GuestMemoryResult<*mut T> {
        let vs: VolatileSlice = self.get_slice_fast(offset, std::mem::size_of::<T>())?;
        Ok(vs.ptr_guard_mut().as_ptr() as *mut T)
    }

    fn read_obj_fast<T: ByteValued>(&self, offset: u64) -> vm_memory::GuestMemoryResult<T> {
        let ptr = unsafe { self.get_obj_ptr_unaligned(offset)? };
        Ok(unsafe { std::ptr::read_unaligned(ptr) })
    }

    fn write_obj_fast<T: ByteValued>(
        &self,
        offset: u64,
        val: T,
    ) -> vm_memory::GuestMemoryResult<()> {
        let ptr = unsafe { self.get_obj_ptr_unaligned(offset)? };
        unsafe { std::ptr::write_unaligned(ptr, val) };
        Ok(())
    }
}

impl GuestMemoryExt for GuestRegionMmap {
    fn get_slice_fast(
        &self,
        offset: u64,
        len: usize,
    ) -> vm_memory::GuestMemoryResult<VolatileSlice> {
        self.get_slice(MemoryRegionAddress(offset), len)
    }
}
