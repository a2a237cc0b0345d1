use crate::errors::{Error, Result};
use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Returns the platform memory page size.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// An owned byte block whose base address is a multiple of the memory page
/// size, as required for O_DIRECT transfers and io_uring buffer
/// registration.
///
/// Each block is an independent aligned allocation; dropping one releases
/// only its own memory.
#[derive(Debug)]
pub struct AlignedBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for AlignedBlock {}
unsafe impl Sync for AlignedBlock {}

impl AlignedBlock {
    /// Allocates one zeroed block of exactly one page.
    pub fn new() -> Self {
        Self::with_len(page_size())
    }

    /// Allocates one zeroed page-aligned block of `len` bytes.
    ///
    /// `len` is rounded up to a multiple of the page size so the block stays
    /// usable for O_DIRECT I/O.
    pub fn with_len(len: usize) -> Self {
        let page = page_size();
        let size = len.max(1).div_ceil(page) * page;
        // Page size is always a nonzero power of two, so the layout is valid.
        let layout = Layout::from_size_align(size, page).expect("bad page layout");
        let ptr = match NonNull::new(unsafe { alloc_zeroed(layout) }) {
            Some(ptr) => ptr,
            None => handle_alloc_error(layout),
        };
        Self { ptr, layout }
    }

    /// Allocates a group of `n` page blocks.
    pub fn group(n: usize) -> Result<Vec<AlignedBlock>> {
        if n < 1 {
            return Err(Error::InvalidParam);
        }
        Ok((0..n).map(|_| AlignedBlock::new()).collect())
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Default for AlignedBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for AlignedBlock {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBlock {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBlock {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Fixed-size record classes forming a geometric ladder with ratio 2^3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BufferClass {
    Pico,
    Nano,
    Micro,
    Small,
    Medium,
    Large,
    Huge,
}

impl BufferClass {
    pub const fn size(self) -> usize {
        match self {
            BufferClass::Pico => 8,
            BufferClass::Nano => 64,
            BufferClass::Micro => 512,
            BufferClass::Small => 4096,
            BufferClass::Medium => 32768,
            BufferClass::Large => 262144,
            BufferClass::Huge => 2097152,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_page_size_is_pow2() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert!(page >= 512);
    }

    #[test]
    fn test_single_block() {
        let mut block = AlignedBlock::new();
        assert_eq!(block.len(), page_size());
        assert_eq!(block.as_ptr() as usize % page_size(), 0);
        block[0] = 0xAA;
        let last = block.len() - 1;
        block[last] = 0xBB;
        assert_eq!(block[0], 0xAA);
        assert_eq!(block[last], 0xBB);
    }

    #[test]
    fn test_group_of_zero_blocks() {
        assert_eq!(AlignedBlock::group(0).unwrap_err(), Error::InvalidParam);
    }

    proptest! {
        #[test]
        fn prop_group_blocks_aligned(n in 1usize..32) {
            let blocks = AlignedBlock::group(n).unwrap();
            prop_assert_eq!(blocks.len(), n);
            for block in &blocks {
                prop_assert_eq!(block.len(), page_size());
                prop_assert_eq!(block.as_ptr() as usize % page_size(), 0);
                prop_assert!(block.iter().all(|&b| b == 0));
            }
        }
    }

    #[rstest]
    #[case::pico(BufferClass::Pico, 8)]
    #[case::nano(BufferClass::Nano, 64)]
    #[case::micro(BufferClass::Micro, 512)]
    #[case::small(BufferClass::Small, 4096)]
    #[case::medium(BufferClass::Medium, 32768)]
    #[case::large(BufferClass::Large, 262144)]
    #[case::huge(BufferClass::Huge, 2097152)]
    fn test_ladder_sizes(#[case] class: BufferClass, #[case] size: usize) {
        assert_eq!(class.size(), size);
    }

    #[test]
    fn test_ladder_ratio() {
        let ladder = [
            BufferClass::Pico,
            BufferClass::Nano,
            BufferClass::Micro,
            BufferClass::Small,
            BufferClass::Medium,
            BufferClass::Large,
            BufferClass::Huge,
        ];
        for pair in ladder.windows(2) {
            assert_eq!(pair[1].size(), pair[0].size() << 3);
        }
    }
}
