//! Thin cross-platform virtual memory reservation used by [`crate::page::Page`].
//! Pages are reserved at [`crate::globals::PAGE_SIZE`] granularity, and
//! reservation failure is reported instead of panicking so the page
//! allocator can turn it into [`crate::error::GcError::AllocationFailure`].

#[cfg(windows)]
pub mod _win {
    use super::*;

    use crate::globals::PAGE_SIZE;
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub const fn uninit() -> Self {
            Self {
                start: null_mut(),
                end: null_mut(),
                size: 0,
            }
        }

        pub fn try_new(size: usize) -> Option<Self> {
            unsafe {
                let mem = VirtualAlloc(
                    null_mut(),
                    size,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                ) as *mut u8;
                if mem.is_null() {
                    return None;
                }
                Some(Self {
                    start: mem,
                    end: mem.add(size),
                    size,
                })
            }
        }

        /// Return a `PAGE_SIZE` aligned pointer within the reservation.
        pub fn aligned(&self) -> *mut u8 {
            let offset = PAGE_SIZE - (self.start as usize) % PAGE_SIZE;
            unsafe { self.start.add(offset % PAGE_SIZE) }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }

        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualFree(page.cast(), size, MEM_DECOMMIT);
            }
        }

        pub const fn size(&self) -> usize {
            self.size
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            if !self.start.is_null() {
                unsafe {
                    VirtualFree(self.start.cast(), 0, MEM_RELEASE);
                }
            }
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    use std::ptr::null_mut;

    use crate::globals::PAGE_SIZE;

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub const fn uninit() -> Self {
            Self {
                start: null_mut(),
                end: null_mut(),
                size: 0,
            }
        }

        pub fn try_new(size: usize) -> Option<Self> {
            unsafe {
                let map = libc::mmap(
                    null_mut(),
                    size as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    return None;
                }
                libc::madvise(map, size, libc::MADV_SEQUENTIAL);
                Some(Self {
                    start: map as *mut u8,
                    end: (map as usize + size) as *mut u8,
                    size,
                })
            }
        }

        /// Return a `PAGE_SIZE` aligned pointer within the reservation.
        pub fn aligned(&self) -> *mut u8 {
            let offset = PAGE_SIZE - (self.start as usize) % PAGE_SIZE;
            unsafe { self.start.add(offset % PAGE_SIZE) }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }

        pub fn dontneed(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
            }
        }

        pub const fn size(&self) -> usize {
            self.size
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            if !self.start.is_null() {
                unsafe {
                    libc::munmap(self.start as *mut _, self.size as _);
                }
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}
