// Copyright (C) 2024 Ethan Uppal. All rights reserved.

use std::{fmt, io, mem, ptr, slice};

/// Signature of the code placed in a region: two signed 32-bit arguments
/// in, one out, System V calling convention.
pub type EntryFn = extern "C" fn(i32, i32) -> i32;

/// Protection state of an [`ExecutableRegion`].
///
/// A region is never writable and executable at once. The only way to
/// reach [`Mode::Writable`] or [`Mode::Executable`] is through
/// [`ExecutableRegion::set_writable`] and
/// [`ExecutableRegion::set_executable`], which go through the OS.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// Freshly mapped with no access protection. Nothing is allowed yet.
    Uninitialized,
    /// Mapped read+write. The byte views are available, calling is not.
    Writable,
    /// Mapped read+execute. Calling is available, mutation is not.
    Executable,
}

/// The OS refused to create the backing mapping.
#[derive(Debug)]
pub struct AllocError(pub io::Error);

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mmap failed: {}", self.0)
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// The OS refused to change the protection of the mapping.
#[derive(Debug)]
pub struct ProtectError(pub io::Error);

impl fmt::Display for ProtectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mprotect failed: {}", self.0)
    }
}

impl std::error::Error for ProtectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// One anonymous, process-private mapping whose protection toggles between
/// writable and executable. Unmapped exactly once on drop.
pub struct ExecutableRegion {
    start: *mut u8,
    length: usize,
    mode: Mode,
}

impl ExecutableRegion {
    /// Maps `size` bytes of anonymous private memory, rounded up to the
    /// page size. The fresh mapping is `PROT_NONE` and zero-filled; call
    /// [`Self::set_writable`] before touching it.
    pub fn of_size(size: usize) -> Result<ExecutableRegion, AllocError> {
        unsafe {
            let page_size = {
                let result = libc::sysconf(libc::_SC_PAGESIZE);
                if result == -1 {
                    return Err(AllocError(io::Error::last_os_error()));
                }
                result as usize
            };
            let aligned_length = (size + page_size - 1) & !(page_size - 1);
            let start = libc::mmap(
                ptr::null_mut(),
                aligned_length,
                libc::PROT_NONE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if start == libc::MAP_FAILED {
                return Err(AllocError(io::Error::last_os_error()));
            }
            Ok(ExecutableRegion {
                start: start as *mut u8,
                length: aligned_length,
                mode: Mode::Uninitialized,
            })
        }
    }

    /// Usable size in bytes, fixed at construction.
    pub fn size(&self) -> usize {
        self.length
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Remaps the region read+write.
    pub fn set_writable(&mut self) -> Result<(), ProtectError> {
        self.protect(libc::PROT_READ | libc::PROT_WRITE, Mode::Writable)
    }

    /// Remaps the region read+execute.
    pub fn set_executable(&mut self) -> Result<(), ProtectError> {
        self.protect(libc::PROT_READ | libc::PROT_EXEC, Mode::Executable)
    }

    fn protect(
        &mut self,
        prot: libc::c_int,
        mode: Mode,
    ) -> Result<(), ProtectError> {
        // the region is a single mapping, so a refused change leaves the
        // previous protection (and therefore the previous mode) in effect
        if unsafe {
            libc::mprotect(self.start as *mut libc::c_void, self.length, prot)
        } == -1
        {
            return Err(ProtectError(io::Error::last_os_error()));
        }
        self.mode = mode;
        Ok(())
    }

    /// Read-only view of the region's bytes. Both mapped modes carry
    /// `PROT_READ`; panics while the region is [`Mode::Uninitialized`].
    pub fn as_bytes(&self) -> &[u8] {
        assert!(
            self.mode != Mode::Uninitialized,
            "region is not mapped readable"
        );
        unsafe { slice::from_raw_parts(self.start, self.length) }
    }

    /// Mutable view of the region's bytes, available only in
    /// [`Mode::Writable`].
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        assert!(self.mode == Mode::Writable, "region is not writable");
        unsafe { slice::from_raw_parts_mut(self.start, self.length) }
    }

    /// Calls the start of the region as a native [`EntryFn`].
    ///
    /// This is the one place control transfers into the mapped bytes.
    /// Panics unless the mode is [`Mode::Executable`]; the panic is a
    /// contract check on the caller, not a safety boundary.
    ///
    /// # Safety
    ///
    /// The region must contain machine code implementing [`EntryFn`] for
    /// the host, starting at offset 0.
    pub unsafe fn call(&self, a: i32, b: i32) -> i32 {
        assert!(self.mode == Mode::Executable, "region is not executable");
        let entry: EntryFn = mem::transmute(self.start);
        entry(a, b)
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        // munmap only fails when start/length no longer name a mapping,
        // which this type never allows
        unsafe {
            libc::munmap(self.start as *mut libc::c_void, self.length);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecutableRegion, Mode};

    #[test]
    fn fresh_region_starts_uninitialized() {
        let region =
            ExecutableRegion::of_size(1).expect("mapping should succeed");
        assert_eq!(Mode::Uninitialized, region.mode());
        assert!(region.size() >= 1);
    }

    #[test]
    fn size_rounds_up_to_whole_pages() {
        let one = ExecutableRegion::of_size(1).expect("mapping should succeed");
        let page = one.size();

        let exact =
            ExecutableRegion::of_size(page).expect("mapping should succeed");
        assert_eq!(page, exact.size());

        let spill = ExecutableRegion::of_size(page + 1)
            .expect("mapping should succeed");
        assert_eq!(2 * page, spill.size());
    }

    #[test]
    fn bytes_round_trip_once_writable() {
        let mut region =
            ExecutableRegion::of_size(16).expect("mapping should succeed");
        region.set_writable().expect("mprotect should succeed");
        assert_eq!(Mode::Writable, region.mode());

        region.as_bytes_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&[1, 2, 3, 4], &region.as_bytes()[..4]);
        // anonymous mappings start zero-filled
        assert_eq!(0, region.as_bytes()[4]);
    }

    #[test]
    fn modes_toggle_through_the_os() {
        let mut region =
            ExecutableRegion::of_size(16).expect("mapping should succeed");
        region.set_writable().expect("mprotect should succeed");
        region.set_executable().expect("mprotect should succeed");
        assert_eq!(Mode::Executable, region.mode());
        region.set_writable().expect("mprotect should succeed");
        assert_eq!(Mode::Writable, region.mode());
    }

    #[test]
    #[should_panic(expected = "not writable")]
    fn byte_mutation_requires_writable_mode() {
        let mut region =
            ExecutableRegion::of_size(16).expect("mapping should succeed");
        region.set_executable().expect("mprotect should succeed");
        region.as_bytes_mut();
    }

    #[test]
    #[should_panic(expected = "not mapped readable")]
    fn fresh_region_is_not_readable() {
        let region =
            ExecutableRegion::of_size(16).expect("mapping should succeed");
        region.as_bytes();
    }

    #[test]
    #[should_panic(expected = "not executable")]
    fn writable_region_cannot_be_called() {
        let mut region =
            ExecutableRegion::of_size(16).expect("mapping should succeed");
        region.set_writable().expect("mprotect should succeed");
        unsafe { region.call(0, 0) };
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn calls_into_written_machine_code() {
        // mov eax, 7; ret
        let code = [0xb8, 0x07, 0x00, 0x00, 0x00, 0xc3];

        let mut region =
            ExecutableRegion::of_size(code.len()).expect("mapping should succeed");
        region.set_writable().expect("mprotect should succeed");
        region.as_bytes_mut()[..code.len()].copy_from_slice(&code);
        region.set_executable().expect("mprotect should succeed");

        assert_eq!(7, unsafe { region.call(0, 0) });
    }
}
