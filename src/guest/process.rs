//! The guest address-space manager and its host seams.
//!
//! [`GuestVm`] owns the ordered section set and implements the six memory
//! primitives by splitting each request across the sections that cover it.
//! The actual host operations go through [`HostAddressSpace`]:
//! [`LocalAddressSpace`] acts on the calling process (in-process guests and
//! tests), [`RemoteProcess`] acts on a spawned guest through
//! `process_vm_readv`/`process_vm_writev` and the in-guest agent channel.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::io::{IoSliceMut, Read};
use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::process::{Child, Command};
use std::ptr::NonNull;
use std::sync::Arc;

use libc::c_void;
use log::debug;
use nix::sys::mman::{MapFlags, ProtFlags, mlock, mmap, mprotect, munlock, munmap};
use nix::sys::signal::{Signal, kill};
use nix::sys::uio::{RemoteIoVec, process_vm_readv, process_vm_writev};
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};

use crate::error::{LxError, LxResult};
use crate::rpc::GuestAgent;

use super::section::Section;
use super::{
    AllocationFlags, GuestArchitecture, ProtectionFlags, align_down, align_up,
    allocation_granularity,
};

fn host_err(err: nix::errno::Errno) -> LxError {
    LxError::from_host(io::Error::from_raw_os_error(err as i32))
}

fn vm_err(err: nix::errno::Errno) -> LxError {
    if err == nix::errno::Errno::EFAULT {
        LxError::INVALID_ADDRESS
    } else {
        host_err(err)
    }
}

/// The host primitives the manager drives for one guest address space.
pub trait HostAddressSpace: Send + Sync {
    /// Maps a fully committed section object at `address` (0 lets the host
    /// choose) with no access, returning the base address.
    fn map_section(
        &self,
        fd: BorrowedFd<'_>,
        address: usize,
        length: usize,
        flags: AllocationFlags,
    ) -> LxResult<usize>;

    fn unmap_section(&self, address: usize, length: usize) -> LxResult<()>;

    fn protect(&self, address: usize, length: usize, protection: ProtectionFlags) -> LxResult<()>;

    fn lock(&self, address: usize, length: usize) -> LxResult<()>;

    fn unlock(&self, address: usize, length: usize) -> LxResult<()>;

    fn read(&self, address: usize, buffer: &mut [u8]) -> LxResult<usize>;

    fn write(&self, address: usize, buffer: &[u8]) -> LxResult<usize>;
}

fn protection_to_host(protection: ProtectionFlags) -> ProtFlags {
    // Guard pages have no direct host equivalent; a guarded range simply
    // stays inaccessible until re-protected.
    if protection.contains(ProtectionFlags::GUARD) {
        return ProtFlags::PROT_NONE;
    }

    let mut prot = ProtFlags::PROT_NONE;
    if protection.contains(ProtectionFlags::READ) {
        prot |= ProtFlags::PROT_READ;
    }
    if protection.contains(ProtectionFlags::WRITE) {
        prot |= ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
    }
    if protection.contains(ProtectionFlags::EXECUTE) {
        prot |= ProtFlags::PROT_EXEC;
    }
    prot
}

/// The calling process as an address space.
#[derive(Debug)]
pub struct LocalAddressSpace {
    pid: Pid,
}

impl LocalAddressSpace {
    pub fn new() -> LocalAddressSpace {
        LocalAddressSpace { pid: Pid::this() }
    }
}

impl Default for LocalAddressSpace {
    fn default() -> Self {
        LocalAddressSpace::new()
    }
}

impl HostAddressSpace for LocalAddressSpace {
    fn map_section(
        &self,
        fd: BorrowedFd<'_>,
        address: usize,
        length: usize,
        _flags: AllocationFlags,
    ) -> LxResult<usize> {
        let length = NonZeroUsize::new(length).ok_or(LxError::INVAL)?;
        let mut map_flags = MapFlags::MAP_SHARED;
        if address != 0 {
            map_flags |= MapFlags::MAP_FIXED_NOREPLACE;
        }

        let mapping = unsafe {
            mmap(
                NonZeroUsize::new(address),
                length,
                ProtFlags::PROT_NONE,
                map_flags,
                fd,
                0,
            )
        }
        .map_err(host_err)?;
        Ok(mapping.as_ptr() as usize)
    }

    fn unmap_section(&self, address: usize, length: usize) -> LxResult<()> {
        let mapping = NonNull::new(address as *mut c_void).ok_or(LxError::INVAL)?;
        unsafe { munmap(mapping, length) }.map_err(host_err)
    }

    fn protect(&self, address: usize, length: usize, protection: ProtectionFlags) -> LxResult<()> {
        let mapping = NonNull::new(address as *mut c_void).ok_or(LxError::INVAL)?;
        unsafe { mprotect(mapping, length, protection_to_host(protection)) }.map_err(host_err)
    }

    fn lock(&self, address: usize, length: usize) -> LxResult<()> {
        let mapping = NonNull::new(address as *mut c_void).ok_or(LxError::INVAL)?;
        unsafe { mlock(mapping, length) }.map_err(host_err)
    }

    fn unlock(&self, address: usize, length: usize) -> LxResult<()> {
        let mapping = NonNull::new(address as *mut c_void).ok_or(LxError::INVAL)?;
        unsafe { munlock(mapping, length) }.map_err(host_err)
    }

    fn read(&self, address: usize, buffer: &mut [u8]) -> LxResult<usize> {
        let len = buffer.len();
        process_vm_readv(
            self.pid,
            &mut [IoSliceMut::new(buffer)],
            &[RemoteIoVec { base: address, len }],
        )
        .map_err(vm_err)
    }

    fn write(&self, address: usize, buffer: &[u8]) -> LxResult<usize> {
        process_vm_writev(
            self.pid,
            &[io::IoSlice::new(buffer)],
            &[RemoteIoVec {
                base: address,
                len: buffer.len(),
            }],
        )
        .map_err(vm_err)
    }
}

/// A spawned guest process as an address space.
///
/// Data transfer goes straight through `process_vm_*`; mapping, protection
/// and locking are executed inside the guest by its agent stub.
pub struct RemoteProcess {
    pid: Pid,
    agent: Box<dyn GuestAgent>,
}

impl RemoteProcess {
    pub fn new(pid: Pid, agent: Box<dyn GuestAgent>) -> RemoteProcess {
        RemoteProcess { pid, agent }
    }
}

impl std::fmt::Debug for RemoteProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcess").field("pid", &self.pid).finish()
    }
}

impl HostAddressSpace for RemoteProcess {
    fn map_section(
        &self,
        fd: BorrowedFd<'_>,
        address: usize,
        length: usize,
        flags: AllocationFlags,
    ) -> LxResult<usize> {
        self.agent.map_section(fd, address, length, flags)
    }

    fn unmap_section(&self, address: usize, length: usize) -> LxResult<()> {
        self.agent.unmap_section(address, length)
    }

    fn protect(&self, address: usize, length: usize, protection: ProtectionFlags) -> LxResult<()> {
        self.agent.protect(address, length, protection)
    }

    fn lock(&self, address: usize, length: usize) -> LxResult<()> {
        self.agent.lock(address, length)
    }

    fn unlock(&self, address: usize, length: usize) -> LxResult<()> {
        self.agent.unlock(address, length)
    }

    fn read(&self, address: usize, buffer: &mut [u8]) -> LxResult<usize> {
        let len = buffer.len();
        process_vm_readv(
            self.pid,
            &mut [IoSliceMut::new(buffer)],
            &[RemoteIoVec { base: address, len }],
        )
        .map_err(vm_err)
    }

    fn write(&self, address: usize, buffer: &[u8]) -> LxResult<usize> {
        process_vm_writev(
            self.pid,
            &[io::IoSlice::new(buffer)],
            &[RemoteIoVec {
                base: address,
                len: buffer.len(),
            }],
        )
        .map_err(vm_err)
    }
}

/// Splits `[start, start+length)` across the covering sections, failing
/// with `E_INVALID_ADDRESS` if any part of the range is uncovered.
fn for_each_span<F>(
    sections: &BTreeMap<usize, Section>,
    start: usize,
    length: usize,
    mut op: F,
) -> LxResult<()>
where
    F: FnMut(&Section, usize, usize) -> LxResult<()>,
{
    let end = start.checked_add(length).ok_or(LxError::INVAL)?;
    let mut cursor = start;

    for section in sections.values() {
        if cursor >= end {
            break;
        }
        if section.end() <= cursor {
            continue;
        }
        if cursor < section.base() {
            return Err(LxError::INVALID_ADDRESS);
        }

        let span_end = section.end().min(end);
        op(section, cursor, span_end - cursor)?;
        cursor = section.end();
    }

    if cursor < end {
        return Err(LxError::INVALID_ADDRESS);
    }
    Ok(())
}

/// Like [`for_each_span`], with mutable access to each section's bitmap.
fn for_each_span_mut<F>(
    sections: &mut BTreeMap<usize, Section>,
    start: usize,
    length: usize,
    mut op: F,
) -> LxResult<()>
where
    F: FnMut(&mut Section, usize, usize) -> LxResult<()>,
{
    let end = start.checked_add(length).ok_or(LxError::INVAL)?;
    let mut cursor = start;

    for section in sections.values_mut() {
        if cursor >= end {
            break;
        }
        if section.end() <= cursor {
            continue;
        }
        if cursor < section.base() {
            return Err(LxError::INVALID_ADDRESS);
        }

        let span_end = section.end().min(end);
        op(section, cursor, span_end - cursor)?;
        cursor = section.end();
    }

    if cursor < end {
        return Err(LxError::INVALID_ADDRESS);
    }
    Ok(())
}

fn ensure_allocated(section: &Section, address: usize, length: usize) -> LxResult<()> {
    if !section
        .bitmap
        .all_set(section.page_of(address), Section::pages_for(length))
    {
        return Err(LxError::INVALID_ADDRESS);
    }
    Ok(())
}

/// The section-based virtual address-space manager for one guest.
///
/// Write lock for operations that change the section set or a bitmap
/// (reserve, allocate, release); read lock for the rest.
pub struct GuestVm {
    space: Arc<dyn HostAddressSpace>,
    sections: RwLock<BTreeMap<usize, Section>>,
}

impl GuestVm {
    pub fn new(space: Arc<dyn HostAddressSpace>) -> GuestVm {
        GuestVm {
            space,
            sections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Reserves address space at a host-chosen base.
    pub fn reserve(&self, length: usize, flags: AllocationFlags) -> LxResult<usize> {
        let length = align_up(length, allocation_granularity());
        if length == 0 {
            return Err(LxError::INVAL);
        }

        let mut sections = self.sections.write();
        let section = Section::create(self.space.clone(), 0, length, flags)?;
        let base = section.base();
        sections.insert(base, section);
        Ok(base)
    }

    /// Ensures `[address, address+length)` is reserved, filling any gaps
    /// with new sections, and returns the original address.
    pub fn reserve_at(&self, address: usize, length: usize) -> LxResult<usize> {
        if address == 0 {
            return self.reserve(length, AllocationFlags::empty());
        }

        let mut sections = self.sections.write();
        self.reserve_range(&mut sections, address, length)?;
        Ok(address)
    }

    fn reserve_range(
        &self,
        sections: &mut BTreeMap<usize, Section>,
        address: usize,
        length: usize,
    ) -> LxResult<()> {
        let granularity = allocation_granularity();
        let start = align_down(address, granularity);
        let end = align_up(
            address.checked_add(length).ok_or(LxError::INVAL)?,
            granularity,
        );

        // Find the gaps first; the set cannot change mid-iteration.
        let mut cursor = start;
        let mut gaps: Vec<(usize, usize)> = Vec::new();
        for section in sections.values() {
            if cursor >= end {
                break;
            }
            if section.end() <= cursor {
                continue;
            }
            if cursor < section.base() {
                let gap_end = end.min(section.base());
                gaps.push((cursor, gap_end - cursor));
            }
            cursor = cursor.max(section.end());
        }
        if cursor < end {
            gaps.push((cursor, end - cursor));
        }

        for (base, gap_length) in gaps {
            let section = Section::create(
                self.space.clone(),
                base,
                gap_length,
                AllocationFlags::empty(),
            )?;
            sections.insert(section.base(), section);
        }
        Ok(())
    }

    /// Allocates at a host-chosen base: a fresh section, protected and
    /// marked soft-allocated in full.
    pub fn allocate(
        &self,
        length: usize,
        protection: ProtectionFlags,
        flags: AllocationFlags,
    ) -> LxResult<usize> {
        let length = align_up(length, allocation_granularity());
        if length == 0 {
            return Err(LxError::INVAL);
        }

        let mut sections = self.sections.write();
        let mut section = Section::create(self.space.clone(), 0, length, flags)?;
        self.space.protect(section.base(), length, protection)?;
        section.bitmap.set_range(0, Section::pages_for(length));

        let base = section.base();
        sections.insert(base, section);
        Ok(base)
    }

    /// Allocates `[address, address+length)`: reserves whatever is missing,
    /// applies the protection and sets the allocation bitmaps.
    pub fn allocate_at(
        &self,
        address: usize,
        length: usize,
        protection: ProtectionFlags,
    ) -> LxResult<usize> {
        if address == 0 {
            return self.allocate(length, protection, AllocationFlags::empty());
        }

        let mut sections = self.sections.write();
        self.reserve_range(&mut sections, address, length)?;

        let space = &self.space;
        for_each_span_mut(&mut sections, address, length, |section, addr, len| {
            space.protect(addr, len, protection)?;
            section
                .bitmap
                .set_range(section.page_of(addr), Section::pages_for(len));
            Ok(())
        })?;
        Ok(address)
    }

    /// Changes protection on an already-allocated range.
    pub fn protect(
        &self,
        address: usize,
        length: usize,
        protection: ProtectionFlags,
    ) -> LxResult<()> {
        let sections = self.sections.read();
        for_each_span(&sections, address, length, |section, addr, len| {
            ensure_allocated(section, addr, len)?;
            self.space.protect(addr, len, protection)
        })
    }

    /// Locks an allocated range into physical memory.
    pub fn lock(&self, address: usize, length: usize) -> LxResult<()> {
        let sections = self.sections.read();
        for_each_span(&sections, address, length, |section, addr, len| {
            ensure_allocated(section, addr, len)?;
            self.space.lock(addr, len)
        })
    }

    /// Unlocks an allocated range.
    pub fn unlock(&self, address: usize, length: usize) -> LxResult<()> {
        let sections = self.sections.read();
        for_each_span(&sections, address, length, |section, addr, len| {
            ensure_allocated(section, addr, len)?;
            self.space.unlock(addr, len)
        })
    }

    /// Reads from the guest into `buffer`, accumulating across sections.
    pub fn read(&self, address: usize, buffer: &mut [u8]) -> LxResult<usize> {
        let sections = self.sections.read();
        let mut total = 0usize;
        for_each_span(&sections, address, buffer.len(), |section, addr, len| {
            ensure_allocated(section, addr, len)?;
            let offset = addr - address;
            total += self.space.read(addr, &mut buffer[offset..offset + len])?;
            Ok(())
        })?;
        Ok(total)
    }

    /// Writes `buffer` into the guest, accumulating across sections.
    pub fn write(&self, address: usize, buffer: &[u8]) -> LxResult<usize> {
        let sections = self.sections.read();
        let mut total = 0usize;
        for_each_span(&sections, address, buffer.len(), |section, addr, len| {
            ensure_allocated(section, addr, len)?;
            let offset = addr - address;
            total += self.space.write(addr, &buffer[offset..offset + len])?;
            Ok(())
        })?;
        Ok(total)
    }

    /// Releases a range: protection back to no-access (sections cannot be
    /// decommitted), best-effort unlock, bitmap cleared. Sections left with
    /// no allocated pages are unmapped and closed.
    pub fn release(&self, address: usize, length: usize) -> LxResult<()> {
        let mut sections = self.sections.write();
        let space = &self.space;

        for_each_span_mut(&mut sections, address, length, |section, addr, len| {
            space.protect(addr, len, ProtectionFlags::empty())?;
            // Unlocking pages that were never locked fails; that is fine.
            let _ = space.unlock(addr, len);
            section
                .bitmap
                .clear_range(section.page_of(addr), Section::pages_for(len));
            Ok(())
        })?;

        sections.retain(|_, section| !section.bitmap.is_empty());
        Ok(())
    }

    /// Number of live sections.
    pub fn section_count(&self) -> usize {
        self.sections.read().len()
    }
}

impl Drop for GuestVm {
    fn drop(&mut self) {
        // Dropping the set releases every remaining section.
        self.sections.write().clear();
    }
}

impl std::fmt::Debug for GuestVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestVm")
            .field("sections", &self.section_count())
            .finish()
    }
}

/// Reads the ELF class byte of the guest binary; the executable loader
/// proper lives elsewhere.
fn detect_architecture(binary: &Path) -> LxResult<GuestArchitecture> {
    let mut ident = [0u8; 5];
    File::open(binary)
        .and_then(|mut file| file.read_exact(&mut ident))
        .map_err(LxError::from_host)?;

    if &ident[..4] != b"\x7fELF" {
        return Err(LxError::INVAL);
    }
    match ident[4] {
        1 => Ok(GuestArchitecture::X86),
        2 => Ok(GuestArchitecture::X86_64),
        _ => Err(LxError::INVAL),
    }
}

/// A native host process executing a guest, plus its managed address
/// space.
pub struct GuestProcess {
    // Declared before `child`: teardown releases the sections before the
    // process handle.
    vm: GuestVm,
    pid: Pid,
    architecture: GuestArchitecture,
    child: Mutex<Option<Child>>,
}

impl GuestProcess {
    /// Spawns the guest binary suspended and wires up its address space.
    pub fn spawn(binary: &Path, args: &[String], agent: Box<dyn GuestAgent>) -> LxResult<GuestProcess> {
        let architecture = detect_architecture(binary)?;

        let child = Command::new(binary)
            .args(args)
            .spawn()
            .map_err(LxError::from_host)?;
        let pid = Pid::from_raw(child.id() as i32);
        kill(pid, Signal::SIGSTOP).map_err(host_err)?;

        debug!("guest {} spawned suspended ({:?})", pid, architecture);
        let space = Arc::new(RemoteProcess::new(pid, agent));
        Ok(GuestProcess {
            vm: GuestVm::new(space),
            pid,
            architecture,
            child: Mutex::new(Some(child)),
        })
    }

    pub fn vm(&self) -> &GuestVm {
        &self.vm
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn architecture(&self) -> GuestArchitecture {
        self.architecture
    }

    pub fn suspend(&self) -> LxResult<()> {
        kill(self.pid, Signal::SIGSTOP).map_err(host_err)
    }

    pub fn resume(&self) -> LxResult<()> {
        kill(self.pid, Signal::SIGCONT).map_err(host_err)
    }

    /// Terminates the guest, optionally waiting for it to exit.
    pub fn terminate(&self, wait: bool) -> LxResult<()> {
        kill(self.pid, Signal::SIGKILL).map_err(host_err)?;
        if wait {
            if let Some(mut child) = self.child.lock().take() {
                let _ = child.wait();
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for GuestProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestProcess")
            .field("pid", &self.pid)
            .field("architecture", &self.architecture)
            .field("vm", &self.vm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::mman::mmap_anonymous;

    fn local_vm() -> GuestVm {
        GuestVm::new(Arc::new(LocalAddressSpace::new()))
    }

    /// Finds a free, contiguous address range by mapping and immediately
    /// unmapping an anonymous region. Nothing else maps between the unmap
    /// and the caller's fixed reservation in these single-threaded tests.
    fn free_range(length: usize) -> usize {
        let mapping = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(length).unwrap(),
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .unwrap();
        unsafe { munmap(mapping, length) }.unwrap();
        mapping.as_ptr() as usize
    }

    #[test]
    fn reserve_allocate_write_read_release() {
        let vm = local_vm();
        let base = vm.reserve(128 << 10, AllocationFlags::empty()).unwrap();
        assert_eq!(vm.section_count(), 1);

        // Soft-allocate the first half read-write.
        vm.allocate_at(
            base,
            64 << 10,
            ProtectionFlags::READ | ProtectionFlags::WRITE,
        )
        .unwrap();

        let pattern: Vec<u8> = (0..(64usize << 10)).map(|i| (i % 256) as u8).collect();
        assert_eq!(vm.write(base, &pattern).unwrap(), pattern.len());

        let mut readback = vec![0u8; pattern.len()];
        assert_eq!(vm.read(base, &mut readback).unwrap(), pattern.len());
        assert_eq!(readback, pattern);

        // The second half is reserved but not allocated.
        let mut buf = [0u8; 16];
        assert_eq!(
            vm.read(base + (64 << 10), &mut buf).unwrap_err(),
            LxError::INVALID_ADDRESS
        );

        vm.release(base, 128 << 10).unwrap();
        assert_eq!(vm.section_count(), 0);
    }

    #[test]
    fn protect_read_only_blocks_remote_writes() {
        let vm = local_vm();
        let base = vm
            .allocate(
                64 << 10,
                ProtectionFlags::READ | ProtectionFlags::WRITE,
                AllocationFlags::empty(),
            )
            .unwrap();

        vm.write(base, &[0xAB; 4096]).unwrap();

        // Drop write access on the middle 32 KiB.
        let middle = base + (16 << 10);
        vm.protect(middle, 32 << 10, ProtectionFlags::READ).unwrap();

        let err = vm.write(middle, &[0xCD; 4096]).unwrap_err();
        assert_eq!(err, LxError::INVALID_ADDRESS);

        // Reading it still works.
        let mut buf = [0u8; 4096];
        vm.read(base, &mut buf).unwrap();
        assert_eq!(buf[0], 0xAB);

        vm.release(base, 64 << 10).unwrap();
    }

    #[test]
    fn uncovered_ranges_are_invalid() {
        let vm = local_vm();
        let base = vm.reserve(16 << 10, AllocationFlags::empty()).unwrap();

        assert_eq!(
            vm.protect(base, 16 << 10, ProtectionFlags::READ).unwrap_err(),
            LxError::INVALID_ADDRESS
        );
        assert_eq!(
            vm.lock(base, 4096).unwrap_err(),
            LxError::INVALID_ADDRESS
        );

        let mut buf = [0u8; 8];
        assert_eq!(vm.read(base, &mut buf).unwrap_err(), LxError::INVALID_ADDRESS);

        vm.release(base, 16 << 10).unwrap();
    }

    #[test]
    fn reservation_fills_only_the_gaps() {
        let vm = local_vm();
        let base = free_range(48 << 10);
        vm.reserve_at(base, 32 << 10).unwrap();
        assert_eq!(vm.section_count(), 1);

        // Re-reserving a covered range creates nothing new.
        assert_eq!(vm.reserve_at(base, 32 << 10).unwrap(), base);
        assert_eq!(vm.section_count(), 1);

        // Extending past the end fills just the tail gap.
        vm.reserve_at(base, 48 << 10).unwrap();
        assert_eq!(vm.section_count(), 2);

        vm.release(base, 48 << 10).unwrap();
        assert_eq!(vm.section_count(), 0);
    }

    #[test]
    fn operations_span_adjacent_sections() {
        let vm = local_vm();
        let base = free_range(32 << 10);
        vm.reserve_at(base, 16 << 10).unwrap();
        vm.reserve_at(base + (16 << 10), 16 << 10).unwrap();
        assert_eq!(vm.section_count(), 2);

        vm.allocate_at(
            base,
            32 << 10,
            ProtectionFlags::READ | ProtectionFlags::WRITE,
        )
        .unwrap();

        // A write crossing the section boundary lands in both.
        let data = vec![0x5A; 20 << 10];
        assert_eq!(vm.write(base + (8 << 10), &data).unwrap(), data.len());

        let mut readback = vec![0u8; data.len()];
        assert_eq!(vm.read(base + (8 << 10), &mut readback).unwrap(), data.len());
        assert_eq!(readback, data);

        vm.release(base, 32 << 10).unwrap();
        assert_eq!(vm.section_count(), 0);
    }

    #[test]
    fn release_is_partial_and_exact() {
        let vm = local_vm();
        let base = vm
            .allocate(
                32 << 10,
                ProtectionFlags::READ | ProtectionFlags::WRITE,
                AllocationFlags::empty(),
            )
            .unwrap();

        // Releasing half keeps the section (its bitmap is not empty).
        vm.release(base, 16 << 10).unwrap();
        assert_eq!(vm.section_count(), 1);

        let mut buf = [0u8; 16];
        assert_eq!(vm.read(base, &mut buf).unwrap_err(), LxError::INVALID_ADDRESS);
        vm.read(base + (16 << 10), &mut buf).unwrap();

        vm.release(base + (16 << 10), 16 << 10).unwrap();
        assert_eq!(vm.section_count(), 0);
    }

    #[test]
    fn elf_class_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guest");

        std::fs::write(&path, b"\x7fELF\x02rest").unwrap();
        assert_eq!(
            detect_architecture(&path).unwrap(),
            GuestArchitecture::X86_64
        );

        std::fs::write(&path, b"\x7fELF\x01rest").unwrap();
        assert_eq!(detect_architecture(&path).unwrap(), GuestArchitecture::X86);

        std::fs::write(&path, b"not an elf").unwrap();
        assert_eq!(detect_architecture(&path).unwrap_err(), LxError::INVAL);
    }
}
