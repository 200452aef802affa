//! Native entry patching: the crate's only raw memory mutation.
//!
//! Hosts that cache raw lifecycle entry addresses leave nothing for a body
//! swap to hook; the fallback is to write a relative branch at the compiled
//! entry so the old code lands in the new code. Everything dangerous is
//! confined here: page protection is flipped only inside the install
//! primitive and restored on scope exit, error paths included. 64-bit
//! x86 only, and the displacement must fit a signed 32-bit integer.

use thiserror::Error;

pub const BRANCH_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum NativePatchError {
    #[error("branch displacement {distance} does not fit in rel32")]
    OffsetOutOfRange { distance: i64 },
    #[error("mprotect failed: {0}")]
    Protect(String),
}

/// Encode `jmp rel32` from `src` to `dst`. The displacement is relative to
/// the end of the branch instruction.
pub fn encode_rel_branch(src: usize, dst: usize) -> Result<[u8; BRANCH_LEN], NativePatchError> {
    let distance = (dst as i64).wrapping_sub(src as i64 + BRANCH_LEN as i64);
    let rel32 = i32::try_from(distance).map_err(|_| NativePatchError::OffsetOutOfRange { distance })?;
    let mut bytes = [0u8; BRANCH_LEN];
    bytes[0] = 0xE9;
    bytes[1..].copy_from_slice(&rel32.to_le_bytes());
    Ok(bytes)
}

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let v = unsafe { nix::libc::sysconf(nix::libc::_SC_PAGESIZE) };
    if v > 0 { v as usize } else { 4096 }
}

/// Page range covering `[addr, addr + len)`.
fn page_span(addr: usize, len: usize) -> (usize, usize) {
    let page = page_size();
    let start = addr & !(page - 1);
    let end = (addr + len + page - 1) & !(page - 1);
    (start, end - start)
}

/// RAII protection flip: writable+executable inside the scope, back to
/// read+execute when it drops, error paths included.
struct ProtScope {
    start: usize,
    len: usize,
}

impl ProtScope {
    fn writable(addr: usize, len: usize) -> Result<ProtScope, NativePatchError> {
        use nix::sys::mman::ProtFlags;
        let (start, span) = page_span(addr, len);
        let flags = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC;
        // SAFETY: start/span cover whole pages inside the process image.
        unsafe {
            nix::sys::mman::mprotect(
                start as *mut std::ffi::c_void,
                span,
                flags,
            )
        }
        .map_err(|e| NativePatchError::Protect(e.to_string()))?;
        Ok(ProtScope { start, len: span })
    }
}

impl Drop for ProtScope {
    fn drop(&mut self) {
        use nix::sys::mman::ProtFlags;
        let flags = ProtFlags::PROT_READ | ProtFlags::PROT_EXEC;
        // SAFETY: restoring protection on the same page span.
        let _ = unsafe {
            nix::sys::mman::mprotect(
                self.start as *mut std::ffi::c_void,
                self.len,
                flags,
            )
        };
    }
}

/// A live branch written over a native entry. Dropping restores the saved
/// bytes.
pub struct NativePatch {
    addr: *mut u8,
    saved: [u8; BRANCH_LEN],
}

// The patch only touches process-global code memory.
unsafe impl Send for NativePatch {}

/// Write `jmp dst` over the first five bytes at `src`.
///
/// # Safety
///
/// `src` must point at the entry of a function at least `BRANCH_LEN` bytes
/// long that no thread is currently executing, and `dst` must be a valid
/// function entry with a compatible signature.
pub unsafe fn install_branch(src: *mut u8, dst: *const u8) -> Result<NativePatch, NativePatchError> {
    let bytes = encode_rel_branch(src as usize, dst as usize)?;
    let _scope = ProtScope::writable(src as usize, BRANCH_LEN)?;

    let mut saved = [0u8; BRANCH_LEN];
    // SAFETY: caller guarantees BRANCH_LEN readable/writable bytes at src;
    // the scope above made the pages writable.
    unsafe {
        std::ptr::copy_nonoverlapping(src, saved.as_mut_ptr(), BRANCH_LEN);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), src, BRANCH_LEN);
    }
    Ok(NativePatch { addr: src, saved })
}

impl Drop for NativePatch {
    fn drop(&mut self) {
        if let Ok(_scope) = ProtScope::writable(self.addr as usize, BRANCH_LEN) {
            // SAFETY: restoring the bytes saved by install_branch.
            unsafe {
                std::ptr::copy_nonoverlapping(self.saved.as_ptr(), self.addr, BRANCH_LEN);
            }
        }
    }
}
