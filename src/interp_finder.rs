//! Locates a live `PyInterpreterState` inside a target process, trying progressively
//! more expensive strategies and validating every candidate before accepting it.
use std::mem::size_of;
use std::slice;

use anyhow::{Error, Result};
use remoteprocess::ProcessMemory;

use crate::frame_walker::validates_as_interpreter;
use crate::python_process_info::ContainsAddr;
use crate::version_table::VersionDescriptor;

const RETRY_BUDGET: usize = 1000;

/// Input needed to try every strategy; fields are `None` when that avenue isn't available
/// on this platform or this binary didn't export the relevant symbol.
pub struct FinderContext<'a> {
    pub py_runtime_symbol: Option<usize>,
    pub tstate_current_symbol: Option<usize>,
    pub bss: Option<(usize, usize)>,
    pub heap: Option<(usize, usize)>,
    pub scan_heap: bool,
    pub maps: &'a dyn ContainsAddr,
}

/// Dereferences `PyInterpreterState` at `candidate` and checks it names itself back as the
/// owning interpreter of its own thread-state chain, then confirms a full frame walk
/// succeeds.
pub fn check_interp<P: ProcessMemory>(
    process: &P,
    descriptor: &VersionDescriptor,
    maps: &dyn ContainsAddr,
    candidate: usize,
) -> bool {
    if candidate == 0 || !maps.contains_addr(candidate) {
        return false;
    }

    let head_ptr: usize = match process.copy_struct(candidate + descriptor.interp_tstate_head) {
        Ok(v) => v,
        Err(_) => return false,
    };
    if head_ptr == 0 || !maps.contains_addr(head_ptr) {
        return false;
    }

    let tstate_interp: usize = match process.copy_struct(head_ptr + descriptor.tstate_interp) {
        Ok(v) => v,
        Err(_) => return false,
    };
    if tstate_interp != candidate {
        return false;
    }

    let frame: usize = match process.copy_struct(head_ptr + descriptor.tstate_frame) {
        Ok(v) => v,
        Err(_) => return false,
    };
    if frame == 0 {
        return false;
    }

    validates_as_interpreter(process, descriptor, candidate)
}

/// Runs the ordered strategy list and returns the first validated interpreter address.
pub fn locate<P: ProcessMemory>(
    process: &P,
    descriptor: &VersionDescriptor,
    ctx: &FinderContext,
) -> Result<usize> {
    if let Some(addr) = runtime_symbol_strategy(process, descriptor, ctx) {
        return Ok(addr);
    }
    if let Some(addr) = current_thread_state_strategy(process, descriptor, ctx) {
        return Ok(addr);
    }
    if let Some((bss_addr, bss_size)) = ctx.bss {
        if let Some(addr) = scan_strategy(process, descriptor, ctx, bss_addr, bss_size) {
            return Ok(addr);
        }
    }
    if ctx.scan_heap {
        if let Some((heap_addr, heap_size)) = ctx.heap {
            if let Some(addr) = scan_strategy(process, descriptor, ctx, heap_addr, heap_size) {
                return Ok(addr);
            }
        }
    }

    Err(Error::msg("failed to locate a live interpreter state in the target process"))
}

fn runtime_symbol_strategy<P: ProcessMemory>(
    process: &P,
    descriptor: &VersionDescriptor,
    ctx: &FinderContext,
) -> Option<usize> {
    let runtime_addr = ctx.py_runtime_symbol?;
    let offset = descriptor.runtime_interp_head_offset?;
    let candidate: usize = process.copy_struct(runtime_addr + offset).ok()?;
    if check_interp(process, descriptor, ctx.maps, candidate) {
        Some(candidate)
    } else {
        None
    }
}

fn current_thread_state_strategy<P: ProcessMemory>(
    process: &P,
    descriptor: &VersionDescriptor,
    ctx: &FinderContext,
) -> Option<usize> {
    let tstate_current = ctx.tstate_current_symbol?;
    let mut tstate_addr: usize = process.copy_struct(tstate_current).ok()?;

    for _ in 0..RETRY_BUDGET {
        if tstate_addr == 0 || !ctx.maps.contains_addr(tstate_addr) {
            return None;
        }

        let thread_id: u64 = process.copy_struct(tstate_addr + descriptor.tstate_thread_id).ok()?;
        if thread_id == 0 {
            // the release where `_PyThreadState_Current.thread_id == 0` requires chasing
            // `.prev` once more before the thread state is live (3.6.5 -> 3.6.6 quirk).
            match descriptor.tstate_prev {
                Some(prev_offset) => {
                    tstate_addr = process.copy_struct(tstate_addr + prev_offset).ok()?;
                    continue;
                }
                None => return None,
            }
        }

        let interp: usize = process.copy_struct(tstate_addr + descriptor.tstate_interp).ok()?;
        if check_interp(process, descriptor, ctx.maps, interp) {
            return Some(interp);
        }
        return None;
    }
    None
}

fn scan_strategy<P: ProcessMemory>(
    process: &P,
    descriptor: &VersionDescriptor,
    ctx: &FinderContext,
    region_addr: usize,
    region_size: usize,
) -> Option<usize> {
    let bytes = process.copy(region_addr, region_size).ok()?;

    #[allow(clippy::cast_ptr_alignment)]
    let words =
        unsafe { slice::from_raw_parts(bytes.as_ptr() as *const usize, bytes.len() / size_of::<usize>()) };

    for &candidate in words.iter().take(RETRY_BUDGET) {
        if ctx.maps.contains_addr(candidate) && check_interp(process, descriptor, ctx.maps, candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use remoteprocess::LocalProcess;

    use crate::version::Version;
    use crate::version_table::descriptor_for;

    struct AllowAll;
    impl ContainsAddr for AllowAll {
        fn contains_addr(&self, _addr: usize) -> bool {
            true
        }
    }

    fn write_usize(buf: &mut [u8], offset: usize, value: usize) {
        let bytes = value.to_ne_bytes();
        buf[offset..offset + bytes.len()].copy_from_slice(&bytes);
    }

    fn legacy_descriptor() -> VersionDescriptor {
        descriptor_for(&Version {
            major: 3,
            minor: 9,
            patch: 0,
            release_flags: String::new(),
            build_metadata: None,
        })
        .expect("3.9 is a supported generation")
    }

    #[test]
    fn test_check_interp_rejects_null_candidate() {
        let descriptor = legacy_descriptor();
        assert!(!check_interp(&LocalProcess, &descriptor, &AllowAll, 0));
    }

    #[test]
    fn test_check_interp_rejects_stale_thread_state_pointer() {
        let descriptor = legacy_descriptor();

        // thread state whose `interp` field points somewhere other than our candidate
        let mut tstate_buf = vec![0u8; 256];
        let tstate_addr = tstate_buf.as_mut_ptr() as usize;
        write_usize(&mut tstate_buf, descriptor.tstate_interp, 0xdead_beef);

        let mut interp_buf = vec![0u8; 256];
        let interp_addr = interp_buf.as_mut_ptr() as usize;
        write_usize(&mut interp_buf, descriptor.interp_tstate_head, tstate_addr);

        assert!(!check_interp(&LocalProcess, &descriptor, &AllowAll, interp_addr));
    }

    #[test]
    fn test_check_interp_rejects_zero_frame() {
        let descriptor = legacy_descriptor();

        let mut tstate_buf = vec![0u8; 256];
        let tstate_addr = tstate_buf.as_mut_ptr() as usize;

        let mut interp_buf = vec![0u8; 256];
        let interp_addr = interp_buf.as_mut_ptr() as usize;

        write_usize(&mut interp_buf, descriptor.interp_tstate_head, tstate_addr);
        write_usize(&mut tstate_buf, descriptor.tstate_interp, interp_addr);
        // tstate_frame left zeroed: a thread with no current frame is rejected before a
        // full walk is even attempted.

        assert!(!check_interp(&LocalProcess, &descriptor, &AllowAll, interp_addr));
    }

    #[test]
    fn test_check_interp_passes_identity_check_but_fails_full_walk_on_garbage_frame() {
        let descriptor = legacy_descriptor();

        let mut tstate_buf = vec![0u8; 256];
        let tstate_addr = tstate_buf.as_mut_ptr() as usize;

        let mut interp_buf = vec![0u8; 256];
        let interp_addr = interp_buf.as_mut_ptr() as usize;

        write_usize(&mut interp_buf, descriptor.interp_tstate_head, tstate_addr);
        write_usize(&mut tstate_buf, descriptor.tstate_interp, interp_addr);
        // a non-null frame pointer that doesn't point at a real code object; the
        // pointer-identity check in `check_interp` passes, but the full-walk validation it
        // delegates to must still reject this, since the frame can't actually be decoded.
        write_usize(&mut tstate_buf, descriptor.tstate_frame, 0x1);

        assert!(!check_interp(&LocalProcess, &descriptor, &AllowAll, interp_addr));
    }
}
