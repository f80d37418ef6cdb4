use std::alloc::{self, Layout};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use thiserror::Error;

/// Bytes added per growth unit (one 64 KiB page).
pub const GROWTH_UNIT: usize = 0x10000;

const ARENA_ALIGN: usize = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("arena growth by {requested} units would exceed the {max_units} unit reservation")]
pub struct ArenaError {
    pub requested: usize,
    pub max_units: usize,
}

/// The flat memory shared by every virtual CPU and task thread.
///
/// The whole `max_units` reservation is allocated zeroed up front, so the
/// base address never moves and `grow` only advances the committed size.
/// Handles are cheap to clone and all point at the same allocation.
///
/// Accessors check against the reservation, not the committed size; an
/// access past the reservation is a host bug and panics. Races on bytes
/// inside the arena are the guest's concern, as with any shared linear
/// memory.
#[derive(Clone)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

struct ArenaInner {
    base: *mut u8,
    reserved: usize,
    size: AtomicUsize,
}

unsafe impl Send for ArenaInner {}
unsafe impl Sync for ArenaInner {}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        // Same layout that was validated in `Arena::new`.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.reserved, ARENA_ALIGN);
            alloc::dealloc(self.base, layout);
        }
    }
}

impl Arena {
    pub fn new(initial_units: usize, max_units: usize) -> Self {
        if max_units == 0 || initial_units > max_units {
            panic!("bad arena sizing: initial = {initial_units} units, max = {max_units} units");
        }
        let reserved = max_units * GROWTH_UNIT;
        let layout = match Layout::from_size_align(reserved, ARENA_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("arena reservation of {max_units} units does not fit a layout"),
        };
        let base = unsafe { alloc::alloc_zeroed(layout) };
        if base.is_null() {
            alloc::handle_alloc_error(layout);
        }
        Self {
            inner: Arc::new(ArenaInner {
                base,
                reserved,
                size: AtomicUsize::new(initial_units * GROWTH_UNIT),
            }),
        }
    }

    /// Committed size in bytes.
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::Acquire)
    }

    /// Reservation in bytes; the hard upper bound of `size`.
    pub fn reserved(&self) -> usize {
        self.inner.reserved
    }

    /// Commits `additional_units` more growth units and returns the size in
    /// bytes *before* the growth, i.e. the base offset of the new region.
    pub fn grow(&self, additional_units: usize) -> Result<usize, ArenaError> {
        let bytes = additional_units * GROWTH_UNIT;
        let reserved = self.inner.reserved;
        self.inner
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let grown = current.checked_add(bytes)?;
                (grown <= reserved).then_some(grown)
            })
            .map_err(|_| ArenaError {
                requested: additional_units,
                max_units: reserved / GROWTH_UNIT,
            })
    }

    fn check(&self, what: &str, addr: u32, len: usize) {
        let end = addr as usize + len;
        if end > self.inner.reserved {
            panic!("arena {what} out of bounds: addr = 0x{addr:08x}, len = {len}");
        }
    }

    pub fn read(&self, addr: u32, buf: &mut [u8]) {
        self.check("read", addr, buf.len());
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.inner.base.add(addr as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
    }

    pub fn write(&self, addr: u32, bytes: &[u8]) {
        self.check("write", addr, bytes.len());
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.inner.base.add(addr as usize),
                bytes.len(),
            );
        }
    }

    pub fn read_range(&self, start: u32, end: u32) -> Vec<u8> {
        if end < start {
            panic!("arena range inverted: 0x{start:08x}..0x{end:08x}");
        }
        let mut buf = vec![0u8; (end - start) as usize];
        self.read(start, &mut buf);
        buf
    }

    pub fn load_u32(&self, addr: u32) -> u32 {
        let mut bytes = [0u8; 4];
        self.read(addr, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    pub fn store_u32(&self, addr: u32, val: u32) {
        self.write(addr, &val.to_le_bytes());
    }

    pub fn store_u8(&self, addr: u32, val: u8) {
        self.write(addr, &[val]);
    }

    /// Reads the NUL-terminated string at `addr`, decoding lossily. An
    /// unterminated string ends at the reservation boundary.
    pub fn cstring(&self, addr: u32) -> String {
        let start = addr as usize;
        let mut end = start;
        while end < self.inner.reserved && unsafe { *self.inner.base.add(end) } != 0 {
            end += 1;
        }
        let bytes = self.read_range(addr, end as u32);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// A shared atomic view of the aligned word at `addr`, for control flags
    /// the host keeps inside the arena.
    pub fn atomic_u32(&self, addr: u32) -> &AtomicU32 {
        self.check("atomic", addr, 4);
        if addr % 4 != 0 {
            panic!("arena atomic unaligned: addr = 0x{addr:08x}");
        }
        unsafe { &*(self.inner.base.add(addr as usize) as *const AtomicU32) }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("size", &self.size())
            .field("reserved", &self.inner.reserved)
            .finish()
    }
}
