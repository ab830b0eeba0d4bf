//! Allocation refusal tracking
//!
//! The interpreter reports a refused allocation as an ordinary error value,
//! which guest code can replace while the stack unwinds. To keep memory
//! breaches visible to the governor, the interpreter's allocator is wrapped
//! and every definitive refusal is remembered per interpreter until taken.
//!
//! The interpreter retries most failed allocations once after an emergency
//! collection, immediately and with the same request. A failure therefore
//! stays pending until the next request: a successful identical retry drops
//! it, anything else confirms it.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::ffi::c_void;
use std::ptr;
use std::sync::OnceLock;

use mlua::{ffi, Lua};

/// The allocator being wrapped, shared by every interpreter
static INNER: OnceLock<ffi::lua_Alloc> = OnceLock::new();

type Request = (usize, usize, usize, usize);

thread_local! {
    /// Failed request that may still be retried
    static PENDING: Cell<Option<Request>> = const { Cell::new(None) };

    /// Interpreters (by allocator state) with a refusal not yet taken
    static REFUSED: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

unsafe extern "C-unwind" fn watched_alloc(
    ud: *mut c_void,
    block: *mut c_void,
    osize: usize,
    nsize: usize,
) -> *mut c_void {
    let Some(&inner) = INNER.get() else {
        return ptr::null_mut();
    };
    let result = unsafe { inner(ud, block, osize, nsize) };
    if nsize == 0 {
        return result;
    }

    let request = (ud as usize, block as usize, osize, nsize);
    let _ = PENDING.try_with(|pending| {
        if let Some(failed) = pending.take() {
            if failed != request {
                refuse(failed.0);
            } else if result.is_null() {
                refuse(failed.0);
                return;
            } else {
                return;
            }
        }
        if result.is_null() {
            pending.set(Some(request));
        }
    });
    result
}

fn refuse(key: usize) {
    let _ = REFUSED.try_with(|refused| {
        if let Ok(mut refused) = refused.try_borrow_mut() {
            refused.insert(key);
        }
    });
}

/// Refusal tracker for one interpreter
#[derive(Debug, Default)]
pub(crate) struct AllocWatch {
    /// Allocator state of the interpreter; 0 when not tracking
    key: usize,
}

impl AllocWatch {
    /// Start tracking refusals in `lua`
    pub fn install(lua: &Lua) -> mlua::Result<Self> {
        let mut key = 0;
        // SAFETY: only the allocator function is swapped; its state pointer
        // is left untouched and every call is forwarded to the original.
        unsafe {
            lua.exec_raw::<()>((), |state| {
                let mut ud = ptr::null_mut();
                let current = ffi::lua_getallocf(state, &mut ud);
                if current as usize == watched_alloc as usize {
                    key = ud as usize;
                    return;
                }
                let inner = *INNER.get_or_init(|| current);
                if inner as usize == current as usize {
                    ffi::lua_setallocf(state, watched_alloc, ud);
                    key = ud as usize;
                }
            })?;
        }
        Ok(AllocWatch { key })
    }

    /// Whether an allocation was refused since the last call, clearing it
    pub fn take_refusal(&self) -> bool {
        if self.key == 0 {
            return false;
        }
        // A failure still pending at a safe point was never retried
        let pending = PENDING
            .try_with(|pending| match pending.get() {
                Some(failed) if failed.0 == self.key => {
                    pending.set(None);
                    true
                }
                _ => false,
            })
            .unwrap_or(false);
        let refused = REFUSED
            .try_with(|refused| {
                refused
                    .try_borrow_mut()
                    .map_or(false, |mut refused| refused.remove(&self.key))
            })
            .unwrap_or(false);
        pending || refused
    }
}

impl Drop for AllocWatch {
    fn drop(&mut self) {
        self.take_refusal();
    }
}
