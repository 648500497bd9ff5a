//! Thread-local stack context.
//!
//! C plugins receive no per-call context argument. Instead, before any
//! primitive of a stack runs, the registry publishes that stack's opaque
//! context here, and the plugin reads it back through the `getstackdata`
//! accessor injected into its function table.
//!
//! The slot is only ever read by the thread that set it. It is not
//! cleared after the call, matching "most recently touched stack".

use std::cell::Cell;
use std::ptr;

use libc::c_void;

thread_local! {
    /// Context of the stack this thread most recently dispatched into.
    static STACK_DATA: Cell<*mut c_void> = const { Cell::new(ptr::null_mut()) };
}

/// Publish `data` as the current thread's stack context.
#[inline]
pub fn set_stack_data(data: *mut c_void) {
    STACK_DATA.with(|cell| cell.set(data));
}

#[inline]
pub fn stack_data() -> *mut c_void {
    STACK_DATA.with(|cell| cell.get())
}

/// Accessor handed to C plugins as `getstackdata`.
pub extern "C" fn getstackdata() -> *mut c_void {
    stack_data()
}
