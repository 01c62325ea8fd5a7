//! PantherOS memory management
//!
//! The physical page allocator and virtual memory manager of the PantherOS
//! kernel, built as a `no_std` library so the allocator logic can be tested
//! on the host.
//!
//! See [`mm`] for the boot order and the global call surface.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod mm;
