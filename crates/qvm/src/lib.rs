//! This crate contains modules for [qforge](https://crates.io/crates/qforge) that add support for
//! reading, patching, and writing Quake 3 VM (.qvm) program images.
//!
//! The usual entry point is [`Qvm`](crate::qvm::Qvm), which loads an existing image, lets you
//! append code and data (including compiled C code), and writes a new image whose added state is
//! installed at load time by hooking the engine's init call.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
mod no_std {
    extern crate alloc;
    pub use alloc::{
        boxed::Box,
        format,
        string::{String, ToString},
        vec,
        vec::Vec,
    };
}

pub mod assembler;
#[cfg(feature = "std")]
pub mod compiler;
pub mod instruction;
pub mod memory;
pub mod prelude;
pub mod qvm;
