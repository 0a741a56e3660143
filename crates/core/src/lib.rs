//! This crate is used as a utilities library for common functionality across
//! [qforge](https://crates.io/crates/qforge) modules.
//!
//! By default, this crate only enables modules which do not have any crate dependencies (aside from
//! snafu, which is required for errors).

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
#[allow(unused_imports)]
mod no_std {
    extern crate alloc;
    pub use alloc::boxed::Box;
    pub use alloc::format;
    pub use alloc::string::String;
    pub use alloc::vec::Vec;
}

pub mod prelude;

// Enable any modules that don't have dependencies by default
pub mod crc;
pub mod data;
pub mod util;

// Optional modules
#[cfg(feature = "time")]
pub mod time;
