//! Convenient re-exports of commonly used data types, designed to make crate usage painless.
//!
//! For example, when working with [`DataCursor`], you have to explicitly refer to [`data::Error`].
//!
//! The contents of this module can be used by including the following in any module:
//! ```
//! use qforge_core::prelude::*;
//! ```

#[doc(inline)]
pub use crate::data::{DataCursor, Endian, Error as DataError};

/// Contains [`data::Error`], which is used in Results returned by [`DataCursor`]
pub mod data {
    pub use crate::data::Error;
}

/// Contains the CRC-32 helpers used when forging checksums
pub mod crc {
    pub use crate::crc::{crc32, forge_crc32, Error};
}

#[cfg(all(feature = "time", feature = "std"))]
pub mod time {
    pub use crate::time::*;
}

pub mod util {
    pub use crate::util::{align, format_size, pad};
}
