//! Convenient re-exports of commonly used data types, designed to make crate usage painless.
//!
//! The contents of this module can be used by including the following in any module:
//! ```
//! use qforge_qvm::prelude::*;
//! ```

#[doc(inline)]
pub use crate::assembler::{Assembler, Assembly, Layout, SymbolEntry, SymbolKind, SymbolTable};
#[cfg(feature = "std")]
#[doc(inline)]
pub use crate::compiler::Lcc;
#[doc(inline)]
pub use crate::instruction::{assemble, disassemble, Instruction, Opcode, Operand};
#[doc(inline)]
pub use crate::memory::{Memory, Region, RegionTag};
#[doc(inline)]
pub use crate::qvm::{FuncRef, Qvm, STACK_SIZE};

pub mod assembler {
    #[doc(inline)]
    pub use crate::assembler::Error;
}

#[cfg(feature = "std")]
pub mod compiler {
    #[doc(inline)]
    pub use crate::compiler::Error;
}

pub mod instruction {
    #[doc(inline)]
    pub use crate::instruction::Error;
}

pub mod memory {
    #[doc(inline)]
    pub use crate::memory::Error;
}

pub mod qvm {
    #[doc(inline)]
    pub use crate::qvm::Error;
}
