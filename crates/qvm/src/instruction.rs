//! Qvm instructions and their assembly and disassembly.
//!
//! A Quake 3 VM program is a stack machine with a fixed set of 60 opcodes. Every instruction is
//! encoded as a single opcode byte, optionally followed by a little-endian operand whose width
//! (0, 1, or 4 bytes) is determined by the opcode alone:
//!
//! * `ENTER`, `LEAVE`, `CONST`, `LOCAL`, `BLOCK_COPY`, and every comparison from `EQ` through
//!   `GEF` take a 4-byte operand.
//! * `ARG` takes a 1-byte operand.
//! * Everything else takes none.
//!
//! `CONST` is special in that its operand may also be a 32-bit float; the float form only exists
//! in memory (the wire encoding is just the IEEE-754 bits) but is preserved across re-encoding so
//! edit-and-rewrite cycles don't lose it.
//!
//! See <https://www.icculus.org/~phaethon/q3mc/q3vm_specs.html> for the instruction semantics.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use snafu::prelude::*;

#[cfg(not(feature = "std"))]
use crate::no_std::*;

/// Error conditions for when building or decoding instructions.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// Thrown if a code stream contains a byte outside the opcode range.
    #[snafu(display("Unknown opcode {value:#04X}!"))]
    UnknownOpcode { value: u8 },
    /// Thrown if a code stream ends in the middle of an operand.
    #[snafu(display("Code stream ends inside an operand!"))]
    TruncatedStream,
    /// Thrown when constructing an instruction without its required operand.
    #[snafu(display("{opcode} requires an operand"))]
    MissingOperand { opcode: Opcode },
    /// Thrown when attaching an operand to an opcode that doesn't take one.
    #[snafu(display("{opcode} does not take an operand"))]
    UnexpectedOperand { opcode: Opcode },
    /// Thrown if an integer operand doesn't fit the opcode's operand width.
    #[snafu(display("operand {value:#x} out of range for {opcode}"))]
    OperandRange { opcode: Opcode, value: i64 },
    /// Thrown when attaching a float operand to anything but CONST.
    #[snafu(display("only CONST can take a float operand"))]
    FloatOperand,
}
type Result<T> = core::result::Result<T, Error>;

/// The operation performed by an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Undef = 0,
    Ignore = 1,
    Break = 2,
    Enter = 3,
    Leave = 4,
    Call = 5,
    Push = 6,
    Pop = 7,
    Const = 8,
    Local = 9,
    Jump = 10,
    Eq = 11,
    Ne = 12,
    Lti = 13,
    Lei = 14,
    Gti = 15,
    Gei = 16,
    Ltu = 17,
    Leu = 18,
    Gtu = 19,
    Geu = 20,
    Eqf = 21,
    Nef = 22,
    Ltf = 23,
    Lef = 24,
    Gtf = 25,
    Gef = 26,
    Load1 = 27,
    Load2 = 28,
    Load4 = 29,
    Store1 = 30,
    Store2 = 31,
    Store4 = 32,
    Arg = 33,
    BlockCopy = 34,
    Sex8 = 35,
    Sex16 = 36,
    Negi = 37,
    Add = 38,
    Sub = 39,
    Divi = 40,
    Divu = 41,
    Modi = 42,
    Modu = 43,
    Muli = 44,
    Mulu = 45,
    Band = 46,
    Bor = 47,
    Bxor = 48,
    Bcom = 49,
    Lsh = 50,
    Rshi = 51,
    Rshu = 52,
    Negf = 53,
    Addf = 54,
    Subf = 55,
    Divf = 56,
    Mulf = 57,
    Cvif = 58,
    Cvfi = 59,
}

impl Opcode {
    /// Returns the width in bytes of this opcode's operand (0, 1, or 4).
    #[must_use]
    pub const fn operand_size(self) -> usize {
        match self {
            Self::Enter | Self::Leave | Self::Const | Self::Local | Self::BlockCopy => 4,
            Self::Eq
            | Self::Ne
            | Self::Lti
            | Self::Lei
            | Self::Gti
            | Self::Gei
            | Self::Ltu
            | Self::Leu
            | Self::Gtu
            | Self::Geu
            | Self::Eqf
            | Self::Nef
            | Self::Ltf
            | Self::Lef
            | Self::Gtf
            | Self::Gef => 4,
            Self::Arg => 1,
            _ => 0,
        }
    }

    /// Returns the conventional mnemonic for this opcode, as used in disassembly listings.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Undef => "UNDEF",
            Self::Ignore => "IGNORE",
            Self::Break => "BREAK",
            Self::Enter => "ENTER",
            Self::Leave => "LEAVE",
            Self::Call => "CALL",
            Self::Push => "PUSH",
            Self::Pop => "POP",
            Self::Const => "CONST",
            Self::Local => "LOCAL",
            Self::Jump => "JUMP",
            Self::Eq => "EQ",
            Self::Ne => "NE",
            Self::Lti => "LTI",
            Self::Lei => "LEI",
            Self::Gti => "GTI",
            Self::Gei => "GEI",
            Self::Ltu => "LTU",
            Self::Leu => "LEU",
            Self::Gtu => "GTU",
            Self::Geu => "GEU",
            Self::Eqf => "EQF",
            Self::Nef => "NEF",
            Self::Ltf => "LTF",
            Self::Lef => "LEF",
            Self::Gtf => "GTF",
            Self::Gef => "GEF",
            Self::Load1 => "LOAD1",
            Self::Load2 => "LOAD2",
            Self::Load4 => "LOAD4",
            Self::Store1 => "STORE1",
            Self::Store2 => "STORE2",
            Self::Store4 => "STORE4",
            Self::Arg => "ARG",
            Self::BlockCopy => "BLOCK_COPY",
            Self::Sex8 => "SEX8",
            Self::Sex16 => "SEX16",
            Self::Negi => "NEGI",
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Divi => "DIVI",
            Self::Divu => "DIVU",
            Self::Modi => "MODI",
            Self::Modu => "MODU",
            Self::Muli => "MULI",
            Self::Mulu => "MULU",
            Self::Band => "BAND",
            Self::Bor => "BOR",
            Self::Bxor => "BXOR",
            Self::Bcom => "BCOM",
            Self::Lsh => "LSH",
            Self::Rshi => "RSHI",
            Self::Rshu => "RSHU",
            Self::Negf => "NEGF",
            Self::Addf => "ADDF",
            Self::Subf => "SUBF",
            Self::Divf => "DIVF",
            Self::Mulf => "MULF",
            Self::Cvif => "CVIF",
            Self::Cvfi => "CVFI",
        }
    }
}

impl core::fmt::Display for Opcode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// An instruction operand, either a 32-bit (or, for `ARG`, 8-bit) integer or a 32-bit float.
///
/// Integer operands accept both signed and unsigned encodings: a width-`w` operand may be
/// anywhere in `-2^(8w-1) ..= 2^(8w) - 1`. Decoding always produces the unsigned reading.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Operand {
    Int(i64),
    Float(f32),
}

impl From<i64> for Operand {
    #[inline]
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f32> for Operand {
    #[inline]
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

/// A single qvm instruction: an [`Opcode`] plus its operand, if the opcode takes one.
///
/// Instructions can only be built through the validating constructors, so a stored instruction
/// always has an operand exactly when its opcode requires one, with the value in range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instruction {
    opcode: Opcode,
    operand: Option<Operand>,
}

impl Instruction {
    /// Creates an instruction from an opcode that takes no operand.
    ///
    /// # Errors
    /// Returns [`MissingOperand`](Error::MissingOperand) if the opcode requires one.
    pub fn new(opcode: Opcode) -> Result<Self> {
        ensure!(opcode.operand_size() == 0, MissingOperandSnafu { opcode });
        Ok(Self { opcode, operand: None })
    }

    /// Creates an instruction from an opcode and its operand.
    ///
    /// # Errors
    /// Returns [`UnexpectedOperand`](Error::UnexpectedOperand) if the opcode takes no operand,
    /// [`OperandRange`](Error::OperandRange) if an integer operand doesn't fit the opcode's
    /// operand width, or [`FloatOperand`](Error::FloatOperand) for a float on anything but CONST.
    pub fn with_operand<O: Into<Operand>>(opcode: Opcode, operand: O) -> Result<Self> {
        let mut instruction = Self { opcode, operand: None };
        instruction.set_operand(operand)?;
        Ok(instruction)
    }

    /// Returns the opcode of this instruction.
    #[inline]
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Returns the operand of this instruction, if it has one.
    #[inline]
    #[must_use]
    pub const fn operand(&self) -> Option<Operand> {
        self.operand
    }

    /// Replaces the operand of this instruction, validating it against the opcode.
    ///
    /// # Errors
    /// Same as [`with_operand`](Self::with_operand).
    pub fn set_operand<O: Into<Operand>>(&mut self, operand: O) -> Result<()> {
        let operand = operand.into();
        let size = self.opcode.operand_size();
        ensure!(size != 0, UnexpectedOperandSnafu { opcode: self.opcode });

        match operand {
            Operand::Float(_) => {
                ensure!(self.opcode == Opcode::Const, FloatOperandSnafu);
            }
            Operand::Int(value) => {
                let min = -(1i64 << (size * 8 - 1));
                let max = (1i64 << (size * 8)) - 1;
                ensure!(
                    min <= value && value <= max,
                    OperandRangeSnafu { opcode: self.opcode, value }
                );
            }
        }

        self.operand = Some(operand);
        Ok(())
    }

    /// Appends the encoded form of this instruction to `code`.
    ///
    /// Negative integer operands are encoded two's-complement; floats are IEEE-754 little-endian.
    pub fn encode_into(&self, code: &mut Vec<u8>) {
        code.push(self.opcode.into());
        match self.operand {
            None => {}
            Some(Operand::Float(value)) => code.extend_from_slice(&value.to_le_bytes()),
            Some(Operand::Int(value)) => {
                if self.opcode.operand_size() == 1 {
                    code.push(value as u8);
                } else {
                    code.extend_from_slice(&(value as u32).to_le_bytes());
                }
            }
        }
    }
}

impl core::fmt::Display for Instruction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.operand {
            None => write!(f, "{}", self.opcode),
            Some(Operand::Int(value)) => write!(f, "{} {value:#x}", self.opcode),
            Some(Operand::Float(value)) => write!(f, "{} {value}", self.opcode),
        }
    }
}

/// Assembles instructions into bytes. No padding is added.
#[must_use]
pub fn assemble(instructions: &[Instruction]) -> Vec<u8> {
    let mut code = Vec::with_capacity(instructions.len() * 5);
    for instruction in instructions {
        instruction.encode_into(&mut code);
    }
    code
}

/// Disassembles bytes into instructions, stopping cleanly at the end of input.
///
/// # Errors
/// Returns [`UnknownOpcode`](Error::UnknownOpcode) if a byte is outside the opcode range, or
/// [`TruncatedStream`](Error::TruncatedStream) if the input ends inside an operand.
pub fn disassemble(code: &[u8]) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::new();
    let mut pos = 0;

    while pos < code.len() {
        let byte = code[pos];
        pos += 1;

        let opcode = Opcode::try_from(byte).ok().context(UnknownOpcodeSnafu { value: byte })?;
        let size = opcode.operand_size();
        if size == 0 {
            instructions.push(Instruction { opcode, operand: None });
            continue;
        }

        ensure!(pos + size <= code.len(), TruncatedStreamSnafu);
        let value = if size == 1 {
            i64::from(code[pos])
        } else {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&code[pos..pos + 4]);
            i64::from(u32::from_le_bytes(bytes))
        };
        pos += size;

        instructions.push(Instruction { opcode, operand: Some(Operand::Int(value)) });
    }

    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(opcode: Opcode) -> Instruction {
        Instruction::new(opcode).unwrap()
    }

    fn ins_op(opcode: Opcode, operand: i64) -> Instruction {
        Instruction::with_operand(opcode, operand).unwrap()
    }

    #[test]
    fn const_encoding() {
        let mut code = Vec::new();
        ins_op(Opcode::Const, 0x7B).encode_into(&mut code);
        assert_eq!(code, [0x08, 0x7B, 0x00, 0x00, 0x00]);

        let decoded = disassemble(&[0x06, 0x08, 0x7B, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(decoded, [ins(Opcode::Push), ins_op(Opcode::Const, 0x7B)]);
    }

    #[test]
    fn negative_operands_encode_twos_complement() {
        assert_eq!(assemble(&[ins_op(Opcode::Enter, -4)]), [0x03, 0xFC, 0xFF, 0xFF, 0xFF]);
        assert_eq!(assemble(&[ins_op(Opcode::Arg, -1)]), [0x21, 0xFF]);
    }

    #[test]
    fn round_trip() {
        let instructions = vec![
            ins_op(Opcode::Enter, 0x14),
            ins_op(Opcode::Local, 0x10),
            ins(Opcode::Load4),
            ins_op(Opcode::Arg, 0x8),
            ins_op(Opcode::Const, 0xFFFF_FFFF),
            ins(Opcode::Call),
            ins_op(Opcode::Eq, 0x2A),
            ins(Opcode::Push),
            ins_op(Opcode::Leave, 0x14),
        ];
        assert_eq!(disassemble(&assemble(&instructions)).unwrap(), instructions);
    }

    #[test]
    fn float_operand_survives_reencoding() {
        let value = 1.5f32;
        let instruction = Instruction::with_operand(Opcode::Const, value).unwrap();
        let code = assemble(&[instruction]);
        assert_eq!(&code[1..], value.to_le_bytes());

        // the decoder has no float marker to go from, so it yields the raw bits
        let decoded = disassemble(&code).unwrap();
        assert_eq!(
            decoded[0].operand(),
            Some(Operand::Int(i64::from(value.to_bits())))
        );
        assert_eq!(assemble(&decoded), code);
    }

    #[test]
    fn operand_validation() {
        assert!(matches!(
            Instruction::new(Opcode::Const),
            Err(Error::MissingOperand { .. })
        ));
        assert!(matches!(
            Instruction::with_operand(Opcode::Push, 1),
            Err(Error::UnexpectedOperand { .. })
        ));
        assert!(matches!(
            Instruction::with_operand(Opcode::Local, 0x1_0000_0000),
            Err(Error::OperandRange { .. })
        ));
        assert!(matches!(
            Instruction::with_operand(Opcode::Arg, 256),
            Err(Error::OperandRange { .. })
        ));
        assert!(matches!(
            Instruction::with_operand(Opcode::Local, 1.0f32),
            Err(Error::FloatOperand)
        ));

        // both signed and unsigned encodings are accepted
        assert!(Instruction::with_operand(Opcode::Local, -0x8000_0000).is_ok());
        assert!(Instruction::with_operand(Opcode::Local, 0xFFFF_FFFF).is_ok());
        assert!(Instruction::with_operand(Opcode::Arg, -128).is_ok());
        assert!(Instruction::with_operand(Opcode::Arg, 255).is_ok());
    }

    #[test]
    fn decode_errors() {
        assert!(matches!(
            disassemble(&[0x3C]),
            Err(Error::UnknownOpcode { value: 0x3C })
        ));
        assert!(matches!(disassemble(&[0x08, 0x01]), Err(Error::TruncatedStream)));
        assert!(matches!(disassemble(&[0x21]), Err(Error::TruncatedStream)));
        assert!(disassemble(&[]).unwrap().is_empty());
    }

    #[test]
    fn display() {
        assert_eq!(ins_op(Opcode::Const, 0x7B).to_string(), "CONST 0x7b");
        assert_eq!(ins(Opcode::Push).to_string(), "PUSH");
        assert_eq!(ins_op(Opcode::BlockCopy, 8).to_string(), "BLOCK_COPY 0x8");
    }
}
