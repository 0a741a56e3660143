//! Loading, patching, and writing of .qvm program images.
//!
//! # Format
//! A .qvm file is little-endian throughout and starts with a 32-byte header:
//!
//! | Offset | Field | Notes |
//! |--------|-------|-------|
//! | 0x00 | vm_magic          | Format version tag, preserved verbatim. |
//! | 0x04 | instruction_count | Instructions in the code section; trailing bytes are padding. |
//! | 0x08 | code_offset       | File offset of the code section. |
//! | 0x0C | code_length       | Bytes of encoded code, padded to 4. |
//! | 0x10 | data_offset       | File offset of the data section. |
//! | 0x14 | data_length       | Bytes of 4-byte DATA words. |
//! | 0x18 | lit_length        | Bytes of raw LIT data, following the DATA words. |
//! | 0x1C | bss_length        | Zero-initialized bytes, including the reserved stack. |
//!
//! Only the DATA and LIT prefix is stored in the file; everything past it is BSS, which the
//! engine zeroes at load time. That is why appended data needs an init hook: [`Qvm::write`]
//! synthesizes a wrapper function that stores every non-zero added byte at load time and then
//! tail-calls the engine's real init routine, and repoints the init call site at the wrapper.

use hashbrown::HashMap;
use qforge_core::crc::{crc32, forge_crc32};
use qforge_core::prelude::*;
use qforge_core::util::pad;
use snafu::prelude::*;

#[cfg(feature = "std")]
use std::path::{Path, PathBuf};

use crate::assembler::{self, Assembler, Layout, SymbolEntry, SymbolTable};
#[cfg(feature = "std")]
use crate::compiler::{self, Lcc, ScratchFile};
use crate::instruction::{self, assemble, disassemble, Instruction, Opcode, Operand};
use crate::memory::{self, Memory, RegionTag};

#[cfg(not(feature = "std"))]
use crate::no_std::*;

/// Bytes reserved at the top of BSS for the program stack.
pub const STACK_SIZE: usize = 0x10000;

const HEADER_SIZE: usize = 32;

/// Engine-invoked init routines, in lookup order. One of these is hijacked to install new data.
const INIT_SYMBOLS: [&str; 3] = ["G_InitGame", "CG_Init", "UI_Init"];

/// Error conditions for when loading, patching, or writing a qvm.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[cfg(feature = "std")]
    #[snafu(display("Filesystem Error {source}"))]
    FileError { source: std::io::Error },

    /// Thrown if the file ends before the header or a section does.
    #[snafu(display("Unexpected End-Of-File!"))]
    EndOfFile,

    /// Thrown if the header's sections don't describe a loadable program.
    #[snafu(display("Invalid header: {reason}"))]
    InvalidHeader { reason: &'static str },

    /// Thrown if the code section can't be decoded.
    #[snafu(display("Invalid code section: {source}"))]
    BadCode { source: instruction::Error },

    #[snafu(display("{source}"))]
    Instruction { source: instruction::Error },

    #[snafu(display("{source}"))]
    Memory { source: memory::Error },

    #[cfg(feature = "std")]
    #[snafu(display("{source}"))]
    Compile { source: compiler::Error },

    #[snafu(display("{source}"))]
    Assemble { source: assembler::Error },

    /// Thrown at write time when added data exists but no init hook can be installed.
    #[snafu(display("Cannot find a symbol for G_InitGame, CG_Init, or UI_Init"))]
    MissingInitSymbol,

    /// Thrown at write time when the init routine has no call site to hijack.
    #[snafu(display("{name} is never called"))]
    InitNeverCalled { name: String },

    /// Thrown when a name passed to [`Qvm::replace_calls`] isn't in the symbol table.
    #[snafu(display("Unknown symbol {name}"))]
    UnknownSymbol { name: String },

    #[snafu(display("Cannot forge checksum: {source}"))]
    Forge { source: qforge_core::crc::Error },
}
type Result<T> = core::result::Result<T, Error>;

impl From<DataError> for Error {
    #[inline]
    fn from(error: DataError) -> Self {
        match error {
            DataError::EndOfFile => Self::EndOfFile,
            _ => unreachable!(),
        }
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    #[inline]
    fn from(error: std::io::Error) -> Self {
        Error::FileError { source: error }
    }
}

/// The fixed-size file header. See the module [format](self#format) table.
#[derive(Clone, Copy, Debug)]
struct Header {
    vm_magic: u32,
    instruction_count: u32,
    code_offset: u32,
    code_length: u32,
    data_offset: u32,
    data_length: u32,
    lit_length: u32,
    bss_length: u32,
}

impl Header {
    fn read(data: &mut DataCursor) -> core::result::Result<Self, DataError> {
        Ok(Self {
            vm_magic: data.read_u32()?,
            instruction_count: data.read_u32()?,
            code_offset: data.read_u32()?,
            code_length: data.read_u32()?,
            data_offset: data.read_u32()?,
            data_length: data.read_u32()?,
            lit_length: data.read_u32()?,
            bss_length: data.read_u32()?,
        })
    }

    fn write(&self, output: &mut Vec<u8>) {
        for field in [
            self.vm_magic,
            self.instruction_count,
            self.code_offset,
            self.code_length,
            self.data_offset,
            self.data_length,
            self.lit_length,
            self.bss_length,
        ] {
            output.extend_from_slice(&field.to_le_bytes());
        }
    }
}

/// A function reference: either a symbol name or a resolved code address.
#[derive(Clone, Copy, Debug)]
pub enum FuncRef<'a> {
    Name(&'a str),
    Address(i64),
}

impl<'a> From<&'a str> for FuncRef<'a> {
    #[inline]
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

impl From<i64> for FuncRef<'_> {
    #[inline]
    fn from(address: i64) -> Self {
        Self::Address(address)
    }
}

impl From<u32> for FuncRef<'_> {
    #[inline]
    fn from(address: u32) -> Self {
        Self::Address(i64::from(address))
    }
}

/// A patchable Quake 3 VM program.
///
/// A `Qvm` is loaded from an existing image, mutated through the `add_*` and `replace_calls`
/// methods, and serialized with [`write`](Self::write). All mutations are applied in caller
/// order; one write reflects everything done before it.
#[derive(Debug)]
pub struct Qvm {
    vm_magic: u32,
    instructions: Vec<Instruction>,
    memory: Memory,
    symbols: SymbolTable,

    original_data_length: usize,
    original_lit_length: usize,
    original_crc: u32,

    /// target address -> indices of `CONST target; CALL` pairs, in order
    calls: HashMap<i64, Vec<usize>>,

    #[cfg(feature = "std")]
    lcc: Option<Lcc>,
}

impl Qvm {
    /// Loads a qvm image from a byte buffer.
    ///
    /// `symbols` maps names to addresses in the loaded program; anything defined here can be
    /// called or referenced from C code added with [`add_c_code`](Self::add_c_code), and an init
    /// symbol is required before [`write`](Self::write) can install added data.
    ///
    /// # Errors
    /// Returns [`EndOfFile`](Error::EndOfFile), [`InvalidHeader`](Error::InvalidHeader), or
    /// [`BadCode`](Error::BadCode) if the image doesn't parse.
    pub fn from_bytes(data: &[u8], symbols: SymbolTable) -> Result<Self> {
        let mut cursor = DataCursor::new(data, Endian::Little);
        let header = Header::read(&mut cursor)?;

        ensure!(
            header.data_length % 4 == 0,
            InvalidHeaderSnafu { reason: "data length must be a multiple of 4" }
        );
        ensure!(
            header.bss_length as usize >= STACK_SIZE,
            InvalidHeaderSnafu { reason: "bss is smaller than the reserved stack" }
        );

        cursor.set_position(header.code_offset as usize);
        let code = cursor.get_slice(header.code_length as usize)?;
        let mut instructions = disassemble(code).context(BadCodeSnafu)?;

        // trailing instructions decoded from padding are not real
        ensure!(
            instructions.len() >= header.instruction_count as usize,
            InvalidHeaderSnafu { reason: "code section is truncated" }
        );
        instructions.truncate(header.instruction_count as usize);

        // STACK_SIZE bytes at the end of bss are reserved for the program stack. We are going to
        // use the area for our own data and reserve STACK_SIZE fresh bytes at write time.
        let bss_length = header.bss_length as usize - STACK_SIZE;

        let mut memory = Memory::new();
        cursor.set_position(header.data_offset as usize);
        let bytes = cursor.get_slice(header.data_length as usize)?;
        memory.add_region(RegionTag::Data, bytes, 4).context(MemorySnafu)?;
        let bytes = cursor.get_slice(header.lit_length as usize)?;
        memory.add_region(RegionTag::Lit, bytes, 1).context(MemorySnafu)?;
        memory.add_zeroed(RegionTag::Bss, bss_length, 1).context(MemorySnafu)?;

        let calls = index_calls(&instructions);
        log::debug!(
            "loaded qvm: {} instructions, {} call targets, {} bytes of memory",
            instructions.len(),
            calls.len(),
            memory.len()
        );

        Ok(Self {
            vm_magic: header.vm_magic,
            instructions,
            memory,
            symbols,
            original_data_length: header.data_length as usize,
            original_lit_length: header.lit_length as usize,
            original_crc: crc32(data),
            calls,
            #[cfg(feature = "std")]
            lcc: None,
        })
    }

    /// Loads a qvm image from a file. See [`from_bytes`](Self::from_bytes).
    ///
    /// # Errors
    /// Additionally returns [`FileError`](Error::FileError) if the file cannot be read.
    #[cfg(feature = "std")]
    pub fn open<P: AsRef<Path>>(path: P, symbols: SymbolTable) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?, symbols)
    }

    /// Returns the format version tag from the header.
    #[inline]
    #[must_use]
    pub const fn vm_magic(&self) -> u32 {
        self.vm_magic
    }

    /// Returns the disassembled code section.
    #[inline]
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Returns the program's initial memory contents.
    #[inline]
    #[must_use]
    pub const fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Returns the symbol table: the seeded entries plus everything added C code defined.
    #[inline]
    #[must_use]
    pub const fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Returns the CRC-32 of the file this image was loaded from.
    #[inline]
    #[must_use]
    pub const fn original_crc(&self) -> u32 {
        self.original_crc
    }

    /// Returns the length of the original DATA section.
    #[inline]
    #[must_use]
    pub const fn data_length(&self) -> usize {
        self.original_data_length
    }

    /// Returns the length of the original LIT section.
    #[inline]
    #[must_use]
    pub const fn lit_length(&self) -> usize {
        self.original_lit_length
    }

    /// Defines a symbol, making it visible to later [`add_c_code`](Self::add_c_code) and
    /// [`replace_calls`](Self::replace_calls) calls.
    #[inline]
    pub fn add_symbol<N: Into<String>>(&mut self, name: N, entry: SymbolEntry) {
        self.symbols.insert(name.into(), entry);
    }

    /// Overrides the compiler used by [`add_c_code`](Self::add_c_code) instead of discovering
    /// one through the environment.
    #[cfg(feature = "std")]
    #[inline]
    pub fn set_compiler(&mut self, lcc: Lcc) {
        self.lcc = Some(lcc);
    }

    /// Adds data to the DATA section and returns its address.
    ///
    /// The DATA section holds 4-byte words that may be byte-swapped at load time, so `alignment`
    /// and the size of `data` must both be multiples of 4.
    ///
    /// # Errors
    /// Returns [`Memory`](Error::Memory) if the size or alignment is invalid.
    pub fn add_data(&mut self, data: &[u8], alignment: usize) -> Result<usize> {
        self.memory.add_region(RegionTag::Data, data, alignment).context(MemorySnafu)
    }

    /// Adds data to the LIT section and returns its address.
    ///
    /// The LIT section holds data that is never byte-swapped, such as strings.
    ///
    /// # Errors
    /// Returns [`Memory`](Error::Memory) if the alignment is zero.
    pub fn add_lit(&mut self, data: &[u8], alignment: usize) -> Result<usize> {
        self.memory.add_region(RegionTag::Lit, data, alignment).context(MemorySnafu)
    }

    /// Adds zero-filled data to the BSS section and returns its address.
    ///
    /// # Errors
    /// Returns [`Memory`](Error::Memory) if the alignment is zero.
    pub fn add_bss(&mut self, size: usize, alignment: usize) -> Result<usize> {
        self.memory.add_zeroed(RegionTag::Bss, size, alignment).context(MemorySnafu)
    }

    /// Appends instructions to the code section and returns the address of the first one.
    pub fn add_code<I: IntoIterator<Item = Instruction>>(&mut self, instructions: I) -> usize {
        let address = self.instructions.len();
        self.instructions.extend(instructions);
        address
    }

    /// Compiles a string of C code and adds it to the program.
    ///
    /// Symbols defined by the code are added to the symbol table. Returns the compiler's
    /// standard output/error.
    ///
    /// # Errors
    /// Returns [`Compile`](Error::Compile) if the external compiler fails (carrying its output)
    /// and [`Assemble`](Error::Assemble) for problems in the produced assembly. The image is
    /// unchanged if compilation or assembly fails.
    #[cfg(feature = "std")]
    pub fn add_c_code(&mut self, code: &str, include_dirs: &[PathBuf]) -> Result<String> {
        let c_file = ScratchFile::with_contents(".c", code.as_bytes())?;
        self.add_c_files(&[c_file.path().to_path_buf()], include_dirs)
    }

    /// Compiles a C file and adds it to the program. See [`add_c_code`](Self::add_c_code).
    #[cfg(feature = "std")]
    pub fn add_c_file<P: AsRef<Path>>(&mut self, path: P, include_dirs: &[PathBuf]) -> Result<String> {
        self.add_c_files(&[path], include_dirs)
    }

    /// Compiles C files and adds them to the program in one assembler run, so file-scoped
    /// symbols stay separated while globals can cross files. See [`add_c_code`](Self::add_c_code).
    #[cfg(feature = "std")]
    pub fn add_c_files<P: AsRef<Path>>(&mut self, paths: &[P], include_dirs: &[PathBuf]) -> Result<String> {
        let lcc = match &self.lcc {
            Some(lcc) => lcc.clone(),
            None => Lcc::locate().ok_or(Error::Compile { source: compiler::Error::NotFound })?,
        };

        let mut output = String::new();
        let mut sources = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let asm_file = ScratchFile::create(".asm")?;
            output.push_str(&lcc.compile_file(path, asm_file.path(), include_dirs).context(CompileSnafu)?);
            sources.push((path.display().to_string(), std::fs::read_to_string(asm_file.path())?));
        }

        self.memory.align(4);

        let layout = Layout {
            code_base: self.instructions.len(),
            data_base: self.memory.len(),
            ..Layout::default()
        };
        let sources: Vec<(&str, &str)> =
            sources.iter().map(|(name, text)| (name.as_str(), text.as_str())).collect();
        let assembly = Assembler::new(false)
            .assemble_sources(&sources, &layout, &self.symbols)
            .context(AssembleSnafu)?;

        log::debug!(
            "compiled {} file(s): {} instructions, {}/{}/{} data/lit/bss bytes, {} symbols",
            paths.len(),
            assembly.instructions.len(),
            assembly.data.image.len(),
            assembly.lit.image.len(),
            assembly.bss.image.len(),
            assembly.symbols.len()
        );

        self.instructions.extend(assembly.instructions);
        self.add_data(&assembly.data.image, 4)?;
        self.add_lit(&assembly.lit.image, 1)?;
        self.add_bss(assembly.bss.image.len(), 1)?;
        // merge symbols last so a failure above leaves the table untouched
        self.symbols.extend(assembly.symbols);

        Ok(output)
    }

    /// Replaces calls to `old` with calls to `new`, given as names or addresses.
    ///
    /// Returns the number of call sites rewritten.
    ///
    /// # Errors
    /// Returns [`UnknownSymbol`](Error::UnknownSymbol) if a name isn't in the symbol table.
    pub fn replace_calls<'a, O, N>(&mut self, old: O, new: N) -> Result<usize>
    where
        O: Into<FuncRef<'a>>,
        N: Into<FuncRef<'a>>,
    {
        let old = self.resolve(old.into())?;
        let new = self.resolve(new.into())?;

        let Some(sites) = self.calls.get(&old) else {
            return Ok(0);
        };
        let sites = sites.clone();
        for &site in &sites {
            self.instructions[site].set_operand(new).context(InstructionSnafu)?;
        }
        Ok(sites.len())
    }

    fn resolve(&self, function: FuncRef<'_>) -> Result<i64> {
        match function {
            FuncRef::Name(name) => match self.symbols.get(name) {
                Some(entry) => Ok(entry.address),
                None => UnknownSymbolSnafu { name }.fail(),
            },
            FuncRef::Address(address) => Ok(address),
        }
    }

    /// Serializes the image, installing the init hook if data was added.
    ///
    /// If `forge_crc` is true the result will have the same CRC-32 checksum as the original
    /// file, by sacrificing the reserved null word at the start of the data section.
    ///
    /// # Errors
    /// Returns [`MissingInitSymbol`](Error::MissingInitSymbol) or
    /// [`InitNeverCalled`](Error::InitNeverCalled) if added data can't be installed.
    pub fn write_to_bytes(&mut self, forge_crc: bool) -> Result<Vec<u8>> {
        self.add_data_init_code()?;

        let code = pad(assemble(&self.instructions), 4);
        let code_offset = HEADER_SIZE;
        let data_offset = code_offset + code.len();
        let persistent = self.original_data_length + self.original_lit_length;

        let header = Header {
            vm_magic: self.vm_magic,
            instruction_count: self.instructions.len() as u32,
            code_offset: code_offset as u32,
            code_length: code.len() as u32,
            data_offset: data_offset as u32,
            data_length: self.original_data_length as u32,
            lit_length: self.original_lit_length as u32,
            // everything beyond the persistent prefix is bss, plus a fresh stack
            bss_length: (self.memory.len() - persistent + STACK_SIZE) as u32,
        };

        let mut output = Vec::with_capacity(data_offset + persistent);
        header.write(&mut output);
        output.extend_from_slice(&code);
        output.extend_from_slice(&self.memory.slice(0, persistent));

        if forge_crc {
            // nobody should be using address 0, so its word can absorb the checksum fixup
            forge_crc32(&mut output, data_offset, self.original_crc).context(ForgeSnafu)?;
        }

        log::debug!(
            "wrote qvm: {} instructions, {} bytes",
            self.instructions.len(),
            output.len()
        );
        Ok(output)
    }

    /// Writes the image to a file. See [`write_to_bytes`](Self::write_to_bytes).
    ///
    /// # Errors
    /// Additionally returns [`FileError`](Error::FileError) if the file cannot be written.
    #[cfg(feature = "std")]
    pub fn write<P: AsRef<Path>>(&mut self, path: P, forge_crc: bool) -> Result<()> {
        let output = self.write_to_bytes(forge_crc)?;
        std::fs::write(path, output)?;
        Ok(())
    }

    /// Returns true if any DATA or LIT region beyond the original file's prefix exists.
    fn has_new_regions(&self) -> bool {
        let data_prefix = (0, self.original_data_length);
        let lit_prefix = (
            self.original_data_length,
            self.original_data_length + self.original_lit_length,
        );

        self.memory.regions().iter().any(|region| {
            let bounds = (region.begin(), region.end());
            match region.tag() {
                RegionTag::Data => bounds != data_prefix,
                RegionTag::Lit => bounds != lit_prefix,
                RegionTag::Bss => false,
            }
        })
    }

    fn emit(&mut self, opcode: Opcode, operand: Option<i64>) -> Result<()> {
        let instruction = match operand {
            Some(value) => Instruction::with_operand(opcode, value),
            None => Instruction::new(opcode),
        }
        .context(InstructionSnafu)?;
        self.instructions.push(instruction);
        Ok(())
    }

    fn read_word(&self, address: usize) -> u32 {
        let bytes = self.memory.slice(address, address + 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Synthesizes the init hook: a wrapper function that stores every non-zero byte of added
    /// DATA/LIT at load time and forwards to the engine's init routine.
    fn add_data_init_code(&mut self) -> Result<()> {
        if !self.has_new_regions() {
            return Ok(());
        }

        let (init_name, original_init) = INIT_SYMBOLS
            .iter()
            .find_map(|name| self.symbols.get(*name).map(|entry| (*name, entry.address)))
            .context(MissingInitSymbolSnafu)?;

        let call_sites = self.calls.get(&original_init).map(Vec::as_slice).unwrap_or_default();
        ensure!(!call_sites.is_empty(), InitNeverCalledSnafu { name: init_name });

        // only hook the first call site in case there are multiple; it is the one invoked from
        // vmMain when the qvm is first loaded. Re-reading its operand keeps repeated patching
        // working: an already-installed wrapper simply gets wrapped again.
        let call_site = call_sites[0];
        let current_init = match self.instructions[call_site].operand() {
            Some(Operand::Int(value)) => value,
            _ => original_init,
        };

        let init_wrapper = self.instructions.len() as i64;
        self.emit(Opcode::Enter, Some(0x100))?;

        // initialize new data, word by word
        let data_regions: Vec<(usize, usize)> = self
            .memory
            .regions_with_tag(RegionTag::Data)
            .map(|region| (region.begin(), region.end()))
            .filter(|&bounds| bounds != (0, self.original_data_length))
            .collect();
        for (begin, end) in data_regions {
            for address in (begin..end).step_by(4) {
                let value = self.read_word(address);
                if value != 0 {
                    self.emit(Opcode::Const, Some(address as i64))?;
                    self.emit(Opcode::Const, Some(i64::from(value)))?;
                    self.emit(Opcode::Store4, None)?;
                }
            }
        }

        // initialize new lit, byte by byte
        let lit_prefix = (
            self.original_data_length,
            self.original_data_length + self.original_lit_length,
        );
        let lit_regions: Vec<(usize, usize)> = self
            .memory
            .regions_with_tag(RegionTag::Lit)
            .map(|region| (region.begin(), region.end()))
            .filter(|&bounds| bounds != lit_prefix)
            .collect();
        for (begin, end) in lit_regions {
            for address in begin..end {
                let value = self.memory.get(address).unwrap_or_default();
                if value != 0 {
                    self.emit(Opcode::Const, Some(address as i64))?;
                    self.emit(Opcode::Const, Some(i64::from(value)))?;
                    self.emit(Opcode::Store1, None)?;
                }
            }
        }

        // forward the three engine arguments and tail-call the real init routine
        self.emit(Opcode::Local, Some(0x108))?;
        self.emit(Opcode::Load4, None)?;
        self.emit(Opcode::Arg, Some(0x8))?;
        self.emit(Opcode::Local, Some(0x10C))?;
        self.emit(Opcode::Load4, None)?;
        self.emit(Opcode::Arg, Some(0xC))?;
        self.emit(Opcode::Local, Some(0x110))?;
        self.emit(Opcode::Load4, None)?;
        self.emit(Opcode::Arg, Some(0x10))?;
        self.emit(Opcode::Const, Some(current_init))?;
        self.emit(Opcode::Call, None)?;
        self.emit(Opcode::Leave, Some(0x100))?;
        // dummy end proc so strict interpreters don't complain
        self.emit(Opcode::Push, None)?;
        self.emit(Opcode::Leave, Some(0x100))?;

        self.instructions[call_site].set_operand(init_wrapper).context(InstructionSnafu)?;
        log::info!("installed init hook for {init_name} at address {init_wrapper:#x}");
        Ok(())
    }
}

fn index_calls(instructions: &[Instruction]) -> HashMap<i64, Vec<usize>> {
    let mut calls: HashMap<i64, Vec<usize>> = HashMap::new();
    for index in 0..instructions.len().saturating_sub(1) {
        if instructions[index].opcode() == Opcode::Const
            && instructions[index + 1].opcode() == Opcode::Call
        {
            if let Some(Operand::Int(target)) = instructions[index].operand() {
                calls.entry(target).or_default().push(index);
            }
        }
    }
    calls
}

#[cfg(test)]
mod tests {
    use super::*;

    const VM_MAGIC: u32 = 0x1272_1444;
    const INIT_ADDRESS: i64 = 10;

    fn ins(opcode: Opcode) -> Instruction {
        Instruction::new(opcode).unwrap()
    }

    fn ins_op(opcode: Opcode, operand: i64) -> Instruction {
        Instruction::with_operand(opcode, operand).unwrap()
    }

    /// A hand-built program: vmMain calls G_InitGame (address 10) twice, then G_InitGame itself.
    fn sample_instructions() -> Vec<Instruction> {
        vec![
            ins_op(Opcode::Enter, 8),
            ins_op(Opcode::Const, INIT_ADDRESS), // first call site, invoked by the engine
            ins(Opcode::Call),
            ins(Opcode::Pop),
            ins_op(Opcode::Const, INIT_ADDRESS), // second call site, must stay untouched
            ins(Opcode::Call),
            ins(Opcode::Pop),
            ins(Opcode::Push),
            ins_op(Opcode::Leave, 8),
            ins(Opcode::Break),
            ins_op(Opcode::Enter, 8), // G_InitGame
            ins(Opcode::Push),
            ins_op(Opcode::Leave, 8),
        ]
    }

    /// Serializes `sample_instructions` into a complete .qvm file: two data words (the null word
    /// and 0x11223344), four lit bytes, and 0x20 bytes of bss past the reserved stack.
    fn sample_file() -> Vec<u8> {
        let code = pad(assemble(&sample_instructions()), 4);
        let data_offset = HEADER_SIZE + code.len();

        let mut file = Vec::new();
        Header {
            vm_magic: VM_MAGIC,
            instruction_count: sample_instructions().len() as u32,
            code_offset: HEADER_SIZE as u32,
            code_length: code.len() as u32,
            data_offset: data_offset as u32,
            data_length: 8,
            lit_length: 4,
            bss_length: (0x20 + STACK_SIZE) as u32,
        }
        .write(&mut file);
        file.extend_from_slice(&code);
        file.extend_from_slice(&0u32.to_le_bytes());
        file.extend_from_slice(&0x1122_3344u32.to_le_bytes());
        file.extend_from_slice(b"Hi!\x00");
        file
    }

    fn init_symbols() -> SymbolTable {
        let mut symbols = SymbolTable::new();
        symbols.insert("G_InitGame".to_string(), SymbolEntry::code(INIT_ADDRESS));
        symbols
    }

    fn load_sample() -> Qvm {
        Qvm::from_bytes(&sample_file(), init_symbols()).unwrap()
    }

    #[test]
    fn load() {
        let qvm = load_sample();

        assert_eq!(qvm.vm_magic(), VM_MAGIC);
        assert_eq!(qvm.instructions(), sample_instructions());
        assert_eq!(qvm.data_length(), 8);
        assert_eq!(qvm.lit_length(), 4);
        // the reserved stack is carved back out of bss
        assert_eq!(qvm.memory().len(), 8 + 4 + 0x20);
        assert_eq!(qvm.memory().slice(8, 12), b"Hi!\x00");
        assert_eq!(qvm.calls[&INIT_ADDRESS], [1, 4]);
        assert_eq!(qvm.original_crc(), crc32(&sample_file()));
    }

    #[test]
    fn load_truncates_code_padding() {
        // the padding added after the code section decodes as spurious instructions
        let qvm = load_sample();
        assert_eq!(qvm.instructions().len(), sample_instructions().len());
    }

    #[test]
    fn load_rejects_malformed_headers() {
        assert!(matches!(
            Qvm::from_bytes(&[0u8; 16], SymbolTable::new()),
            Err(Error::EndOfFile)
        ));

        let mut file = sample_file();
        file[28..32].copy_from_slice(&0u32.to_le_bytes()); // bss smaller than the stack
        assert!(matches!(
            Qvm::from_bytes(&file, SymbolTable::new()),
            Err(Error::InvalidHeader { .. })
        ));

        let mut file = sample_file();
        file[4..8].copy_from_slice(&1000u32.to_le_bytes()); // more instructions than bytes
        assert!(matches!(
            Qvm::from_bytes(&file, SymbolTable::new()),
            Err(Error::InvalidHeader { .. })
        ));
    }

    #[test]
    fn zero_mutation_write_round_trips() {
        let file = sample_file();
        let mut qvm = Qvm::from_bytes(&file, SymbolTable::new()).unwrap();
        // no init symbol is needed when nothing was added
        let written = qvm.write_to_bytes(false).unwrap();

        let reloaded = Qvm::from_bytes(&written, SymbolTable::new()).unwrap();
        assert_eq!(reloaded.vm_magic(), VM_MAGIC);
        assert_eq!(reloaded.instructions(), sample_instructions());
        assert_eq!(reloaded.memory().slice(0, 12), qvm.memory().slice(0, 12));
    }

    #[test]
    fn forged_write_keeps_the_original_checksum() {
        let file = sample_file();
        let mut qvm = Qvm::from_bytes(&file, SymbolTable::new()).unwrap();
        let written = qvm.write_to_bytes(true).unwrap();
        assert_eq!(crc32(&written), crc32(&file));
    }

    #[test]
    fn replace_calls_by_name_and_address() {
        let mut qvm = load_sample();
        qvm.add_symbol("G_InitGame_hook", SymbolEntry::code(100));

        let count = qvm.replace_calls("G_InitGame", "G_InitGame_hook").unwrap();
        assert_eq!(count, 2);
        assert_eq!(qvm.instructions()[1], ins_op(Opcode::Const, 100));
        assert_eq!(qvm.instructions()[4], ins_op(Opcode::Const, 100));

        // the index is keyed by the original targets
        assert_eq!(qvm.replace_calls(100i64, INIT_ADDRESS).unwrap(), 0);
        assert_eq!(qvm.replace_calls(INIT_ADDRESS, 100u32).unwrap(), 2);

        assert!(matches!(
            qvm.replace_calls("missing", "G_InitGame"),
            Err(Error::UnknownSymbol { .. })
        ));
    }

    #[test]
    fn add_code_returns_the_address() {
        let mut qvm = load_sample();
        let address = qvm.add_code([ins(Opcode::Push), ins_op(Opcode::Leave, 8)]);
        assert_eq!(address, 13);
        assert_eq!(qvm.instructions().len(), 15);
    }

    #[test]
    fn init_hook_installation() {
        let mut qvm = load_sample();
        let address = qvm.add_data(&0xDEAD_BEEFu32.to_le_bytes(), 4).unwrap();
        assert_eq!(address, 0x2C);

        let written = qvm.write_to_bytes(false).unwrap();
        let wrapper = sample_instructions().len() as i64;

        // the first call site is repointed at the wrapper, the second stays
        assert_eq!(qvm.instructions()[1], ins_op(Opcode::Const, wrapper));
        assert_eq!(qvm.instructions()[4], ins_op(Opcode::Const, INIT_ADDRESS));

        let body = &qvm.instructions()[wrapper as usize..];
        assert_eq!(
            &body[..4],
            [
                ins_op(Opcode::Enter, 0x100),
                ins_op(Opcode::Const, 0x2C),
                ins_op(Opcode::Const, 0xDEAD_BEEF),
                ins(Opcode::Store4),
            ]
        );
        assert_eq!(
            &body[4..],
            [
                ins_op(Opcode::Local, 0x108),
                ins(Opcode::Load4),
                ins_op(Opcode::Arg, 0x8),
                ins_op(Opcode::Local, 0x10C),
                ins(Opcode::Load4),
                ins_op(Opcode::Arg, 0xC),
                ins_op(Opcode::Local, 0x110),
                ins(Opcode::Load4),
                ins_op(Opcode::Arg, 0x10),
                ins_op(Opcode::Const, INIT_ADDRESS),
                ins(Opcode::Call),
                ins_op(Opcode::Leave, 0x100),
                ins(Opcode::Push),
                ins_op(Opcode::Leave, 0x100),
            ]
        );

        // the new word is not persisted; it lands in bss and the header grows accordingly
        let reloaded = Qvm::from_bytes(&written, SymbolTable::new()).unwrap();
        assert_eq!(reloaded.data_length(), 8);
        assert_eq!(reloaded.memory().len(), qvm.memory().len());
    }

    #[test]
    fn init_hook_covers_lit_bytes() {
        let mut qvm = load_sample();
        let address = qvm.add_lit(b"Q\x00", 1).unwrap() as i64;

        qvm.write_to_bytes(false).unwrap();
        let wrapper = sample_instructions().len();
        assert_eq!(
            &qvm.instructions()[wrapper..wrapper + 4],
            [
                ins_op(Opcode::Enter, 0x100),
                ins_op(Opcode::Const, address),
                ins_op(Opcode::Const, i64::from(b'Q')),
                ins(Opcode::Store1),
            ]
        );
    }

    #[test]
    fn repeated_writes_chain_wrappers() {
        let mut qvm = load_sample();
        qvm.add_data(&1u32.to_le_bytes(), 4).unwrap();

        qvm.write_to_bytes(false).unwrap();
        let first_wrapper = match qvm.instructions()[1].operand() {
            Some(Operand::Int(value)) => value,
            other => panic!("unexpected operand {other:?}"),
        };

        qvm.write_to_bytes(false).unwrap();
        let second_wrapper = match qvm.instructions()[1].operand() {
            Some(Operand::Int(value)) => value,
            other => panic!("unexpected operand {other:?}"),
        };

        assert_ne!(first_wrapper, second_wrapper);
        // the new wrapper forwards to the previous one, not to the original init
        let tail_call = qvm
            .instructions()
            .iter()
            .skip(second_wrapper as usize)
            .position(|instruction| instruction.opcode() == Opcode::Call)
            .map(|offset| second_wrapper as usize + offset - 1)
            .unwrap();
        assert_eq!(qvm.instructions()[tail_call], ins_op(Opcode::Const, first_wrapper));
    }

    #[test]
    fn init_hook_requires_a_known_symbol() {
        let mut qvm = Qvm::from_bytes(&sample_file(), SymbolTable::new()).unwrap();
        qvm.add_data(&1u32.to_le_bytes(), 4).unwrap();
        assert!(matches!(qvm.write_to_bytes(false), Err(Error::MissingInitSymbol)));

        // a symbol that exists but is never called is just as useless
        let mut symbols = SymbolTable::new();
        symbols.insert("CG_Init".to_string(), SymbolEntry::code(9));
        let mut qvm = Qvm::from_bytes(&sample_file(), symbols).unwrap();
        qvm.add_data(&1u32.to_le_bytes(), 4).unwrap();
        assert!(matches!(
            qvm.write_to_bytes(false),
            Err(Error::InitNeverCalled { .. })
        ));
    }

    #[test]
    fn bss_additions_need_no_hook() {
        let mut qvm = Qvm::from_bytes(&sample_file(), SymbolTable::new()).unwrap();
        qvm.add_bss(64, 1).unwrap();
        let written = qvm.write_to_bytes(false).unwrap();

        let reloaded = Qvm::from_bytes(&written, SymbolTable::new()).unwrap();
        assert_eq!(reloaded.memory().len(), 8 + 4 + 0x20 + 64);
    }
}
