//! A two-pass assembler for LCC's intermediate bytecode assembly.
//!
//! Quake 3's retargeted LCC compiler emits a line-oriented text format: one mnemonic or directive
//! per line, whitespace-separated. The assembler lowers it to [`Instruction`]s plus populated
//! data/lit/bss segment images while resolving symbols and tracking each procedure's frame layout.
//!
//! The first pass walks every file to discover symbol addresses (references resolve to 0), the
//! second pass re-walks them with the complete symbol table to emit the final code and data.
//! Segment images are rebuilt on each pass; the sizes accumulated by the first pass determine
//! where the lit and bss segments start on the second.

use hashbrown::HashMap;
use qforge_core::util::{align, pad};
use snafu::prelude::*;

#[cfg_attr(not(test), allow(unused_imports))]
use crate::instruction::{self, Instruction, Opcode, Operand};

#[cfg(not(feature = "std"))]
use crate::no_std::*;

/// The address substituted for unresolved symbols when suppression is enabled.
pub const MISSING_SYMBOL_SENTINEL: i64 = 0xC0DE_DA7A;

/// Error conditions for when assembling intermediate assembly. All variants carry the source
/// file name and the most recent `line` directive value.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("{file}:{line}: syntax error: {text}"))]
    Syntax { file: String, line: u32, text: String },

    /// Thrown for mnemonics with no bytecode equivalent (`CVFF4`, the `LOAD*4` family).
    #[snafu(display("{file}:{line}: undefined opcode {mnemonic}"))]
    UndefinedOpcode { file: String, line: u32, mnemonic: String },

    /// Thrown if a `CVII4` width parameter is neither 1 nor 2.
    #[snafu(display("{file}:{line}: bad sign extension {token}"))]
    BadSignExtension { file: String, line: u32, token: String },

    #[snafu(display("{file}:{line}: multiple definitions for {name}"))]
    DuplicateSymbol { file: String, line: u32, name: String },

    #[snafu(display("{file}:{line}: symbol {name} undefined"))]
    UndefinedSymbol { file: String, line: u32, name: String },

    #[snafu(display("{file}:{line}: bad number {token}"))]
    BadNumber { file: String, line: u32, token: String },

    #[snafu(display("{file}:{line}: {source}"))]
    BadInstruction { file: String, line: u32, source: instruction::Error },

    #[cfg(feature = "std")]
    #[snafu(display("unable to read {path}: {source}"))]
    ReadSource { path: String, source: std::io::Error },
}
type Result<T> = core::result::Result<T, Error>;

/// Whether a symbol names code or data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    Code,
    Data,
}

/// A resolved symbol table entry: an absolute address plus a code/data tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SymbolEntry {
    pub address: i64,
    pub kind: SymbolKind,
}

impl SymbolEntry {
    /// Creates a code symbol, the common case for seeding call targets.
    #[inline]
    #[must_use]
    pub const fn code(address: i64) -> Self {
        Self { address, kind: SymbolKind::Code }
    }

    /// Creates a data symbol.
    #[inline]
    #[must_use]
    pub const fn data(address: i64) -> Self {
        Self { address, kind: SymbolKind::Data }
    }
}

/// Maps symbol names to their resolved entries.
pub type SymbolTable = HashMap<String, SymbolEntry>;

/// Where each segment starts, supplied by the caller.
///
/// When `lit_base`/`bss_base` are `None` the segments are chained: lit starts where the data
/// image ends and bss starts where the lit image ends. A `data_base` of 0 reserves the first
/// data word as the null-pointer guard.
#[derive(Clone, Copy, Debug)]
pub struct Layout {
    pub code_base: usize,
    pub data_base: usize,
    pub lit_base: Option<usize>,
    pub bss_base: Option<usize>,
    /// Zero-pad each byte segment to a multiple of 4 at the end of each pass.
    pub pad_segments: bool,
}

impl Default for Layout {
    #[inline]
    fn default() -> Self {
        Self {
            code_base: 0,
            data_base: 0,
            lit_base: None,
            bss_base: None,
            pad_segments: true,
        }
    }
}

/// A byte segment produced by assembly: its base address and its image.
#[derive(Clone, Debug, Default)]
pub struct SegmentImage {
    pub base: usize,
    pub image: Vec<u8>,
}

/// Everything produced by one assembler run.
#[derive(Clone, Debug)]
pub struct Assembly {
    /// The lowered code section.
    pub instructions: Vec<Instruction>,
    pub data: SegmentImage,
    pub lit: SegmentImage,
    /// The bss image is all zeros; only its length matters.
    pub bss: SegmentImage,
    /// The seeded table plus every symbol defined by the input, all absolute.
    pub symbols: SymbolTable,
}

/// Mnemonic to opcode lowering. Mnemonics mapped to `Undef` have no bytecode equivalent and are
/// rejected; mnemonics mapped to `Ignore` (width- and signedness-preserving conversions) are
/// dropped entirely.
fn opcode_for_mnemonic(mnemonic: &str) -> Option<Opcode> {
    Some(match mnemonic {
        "BREAK" => Opcode::Break,
        "CNSTF4" | "CNSTI4" | "CNSTP4" | "CNSTU4" | "CNSTI2" | "CNSTU2" | "CNSTI1" | "CNSTU1"
        | "ADDRGP4" => Opcode::Const,
        "ASGNB" => Opcode::BlockCopy,
        "ASGNF4" | "ASGNI4" | "ASGNP4" | "ASGNU4" => Opcode::Store4,
        "ASGNI2" | "ASGNU2" => Opcode::Store2,
        "ASGNI1" | "ASGNU1" => Opcode::Store1,
        "INDIRB" => Opcode::Ignore,
        "INDIRF4" | "INDIRI4" | "INDIRP4" | "INDIRU4" => Opcode::Load4,
        "INDIRI2" | "INDIRU2" => Opcode::Load2,
        "INDIRI1" | "INDIRU1" => Opcode::Load1,
        "CVFF4" => Opcode::Undef,
        "CVFI4" => Opcode::Cvfi,
        "CVIF4" => Opcode::Cvif,
        "CVII4" => Opcode::Sex8,
        "CVII1" | "CVII2" | "CVIU4" | "CVPU4" | "CVUI4" | "CVUP4" | "CVUU4" | "CVUU1" => {
            Opcode::Ignore
        }
        "NEGF4" => Opcode::Negf,
        "NEGI4" => Opcode::Negi,
        "ADDF4" => Opcode::Addf,
        "ADDI4" | "ADDP4" | "ADDP" | "ADDU4" => Opcode::Add,
        "SUBF4" => Opcode::Subf,
        "SUBI4" | "SUBP4" | "SUBU4" => Opcode::Sub,
        "LSHI4" | "LSHU4" => Opcode::Lsh,
        "MODI4" => Opcode::Modi,
        "MODU4" => Opcode::Modu,
        "RSHI4" => Opcode::Rshi,
        "RSHU4" => Opcode::Rshu,
        "BANDI4" | "BANDU4" => Opcode::Band,
        "BCOMI4" | "BCOMU4" => Opcode::Bcom,
        "BORI4" | "BORU4" => Opcode::Bor,
        "BXORI4" | "BXORU4" => Opcode::Bxor,
        "DIVF4" => Opcode::Divf,
        "DIVI4" => Opcode::Divi,
        "DIVU4" => Opcode::Divu,
        "MULF4" => Opcode::Mulf,
        "MULI4" => Opcode::Muli,
        "MULU4" => Opcode::Mulu,
        "EQF4" => Opcode::Eqf,
        "EQI4" | "EQU4" => Opcode::Eq,
        "GEF4" => Opcode::Gef,
        "GEI4" => Opcode::Gei,
        "GEU4" => Opcode::Geu,
        "GTF4" => Opcode::Gtf,
        "GTI4" => Opcode::Gti,
        "GTU4" => Opcode::Gtu,
        "LEF4" => Opcode::Lef,
        "LEI4" => Opcode::Lei,
        "LEU4" => Opcode::Leu,
        "LTF4" => Opcode::Ltf,
        "LTI4" => Opcode::Lti,
        "LTU4" => Opcode::Ltu,
        "NEF4" => Opcode::Nef,
        "NEI4" | "NEU4" => Opcode::Ne,
        "JUMPV" => Opcode::Jump,
        "LOADB4" | "LOADF4" | "LOADI4" | "LOADP4" | "LOADU4" => Opcode::Undef,
        _ => return None,
    })
}

/// The four segments the input can emit into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Section {
    Code,
    Data,
    Lit,
    Bss,
}

/// A symbol as tracked during assembly: a value relative to its section's base. Code symbols are
/// stored absolute (their section base is always 0), seeded and `equ` symbols have no section.
#[derive(Clone, Copy, Debug)]
struct InternalSymbol {
    section: Option<Section>,
    value: i64,
    kind: SymbolKind,
}

/// The assembler itself, holding only configuration; all per-run state lives in [`Run`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Assembler {
    /// Resolve unknown symbols to [`MISSING_SYMBOL_SENTINEL`] instead of failing.
    pub suppress_missing_symbols: bool,
}

impl Assembler {
    #[inline]
    #[must_use]
    pub fn new(suppress_missing_symbols: bool) -> Self {
        Self { suppress_missing_symbols }
    }

    /// Assembles a set of named source texts.
    ///
    /// The seeded `symbols` are treated as absolute addresses no matter what the layout bases
    /// are, and are returned unchanged alongside the newly defined symbols.
    ///
    /// # Errors
    /// Returns an [`Error`] describing the first syntax, symbol, or operand problem, tagged with
    /// the offending file and line.
    pub fn assemble_sources(
        &self,
        sources: &[(&str, &str)],
        layout: &Layout,
        symbols: &SymbolTable,
    ) -> Result<Assembly> {
        let mut run = Run::new(self.suppress_missing_symbols, layout);

        // provided symbols are relative to 0, no matter what the bases are
        for (name, entry) in symbols {
            run.symbols.insert(
                name.clone(),
                InternalSymbol { section: None, value: entry.address, kind: entry.kind },
            );
        }

        for pass_number in 0..2 {
            run.begin_pass(pass_number, layout);

            for (file_index, (name, text)) in sources.iter().enumerate() {
                run.file_index = file_index;
                // until the input's own `file` directive shows up
                run.file = (*name).to_string();
                for line in text.lines() {
                    run.assemble_line(line)?;
                }
            }

            if layout.pad_segments {
                run.data = pad(core::mem::take(&mut run.data), 4);
                run.lit = pad(core::mem::take(&mut run.lit), 4);
                run.bss = pad(core::mem::take(&mut run.bss), 4);
            }
        }

        Ok(run.finish())
    }

    /// Assembles a set of files from disk. See [`assemble_sources`](Self::assemble_sources).
    ///
    /// # Errors
    /// Additionally returns [`ReadSource`](Error::ReadSource) if a file cannot be read.
    #[cfg(feature = "std")]
    pub fn assemble_files<P: AsRef<std::path::Path>>(
        &self,
        paths: &[P],
        layout: &Layout,
        symbols: &SymbolTable,
    ) -> Result<Assembly> {
        let mut texts = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path).context(ReadSourceSnafu {
                path: path.display().to_string(),
            })?;
            texts.push((path.display().to_string(), text));
        }
        let sources: Vec<(&str, &str)> =
            texts.iter().map(|(name, text)| (name.as_str(), text.as_str())).collect();
        self.assemble_sources(&sources, layout, symbols)
    }
}

struct Run {
    suppress_missing_symbols: bool,
    pass_number: u8,

    symbols: HashMap<String, InternalSymbol>,
    last_symbol: Option<String>,
    file_index: usize,

    // diagnostics follow the `file`/`line` debug directives in the input
    file: String,
    line: u32,

    section: Section,
    code: Vec<Instruction>,
    data: Vec<u8>,
    lit: Vec<u8>,
    bss: Vec<u8>,

    code_base: usize,
    data_base: usize,
    lit_base: usize,
    bss_base: usize,

    current_args: i64,
    current_locals: i64,
    current_arg_offset: i64,
}

impl Run {
    fn new(suppress_missing_symbols: bool, layout: &Layout) -> Self {
        Self {
            suppress_missing_symbols,
            pass_number: 0,
            symbols: HashMap::new(),
            last_symbol: None,
            file_index: 0,
            file: String::from("unknown"),
            line: 0,
            section: Section::Code,
            code: Vec::new(),
            data: Vec::new(),
            lit: Vec::new(),
            bss: Vec::new(),
            code_base: layout.code_base,
            data_base: layout.data_base,
            lit_base: 0,
            bss_base: 0,
            current_args: 0,
            current_locals: 0,
            current_arg_offset: 0,
        }
    }

    /// Re-seeds the segment bases from the previous pass's image sizes, then clears the images.
    fn begin_pass(&mut self, pass_number: u8, layout: &Layout) {
        self.pass_number = pass_number;
        self.data_base = layout.data_base;
        self.lit_base = layout.lit_base.unwrap_or(self.data_base + self.data.len());
        self.bss_base = layout.bss_base.unwrap_or(self.lit_base + self.lit.len());

        self.code.clear();
        self.data.clear();
        self.lit.clear();
        self.bss.clear();
        self.section = Section::Code;

        if layout.data_base == 0 {
            // reserve address 0 for null pointers
            self.data.extend_from_slice(&[0; 4]);
        }
    }

    fn finish(self) -> Assembly {
        let symbols = self
            .symbols
            .iter()
            .map(|(name, symbol)| {
                let base = self.section_base(symbol.section);
                (name.clone(), SymbolEntry { address: symbol.value + base, kind: symbol.kind })
            })
            .collect();

        Assembly {
            instructions: self.code,
            data: SegmentImage { base: self.data_base, image: self.data },
            lit: SegmentImage { base: self.lit_base, image: self.lit },
            bss: SegmentImage { base: self.bss_base, image: self.bss },
            symbols,
        }
    }

    fn section_base(&self, section: Option<Section>) -> i64 {
        match section {
            // code symbol values already include the code base
            None | Some(Section::Code) => 0,
            Some(Section::Data) => self.data_base as i64,
            Some(Section::Lit) => self.lit_base as i64,
            Some(Section::Bss) => self.bss_base as i64,
        }
    }

    /// The address the next emitted instruction will have.
    fn code_address(&self) -> i64 {
        (self.code_base + self.code.len()) as i64
    }

    fn assemble_line(&mut self, line: &str) -> Result<()> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&first) = tokens.first() else {
            return Ok(());
        };

        if let Some(opcode) = opcode_for_mnemonic(first) {
            return self.assemble_mnemonic(first, opcode, &tokens);
        }

        match first {
            _ if first.starts_with("CALL") => {
                self.current_arg_offset = 0;
                self.emit(Opcode::Call, None)
            }
            _ if first.starts_with("ARG") => {
                self.current_arg_offset += 4;
                self.emit(Opcode::Arg, Some(8 + self.current_arg_offset - 4))
            }
            _ if first.starts_with("RET") => {
                self.emit(Opcode::Leave, Some(8 + self.current_locals + self.current_args))
            }
            _ if first.starts_with("pop") => self.emit(Opcode::Pop, None),
            _ if first.starts_with("ADDRF") => {
                let offset = self.parse_expression(self.expect_token(&tokens, 1, line)?)?;
                self.emit(Opcode::Local, Some(offset + 16 + self.current_args + self.current_locals))
            }
            _ if first.starts_with("ADDRL") => {
                let offset = self.parse_expression(self.expect_token(&tokens, 1, line)?)?;
                self.emit(Opcode::Local, Some(offset + 8 + self.current_args))
            }
            "proc" => {
                let name = self.expect_token(&tokens, 1, line)?;
                let address = self.code_address();
                self.define_symbol(name, address, Some(Section::Code), SymbolKind::Code)?;
                self.current_locals = align_i64(self.parse_int(self.expect_token(&tokens, 2, line)?)?);
                self.current_args = align_i64(self.parse_int(self.expect_token(&tokens, 3, line)?)?);
                self.emit(Opcode::Enter, Some(8 + self.current_locals + self.current_args))
            }
            "endproc" => {
                self.emit(Opcode::Push, None)?;
                self.emit(Opcode::Leave, Some(8 + self.current_locals + self.current_args))
            }
            "address" => {
                let value = self.parse_expression(self.expect_token(&tokens, 1, line)?)?;
                self.hack_to_section(Section::Data);
                self.emit_bytes(&(value as u32).to_le_bytes(), line)
            }
            "code" => {
                self.section = Section::Code;
                Ok(())
            }
            "data" => {
                self.section = Section::Data;
                Ok(())
            }
            "lit" => {
                self.section = Section::Lit;
                Ok(())
            }
            "bss" => {
                self.section = Section::Bss;
                Ok(())
            }
            "equ" => {
                let name = self.expect_token(&tokens, 1, line)?;
                let value = self.parse_int(self.expect_token(&tokens, 2, line)?)?;
                self.define_symbol(name, value, None, SymbolKind::Data)
            }
            "align" => {
                let alignment = self.parse_size(self.expect_token(&tokens, 1, line)?)?;
                let position = self.section_position(line)?;
                let padding = align(position, alignment.max(1)) - position;
                self.emit_bytes(&vec![0; padding], line)
            }
            "skip" => {
                let size = self.parse_size(self.expect_token(&tokens, 1, line)?)?;
                self.emit_bytes(&vec![0; size], line)
            }
            "byte" => {
                let size = self.parse_int(self.expect_token(&tokens, 1, line)?)?;
                let value = self.parse_int(self.expect_token(&tokens, 2, line)?)?;
                match size {
                    1 => self.hack_to_section(Section::Lit),
                    4 => self.hack_to_section(Section::Data),
                    _ => {}
                }
                let bytes = value.to_le_bytes();
                match size {
                    1 => self.emit_bytes(&bytes[..1], line),
                    2 => self.emit_bytes(&bytes[..2], line),
                    4 => self.emit_bytes(&bytes[..4], line),
                    _ => SyntaxSnafu {
                        file: self.file.clone(),
                        line: self.line,
                        text: line.trim().to_string(),
                    }
                    .fail(),
                }
            }
            _ if first.starts_with("LABEL") => {
                let name = self.expect_token(&tokens, 1, line)?;
                if self.section == Section::Code {
                    let address = self.code_address();
                    self.define_symbol(name, address, Some(Section::Code), SymbolKind::Code)
                } else {
                    let offset = self.section_image_len() as i64;
                    self.define_symbol(name, offset, Some(self.section), SymbolKind::Data)
                }
            }
            "file" => {
                self.file = self
                    .expect_token(&tokens, 1, line)?
                    .trim_matches('"')
                    .to_string();
                Ok(())
            }
            "line" => {
                self.line = self.parse_size(self.expect_token(&tokens, 1, line)?)? as u32;
                Ok(())
            }
            "import" | "export" => Ok(()),
            _ if first.starts_with(';') => Ok(()),
            _ => SyntaxSnafu {
                file: self.file.clone(),
                line: self.line,
                text: line.trim().to_string(),
            }
            .fail(),
        }
    }

    fn assemble_mnemonic(&mut self, mnemonic: &str, opcode: Opcode, tokens: &[&str]) -> Result<()> {
        let mut opcode = opcode;

        if opcode == Opcode::Undef {
            return UndefinedOpcodeSnafu {
                file: self.file.clone(),
                line: self.line,
                mnemonic: mnemonic.to_string(),
            }
            .fail();
        }

        if opcode == Opcode::Ignore {
            return Ok(());
        }

        let mut tokens = tokens;
        if opcode == Opcode::Sex8 {
            // sign extensions are decided by the next parameter's width
            let parameter = tokens.get(1).copied().unwrap_or_default();
            opcode = match parameter.as_bytes().first() {
                Some(b'1') => Opcode::Sex8,
                Some(b'2') => Opcode::Sex16,
                _ => {
                    return BadSignExtensionSnafu {
                        file: self.file.clone(),
                        line: self.line,
                        token: parameter.to_string(),
                    }
                    .fail()
                }
            };
            // drop the parameter now that we have the right opcode
            tokens = &tokens[..1];
        }

        let operand = if tokens.len() >= 2 && !matches!(opcode, Opcode::Cvif | Opcode::Cvfi) {
            let mut value = self.parse_expression(tokens[1])?;
            if opcode == Opcode::BlockCopy {
                value = align_i64(value);
            }
            Some(value)
        } else {
            None
        };

        self.emit(opcode, operand)
    }

    fn emit(&mut self, opcode: Opcode, operand: Option<i64>) -> Result<()> {
        let instruction = match operand {
            Some(value) => Instruction::with_operand(opcode, value),
            None => Instruction::new(opcode),
        }
        .context(BadInstructionSnafu { file: self.file.clone(), line: self.line })?;
        self.code.push(instruction);
        Ok(())
    }

    /// Appends raw bytes to the current segment, which must not be the code segment.
    fn emit_bytes(&mut self, bytes: &[u8], line: &str) -> Result<()> {
        let image = match self.section {
            Section::Data => &mut self.data,
            Section::Lit => &mut self.lit,
            Section::Bss => &mut self.bss,
            Section::Code => {
                return SyntaxSnafu {
                    file: self.file.clone(),
                    line: self.line,
                    text: line.trim().to_string(),
                }
                .fail()
            }
        };
        image.extend_from_slice(bytes);
        Ok(())
    }

    fn section_image_len(&self) -> usize {
        match self.section {
            Section::Code => self.code.len(),
            Section::Data => self.data.len(),
            Section::Lit => self.lit.len(),
            Section::Bss => self.bss.len(),
        }
    }

    /// The absolute address of the current segment's next byte, for `align`.
    fn section_position(&self, line: &str) -> Result<usize> {
        let base = match self.section {
            Section::Data => self.data_base,
            Section::Lit => self.lit_base,
            Section::Bss => self.bss_base,
            Section::Code => {
                return SyntaxSnafu {
                    file: self.file.clone(),
                    line: self.line,
                    text: line.trim().to_string(),
                }
                .fail()
            }
        };
        Ok(base + self.section_image_len())
    }

    /// Certain byte directives must emit into a segment other than the one the current mnemonic
    /// implies. On the defining pass, the most recently defined symbol moves along: its label
    /// precedes the data it refers to in LCC's output.
    fn hack_to_section(&mut self, section: Section) {
        if self.section != section {
            self.section = section;
            if self.pass_number == 0 {
                let offset = self.section_image_len() as i64;
                if let Some(name) = &self.last_symbol {
                    if let Some(symbol) = self.symbols.get_mut(name) {
                        symbol.section = Some(section);
                        symbol.value = offset;
                    }
                }
            }
        }
    }

    /// Symbols are defined on the first pass only; the second pass keeps the completed table.
    fn define_symbol(
        &mut self,
        name: &str,
        value: i64,
        section: Option<Section>,
        kind: SymbolKind,
    ) -> Result<()> {
        if self.pass_number == 1 {
            return Ok(());
        }

        let name = self.scoped_name(name);
        ensure!(
            !self.symbols.contains_key(&name),
            DuplicateSymbolSnafu { file: self.file.clone(), line: self.line, name }
        );

        self.symbols.insert(name.clone(), InternalSymbol { section, value, kind });
        self.last_symbol = Some(name);
        Ok(())
    }

    /// Lookups resolve to 0 on the first pass, when addresses aren't known yet.
    fn lookup_symbol(&self, name: &str) -> Result<i64> {
        if self.pass_number == 0 {
            return Ok(0);
        }

        let name = self.scoped_name(name);
        match self.symbols.get(&name) {
            Some(symbol) => Ok(symbol.value + self.section_base(symbol.section)),
            None if self.suppress_missing_symbols => {
                log::debug!("unresolved symbol {name}, substituting sentinel");
                Ok(MISSING_SYMBOL_SENTINEL)
            }
            None => {
                UndefinedSymbolSnafu { file: self.file.clone(), line: self.line, name }.fail()
            }
        }
    }

    /// Local symbols start with `$` and are scoped to their file.
    fn scoped_name(&self, name: &str) -> String {
        if name.starts_with('$') {
            format!("{name}_{}", self.file_index)
        } else {
            name.to_string()
        }
    }

    /// Evaluates a whitespace-free expression: terms joined by `+`/`-`, left to right, where each
    /// term is a decimal literal or a symbol name.
    fn parse_expression(&self, expression: &str) -> Result<i64> {
        let bytes = expression.as_bytes();
        let mut start = 0;
        let mut last_op = None;
        let mut value = 0i64;

        for i in 0..=bytes.len() {
            // a '-' past the start is a separator, a leading one is a sign
            let boundary =
                i == bytes.len() || bytes[i] == b'+' || (bytes[i] == b'-' && i > 0);
            if !boundary {
                continue;
            }

            let term = &expression[start..i];
            start = i + 1;

            if term.is_empty() && last_op.is_none() && i < bytes.len() {
                // a leading sign has no left-hand term
                last_op = Some(bytes[i]);
                continue;
            }

            match last_op {
                Some(b'-') => value -= self.parse_int(term)?,
                Some(_) => value += self.parse_int(term)?,
                // only the first term may name a symbol
                None => {
                    value = match term.as_bytes().first() {
                        Some(b'+' | b'-' | b'0'..=b'9') => self.parse_int(term)?,
                        Some(_) => self.lookup_symbol(term)?,
                        None => self.parse_int(term)?,
                    };
                }
            }

            if i < bytes.len() {
                last_op = Some(bytes[i]);
            }
        }

        Ok(value)
    }

    fn parse_int(&self, token: &str) -> Result<i64> {
        token.parse::<i64>().ok().context(BadNumberSnafu {
            file: self.file.clone(),
            line: self.line,
            token: token.to_string(),
        })
    }

    fn parse_size(&self, token: &str) -> Result<usize> {
        usize::try_from(self.parse_int(token)?).ok().context(BadNumberSnafu {
            file: self.file.clone(),
            line: self.line,
            token: token.to_string(),
        })
    }

    fn expect_token<'a>(&self, tokens: &[&'a str], index: usize, line: &str) -> Result<&'a str> {
        tokens.get(index).copied().context(SyntaxSnafu {
            file: self.file.clone(),
            line: self.line,
            text: line.trim().to_string(),
        })
    }
}

/// Frame sizes and block-copy lengths are rounded up to whole words.
fn align_i64(value: i64) -> i64 {
    value + (4 - value.rem_euclid(4)) % 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Opcode as Op;

    fn assemble(text: &str) -> Assembly {
        Assembler::new(false)
            .assemble_sources(&[("test.asm", text)], &Layout::default(), &SymbolTable::new())
            .unwrap()
    }

    fn assemble_err(text: &str) -> Error {
        Assembler::new(false)
            .assemble_sources(&[("test.asm", text)], &Layout::default(), &SymbolTable::new())
            .unwrap_err()
    }

    fn ops(assembly: &Assembly) -> Vec<(Op, Option<i64>)> {
        assembly
            .instructions
            .iter()
            .map(|instruction| {
                let operand = match instruction.operand() {
                    Some(Operand::Int(value)) => Some(value),
                    Some(Operand::Float(_)) => panic!("unexpected float"),
                    None => None,
                };
                (instruction.opcode(), operand)
            })
            .collect()
    }

    #[test]
    fn proc_lowering() {
        let assembly = assemble(
            "code\n\
             proc foo 8 4\n\
             CNSTI4 42\n\
             RETI4\n\
             endproc\n",
        );

        assert_eq!(
            ops(&assembly),
            [
                (Op::Enter, Some(0x14)),
                (Op::Const, Some(0x2A)),
                (Op::Leave, Some(0x14)),
                (Op::Push, None),
                (Op::Leave, Some(0x14)),
            ]
        );
        assert_eq!(
            assembly.symbols["foo"],
            SymbolEntry { address: 0, kind: SymbolKind::Code }
        );
    }

    #[test]
    fn call_and_arg_offsets() {
        let assembly = assemble(
            "code\n\
             proc foo 0 8\n\
             ARGI4\n\
             ARGI4\n\
             CALLV\n\
             ARGI4\n\
             endproc\n",
        );

        assert_eq!(
            ops(&assembly),
            [
                (Op::Enter, Some(0x10)),
                (Op::Arg, Some(0x8)),
                (Op::Arg, Some(0xC)),
                (Op::Call, None),
                // CALL resets the running argument offset
                (Op::Arg, Some(0x8)),
                (Op::Push, None),
                (Op::Leave, Some(0x10)),
            ]
        );
    }

    #[test]
    fn frame_addressing() {
        let assembly = assemble(
            "code\n\
             proc foo 6 3\n\
             ADDRFP4 0\n\
             ADDRLP4 4\n\
             endproc\n",
        );

        // locals and args are rounded up to whole words
        assert_eq!(
            ops(&assembly),
            [
                (Op::Enter, Some(8 + 8 + 4)),
                (Op::Local, Some(0 + 16 + 4 + 8)),
                (Op::Local, Some(4 + 8 + 4)),
                (Op::Push, None),
                (Op::Leave, Some(8 + 8 + 4)),
            ]
        );
    }

    #[test]
    fn sign_extension() {
        let assembly = assemble("code\nCVII4 1\nCVII4 2\n");
        assert_eq!(ops(&assembly), [(Op::Sex8, None), (Op::Sex16, None)]);

        assert!(matches!(
            assemble_err("code\nCVII4 3\n"),
            Error::BadSignExtension { .. }
        ));
    }

    #[test]
    fn erased_and_undefined_mnemonics() {
        let assembly = assemble("code\nCVIU4\nINDIRB\nCVUU1\n");
        assert!(assembly.instructions.is_empty());

        assert!(matches!(assemble_err("code\nLOADI4\n"), Error::UndefinedOpcode { .. }));
        assert!(matches!(assemble_err("code\nCVFF4\n"), Error::UndefinedOpcode { .. }));
    }

    #[test]
    fn block_copy_rounds_up() {
        let assembly = assemble("code\nASGNB 6\n");
        assert_eq!(ops(&assembly), [(Op::BlockCopy, Some(8))]);
    }

    #[test]
    fn data_directives() {
        let assembly = assemble(
            "data\n\
             export three\n\
             align 4\n\
             LABELV three\n\
             byte 4 3\n\
             byte 4 -1\n\
             skip 8\n\
             lit\n\
             align 1\n\
             LABELV text\n\
             byte 1 104\n\
             byte 1 105\n",
        );

        // the default layout reserves the null word
        let mut expected = vec![0u8; 4];
        expected.extend_from_slice(&3u32.to_le_bytes());
        expected.extend_from_slice(&(-1i32).to_le_bytes());
        expected.extend_from_slice(&[0; 8]);
        assert_eq!(assembly.data.image, expected);
        assert_eq!(assembly.symbols["three"].address, 4);
        assert_eq!(assembly.symbols["three"].kind, SymbolKind::Data);

        // lit is based after the padded data image
        assert_eq!(assembly.lit.base, 20);
        assert_eq!(assembly.lit.image, b"hi\x00\x00");
        assert_eq!(assembly.symbols["text"].address, 20);
    }

    #[test]
    fn address_emits_into_data() {
        let assembly = assemble(
            "data\n\
             LABELV table\n\
             address entry\n\
             address entry+4\n\
             code\n\
             proc entry 0 0\n\
             endproc\n",
        );

        let mut expected = vec![0u8; 4];
        expected.extend_from_slice(&0u32.to_le_bytes());
        expected.extend_from_slice(&4u32.to_le_bytes());
        assert_eq!(assembly.data.image, expected);
    }

    #[test]
    fn lit_label_rehomed_to_data() {
        // LCC emits the label before it knows which segment the initializer lands in
        let assembly = assemble(
            "lit\n\
             LABELV value\n\
             byte 4 7\n",
        );
        assert_eq!(assembly.symbols["value"].address, 4);
        assert!(assembly.lit.image.is_empty());
        assert_eq!(&assembly.data.image[4..8], &7u32.to_le_bytes());
    }

    #[test]
    fn expressions() {
        let assembly = assemble(
            "data\n\
             LABELV base\n\
             byte 4 1\n\
             code\n\
             CNSTI4 10+4-2\n\
             ADDRGP4 base+8\n\
             CNSTI4 -12\n",
        );
        assert_eq!(
            ops(&assembly),
            [
                (Op::Const, Some(12)),
                (Op::Const, Some(12)),
                (Op::Const, Some(-12)),
            ]
        );
    }

    #[test]
    fn local_symbols_are_file_scoped() {
        let sources = [
            ("a.asm", "data\nLABELV $0\nbyte 4 1\ncode\nADDRGP4 $0\n"),
            ("b.asm", "data\nLABELV $0\nbyte 4 2\ncode\nADDRGP4 $0\n"),
        ];
        let assembly = Assembler::new(false)
            .assemble_sources(&sources, &Layout::default(), &SymbolTable::new())
            .unwrap();

        assert_eq!(ops(&assembly), [(Op::Const, Some(4)), (Op::Const, Some(8))]);
        assert!(assembly.symbols.contains_key("$0_0"));
        assert!(assembly.symbols.contains_key("$0_1"));
    }

    #[test]
    fn symbol_errors() {
        assert!(matches!(
            assemble_err("code\nproc foo 0 0\nendproc\nproc foo 0 0\nendproc\n"),
            Error::DuplicateSymbol { .. }
        ));
        assert!(matches!(
            assemble_err("code\nADDRGP4 missing\n"),
            Error::UndefinedSymbol { .. }
        ));
    }

    #[test]
    fn missing_symbols_can_be_suppressed() {
        let assembly = Assembler::new(true)
            .assemble_sources(
                &[("test.asm", "code\nADDRGP4 missing\n")],
                &Layout::default(),
                &SymbolTable::new(),
            )
            .unwrap();
        assert_eq!(ops(&assembly), [(Op::Const, Some(MISSING_SYMBOL_SENTINEL))]);
    }

    #[test]
    fn seeded_symbols_resolve_absolute() {
        let mut symbols = SymbolTable::new();
        symbols.insert("G_Printf".to_string(), SymbolEntry::code(0x446));

        let layout = Layout { code_base: 100, data_base: 0x1000, ..Layout::default() };
        let assembly = Assembler::new(false)
            .assemble_sources(
                &[("test.asm", "code\nproc foo 0 0\nADDRGP4 G_Printf\nCALLV\nendproc\n")],
                &layout,
                &symbols,
            )
            .unwrap();

        assert_eq!(assembly.symbols["G_Printf"].address, 0x446);
        assert_eq!(assembly.symbols["foo"].address, 100);
        assert_eq!(ops(&assembly)[1], (Op::Const, Some(0x446)));
        // a non-zero data base does not reserve the null word
        assert!(assembly.data.image.is_empty());
        assert_eq!(assembly.data.base, 0x1000);
    }

    #[test]
    fn equ_defines_absolute_symbols() {
        let assembly = assemble("code\nequ answer 42\nCNSTI4 answer\n");
        assert_eq!(assembly.symbols["answer"].address, 42);
        assert_eq!(ops(&assembly), [(Op::Const, Some(42))]);
    }

    #[test]
    fn chained_segment_bases() {
        let layout = Layout { data_base: 0x100, ..Layout::default() };
        let assembly = Assembler::new(false)
            .assemble_sources(
                &[(
                    "test.asm",
                    "data\nbyte 4 1\nlit\nbyte 1 65\nbss\nLABELV buffer\nskip 16\n",
                )],
                &layout,
                &SymbolTable::new(),
            )
            .unwrap();

        assert_eq!(assembly.data.base, 0x100);
        assert_eq!(assembly.data.image.len(), 4);
        assert_eq!(assembly.lit.base, 0x104);
        // padded to a word boundary at the end of each pass
        assert_eq!(assembly.lit.image.len(), 4);
        assert_eq!(assembly.bss.base, 0x108);
        assert_eq!(assembly.bss.image.len(), 16);
        assert_eq!(assembly.symbols["buffer"].address, 0x108);
    }

    #[test]
    fn syntax_error_carries_location() {
        let error = assemble_err("code\nfile \"game.c\"\nline 12\nbogus\n");
        match error {
            Error::Syntax { file, line, text } => {
                assert_eq!(file, "game.c");
                assert_eq!(line, 12);
                assert_eq!(text, "bogus");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reassembly_is_idempotent() {
        let text = "data\nLABELV table\nbyte 4 1\ncode\nproc foo 4 0\nADDRGP4 table\nINDIRI4\nRETI4\nendproc\n";
        let first = assemble(text);
        let second = assemble(text);
        assert_eq!(first.instructions, second.instructions);
        assert_eq!(first.data.image, second.data.image);
        assert_eq!(first.symbols, second.symbols);
    }
}
