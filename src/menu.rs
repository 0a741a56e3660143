use argp::FromArgs;

/// Top-level command
#[derive(FromArgs, PartialEq, Debug)]
#[argp(description = "A toolkit for patching Quake 3 VM programs.")]
pub struct QForge {
    #[argp(option, short = 'v', global, default = "0")]
    #[argp(
        description = "Logging level (0 = Off, 1 = Error, 2 = Warn, 3 = Info, 4 = Debug, 5 = Trace)"
    )]
    pub verbose: usize,

    #[argp(subcommand)]
    pub command: Command,
}

/// These are all the operations supported via command line.
#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand)]
#[non_exhaustive]
pub enum Command {
    Info(InfoOption),
    Disasm(DisasmOption),
    Patch(PatchOption),
}

/// Command to print information about a qvm.
#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand, name = "info")]
#[argp(description = "Print header information about a .qvm file")]
pub struct InfoOption {
    #[argp(positional)]
    #[argp(description = "Input file to be processed")]
    pub input: String,
}

/// Command to print a disassembly listing.
#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand, name = "disasm")]
#[argp(description = "Disassemble the code section of a .qvm file")]
pub struct DisasmOption {
    #[argp(option, long = "limit")]
    #[argp(description = "Stop after this many instructions")]
    pub limit: Option<usize>,

    #[argp(positional)]
    #[argp(description = "Input file to be processed")]
    pub input: String,
}

/// Command to compile C code into a qvm and rewrite calls.
#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand, name = "patch")]
#[argp(description = "Compile C code into a .qvm and rewrite calls to hook it in")]
pub struct PatchOption {
    #[argp(option, short = 'o')]
    #[argp(description = "Output file for the patched qvm")]
    pub output: String,

    #[argp(option, long = "code")]
    #[argp(description = "C source file to compile and add (may be repeated)")]
    pub code: Vec<String>,

    #[argp(option, long = "symbols")]
    #[argp(description = "Symbol file with one 'name address' pair per line")]
    pub symbols: Option<String>,

    #[argp(option, short = 'I', long = "include")]
    #[argp(description = "Extra include directory for the compiler (may be repeated)")]
    pub include: Vec<String>,

    #[argp(option, long = "replace")]
    #[argp(description = "Replace calls, written as OLD=NEW names or addresses (may be repeated)")]
    pub replace: Vec<String>,

    #[argp(switch, long = "forge-crc")]
    #[argp(description = "Forge the output's CRC-32 to match the input's")]
    pub forge_crc: bool,

    #[argp(positional)]
    #[argp(description = "Input file to be processed")]
    pub input: String,
}
