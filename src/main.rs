#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::{io::prelude::*, path::PathBuf};

use anyhow::{bail, Context, Result};
use env_logger::Builder;
use log::{Level, LevelFilter};
use owo_colors::OwoColorize;
use qforge_core::util::format_size;
use qforge_qvm::prelude::*;

mod menu;

fn color_level(level: Level) -> String {
    match level {
        Level::Error => level.red().to_string(),
        Level::Warn => level.yellow().to_string(),
        Level::Info => level.green().to_string(),
        Level::Debug => level.blue().to_string(),
        Level::Trace => level.purple().to_string(),
    }
}

const fn level_filter(verbose: usize) -> LevelFilter {
    match verbose {
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        5 => LevelFilter::Trace,
        //default to off
        _ => LevelFilter::Off,
    }
}

fn main() -> Result<()> {
    //Parse command line input
    let args: menu::QForge = argp::parse_args_or_exit(argp::DEFAULT);

    // Build up a logger with custom formatting and set it to the verbosity from the command line
    if args.verbose != 0 {
        Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{}] {} {}",
                    qforge_core::time::current_time(),
                    color_level(record.level()),
                    record.args()
                )
            })
            .filter(None, level_filter(args.verbose))
            .init();
    }

    match args.command {
        menu::Command::Info(params) => info(&params),
        menu::Command::Disasm(params) => disasm(&params),
        menu::Command::Patch(params) => patch(&params),
    }
}

fn info(params: &menu::InfoOption) -> Result<()> {
    let qvm = Qvm::open(&params.input, SymbolTable::new())
        .with_context(|| format!("unable to load {}", params.input))?;

    let bss_length =
        qvm.memory().len() - qvm.data_length() - qvm.lit_length() + STACK_SIZE;
    println!("vm_magic:     {:#010x}", qvm.vm_magic());
    println!("instructions: {}", qvm.instructions().len());
    println!("data:         {}", format_size(qvm.data_length()));
    println!("lit:          {}", format_size(qvm.lit_length()));
    println!("bss:          {} (including the reserved stack)", format_size(bss_length));
    println!("crc32:        {:#010x}", qvm.original_crc());
    Ok(())
}

fn disasm(params: &menu::DisasmOption) -> Result<()> {
    let qvm = Qvm::open(&params.input, SymbolTable::new())
        .with_context(|| format!("unable to load {}", params.input))?;

    let limit = params.limit.unwrap_or(usize::MAX);
    for (address, instruction) in qvm.instructions().iter().enumerate().take(limit) {
        println!("{address:#10x}  {instruction}");
    }
    Ok(())
}

fn patch(params: &menu::PatchOption) -> Result<()> {
    let symbols = match &params.symbols {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("unable to read {path}"))?;
            parse_symbols(&text).with_context(|| format!("unable to parse {path}"))?
        }
        None => SymbolTable::new(),
    };

    let mut qvm = Qvm::open(&params.input, symbols)
        .with_context(|| format!("unable to load {}", params.input))?;

    let include_dirs: Vec<PathBuf> = params.include.iter().map(PathBuf::from).collect();
    if !params.code.is_empty() {
        log::info!("Compiling {}", params.code.join(", "));
        // one assembler run across all files, so globals can cross file boundaries
        let paths: Vec<PathBuf> = params.code.iter().map(PathBuf::from).collect();
        let output = qvm.add_c_files(&paths, &include_dirs)?;
        if !output.trim().is_empty() {
            print!("{output}");
        }
    }

    for replacement in &params.replace {
        let Some((old, new)) = replacement.split_once('=') else {
            bail!("replacements must look like OLD=NEW, got {replacement}");
        };
        let count = qvm.replace_calls(func_ref(old), func_ref(new))?;
        log::info!("Replaced {count} call(s) to {old} with {new}");
    }

    log::info!("Writing file {}", params.output);
    qvm.write(&params.output, params.forge_crc)
        .with_context(|| format!("unable to write {}", params.output))?;
    Ok(())
}

/// Parses a symbol file: one `name address` pair per line, `#` starts a comment, addresses may
/// be hex (0x prefix) or decimal.
fn parse_symbols(text: &str) -> Result<SymbolTable> {
    let mut symbols = SymbolTable::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or(line);
        let mut tokens = line.split_whitespace();
        let Some(name) = tokens.next() else {
            continue;
        };
        let Some(token) = tokens.next() else {
            bail!("line {}: missing address for {name}", number + 1);
        };
        let Some(address) = parse_address(token) else {
            bail!("line {}: bad address {token} for {name}", number + 1);
        };
        symbols.insert(name.to_string(), SymbolEntry::code(address));
    }
    Ok(symbols)
}

fn func_ref(token: &str) -> FuncRef<'_> {
    match parse_address(token) {
        Some(address) => FuncRef::Address(address),
        None => FuncRef::Name(token),
    }
}

fn parse_address(token: &str) -> Option<i64> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        token.parse().ok()
    }
}
