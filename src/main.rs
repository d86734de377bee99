//! Punto de entrada ("driver").
//!
//! Este módulo orquesta las diferentes fases del proceso de
//! compilación y expone una CLI.

use anyhow::{self, bail, Context};
use bitflags::bitflags;
use clap::{crate_version, Arg, ArgAction, ArgMatches, Command};
use log::{info, LevelFilter};

use cydc::{
    alloc::{self, BankUsage, Block, BlockKind, MemoryBudget},
    codegen::{BankWindow, CodegenOptions, CompiledUnit},
    error::DEFAULT_MAX_ERRORS,
    parse::ParseOptions,
    source, text, CompileError, Options,
};

use std::{fs, fs::File, path::Path};

bitflags! {
    /// Reportes adicionales a imprimir tras compilar.
    struct Report: u32 {
        /// Tabla de etiquetas.
        const LABELS = 0x01;

        /// Listado de bytecode.
        const BYTECODE = 0x02;
    }
}

fn main() -> anyhow::Result<()> {
    // Parsing de CLI
    let args = Command::new("CYD adventure compiler")
        .version(crate_version!())
        .arg(
            Arg::new("slice-texts")
                .short('S')
                .long("slice-texts")
                .help("Allow texts to be split between memory banks"),
        )
        .arg(
            Arg::new("strict-colons")
                .long("strict-colons")
                .help("Require `:` between statements on the same line"),
        )
        .arg(
            Arg::new("max-errors")
                .long("max-errors")
                .takes_value(true)
                .value_name("N")
                .help("Stop reporting after this many errors"),
        )
        .arg(
            Arg::new("bank-offset")
                .long("bank-offset")
                .takes_value(true)
                .multiple_occurrences(true)
                .value_name("ADDRESS")
                .help("Base address of each code bank, repeat for every bank"),
        )
        .arg(
            Arg::new("bank-size")
                .long("bank-size")
                .takes_value(true)
                .multiple_occurrences(true)
                .value_name("BYTES")
                .help("Capacity of each code bank, repeat for every bank"),
        )
        .arg(
            Arg::new("max-banks")
                .long("max-banks")
                .takes_value(true)
                .value_name("N")
                .default_value("8")
                .help("Memory banks available on the target"),
        )
        .arg(
            Arg::new("image")
                .long("image")
                .takes_value(true)
                .multiple_occurrences(true)
                .value_name("FILE")
                .help("Image block to place in memory, numbered in order"),
        )
        .arg(
            Arg::new("track")
                .long("track")
                .takes_value(true)
                .multiple_occurrences(true)
                .value_name("FILE")
                .help("Music track block to place in memory, numbered in order"),
        )
        .arg(
            Arg::new("show-bytecode")
                .long("show-bytecode")
                .help("Print the generated bytecode listing"),
        )
        .arg(
            Arg::new("show-labels")
                .long("show-labels")
                .help("Print the resolved label table"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("Increase log verbosity"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .takes_value(true)
                .required(true)
                .value_name("DIR")
                .help("Output directory for bank files"),
        )
        .arg(
            Arg::new("input")
                .required(true)
                .value_name("INPUT")
                .help("Preprocessed source file"),
        )
        .get_matches();

    let level = match args.get_count("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    // Se extraen argumentos necesarios
    let options = options(&args)?;
    let budget = MemoryBudget {
        max_banks: number(args.value_of("max-banks").unwrap_or("8"))? as usize,
        ..budget(&options.codegen)
    };

    let mut report = Report::empty();
    if args.is_present("show-labels") {
        report |= Report::LABELS;
    }

    if args.is_present("show-bytecode") {
        report |= Report::BYTECODE;
    }

    let input = args.value_of("input").context("Missing input file")?;
    let output = args.value_of("output").context("Missing output directory")?;

    let file = File::open(input).with_context(|| format!("Failed to open: {}", input))?;
    let (start, stream) =
        source::consume(file, input).with_context(|| format!("Failed to read: {}", input))?;

    let compilation = match cydc::compile(start, stream, &mut text::Verbatim, &options) {
        Ok(compilation) => compilation,
        Err(CompileError::Diagnostics(diagnostics)) => {
            eprint!("{}", diagnostics);
            bail!("Failed to compile {}", input);
        }

        Err(error) => bail!("Failed to compile {}: {}", input, error),
    };

    let unit = &compilation.unit;
    if report.contains(Report::LABELS) {
        print_labels(unit);
    }

    if report.contains(Report::BYTECODE) {
        print!("{}", unit.listing());
    }

    // Bloques externos en el espacio restante
    let mut blocks = Vec::new();
    let mut data = Vec::new();
    for (kind, flag) in [(BlockKind::Image, "image"), (BlockKind::Track, "track")] {
        for (id, path) in args.values_of(flag).into_iter().flatten().enumerate() {
            let bytes = fs::read(path).with_context(|| format!("Failed to read: {}", path))?;
            if id > usize::from(u8::MAX) {
                bail!("Too many {} blocks", kind);
            }

            blocks.push(Block {
                kind,
                id: id as u8,
                size: bytes.len(),
            });

            data.push(bytes);
        }
    }

    let code_banks: Vec<BankUsage> = unit
        .banks()
        .iter()
        .map(|bank| BankUsage {
            base: bank.base(),
            used: bank.len(),
            free: bank.free(),
        })
        .collect();

    let allocation = alloc::allocate(&code_banks, &blocks, &budget)
        .context("Failed to place external blocks")?;

    let mut images: Vec<Vec<u8>> = unit.banks().iter().map(|bank| bank.bytes().to_vec()).collect();
    images.resize(allocation.banks.len(), Vec::new());

    let mut data = data.into_iter();
    for placement in &allocation.placements {
        if let Some(bytes) = data.next() {
            images[placement.bank].extend_from_slice(&bytes);
        }

        info!(
            "{} {} placed at bank {}, {:04X}",
            placement.block.kind, placement.block.id, placement.bank, placement.address
        );
    }

    let output = Path::new(output);
    fs::create_dir_all(output)
        .with_context(|| format!("Failed to create directory: {}", output.display()))?;

    for (index, image) in images.iter().enumerate() {
        let path = output.join(format!("BANK{}.BIN", index));
        fs::write(&path, image)
            .with_context(|| format!("Failed to write: {}", path.display()))?;
    }

    print_usage(&allocation.banks);
    Ok(())
}

/// Construye las opciones de compilación a partir de la CLI.
fn options(args: &ArgMatches) -> anyhow::Result<Options> {
    let max_errors = match args.value_of("max-errors") {
        Some(value) => number(value)? as usize,
        None => DEFAULT_MAX_ERRORS,
    };

    let offsets = numbers(args.values_of("bank-offset"))?;
    let sizes = numbers(args.values_of("bank-size"))?;

    let defaults = BankWindow::default();
    let count = offsets.len().max(sizes.len()).max(1);

    // Las listas más cortas repiten su último valor
    let mut banks = Vec::with_capacity(count);
    for i in 0..count {
        let base = pick(&offsets, i).unwrap_or(u32::from(defaults.base));
        let capacity = pick(&sizes, i).unwrap_or(u32::from(defaults.capacity));

        if base > 0xFFFF || capacity > 0xFFFF {
            bail!("Invalid bank window {:#X} with {} bytes", base, capacity);
        }

        banks.push(BankWindow {
            base: base as u16,
            capacity: capacity as u16,
        });
    }

    Ok(Options {
        parse: ParseOptions {
            strict_colons: args.is_present("strict-colons"),
            max_errors,
        },

        codegen: CodegenOptions {
            banks,
            slice_text: args.is_present("slice-texts"),
        },
    })
}

/// Bancos adicionales con la ventana del último banco de código.
fn budget(codegen: &CodegenOptions) -> MemoryBudget {
    let last = codegen.banks.last().copied().unwrap_or_default();
    MemoryBudget {
        bank_size: usize::from(last.capacity),
        bank_base: last.base,
        ..MemoryBudget::default()
    }
}

fn pick(values: &[u32], index: usize) -> Option<u32> {
    values.get(index).or_else(|| values.last()).copied()
}

fn numbers<'a, I>(values: Option<I>) -> anyhow::Result<Vec<u32>>
where
    I: Iterator<Item = &'a str>,
{
    values.into_iter().flatten().map(number).collect()
}

/// Entero en decimal, `0x` o `$` hexadecimal.
fn number(text: &str) -> anyhow::Result<u32> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(hex) = text.strip_prefix('$') {
        u32::from_str_radix(hex, 16)
    } else {
        text.parse()
    };

    parsed.with_context(|| format!("Invalid number: {}", text))
}

fn print_labels(unit: &CompiledUnit) {
    println!("Labels:");
    for (name, (bank, address)) in unit.labels() {
        println!("  {:<24} {}:{:04X}", name.as_ref(), bank, address);
    }

    for (name, (bank, address)) in unit.arrays() {
        println!("  {:<24} {}:{:04X} (array)", name.as_ref(), bank, address);
    }
}

fn print_usage(banks: &[BankUsage]) {
    println!("\nRAM usage:\n-----------------");

    let mut total = 0;
    for (index, bank) in banks.iter().enumerate() {
        println!(
            "Bank {}: {} bytes used, {} bytes free",
            index, bank.used, bank.free
        );

        total += bank.used;
    }

    println!("-----------------\nTotal: {} bytes", total);
}
