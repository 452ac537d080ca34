use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use regex::Regex;

use objlens::core::SymbolKind;
use objlens::disasm::Disassembler;
use objlens::{logging, AnalysisConfig, Session, SymbolTable};

/// Inspect object files: symbols, disassembly, CFG, SSA and stack liveness.
///
/// All analysis lives in the `objlens` library; this binary only parses
/// arguments and prints results.
#[derive(Parser, Debug)]
#[command(name = "objlens", version, about = "Object file inspector", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, default_value_t = false, global = true)]
    json_logs: bool,

    /// Analysis configuration (JSON); unset keys keep their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show format, architecture, entry point and sections.
    Info { file: PathBuf },

    /// List symbols in address order.
    Symbols {
        file: PathBuf,

        /// Only symbols of this kind (nm letter: T, D, R, B, U, A).
        #[arg(long)]
        kind: Option<char>,

        /// Only symbols whose name matches this regex.
        #[arg(long)]
        filter: Option<String>,
    },

    /// Disassemble one symbol.
    Disasm { file: PathBuf, symbol: String },

    /// Full analysis of one symbol, as JSON.
    Analyze {
        file: PathBuf,
        symbol: String,

        /// Print the CFG as Graphviz instead of JSON.
        #[arg(long, default_value_t = false)]
        dot: bool,
    },

    /// List the functions of the Go runtime function table.
    Functab { file: PathBuf },
}

fn load_config(path: Option<&Path>) -> Result<AnalysisConfig> {
    match path {
        Some(p) => AnalysisConfig::from_json_file(p)
            .with_context(|| format!("reading config {}", p.display())),
        None => Ok(AnalysisConfig::default()),
    }
}

fn open_session(file: &Path, config: AnalysisConfig) -> Result<Session> {
    Session::open(file, config).with_context(|| format!("opening {}", file.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.json_logs {
        logging::init_tracing_json();
    } else {
        logging::init_tracing();
    }
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Info { file } => info_command(&file, config),
        Command::Symbols { file, kind, filter } => symbols_command(&file, config, kind, filter),
        Command::Disasm { file, symbol } => disasm_command(&file, config, &symbol),
        Command::Analyze { file, symbol, dot } => analyze_command(&file, config, &symbol, dot),
        Command::Functab { file } => functab_command(&file, config),
    }
}

fn info_command(file: &Path, config: AnalysisConfig) -> Result<()> {
    let session = open_session(file, config)?;
    let info = session.object().info();
    println!("format:  {:?}", info.format);
    println!(
        "arch:    {}",
        info.arch.map_or_else(|| format!("unsupported ({})", info.machine), |a| a.name.to_string())
    );
    println!("entry:   {:#x}", info.entry);
    println!("symbols: {}", session.symtab().len());
    match session.functab() {
        Some(ft) => println!("functab: {} functions", ft.len()),
        None => println!("functab: none"),
    }
    println!("sections:");
    for s in session.object().sections() {
        println!("  {:<20} {:#012x} {:#10x}", s.name, s.address, s.size);
    }
    Ok(())
}

fn symbols_command(
    file: &Path,
    config: AnalysisConfig,
    kind: Option<char>,
    filter: Option<String>,
) -> Result<()> {
    let kind = kind
        .map(|c| SymbolKind::from_code(c).ok_or_else(|| anyhow!("unknown symbol kind {:?}", c)))
        .transpose()?;
    let pattern = filter
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("invalid --filter regex")?;
    let session = open_session(file, config)?;
    for sym in session.symtab().filter(kind, pattern.as_ref()) {
        println!(
            "{:016x} {:8} {} {}",
            sym.value,
            sym.size,
            sym.kind.code(),
            SymbolTable::display_name(sym)
        );
    }
    Ok(())
}

fn disasm_command(file: &Path, config: AnalysisConfig, symbol: &str) -> Result<()> {
    let session = open_session(file, config)?;
    let sym = session
        .symtab()
        .by_name(symbol)
        .ok_or_else(|| anyhow!("symbol not found: {}", symbol))?;
    let arch = session
        .object()
        .info()
        .arch
        .ok_or_else(|| anyhow!("unsupported architecture {}", session.object().info().machine))?;
    let disasm = objlens::disasm::for_arch(arch)?;
    let data = session.object().symbol_data(sym)?;
    let seq = disasm.decode(&data, sym.value, session.config().decode_policy, &session.budget())?;
    for inst in &seq.insts {
        println!("{:<24} {}", hex::encode(&inst.bytes), inst);
    }
    for e in &seq.errors {
        eprintln!("undecodable bytes at {:#x}", e.pc);
    }
    Ok(())
}

fn analyze_command(file: &Path, config: AnalysisConfig, symbol: &str, dot: bool) -> Result<()> {
    let session = open_session(file, config)?;
    let analysis = session
        .analyze_symbol(symbol, &session.budget())
        .with_context(|| format!("analyzing {}", symbol))?;
    if dot {
        print!("{}", analysis.to_dot());
    } else {
        println!("{}", serde_json::to_string_pretty(&analysis)?);
    }
    Ok(())
}

fn functab_command(file: &Path, config: AnalysisConfig) -> Result<()> {
    let session = open_session(file, config)?;
    let ft = session
        .functab()
        .ok_or_else(|| anyhow!("no usable function table in {}", file.display()))?;
    println!("pcquantum {} ptrsize {}", ft.pc_quantum, ft.ptr_size);
    for f in ft.funcs() {
        println!(
            "{:#014x}-{:#014x} args {:4} frame {:4} {}",
            f.entry, f.end, f.args, f.frame_size, f.name
        );
    }
    Ok(())
}
