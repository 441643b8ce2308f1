//! Lower a kernel-graph listing to PTX.
//!
//! Reads the listing from a file (or stdin), runs the rewrite pass and prints
//! either the PTX text or, with `--emit-graph`, the rewritten listing.

use clap::Parser;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use uopasm::{parse_graph, pretransform, print_graph, uops_to_asm, PtxBackend};

#[derive(Parser)]
#[command(name = "uopasm", version, about = "Lower a UOp kernel listing to PTX")]
struct Cli {
    /// Input listing (stdin when absent or `-`)
    input: Option<PathBuf>,
    /// Kernel entry name
    #[arg(long, default_value = "kernel")]
    name: String,
    /// Target architecture, e.g. sm_80
    #[arg(long)]
    arch: Option<String>,
    /// Print the rewritten graph instead of assembly
    #[arg(long)]
    emit_graph: bool,
    /// Output file (stdout by default)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let text = match &cli.input {
        Some(path) if path.as_os_str() != "-" => fs::read_to_string(path)?,
        _ => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let mut graph = parse_graph(&text)?;
    log::debug!("parsed {} nodes", graph.len());

    let out = if cli.emit_graph {
        let rewrites = pretransform(&mut graph)?;
        log::debug!("{rewrites} rewrites applied");
        print_graph(&graph)
    } else {
        let mut backend = PtxBackend::new();
        if let Some(arch) = &cli.arch {
            backend = backend.with_target(arch);
        }
        uops_to_asm(&backend, &cli.name, &mut graph)? + "\n"
    };

    match &cli.output {
        Some(path) => fs::write(path, out)?,
        None => print!("{out}"),
    }
    Ok(())
}
