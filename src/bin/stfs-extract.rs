use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use xenonprep::Package;

/// Extract every file from an Xbox 360 LIVE/PIRS package.
#[derive(Parser)]
#[command(name = "stfs-extract", version)]
struct Args {
    /// Package file (LIVE or PIRS)
    input: PathBuf,
    /// Directory to extract into
    output: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> xenonprep::Result<()> {
    let mut package = Package::open(&args.input)?;
    println!(
        "{}: {} entries",
        args.input.display(),
        package.entries().len()
    );
    for entry in package.entries() {
        let kind = if entry.is_dir { "DIR " } else { "FILE" };
        let contiguous = if entry.contiguous { " [contiguous]" } else { "" };
        println!(
            "  [{kind}] {:<40} {:>12} bytes  start_cluster={}{contiguous}",
            entry.path, entry.len, entry.start_cluster
        );
    }

    let written = package.extract_all(&args.output)?;
    println!(
        "extracted {} file(s) to {}",
        written.len(),
        args.output.display()
    );
    Ok(())
}
