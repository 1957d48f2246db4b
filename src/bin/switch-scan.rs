use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use xenonprep::emit;
use xenonprep::switches::{self, ScanConfig, SiteOutcome};

/// Scan a decoded PE image for bctr-dispatched switch tables and emit the
/// recompiler configuration.
#[derive(Parser)]
#[command(name = "switch-scan", version)]
struct Args {
    /// Flat PE image produced by xex-extract
    input: PathBuf,
    /// Output configuration file
    output: PathBuf,
    /// TOML file with size overrides and excluded bctr addresses
    #[arg(long)]
    overrides: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(misses) if misses == 0 => ExitCode::SUCCESS,
        Ok(misses) => {
            eprintln!("{misses} switch site(s) could not be recovered");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> xenonprep::Result<usize> {
    let image = fs::read(&args.input)?;
    let config = match &args.overrides {
        Some(path) => ScanConfig::load(path)?,
        None => ScanConfig::default(),
    };
    println!(
        "{}: {} bytes, scanning for dispatch epilogues",
        args.input.display(),
        image.len()
    );

    let outcomes = switches::scan_image(&image, &config);
    let misses = outcomes
        .iter()
        .filter(|o| matches!(o, SiteOutcome::Miss { .. }))
        .count();
    println!(
        "found {} site(s), {} recovered, {} missed",
        outcomes.len(),
        outcomes.len() - misses,
        misses
    );

    let mut config_out = Vec::new();
    emit::write_config(&mut config_out, &outcomes)?;
    fs::write(&args.output, &config_out)?;
    println!("wrote {}", args.output.display());
    Ok(misses)
}
