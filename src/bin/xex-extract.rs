use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use xenonprep::Xex;

/// Decrypt and decompress a XEX2 executable into a flat PE image at its load
/// address.
#[derive(Parser)]
#[command(name = "xex-extract", version)]
struct Args {
    /// XEX2 executable
    input: PathBuf,
    /// Output path for the PE image
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
    let data = fs::read(&args.input)?;
    let xex = Xex::parse(&data)?;
    println!("{}: {} bytes", args.input.display(), data.len());
    println!("  entry point:  {:#010x}", xex.entry_point);
    println!("  image base:   {:#010x}", xex.image_base);
    println!("  load address: {:#010x}", xex.load_address);
    println!("  image size:   {:#x}", xex.image_size);

    let image = xex.load_pe()?;
    fs::write(&args.output, &image)?;
    println!("wrote {} bytes to {}", image.len(), args.output.display());
    Ok(())
}
