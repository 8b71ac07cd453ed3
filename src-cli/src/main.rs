use clap::Parser;

use convertbox_lib::cli::Command;

#[derive(Parser, Debug)]
#[command(name = "convertbox")]
#[command(about = "Convert, compress and inspect files locally")]
struct Args {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    convertbox_lib::run(args.command, args.verbose)
}
