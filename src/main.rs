use rused::cli::Cli;
use std::process;

fn main() {
    let cli = Cli::new();

    if let Err(err) = cli.execute() {
        eprintln!("Error: {}", err);
        process::exit(2);
    }
}
