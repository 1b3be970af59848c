mod cli;

use clap::Parser;
use cli::Cli;

fn main() {
    let cli = Cli::parse();

    match cli::run(cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            if e.is_retryable() {
                eprintln!("The guarantee was left unchanged; the same command can be retried.");
            }
            std::process::exit(1);
        }
    }
}
