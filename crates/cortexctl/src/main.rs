//! cortexctl - talk to the cortexd host health daemon

use clap::Parser;
use cortexctl::cli::{self, Cli};
use cortexctl::display;

fn main() {
    let cli = Cli::parse();
    if let Err(e) = cli::run(cli) {
        display::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
