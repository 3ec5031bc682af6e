use clap::Parser;
use log::error;

use ssh_ca_core::{CliArgs, init_logging, run};

fn main() {
    init_logging();

    let args = CliArgs::parse();
    if let Err(e) = run(args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
