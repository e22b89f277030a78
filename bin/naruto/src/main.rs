//! `naruto`: creates, mounts, and branches aufs-backed layer trees.

mod cli;
mod logging;

use std::process::ExitCode;

fn main() -> ExitCode {
    logging::init();

    match cli::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("naruto: error: {error:?}");
            ExitCode::FAILURE
        }
    }
}
