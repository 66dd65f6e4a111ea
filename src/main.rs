//! shellgate: gate shell commands before they run.
//!
//! Exit behavior:
//!   - executed: the child's exit status (128 + signo when killed by a signal)
//!   - blocked (bypass attempt, integrity failure): 3
//!   - denied (BLOCK verdict, refused approval, auth code issued): 2
//!   - errored (approved but could not start): 4
//!   - usage or configuration error: 64

use clap::Parser;
use shellgate::cli::{self, Cli, EXIT_USAGE};

fn main() {
    // Parse failures exit 64; --help and --version print and exit 0.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { EXIT_USAGE } else { 0 });
        }
    };

    std::process::exit(cli::run_command(cli));
}
