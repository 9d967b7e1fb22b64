//! SaneLedger CLI
//!
//! One-shot commands against a configured ledger.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- balance faction:red
//! cargo run -- pay faction:red generic:bank 12.50
//! cargo run -- --config saneledger.toml give player:6a1e2b5c-0d3f-4e8a-9b7c-112233445566 100
//! cargo run -- top --page 2 --per-page 10
//! ```
//!
//! Results are printed to stdout as CSV; diagnostics go to stderr.
//!
//! # Exit Codes
//!
//! - 0: Success
//! - 1: Error (bad configuration, rejected transaction, write not durable, etc.)

use saneledger::cli;
use std::process;

fn main() {
    let args = cli::parse_args();

    let mut output = std::io::stdout();
    if let Err(e) = cli::run(args, &mut output) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
