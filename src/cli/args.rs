use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;

use crate::types::Economable;

/// Inspect and change balances in a ledger
#[derive(Parser, Debug)]
#[command(name = "saneledger")]
#[command(about = "Inspect and change balances in a ledger", long_about = None)]
pub struct CliArgs {
    /// Configuration file (defaults to saneledger.toml if present)
    #[arg(long = "config", short = 'c', value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// One-shot ledger operations
///
/// Economables are written as `<namespace>:<id>`, for example
/// `player:6a1e2b5c-0d3f-4e8a-9b7c-112233445566` or `faction:red`.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Print the balance of an economable
    Balance {
        #[arg(value_name = "ECONOMABLE")]
        economable: Economable,
    },

    /// Move funds from one economable to another
    Pay {
        #[arg(value_name = "FROM")]
        from: Economable,
        #[arg(value_name = "TO")]
        to: Economable,
        #[arg(value_name = "AMOUNT")]
        amount: Decimal,
    },

    /// Add funds to an economable
    Give {
        #[arg(value_name = "ECONOMABLE")]
        economable: Economable,
        #[arg(value_name = "AMOUNT")]
        amount: Decimal,
    },

    /// Remove funds from an economable
    Take {
        #[arg(value_name = "ECONOMABLE")]
        economable: Economable,
        #[arg(value_name = "AMOUNT")]
        amount: Decimal,
    },

    /// Set the balance of an economable
    Set {
        #[arg(value_name = "ECONOMABLE")]
        economable: Economable,
        #[arg(value_name = "AMOUNT", allow_hyphen_values = true)]
        amount: Decimal,
    },

    /// Print the highest balances as CSV
    Top {
        /// Page to show, starting at 1
        #[arg(long = "page", default_value_t = 1)]
        page: usize,

        /// Entries per page
        #[arg(long = "per-page", default_value_t = 10)]
        per_page: usize,
    },

    /// Write every pending balance to storage
    Flush,
}
