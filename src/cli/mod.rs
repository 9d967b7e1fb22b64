// CLI module
// Command-line interface, argument parsing and command execution

mod args;

pub use args::{CliArgs, Command};

use clap::Parser;
use csv::Writer;
use rust_decimal::Decimal;
use std::io::Write;

use crate::config::LedgerConfig;
use crate::core::RankedBalance;
use crate::ledger::{Collaborators, Ledger};
use crate::logging::init_logging;
use crate::types::{Economable, LedgerError, StorageError, TransactionReason};

/// Parse command-line arguments using clap
///
/// If parsing fails (invalid arguments, missing subcommand, `--help`), clap
/// prints the message and exits the process.
pub fn parse_args() -> CliArgs {
    CliArgs::parse()
}

/// Load configuration, run one command against the ledger and shut it down
///
/// Results are written to `output` as CSV. The ledger is always flushed and
/// closed, even when the command fails.
///
/// # Returns
///
/// * `Ok(())` - The command succeeded and every write is durable
/// * `Err(String)` - The command was rejected, or a write could not be made
///   durable
pub fn run(args: CliArgs, output: &mut dyn Write) -> Result<(), String> {
    let config = LedgerConfig::load(args.config.as_deref()).map_err(|e| e.to_string())?;
    init_logging(&config.log);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().min(4))
        .enable_time()
        .build()
        .map_err(|e| format!("Failed to create tokio runtime: {}", e))?;

    runtime.block_on(async {
        let ledger = Ledger::start(config, Collaborators::default())
            .await
            .map_err(|e| e.to_string())?;

        let result = execute(&ledger, &args.command, output).await;
        let report = ledger.shutdown().await;

        result.map_err(|e| e.to_string())?;
        if let Some(failure) = report.failures.first() {
            return Err(failure.to_string());
        }
        if let Some(error) = report.backend_error {
            return Err(error.to_string());
        }
        Ok(())
    })
}

/// Run a single command against a started ledger
pub async fn execute(
    ledger: &Ledger,
    command: &Command,
    output: &mut dyn Write,
) -> Result<(), LedgerError> {
    let engine = ledger.engine();
    let decimals = engine.policy().decimals;

    match command {
        Command::Balance { economable } => {
            let balance = engine.balance(economable)?;
            write_balances_csv(&[(economable.clone(), balance)], decimals, output)
        }
        Command::Pay { from, to, amount } => {
            engine.transfer(from, to, *amount, TransactionReason::PlayerPay)?;
            let rows = [
                (from.clone(), engine.balance(from)?),
                (to.clone(), engine.balance(to)?),
            ];
            write_balances_csv(&rows, decimals, output)
        }
        Command::Give { economable, amount } => {
            engine.deposit(economable, *amount, TransactionReason::AdminGive)?;
            write_balances_csv(&[(economable.clone(), engine.balance(economable)?)], decimals, output)
        }
        Command::Take { economable, amount } => {
            engine.withdraw(economable, *amount, TransactionReason::AdminTake)?;
            write_balances_csv(&[(economable.clone(), engine.balance(economable)?)], decimals, output)
        }
        Command::Set { economable, amount } => {
            engine.set_balance(economable, *amount, TransactionReason::AdminSet)?;
            write_balances_csv(&[(economable.clone(), engine.balance(economable)?)], decimals, output)
        }
        Command::Top { page, per_page } => {
            ledger.refresh_top_balances().await?;
            let rows = ledger.top_balances().page(*page, *per_page);
            write_top_csv(&rows, decimals, output)
        }
        Command::Flush => {
            let report = ledger.flush().await;
            writeln!(output, "persisted,failed")
                .and_then(|_| writeln!(output, "{},{}", report.persisted, report.failures.len()))
                .map_err(|e| LedgerError::Storage(e.into()))
        }
    }
}

/// Write `economable,balance` rows at the currency precision
pub fn write_balances_csv(
    rows: &[(Economable, Decimal)],
    decimals: u32,
    output: &mut dyn Write,
) -> Result<(), LedgerError> {
    let mut writer = Writer::from_writer(output);
    writer
        .write_record(["economable", "balance"])
        .map_err(StorageError::from)?;

    for (economable, balance) in rows {
        writer
            .write_record([economable.key(), format_amount(*balance, decimals).as_str()])
            .map_err(StorageError::from)?;
    }

    writer.flush().map_err(StorageError::from)?;
    Ok(())
}

/// Write `rank,economable,balance` rows of a leaderboard page
pub fn write_top_csv(
    rows: &[RankedBalance],
    decimals: u32,
    output: &mut dyn Write,
) -> Result<(), LedgerError> {
    let mut writer = Writer::from_writer(output);
    writer
        .write_record(["rank", "economable", "balance"])
        .map_err(StorageError::from)?;

    for row in rows {
        writer
            .write_record([
                row.rank.to_string().as_str(),
                row.economable.key(),
                format_amount(row.balance, decimals).as_str(),
            ])
            .map_err(StorageError::from)?;
    }

    writer.flush().map_err(StorageError::from)?;
    Ok(())
}

fn format_amount(amount: Decimal, decimals: u32) -> String {
    format!("{:.*}", decimals as usize, amount)
}
