//! cadence-credits - Manage credit accounts
//!
//! Operator tool for the Cadence credit ledger.

use clap::{Parser, Subcommand};
use libcadence::error::LedgerError;
use libcadence::ledger::Reconciliation;
use libcadence::logging::{LogFormat, LoggingConfig};
use libcadence::types::{unix_now, CreditTransaction};
use libcadence::{CadenceError, Config, Database, Ledger, Result};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "cadence-credits")]
#[command(version)]
#[command(about = "Manage credit accounts")]
#[command(long_about = "\
cadence-credits - Manage credit accounts

DESCRIPTION:
    cadence-credits is the operator tool for the Cadence credit ledger.
    Every publish reserves its cost as a hold and is charged only after the
    platform accepts it. Use this tool to open accounts, grant credits,
    inspect balances and history, and check an account against its
    transaction log.

COMMANDS:
    open        Open a credit account
    grant       Add credits to an account
    balance     Show balance, held and spendable credits
    history     Show recent transactions, newest first
    reconcile   Check the balance against the transaction log
    sweep       Release holds whose expiry has passed

USAGE EXAMPLES:
    # Open an account with 500 credits
    cadence-credits open acct-1 --balance 500

    # Top up
    cadence-credits grant acct-1 200 --memo \"monthly plan\"

    # Show the last 10 transactions as JSON
    cadence-credits history acct-1 --limit 10 --format json

    # Verify an account
    cadence-credits reconcile acct-1

CONFIGURATION:
    Configuration file: ~/.config/cadence/config.toml
    Database location: ~/.local/share/cadence/cadence.db

    Override with environment variables:
        CADENCE_CONFIG    - Path to config file
        CADENCE_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed (including a failed reconciliation)
    2 - Database or configuration error
    3 - Invalid input (unknown account, bad amount or format)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a credit account (no-op when it already exists)
    Open {
        account_id: String,

        /// Opening balance
        #[arg(short, long, default_value_t = 0)]
        balance: i64,
    },

    /// Add credits to an account
    Grant {
        account_id: String,
        amount: i64,

        /// Note stored with the transaction
        #[arg(short, long)]
        memo: Option<String>,
    },

    /// Show balance, held and spendable credits
    Balance {
        account_id: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show recent transactions
    History {
        account_id: String,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check the balance against the transaction log
    Reconcile {
        account_id: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Release holds whose expiry has passed
    Sweep,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::new(LogFormat::Text, "error".to_string(), cli.verbose).init();

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

/// Ok(false) means the command ran but its check failed
async fn run(cli: Cli) -> Result<bool> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;
    let ledger = Ledger::new(db, &config.ledger);

    match cli.command {
        Commands::Open {
            account_id,
            balance,
        } => cmd_open(&ledger, &account_id, balance).await?,
        Commands::Grant {
            account_id,
            amount,
            memo,
        } => cmd_grant(&ledger, &account_id, amount, memo.as_deref()).await?,
        Commands::Balance { account_id, format } => cmd_balance(&ledger, &account_id, &format).await?,
        Commands::History {
            account_id,
            limit,
            format,
        } => cmd_history(&ledger, &account_id, limit, &format).await?,
        Commands::Reconcile { account_id, format } => {
            return cmd_reconcile(&ledger, &account_id, &format).await;
        }
        Commands::Sweep => cmd_sweep(&ledger).await?,
    }
    Ok(true)
}

/// Operator mistakes are invalid input, everything else keeps its own exit code
fn ledger_error(err: LedgerError) -> CadenceError {
    match err {
        LedgerError::AccountNotFound(id) => {
            CadenceError::InvalidInput(format!("Credit account not found: {}", id))
        }
        LedgerError::InvalidAmount(amount) => {
            CadenceError::InvalidInput(format!("Invalid amount: {} (must be positive)", amount))
        }
        other => other.into(),
    }
}

fn validate_format(format: &str) -> Result<()> {
    if format != "text" && format != "json" {
        return Err(CadenceError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            format
        )));
    }
    Ok(())
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| CadenceError::InvalidInput(format!("cannot encode output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

async fn cmd_open(ledger: &Ledger, account_id: &str, balance: i64) -> Result<()> {
    let account = ledger
        .open_account(account_id, balance, unix_now())
        .await
        .map_err(ledger_error)?;
    println!("{} balance={}", account.account_id, account.balance);
    Ok(())
}

async fn cmd_grant(ledger: &Ledger, account_id: &str, amount: i64, memo: Option<&str>) -> Result<()> {
    let balance = ledger
        .grant(account_id, amount, memo, unix_now())
        .await
        .map_err(ledger_error)?;
    println!("Granted {} to {} (balance {})", amount, account_id, balance);
    Ok(())
}

#[derive(Debug, Serialize)]
struct BalanceView {
    account_id: String,
    balance: i64,
    held: i64,
    spendable: i64,
}

async fn cmd_balance(ledger: &Ledger, account_id: &str, format: &str) -> Result<()> {
    validate_format(format)?;
    let account = ledger
        .account(account_id)
        .await
        .map_err(ledger_error)?
        .ok_or_else(|| ledger_error(LedgerError::AccountNotFound(account_id.to_string())))?;

    let view = BalanceView {
        spendable: account.spendable(),
        account_id: account.account_id,
        balance: account.balance,
        held: account.held,
    };

    if format == "json" {
        return print_json(&view);
    }
    println!("Account:   {}", view.account_id);
    println!("Balance:   {}", view.balance);
    println!("Held:      {}", view.held);
    println!("Spendable: {}", view.spendable);
    Ok(())
}

async fn cmd_history(ledger: &Ledger, account_id: &str, limit: usize, format: &str) -> Result<()> {
    validate_format(format)?;
    if ledger.account(account_id).await.map_err(ledger_error)?.is_none() {
        return Err(ledger_error(LedgerError::AccountNotFound(account_id.to_string())));
    }
    let transactions = ledger
        .transactions(account_id, limit)
        .await
        .map_err(ledger_error)?;

    if format == "json" {
        return print_json(&transactions);
    }
    for tx in &transactions {
        println!("{}", format_transaction(tx));
    }
    Ok(())
}

fn format_transaction(tx: &CreditTransaction) -> String {
    let when = chrono::DateTime::from_timestamp(tx.created_at, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| tx.created_at.to_string());
    format!(
        "{} | {} | {:+} | balance {} | {}",
        when,
        tx.reason,
        tx.delta,
        tx.balance_after,
        tx.memo.as_deref().or(tx.hold_id.as_deref()).unwrap_or("-")
    )
}

async fn cmd_reconcile(ledger: &Ledger, account_id: &str, format: &str) -> Result<bool> {
    validate_format(format)?;
    let report = ledger.reconcile(account_id).await.map_err(ledger_error)?;
    let consistent = report.is_consistent();

    if format == "json" {
        #[derive(Serialize)]
        struct Output<'a> {
            #[serde(flatten)]
            report: &'a Reconciliation,
            consistent: bool,
        }
        print_json(&Output {
            report: &report,
            consistent,
        })?;
    } else {
        println!("Account:    {}", report.account_id);
        println!("Balance:    {} (transactions sum to {})", report.balance, report.ledger_sum);
        println!("Held:       {} (open holds sum to {})", report.held, report.open_holds_sum);
        println!("Status:     {}", if consistent { "consistent" } else { "MISMATCH" });
    }

    if !consistent {
        tracing::error!(?report, "Ledger reconciliation failed");
    }
    Ok(consistent)
}

async fn cmd_sweep(ledger: &Ledger) -> Result<()> {
    let released = ledger.expire(unix_now()).await.map_err(ledger_error)?;
    println!("Released {} expired hold(s)", released);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libcadence::types::TransactionReason;

    #[test]
    fn test_ledger_error_exit_codes() {
        assert_eq!(ledger_error(LedgerError::AccountNotFound("a".into())).exit_code(), 3);
        assert_eq!(ledger_error(LedgerError::InvalidAmount(-5)).exit_code(), 3);
        assert_eq!(
            ledger_error(LedgerError::InsufficientCredit {
                spendable: 1,
                required: 2
            })
            .exit_code(),
            1
        );
    }

    #[test]
    fn test_format_transaction() {
        let tx = CreditTransaction {
            id: 1,
            account_id: "a".into(),
            delta: -20,
            reason: TransactionReason::Spend,
            hold_id: Some("h-1".into()),
            balance_after: 80,
            memo: None,
            created_at: 0,
        };
        assert_eq!(
            format_transaction(&tx),
            "1970-01-01 00:00:00 | spend | -20 | balance 80 | h-1"
        );
    }
}
