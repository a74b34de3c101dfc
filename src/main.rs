//! Smart Trader CLI
//!
//! Streams ticks with digit statistics and runs single or repeating
//! short-duration trades over the Deriv WebSocket API, recording every
//! contract to a local SQLite ledger.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use smart_trader::analysis::DigitTracker;
use smart_trader::ledger::{Ledger, LedgerSink};
use smart_trader::models::{ContractKind, DurationUnit, StreamEvent, TradeIntent};
use smart_trader::session::SubscriptionKind;
use smart_trader::{EngineConfig, Session, TradeCycleController};

/// Smart Trader CLI.
#[derive(Parser)]
#[command(name = "smarttrader")]
#[command(about = "Trade short-duration Deriv contracts from the terminal", long_about = None)]
struct Cli {
    /// Ledger database URL
    #[arg(short, long, env = "SMART_TRADER_DB")]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Deriv API token
    #[arg(long, env = "DERIV_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Registered application id
    #[arg(long, env = "DERIV_APP_ID")]
    app_id: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List synthetic symbols currently offered
    Symbols,

    /// Stream ticks for a symbol with last-digit statistics
    Ticks {
        /// Symbol to stream
        #[arg(default_value = "R_100")]
        symbol: String,

        /// Stop after this many ticks
        #[arg(short, long)]
        count: Option<u64>,

        /// Barrier digit for over/under percentages
        #[arg(short, long, default_value = "4")]
        barrier: u8,
    },

    /// Buy a contract and follow it to settlement
    ///
    /// Ctrl+C while a contract is open stops following it; its ledger row
    /// stays open even though the contract settles server-side.
    Trade {
        /// Underlying symbol
        #[arg(short, long, default_value = "R_100")]
        symbol: String,

        /// Contract type (DIGITEVEN, DIGITODD, DIGITOVER, DIGITUNDER, DIGITMATCH, DIGITDIFF, CALL, PUT)
        #[arg(short, long, default_value = "DIGITEVEN")]
        kind: ContractKind,

        /// Stake in account currency
        #[arg(long, default_value = "1")]
        stake: Decimal,

        /// Contract duration
        #[arg(short, long, default_value = "5")]
        duration: u32,

        /// Duration unit (t, s, m, h, d)
        #[arg(short, long, default_value = "t")]
        unit: DurationUnit,

        /// Prediction digit for over/under/match/differ contracts
        #[arg(short, long)]
        prediction: Option<u8>,

        /// Keep trading until Ctrl+C
        #[arg(long)]
        repeat: bool,
    },

    /// Show the balance of the first real fiat account
    Balance,

    /// Show recorded contracts
    History {
        /// Number of contracts to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = EngineConfig::from_env()?;
    if let Some(database) = cli.database {
        config.database_url = database;
    }
    if let Some(token) = cli.token {
        config.api_token = Some(token);
    }
    if let Some(app_id) = cli.app_id {
        config.app_id = app_id;
    }

    match cli.command {
        Commands::Symbols => {
            let session = connect(&config).await?;
            let symbols = session.active_symbols().await?;
            session.dispose();

            println!("\n{:<12} {:<32} {:>6}", "SYMBOL", "NAME", "OPEN");
            println!("{}", "-".repeat(52));
            for symbol in symbols {
                println!(
                    "{:<12} {:<32} {:>6}",
                    symbol.symbol,
                    truncate(&symbol.display_name, 30),
                    if symbol.exchange_is_open { "yes" } else { "no" }
                );
            }
        }

        Commands::Ticks {
            symbol,
            count,
            barrier,
        } => {
            let session = connect(&config).await?;
            let tracker = Arc::new(DigitTracker::new(symbol.clone()));
            session.fanout().register(tracker.clone());

            let mut handle = session.subscribe_ticks(&symbol).await?;
            info!(symbol = %symbol, "Streaming ticks, Ctrl+C to stop");

            loop {
                tokio::select! {
                    event = handle.next() => match event {
                        Some(StreamEvent::Tick(tick)) => {
                            let (even, odd) = tracker.even_odd_percent();
                            let (over, under) = tracker.over_under_percent(barrier);
                            let recent: Vec<String> =
                                tracker.recent().iter().map(u8::to_string).collect();
                            println!(
                                "{:<10} {:>12} digit {}  [{}]  even {:>5.1}% odd {:>5.1}%  over{} {:>5.1}% under{} {:>5.1}%",
                                tick.symbol,
                                tick.quote,
                                tick.last_digit,
                                recent.join(" "),
                                even,
                                odd,
                                barrier,
                                over,
                                barrier,
                                under
                            );
                            if count.map_or(false, |n| tracker.processed() >= n) {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }

            session.cancel(SubscriptionKind::Tick, &symbol);
            let stats = tracker.snapshot();
            session.dispose();

            println!("\nProcessed {} ticks", stats.processed);
            println!("Rise/Fall: {:.1}% / {:.1}%", stats.rise_percent, stats.fall_percent);
            for (digit, pct) in stats.frequency.iter().enumerate() {
                println!("  {}: {:>5.1}%", digit, pct);
            }
        }

        Commands::Trade {
            symbol,
            kind,
            stake,
            duration,
            unit,
            prediction,
            repeat,
        } => {
            let intent = TradeIntent {
                kind,
                stake,
                duration,
                duration_unit: unit,
                symbol,
                prediction,
            };
            intent.validate()?;

            let ledger = Arc::new(Ledger::new(&config.database_url).await?);
            let session = connect(&config).await?;

            let (sink, writer) = LedgerSink::spawn(Arc::clone(&ledger));
            let sink_id = session.fanout().register(Arc::new(sink));

            let controller = Arc::new(TradeCycleController::new(Arc::clone(&session)));

            let mut states = controller.subscribe_state();
            tokio::spawn(async move {
                while let Ok(state) = states.recv().await {
                    info!(state = ?state, "Controller");
                }
            });

            let stopper = Arc::clone(&controller);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl+C received, stopping after the current step");
                    info!("An open contract is no longer followed; its ledger row stays open");
                    stopper.stop();
                }
            });

            let outcome = controller.run(intent, repeat).await;

            session.fanout().unregister(sink_id);
            session.dispose();
            writer.await.ok();

            let summary = outcome?;
            let totals = ledger.summary().await?;

            println!("\n=== Run {} ===", summary.run_id);
            println!("Purchased:  {}", summary.purchased);
            println!("Settled:    {}", summary.settled);
            println!("Wins:       {}", summary.wins);
            println!("Losses:     {}", summary.losses);
            println!("Net profit: {}", summary.net_profit);
            println!(
                "\nLedger: {} contracts, {} settled, net {:.2}",
                totals.contracts, totals.settled, totals.net_profit
            );
        }

        Commands::Balance => {
            let session = connect(&config).await?;
            let auth = session.ensure_authenticated().await?;

            let loginid = auth
                .real_fiat_account()
                .map(|account| account.loginid.clone())
                .unwrap_or_else(|| auth.login_id.clone());
            let balance = session.balance(Some(&loginid)).await?;
            session.dispose();

            println!("\n{:<12} {:<8} {:>8}", "LOGIN ID", "CURRENCY", "VIRTUAL");
            println!("{}", "-".repeat(30));
            for account in &auth.accounts {
                println!(
                    "{:<12} {:<8} {:>8}",
                    account.loginid,
                    account.currency,
                    if account.is_virtual { "yes" } else { "no" }
                );
            }
            println!(
                "\nBalance of {}: {} {}",
                balance.loginid, balance.balance, balance.currency
            );
        }

        Commands::History { limit } => {
            let ledger = Ledger::new(&config.database_url).await?;
            let rows = ledger.recent(limit).await?;

            if rows.is_empty() {
                println!("No contracts recorded yet. Use 'smarttrader trade' to place one.");
                return Ok(());
            }

            println!(
                "\n{:<14} {:<12} {:<8} {:>8} {:>6} {:>9}  {}",
                "CONTRACT", "TYPE", "SYMBOL", "PRICE", "STATUS", "PROFIT", "STARTED"
            );
            println!("{}", "-".repeat(84));
            for row in &rows {
                let started = row
                    .date_start
                    .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<14} {:<12} {:<8} {:>8.2} {:>6} {:>9}  {}",
                    row.contract_id,
                    truncate(&row.contract_type, 12),
                    row.underlying,
                    row.buy_price.unwrap_or_default(),
                    row.status,
                    row.profit
                        .map(|p| format!("{:.2}", p))
                        .unwrap_or_else(|| "-".to_string()),
                    started
                );
            }

            let summary = ledger.summary().await?;
            println!(
                "\n{} contracts, {} settled ({} won, {} lost), net {:.2}",
                summary.contracts, summary.settled, summary.wins, summary.losses, summary.net_profit
            );
        }
    }

    Ok(())
}

async fn connect(config: &EngineConfig) -> Result<Arc<Session>> {
    Session::connect(config.clone())
        .await
        .with_context(|| format!("Failed to connect to {}", config.endpoint))
}

/// Truncate string with ellipsis.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
