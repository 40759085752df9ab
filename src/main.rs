//! Coin Rotation Trader - Main Entry Point
//!
//! Runs one scouting or trading cycle against Binance spot, or against an
//! in-memory exchange seeded with live prices when paper trading.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coin_rotation_trader::config::Config;
use coin_rotation_trader::exchange::{BinanceClient, ExchangeGateway, MockExchange};
use coin_rotation_trader::persistence::Ledger;
use coin_rotation_trader::strategy::AutoTrader;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Coin Rotation Trader CLI
#[derive(Parser)]
#[command(name = "coin-rotation-trader")]
#[command(version, about = "Rotate a spot holding between coins through a bridge currency")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score every pair out of the current coin and print the heartbeat
    Scout,

    /// Initialize missing ratios, scout once and jump if a candidate qualifies
    Trade,

    /// Initialize missing pair ratios from current prices
    InitRatios,

    /// Show recent trades from the ledger
    History {
        /// Number of trades to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load().context("Failed to load configuration")?;
    config.validate()?;

    if let Commands::History { limit } = cli.command {
        return show_history(&config, limit);
    }

    log_config(&config);

    let ledger = Arc::new(Ledger::new(&config.persistence.db_path)?);
    let gateway = build_gateway(&config).await?;
    let trader = AutoTrader::new(gateway.clone(), ledger, &config);
    trader.initialize()?;

    let snapshot = gateway
        .snapshot()
        .await
        .context("Failed to fetch market snapshot")?;

    match cli.command {
        Commands::Scout => {
            let report = trader.scout(&snapshot)?;
            if report.current_price_unavailable {
                println!("No price for {}, nothing scouted", report.current);
            }
            for line in report.lines() {
                println!("{line}");
            }
        }
        Commands::Trade => match trader.run_cycle(&snapshot).await {
            Ok(Some(outcome)) => {
                info!(
                    from = %outcome.from,
                    to = %outcome.to,
                    quantity = %outcome.acquisition.executed_qty,
                    price = %outcome.acquisition.limit_price,
                    "Jump complete"
                );
            }
            Ok(None) => info!("No jump this cycle"),
            Err(e) if e.should_rescout() => {
                warn!(error = %e, "Trade abandoned, back to scouting");
            }
            Err(e) => {
                error!(error = %e, "Trade failed");
                return Err(e.into());
            }
        },
        Commands::InitRatios => {
            let initialized = trader.initialize_ratios(&snapshot)?;
            println!("Initialized {initialized} pair ratios");
        }
        Commands::History { .. } => unreachable!("handled before connecting"),
    }

    Ok(())
}

/// Live client, or a mock exchange seeded with live prices and lot steps.
async fn build_gateway(config: &Config) -> Result<Arc<dyn ExchangeGateway>> {
    let client = BinanceClient::new(&config.binance)?;
    if !config.binance.paper_trading {
        info!("Trading live on Binance spot");
        return Ok(Arc::new(client));
    }

    info!("Paper trading with live prices");
    let tickers = client
        .get_ticker_prices()
        .await
        .context("Failed to fetch live prices for paper trading")?;

    let bridge = &config.trading.bridge;
    let exchange = MockExchange::new();

    for coin in &config.trading.coins {
        let symbol = format!("{coin}{bridge}");
        let Some(ticker) = tickers.iter().find(|t| t.symbol == symbol) else {
            warn!(%symbol, "No live price, coin not tradable in paper mode");
            continue;
        };
        let step = client
            .lot_step(&symbol)
            .await
            .with_context(|| format!("Failed to fetch lot step for {symbol}"))?;

        exchange.add_symbol(coin, bridge, &step).await;
        exchange.set_price(&symbol, ticker.price).await;
    }
    exchange
        .set_balance(bridge, config.paper.initial_balance)
        .await;

    Ok(Arc::new(exchange))
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "coin-rotation-trader.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer flushing for the lifetime of the process
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("coin_rotation_trader=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Mode: {}", if config.binance.paper_trading { "paper" } else { "live" });
    info!("   Bridge: {}", config.trading.bridge);
    info!("   Coins: {}", config.trading.coins.join(", "));
    info!(
        "   Scout fee: {} x{} (min rate {}%)",
        config.trading.scout_transaction_fee,
        config.trading.scout_multiplier,
        config.trading.min_scout_rate
    );
    info!(
        "   Order timeouts: buy {}m, sell {}m",
        config.execution.buy_timeout_minutes, config.execution.sell_timeout_minutes
    );
    info!("   Ledger: {}", config.persistence.db_path);
}

/// Print recent trades from the ledger.
fn show_history(config: &Config, limit: usize) -> Result<()> {
    let ledger = Ledger::new(&config.persistence.db_path)?;

    if let Some(holding) = ledger.current_holding()? {
        println!("Current holding: {holding}");
    }

    let trades = ledger.trade_history(limit)?;
    if trades.is_empty() {
        println!("No trades recorded yet.");
        return Ok(());
    }

    println!(
        "{:>5}  {:<20}  {:<6} -> {:<6}  {:<8}  {:>14}  {:>16}",
        "ID", "CREATED", "ORIGIN", "TARGET", "STATE", "QUANTITY", "QUOTE QTY"
    );
    for trade in trades {
        let dash = || "-".to_string();
        println!(
            "{:>5}  {:<20}  {:<6} -> {:<6}  {:<8}  {:>14}  {:>16}",
            trade.id,
            trade.created_at.format("%Y-%m-%d %H:%M:%S"),
            trade.origin,
            trade.target,
            trade.state.as_str(),
            trade.quantity.map(|q| q.to_string()).unwrap_or_else(dash),
            trade
                .cumulative_quote_qty
                .map(|q| q.to_string())
                .unwrap_or_else(dash),
        );
    }

    Ok(())
}
