use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::application::{
    DeductionRequest, LedgerError, LedgerService, Sweeper, SyncChannel, parse_push_message,
};
use crate::config::{ConfigOverrides, LedgerConfig};
use crate::domain::{
    PricingCalculator, PricingRequest, PricingResult, PricingTier, TransactionFilter,
    TransactionType, format_credits, parse_credits,
};
use crate::io::Exporter;
use crate::remote::HttpCreditsApi;
use crate::storage::Repository;

/// Credit Ledger - prepaid credits for maritime intelligence services
#[derive(Parser)]
#[command(name = "credit-ledger")]
#[command(about = "Check balances, buy credit packages, price and pay for services")]
#[command(version)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Ledger API base URL
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Database file holding the persisted balance
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Session bearer token
    #[arg(long, global = true, env = "CREDIT_LEDGER_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the credit balance
    Balance {
        /// Fetch from the server even if a cached balance exists
        #[arg(long)]
        refresh: bool,
    },

    /// List credit transactions
    Transactions {
        /// Maximum number of transactions to show
        #[arg(short, long)]
        limit: Option<usize>,

        /// Number of transactions to skip
        #[arg(long)]
        offset: Option<usize>,

        /// Filter by type: purchase, deduction, refund, bonus
        #[arg(long = "type")]
        tx_type: Option<String>,

        /// Filter from date (YYYY-MM-DD)
        #[arg(long)]
        from_date: Option<String>,

        /// Filter to date (YYYY-MM-DD)
        #[arg(long)]
        to_date: Option<String>,

        /// Output format: table, csv, json
        #[arg(short, long, default_value = "table")]
        format: String,

        /// Output file path (defaults to stdout)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// List the credit packages on offer
    Packages,

    /// Buy a credit package
    Purchase {
        /// Package id (starter, standard, professional, enterprise)
        package: String,

        /// Stored payment method id
        #[arg(long)]
        payment_method: String,
    },

    /// Spend credits on a service immediately
    Deduct {
        /// Number of credits (e.g., "450" or "1,200")
        amount: String,

        /// Identifier of the service instance being paid for
        #[arg(long)]
        service_id: String,

        /// Service type (e.g., vessel_tracking)
        #[arg(long)]
        service_type: String,

        /// Description shown in the transaction history
        #[arg(short = 'm', long)]
        description: Option<String>,
    },

    /// Hold credits, then confirm (default) or cancel the hold
    Reserve {
        /// Number of credits to hold
        amount: String,

        /// Identifier of the service instance being paid for
        #[arg(long)]
        service_id: String,

        /// Release the hold instead of confirming it
        #[arg(long)]
        cancel: bool,
    },

    /// Price a service without spending anything
    Quote {
        /// Service type: vessel_tracking, area_monitoring, fleet_tracking, report, investigation
        service: String,

        /// Number of tracking criteria
        #[arg(long)]
        criteria: Option<u32>,

        /// Monitored area in km²
        #[arg(long)]
        area: Option<f64>,

        /// Number of vessels
        #[arg(long)]
        vessels: Option<u32>,

        /// Duration in days
        #[arg(long)]
        days: Option<f64>,

        /// Duration in months (fleet subscriptions)
        #[arg(long)]
        months: Option<f64>,

        /// Report or investigation kind
        #[arg(long)]
        subtype: Option<String>,

        /// Pricing tier: bronze, silver, gold, platinum
        #[arg(long)]
        tier: Option<String>,

        /// Output format: table, json
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Apply balance push events (JSON lines on stdin) while sweeping expired holds
    Watch,
}

/// Install the stderr log subscriber. `RUST_LOG` wins over the verbosity flag.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

impl Cli {
    fn load_config(&self) -> Result<LedgerConfig> {
        LedgerConfig::load(ConfigOverrides {
            config_path: self.config.clone(),
            base_url: self.base_url.clone(),
            database: self.database.clone(),
            token: self.token.clone(),
        })
    }

    pub async fn run(self) -> Result<()> {
        init_tracing(self.verbose);
        let config = self.load_config()?;

        match self.command {
            // Pricing is pure; no session or database needed
            Commands::Quote {
                service,
                criteria,
                area,
                vessels,
                days,
                months,
                subtype,
                tier,
                format,
            } => {
                let request = PricingRequest {
                    service_type: service,
                    criteria_count: criteria,
                    area_size_km2: area,
                    vessel_count: vessels,
                    duration_days: days,
                    duration_months: months,
                    subtype,
                    pricing_tier: tier.as_deref().map(parse_tier).transpose()?,
                };
                let service = connect_offline(&config)?;
                run_quote_command(&service, &request, &format)
            }

            command => {
                let service = open_service(&config).await?;
                run_session_command(&service, command, &config).await?;
                service.close(false).await?;
                Ok(())
            }
        }
    }
}

async fn run_session_command(
    service: &LedgerService,
    command: Commands,
    config: &LedgerConfig,
) -> Result<()> {
    match command {
        Commands::Balance { refresh } => {
            run_balance_command(service, refresh).await?;
        }

        Commands::Transactions {
            limit,
            offset,
            tx_type,
            from_date,
            to_date,
            format,
            output,
        } => {
            let filter = build_filter(limit, offset, tx_type, from_date, to_date)?;
            run_transactions_command(service, &filter, &format, output.as_deref()).await?;
        }

        Commands::Packages => {
            run_packages_command(service);
        }

        Commands::Purchase {
            package,
            payment_method,
        } => {
            let receipt = service
                .purchase_credits(&package, &payment_method)
                .await
                .map_err(explain)?;
            println!(
                "Purchased {} package: +{} credits, balance {} ({})",
                receipt.package.name,
                format_credits(receipt.credits_added),
                format_credits(receipt.new_balance),
                receipt.transaction_id
            );
        }

        Commands::Deduct {
            amount,
            service_id,
            service_type,
            description,
        } => {
            let amount = parse_credits(&amount)
                .context("Invalid amount. Use a positive whole number like '450'")?;
            let description =
                description.unwrap_or_else(|| format!("{} {}", service_type, service_id));

            let receipt = service
                .deduct_credits(DeductionRequest {
                    amount,
                    description,
                    service_id,
                    service_type,
                })
                .await
                .map_err(explain)?;
            println!(
                "Deducted {} credits, {} available ({})",
                format_credits(receipt.amount),
                format_credits(receipt.available),
                receipt.transaction_id
            );
        }

        Commands::Reserve {
            amount,
            service_id,
            cancel,
        } => {
            let amount = parse_credits(&amount)
                .context("Invalid amount. Use a positive whole number like '450'")?;
            run_reserve_command(service, amount, &service_id, cancel).await?;
        }

        Commands::Watch => {
            run_watch_command(service, config.sweep_interval()).await?;
        }

        Commands::Quote { service: name, .. } => {
            anyhow::bail!("'{}' quotes do not need a session", name);
        }
    }
    Ok(())
}

fn connect_offline(config: &LedgerConfig) -> Result<LedgerService> {
    let api = HttpCreditsApi::new(&config.api.base_url, config.api.token.clone(), config.timeout())?;
    Ok(LedgerService::new(Arc::new(api))
        .with_pricing(PricingCalculator::new(config.pricing.clone())))
}

async fn open_service(config: &LedgerConfig) -> Result<LedgerService> {
    let api = HttpCreditsApi::new(&config.api.base_url, config.api.token.clone(), config.timeout())?;
    let repo = Repository::open(&config.database)
        .await
        .with_context(|| format!("Failed to open database: {}", config.database))?;

    let service = LedgerService::open(Arc::new(api), repo, config.transaction_window)
        .await?
        .with_pricing(PricingCalculator::new(config.pricing.clone()))
        .with_reservation_ttl(config.reservation_ttl());
    Ok(service)
}

/// Attach a next step to errors the user can act on.
fn explain(err: LedgerError) -> anyhow::Error {
    if err.needs_credits() {
        anyhow::Error::new(err)
            .context("Not enough credits. Run `credit-ledger packages` to see what you can buy")
    } else if err.is_retryable() {
        anyhow::Error::new(err).context("The ledger is unreachable; nothing was charged, try again")
    } else {
        err.into()
    }
}

const EXPIRY_WARNING_DAYS: i64 = 30;

async fn run_balance_command(service: &LedgerService, refresh: bool) -> Result<()> {
    let snapshot = service.get_balance(refresh).await?;

    println!("{:<12} {:>12}", "Available", format_credits(snapshot.available));
    if snapshot.held > 0 {
        println!("{:<12} {:>12}", "On hold", format_credits(snapshot.held));
    }
    println!("{:<12} {:>12}", "Lifetime", format_credits(snapshot.lifetime));

    let now = Utc::now();
    let balance = snapshot.balance();
    if let Some(bucket) = balance.next_expiry(now) {
        println!(
            "\n{} credits expire on {}",
            format_credits(bucket.amount),
            bucket.expires_at.format("%Y-%m-%d")
        );
        let soon = balance.expiring_within(now, chrono::Duration::days(EXPIRY_WARNING_DAYS));
        if soon > 0 {
            println!(
                "{} credits expire within {} days",
                format_credits(soon),
                EXPIRY_WARNING_DAYS
            );
        }
    }
    if let Some(synced_at) = snapshot.synced_at {
        println!("\nSynced {}", synced_at.format("%Y-%m-%d %H:%M:%S UTC"));
    } else {
        println!("\n(cached, not yet synced this session)");
    }
    Ok(())
}

fn build_filter(
    limit: Option<usize>,
    offset: Option<usize>,
    tx_type: Option<String>,
    from_date: Option<String>,
    to_date: Option<String>,
) -> Result<TransactionFilter> {
    let tx_type = tx_type
        .map(|s| {
            TransactionType::from_str(&s).ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid transaction type '{}'. Valid types: purchase, deduction, refund, bonus",
                    s
                )
            })
        })
        .transpose()?;
    let start_date = from_date
        .map(|s| parse_date(&s))
        .transpose()
        .context("Invalid from-date")?;
    let end_date = to_date
        .map(|s| parse_date(&s))
        .transpose()
        .context("Invalid to-date")?;

    Ok(TransactionFilter {
        limit,
        offset,
        tx_type,
        start_date,
        end_date,
    })
}

async fn run_transactions_command(
    service: &LedgerService,
    filter: &TransactionFilter,
    format: &str,
    output: Option<&str>,
) -> Result<()> {
    use std::fs::File;
    use std::io::{Write, stdout};

    if format == "table" {
        let transactions = service.list_transactions(filter).await?;
        if transactions.is_empty() {
            println!("No transactions found.");
            return Ok(());
        }

        println!(
            "{:<12} {:<10} {:>10} {:>10} DESCRIPTION",
            "DATE", "TYPE", "AMOUNT", "BALANCE"
        );
        println!("{}", "-".repeat(70));
        for tx in &transactions {
            println!(
                "{:<12} {:<10} {:>10} {:>10} {}",
                tx.timestamp.format("%Y-%m-%d"),
                tx.tx_type.as_str(),
                format_credits(tx.signed_amount()),
                format_credits(tx.balance_after),
                truncate(&tx.description, 30)
            );
        }
        return Ok(());
    }

    let writer: Box<dyn Write> = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };
    let exporter = Exporter::new(service);

    match format {
        "csv" => {
            let count = exporter.export_transactions_csv(filter, writer).await?;
            if output.is_some() {
                eprintln!("Exported {} transactions", count);
            }
        }
        "json" => {
            let export = exporter.export_transactions_json(filter, writer).await?;
            if output.is_some() {
                eprintln!("Exported {} transactions", export.transactions.len());
            }
        }
        _ => {
            anyhow::bail!("Invalid format '{}'. Valid formats: table, csv, json", format);
        }
    }
    Ok(())
}

fn run_packages_command(service: &LedgerService) {
    println!(
        "{:<14} {:<14} {:>8} {:>10} {:>8}",
        "ID", "NAME", "CREDITS", "PRICE", "SAVINGS"
    );
    println!("{}", "-".repeat(58));
    for package in service.packages() {
        let savings = if package.savings_percent > 0 {
            format!("{}%", package.savings_percent)
        } else {
            "-".to_string()
        };
        println!(
            "{:<14} {:<14} {:>8} {:>10} {:>8}",
            package.id,
            package.name,
            format_credits(package.credits),
            format!("{}.{:02}", package.price_cents / 100, package.price_cents % 100),
            savings
        );
    }
}

async fn run_reserve_command(
    service: &LedgerService,
    amount: i64,
    service_id: &str,
    cancel: bool,
) -> Result<()> {
    let reservation = service
        .reserve_credits(amount, service_id)
        .await
        .map_err(explain)?;
    println!(
        "Reserved {} credits ({}), expires {}",
        format_credits(reservation.amount),
        reservation.id,
        reservation.expires_at.format("%H:%M:%S UTC")
    );

    if cancel {
        service
            .cancel_reservation(&reservation.id)
            .await
            .map_err(explain)?;
        println!(
            "Released hold, {} credits available",
            format_credits(service.store().available())
        );
    } else {
        let receipt = service
            .confirm_reservation(&reservation.id)
            .await
            .map_err(explain)?;
        println!(
            "Confirmed: {} credits spent, {} available ({})",
            format_credits(receipt.amount),
            format_credits(receipt.available),
            receipt.transaction_id
        );
    }
    Ok(())
}

fn run_quote_command(service: &LedgerService, request: &PricingRequest, format: &str) -> Result<()> {
    match format {
        "json" => {
            Exporter::new(service).export_quote_json(request, std::io::stdout())?;
            println!();
        }
        "table" => {
            let result = service.calculate_service_cost(request)?;
            print_quote(&result);
        }
        _ => anyhow::bail!("Invalid format '{}'. Valid formats: table, json", format),
    }
    Ok(())
}

fn print_quote(result: &PricingResult) {
    println!("{:<16} {}", "Service", result.service_type);
    if let Some(units) = result.unit_count {
        println!("{:<16} {}", "Units", units);
    }
    if let Some(days) = result.billed_days {
        println!("{:<16} {}", "Billed days", days);
    }
    println!("{:<16} {:>10}", "Base price", format_credits(result.base_price));
    for discount in &result.applied_discounts {
        println!("  {}", discount);
    }
    println!("{:<16} {:>10}", "Total credits", format_credits(result.total_credits));
    if result.savings() > 0 {
        println!("{:<16} {:>10}", "You save", format_credits(result.savings()));
    }
    if let Some(per_day) = result.price_per_day {
        println!("{:<16} {:>10.2}", "Per day", per_day);
    }
    if let Some(per_vessel) = result.price_per_vessel {
        println!("{:<16} {:>10.2}", "Per vessel", per_vessel);
    }
}

async fn run_watch_command(service: &LedgerService, sweep_interval: Duration) -> Result<()> {
    let store = service.store().clone();
    let sweeper = Sweeper::new(store.clone(), sweep_interval).spawn();

    let mut updates = store.subscribe();
    let printer = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            println!(
                "{} available {:>10} held {:>8}",
                Utc::now().format("%H:%M:%S"),
                format_credits(snapshot.available),
                format_credits(snapshot.held)
            );
        }
    });

    let lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let events = lines.filter_map(|line| match line {
        Ok(text) if text.trim().is_empty() => None,
        Ok(text) => match parse_push_message(&text) {
            Ok(event) => event,
            Err(err) => {
                warn!(reason = %err, "malformed push message");
                None
            }
        },
        Err(err) => {
            warn!(reason = %err, "failed to read push stream");
            None
        }
    });

    let mut subscription = SyncChannel::new(store.clone()).subscribe(Box::pin(events));
    let interrupted = tokio::select! {
        _ = subscription.finished() => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    let stats = subscription.unsubscribe().await;
    let restored = sweeper.shutdown().await;
    printer.abort();

    if interrupted {
        eprintln!();
    }
    println!(
        "Applied {} balance updates ({} rejected), released {} expired credits",
        stats.applied,
        stats.rejected,
        format_credits(restored)
    );
    Ok(())
}

fn parse_tier(s: &str) -> Result<PricingTier> {
    PricingTier::from_str(s).ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid pricing tier '{}'. Valid tiers: bronze, silver, gold, platinum",
            s
        )
    })
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

fn parse_date(date_str: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    use chrono::NaiveDate;

    let naive_date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .context("Date must be in YYYY-MM-DD format")?;
    let naive_datetime = naive_date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow::anyhow!("Invalid date"))?;

    Ok(chrono::DateTime::from_naive_utc_and_offset(
        naive_datetime,
        chrono::Utc,
    ))
}
