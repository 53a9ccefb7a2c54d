//! Shipdesk CLI - Database migrations and carrier diagnostics.
//!
//! # Usage
//!
//! ```bash
//! # Run admin database migrations
//! sd-cli migrate
//!
//! # Check Melhor Envio credentials (company + balance)
//! sd-cli shipping test
//!
//! # Quote a single package
//! sd-cli shipping quote --from 01310-100 --to 20040-020 \
//!     --weight 1.5 --height 10 --width 15 --length 20 --insured 50.00
//! ```
//!
//! # Commands
//!
//! - `migrate` - Run database migrations
//! - `shipping test` - Carrier connectivity check
//! - `shipping quote` - Print quotes, cheapest first

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;

mod commands;

use commands::shipping::QuoteArgs;

#[derive(Debug, Parser)]
#[command(name = "sd-cli")]
#[command(author, version, about = "Shipdesk CLI tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run admin database migrations
    Migrate,
    /// Talk to the Melhor Envio API
    Shipping {
        #[command(subcommand)]
        action: ShippingAction,
    },
}

#[derive(Debug, Subcommand)]
enum ShippingAction {
    /// Verify credentials by fetching company info and balance
    Test,
    /// Quote a single package
    Quote {
        /// Origin postal code (CEP)
        #[arg(long)]
        from: String,

        /// Destination postal code (CEP)
        #[arg(long)]
        to: String,

        /// Weight in kilograms
        #[arg(long)]
        weight: Decimal,

        /// Height in centimeters
        #[arg(long)]
        height: u32,

        /// Width in centimeters
        #[arg(long)]
        width: u32,

        /// Length in centimeters
        #[arg(long)]
        length: u32,

        /// Declared value in BRL
        #[arg(long, default_value = "0")]
        insured: Decimal,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Carrier calls go over rustls
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::warn!("rustls crypto provider was already installed");
    }

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Migrate => commands::migrate::admin().await?,
        Commands::Shipping { action } => match action {
            ShippingAction::Test => commands::shipping::test().await?,
            ShippingAction::Quote {
                from,
                to,
                weight,
                height,
                width,
                length,
                insured,
            } => {
                let args = QuoteArgs {
                    from,
                    to,
                    weight_kg: weight,
                    height_cm: height,
                    width_cm: width,
                    length_cm: length,
                    insured_value: insured,
                };
                commands::shipping::quote(&args).await?;
            }
        },
    }
    Ok(())
}
