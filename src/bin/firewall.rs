//! CLI tool for managing the proxy's inbound firewall rule
//!
//! Usage:
//!   urlproxy-firewall add --port <port> [--name <rule>]
//!   urlproxy-firewall remove [--name <rule>]
//!   urlproxy-firewall check

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use urlproxy::config::{DEFAULT_FIREWALL_RULE_NAME, DEFAULT_PORT};
use urlproxy::{FirewallController, SystemFirewall};

/// CLI tool for managing the UrlProxy firewall rule
#[derive(Parser, Debug)]
#[command(name = "urlproxy-firewall")]
#[command(author = "UrlProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Add, remove or inspect the UrlProxy inbound firewall rule")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Allow inbound TCP on a port
    Add {
        /// Port to open
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Rule name
        #[arg(short, long, env = "URLPROXY_RULE_NAME", default_value = DEFAULT_FIREWALL_RULE_NAME)]
        name: String,
    },

    /// Delete every rule with the given name
    Remove {
        /// Rule name
        #[arg(short, long, env = "URLPROXY_RULE_NAME", default_value = DEFAULT_FIREWALL_RULE_NAME)]
        name: String,
    },

    /// Show the detected backend and whether this process is elevated
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let firewall = SystemFirewall::new();

    match args.command {
        Commands::Add { port, name } => {
            firewall
                .add_rule(port, &name)
                .await
                .with_context(|| format!("Failed to add rule '{}' for port {}", name, port))?;
            println!("Added rule '{}' allowing inbound TCP on port {}", name, port);
        }

        Commands::Remove { name } => {
            firewall
                .remove_rule(&name)
                .await
                .with_context(|| format!("Failed to remove rule '{}'", name))?;
            println!("Removed rule '{}'", name);
        }

        Commands::Check => {
            println!("Backend:  {}", firewall.backend().name());
            println!(
                "Elevated: {}",
                if firewall.is_elevated() { "yes" } else { "no" }
            );
            if !firewall.is_elevated() {
                println!();
                println!("Adding or removing rules needs administrator privileges.");
            }
        }
    }

    Ok(())
}
