//! hostwall - host firewall policy compiler
//!
//! # Usage
//!
//! ```bash
//! hostwall init                          # Write a default config file
//! hostwall plan                          # Print the baseline batch as nft JSON
//! hostwall apply                         # Install the baseline policy
//! hostwall trust --add 10.0.0.0/8        # Edit the trusted admin sources
//! hostwall ban 198.51.100.7 --timeout 3600
//! hostwall list set trusted
//! hostwall list rules input
//! hostwall cleanup                       # Fall back to loopback + admin access
//! ```
//!
//! `--dry-run` runs any command against an in-memory kernel model (after an
//! implicit apply) and prints the batch it would have sent.

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::Level;

use hostwall::audit::{self, EventType};
use hostwall::config::{self, DEFAULT_CONFIG_PATH};
use hostwall::core::discovery::SystemDiscovery;
use hostwall::core::error::TransactionHint;
use hostwall::core::memory::MemorySink;
use hostwall::core::nft_json::{self, NftCli};
use hostwall::core::transaction::Sink;
use hostwall::{AddressSet, Error, Firewall, Result};

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "hostwall")]
#[command(about = "Host firewall policy compiler for nftables", long_about = None)]
#[command(version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Policy configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Run against an in-memory kernel model and print the batch instead
    #[arg(long, global = true)]
    dry_run: bool,

    /// Raise log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration to the config path
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the baseline batch as nftables JSON without applying it
    Plan,
    /// Install the baseline policy, replacing the whole ruleset
    Apply,
    /// Install the reduced safe ruleset, keeping trusted sources
    Cleanup,
    /// Edit the trusted admin source set
    Trust(SetEdit),
    /// Edit the manager source set (overlay)
    Manager(SetEdit),
    /// Edit the forwarded address set
    Forward(SetEdit),
    /// Drop all input from addresses, networks or ranges
    Ban {
        #[arg(required = true)]
        specs: Vec<String>,
        /// Expire the ban after this many seconds
        #[arg(short, long, value_name = "SECONDS")]
        timeout: Option<u64>,
    },
    /// Lift bans
    Unban {
        #[arg(required = true)]
        specs: Vec<String>,
    },
    /// Show installed state
    List {
        #[command(subcommand)]
        target: ListTarget,
    },
}

#[derive(clap::Args)]
struct SetEdit {
    /// Elements to add (address, CIDR or range)
    #[arg(short, long, num_args = 1..)]
    add: Vec<String>,
    /// Elements to remove
    #[arg(short, long, num_args = 1..)]
    remove: Vec<String>,
}

#[derive(Subcommand)]
enum ListTarget {
    /// Elements of an address set
    Set { which: SetName },
    /// Rules of a filter chain
    Rules {
        #[arg(default_value = "input")]
        chain: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SetName {
    Trusted,
    Manager,
    Forward,
    Blacklist,
}

impl From<SetName> for AddressSet {
    fn from(name: SetName) -> Self {
        match name {
            SetName::Trusted => AddressSet::Trusted,
            SetName::Manager => AddressSet::Manager,
            SetName::Forward => AddressSet::Forward,
            SetName::Blacklist => AddressSet::Blacklist,
        }
    }
}

impl Commands {
    fn is_mutating(&self) -> bool {
        !matches!(self, Commands::Init { .. } | Commands::Plan | Commands::List { .. })
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn report(e: &Error) {
    if let Error::Transaction {
        stderr: Some(stderr),
        exit_code,
        ..
    } = e
    {
        let hint = TransactionHint::match_error(stderr);
        eprintln!("Error: {}", hint.user_message);
        if let Some(code) = exit_code {
            eprintln!("  nft exited with status {code}");
        }
        for suggestion in &hint.suggestions {
            eprintln!("  hint: {suggestion}");
        }
    } else {
        eprintln!("Error: {e}");
    }
}

fn run(cli: &Cli) -> Result<()> {
    if let Commands::Init { force } = cli.command {
        config::init_config(&cli.config, force)?;
        println!("✓ Default config written to {}", cli.config.display());
        return Ok(());
    }
    let config = config::load_config(&cli.config)?;

    if cli.dry_run || matches!(cli.command, Commands::Plan) {
        let mut fw = Firewall::new(config, MemorySink::new(), SystemDiscovery)?;
        if !matches!(cli.command, Commands::Apply) {
            fw.apply()?;
        }
        execute(&mut fw, &cli.command)?;
        let document = nft_json::render_batch(fw.sink().last_batch())?;
        println!("{}", serde_json::to_string_pretty(&document)?);
        eprintln!("checksum {}", nft_json::checksum(&document));
        return Ok(());
    }

    let mut fw = Firewall::new(config, NftCli::new(), SystemDiscovery)?;
    let needs_policy = !matches!(cli.command, Commands::Apply | Commands::Cleanup);
    if needs_policy && !fw.attach()? {
        return Err(Error::Configuration(
            "no installed policy found; run `hostwall apply` first".to_string(),
        ));
    }

    let result = execute(&mut fw, &cli.command);
    if cli.command.is_mutating() {
        let (event, details) = audit_details(&cli.command, fw.filter_table().name.as_str());
        audit::record(event, details, result.as_ref().map(|_| ()).map_err(ToString::to_string));
    }
    result
}

fn execute<S: Sink>(fw: &mut Firewall<S, SystemDiscovery>, command: &Commands) -> Result<()> {
    match command {
        Commands::Init { .. } | Commands::Plan => {}
        Commands::Apply => {
            fw.apply()?;
            println!("✓ Baseline policy applied ({} on {})", fw.wan_addr(), fw.wan_iface());
        }
        Commands::Cleanup => {
            fw.cleanup()?;
            println!("✓ Cleanup ruleset installed");
        }
        Commands::Trust(edit) => fw.update_trusted_ips(&edit.remove, &edit.add)?,
        Commands::Manager(edit) => fw.update_manager_ips(&edit.remove, &edit.add)?,
        Commands::Forward(edit) => fw.update_forward_ips(&edit.remove, &edit.add)?,
        Commands::Ban { specs, timeout } => {
            fw.ban(specs, timeout.map(Duration::from_secs))?;
            println!("✓ Banned {} entries", specs.len());
        }
        Commands::Unban { specs } => {
            fw.unban(specs)?;
            println!("✓ Unbanned {} entries", specs.len());
        }
        Commands::List { target } => match target {
            ListTarget::Set { which } => {
                for member in fw.set_members((*which).into())? {
                    println!("{member}");
                }
            }
            ListTarget::Rules { chain } => {
                for rule in fw.rules(chain)? {
                    let handle = rule.handle.map_or_else(|| "-".to_string(), |h| h.to_string());
                    println!("{handle:>6}  {}", rule.id.as_deref().unwrap_or(""));
                }
            }
        },
    }
    Ok(())
}

fn audit_details(command: &Commands, table: &str) -> (EventType, serde_json::Value) {
    match command {
        Commands::Init { .. } | Commands::Apply | Commands::Plan | Commands::List { .. } => {
            (EventType::Apply, json!({ "table": table }))
        }
        Commands::Cleanup => (EventType::Cleanup, json!({ "table": table })),
        Commands::Trust(edit) | Commands::Manager(edit) | Commands::Forward(edit) => {
            let set = match command {
                Commands::Trust(_) => AddressSet::Trusted,
                Commands::Manager(_) => AddressSet::Manager,
                _ => AddressSet::Forward,
            };
            (
                EventType::UpdateSet,
                json!({
                    "table": table,
                    "set": set.to_string(),
                    "added": edit.add,
                    "removed": edit.remove,
                }),
            )
        }
        Commands::Ban { specs, timeout } => (
            EventType::Ban,
            json!({ "table": table, "specs": specs, "timeout_secs": timeout }),
        ),
        Commands::Unban { specs } => (EventType::Unban, json!({ "table": table, "specs": specs })),
    }
}
