//! speechd-gate-control - CLI control utility for the speechd-gate daemon
//!
//! Talks to the daemon over the session bus.

use clap::{Parser, Subcommand};
use zbus::blocking::Connection;

/// CLI control utility for the speechd-gate daemon
#[derive(Parser)]
#[command(name = "speechd-gate-control")]
#[command(author = "StarTuz")]
#[command(version)]
#[command(about = "Control utility for the speechd-gate control plane", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check service health
    Ping,

    /// Get daemon version
    Version,

    /// Show how a request would be routed
    Route {
        /// Request text
        text: String,
        /// Latency budget in milliseconds (0 = configured default)
        #[arg(short, long, default_value = "0")]
        budget: u32,
        /// Force the private lane
        #[arg(long)]
        no_cloud: bool,
    },

    /// Ask the admission gate whether a request would be accepted
    Admit {
        /// Current voice queue length
        #[arg(short, long, default_value = "0")]
        queue: u32,
    },

    /// Report the outcome of a request handled elsewhere
    Report {
        /// Report a failure instead of a success
        #[arg(long)]
        failed: bool,
        /// Error description for a failure
        #[arg(short, long, default_value = "")]
        error: String,
    },

    /// Run a request through the full pipeline
    Think {
        /// Request text
        text: String,
        /// Latency budget in milliseconds (0 = configured default)
        #[arg(short, long, default_value = "0")]
        budget: u32,
        /// Current voice queue length
        #[arg(short, long, default_value = "0")]
        queue: u32,
    },

    /// Shed one unit of local backend concurrency
    Degrade,

    /// Show control-plane status as JSON
    Status,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let conn = Connection::session()?;

    let dest = "org.speech.Gate";
    let path = "/org/speech/Gate";
    let iface = "org.speech.Gate";

    match cli.command {
        Commands::Ping => {
            let result: String = conn
                .call_method(Some(dest), path, Some(iface), "Ping", &())?
                .body()
                .deserialize()?;
            println!("{}", result);
        }

        Commands::Version => {
            let result: String = conn
                .call_method(Some(dest), path, Some(iface), "GetVersion", &())?
                .body()
                .deserialize()?;
            println!("speechd-gate {}", result);
        }

        Commands::Route {
            text,
            budget,
            no_cloud,
        } => {
            let (route, intent, confidence, budget, privacy, reasoning, no_cloud): (
                String,
                String,
                f64,
                u32,
                String,
                String,
                bool,
            ) = conn
                .call_method(Some(dest), path, Some(iface), "Route", &(text, budget, no_cloud))?
                .body()
                .deserialize()?;

            println!("Route Decision");
            println!("──────────────");
            println!("Route:      {}", route);
            println!("Intent:     {}", intent);
            println!("Confidence: {:.0}%", confidence * 100.0);
            println!("Budget:     {} ms", budget);
            println!("Privacy:    {}", privacy);
            println!("No cloud:   {}", if no_cloud { "Yes" } else { "No" });
            println!("Reasoning:  {}", reasoning);
        }

        Commands::Admit { queue } => {
            let (allowed, reason): (bool, String) = conn
                .call_method(Some(dest), path, Some(iface), "Admit", &queue)?
                .body()
                .deserialize()?;
            if allowed {
                println!("✓ Admitted");
            } else {
                println!("✗ Denied: {}", reason);
            }
        }

        Commands::Report { failed, error } => {
            let _: () = conn
                .call_method(
                    Some(dest),
                    path,
                    Some(iface),
                    "ReportResult",
                    &(!failed, error),
                )?
                .body()
                .deserialize()?;
            println!("Reported {}", if failed { "failure" } else { "success" });
        }

        Commands::Think {
            text,
            budget,
            queue,
        } => {
            let (lane, response): (String, String) = conn
                .call_method(Some(dest), path, Some(iface), "Think", &(text, budget, queue))?
                .body()
                .deserialize()?;
            if response.is_empty() {
                println!("[{}] hand off to the realtime lane", lane);
            } else {
                println!("[{}] {}", lane, response);
            }
        }

        Commands::Degrade => {
            let capacity: u32 = conn
                .call_method(Some(dest), path, Some(iface), "Degrade", &())?
                .body()
                .deserialize()?;
            println!("Backend concurrency now {}", capacity);
        }

        Commands::Status => {
            let status: String = conn
                .call_method(Some(dest), path, Some(iface), "GetStatus", &())?
                .body()
                .deserialize()?;
            println!("{}", status);
        }
    }

    Ok(())
}
