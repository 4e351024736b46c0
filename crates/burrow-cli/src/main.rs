//! burrow — tunnel client CLI.
//!
//! Runs the dial-back agent against a rendezvous server, inspects live
//! sessions and their users, starts server-side services, and offers a
//! plain LAN pass-through proxy.

mod commands;

use clap::{Parser, Subcommand};
use tracing::error;

/// burrow — expose a NAT'd TCP backend through a rendezvous server
#[derive(Parser)]
#[command(name = "burrow", version, about = "burrow tunnel client")]
struct Cli {
    /// Rendezvous server control address
    #[arg(long = "svr_addr", global = true, default_value = "127.0.0.1:2222")]
    svr_addr: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the client agent fronting a local backend
    Client {
        /// Backend host
        #[arg(default_value = "127.0.0.1")]
        host: String,
        /// Backend port
        #[arg(default_value_t = 22)]
        port: u16,
        /// Public port for this client (0 = server picks)
        #[arg(long = "pub_port", default_value_t = 0)]
        pub_port: u16,
        /// Internal port used to listen for dial-backs (0 = server picks)
        #[arg(long = "int_port", default_value_t = 0)]
        int_port: u16,
        /// Client display name
        #[arg(long = "client_name", default_value = "unknown")]
        client_name: String,
        /// Share the public port with other clients
        #[arg(long = "share_public_port")]
        share_public_port: bool,
        /// Backend port advertised for the direct-connect probe
        /// (0 = same as the backend port)
        #[arg(long = "backend_port", default_value_t = 0)]
        backend_port: u16,
    },

    /// List live client sessions
    List,

    /// List connected users of one session
    Users {
        /// Session id (from `burrow list`)
        #[arg(long = "client_name")]
        client_name: String,
    },

    /// Start an HTTP forwarder service on the server
    Forwarder {
        /// Public port for the forwarder (0 = server picks)
        #[arg(long = "pub_port", default_value_t = 0)]
        pub_port: u16,
    },

    /// Plain LAN pass-through proxy, no rendezvous involved
    Lan {
        /// Remote host
        #[arg(default_value = "127.0.0.1")]
        host: String,
        /// Remote port
        #[arg(default_value_t = 22)]
        port: u16,
        /// Local port to listen on
        #[arg(long = "pub_port", default_value_t = 22)]
        pub_port: u16,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    use tracing_subscriber::EnvFilter;
    let default_filter = if cli.verbose {
        "burrow=debug,burrow_cli=debug,burrow_agent=debug,burrow_core=debug"
    } else {
        "burrow=info,burrow_cli=info,burrow_agent=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let result = match cli.command {
        Command::Client {
            host,
            port,
            pub_port,
            int_port,
            client_name,
            share_public_port,
            backend_port,
        } => {
            commands::client::run(
                &cli.svr_addr,
                &host,
                port,
                pub_port,
                int_port,
                &client_name,
                share_public_port,
                backend_port,
            )
            .await
        }
        Command::List => commands::list::run(&cli.svr_addr).await,
        Command::Users { client_name } => commands::users::run(&cli.svr_addr, &client_name).await,
        Command::Forwarder { pub_port } => {
            commands::forwarder::run(&cli.svr_addr, pub_port).await
        }
        Command::Lan {
            host,
            port,
            pub_port,
        } => commands::lan::run(pub_port, &host, port).await,
    };

    if let Err(e) = result {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}
