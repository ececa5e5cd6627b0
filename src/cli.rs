//! Code related to CLI things
//!
//! The framework is a library first: applications build a
//! [NameServer](crate::server::NameServer) and hand it to [run] from their
//! own `main`, which takes care of flags, configuration, logging and the
//! run loop.

use clap::{ArgGroup, Parser};
use log::{info, warn};

use crate::application::DirectApplication;
use crate::config::{ServerTransport, Settings};
use crate::logging;
use crate::server::NameServer;

#[derive(Parser, Clone)]
#[command(name = "yakns", version, arg_required_else_help(false))]
#[command(group(ArgGroup::new("transport").args(["udp", "udp6", "tcp"])))]
/// A programmable authoritative DNS name server framework. But with yak references.
pub struct Cli {
    /// Compiled-in server to run, for binaries that ship more than one.
    #[clap(long)]
    pub server_name: Option<String>,

    /// Host (IP) to bind to. Defaults to localhost.
    #[clap(long)]
    pub host: Option<String>,

    /// Port to bind to. Defaults to 5300.
    #[clap(long)]
    pub port: Option<u16>,

    /// Use a UDPv4 socket for transport. (default)
    #[clap(long)]
    pub udp: bool,

    /// Use a UDPv6 socket for transport.
    #[clap(long)]
    pub udp6: bool,

    /// Use a TCPv4 socket for transport.
    #[clap(long)]
    pub tcp: bool,

    /// Configuration file
    #[clap(short, long)]
    pub config: Option<String>,

    /// Log at debug on the console regardless of configuration
    #[clap(short, long)]
    pub debug: bool,
}

impl Cli {
    /// The transport selected by flags, if any was.
    pub fn transport(&self) -> Option<ServerTransport> {
        if self.tcp {
            Some(ServerTransport::TcpV4)
        } else if self.udp6 {
            Some(ServerTransport::UdpV6)
        } else if self.udp {
            Some(ServerTransport::UdpV4)
        } else {
            None
        }
    }

    /// Explicit flags win over whatever the configuration file said.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(host) = &self.host {
            settings.server_address = host.clone();
        }
        if let Some(port) = self.port {
            settings.server_port = port;
        }
        if let Some(transport) = self.transport() {
            settings.server_transport = transport;
        }
    }
}

/// Parse the command line and run the given server until it exits.
///
/// Returns the process exit code: 0 for a normal exit, 1 for a startup
/// failure or a blown error budget.
pub async fn run(server: NameServer) -> i32 {
    let cli = Cli::parse();
    run_with(server, &cli).await
}

/// Like [run], with the command line supplied by the caller.
pub async fn run_with(server: NameServer, cli: &Cli) -> i32 {
    let mut settings = match Settings::try_from(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("Failed to load configuration: {error}");
            return 1;
        }
    };
    cli.apply(&mut settings);

    let _logger = match logging::init_logging(&settings, cli.debug) {
        Ok(handle) => handle,
        Err(error) => {
            eprintln!("Failed to start logging: {error}");
            return 1;
        }
    };

    if let Some(requested) = &cli.server_name {
        if requested != server.name() {
            warn!(
                "requested server {requested:?} but running {:?}",
                server.name()
            );
        }
    }

    info!("Running server {}", server.name());
    let transport = settings.build_transport();
    let mut application =
        DirectApplication::new(server, transport).with_max_errors(settings.max_errors);
    application.run().await
}
