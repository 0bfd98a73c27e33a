use std::{net::SocketAddrV4, sync::Arc};

use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use admission_coordinator::{
    context::tokio::{Dispatch, Error, Sockets},
    Client, Config, Monitor, Server,
};

#[derive(Debug, Parser)]
#[command(about = "LAN-local replicated admission coordinator")]
struct Cli {
    /// Run a coordinator server
    #[arg(long, conflicts_with_all = ["client", "monitor"])]
    server: bool,
    /// Run an admission client
    #[arg(long, conflicts_with = "monitor")]
    client: bool,
    /// Run the observability monitor
    #[arg(long)]
    monitor: bool,
    /// Venue capacity
    #[arg(long)]
    max_entries: Option<u64>,
    /// Discovery broadcast port
    #[arg(long)]
    broadcast_port: Option<u16>,
    /// Ordered-multicast group address
    #[arg(long)]
    multicast_addr: Option<SocketAddrV4>,
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = Config::default();
    if let Some(max_entries) = cli.max_entries {
        config.max_entries = max_entries;
    }
    if let Some(port) = cli.broadcast_port {
        config.broadcast_port = port;
    }
    if let Some(group) = cli.multicast_addr {
        config.multicast_group = group;
    }
    let config = Arc::new(config);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let sockets = if cli.server {
        Sockets::Server
    } else if cli.client {
        Sockets::Client
    } else if cli.monitor {
        Sockets::Monitor
    } else {
        Cli::command().print_help().ok();
        return Ok(());
    };

    let dispatch = Dispatch::new(config.clone(), runtime.handle().clone(), sockets)?;
    let handle = dispatch.handle();
    std::thread::spawn(move || {
        runtime.block_on(async move {
            tokio::signal::ctrl_c().await.ok();
            handle.stop().await
        });
        runtime.shutdown_background()
    });

    match sockets {
        Sockets::Server => {
            let mut server = Server::new(dispatch.context(), config, dispatch.advertised());
            server.start();
            dispatch.run(&mut server)
        }
        Sockets::Client => {
            dispatch.read_lines();
            let mut client = Client::new(dispatch.context(), config, dispatch.advertised());
            client.start();
            dispatch.run(&mut client)
        }
        Sockets::Monitor => {
            let mut monitor = Monitor::new();
            dispatch.run(&mut monitor)
        }
    }
    Ok(())
}
