use std::{process::exit, sync::Arc};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tunnel_relay::{
    args::{Cli, ClientArgs, Command, ServerArgs},
    logging, run_client, run_server, transport, Error,
};

fn main() {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.unsafe_logging);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(error) = runtime.block_on(async_main(cli.command)) {
        error!("Program finished with error: {error}");
        exit(1);
    }
}

async fn async_main(command: Command) -> Result<(), Error> {
    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));

    let result = match command {
        Command::Client(args) => start_client(args, &shutdown).await,
        Command::Server(args) => start_server(args, &shutdown).await,
    };

    match result {
        Err(Error::Accept(_)) => {
            error!("No longer accepting connections, relaying the open ones until shutdown");
            shutdown.cancelled().await;
            Ok(())
        }
        result => result,
    }
}

async fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down"),
        Err(error) => warn!("Failed to listen for Ctrl-C, shutting down: {error}"),
    }

    shutdown.cancel();
}

async fn start_client(args: ClientArgs, shutdown: &CancellationToken) -> Result<(), Error> {
    let config = args.into_config();
    config.validate()?;

    let mut listener = transport::bind_local_listener(config.protocol, &config.listen_address)
        .await
        .map_err(|source| Error::Bind {
            address: config.listen_address.clone(),
            source,
        })?;

    let dialer = transport::transport_dialer(config.transport, &config.server_address, &config.server_name)
        .await
        .map_err(Error::TransportDial)?;

    run_client(&config, listener.as_mut(), Arc::from(dialer), shutdown).await
}

async fn start_server(args: ServerArgs, shutdown: &CancellationToken) -> Result<(), Error> {
    let config = args.into_config();
    config.validate()?;

    let mut listener = transport::bind_transport_listener(config.transport, &config.listen_address)
        .await
        .map_err(|source| Error::Bind {
            address: config.listen_address.clone(),
            source,
        })?;

    let destination = transport::destination_dialer(config.destination_protocol, &config.destination_address);
    run_server(&config, listener.as_mut(), Arc::from(destination), shutdown).await
}
