// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Builder;

use crate::broker::Broker;
use crate::config::CommandLine;
use crate::connection::Role;
use crate::endpoint::{Endpoint, EndpointConfig};
use crate::error::Error;
use crate::log::init_log;
use crate::security::Security;

/// Entry point of the broker binary.
///
/// # Errors
///
/// Returns error if the config is invalid or the listener cannot bind.
pub fn run_server() -> Result<(), Error> {
    let cmdline = CommandLine::parse();
    init_log(cmdline.verbose, cmdline.log_file.as_deref())?;

    if cmdline.tls_port.is_some() || cmdline.ws_port.is_some() || cmdline.wss_port.is_some() {
        log::warn!(
            "server: tls/ws listeners are provided by the embedding host; \
             only the tcp listener is started here"
        );
    }
    if cmdline.fixed_core_map {
        log::warn!("server: fixed_core_map is not supported by this runtime");
    }

    let security = match &cmdline.auth_file {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            Security::from_json(&content)?
        }
        None => {
            log::warn!("server: No auth_file given, allowing anonymous access");
            Security::default_permissive()
        }
    };

    let runtime = Builder::new_multi_thread()
        .worker_threads(cmdline.worker_threads())
        .enable_all()
        .build()?;
    runtime.block_on(run_loop(&cmdline, security))
}

async fn run_loop(cmdline: &CommandLine, security: Security) -> Result<(), Error> {
    let broker = Broker::new(security);
    let address = format!("0.0.0.0:{}", cmdline.tcp_port);
    let listener = TcpListener::bind(&address).await?;
    log::info!("server: Listening on {address}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        log::debug!("server: Accepted connection from {peer}");
                        if let Err(err) = stream.set_nodelay(true) {
                            log::warn!("server: set_nodelay failed for {peer}: {err}");
                        }
                        let endpoint =
                            Endpoint::new(stream, Role::Server, EndpointConfig::broker());
                        tokio::spawn(Arc::clone(&broker).handle_endpoint(endpoint, None));
                    }
                    Err(err) => {
                        log::error!("server: Accept failed: {err}");
                    }
                }
            }
            result = shutdown_signal() => {
                result?;
                log::info!("server: Shutting down");
                break;
            }
        }
    }

    // Dropping the listener stops new connections; in-flight sessions
    // are torn down with the runtime.
    drop(listener);
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<(), Error> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map_err(Error::from),
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<(), Error> {
    tokio::signal::ctrl_c().await.map_err(Error::from)
}
