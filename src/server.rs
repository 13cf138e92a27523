//! Network front end: accept loop, one SSH session task per peer, and the
//! background sweepers.

use crate::config::ServeConfig;
use crate::error::DecoyResult;
use crate::http_server;
use crate::mounter::{Mounter, OverlayMounter};
use crate::ssh::{load_host_key, server_config, SshSession};
use crate::state::AppState;
use russh::Disconnect;
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

type SshConfig = Arc<russh::server::Config>;

/// Run the honeypot until ctrl-c.
pub async fn run(config: ServeConfig) -> DecoyResult<()> {
    run_with(config, Arc::new(OverlayMounter)).await
}

pub async fn run_with(config: ServeConfig, mounter: Arc<dyn Mounter>) -> DecoyResult<()> {
    fs::create_dir_all(&config.captures_dir)?;
    let state = AppState::new(&config, mounter)?;
    let key = load_host_key(&config.host_key)?;
    let ssh = Arc::new(server_config(key, &config.ssh_version, config.max_session_age));

    let session_sweeper = state
        .registry
        .clone()
        .spawn_sweeper(config.session_sweep_interval);
    let sandbox_sweeper = state
        .sandboxes()
        .clone()
        .spawn_sweeper(config.sandbox_sweep_interval);
    let stats = config.stats_port.map(|port| {
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = http_server::run_server(port, state).await {
                error!(error = %e, "Stats API stopped");
            }
        })
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Accepting SSH connections on {}", addr);

    let result = tokio::select! {
        result = accept_loop(listener, state.clone(), ssh) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    };

    session_sweeper.abort();
    sandbox_sweeper.abort();
    if let Some(stats) = stats {
        stats.abort();
    }
    result
}

pub async fn accept_loop(listener: TcpListener, state: AppState, ssh: SshConfig) -> DecoyResult<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };
        tokio::spawn(serve_peer(state.clone(), ssh.clone(), stream, peer));
    }
}

/// Run one connection in its own task so that a panic only costs that
/// session, then always tear the session down.
async fn serve_peer(state: AppState, ssh: SshConfig, stream: TcpStream, peer: SocketAddr) {
    let id = peer.to_string();
    let task = tokio::spawn(handle_connection(state.clone(), ssh, stream, id.clone()));
    let reason = match task.await {
        Ok(Ok(reason)) => reason,
        Ok(Err(e)) => {
            warn!(session = %id, error = %e, "Connection failed");
            "error"
        }
        Err(e) if e.is_panic() => {
            error!(session = %id, "Connection task panicked");
            "panic"
        }
        Err(_) => "cancelled",
    };
    state.registry.remove(&id, Some(reason)).await;
}

async fn handle_connection(
    state: AppState,
    ssh: SshConfig,
    stream: TcpStream,
    id: String,
) -> DecoyResult<&'static str> {
    let session = state.registry.create(&id).await?;
    let handler = SshSession::new(state.clone(), session.clone());
    let running = russh::server::run_stream(ssh, stream, handler).await?;
    let handle = running.handle();
    tokio::pin!(running);

    tokio::select! {
        result = &mut running => {
            result?;
            Ok("client closed")
        }
        _ = session.close_requested() => {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "logout".into(), "en".into())
                .await;
            Ok("closed")
        }
    }
}
