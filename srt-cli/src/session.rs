//! Connection setup shared by the CLI tools

use crate::config::{ConnectMode, ConnectionConfig};
use srt::{SocketId, Srt, SrtError};
use std::net::{Ipv4Addr, SocketAddr};
use tracing::info;

/// Open a connected socket according to `config`
///
/// In listener mode the listening socket is closed once the first caller
/// has been accepted.
pub fn open(srt: &Srt, config: &ConnectionConfig) -> Result<SocketId, SrtError> {
    let socket = srt.socket()?;
    for (opt, value) in config.socket_options() {
        srt.setsockopt(socket, opt, value)?;
    }

    let result = match config.mode {
        ConnectMode::Caller => {
            let remote = config.remote.ok_or(SrtError::NoConnection)?;
            if let Some(local) = config.local {
                srt.bind(socket, local)?;
            }
            info!(%remote, "calling");
            srt.connect(socket, remote).map(|_| socket)
        }
        ConnectMode::Listener => {
            let local = config
                .local
                .unwrap_or(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
            srt.bind(socket, local)?;
            srt.listen(socket, 1)?;
            info!(addr = %srt.getsockname(socket)?, "waiting for a caller");
            let accepted = srt.accept(socket);
            srt.close(socket)?;
            let (conn, peer) = accepted?;
            info!(%peer, "caller accepted");
            return Ok(conn);
        }
        ConnectMode::Rendezvous => {
            let (local, remote) = config
                .local
                .zip(config.remote)
                .ok_or(SrtError::RendezvousUnbound)?;
            info!(%local, %remote, "rendezvous");
            srt.rendezvous(socket, local, remote).map(|_| socket)
        }
    };

    if result.is_err() {
        let _ = srt.close(socket);
    }
    result
}
