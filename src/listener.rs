use tokio::net::UdpSocket;

use crate::address::Address;

/// Creates and binds the inside-facing datagram socket. `tokio::net::UdpSocket::bind`
/// already yields a non-blocking socket registered edge-triggered with the
/// reactor, so there is no separate "set non-blocking" step to perform.
pub async fn open(listen_addr: Address) -> eyre::Result<UdpSocket> {
    UdpSocket::bind(listen_addr.to_std())
        .await
        .map_err(|e| eyre::eyre!("cannot bind listener on {listen_addr}: {e}"))
}

/// Creates a per-flow upstream socket bound to `bind_template`. A zero port
/// means "ephemeral"; a nonzero port pins the flow to a specific source port.
pub async fn open_upstream(bind_template: Address) -> eyre::Result<UdpSocket> {
    UdpSocket::bind(bind_template.to_std())
        .await
        .map_err(|e| eyre::eyre!("cannot bind upstream socket on {bind_template}: {e}"))
}
