use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::address::Address;
use crate::flow::{FlowEntry, FlowTable};
use crate::listener;

/// Largest datagram the relay will copy in one shot. Covers the full range
/// of valid IPv4/IPv6 UDP payloads.
const MAX_DATAGRAM: usize = 65536;

/// How often the idle sweep runs, independent of traffic. Distinct from
/// `flow::MAX_AGE`, which is how long a flow may sit idle before the sweep
/// reaps it.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// The readiness loop: owns the listener, the fixed destination, the bind
/// template used for every new upstream socket, and the flow table. There is
/// exactly one of these per process and it never hands out a long-lived
/// reference to its table.
pub struct RelayEngine {
    listener: UdpSocket,
    destination: Address,
    bind_template: Address,
    table: FlowTable,
}

/// What the top-level select woke up for, captured before `ready` is
/// dropped so the actual handling (which may `.await`) never runs while a
/// stale `Arc` clone of a flow's socket is still alive.
enum Event {
    Inside(io::Result<()>),
    Outside(Address, io::Result<()>),
    Sweep,
    Shutdown(Result<(), watch::error::RecvError>),
}

impl RelayEngine {
    pub fn new(listener: UdpSocket, destination: Address, bind_template: Address) -> Self {
        RelayEngine {
            listener,
            destination,
            bind_template,
            table: FlowTable::new(),
        }
    }

    /// Drives the relay until `shutdown` reports `true` or its sender is
    /// dropped. Returns only on shutdown; tears down every flow and the
    /// listener before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> eyre::Result<()> {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            // One readiness future per live flow, tagged with the client
            // address it belongs to. Rebuilt every wake: cheap relative to
            // a datagram round trip, and it keeps the borrow of `self.table`
            // scoped to construction instead of spanning the whole select.
            let mut ready: FuturesUnordered<_> = self
                .table
                .iter()
                .map(|flow| {
                    let addr = flow.client_addr;
                    let sock = Arc::clone(&flow.upstream_socket);
                    async move {
                        let res = sock.readable().await;
                        (addr, res)
                    }
                })
                .collect();

            let event = tokio::select! {
                res = self.listener.readable() => Event::Inside(res),
                Some((client_addr, res)) = ready.next(), if !ready.is_empty() => {
                    Event::Outside(client_addr, res)
                }
                _ = sweep.tick() => Event::Sweep,
                changed = shutdown.changed() => Event::Shutdown(changed),
            };

            // `ready` holds an `Arc` clone of every live flow's upstream
            // socket. It must be gone before any handler below can force a
            // flow closed and rebind its port (see `handle_inside_datagram`'s
            // pinned-source-port path) — otherwise the old socket's fd is
            // still open under this clone when the rebind is attempted.
            drop(ready);

            match event {
                Event::Inside(res) => {
                    if let Err(e) = res {
                        tracing::warn!(error = %e, "listener readiness wait failed");
                    } else {
                        self.drain_inside().await;
                    }
                }
                Event::Outside(client_addr, res) => {
                    if let Err(e) = res {
                        tracing::warn!(client = %client_addr, error = %e, "flow readiness wait failed");
                    } else {
                        self.drain_outside(client_addr).await;
                    }
                }
                Event::Sweep => {
                    let reaped = self.table.iterate_expire(Instant::now(), false);
                    if reaped > 0 {
                        tracing::debug!(reaped, "idle sweep reaped flows");
                    }
                }
                Event::Shutdown(changed) => match changed {
                    Ok(()) if *shutdown.borrow() => break,
                    Ok(()) => {}
                    Err(_) => break,
                },
            }
        }

        tracing::info!("shutting down, tearing down all flows");
        self.table.iterate_expire(Instant::now(), true);
        Ok(())
    }

    /// Reads from the listener until it would block, dispatching each
    /// datagram to its flow (creating one if the client is unknown).
    async fn drain_inside(&mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match self.listener.try_recv_from(&mut buf) {
                Ok((0, _)) => continue,
                Ok((len, src)) => {
                    let src = Address::from(src);
                    let payload = buf[..len].to_vec();
                    self.handle_inside_datagram(src, &payload).await;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "inside recv failed, ending drain");
                    break;
                }
            }
        }
    }

    async fn handle_inside_datagram(&mut self, src: Address, payload: &[u8]) {
        if let Some(flow) = self.table.find_by_client_mut(&src) {
            match flow
                .upstream_socket
                .try_send_to(payload, self.destination.to_std())
            {
                Ok(_) => flow.last_seen = Instant::now(),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tracing::trace!(client = %src, "upstream send would block, dropping datagram");
                }
                Err(e) => {
                    tracing::warn!(client = %src, error = %e, "forward to destination failed, flow kept");
                }
            }
            return;
        }

        if self.bind_template.port() != 0 {
            let closed = self.table.iterate_expire(Instant::now(), true);
            if closed > 0 {
                tracing::info!(closed, "pinned source port forced existing flows closed");
            }
        }

        let socket = match listener::open_upstream(self.bind_template).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(client = %src, error = %e, "failed to open upstream socket, dropping datagram");
                return;
            }
        };

        if let Err(e) = socket.send_to(payload, self.destination.to_std()).await {
            tracing::warn!(client = %src, error = %e, "failed to forward to destination, dropping flow");
            return;
        }

        let local_bound_addr = match socket.local_addr() {
            Ok(a) => Address::from(a),
            Err(e) => {
                tracing::warn!(error = %e, "getsockname failed on new upstream socket, dropping flow");
                return;
            }
        };

        tracing::debug!(client = %src, local = %local_bound_addr, destination = %self.destination, "new flow");
        self.table.insert(FlowEntry {
            client_addr: src,
            upstream_socket: Arc::new(socket),
            local_bound_addr,
            last_seen: Instant::now(),
        });
    }

    /// Reads from one flow's upstream socket until it would block, relaying
    /// each datagram back to that flow's client.
    async fn drain_outside(&mut self, client_addr: Address) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let Some(flow) = self.table.find_by_client(&client_addr) else {
                tracing::trace!(client = %client_addr, "spurious readiness event, flow already gone");
                return;
            };

            // The received source address is not checked against `destination`
            // (see DESIGN.md): a spoofed reply on this socket would still be
            // forwarded. Preserved from the reference behavior.
            match flow.upstream_socket.try_recv_from(&mut buf) {
                Ok((0, _)) => continue,
                Ok((len, _from)) => {
                    if let Err(e) = self
                        .listener
                        .send_to(&buf[..len], client_addr.to_std())
                        .await
                    {
                        tracing::warn!(client = %client_addr, error = %e, "return to client failed, closing flow");
                        self.table.remove(&client_addr);
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(client = %client_addr, error = %e, "outside recv failed, flow kept until idle expiry");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relays_datagram_round_trip_between_client_and_destination() {
        let listen_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listen_sock.local_addr().unwrap();

        let dest_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest_sock.local_addr().unwrap();

        let engine = RelayEngine::new(
            listen_sock,
            Address::from(dest_addr),
            Address::unspecified(false),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", listen_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, from) =
            tokio::time::timeout(Duration::from_secs(2), dest_sock.recv_from(&mut buf))
                .await
                .expect("destination should receive forwarded datagram")
                .unwrap();
        assert_eq!(&buf[..len], b"hello");

        dest_sock.send_to(b"world", from).await.unwrap();
        let mut rbuf = [0u8; 64];
        let (rlen, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut rbuf))
            .await
            .expect("client should receive reply")
            .unwrap();
        assert_eq!(&rbuf[..rlen], b"world");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("engine should shut down promptly")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn two_clients_get_distinct_upstream_ports() {
        let listen_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listen_sock.local_addr().unwrap();
        let dest_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest_sock.local_addr().unwrap();

        let engine = RelayEngine::new(
            listen_sock,
            Address::from(dest_addr),
            Address::unspecified(false),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(rx));

        let client_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client_a.send_to(b"a", listen_addr).await.unwrap();
        client_b.send_to(b"b", listen_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (_, from_a) = dest_sock.recv_from(&mut buf).await.unwrap();
        let (_, from_b) = dest_sock.recv_from(&mut buf).await.unwrap();
        assert_ne!(from_a.port(), from_b.port());

        tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    #[tokio::test]
    async fn pinned_source_port_replaces_existing_flow_before_rebind() {
        let listen_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listen_sock.local_addr().unwrap();
        let dest_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest_sock.local_addr().unwrap();

        // Reserve an ephemeral port, then free it immediately so it can be
        // named as a pinned bind template; nothing else binds it in between.
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let pinned_port = probe.local_addr().unwrap().port();
        drop(probe);

        let bind_template = Address::parse("127.0.0.1", pinned_port).unwrap();
        let engine = RelayEngine::new(listen_sock, Address::from(dest_addr), bind_template);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(rx));

        let client_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client_a.send_to(b"a", listen_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (_, from_a) =
            tokio::time::timeout(Duration::from_secs(2), dest_sock.recv_from(&mut buf))
                .await
                .expect("destination should receive A's forwarded datagram")
                .unwrap();
        assert_eq!(from_a.port(), pinned_port);

        // Let the engine wake at least once more so its per-flow readiness
        // future for A is live (holding an `Arc` clone of A's socket) before
        // B's datagram arrives, reproducing the replacement race.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client_b.send_to(b"b", listen_addr).await.unwrap();

        let (_, from_b) =
            tokio::time::timeout(Duration::from_secs(2), dest_sock.recv_from(&mut buf))
                .await
                .expect(
                    "destination should receive B's forwarded datagram once A's \
                     pinned-port flow is torn down and the port is rebound",
                )
                .unwrap();
        assert_eq!(from_b.port(), pinned_port);

        tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}
