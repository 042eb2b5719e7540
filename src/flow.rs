use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use crate::address::Address;

/// Idle timeout after which a flow with no inside traffic is reaped.
pub const MAX_AGE: Duration = Duration::from_secs(45);

/// One client↔upstream mapping. Owns the upstream socket; dropping the
/// entry closes it exactly once via `UdpSocket`'s own `Drop`. The socket is
/// `Arc`-wrapped so the relay engine can hold a readiness future over it
/// without borrowing the table for the future's whole lifetime; the table
/// is still the single true owner — nothing else ever clones this `Arc`
/// across a flow's removal.
pub struct FlowEntry {
    pub client_addr: Address,
    pub upstream_socket: Arc<UdpSocket>,
    pub local_bound_addr: Address,
    pub last_seen: Instant,
}

impl FlowEntry {
    fn raw_fd(&self) -> RawFd {
        self.upstream_socket.as_raw_fd()
    }
}

/// Associative store of flow entries keyed by client address, with a
/// secondary index by upstream socket file descriptor for O(1) reverse
/// lookup. Single owner: no reference to an entry outlives the table.
#[derive(Default)]
pub struct FlowTable {
    by_client: HashMap<Address, FlowEntry>,
    by_fd: HashMap<RawFd, Address>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }

    pub fn find_by_client(&self, addr: &Address) -> Option<&FlowEntry> {
        self.by_client.get(addr)
    }

    pub fn find_by_client_mut(&mut self, addr: &Address) -> Option<&mut FlowEntry> {
        self.by_client.get_mut(addr)
    }

    pub fn find_by_upstream(&self, fd: RawFd) -> Option<&FlowEntry> {
        let addr = self.by_fd.get(&fd)?;
        self.by_client.get(addr)
    }

    /// Inserts a new flow. Both `client_addr` and the upstream fd must be
    /// absent from the table; a collision is a programming error.
    pub fn insert(&mut self, flow: FlowEntry) {
        let fd = flow.raw_fd();
        let client_addr = flow.client_addr;
        assert!(
            !self.by_client.contains_key(&client_addr),
            "duplicate client_addr inserted into flow table"
        );
        assert!(
            !self.by_fd.contains_key(&fd),
            "duplicate upstream fd inserted into flow table"
        );
        self.by_fd.insert(fd, client_addr);
        self.by_client.insert(client_addr, flow);
    }

    /// Removes and drops (closing) the flow for `client_addr`, if present.
    pub fn remove(&mut self, client_addr: &Address) -> Option<FlowEntry> {
        let flow = self.by_client.remove(client_addr)?;
        self.by_fd.remove(&flow.raw_fd());
        Some(flow)
    }

    pub fn client_addrs(&self) -> impl Iterator<Item = &Address> {
        self.by_client.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowEntry> {
        self.by_client.values()
    }

    /// Removes and closes every entry for which `force_all` holds, or whose
    /// idle time has reached `MAX_AGE`. Collects expired keys before
    /// removing so the sweep tolerates current-element removal.
    pub fn iterate_expire(&mut self, now: Instant, force_all: bool) -> usize {
        let expired: Vec<Address> = self
            .by_client
            .iter()
            .filter(|(_, flow)| force_all || now.duration_since(flow.last_seen) >= MAX_AGE)
            .map(|(addr, _)| *addr)
            .collect();
        let count = expired.len();
        for addr in expired {
            self.remove(&addr);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_entry(client_port: u16) -> FlowEntry {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = Address::from(socket.local_addr().unwrap());
        FlowEntry {
            client_addr: Address::parse("127.0.0.1", client_port).unwrap(),
            upstream_socket: Arc::new(socket),
            local_bound_addr: local,
            last_seen: Instant::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_find_by_both_keys() {
        let mut table = FlowTable::new();
        let entry = make_entry(40001).await;
        let fd = entry.raw_fd();
        let client = entry.client_addr;
        table.insert(entry);

        assert!(table.find_by_client(&client).is_some());
        assert!(table.find_by_upstream(fd).is_some());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn remove_drops_both_indices() {
        let mut table = FlowTable::new();
        let entry = make_entry(40002).await;
        let fd = entry.raw_fd();
        let client = entry.client_addr;
        table.insert(entry);

        table.remove(&client);
        assert!(table.find_by_client(&client).is_none());
        assert!(table.find_by_upstream(fd).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn expiry_sweep_tolerates_multiple_removals() {
        let mut table = FlowTable::new();
        for port in [40003, 40004, 40005] {
            let mut entry = make_entry(port).await;
            entry.last_seen = Instant::now() - MAX_AGE - Duration::from_secs(1);
            table.insert(entry);
        }
        let removed = table.iterate_expire(Instant::now(), false);
        assert_eq!(removed, 3);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn force_all_removes_fresh_entries_too() {
        let mut table = FlowTable::new();
        table.insert(make_entry(40006).await);
        let removed = table.iterate_expire(Instant::now(), true);
        assert_eq!(removed, 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    #[should_panic(expected = "duplicate client_addr")]
    async fn duplicate_client_addr_is_a_bug() {
        let mut table = FlowTable::new();
        table.insert(make_entry(40007).await);
        table.insert(make_entry(40007).await);
    }
}
