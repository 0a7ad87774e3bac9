//! Dual-indexed TCP flow table.

use super::allocator::PortAllocator;
use crate::config::IpFamily;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};

/// One tracked TCP flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatEntry {
    /// The real client that initiated the connection.
    pub client: SocketAddr,
    /// Substitute source shown to the host stack.
    pub fake: SocketAddr,
    /// The destination the client dialed.
    pub dest: SocketAddr,
}

/// Outcome of [`FlowTable::get_or_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowLookup {
    /// The client already had a flow.
    Existing(NatEntry),
    /// A new flow was inserted.
    Created(NatEntry),
    /// No fake port is free.
    Exhausted,
}

/// Concurrent NAT store indexed by client and by fake address.
///
/// An entry is present under both keys or under neither once an insert or
/// removal has finished.
#[derive(Debug)]
pub struct FlowTable {
    by_client: DashMap<SocketAddr, NatEntry>,
    by_fake: DashMap<SocketAddr, NatEntry>,
    v4_ports: PortAllocator,
    v6_ports: PortAllocator,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowTable {
    pub fn new() -> Self {
        Self {
            by_client: DashMap::new(),
            by_fake: DashMap::new(),
            v4_ports: PortAllocator::full_range(),
            v6_ports: PortAllocator::full_range(),
        }
    }

    /// Entry for a real client address.
    pub fn lookup_by_client(&self, client: &SocketAddr) -> Option<NatEntry> {
        self.by_client.get(client).map(|e| *e)
    }

    /// Entry for a fake address.
    pub fn lookup_by_fake(&self, fake: &SocketAddr) -> Option<NatEntry> {
        self.by_fake.get(fake).map(|e| *e)
    }

    /// Return the client's flow, creating it with a free port on `fake_ip`
    /// if there is none.
    pub fn get_or_create(
        &self,
        client: SocketAddr,
        dest: SocketAddr,
        fake_ip: IpAddr,
    ) -> FlowLookup {
        match self.by_client.entry(client) {
            Entry::Occupied(existing) => FlowLookup::Existing(*existing.get()),
            Entry::Vacant(vacant) => {
                let ports = match IpFamily::of(&fake_ip) {
                    IpFamily::V4 => &self.v4_ports,
                    IpFamily::V6 => &self.v6_ports,
                };
                let Some(port) =
                    ports.allocate(|port| self.by_fake.contains_key(&SocketAddr::new(fake_ip, port)))
                else {
                    return FlowLookup::Exhausted;
                };

                let entry = NatEntry {
                    client,
                    fake: SocketAddr::new(fake_ip, port),
                    dest,
                };
                self.by_fake.insert(entry.fake, entry);
                vacant.insert(entry);
                FlowLookup::Created(entry)
            }
        }
    }

    /// Insert a fully formed entry under both keys.
    #[cfg(test)]
    pub(crate) fn insert(&self, entry: NatEntry) {
        self.by_fake.insert(entry.fake, entry);
        self.by_client.insert(entry.client, entry);
    }

    /// Remove `entry` from both indices.
    ///
    /// The client index is only cleared while it still points at this
    /// entry's fake address, so a flow re-created for the same client after
    /// the entry was looked up survives.
    pub fn remove(&self, entry: &NatEntry) -> bool {
        let removed = self
            .by_fake
            .remove_if(&entry.fake, |_, current| current == entry)
            .is_some();
        self.by_client
            .remove_if(&entry.client, |_, current| current.fake == entry.fake);
        removed
    }

    /// Remove the flow of a real client, returning it.
    pub fn remove_client(&self, client: &SocketAddr) -> Option<NatEntry> {
        let entry = self.lookup_by_client(client)?;
        self.remove(&entry).then_some(entry)
    }

    /// Snapshot of every tracked flow.
    pub fn entries(&self) -> Vec<NatEntry> {
        self.by_client.iter().map(|e| *e.value()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }

    /// True if any entry references `addr` as client or fake address.
    pub fn references(&self, addr: &SocketAddr) -> bool {
        self.by_client
            .iter()
            .chain(self.by_fake.iter())
            .any(|e| e.value().client == *addr || e.value().fake == *addr)
    }
}
