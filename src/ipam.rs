//! Pod IP allocation
//!
//! When CNI integration is disabled, Pod IPs come from a per-node pool over
//! the configured CIDR: a monotonic cursor plus a free list. Released
//! addresses are reused before the cursor advances. After a controller
//! restart the pool is re-derived by marking every IP observed on existing
//! Pod statuses as used.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use parking_lot::Mutex;

use crate::error::Error;

/// A pool of addresses within one IPv4 CIDR
pub struct IpPool {
    net: Ipv4Net,
    state: Mutex<PoolState>,
}

struct PoolState {
    cursor: u32,
    free: Vec<Ipv4Addr>,
    used: BTreeSet<Ipv4Addr>,
}

impl IpPool {
    /// Create a pool over a CIDR such as `10.0.0.1/24`.
    ///
    /// The host bits of the given address are ignored; allocation starts at
    /// the first usable address of the network.
    pub fn new(cidr: &str) -> Result<Self, Error> {
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|e| Error::ipam(format!("invalid CIDR {cidr:?}: {e}")))?;
        let net = net.trunc();
        Ok(Self {
            net,
            state: Mutex::new(PoolState {
                cursor: 0,
                free: Vec::new(),
                used: BTreeSet::new(),
            }),
        })
    }

    /// The network this pool draws from
    pub fn network(&self) -> Ipv4Net {
        self.net
    }

    /// Allocate the next address: free list first, then the cursor.
    ///
    /// Network and broadcast addresses are never handed out.
    pub fn allocate(&self) -> Result<Ipv4Addr, Error> {
        let mut state = self.state.lock();
        if let Some(ip) = state.free.pop() {
            state.used.insert(ip);
            return Ok(ip);
        }

        let base = u32::from(self.net.network());
        let last = u32::from(self.net.broadcast());
        loop {
            state.cursor += 1;
            let candidate = base
                .checked_add(state.cursor)
                .ok_or_else(|| Error::ipam(format!("pool {} exhausted", self.net)))?;
            if candidate >= last {
                return Err(Error::ipam(format!("pool {} exhausted", self.net)));
            }
            let ip = Ipv4Addr::from(candidate);
            if state.used.insert(ip) {
                return Ok(ip);
            }
        }
    }

    /// Return an address to the pool.
    ///
    /// Happens when a status patch is rejected because the Pod is already
    /// gone, and when a Pod is deleted.
    pub fn release(&self, ip: Ipv4Addr) {
        let mut state = self.state.lock();
        if state.used.remove(&ip) {
            state.free.push(ip);
        }
    }

    /// Mark an already-assigned address as used (restart re-derivation).
    ///
    /// Addresses outside the pool's network are ignored.
    pub fn mark_used(&self, ip: Ipv4Addr) {
        if !self.net.contains(&ip) {
            return;
        }
        let mut state = self.state.lock();
        state.free.retain(|f| *f != ip);
        state.used.insert(ip);
    }

    /// Number of currently allocated addresses
    pub fn in_use(&self) -> usize {
        self.state.lock().used.len()
    }
}
