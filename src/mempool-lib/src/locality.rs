use crate::pool::MemPool;
use crate::{PeerEntry, PoolError, PoolResult, WorkerId};
use log::{debug, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, ToSocketAddrs};

impl MemPool {
    /// Worker ids co-located with `ip`, from the lazily-populated topology
    /// cache. An unknown IP yields an empty list.
    pub async fn workers_at(&self, ip: Ipv4Addr) -> PoolResult<Vec<WorkerId>> {
        self.ensure_wrkrips().await?;
        let st = self.lock_state();
        Ok(st
            .wrkrips
            .as_ref()
            .and_then(|map| map.get(&ip).cloned())
            .unwrap_or_default())
    }

    /// One worker on `ip`, picked uniformly at random.
    pub async fn worker_at(&self, ip: Ipv4Addr) -> PoolResult<WorkerId> {
        let workers = self.workers_at(ip).await?;
        if workers.is_empty() {
            return Err(PoolError::InvalidParam(format!("no worker known at {}", ip)));
        }
        let pick = rand::rng().random_range(0..workers.len());
        Ok(workers[pick])
    }

    async fn ensure_wrkrips(&self) -> PoolResult<()> {
        if self.lock_state().wrkrips.is_some() {
            return Ok(());
        }
        let raw = if self.config().is_coordinator() {
            build_wrkrips(
                &self.config().peers,
                self.config().enable_random_fref_serve,
            )?
        } else {
            self.rpc().get_wrkrips(self.config().coordinator).await?
        };
        let map = self.reconcile_loopback(raw).await?;
        info!(
            "mempool: worker {} cached topology for {} host(s)",
            self.worker_id(),
            map.len()
        );
        self.lock_state().wrkrips = Some(map);
        Ok(())
    }

    /// Workers that bound to loopback would look unreachable next to peers
    /// on real addresses. When both appear, ask one loopback worker which IP
    /// it is actually reachable at and fold the loopback bucket in there.
    async fn reconcile_loopback(
        &self,
        mut map: HashMap<Ipv4Addr, Vec<WorkerId>>,
    ) -> PoolResult<HashMap<Ipv4Addr, Vec<WorkerId>>> {
        let loopback = Ipv4Addr::LOCALHOST;
        if map.len() <= 1 || !map.contains_key(&loopback) {
            return Ok(map);
        }
        let members = map.remove(&loopback).unwrap_or_default();
        let probe = match members.first() {
            Some(w) => *w,
            None => return Ok(map),
        };
        let real_ip = self.rpc().external_ip(probe).await?;
        debug!(
            "mempool: merging loopback workers {:?} into {}",
            members, real_ip
        );
        let bucket = map.entry(real_ip).or_default();
        bucket.extend(members);
        bucket.sort_unstable();
        bucket.dedup();
        if !self.config().enable_random_fref_serve {
            bucket.truncate(1);
        }
        Ok(map)
    }
}

/// Group the peer table by host IP. With randomized file serving disabled
/// only the lowest worker id per IP is kept, making selection deterministic.
pub(crate) fn build_wrkrips(
    peers: &[PeerEntry],
    randomized: bool,
) -> PoolResult<HashMap<Ipv4Addr, Vec<WorkerId>>> {
    let mut map: HashMap<Ipv4Addr, Vec<WorkerId>> = HashMap::new();
    for peer in peers {
        let ip = resolve_ipv4(&peer.address)?;
        map.entry(ip).or_default().push(peer.worker_id);
    }
    for workers in map.values_mut() {
        workers.sort_unstable();
        workers.dedup();
        if !randomized {
            workers.truncate(1);
        }
    }
    Ok(map)
}

/// Bind a configured address as an IPv4: bare IP, `ip:port` or a
/// resolvable hostname.
pub(crate) fn resolve_ipv4(address: &str) -> PoolResult<Ipv4Addr> {
    if let Ok(ip) = address.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    if let Ok(sock) = address.parse::<SocketAddrV4>() {
        return Ok(*sock.ip());
    }
    let probe = if address.contains(':') {
        address.to_string()
    } else {
        format!("{}:0", address)
    };
    let resolved = probe.to_socket_addrs().map_err(|e| {
        warn!("mempool: resolve of {} failed: {}", address, e);
        PoolError::InvalidParam(format!("unresolvable address {}", address))
    })?;
    for addr in resolved {
        if let std::net::SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(PoolError::InvalidParam(format!(
        "no IPv4 address for {}",
        address
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(worker_id: WorkerId, address: &str) -> PeerEntry {
        PeerEntry {
            worker_id,
            address: address.to_string(),
        }
    }

    #[test]
    fn test_resolve_bare_ip_and_socket_addr() {
        assert_eq!(
            resolve_ipv4("10.0.0.5").unwrap(),
            Ipv4Addr::new(10, 0, 0, 5)
        );
        assert_eq!(
            resolve_ipv4("10.0.0.5:7077").unwrap(),
            Ipv4Addr::new(10, 0, 0, 5)
        );
        assert!(resolve_ipv4("definitely-not-a-host.invalid").is_err());
    }

    #[test]
    fn test_build_groups_by_ip() {
        let peers = vec![
            peer(1, "10.0.0.5"),
            peer(3, "10.0.0.6:9000"),
            peer(2, "10.0.0.5:9000"),
        ];
        let map = build_wrkrips(&peers, true).unwrap();
        assert_eq!(map[&Ipv4Addr::new(10, 0, 0, 5)], vec![1, 2]);
        assert_eq!(map[&Ipv4Addr::new(10, 0, 0, 6)], vec![3]);
    }

    #[test]
    fn test_deterministic_mode_keeps_lowest_id() {
        let peers = vec![
            peer(4, "10.0.0.5"),
            peer(2, "10.0.0.5"),
            peer(9, "10.0.0.6"),
        ];
        let map = build_wrkrips(&peers, false).unwrap();
        assert_eq!(map[&Ipv4Addr::new(10, 0, 0, 5)], vec![2]);
        assert_eq!(map[&Ipv4Addr::new(10, 0, 0, 6)], vec![9]);
    }
}
