//! Load balancing across a peer set with health eviction.

use std::fmt::Display;
use std::future::Future;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::{LoadBalancerConfig, SelectionAlgorithm};
use crate::error::ResilienceError;

/// A value together with the peer that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Balanced<T> {
    pub value: T,
    pub peer: String,
}

#[derive(Debug)]
struct Peer {
    name: String,
    healthy: bool,
    /// When an unhealthy peer becomes eligible again.
    recover_at: Option<Instant>,
    active_calls: usize,
}

#[derive(Debug)]
struct Pool {
    peers: Vec<Peer>,
    cursor: usize,
}

/// Spreads calls over a peer set.
///
/// A failing peer is taken out of rotation and becomes eligible again once
/// `unhealthy_recovery` has elapsed; recovery is a deadline checked at
/// selection time, so nothing waits on it.
#[derive(Debug)]
pub struct LoadBalancer {
    name: String,
    config: LoadBalancerConfig,
    pool: Mutex<Pool>,
}

impl LoadBalancer {
    pub fn new(name: impl Into<String>, config: LoadBalancerConfig) -> Self {
        let peers = config
            .peers
            .iter()
            .map(|name| Peer {
                name: name.clone(),
                healthy: true,
                recover_at: None,
                active_calls: 0,
            })
            .collect();
        Self {
            name: name.into(),
            config,
            pool: Mutex::new(Pool { peers, cursor: 0 }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> SelectionAlgorithm {
        self.config.algorithm
    }

    /// Names of peers currently eligible for selection.
    pub fn healthy_peers(&self) -> Vec<String> {
        let mut pool = self.pool.lock();
        Self::recover_due(&mut pool, &self.name);
        pool.peers
            .iter()
            .filter(|p| p.healthy)
            .map(|p| p.name.clone())
            .collect()
    }

    /// Takes `peer` out of rotation until the recovery delay passes.
    pub fn mark_unhealthy(&self, peer: &str) {
        let mut pool = self.pool.lock();
        if let Some(p) = pool.peers.iter_mut().find(|p| p.name == peer) {
            p.healthy = false;
            p.recover_at = Some(Instant::now() + self.config.unhealthy_recovery);
            tracing::warn!(
                pool = %self.name,
                peer,
                recovery_ms = self.config.unhealthy_recovery.as_millis() as u64,
                "peer marked unhealthy"
            );
        }
    }

    /// Picks peers until one succeeds or no healthy peer remains.
    ///
    /// Each failure evicts the peer that produced it. When every peer is
    /// unhealthy the result is `ResilienceError::AllPeersUnavailable`.
    pub async fn execute<F, Fut, T, E>(&self, mut call: F) -> Result<Balanced<T>, E>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ResilienceError> + Display,
    {
        let max_attempts = self.config.peers.len();

        for _ in 0..max_attempts {
            let Some(active) = self.acquire() else {
                break;
            };
            let peer = active.peer.clone();

            match call(peer.clone()).await {
                Ok(value) => return Ok(Balanced { value, peer }),
                Err(e) => {
                    tracing::warn!(pool = %self.name, peer = %peer, error = %e, "peer call failed");
                    drop(active);
                    self.mark_unhealthy(&peer);
                }
            }
        }

        Err(E::from(ResilienceError::AllPeersUnavailable {
            pool: self.name.clone(),
        }))
    }

    fn acquire(&self) -> Option<ActiveCall<'_>> {
        let mut pool = self.pool.lock();
        Self::recover_due(&mut pool, &self.name);
        let index = self.select(&mut pool)?;
        pool.peers[index].active_calls += 1;
        Some(ActiveCall {
            balancer: self,
            index,
            peer: pool.peers[index].name.clone(),
        })
    }

    fn select(&self, pool: &mut Pool) -> Option<usize> {
        let n = pool.peers.len();
        if n == 0 {
            return None;
        }

        match self.config.algorithm {
            SelectionAlgorithm::RoundRobin => {
                let start = pool.cursor % n;
                let index = (0..n)
                    .map(|offset| (start + offset) % n)
                    .find(|&i| pool.peers[i].healthy)?;
                pool.cursor = (index + 1) % n;
                Some(index)
            }
            SelectionAlgorithm::Random => {
                let healthy: Vec<usize> = (0..n).filter(|&i| pool.peers[i].healthy).collect();
                if healthy.is_empty() {
                    return None;
                }
                Some(healthy[fastrand::usize(..healthy.len())])
            }
            SelectionAlgorithm::LeastConnections => (0..n)
                .filter(|&i| pool.peers[i].healthy)
                .min_by_key(|&i| (pool.peers[i].active_calls, i)),
        }
    }

    fn recover_due(pool: &mut Pool, name: &str) {
        let now = Instant::now();
        for peer in pool.peers.iter_mut().filter(|p| !p.healthy) {
            if peer.recover_at.is_some_and(|at| at <= now) {
                peer.healthy = true;
                peer.recover_at = None;
                tracing::info!(pool = %name, peer = %peer.name, "peer recovered");
            }
        }
    }
}

/// Tracks one in-flight call for least-connections accounting.
struct ActiveCall<'a> {
    balancer: &'a LoadBalancer,
    index: usize,
    peer: String,
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        let mut pool = self.balancer.pool.lock();
        if let Some(peer) = pool.peers.get_mut(self.index) {
            peer.active_calls = peer.active_calls.saturating_sub(1);
        }
    }
}
