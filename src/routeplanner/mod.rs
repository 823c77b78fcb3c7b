//! Egress address pool for outbound media requests.
//!
//! Only consulted when a stream host rate-limits us: the failing address is
//! benched for `fail_cooldown_ms` and the request is retried from another one.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use ipnet::IpNet;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    common::{errors::NodeError, types::now_ms},
    configs::RoutePlannerConfig,
};

pub trait RoutePlanner: Send + Sync {
    /// Next usable local address, `None` when every candidate is benched.
    fn get_address(&self) -> Option<IpAddr>;
    fn mark_failed(&self, address: IpAddr);
    fn free_address(&self, address: IpAddr);
    fn free_all_addresses(&self);
    fn status(&self) -> RoutePlannerStatus;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailingAddress {
    pub address: String,
    pub failing_timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePlannerStatus {
    pub blocks: Vec<String>,
    pub failing_addresses: Vec<FailingAddress>,
}

fn parse_block(cidr: &str) -> Result<IpNet, NodeError> {
    IpNet::from_str(cidr)
        .or_else(|_| {
            // bare address
            if cidr.contains(':') {
                IpNet::from_str(&format!("{}/128", cidr))
            } else {
                IpNet::from_str(&format!("{}/32", cidr))
            }
        })
        .map_err(|e| NodeError::Config(format!("invalid route planner block '{}': {}", cidr, e)))
}

/// Round-robins across configured blocks, walking each block with a small
/// random stride.
pub struct BalancingIpRoutePlanner {
    blocks: Vec<IpNet>,
    excluded: HashSet<IpAddr>,
    cooldown_ms: u64,
    failing: Mutex<HashMap<IpAddr, u64>>,
    cursor: Mutex<(usize, Vec<u128>)>,
}

impl BalancingIpRoutePlanner {
    pub fn new(config: &RoutePlannerConfig) -> Result<Self, NodeError> {
        let blocks = config
            .cidrs
            .iter()
            .map(|c| parse_block(c))
            .collect::<Result<Vec<_>, _>>()?;
        if blocks.is_empty() {
            return Err(NodeError::Config(
                "route planner enabled without any cidrs".into(),
            ));
        }

        let excluded = config
            .excluded_ips
            .iter()
            .filter_map(|ip| match IpAddr::from_str(ip) {
                Ok(ip) => Some(ip),
                Err(e) => {
                    warn!("Ignoring excluded ip '{}': {}", ip, e);
                    None
                }
            })
            .collect();

        let indices = vec![0u128; blocks.len()];
        Ok(Self {
            blocks,
            excluded,
            cooldown_ms: config.fail_cooldown_ms,
            failing: Mutex::new(HashMap::new()),
            cursor: Mutex::new((0, indices)),
        })
    }

    fn next_ip(&self) -> IpAddr {
        let mut cursor = self.cursor.lock();
        let block_idx = cursor.0 % self.blocks.len();
        let block = self.blocks[block_idx];

        let max_bits = if block.addr().is_ipv4() { 32 } else { 128 };
        let host_bits = max_bits - block.prefix_len() as u32;
        let stride = if host_bits > 7 {
            rand::thread_rng().gen_range(10..20) as u128
        } else {
            1
        };

        let index = cursor.1[block_idx].wrapping_add(stride);
        cursor.1[block_idx] = index;
        cursor.0 = (block_idx + 1) % self.blocks.len();

        match block {
            IpNet::V4(net) => {
                let mask = if host_bits == 0 { 0 } else { u32::MAX >> (32 - host_bits) };
                let offset = (index as u32) & mask;
                IpAddr::V4(Ipv4Addr::from(u32::from(net.network()).wrapping_add(offset)))
            }
            IpNet::V6(net) => {
                let mask = if host_bits == 0 { 0 } else { u128::MAX >> (128 - host_bits) };
                let offset = index & mask;
                IpAddr::V6(Ipv6Addr::from(u128::from(net.network()).wrapping_add(offset)))
            }
        }
    }

    fn is_benched(&self, ip: IpAddr) -> bool {
        let mut failing = self.failing.lock();
        match failing.get(&ip) {
            Some(&since) if now_ms() < since + self.cooldown_ms => true,
            Some(_) => {
                failing.remove(&ip);
                false
            }
            None => false,
        }
    }
}

impl RoutePlanner for BalancingIpRoutePlanner {
    fn get_address(&self) -> Option<IpAddr> {
        for _ in 0..100 {
            let ip = self.next_ip();
            if !self.excluded.contains(&ip) && !self.is_benched(ip) {
                return Some(ip);
            }
        }
        None
    }

    fn mark_failed(&self, address: IpAddr) {
        debug!("Route planner: benching {}", address);
        self.failing.lock().insert(address, now_ms());
    }

    fn free_address(&self, address: IpAddr) {
        self.failing.lock().remove(&address);
    }

    fn free_all_addresses(&self) {
        self.failing.lock().clear();
    }

    fn status(&self) -> RoutePlannerStatus {
        RoutePlannerStatus {
            blocks: self.blocks.iter().map(|b| b.to_string()).collect(),
            failing_addresses: self
                .failing
                .lock()
                .iter()
                .map(|(ip, ts)| FailingAddress {
                    address: ip.to_string(),
                    failing_timestamp: *ts,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cidrs: &[&str], excluded: &[&str]) -> RoutePlannerConfig {
        RoutePlannerConfig {
            enabled: true,
            cidrs: cidrs.iter().map(|s| s.to_string()).collect(),
            excluded_ips: excluded.iter().map(|s| s.to_string()).collect(),
            fail_cooldown_ms: 60_000,
        }
    }

    #[test]
    fn addresses_stay_inside_block() {
        let planner = BalancingIpRoutePlanner::new(&config(&["10.0.0.0/24"], &[])).unwrap();
        let net: IpNet = "10.0.0.0/24".parse().unwrap();
        for _ in 0..50 {
            assert!(net.contains(&planner.get_address().unwrap()));
        }
    }

    #[test]
    fn failed_single_address_is_benched() {
        let planner = BalancingIpRoutePlanner::new(&config(&["192.0.2.7"], &[])).unwrap();
        let ip = planner.get_address().unwrap();
        assert_eq!(ip, IpAddr::from_str("192.0.2.7").unwrap());

        planner.mark_failed(ip);
        assert!(planner.get_address().is_none());
        assert_eq!(planner.status().failing_addresses.len(), 1);

        planner.free_address(ip);
        assert_eq!(planner.get_address(), Some(ip));
    }

    #[test]
    fn excluded_addresses_are_skipped() {
        let planner =
            BalancingIpRoutePlanner::new(&config(&["192.0.2.0/31"], &["192.0.2.0"])).unwrap();
        for _ in 0..10 {
            assert_eq!(planner.get_address(), Some(IpAddr::from_str("192.0.2.1").unwrap()));
        }
    }

    #[test]
    fn invalid_block_is_a_config_error() {
        let err = BalancingIpRoutePlanner::new(&config(&["not-a-cidr"], &[]))
            .err()
            .unwrap();
        assert!(matches!(err, NodeError::Config(_)));
    }
}
