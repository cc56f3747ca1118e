//! Lightning graph model: nodes, peer links, channels and route finding.

use crate::amount::{Amount, MSATS_PER_SAT};
use crate::error::{Error, Result};
use crate::role::Role;
use crate::rpc::{ChannelSummary, NodeId, PendingChannel, Route, RouteHop};
use std::collections::{BTreeMap, BTreeSet};

/// Smallest channel a node accepts.
pub const MIN_CHANNEL_SIZE_SAT: u64 = 20_000;

/// Largest non-wumbo channel.
pub const MAX_CHANNEL_SIZE_SAT: u64 = 16_777_215;

/// Confirmations before a funded channel becomes usable.
pub const CHANNEL_CONFIRMATIONS: u32 = 3;

/// Fee reserved by the initiator for the commitment transaction.
pub const COMMITMENT_FEE_SAT: u64 = 2_500;

/// CLTV delta required by the final hop.
pub const FINAL_CLTV_DELTA: u32 = 40;

/// Longest route considered.
pub const MAX_ROUTE_HOPS: usize = 20;

/// Bound on candidate paths explored per query.
const MAX_CANDIDATE_PATHS: usize = 64;

/// Forwarding fees and time lock a node charges on its outgoing channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardingPolicy {
    /// Flat fee per forwarded HTLC.
    pub base_fee_msat: u64,
    /// Proportional fee in parts per million.
    pub fee_rate_ppm: u64,
    /// Blocks added to the HTLC expiry.
    pub time_lock_delta: u32,
}

impl Default for ForwardingPolicy {
    fn default() -> Self {
        Self {
            base_fee_msat: 1_000,
            fee_rate_ppm: 1,
            time_lock_delta: 80,
        }
    }
}

impl ForwardingPolicy {
    /// Fee for forwarding `amount_msat`.
    #[must_use]
    pub fn fee(&self, amount_msat: u64) -> u64 {
        let proportional = u128::from(amount_msat) * u128::from(self.fee_rate_ppm) / 1_000_000;
        self.base_fee_msat
            .saturating_add(u64::try_from(proportional).unwrap_or(u64::MAX))
    }
}

#[derive(Debug)]
pub(crate) struct LightningNode {
    pub node_id: NodeId,
    pub address: String,
    pub online: bool,
    pub isolated: bool,
    pub policy: ForwardingPolicy,
    peers: BTreeSet<Role>,
}

#[derive(Debug)]
pub(crate) struct SimChannel {
    pub chan_id: u64,
    pub channel_point: String,
    pub funding_txid: String,
    pub initiator: Role,
    pub remote: Role,
    pub capacity_sat: u64,
    initiator_msat: u64,
    remote_msat: u64,
    pub open: bool,
}

impl SimChannel {
    fn other_end(&self, role: Role) -> Option<Role> {
        if self.initiator == role {
            Some(self.remote)
        } else if self.remote == role {
            Some(self.initiator)
        } else {
            None
        }
    }

    fn local_msat(&self, role: Role) -> u64 {
        if self.initiator == role {
            self.initiator_msat
        } else {
            self.remote_msat
        }
    }
}

/// Short channel id from block height, transaction index and output index.
fn short_channel_id(block_height: u64, tx_index: u64, output: u64) -> u64 {
    (block_height << 40) | ((tx_index & 0xff_ffff) << 16) | (output & 0xffff)
}

/// Lightning nodes and channels of a simulated network.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: BTreeMap<Role, LightningNode>,
    channels: Vec<SimChannel>,
}

impl Graph {
    pub(crate) fn add_node(
        &mut self,
        role: Role,
        node_id: NodeId,
        address: String,
        isolated: bool,
    ) {
        self.nodes.insert(
            role,
            LightningNode {
                node_id,
                address,
                online: false,
                isolated,
                policy: ForwardingPolicy::default(),
                peers: BTreeSet::new(),
            },
        );
    }

    pub(crate) fn node(&self, role: Role) -> Option<&LightningNode> {
        self.nodes.get(&role)
    }

    pub(crate) fn set_policy(&mut self, role: Role, policy: ForwardingPolicy) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&role)
            .ok_or_else(|| Error::UnknownRole(format!("{role} has no Lightning node")))?;
        node.policy = policy;
        Ok(())
    }

    pub(crate) fn role_of(&self, node_id: &NodeId) -> Option<Role> {
        self.nodes
            .iter()
            .find(|(_, n)| &n.node_id == node_id)
            .map(|(role, _)| *role)
    }

    /// Bring a node up or down. Going down drops all of its peer links.
    pub(crate) fn set_online(&mut self, role: Role, online: bool) {
        if let Some(node) = self.nodes.get_mut(&role) {
            node.online = online;
            if !online {
                node.peers.clear();
            }
        }
        if !online {
            for node in self.nodes.values_mut() {
                node.peers.remove(&role);
            }
        }
    }

    pub(crate) fn connect(&mut self, from: Role, peer: &NodeId, address: &str) -> Result<()> {
        let target = self
            .role_of(peer)
            .ok_or_else(|| Error::Rpc(format!("unable to reach {peer}@{address}")))?;
        if target == from {
            return Err(Error::Rpc("cannot connect to self".to_string()));
        }
        let (Some(local), Some(remote)) = (self.nodes.get(&from), self.nodes.get(&target)) else {
            return Err(Error::Rpc(format!("unknown node {peer}")));
        };
        if remote.address != address || !remote.online {
            return Err(Error::Rpc(format!("dial tcp {address}: connection refused")));
        }
        if local.isolated || remote.isolated {
            return Err(Error::Rpc(format!("peer {peer} closed the connection")));
        }

        for (a, b) in [(from, target), (target, from)] {
            if let Some(node) = self.nodes.get_mut(&a) {
                node.peers.insert(b);
            }
        }
        Ok(())
    }

    pub(crate) fn peers(&self, role: Role) -> Vec<NodeId> {
        self.nodes.get(&role).map_or_else(Vec::new, |n| {
            n.peers
                .iter()
                .filter_map(|p| self.nodes.get(p).map(|peer| peer.node_id.clone()))
                .collect()
        })
    }

    pub(crate) fn is_peered(&self, a: Role, b: Role) -> bool {
        self.nodes.get(&a).is_some_and(|n| n.peers.contains(&b))
    }

    /// Validate a channel request before any funds move.
    pub(crate) fn check_channel_request(
        &self,
        from: Role,
        peer: &NodeId,
        capacity_sat: u64,
    ) -> Result<Role> {
        let remote = self
            .role_of(peer)
            .ok_or_else(|| Error::Rpc(format!("unknown peer {peer}")))?;
        if !self.is_peered(from, remote) {
            return Err(Error::Rpc(format!("peer {peer} is not online")));
        }
        if capacity_sat < MIN_CHANNEL_SIZE_SAT {
            return Err(Error::Rpc(format!(
                "chan size of {capacity_sat} sat is below min chan size of {MIN_CHANNEL_SIZE_SAT} sat"
            )));
        }
        if capacity_sat > MAX_CHANNEL_SIZE_SAT {
            return Err(Error::Rpc(format!(
                "funding amount is too large, the max channel size is {MAX_CHANNEL_SIZE_SAT} sat"
            )));
        }
        Ok(remote)
    }

    pub(crate) fn add_pending(
        &mut self,
        initiator: Role,
        remote: Role,
        capacity_sat: u64,
        funding_txid: String,
    ) -> String {
        let channel_point = format!("{funding_txid}:0");
        self.channels.push(SimChannel {
            chan_id: 0,
            channel_point: channel_point.clone(),
            funding_txid,
            initiator,
            remote,
            capacity_sat,
            initiator_msat: capacity_sat.saturating_sub(COMMITMENT_FEE_SAT) * MSATS_PER_SAT,
            remote_msat: 0,
            open: false,
        });
        channel_point
    }

    /// Open every pending channel whose funding transaction has enough
    /// confirmations. `confirmed_at` maps a funding txid to its block height.
    pub(crate) fn activate_confirmed(
        &mut self,
        tip: u64,
        confirmed_at: impl Fn(&str) -> Option<u64>,
    ) {
        for (index, channel) in self.channels.iter_mut().enumerate() {
            if channel.open {
                continue;
            }
            let Some(height) = confirmed_at(&channel.funding_txid) else {
                continue;
            };
            if (tip + 1).saturating_sub(height) >= u64::from(CHANNEL_CONFIRMATIONS) {
                channel.open = true;
                channel.chan_id = short_channel_id(height, index as u64, 0);
            }
        }
    }

    fn is_usable(&self, channel: &SimChannel) -> bool {
        channel.open
            && [channel.initiator, channel.remote]
                .iter()
                .all(|r| self.nodes.get(r).is_some_and(|n| n.online))
    }

    pub(crate) fn channel_summaries(&self, role: Role) -> Vec<ChannelSummary> {
        self.channels
            .iter()
            .filter(|c| c.open)
            .filter_map(|c| {
                let remote = c.other_end(role)?;
                let remote_node = self.nodes.get(&remote)?;
                Some(ChannelSummary {
                    chan_id: c.chan_id,
                    channel_point: c.channel_point.clone(),
                    remote_node_id: remote_node.node_id.clone(),
                    capacity: Amount::from_sat(c.capacity_sat),
                    local_balance: Amount::from_sat(c.local_msat(role) / MSATS_PER_SAT),
                    remote_balance: Amount::from_sat(c.local_msat(remote) / MSATS_PER_SAT),
                    active: self.is_usable(c),
                    initiator: c.initiator == role,
                })
            })
            .collect()
    }

    pub(crate) fn pending(&self, role: Role) -> Vec<PendingChannel> {
        self.channels
            .iter()
            .filter(|c| !c.open)
            .filter_map(|c| {
                let remote = c.other_end(role)?;
                Some(PendingChannel {
                    channel_point: c.channel_point.clone(),
                    remote_node_id: self.nodes.get(&remote)?.node_id.clone(),
                    capacity: Amount::from_sat(c.capacity_sat),
                })
            })
            .collect()
    }

    pub(crate) fn count_channels(&self, role: Role) -> (u32, u32) {
        let mut active = 0;
        let mut pending = 0;
        for channel in self.channels.iter().filter(|c| c.other_end(role).is_some()) {
            if !channel.open {
                pending += 1;
            } else if self.is_usable(channel) {
                active += 1;
            }
        }
        (active, pending)
    }

    /// Candidate routes from `source` to `destination`, cheapest first.
    ///
    /// The source's own balance is checked on the first hop; later hops are
    /// only checked against channel capacity, since remote balances are not
    /// visible to the payer.
    pub(crate) fn find_routes(
        &self,
        source: Role,
        destination: &NodeId,
        amount_msat: u64,
        tip: u64,
        max_results: usize,
    ) -> Vec<Route> {
        let Some(target) = self.role_of(destination) else {
            return Vec::new();
        };
        if target == source || amount_msat == 0 || max_results == 0 {
            return Vec::new();
        }

        let mut paths = Vec::new();
        let mut visited = BTreeSet::from([source]);
        self.walk(source, target, &mut visited, &mut Vec::new(), &mut paths);

        let mut routes: Vec<Route> = paths
            .iter()
            .filter_map(|path| self.build_route(source, path, amount_msat, tip))
            .collect();
        routes.sort_by_key(Route::preference_key);
        routes.truncate(max_results);
        routes
    }

    fn walk(
        &self,
        at: Role,
        target: Role,
        visited: &mut BTreeSet<Role>,
        path: &mut Vec<(usize, Role)>,
        out: &mut Vec<Vec<(usize, Role)>>,
    ) {
        for (index, channel) in self.channels.iter().enumerate() {
            if out.len() >= MAX_CANDIDATE_PATHS {
                return;
            }
            let Some(next) = channel.other_end(at) else {
                continue;
            };
            if visited.contains(&next) || !self.is_usable(channel) {
                continue;
            }

            path.push((index, next));
            if next == target {
                out.push(path.clone());
            } else if path.len() < MAX_ROUTE_HOPS {
                visited.insert(next);
                self.walk(next, target, visited, path, out);
                visited.remove(&next);
            }
            path.pop();
        }
    }

    fn build_route(
        &self,
        source: Role,
        path: &[(usize, Role)],
        amount_msat: u64,
        tip: u64,
    ) -> Option<Route> {
        let hops = path.len();
        let last = hops.checked_sub(1)?;

        // Walk backwards from the payee: the amount carried over each channel
        // and the fee its receiving node charges to forward onward.
        let mut carried = vec![0_u64; hops];
        let mut fees = vec![0_u64; hops];
        let mut expiry = vec![0_u32; hops];
        carried[last] = amount_msat;
        expiry[last] = u32::try_from(tip).ok()?.checked_add(FINAL_CLTV_DELTA)?;
        for i in (0..last).rev() {
            let policy = self.nodes.get(&path[i].1)?.policy;
            fees[i] = policy.fee(carried[i + 1]);
            carried[i] = carried[i + 1].checked_add(fees[i])?;
            expiry[i] = expiry[i + 1].checked_add(policy.time_lock_delta)?;
        }

        let first = self.channels.get(path[0].0)?;
        if first.local_msat(source) < carried[0] {
            return None;
        }
        for (i, (index, _)) in path.iter().enumerate().skip(1) {
            let channel = self.channels.get(*index)?;
            if channel.capacity_sat * MSATS_PER_SAT < carried[i] {
                return None;
            }
        }

        let route_hops = path
            .iter()
            .enumerate()
            .map(|(i, (index, role))| {
                Some(RouteHop {
                    chan_id: self.channels.get(*index)?.chan_id,
                    pub_key: self.nodes.get(role)?.node_id.clone(),
                    amt_to_forward_msat: carried[i] - fees[i],
                    fee_msat: fees[i],
                    expiry: expiry[(i + 1).min(last)],
                })
            })
            .collect::<Option<Vec<_>>>()?;

        Some(Route {
            hops: route_hops,
            total_amt_msat: carried[0],
            total_fees_msat: carried[0] - amount_msat,
            total_time_lock: expiry[0],
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn id(byte: &str) -> NodeId {
        NodeId::new(format!("02{}", byte.repeat(32)))
    }

    /// Rebalancer, Custody and ThirdParty online and fully peered.
    fn graph() -> Graph {
        let mut graph = Graph::default();
        for (role, byte) in [
            (Role::Rebalancer, "aa"),
            (Role::Custody, "bb"),
            (Role::ThirdParty, "cc"),
        ] {
            graph.add_node(role, id(byte), format!("127.0.0.1:97{byte}"), false);
            graph.set_online(role, true);
        }
        graph
            .connect(Role::Rebalancer, &id("cc"), "127.0.0.1:97cc")
            .unwrap();
        graph.connect(Role::Custody, &id("cc"), "127.0.0.1:97cc").unwrap();
        graph
            .connect(Role::Rebalancer, &id("bb"), "127.0.0.1:97bb")
            .unwrap();
        graph
    }

    fn open(graph: &mut Graph, from: Role, to: Role, sats: u64, txid: &str) {
        graph.add_pending(from, to, sats, txid.to_string());
        graph.activate_confirmed(10, |_| Some(5));
    }

    #[test]
    fn test_policy_fee() {
        let policy = ForwardingPolicy::default();
        assert_eq!(policy.fee(1_000), 1_000);
        assert_eq!(policy.fee(2_000_000), 1_002);
    }

    #[test]
    fn test_channel_waits_for_confirmations() {
        let mut graph = graph();
        graph.add_pending(Role::Rebalancer, Role::ThirdParty, 500_000, "aa".to_string());
        graph.activate_confirmed(6, |_| Some(5));
        assert_eq!(graph.pending(Role::Rebalancer).len(), 1);
        assert!(graph.channel_summaries(Role::Rebalancer).is_empty());

        graph.activate_confirmed(7, |_| Some(5));
        let channels = graph.channel_summaries(Role::ThirdParty);
        assert_eq!(channels.len(), 1);
        assert!(channels[0].active);
        assert!(!channels[0].initiator);
        assert_eq!(channels[0].chan_id >> 40, 5);
        assert_eq!(channels[0].remote_balance, Amount::from_sat(500_000 - COMMITMENT_FEE_SAT));
    }

    #[test]
    fn test_route_through_hub_uses_capacity_of_remote_hop() {
        // Custody -> ThirdParty is funded by Custody, so ThirdParty holds no
        // local balance towards Custody; the route must still be found.
        let mut graph = graph();
        open(&mut graph, Role::Rebalancer, Role::ThirdParty, 500_000, "01");
        open(&mut graph, Role::Custody, Role::ThirdParty, 500_000, "02");

        let routes = graph.find_routes(Role::Rebalancer, &id("bb"), 1_000, 100, 10);
        assert_eq!(routes.len(), 1);
        let route = &routes[0];
        assert_eq!(route.hop_count(), 2);
        assert_eq!(route.total_fees_msat, 1_000);
        assert_eq!(route.total_amt_msat, 2_000);
        assert_eq!(route.hops[0].fee_msat, 1_000);
        assert_eq!(route.hops[1].fee_msat, 0);
        assert_eq!(route.hops[1].amt_to_forward_msat, 1_000);
        assert_eq!(route.hops[1].expiry, 140);
        assert_eq!(route.total_time_lock, 220);
        assert_eq!(route.destination(), Some(&id("bb")));
    }

    #[test]
    fn test_routes_sorted_by_fee_then_hops() {
        let mut graph = graph();
        open(&mut graph, Role::Rebalancer, Role::ThirdParty, 500_000, "01");
        open(&mut graph, Role::Custody, Role::ThirdParty, 500_000, "02");
        open(&mut graph, Role::Rebalancer, Role::Custody, 500_000, "03");

        let routes = graph.find_routes(Role::Rebalancer, &id("bb"), 1_000, 100, 10);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].hop_count(), 1);
        assert_eq!(routes[0].total_fees_msat, 0);
        assert_eq!(routes[1].hop_count(), 2);

        let limited = graph.find_routes(Role::Rebalancer, &id("bb"), 1_000, 100, 1);
        assert_eq!(limited, routes[..1].to_vec());
    }

    #[test]
    fn test_no_route_without_channels_or_liquidity() {
        let mut graph = graph();
        assert!(graph
            .find_routes(Role::Rebalancer, &id("bb"), 1_000, 100, 10)
            .is_empty());

        // Custody funded the only channel, so it cannot be paid through it.
        open(&mut graph, Role::Custody, Role::Rebalancer, 500_000, "01");
        assert!(graph
            .find_routes(Role::Rebalancer, &id("bb"), 1_000, 100, 10)
            .is_empty());
        assert_eq!(
            graph
                .find_routes(Role::Custody, &id("aa"), 1_000, 100, 10)
                .len(),
            1
        );
    }

    #[test]
    fn test_offline_node_drops_peers_and_routes() {
        let mut graph = graph();
        open(&mut graph, Role::Rebalancer, Role::ThirdParty, 500_000, "01");
        open(&mut graph, Role::Custody, Role::ThirdParty, 500_000, "02");

        graph.set_online(Role::ThirdParty, false);
        assert!(!graph.is_peered(Role::Rebalancer, Role::ThirdParty));
        assert!(graph
            .find_routes(Role::Rebalancer, &id("bb"), 1_000, 100, 10)
            .is_empty());
    }

    #[test]
    fn test_isolated_node_refuses_connections() {
        let mut graph = Graph::default();
        graph.add_node(Role::Rebalancer, id("aa"), "127.0.0.1:1".to_string(), false);
        graph.add_node(Role::Custody, id("bb"), "127.0.0.1:2".to_string(), true);
        graph.set_online(Role::Rebalancer, true);
        graph.set_online(Role::Custody, true);

        assert!(graph.connect(Role::Rebalancer, &id("bb"), "127.0.0.1:2").is_err());
        assert!(graph.connect(Role::Rebalancer, &id("bb"), "127.0.0.1:3").is_err());
        assert!(graph.peers(Role::Rebalancer).is_empty());
    }

    #[test]
    fn test_channel_request_limits() {
        let graph = graph();
        assert!(graph
            .check_channel_request(Role::Rebalancer, &id("cc"), MIN_CHANNEL_SIZE_SAT - 1)
            .is_err());
        assert!(graph
            .check_channel_request(Role::Rebalancer, &id("cc"), MAX_CHANNEL_SIZE_SAT + 1)
            .is_err());
        assert_eq!(
            graph
                .check_channel_request(Role::Rebalancer, &id("cc"), 500_000)
                .unwrap(),
            Role::ThirdParty
        );
    }
}
