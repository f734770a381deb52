//! Node registry.
//!
//! The directory of everything addressable from the local mesh: radios heard
//! directly (local nodes) and virtual identities representing peer stations
//! (remote nodes, with synthetic ids minted from [`REMOTE_NODE_BASE`]).
//!
//! Reads happen from many threads; writes only from the mesh-inbound
//! consumer and the discovery diff. The registry is therefore shared behind
//! a read/write lock ([`Shared`]) and every lookup returns owned snapshots,
//! so no lock is ever held across I/O.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use localtime::LocalTime;

use crate::mesh::proto;
use crate::{NodeId, ONLINE_WINDOW, REMOTE_NODE_BASE};

/// A radio on the local mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalNode {
    pub num: NodeId,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    /// Last position report, verbatim. Not interpreted by the station.
    pub position: Option<proto::Position>,
    pub last_seen: LocalTime,
}

impl LocalNode {
    /// Best human-readable name for confirmations and reports.
    pub fn name(&self) -> String {
        self.long_name
            .clone()
            .or_else(|| self.short_name.clone())
            .unwrap_or_else(|| self.num.to_string())
    }
}

/// A node reachable through a peer station.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteNode {
    pub num: NodeId,
    pub station_id: String,
    pub display_name: String,
    pub short_name: String,
    pub last_seen: LocalTime,
}

/// A directory entry, local or remote. Owned snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Local(LocalNode),
    Remote(RemoteNode),
}

impl Node {
    pub fn num(&self) -> NodeId {
        match self {
            Self::Local(n) => n.num,
            Self::Remote(n) => n.num,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Local(n) => n.name(),
            Self::Remote(n) => n.display_name.clone(),
        }
    }

    pub fn last_seen(&self) -> LocalTime {
        match self {
            Self::Local(n) => n.last_seen,
            Self::Remote(n) => n.last_seen,
        }
    }

    pub fn station_id(&self) -> Option<&str> {
        match self {
            Self::Local(_) => None,
            Self::Remote(n) => Some(n.station_id.as_str()),
        }
    }
}

/// How a lookup matched its candidate. Order is the tiebreak order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchKind {
    ExactId,
    ExactName,
    Partial,
    Fuzzy,
}

/// A ranked lookup result.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub node: Node,
    /// Score in the 0..=100 range.
    pub score: u32,
    pub kind: MatchKind,
    pub online: bool,
}

/// Minimum score for a candidate to be considered at all.
const SCORE_CUTOFF: u32 = 30;
/// Ranking bonus for candidates that are currently online.
const ONLINE_BONUS: u32 = 10;

/// The node directory. See [`Shared`] for the concurrent wrapper.
#[derive(Debug, Default)]
pub struct Registry {
    local: HashMap<NodeId, LocalNode>,
    remote: HashMap<NodeId, RemoteNode>,
    next_remote: Option<NodeId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a node-database entry. Creates the node on first observation.
    pub fn add_or_update_local(&mut self, info: &proto::NodeInfo, now: LocalTime) {
        let entry = self.local.entry(info.num).or_insert_with(|| LocalNode {
            num: info.num,
            long_name: None,
            short_name: None,
            position: None,
            last_seen: now,
        });
        if let Some(user) = &info.user {
            if !user.long_name.is_empty() {
                entry.long_name = Some(user.long_name.clone());
            }
            if !user.short_name.is_empty() {
                entry.short_name = Some(user.short_name.clone());
            }
        }
        if let Some(position) = &info.position {
            entry.position = Some(position.clone());
        }
        entry.last_seen = now;
    }

    /// Record that a node was heard from, without identity information.
    pub fn observe(&mut self, num: NodeId, now: LocalTime) {
        let entry = self.local.entry(num).or_insert_with(|| LocalNode {
            num,
            long_name: None,
            short_name: None,
            position: None,
            last_seen: now,
        });
        entry.last_seen = now;
    }

    /// Add a virtual node for a peer station, or refresh it if present.
    /// Returns the synthetic node id.
    pub fn add_remote(
        &mut self,
        station_id: &str,
        display_name: &str,
        short_name: &str,
        now: LocalTime,
    ) -> NodeId {
        if let Some(existing) = self
            .remote
            .values_mut()
            .find(|n| n.station_id == station_id)
        {
            existing.display_name = display_name.to_owned();
            existing.short_name = short_name.to_owned();
            existing.last_seen = now;
            return existing.num;
        }
        let num = self.next_remote_id();
        self.remote.insert(
            num,
            RemoteNode {
                num,
                station_id: station_id.to_owned(),
                display_name: display_name.to_owned(),
                short_name: short_name.to_owned(),
                last_seen: now,
            },
        );
        num
    }

    /// Refresh the freshness of a peer station's virtual node.
    pub fn refresh_remote(&mut self, station_id: &str, now: LocalTime) {
        for node in self.remote.values_mut() {
            if node.station_id == station_id {
                node.last_seen = now;
            }
        }
    }

    /// Drop all virtual nodes belonging to a lost peer station.
    pub fn remove_station(&mut self, station_id: &str) -> usize {
        let before = self.remote.len();
        self.remote.retain(|_, n| n.station_id != station_id);
        before - self.remote.len()
    }

    pub fn local(&self, num: NodeId) -> Option<&LocalNode> {
        self.local.get(&num)
    }

    pub fn remote(&self, num: NodeId) -> Option<&RemoteNode> {
        self.remote.get(&num)
    }

    /// Look up any node by id.
    pub fn node(&self, num: NodeId) -> Option<Node> {
        self.local
            .get(&num)
            .cloned()
            .map(Node::Local)
            .or_else(|| self.remote.get(&num).cloned().map(Node::Remote))
    }

    pub fn is_online(&self, num: NodeId, now: LocalTime) -> bool {
        self.node(num)
            .map(|n| online(n.last_seen(), now))
            .unwrap_or(false)
    }

    /// All local nodes heard within the online window.
    pub fn online_nodes(&self, now: LocalTime) -> Vec<LocalNode> {
        let mut nodes: Vec<_> = self
            .local
            .values()
            .filter(|n| online(n.last_seen, now))
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.num);
        nodes
    }

    pub fn local_count(&self) -> usize {
        self.local.len()
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    /// All nodes, local first, sorted by id. For the `nodes` report.
    pub fn all_nodes(&self) -> Vec<Node> {
        let mut local: Vec<_> = self.local.values().cloned().map(Node::Local).collect();
        let mut remote: Vec<_> = self.remote.values().cloned().map(Node::Remote).collect();
        local.sort_by_key(|n| n.num());
        remote.sort_by_key(|n| n.num());
        local.extend(remote);
        local
    }

    /// Find the best match for a user-supplied identifier.
    ///
    /// Ranking is deterministic: score plus an online bonus, ties broken by
    /// match kind, then by node id.
    pub fn find_best(&self, identifier: &str, now: LocalTime) -> Option<Match> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return None;
        }

        // An all-digit identifier naming a known local node is exact.
        if identifier.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(num) = identifier.parse::<NodeId>() {
                if let Some(node) = self.local.get(&num) {
                    return Some(Match {
                        online: online(node.last_seen, now),
                        node: Node::Local(node.clone()),
                        score: 100,
                        kind: MatchKind::ExactId,
                    });
                }
            }
        }

        let mut candidates: Vec<Match> = Vec::new();

        for node in self.local.values() {
            let names = [node.long_name.as_deref(), node.short_name.as_deref()];
            if let Some((score, kind)) = best_name_score(identifier, names.into_iter().flatten()) {
                candidates.push(Match {
                    online: online(node.last_seen, now),
                    node: Node::Local(node.clone()),
                    score,
                    kind,
                });
            }
        }
        for node in self.remote.values() {
            let names = [Some(node.display_name.as_str()), Some(node.short_name.as_str())];
            if let Some((score, kind)) = best_name_score(identifier, names.into_iter().flatten()) {
                candidates.push(Match {
                    online: online(node.last_seen, now),
                    node: Node::Remote(node.clone()),
                    score,
                    kind,
                });
            }
        }

        candidates.into_iter().max_by(|a, b| {
            let a_rank = a.score + if a.online { ONLINE_BONUS } else { 0 };
            let b_rank = b.score + if b.online { ONLINE_BONUS } else { 0 };

            a_rank
                .cmp(&b_rank)
                // Tiebreak: prefer the stronger match kind, then the lower id
                // so results are stable between calls.
                .then_with(|| b.kind.cmp(&a.kind))
                .then_with(|| b.node.num().cmp(&a.node.num()))
        })
    }

    fn next_remote_id(&mut self) -> NodeId {
        let id = self.next_remote.unwrap_or(REMOTE_NODE_BASE);
        self.next_remote = Some(id + 1);
        id
    }
}

fn online(last_seen: LocalTime, now: LocalTime) -> bool {
    last_seen + ONLINE_WINDOW >= now
}

/// Score an identifier against a candidate's names; best name wins.
fn best_name_score<'a>(
    identifier: &str,
    names: impl Iterator<Item = &'a str>,
) -> Option<(u32, MatchKind)> {
    names
        .filter_map(|name| name_score(identifier, name))
        .filter(|(score, _)| *score >= SCORE_CUTOFF)
        .max_by_key(|(score, kind)| (*score, std::cmp::Reverse(*kind)))
}

fn name_score(identifier: &str, name: &str) -> Option<(u32, MatchKind)> {
    if name.is_empty() {
        return None;
    }
    let identifier = identifier.to_lowercase();
    let name = name.to_lowercase();

    if identifier == name {
        return Some((100, MatchKind::ExactName));
    }
    if name.starts_with(&identifier) {
        return Some((90, MatchKind::Partial));
    }
    if identifier.starts_with(&name) {
        return Some((85, MatchKind::Partial));
    }
    if name.contains(&identifier) {
        return Some((70, MatchKind::Partial));
    }
    if identifier.contains(&name) {
        return Some((65, MatchKind::Partial));
    }
    let max_len = identifier.chars().count().max(name.chars().count());
    let distance = levenshtein(&identifier, &name);
    let score = (max_len.saturating_sub(distance) * 60 / max_len) as u32;

    Some((score, MatchKind::Fuzzy))
}

/// Classic edit distance over characters.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// The registry behind a read/write lock, shared between threads.
///
/// All methods lock internally and return owned data; callers cannot hold
/// the lock across I/O by construction.
#[derive(Debug, Clone, Default)]
pub struct Shared(Arc<RwLock<Registry>>);

impl Shared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_or_update_local(&self, info: &proto::NodeInfo, now: LocalTime) {
        self.write().add_or_update_local(info, now);
    }

    pub fn observe(&self, num: NodeId, now: LocalTime) {
        self.write().observe(num, now);
    }

    pub fn add_remote(
        &self,
        station_id: &str,
        display_name: &str,
        short_name: &str,
        now: LocalTime,
    ) -> NodeId {
        self.write().add_remote(station_id, display_name, short_name, now)
    }

    pub fn refresh_remote(&self, station_id: &str, now: LocalTime) {
        self.write().refresh_remote(station_id, now);
    }

    pub fn remove_station(&self, station_id: &str) -> usize {
        self.write().remove_station(station_id)
    }

    pub fn node(&self, num: NodeId) -> Option<Node> {
        self.read().node(num)
    }

    pub fn is_online(&self, num: NodeId, now: LocalTime) -> bool {
        self.read().is_online(num, now)
    }

    pub fn find_best(&self, identifier: &str, now: LocalTime) -> Option<Match> {
        self.read().find_best(identifier, now)
    }

    pub fn online_nodes(&self, now: LocalTime) -> Vec<LocalNode> {
        self.read().online_nodes(now)
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.read().all_nodes()
    }

    pub fn counts(&self) -> (usize, usize) {
        let registry = self.read();
        (registry.local_count(), registry.remote_count())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.0.read().expect("registry: lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.0.write().expect("registry: lock poisoned")
    }
}
