//! Consistent-hash ring over component instances, fed by gossip.
//!
//! Every distributor, ingester, querier, and compactor joins a ring of its
//! kind and publishes tokens, state, and address. Ownership of a key is
//! computed by hashing the key to 32 bits and walking the token ring
//! clockwise, skipping unhealthy tokens, until enough distinct owners are
//! found.
//!
//! The gossip wire protocol (anti-entropy dissemination) is an external
//! collaborator; this crate only merges member records, each of which is
//! written by exactly one node. Merging is last-write-wins on the member's
//! heartbeat timestamp, which makes updates commutative and idempotent and
//! therefore safe to apply in any gossip order.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use largo_time::{Time, TimeProvider};
use metric::{Metric, U64Gauge};
use observability_deps::tracing::{debug, info};
use parking_lot::RwLock;
use rand::Rng;
use siphasher::sip::SipHasher24;
use std::{collections::BTreeMap, hash::Hasher, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// Stable identifier of a ring member.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberId(Arc<str>);

impl MemberId {
    /// Wrap an identifier string.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// The identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a member, gossiped alongside its tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum MemberState {
    Pending,
    Joining,
    Active,
    Leaving,
    Unhealthy,
}

impl MemberState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Joining => "joining",
            Self::Active => "active",
            Self::Leaving => "leaving",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// One member's gossiped record. Only the member itself writes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    /// Stable identifier.
    pub id: MemberId,
    /// Address queriers/distributors dial.
    pub addr: String,
    /// Ring positions owned by this member.
    pub tokens: Vec<u32>,
    /// Lifecycle state.
    pub state: MemberState,
    /// Last self-reported heartbeat.
    pub heartbeat: Time,
}

impl Member {
    fn healthy(&self, now: Time, staleness: Duration) -> bool {
        if self.state != MemberState::Active {
            return false;
        }
        match now.checked_duration_since(self.heartbeat) {
            Some(age) => age <= staleness,
            // heartbeat in the future (clock skew): treat as fresh
            None => true,
        }
    }
}

/// Ring tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    /// A member whose heartbeat is older than this is skipped during
    /// ownership lookups.
    pub heartbeat_staleness: Duration,
    /// Tokens generated for a member on [`Ring::join`].
    pub tokens_per_member: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            heartbeat_staleness: Duration::from_secs(30),
            tokens_per_member: 64,
        }
    }
}

#[derive(Debug, Default)]
struct RingState {
    members: BTreeMap<MemberId, Member>,
    /// Sorted `(token, member)` table, rebuilt on every membership change.
    token_table: Vec<(u32, MemberId)>,
}

impl RingState {
    fn rebuild(&mut self) {
        self.token_table = self
            .members
            .values()
            .flat_map(|m| m.tokens.iter().map(move |t| (*t, m.id.clone())))
            .collect();
        self.token_table.sort();
    }
}

/// Hash an ownership key to its 32-bit ring position.
pub fn ring_position(key: &[u8]) -> u32 {
    let mut hasher = SipHasher24::new_with_keys(0x7269_6e67, 0x6c61_7267);
    hasher.write(key);
    hasher.finish() as u32
}

/// The shared, gossip-replicated hash ring.
#[derive(Debug)]
pub struct Ring {
    config: RingConfig,
    time_provider: Arc<dyn TimeProvider>,
    state: RwLock<RingState>,
    member_gauge: Metric<U64Gauge>,
}

impl Ring {
    /// Create an empty ring.
    pub fn new(
        config: RingConfig,
        time_provider: Arc<dyn TimeProvider>,
        metric_registry: &metric::Registry,
    ) -> Self {
        let member_gauge = metric_registry
            .register_metric("ring_members", "number of ring members by state");
        Self {
            config,
            time_provider,
            state: RwLock::new(RingState::default()),
            member_gauge,
        }
    }

    /// Generate tokens and insert a new member in PENDING state. Returns the
    /// record to gossip.
    pub fn join(&self, id: MemberId, addr: impl Into<String>) -> Member {
        let mut rng = rand::thread_rng();
        let mut state = self.state.write();

        let mut taken: Vec<u32> = state.token_table.iter().map(|(t, _)| *t).collect();
        let mut tokens = Vec::with_capacity(self.config.tokens_per_member);
        while tokens.len() < self.config.tokens_per_member {
            let token: u32 = rng.gen();
            if taken.binary_search(&token).is_err() && !tokens.contains(&token) {
                taken.push(token);
                taken.sort_unstable();
                tokens.push(token);
            }
        }
        tokens.sort_unstable();

        let member = Member {
            id: id.clone(),
            addr: addr.into(),
            tokens,
            state: MemberState::Pending,
            heartbeat: self.time_provider.now(),
        };
        info!(member=%id, tokens=member.tokens.len(), "member joining ring");
        state.members.insert(id, member.clone());
        state.rebuild();
        drop(state);

        self.update_gauges();
        member
    }

    /// Merge a gossiped member record. Older records (by heartbeat) are
    /// ignored so replays and out-of-order delivery are harmless.
    pub fn apply(&self, member: Member) {
        let mut state = self.state.write();
        match state.members.get(&member.id) {
            Some(existing) if existing.heartbeat > member.heartbeat => {
                debug!(member=%member.id, "ignoring stale gossip record");
                return;
            }
            _ => {}
        }
        state.members.insert(member.id.clone(), member);
        state.rebuild();
        drop(state);

        self.update_gauges();
    }

    /// Transition the member's state and refresh its heartbeat. Returns the
    /// updated record to gossip, or `None` for an unknown member.
    pub fn set_state(&self, id: &MemberId, new_state: MemberState) -> Option<Member> {
        let mut state = self.state.write();
        let member = state.members.get_mut(id)?;
        member.state = new_state;
        member.heartbeat = self.time_provider.now();
        let updated = member.clone();
        drop(state);

        info!(member=%id, state=new_state.as_str(), "ring member state change");
        self.update_gauges();
        Some(updated)
    }

    /// Refresh the member's heartbeat. Returns the updated record to gossip.
    pub fn heartbeat(&self, id: &MemberId) -> Option<Member> {
        let mut state = self.state.write();
        let member = state.members.get_mut(id)?;
        member.heartbeat = self.time_provider.now();
        Some(member.clone())
    }

    /// Remove a member entirely (after LEAVING handoff completes).
    pub fn forget(&self, id: &MemberId) {
        let mut state = self.state.write();
        state.members.remove(id);
        state.rebuild();
        drop(state);

        self.update_gauges();
    }

    /// Look up a member record.
    pub fn member(&self, id: &MemberId) -> Option<Member> {
        self.state.read().members.get(id).cloned()
    }

    /// Snapshot all member records.
    pub fn members(&self) -> Vec<Member> {
        self.state.read().members.values().cloned().collect()
    }

    /// All currently healthy members.
    pub fn healthy_members(&self) -> Vec<Member> {
        let now = self.time_provider.now();
        self.state
            .read()
            .members
            .values()
            .filter(|m| m.healthy(now, self.config.heartbeat_staleness))
            .cloned()
            .collect()
    }

    /// The `replication_factor` distinct healthy owners of `key`, starting
    /// at the first token clockwise of the key's ring position.
    ///
    /// Returns fewer owners if the ring does not contain enough healthy
    /// members.
    pub fn owners(&self, key: &[u8], replication_factor: usize) -> Vec<Member> {
        let position = ring_position(key);
        let now = self.time_provider.now();
        let state = self.state.read();

        let table = &state.token_table;
        if table.is_empty() || replication_factor == 0 {
            return vec![];
        }

        let start = table.partition_point(|(t, _)| *t < position);
        let mut owners: Vec<Member> = Vec::with_capacity(replication_factor);
        for i in 0..table.len() {
            let (_, member_id) = &table[(start + i) % table.len()];
            if owners.iter().any(|m| &m.id == member_id) {
                continue;
            }
            let member = state
                .members
                .get(member_id)
                .expect("token table references known member");
            if !member.healthy(now, self.config.heartbeat_staleness) {
                continue;
            }
            owners.push(member.clone());
            if owners.len() == replication_factor {
                break;
            }
        }
        owners
    }

    /// True if `id` is the single owner of `key`; used for leader election
    /// (e.g. the compaction scheduler).
    pub fn is_leader(&self, id: &MemberId, key: &[u8]) -> bool {
        self.owners(key, 1)
            .first()
            .map(|m| &m.id == id)
            .unwrap_or(false)
    }

    fn update_gauges(&self) {
        let state = self.state.read();
        let mut counts: BTreeMap<&'static str, u64> = BTreeMap::new();
        for s in [
            MemberState::Pending,
            MemberState::Joining,
            MemberState::Active,
            MemberState::Leaving,
            MemberState::Unhealthy,
        ] {
            counts.insert(s.as_str(), 0);
        }
        for member in state.members.values() {
            *counts.entry(member.state.as_str()).or_default() += 1;
        }
        for (name, count) in counts {
            self.member_gauge.recorder(&[("state", name)]).set(count);
        }
    }
}

/// Interval between heartbeat refreshes.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Drives the local member through join → active and refreshes its heartbeat
/// until shutdown, then transitions it to LEAVING.
///
/// Gossip of the returned records to peers is left to the transport layer;
/// in single-process deployments applying to the local ring is all there is.
pub async fn run_heartbeat_loop(
    ring: Arc<Ring>,
    id: MemberId,
    shutdown: CancellationToken,
) {
    ring.set_state(&id, MemberState::Joining);
    ring.set_state(&id, MemberState::Active);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                ring.heartbeat(&id);
            }
            _ = shutdown.cancelled() => {
                info!(member=%id, "heartbeat loop shutting down");
                ring.set_state(&id, MemberState::Leaving);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use largo_time::MockProvider;

    fn test_ring(tokens_per_member: usize) -> (Arc<Ring>, Arc<MockProvider>) {
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        let registry = metric::Registry::new();
        let ring = Arc::new(Ring::new(
            RingConfig {
                heartbeat_staleness: Duration::from_secs(30),
                tokens_per_member,
            },
            Arc::clone(&time_provider) as _,
            &registry,
        ));
        (ring, time_provider)
    }

    fn activate(ring: &Ring, id: &str) -> MemberId {
        let member_id = MemberId::new(id);
        ring.join(member_id.clone(), format!("{id}:8080"));
        ring.set_state(&member_id, MemberState::Active);
        member_id
    }

    #[test]
    fn owners_are_distinct_and_deterministic() {
        let (ring, _) = test_ring(32);
        for i in 0..5 {
            activate(&ring, &format!("ingester-{i}"));
        }

        let a = ring.owners(b"tenant-1/abcd", 3);
        let b = ring.owners(b"tenant-1/abcd", 3);
        assert_eq!(a.len(), 3);
        assert_eq!(
            a.iter().map(|m| m.id.clone()).collect::<Vec<_>>(),
            b.iter().map(|m| m.id.clone()).collect::<Vec<_>>()
        );

        let mut ids: Vec<_> = a.iter().map(|m| m.id.as_str().to_string()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn owners_skip_non_active_members() {
        let (ring, _) = test_ring(32);
        let ids: Vec<_> = (0..3)
            .map(|i| activate(&ring, &format!("ingester-{i}")))
            .collect();

        let owners = ring.owners(b"some-key", 3);
        assert_eq!(owners.len(), 3);

        ring.set_state(&ids[0], MemberState::Leaving);
        let owners = ring.owners(b"some-key", 3);
        assert_eq!(owners.len(), 2);
        assert!(owners.iter().all(|m| m.id != ids[0]));
    }

    #[test]
    fn owners_skip_stale_heartbeats() {
        let (ring, time_provider) = test_ring(32);
        let a = activate(&ring, "a");
        activate(&ring, "b");

        time_provider.inc(Duration::from_secs(60));
        // only b heartbeats
        ring.heartbeat(&MemberId::new("b"));

        let owners = ring.owners(b"key", 2);
        assert_eq!(owners.len(), 1);
        assert_ne!(owners[0].id, a);
    }

    #[test]
    fn empty_ring_returns_no_owners() {
        let (ring, _) = test_ring(8);
        assert!(ring.owners(b"key", 3).is_empty());
    }

    #[test]
    fn stale_gossip_is_ignored() {
        let (ring, time_provider) = test_ring(4);
        let id = activate(&ring, "a");

        time_provider.inc(Duration::from_secs(5));
        let fresh = ring.heartbeat(&id).unwrap();

        // a record from before the heartbeat must not win
        let mut stale = fresh.clone();
        stale.heartbeat = Time::from_timestamp_nanos(0);
        stale.state = MemberState::Unhealthy;
        ring.apply(stale);

        assert_eq!(ring.member(&id).unwrap().state, MemberState::Active);
    }

    #[test]
    fn leadership_is_exclusive() {
        let (ring, _) = test_ring(32);
        let ids: Vec<_> = (0..4)
            .map(|i| activate(&ring, &format!("compactor-{i}")))
            .collect();

        let leaders: Vec<_> = ids
            .iter()
            .filter(|id| ring.is_leader(id, b"compaction-scheduler"))
            .collect();
        assert_eq!(leaders.len(), 1);
    }

    #[test]
    fn key_distribution_covers_members() {
        let (ring, _) = test_ring(64);
        for i in 0..4 {
            activate(&ring, &format!("ingester-{i}"));
        }

        let mut seen = std::collections::BTreeSet::new();
        for i in 0..256u32 {
            let key = format!("trace-{i}");
            for owner in ring.owners(key.as_bytes(), 2) {
                seen.insert(owner.id.as_str().to_string());
            }
        }
        assert_eq!(seen.len(), 4, "every member should own some keys");
    }
}
