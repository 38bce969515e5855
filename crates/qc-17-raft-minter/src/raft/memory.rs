//! In-process raft log
//!
//! Serves single-node deployments and multi-node tests. Elections are
//! driven by command instead of timers, and a partitioned node neither
//! commits nor observes commits until it is healed.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use super::log::{EntryKind, LeaderState, RaftEntry, RaftLog, RaftLogError};

const FEED_BUFFER: usize = 256;

struct NodeSlot {
    leader_tx: watch::Sender<LeaderState>,
    commit_tx: watch::Sender<u64>,
}

struct Pending {
    from: u64,
    term: u64,
    kind: EntryKind,
    data: Vec<u8>,
    ack: oneshot::Sender<Result<u64, RaftLogError>>,
}

#[derive(Default)]
struct ClusterState {
    term: u64,
    leader: Option<u64>,
    log: Vec<RaftEntry>,
    nodes: BTreeMap<u64, NodeSlot>,
    partitioned: HashSet<u64>,
    pending: Vec<Pending>,
}

impl ClusterState {
    fn reachable(&self, id: u64) -> bool {
        self.nodes.contains_key(&id) && !self.partitioned.contains(&id)
    }

    fn leader_state(&self) -> LeaderState {
        LeaderState {
            leader: self.leader,
            term: self.term,
        }
    }

    fn append(&mut self, kind: EntryKind, data: Vec<u8>) -> u64 {
        let index = self.log.len() as u64 + 1;
        self.log.push(RaftEntry {
            term: self.term,
            index,
            kind,
            data,
        });
        for (id, slot) in &self.nodes {
            if !self.partitioned.contains(id) {
                slot.commit_tx.send_replace(index);
            }
        }
        index
    }

    fn can_commit(&self, from: u64) -> bool {
        match self.leader {
            Some(leader) => self.reachable(from) && self.reachable(leader),
            None => false,
        }
    }

    /// Commit or drop pending proposals after a topology or term change.
    fn settle_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for proposal in pending {
            if !self.reachable(proposal.from) {
                self.pending.push(proposal);
            } else if proposal.term < self.term {
                debug!(from = proposal.from, term = proposal.term, "[raft] dropping stale proposal");
                let _ = proposal.ack.send(Err(RaftLogError::Dropped));
            } else if self.can_commit(proposal.from) {
                let index = self.append(proposal.kind, proposal.data);
                let _ = proposal.ack.send(Ok(index));
            } else {
                self.pending.push(proposal);
            }
        }
    }
}

/// A simulated raft cluster shared by its [`LocalRaftNode`]s
#[derive(Clone, Default)]
pub struct InMemoryRaftCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryRaftCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single-node cluster whose only member is already leader
    pub fn single(id: u64) -> (Self, Arc<LocalRaftNode>) {
        let cluster = Self::new();
        let node = cluster.add_node(id);
        cluster.elect(id);
        (cluster, node)
    }

    /// Join a node; it starts at the current commit index
    pub fn add_node(&self, id: u64) -> Arc<LocalRaftNode> {
        let mut state = self.state.lock();
        let (leader_tx, leader_rx) = watch::channel(state.leader_state());
        let (commit_tx, commit_rx) = watch::channel(state.log.len() as u64);
        let stopped = Arc::new(AtomicBool::new(false));
        state.nodes.insert(
            id,
            NodeSlot {
                leader_tx,
                commit_tx,
            },
        );
        Arc::new(LocalRaftNode {
            id,
            cluster: Arc::clone(&self.state),
            leader_rx,
            commit_rx,
            stopped,
        })
    }

    /// Start a new term with `id` as leader
    pub fn elect(&self, id: u64) {
        let mut state = self.state.lock();
        state.term += 1;
        state.leader = Some(id);
        let leader = state.leader_state();
        for (node, slot) in &state.nodes {
            if !state.partitioned.contains(node) {
                slot.leader_tx.send_replace(leader);
            }
        }
        info!(leader = id, term = leader.term, "[raft] leader elected");
        state.settle_pending();
    }

    /// Cut `id` off from the rest of the cluster
    pub fn partition(&self, id: u64) {
        let mut state = self.state.lock();
        state.partitioned.insert(id);
        info!(node = id, "[raft] node partitioned");
    }

    /// Reconnect `id`; it catches up on leadership and commits
    pub fn heal(&self, id: u64) {
        let mut state = self.state.lock();
        if !state.partitioned.remove(&id) {
            return;
        }
        let leader = state.leader_state();
        let committed = state.log.len() as u64;
        if let Some(slot) = state.nodes.get(&id) {
            slot.leader_tx.send_replace(leader);
            slot.commit_tx.send_replace(committed);
        }
        info!(node = id, term = leader.term, "[raft] node healed");
        state.settle_pending();
    }

    /// Current term and leader
    pub fn leader_state(&self) -> LeaderState {
        self.state.lock().leader_state()
    }

    /// Number of committed entries
    pub fn committed_len(&self) -> u64 {
        self.state.lock().log.len() as u64
    }

    /// Proposals waiting for a quorum
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }
}

/// One member of an [`InMemoryRaftCluster`]
pub struct LocalRaftNode {
    id: u64,
    cluster: Arc<Mutex<ClusterState>>,
    leader_rx: watch::Receiver<LeaderState>,
    commit_rx: watch::Receiver<u64>,
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl RaftLog for LocalRaftNode {
    fn id(&self) -> u64 {
        self.id
    }

    async fn propose(&self, kind: EntryKind, data: Vec<u8>) -> Result<u64, RaftLogError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RaftLogError::Stopped);
        }
        let known = *self.leader_rx.borrow();
        let rx = {
            let mut state = self.cluster.lock();
            if known.leader.is_none() {
                return Err(RaftLogError::NotLeader { leader: None });
            }
            if state.can_commit(self.id) && known.term == state.term {
                return Ok(state.append(kind, data));
            }
            let (ack, rx) = oneshot::channel();
            state.pending.push(Pending {
                from: self.id,
                term: known.term,
                kind,
                data,
                ack,
            });
            rx
        };
        rx.await.unwrap_or(Err(RaftLogError::Stopped))
    }

    fn committed_from(&self, from: u64) -> mpsc::Receiver<RaftEntry> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let cluster = Arc::clone(&self.cluster);
        let mut commit_rx = self.commit_rx.clone();
        let stopped = Arc::clone(&self.stopped);
        tokio::spawn(async move {
            let mut next = from.max(1);
            loop {
                let visible = *commit_rx.borrow_and_update();
                while next <= visible {
                    let entry = cluster.lock().log.get((next - 1) as usize).cloned();
                    let Some(entry) = entry else { break };
                    if tx.send(entry).await.is_err() {
                        return;
                    }
                    next += 1;
                }
                if stopped.load(Ordering::SeqCst) || commit_rx.changed().await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    fn leader_watch(&self) -> watch::Receiver<LeaderState> {
        self.leader_rx.clone()
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.cluster.lock();
        let pending = std::mem::take(&mut state.pending);
        for proposal in pending {
            if proposal.from == self.id {
                let _ = proposal.ack.send(Err(RaftLogError::Stopped));
            } else {
                state.pending.push(proposal);
            }
        }
        if let Some(slot) = state.nodes.get(&self.id) {
            // Wake feed tasks so they observe the stop flag.
            slot.commit_tx.send_modify(|_| {});
            debug!(node = self.id, "[raft] node stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_entry(rx: &mut mpsc::Receiver<RaftEntry>) -> RaftEntry {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("feed closed")
    }

    #[tokio::test]
    async fn test_leader_proposal_commits_in_order() {
        let (_cluster, node) = InMemoryRaftCluster::single(1);
        let mut feed = node.committed_from(1);

        assert_eq!(node.propose(EntryKind::Normal, vec![1]).await.unwrap(), 1);
        assert_eq!(node.propose(EntryKind::ConfChange, vec![2]).await.unwrap(), 2);

        let first = next_entry(&mut feed).await;
        let second = next_entry(&mut feed).await;
        assert_eq!((first.index, first.data), (1, vec![1]));
        assert_eq!((second.index, second.kind), (2, EntryKind::ConfChange));
    }

    #[tokio::test]
    async fn test_feed_resumes_from_index() {
        let (_cluster, node) = InMemoryRaftCluster::single(1);
        for i in 0..3u8 {
            node.propose(EntryKind::Normal, vec![i]).await.unwrap();
        }
        let mut feed = node.committed_from(3);
        assert_eq!(next_entry(&mut feed).await.index, 3);
    }

    #[tokio::test]
    async fn test_no_leader_rejects() {
        let cluster = InMemoryRaftCluster::new();
        let node = cluster.add_node(1);
        assert_eq!(
            node.propose(EntryKind::Normal, vec![]).await,
            Err(RaftLogError::NotLeader { leader: None })
        );
    }

    #[tokio::test]
    async fn test_partitioned_proposal_dropped_after_new_term() {
        let cluster = InMemoryRaftCluster::new();
        let n1 = cluster.add_node(1);
        let n2 = cluster.add_node(2);
        cluster.elect(1);

        cluster.partition(1);
        let proposal = tokio::spawn({
            let n1 = Arc::clone(&n1);
            async move { n1.propose(EntryKind::Normal, vec![1]).await }
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cluster.pending_len(), 1);

        cluster.elect(2);
        // Partitioned node still believes in the old leader.
        assert_eq!(n1.leader_watch().borrow().leader, Some(1));
        assert_eq!(n2.propose(EntryKind::Normal, vec![2]).await.unwrap(), 1);

        cluster.heal(1);
        assert_eq!(proposal.await.unwrap(), Err(RaftLogError::Dropped));
        assert_eq!(n1.leader_watch().borrow().leader, Some(2));
        assert_eq!(cluster.committed_len(), 1);
    }

    #[tokio::test]
    async fn test_stop_rejects_proposals() {
        let (_cluster, node) = InMemoryRaftCluster::single(1);
        node.stop();
        node.stop();
        assert_eq!(
            node.propose(EntryKind::Normal, vec![]).await,
            Err(RaftLogError::Stopped)
        );
    }
}
