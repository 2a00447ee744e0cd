use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

use super::bitfield::Bitfield;
use super::coverage::Coverage;
use super::error::SchedulerError;
use super::subscription::{DownloadSubscription, UploadSubscription};
use super::ConnectionId;

/// Decides which block each connection should request next for one transfer.
///
/// A single scheduler is shared by every connection moving the same blocks.
/// All state sits behind one lock and no operation performs I/O while
/// holding it.
pub struct BlockScheduler {
    block_count: u64,
    state: Mutex<State>,
}

struct State {
    /// Blocks we hold.
    local: Coverage,
    local_blocks: u64,
    /// Blocks we are allowed to request.
    approved: Coverage,
    /// Coverage of every peer we download from.
    remote: BTreeMap<ConnectionId, Coverage>,
    /// Outstanding requests by block.
    inflight: BTreeMap<u64, Inflight>,
    /// Pending have announcements for every peer we upload to.
    subscribers: BTreeMap<ConnectionId, HaveQueue>,
}

struct Inflight {
    requesters: BTreeSet<ConnectionId>,
    requested_at: Instant,
}

struct HaveQueue {
    blocks: VecDeque<u64>,
    tick: UnboundedSender<ConnectionId>,
}

impl BlockScheduler {
    /// Creates a scheduler for `block_count` blocks, none held or approved.
    pub fn new(block_count: u64) -> Self {
        Self {
            block_count,
            state: Mutex::new(State {
                local: Coverage::none(block_count),
                local_blocks: 0,
                approved: Coverage::none(block_count),
                remote: BTreeMap::new(),
                inflight: BTreeMap::new(),
                subscribers: BTreeMap::new(),
            }),
        }
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Registers a peer we download from, together with the blocks it holds.
    ///
    /// The returned handle unsubscribes when dropped, releasing every
    /// outstanding request the connection made.
    pub fn subscribe_outgoing(
        self: &Arc<Self>,
        connection: ConnectionId,
        coverage: Coverage,
    ) -> Result<DownloadSubscription, SchedulerError> {
        if let Coverage::Partial(bits) = &coverage {
            if bits.len() != self.block_count {
                return Err(SchedulerError::CoverageLength {
                    expected: self.block_count,
                    actual: bits.len(),
                });
            }
        }

        let mut state = self.state.lock();
        if state.remote.contains_key(&connection) {
            return Err(SchedulerError::AlreadySubscribed(connection));
        }
        state.remote.insert(connection, coverage);
        drop(state);

        Ok(DownloadSubscription::new(Arc::clone(self), connection))
    }

    /// Registers a peer we upload to.
    ///
    /// Returns the handle together with a snapshot of the blocks we hold,
    /// which is what the peer is told in the slot grant. Whenever a have
    /// announcement is queued for the peer its connection id is sent on
    /// `tick`.
    pub fn subscribe_incoming(
        self: &Arc<Self>,
        connection: ConnectionId,
        tick: UnboundedSender<ConnectionId>,
    ) -> Result<(UploadSubscription, Coverage), SchedulerError> {
        let mut state = self.state.lock();
        if state.subscribers.contains_key(&connection) {
            return Err(SchedulerError::AlreadySubscribed(connection));
        }
        state.subscribers.insert(
            connection,
            HaveQueue {
                blocks: VecDeque::new(),
                tick,
            },
        );
        let snapshot = state.local.clone();
        drop(state);

        Ok((UploadSubscription::new(Arc::clone(self), connection), snapshot))
    }

    pub(super) fn unsubscribe_outgoing(&self, connection: ConnectionId) {
        let mut state = self.state.lock();
        state.remote.remove(&connection);
        state.inflight.retain(|_, entry| {
            entry.requesters.remove(&connection);
            !entry.requesters.is_empty()
        });
    }

    pub(super) fn unsubscribe_incoming(&self, connection: ConnectionId) {
        self.state.lock().subscribers.remove(&connection);
    }

    /// Records a block found locally, for example while scanning storage.
    ///
    /// No have announcements are queued. Returns true if the block is new.
    pub fn mark_local_complete(&self, block: u64) -> Result<bool, SchedulerError> {
        self.check_block(block)?;
        let mut state = self.state.lock();
        let added = state.set_local(block);
        state.inflight.remove(&block);
        Ok(added)
    }

    /// Records a block received from `connection` and verified.
    ///
    /// When the block is new it is queued as a have announcement for every
    /// other upload subscriber that is not already known to hold it.
    pub fn mark_local_complete_by(
        &self,
        connection: ConnectionId,
        block: u64,
    ) -> Result<bool, SchedulerError> {
        self.check_block(block)?;
        let mut state = self.state.lock();
        let state = &mut *state;

        let added = state.set_local(block);
        state.inflight.remove(&block);
        if !added {
            return Ok(false);
        }

        for (&subscriber, queue) in state.subscribers.iter_mut() {
            if subscriber == connection {
                continue;
            }
            let known = state
                .remote
                .get(&subscriber)
                .is_some_and(|coverage| coverage.has(block));
            if known {
                continue;
            }
            queue.blocks.push_back(block);
            trace!(%subscriber, block, "queued have");
            let _ = queue.tick.send(subscriber);
        }
        Ok(true)
    }

    /// Records that every block is held locally.
    pub fn mark_local_all(&self) {
        let mut state = self.state.lock();
        state.local = Coverage::Complete;
        state.local_blocks = self.block_count;
        state.inflight.clear();
    }

    /// Records that the peer on `connection` now holds `block`.
    pub fn mark_remote_complete(
        &self,
        connection: ConnectionId,
        block: u64,
    ) -> Result<(), SchedulerError> {
        self.check_block(block)?;
        let mut state = self.state.lock();
        let coverage = state
            .remote
            .get_mut(&connection)
            .ok_or(SchedulerError::NotSubscribed(connection))?;
        coverage.set(block);
        Ok(())
    }

    /// Allows `block` to be requested.
    pub fn approve_block(&self, block: u64) -> Result<(), SchedulerError> {
        self.check_block(block)?;
        self.state.lock().approved.set(block);
        Ok(())
    }

    /// Allows every block to be requested.
    pub fn approve_all(&self) {
        self.state.lock().approved = Coverage::Complete;
    }

    pub fn is_approved(&self, block: u64) -> bool {
        block < self.block_count && self.state.lock().approved.has(block)
    }

    /// Returns the next block `connection` should request, if any.
    ///
    /// Blocks are chosen rarest first among the approved blocks we lack and
    /// the connection holds, with rarity counted over every download peer.
    /// A block only one peer holds is taken immediately. When nothing new is
    /// left and the connection has no request outstanding, the least
    /// requested in-flight block it holds is requested again.
    ///
    /// Returns `None` if we are complete or the connection has not announced
    /// its coverage yet.
    pub fn next_request(&self, connection: ConnectionId) -> Option<u64> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Coverage::Partial(local) = &state.local else {
            return None;
        };
        let own = state.remote.get(&connection)?;

        if let Some(block) = find_rarest(local, &state.approved, own, &state.remote, &state.inflight)
        {
            let mut requesters = BTreeSet::new();
            requesters.insert(connection);
            state.inflight.insert(
                block,
                Inflight {
                    requesters,
                    requested_at: Instant::now(),
                },
            );
            return Some(block);
        }

        if state
            .inflight
            .values()
            .any(|entry| entry.requesters.contains(&connection))
        {
            return None;
        }

        let mut least: Option<(u64, usize)> = None;
        for (&block, entry) in &state.inflight {
            if !own.has(block) {
                continue;
            }
            let requests = entry.requesters.len();
            if requests == 1 {
                least = Some((block, requests));
                break;
            }
            if least.map_or(true, |(_, min)| requests < min) {
                least = Some((block, requests));
            }
        }

        let (block, _) = least?;
        if let Some(entry) = state.inflight.get_mut(&block) {
            entry.requesters.insert(connection);
        }
        trace!(%connection, block, "duplicate request");
        Some(block)
    }

    /// Clears the request bookkeeping of a block that has been verified.
    pub fn fulfill(&self, block: u64) {
        self.state.lock().inflight.remove(&block);
    }

    /// Makes `block` requestable again regardless of who requested it.
    pub fn force_rerequest(&self, block: u64) {
        if self.state.lock().inflight.remove(&block).is_some() {
            debug!(block, "forced re-request");
        }
    }

    /// Releases requests older than `timeout`, returning the released blocks.
    pub fn expire_requests(&self, timeout: Duration) -> Vec<u64> {
        let mut expired = Vec::new();
        self.state.lock().inflight.retain(|&block, entry| {
            let keep = entry.requested_at.elapsed() < timeout;
            if !keep {
                expired.push(block);
            }
            keep
        });
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired block requests");
        }
        expired
    }

    /// Returns the blocks `connection` has outstanding requests for.
    pub fn inflight_for(&self, connection: ConnectionId) -> Vec<u64> {
        self.state
            .lock()
            .inflight
            .iter()
            .filter(|(_, entry)| entry.requesters.contains(&connection))
            .map(|(&block, _)| block)
            .collect()
    }

    /// Pops the oldest pending have announcement for `connection`.
    pub fn next_have(&self, connection: ConnectionId) -> Option<u64> {
        self.state
            .lock()
            .subscribers
            .get_mut(&connection)?
            .blocks
            .pop_front()
    }

    pub fn have_block(&self, block: u64) -> bool {
        block < self.block_count && self.state.lock().local.has(block)
    }

    /// Returns true once every block is held.
    pub fn is_complete(&self) -> bool {
        self.state.lock().local.is_complete()
    }

    pub fn percent_complete(&self) -> u32 {
        let state = self.state.lock();
        if state.local.is_complete() {
            100
        } else {
            (state.local_blocks * 100 / self.block_count) as u32
        }
    }

    /// Snapshot of the blocks we hold.
    pub fn local_coverage(&self) -> Coverage {
        self.state.lock().local.clone()
    }

    /// Number of peers we download from.
    pub fn download_count(&self) -> usize {
        self.state.lock().remote.len()
    }

    /// Number of peers we upload to.
    pub fn upload_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    fn check_block(&self, block: u64) -> Result<(), SchedulerError> {
        if block >= self.block_count {
            return Err(SchedulerError::BlockOutOfRange {
                block,
                block_count: self.block_count,
            });
        }
        Ok(())
    }
}

impl State {
    fn set_local(&mut self, block: u64) -> bool {
        let added = self.local.set(block);
        if added {
            self.local_blocks += 1;
        }
        if self.local.is_complete() {
            self.inflight.clear();
        }
        added
    }
}

impl fmt::Debug for BlockScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockScheduler")
            .field("block_count", &self.block_count)
            .field("percent_complete", &self.percent_complete())
            .finish()
    }
}

fn find_rarest(
    local: &Bitfield,
    approved: &Coverage,
    own: &Coverage,
    remote: &BTreeMap<ConnectionId, Coverage>,
    inflight: &BTreeMap<u64, Inflight>,
) -> Option<u64> {
    let mut rarest: Option<(u64, usize)> = None;

    for block in local.missing() {
        if !approved.has(block) || !own.has(block) {
            continue;
        }
        if inflight.contains_key(&block) {
            continue;
        }

        let hosts = remote.values().filter(|c| c.has(block)).count();
        if hosts == 1 {
            return Some(block);
        }
        if rarest.map_or(true, |(_, min)| hosts < min) {
            rarest = Some((block, hosts));
        }
    }

    rarest.map(|(block, _)| block)
}
