// ─────────────────────────────────────────────────────────────────────
// SCPN Flow Core — Rank Communication
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Message-passing abstraction between cooperating ranks.
//!
//! The [`Communicator`] trait mirrors the subset of MPI used by the
//! pressure subsystem: non-blocking sends, blocking and deferred
//! receives matched on `(source, tag)`, and a sum all-reduce. Two
//! transports are provided:
//!
//! - [`SelfComm`]: a single rank, every collective is a no-op.
//! - [`LocalComm`]: one endpoint per thread connected by channels, used
//!   by tests and by thread-parallel runs. Swapping in rsmpi means
//!   implementing the trait on an MPI communicator.
//!
//! Messages between a given pair of ranks with the same tag are
//! delivered in send order.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use flow_types::error::{FlowError, FlowResult};

/// Traffic classes. Distinct tags keep size announcements, index lists
/// and value exchanges from being confused with one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    HaloSize,
    HaloIndices,
    HaloValues,
    GhostCells,
    Reduce,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Count(usize),
    Indices(Vec<i64>),
    Values(Vec<f64>),
}

impl Payload {
    pub fn into_count(self, peer: usize) -> FlowResult<usize> {
        match self {
            Payload::Count(n) => Ok(n),
            other => Err(unexpected(peer, "Count", &other)),
        }
    }

    pub fn into_indices(self, peer: usize) -> FlowResult<Vec<i64>> {
        match self {
            Payload::Indices(v) => Ok(v),
            other => Err(unexpected(peer, "Indices", &other)),
        }
    }

    pub fn into_values(self, peer: usize) -> FlowResult<Vec<f64>> {
        match self {
            Payload::Values(v) => Ok(v),
            other => Err(unexpected(peer, "Values", &other)),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Payload::Count(_) => "Count",
            Payload::Indices(_) => "Indices",
            Payload::Values(_) => "Values",
        }
    }
}

fn unexpected(peer: usize, wanted: &str, got: &Payload) -> FlowError {
    FlowError::Communication {
        peer,
        message: format!("expected {wanted} payload, got {}", got.kind()),
    }
}

/// A receive that has been posted but not yet completed.
#[must_use = "a posted receive must be waited on"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvRequest {
    pub source: usize,
    pub tag: MessageTag,
}

impl RecvRequest {
    pub fn wait(self, comm: &dyn Communicator) -> FlowResult<Payload> {
        comm.recv(self.source, self.tag)
    }
}

/// Receives posted inside a collective and drained at its boundary.
///
/// Each request carries a caller-chosen key (usually the peer rank) that
/// is returned alongside its payload, in posting order.
#[derive(Debug, Default)]
pub struct RequestSet {
    pending: Vec<(usize, RecvRequest)>,
}

impl RequestSet {
    pub fn push(&mut self, key: usize, request: RecvRequest) {
        self.pending.push((key, request));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn wait_all(self, comm: &dyn Communicator) -> FlowResult<Vec<(usize, Payload)>> {
        self.pending
            .into_iter()
            .map(|(key, req)| req.wait(comm).map(|p| (key, p)))
            .collect()
    }
}

pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Non-blocking send. The transport owns the payload after the call.
    fn isend(&self, dest: usize, tag: MessageTag, payload: Payload) -> FlowResult<()>;

    /// Blocking receive of the next message from `source` with `tag`.
    fn recv(&self, source: usize, tag: MessageTag) -> FlowResult<Payload>;

    fn irecv(&self, source: usize, tag: MessageTag) -> RecvRequest {
        RecvRequest { source, tag }
    }

    /// Element-wise sum across all ranks, result on every rank.
    ///
    /// Contributions are added in rank order on rank 0, so every rank
    /// sees bit-identical results.
    fn all_reduce_sum(&self, values: &mut [f64]) -> FlowResult<()> {
        let size = self.size();
        if size <= 1 {
            return Ok(());
        }
        if self.rank() == 0 {
            for src in 1..size {
                let part = self.recv(src, MessageTag::Reduce)?.into_values(src)?;
                if part.len() != values.len() {
                    return Err(FlowError::Communication {
                        peer: src,
                        message: format!(
                            "reduce length mismatch: expected {}, got {}",
                            values.len(),
                            part.len()
                        ),
                    });
                }
                for (acc, v) in values.iter_mut().zip(part) {
                    *acc += v;
                }
            }
            for dest in 1..size {
                self.isend(dest, MessageTag::Reduce, Payload::Values(values.to_vec()))?;
            }
        } else {
            self.isend(0, MessageTag::Reduce, Payload::Values(values.to_vec()))?;
            let total = self.recv(0, MessageTag::Reduce)?.into_values(0)?;
            if total.len() != values.len() {
                return Err(FlowError::Communication {
                    peer: 0,
                    message: "reduce result length mismatch".to_string(),
                });
            }
            values.copy_from_slice(&total);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Envelope {
    source: usize,
    tag: MessageTag,
    payload: Payload,
}

/// Pop the first stashed envelope matching `(source, tag)`.
fn take_matching(
    stash: &RefCell<VecDeque<Envelope>>,
    source: usize,
    tag: MessageTag,
) -> Option<Payload> {
    let mut stash = stash.borrow_mut();
    let pos = stash
        .iter()
        .position(|e| e.source == source && e.tag == tag)?;
    stash.remove(pos).map(|e| e.payload)
}

/// Single-rank communicator. Self-sends are queued and can be received.
#[derive(Debug, Default)]
pub struct SelfComm {
    stash: RefCell<VecDeque<Envelope>>,
}

impl SelfComm {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn isend(&self, dest: usize, tag: MessageTag, payload: Payload) -> FlowResult<()> {
        if dest != 0 {
            return Err(FlowError::Communication {
                peer: dest,
                message: "SelfComm has a single rank".to_string(),
            });
        }
        self.stash.borrow_mut().push_back(Envelope {
            source: 0,
            tag,
            payload,
        });
        Ok(())
    }

    fn recv(&self, source: usize, tag: MessageTag) -> FlowResult<Payload> {
        take_matching(&self.stash, source, tag).ok_or_else(|| FlowError::Communication {
            peer: source,
            message: format!("no pending {tag:?} message on a single rank"),
        })
    }
}

/// Channel-backed endpoint of an in-process world of ranks.
///
/// Each endpoint is meant to be moved into its own thread. A receive
/// that waits longer than the configured timeout fails instead of
/// hanging, which turns a mismatched send/receive pattern into an error.
pub struct LocalComm {
    rank: usize,
    size: usize,
    outboxes: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    stash: RefCell<VecDeque<Envelope>>,
    timeout: Duration,
}

impl LocalComm {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

    /// Create `n` connected endpoints; endpoint `i` has rank `i`.
    pub fn world(n: usize) -> Vec<LocalComm> {
        Self::world_with_timeout(n, Self::DEFAULT_TIMEOUT)
    }

    pub fn world_with_timeout(n: usize, timeout: Duration) -> Vec<LocalComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..n).map(|_| channel()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalComm {
                rank,
                size: n,
                outboxes: senders.clone(),
                inbox,
                stash: RefCell::new(VecDeque::new()),
                timeout,
            })
            .collect()
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, dest: usize, tag: MessageTag, payload: Payload) -> FlowResult<()> {
        let outbox = self.outboxes.get(dest).ok_or_else(|| FlowError::Communication {
            peer: dest,
            message: format!("rank {dest} outside world of size {}", self.size),
        })?;
        log::trace!("rank {} -> {dest}: {tag:?} {}", self.rank, payload.kind());
        outbox
            .send(Envelope {
                source: self.rank,
                tag,
                payload,
            })
            .map_err(|_| FlowError::Communication {
                peer: dest,
                message: "peer endpoint dropped".to_string(),
            })
    }

    fn recv(&self, source: usize, tag: MessageTag) -> FlowResult<Payload> {
        if let Some(p) = take_matching(&self.stash, source, tag) {
            return Ok(p);
        }
        loop {
            match self.inbox.recv_timeout(self.timeout) {
                Ok(env) if env.source == source && env.tag == tag => return Ok(env.payload),
                Ok(env) => self.stash.borrow_mut().push_back(env),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(FlowError::Communication {
                        peer: source,
                        message: format!(
                            "rank {} timed out waiting for {tag:?} after {:?}",
                            self.rank, self.timeout
                        ),
                    })
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(FlowError::Communication {
                        peer: source,
                        message: "all senders dropped".to_string(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_self_comm_queues_self_messages() {
        let comm = SelfComm::new();
        comm.isend(0, MessageTag::HaloSize, Payload::Count(3))
            .expect("self send");
        let n = comm
            .recv(0, MessageTag::HaloSize)
            .and_then(|p| p.into_count(0))
            .expect("self recv");
        assert_eq!(n, 3);
        assert!(comm.recv(0, MessageTag::HaloSize).is_err());
    }

    #[test]
    fn test_self_comm_reduce_is_identity() {
        let comm = SelfComm::new();
        let mut v = [1.0, 2.0];
        comm.all_reduce_sum(&mut v).expect("reduce");
        assert_eq!(v, [1.0, 2.0]);
    }

    #[test]
    fn test_local_comm_matches_on_tag_out_of_order() {
        let world = LocalComm::world(2);
        thread::scope(|s| {
            for comm in world {
                s.spawn(move || {
                    if comm.rank() == 0 {
                        comm.isend(1, MessageTag::HaloIndices, Payload::Indices(vec![7, 9]))
                            .expect("send indices");
                        comm.isend(1, MessageTag::HaloSize, Payload::Count(2))
                            .expect("send size");
                    } else {
                        let n = comm
                            .recv(0, MessageTag::HaloSize)
                            .and_then(|p| p.into_count(0))
                            .expect("size first");
                        let idx = comm
                            .irecv(0, MessageTag::HaloIndices)
                            .wait(&comm)
                            .and_then(|p| p.into_indices(0))
                            .expect("indices");
                        assert_eq!(n, 2);
                        assert_eq!(idx, vec![7, 9]);
                    }
                });
            }
        });
    }

    #[test]
    fn test_local_comm_all_reduce_sums_ranks() {
        let world = LocalComm::world(4);
        thread::scope(|s| {
            for comm in world {
                s.spawn(move || {
                    let mut v = [comm.rank() as f64, 1.0];
                    comm.all_reduce_sum(&mut v).expect("reduce");
                    assert_eq!(v, [6.0, 4.0]);
                    // A second reduction must not pick up stale traffic.
                    let mut w = [2.0];
                    comm.all_reduce_sum(&mut w).expect("reduce again");
                    assert_eq!(w, [8.0]);
                });
            }
        });
    }

    #[test]
    fn test_request_set_preserves_posting_order() {
        let world = LocalComm::world(3);
        thread::scope(|s| {
            for comm in world {
                s.spawn(move || {
                    if comm.rank() == 0 {
                        let mut reqs = RequestSet::default();
                        reqs.push(2, comm.irecv(2, MessageTag::HaloValues));
                        reqs.push(1, comm.irecv(1, MessageTag::HaloValues));
                        assert_eq!(reqs.len(), 2);
                        let got = reqs.wait_all(&comm).expect("drain");
                        assert_eq!(got[0].0, 2);
                        assert_eq!(got[1].0, 1);
                        assert_eq!(got[0].1, Payload::Values(vec![2.0]));
                    } else {
                        let r = comm.rank() as f64;
                        comm.isend(0, MessageTag::HaloValues, Payload::Values(vec![r]))
                            .expect("send");
                    }
                });
            }
        });
    }

    #[test]
    fn test_local_comm_timeout_reports_error() {
        let world = LocalComm::world_with_timeout(2, Duration::from_millis(20));
        let err = world[0]
            .recv(1, MessageTag::HaloSize)
            .expect_err("nothing was sent");
        match err {
            FlowError::Communication { peer, message } => {
                assert_eq!(peer, 1);
                assert!(message.contains("timed out"));
            }
            other => panic!("Unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_payload_kind_mismatch() {
        let err = Payload::Count(1).into_values(3).expect_err("wrong kind");
        assert!(matches!(err, FlowError::Communication { peer: 3, .. }));
    }
}
