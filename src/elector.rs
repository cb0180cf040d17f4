//! Leader election.
//!
//! A rank-biased, epoch-numbered ballot: odd epochs are elections in
//! progress, even epochs are stable quorums. Every peer that hears a ballot
//! answers with its own `Propose` at that epoch; the lowest rank standing at
//! the timeout (or as soon as the whole map has answered) declares victory
//! and bumps the epoch to even. The monitor applies the returned outcome —
//! the elector never reaches back into it.

use std::rc::Rc;

use tracing::{debug, info};

use crate::messages::{Message, Propose, Victory};
use crate::monmap::{MonMap, Rank};
use crate::network::Messenger;

/// Give up and fall back to probing after this many barren rounds.
const MAX_DISPUTED_ROUNDS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Win { epoch: u64, quorum: Vec<Rank> },
    Lose { epoch: u64, leader: Rank, quorum: Vec<Rank> },
    /// A stale peer is trying to join a stable quorum; hold a fresh election
    /// to absorb it.
    StartElection,
    /// Too many disputed rounds; the monitor should re-probe.
    Reset,
}

pub struct Elector {
    rank: Rank,
    features: u64,
    epoch: u64,
    electing: bool,
    candidate: Rank,
    /// Ranks heard from at the current odd epoch, self included.
    participants: u64,
    expire_ms: u64,
    failed_rounds: u32,
}

impl Elector {
    pub fn new(rank: Rank, features: u64, persisted_epoch: u64) -> Elector {
        Elector {
            rank,
            features,
            epoch: persisted_epoch,
            electing: false,
            candidate: rank,
            participants: 0,
            expire_ms: 0,
            failed_rounds: 0,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn electing(&self) -> bool {
        self.electing
    }

    /// Called by the monitor when probing found enough peers, or to absorb a
    /// joiner into a running quorum.
    pub fn start(
        &mut self,
        now_ms: u64,
        timeout_ms: u64,
        monmap: &MonMap,
        net: &Rc<dyn Messenger>,
    ) -> Option<Outcome> {
        self.epoch = if self.epoch % 2 == 0 {
            self.epoch + 1
        } else {
            self.epoch + 2
        };
        self.electing = true;
        self.candidate = self.rank;
        self.participants = bit(self.rank);
        self.expire_ms = now_ms + timeout_ms;
        info!(epoch = self.epoch, "starting election");

        if monmap.size() == 1 {
            return Some(self.declare_victory(monmap, net));
        }
        self.broadcast_propose(monmap, net);
        None
    }

    pub fn handle_propose(
        &mut self,
        from: Rank,
        msg_epoch: u64,
        _features: u64,
        now_ms: u64,
        timeout_ms: u64,
        monmap: &MonMap,
        net: &Rc<dyn Messenger>,
    ) -> Option<Outcome> {
        if monmap.addr_of(from).is_none() {
            return None;
        }
        if msg_epoch < self.epoch {
            if !self.electing {
                // A peer with a stale epoch wants in.
                debug!(from, msg_epoch, "stale propose against stable quorum");
                return Some(Outcome::StartElection);
            }
            return None;
        }

        if msg_epoch > self.epoch {
            self.epoch = msg_epoch;
            self.electing = true;
            self.candidate = self.rank;
            self.participants = bit(self.rank);
            self.expire_ms = now_ms + timeout_ms;
            if from < self.rank {
                // They outrank us; defer.
                self.candidate = from;
                self.participants |= bit(from);
                net.send_mon(
                    from,
                    self.epoch,
                    Message::Propose(Propose {
                        features: self.features,
                    }),
                );
            } else {
                // We outrank them; contest the ballot at their epoch.
                self.participants |= bit(from);
                self.broadcast_propose(monmap, net);
            }
            return None;
        }

        // Same epoch: tally and tie-break by rank.
        self.participants |= bit(from);
        if from < self.candidate {
            self.candidate = from;
            if from < self.rank {
                net.send_mon(
                    from,
                    self.epoch,
                    Message::Propose(Propose {
                        features: self.features,
                    }),
                );
            }
        }
        if self.electing
            && self.candidate == self.rank
            && monmap.ranks().all(|r| self.participants & bit(r) != 0)
        {
            // Everyone has answered; no need to wait out the clock.
            return Some(self.declare_victory(monmap, net));
        }
        None
    }

    pub fn handle_victory(
        &mut self,
        from: Rank,
        msg_epoch: u64,
        victory: &Victory,
    ) -> Option<Outcome> {
        if msg_epoch < self.epoch || msg_epoch % 2 != 0 || victory.leader != from {
            return None;
        }
        self.epoch = msg_epoch;
        self.electing = false;
        self.failed_rounds = 0;
        info!(epoch = self.epoch, leader = victory.leader, "election lost");
        Some(Outcome::Lose {
            epoch: self.epoch,
            leader: victory.leader,
            quorum: victory.quorum.clone(),
        })
    }

    /// Drives the election timeout. No-op unless an election is running and
    /// its window has elapsed.
    pub fn tick(
        &mut self,
        now_ms: u64,
        timeout_ms: u64,
        monmap: &MonMap,
        net: &Rc<dyn Messenger>,
    ) -> Option<Outcome> {
        if !self.electing || now_ms < self.expire_ms {
            return None;
        }
        if self.candidate == self.rank
            && count(self.participants) >= monmap.majority()
        {
            return Some(self.declare_victory(monmap, net));
        }

        self.failed_rounds += 1;
        if self.failed_rounds >= MAX_DISPUTED_ROUNDS {
            debug!(rounds = self.failed_rounds, "election made no progress");
            self.electing = false;
            self.failed_rounds = 0;
            return Some(Outcome::Reset);
        }
        // The expected winner went quiet, or we lack a majority; run another
        // round.
        self.start(now_ms, timeout_ms, monmap, net)
    }

    fn declare_victory(&mut self, monmap: &MonMap, net: &Rc<dyn Messenger>) -> Outcome {
        self.epoch += 1;
        debug_assert_eq!(self.epoch % 2, 0);
        self.electing = false;
        self.failed_rounds = 0;
        let quorum: Vec<Rank> = monmap
            .ranks()
            .filter(|r| self.participants & bit(*r) != 0)
            .collect();
        info!(epoch = self.epoch, ?quorum, "election won");
        let msg = Message::Victory(Victory {
            leader: self.rank,
            quorum: quorum.clone(),
            features: self.features,
        });
        for r in &quorum {
            if *r != self.rank {
                net.send_mon(*r, self.epoch, msg.clone());
            }
        }
        Outcome::Win {
            epoch: self.epoch,
            quorum,
        }
    }

    fn broadcast_propose(&self, monmap: &MonMap, net: &Rc<dyn Messenger>) {
        for r in monmap.ranks() {
            if r != self.rank {
                net.send_mon(
                    r,
                    self.epoch,
                    Message::Propose(Propose {
                        features: self.features,
                    }),
                );
            }
        }
    }
}

fn bit(rank: Rank) -> u64 {
    1u64 << (rank as u64 & 63)
}

fn count(mask: u64) -> usize {
    mask.count_ones() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::CaptureMessenger;

    fn map(n: usize) -> MonMap {
        let members = (0..n)
            .map(|i| {
                (
                    format!("m{i}"),
                    format!("127.0.0.1:{}", 7000 + i).parse().unwrap(),
                )
            })
            .collect();
        MonMap::build(uuid::Uuid::from_u128(9), 0, 0, members)
    }

    #[test]
    fn single_peer_elects_itself_without_messages() {
        let (state, net) = CaptureMessenger::new();
        let mut e = Elector::new(0, 0, 0);
        let out = e.start(100, 1000, &map(1), &net);
        assert_eq!(
            out,
            Some(Outcome::Win {
                epoch: 2,
                quorum: vec![0]
            })
        );
        assert!(state.borrow().mons.is_empty());
    }

    #[test]
    fn lowest_rank_wins_at_timeout_with_majority() {
        let (state, net) = CaptureMessenger::new();
        let m = map(3);
        let mut e = Elector::new(0, 0, 0);
        assert_eq!(e.start(0, 1000, &m, &net), None);
        assert_eq!(state.borrow().mons.len(), 2);

        // Rank 1 answers the ballot; rank 2 stays silent.
        assert_eq!(e.handle_propose(1, 1, 0, 10, 1000, &m, &net), None);
        assert_eq!(e.tick(999, 1000, &m, &net), None);
        let out = e.tick(1000, 1000, &m, &net);
        assert_eq!(
            out,
            Some(Outcome::Win {
                epoch: 2,
                quorum: vec![0, 1]
            })
        );
    }

    #[test]
    fn full_participation_wins_immediately() {
        let (_, net) = CaptureMessenger::new();
        let m = map(3);
        let mut e = Elector::new(0, 0, 0);
        e.start(0, 1000, &m, &net);
        assert_eq!(e.handle_propose(1, 1, 0, 1, 1000, &m, &net), None);
        let out = e.handle_propose(2, 1, 0, 2, 1000, &m, &net);
        assert_eq!(
            out,
            Some(Outcome::Win {
                epoch: 2,
                quorum: vec![0, 1, 2]
            })
        );
    }

    #[test]
    fn higher_rank_defers_and_loses() {
        let (state, net) = CaptureMessenger::new();
        let m = map(3);
        let mut e = Elector::new(1, 0, 0);
        // Rank 0 opens a ballot at epoch 1.
        assert_eq!(e.handle_propose(0, 1, 0, 0, 1000, &m, &net), None);
        assert_eq!(e.epoch(), 1);
        assert!(e.electing());
        // The deferral went straight back to rank 0.
        assert_eq!(state.borrow().mons.len(), 1);
        assert_eq!(state.borrow().mons[0].0, 0);

        let v = Victory {
            leader: 0,
            quorum: vec![0, 1, 2],
            features: 0,
        };
        let out = e.handle_victory(0, 2, &v);
        assert_eq!(
            out,
            Some(Outcome::Lose {
                epoch: 2,
                leader: 0,
                quorum: vec![0, 1, 2]
            })
        );
        assert!(!e.electing());
    }

    #[test]
    fn split_vote_resolves_to_lower_rank() {
        let (_, net0) = CaptureMessenger::new();
        let (_, net1) = CaptureMessenger::new();
        let m = map(3);
        let mut a = Elector::new(0, 0, 2);
        let mut b = Elector::new(1, 0, 2);
        // Both start simultaneously at epoch 3.
        a.start(0, 1000, &m, &net0);
        b.start(0, 1000, &m, &net1);
        assert_eq!(a.epoch(), 3);
        assert_eq!(b.epoch(), 3);

        // Cross-delivery: B defers to A, A tallies B.
        assert_eq!(b.handle_propose(0, 3, 0, 1, 1000, &m, &net1), None);
        assert_eq!(a.handle_propose(1, 3, 0, 1, 1000, &m, &net0), None);

        let out = a.tick(1000, 1000, &m, &net0);
        assert_eq!(
            out,
            Some(Outcome::Win {
                epoch: 4,
                quorum: vec![0, 1]
            })
        );
        assert_eq!(
            b.handle_victory(
                0,
                4,
                &Victory {
                    leader: 0,
                    quorum: vec![0, 1],
                    features: 0
                }
            ),
            Some(Outcome::Lose {
                epoch: 4,
                leader: 0,
                quorum: vec![0, 1]
            })
        );
    }

    #[test]
    fn victory_with_wrong_parity_or_sender_ignored() {
        let (_, net) = CaptureMessenger::new();
        let m = map(3);
        let mut e = Elector::new(2, 0, 0);
        e.handle_propose(0, 1, 0, 0, 1000, &m, &net);
        let v = Victory {
            leader: 0,
            quorum: vec![0, 2],
            features: 0,
        };
        // Odd epoch.
        assert_eq!(e.handle_victory(0, 3, &v), None);
        // Claimed leader does not match the sender.
        assert_eq!(e.handle_victory(1, 2, &v), None);
    }

    #[test]
    fn stale_propose_against_stable_quorum_triggers_election() {
        let (_, net) = CaptureMessenger::new();
        let m = map(3);
        let mut e = Elector::new(0, 0, 6);
        assert!(!e.electing());
        let out = e.handle_propose(2, 3, 0, 0, 1000, &m, &net);
        assert_eq!(out, Some(Outcome::StartElection));
    }

    #[test]
    fn barren_rounds_reset_to_probing() {
        let (_, net) = CaptureMessenger::new();
        let m = map(3);
        let mut e = Elector::new(1, 0, 0);
        e.start(0, 1000, &m, &net);
        let mut now = 0;
        let mut out = None;
        for _ in 0..MAX_DISPUTED_ROUNDS {
            now += 1000;
            out = e.tick(now, 1000, &m, &net);
        }
        assert_eq!(out, Some(Outcome::Reset));
        assert!(!e.electing());
    }

    #[test]
    fn propose_from_unknown_rank_ignored() {
        let (state, net) = CaptureMessenger::new();
        let m = map(3);
        let mut e = Elector::new(0, 0, 0);
        assert_eq!(e.handle_propose(7, 1, 0, 0, 1000, &m, &net), None);
        assert!(state.borrow().mons.is_empty());
        assert!(!e.electing());
    }
}
