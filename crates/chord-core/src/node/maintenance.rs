// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Periodic ring maintenance: stabilize, fix-fingers, check-predecessor,
//! and the file migration that predecessor adoption triggers.

use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::ChordError;
use crate::peer::NodeAddr;

use super::NodeHandle;

fn maintenance_interval(period: Duration) -> time::Interval {
    // No tick at t=0: the ring should settle between rounds, not be hit
    // the instant the node comes up.
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl NodeHandle {
    pub(super) fn spawn_maintenance(&self) {
        tokio::spawn(stabilize_loop(self.clone()));
        tokio::spawn(fix_fingers_loop(self.clone()));
        tokio::spawn(check_predecessor_loop(self.clone()));
    }

    /// One stabilization round: learn the first reachable successor's view,
    /// rebuild the successor list from it, and announce ourselves to the
    /// new first successor.
    pub(crate) async fn stabilize(&self) -> Result<(), ChordError> {
        let space = self.inner.space;
        let me = &self.inner.addr;
        let successors = { self.inner.state.lock().await.successors.clone() };

        for succ in &successors {
            let (their_successors, their_predecessor) =
                match self.inner.rpc.get_neighbors(succ).await {
                    Ok(reply) => reply,
                    Err(err) => {
                        warn!(peer = %succ, "stabilize: successor unreachable: {err:#}");
                        continue;
                    }
                };

            let mut rebuilt: Vec<NodeAddr> = Vec::with_capacity(self.inner.successor_count);
            if !their_predecessor.is_nil() {
                let pred_dist = space.ccw_distance(their_predecessor.id, me.id);
                let succ_dist = space.ccw_distance(succ.id, me.id);
                if pred_dist != 0 && pred_dist < succ_dist {
                    // the successor learned of a node between us and it
                    rebuilt.push(their_predecessor.clone());
                } else if succ.id == me.id {
                    // A node that still lists itself as successor must adopt
                    // the reported predecessor unconditionally; this is what
                    // lets two one-node rings merge.
                    rebuilt.push(their_predecessor.clone());
                }
            }
            rebuilt.push(succ.clone());
            for other in their_successors {
                if rebuilt.len() >= self.inner.successor_count {
                    break;
                }
                rebuilt.push(other);
            }

            {
                let mut state = self.inner.state.lock().await;
                state.successors = rebuilt.clone();
            }

            let first = rebuilt[0].clone();
            let _ = self.inner.rpc.notify(&first, me).await;
            return Ok(());
        }

        Err(ChordError::RingUnreachable)
    }

    /// Refresh one finger per round, cycling `1..=m`.
    pub(crate) async fn fix_fingers(&self) -> Result<(), ChordError> {
        let bits = self.inner.space.bits();
        let index = {
            let mut state = self.inner.state.lock().await;
            state.next_finger = if state.next_finger >= bits {
                1
            } else {
                state.next_finger + 1
            };
            state.next_finger
        };

        let target = self.inner.space.finger_target(self.inner.addr.id, index);
        let successor = self.find_successor(target).await?;

        let mut state = self.inner.state.lock().await;
        state.fingers[usize::from(index - 1)] = successor;
        Ok(())
    }

    /// Probe the predecessor and clear it if it stopped answering.  The
    /// probe runs without the lock; the clear re-checks that the
    /// predecessor is still the one that was probed.
    pub(crate) async fn check_predecessor(&self) {
        let predecessor = { self.inner.state.lock().await.predecessor.clone() };
        if predecessor.is_nil() {
            return;
        }
        if self.inner.rpc.health_check(&predecessor).await {
            return;
        }
        warn!(peer = %predecessor, "predecessor failed health check, clearing");
        let mut state = self.inner.state.lock().await;
        if state.predecessor == predecessor {
            state.predecessor = NodeAddr::nil();
        }
    }

    /// Inbound notify: adopt `candidate` if it is a closer predecessor,
    /// then hand over every file the new predecessor now owns.
    pub(crate) async fn handle_notify(&self, candidate: NodeAddr) {
        let space = self.inner.space;
        let adopted = {
            let mut state = self.inner.state.lock().await;
            let adopt = state.predecessor.is_nil()
                || space.is_closer_predecessor(
                    self.inner.addr.id,
                    state.predecessor.id,
                    candidate.id,
                );
            if adopt {
                state.predecessor = candidate.clone();
            }
            adopt
        };
        if adopted {
            debug!(predecessor = %candidate, "adopted new predecessor");
            self.migrate_files_to(&candidate).await;
        }
    }

    /// Ship every file whose rightful successor is now `target`.  Entries
    /// leave local storage before the transfer; a failed transfer is logged
    /// and not retried.
    async fn migrate_files_to(&self, target: &NodeAddr) {
        let space = self.inner.space;
        let my_id = self.inner.addr.id;
        let outbound = {
            let mut state = self.inner.state.lock().await;
            state.files.drain_matching(|id| {
                space.ccw_distance(my_id, id) > space.ccw_distance(target.id, id)
            })
        };
        for (id, file) in outbound {
            info!(file_id = id, name = %file.name, peer = %target, "migrating file to new predecessor");
            if !self
                .inner
                .rpc
                .store_file(target, id, &file.name, file.data)
                .await
            {
                warn!(file_id = id, peer = %target, "file migration failed");
            }
        }
    }
}

async fn stabilize_loop(node: NodeHandle) {
    let mut ticker = maintenance_interval(node.inner.stabilize_interval);
    loop {
        tokio::select! {
            _ = node.inner.cancel.cancelled() => {
                debug!("stabilize loop stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(err) = node.stabilize().await {
                    error!("no successor reachable, shutting down: {err}");
                    node.inner.cancel.cancel();
                    return;
                }
            }
        }
    }
}

async fn fix_fingers_loop(node: NodeHandle) {
    let mut ticker = maintenance_interval(node.inner.fix_fingers_interval);
    loop {
        tokio::select! {
            _ = node.inner.cancel.cancelled() => {
                debug!("fix-fingers loop stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(err) = node.fix_fingers().await {
                    error!("finger refresh failed, shutting down: {err}");
                    node.inner.cancel.cancel();
                    return;
                }
            }
        }
    }
}

async fn check_predecessor_loop(node: NodeHandle) {
    let mut ticker = maintenance_interval(node.inner.check_predecessor_interval);
    loop {
        tokio::select! {
            _ = node.inner.cancel.cancelled() => {
                debug!("check-predecessor loop stopped");
                return;
            }
            _ = ticker.tick() => {
                node.check_predecessor().await;
            }
        }
    }
}
