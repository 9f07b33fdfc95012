// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The Chord node: ring state under one lock, the lookup engine, the RPC
//! handlers, and bootstrap.
//!
//! Locking discipline: the state mutex is never held across an outbound
//! RPC.  Operations snapshot what they need, release, talk to the network,
//! then re-acquire to write back, tolerating whatever changed in between.

mod maintenance;

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::NodeConfig;
use crate::error::ChordError;
use crate::peer::NodeAddr;
use crate::ring::{self, RingSpace};
use crate::rpc::{DirectRequestTransport, RpcClient, TcpConnector};
use crate::store::{FileStore, StoredFile};
use crate::transport::{self, RpcDispatcher};
use crate::wire::{
    FileData, FindSuccessorRequest, GetFileRequest, HealthCheckOk, Neighbors, NotifyOk,
    NotifyRequest, StoreFileOk, StoreFileRequest, SuccessorFound, WirePayload,
};

/// Everything the maintenance loops and RPC handlers mutate, behind the
/// node's single mutex.
struct RingState {
    successors: Vec<NodeAddr>,
    predecessor: NodeAddr,
    /// `fingers[i]` covers `self.id + 2^i`; index 0 is finger 1.
    fingers: Vec<NodeAddr>,
    /// Round-robin cursor in `[1, m]`; 0 before the first fix-fingers tick.
    next_finger: u8,
    files: FileStore,
}

/// Point-in-time copy of the ring state, for inspection and tests.
#[derive(Debug, Clone)]
pub struct RingSnapshot {
    pub addr: NodeAddr,
    pub ring_bits: u8,
    pub successors: Vec<NodeAddr>,
    pub predecessor: NodeAddr,
    pub fingers: Vec<NodeAddr>,
    pub next_finger: u8,
    pub files: Vec<(u64, String)>,
}

struct NodeInner {
    addr: NodeAddr,
    space: RingSpace,
    successor_count: usize,
    stabilize_interval: Duration,
    fix_fingers_interval: Duration,
    check_predecessor_interval: Duration,
    state: Mutex<RingState>,
    rpc: RpcClient,
    cancel: CancellationToken,
}

/// Cloneable handle to a running node.  Dropping handles does not stop the
/// node; cancellation does.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

impl NodeHandle {
    /// Bind the listener, derive the identifier, join an existing ring if
    /// configured, and start the RPC service plus the maintenance loops.
    pub async fn start(config: NodeConfig) -> anyhow::Result<NodeHandle> {
        config.validate()?;
        let space = RingSpace::new(config.ring_bits)?;

        let listener = TcpListener::bind((config.bind_ip.as_str(), config.port))
            .await
            .with_context(|| {
                format!("bind rpc listener on {}:{}", config.bind_ip, config.port)
            })?;
        let port = listener
            .local_addr()
            .context("read bound listener address")?
            .port();

        let digest = config
            .id_digest
            .unwrap_or_else(|| ring::endpoint_digest(&config.bind_ip, port));
        let id = space.reduce_digest(&digest);
        let addr = NodeAddr {
            ip: config.bind_ip.clone(),
            port,
            id,
        };

        // A fresh ring: everything points at the node itself.
        let state = RingState {
            successors: vec![addr.clone(); config.successor_count],
            predecessor: NodeAddr::nil(),
            fingers: vec![addr.clone(); usize::from(space.bits())],
            next_finger: 0,
            files: FileStore::new(),
        };

        let rpc = RpcClient::new(Arc::new(DirectRequestTransport::new(TcpConnector)));
        let handle = NodeHandle {
            inner: Arc::new(NodeInner {
                addr: addr.clone(),
                space,
                successor_count: config.successor_count,
                stabilize_interval: config.stabilize_interval,
                fix_fingers_interval: config.fix_fingers_interval,
                check_predecessor_interval: config.check_predecessor_interval,
                state: Mutex::new(state),
                rpc,
                cancel: CancellationToken::new(),
            }),
        };

        if let Some((join_ip, join_port)) = &config.join {
            // Only the endpoint matters for the bootstrap call; the member's
            // own id is never read on this path.
            let known = NodeAddr {
                ip: join_ip.clone(),
                port: *join_port,
                id: 0,
            };
            let successor = handle
                .inner
                .rpc
                .find_successor(&known, id)
                .await
                .with_context(|| format!("join ring via {}", known.endpoint()))?;
            let mut state = handle.inner.state.lock().await;
            for slot in state.successors.iter_mut() {
                *slot = successor.clone();
            }
            drop(state);
            info!(node = %addr, successor = %successor, "joined ring");
        } else {
            info!(node = %addr, "created ring");
        }

        {
            let dispatcher = handle.clone();
            let cancel = handle.inner.cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = transport::serve_rpc(listener, dispatcher, cancel).await {
                    error!("rpc listener failed: {err:#}");
                }
            });
        }
        handle.spawn_maintenance();

        Ok(handle)
    }

    pub fn addr(&self) -> &NodeAddr {
        &self.inner.addr
    }

    pub fn id(&self) -> u64 {
        self.inner.addr.id
    }

    /// Token observed by the listener and every maintenance loop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    pub async fn snapshot(&self) -> RingSnapshot {
        let state = self.inner.state.lock().await;
        RingSnapshot {
            addr: self.inner.addr.clone(),
            ring_bits: self.inner.space.bits(),
            successors: state.successors.clone(),
            predecessor: state.predecessor.clone(),
            fingers: state.fingers.clone(),
            next_finger: state.next_finger,
            files: state.files.manifest(),
        }
    }

    /// Resolve the ring member responsible for `target`.
    ///
    /// First checks whether `target` falls on the arc between this node and
    /// one of its successors; otherwise forwards to the closest preceding
    /// candidate that answers.  Unreachable candidates are skipped, not
    /// fatal.
    pub async fn find_successor(&self, target: u64) -> Result<NodeAddr, ChordError> {
        let space = self.inner.space;
        let me = &self.inner.addr;
        let (successors, candidates) = {
            let state = self.inner.state.lock().await;
            (
                state.successors.clone(),
                self.closest_preceding_nodes(&state, target),
            )
        };

        for succ in &successors {
            // target on (self, succ]; equality at self routes to the first
            // successor, which keeps a single-node ring pointing at itself
            if space.ccw_distance(target, me.id) <= space.ccw_distance(succ.id, me.id) {
                return Ok(succ.clone());
            }
        }

        for candidate in candidates {
            if candidate == *me {
                return Ok(candidate);
            }
            match self.inner.rpc.find_successor(&candidate, target).await {
                Ok(found) => return Ok(found),
                Err(err) => {
                    debug!(peer = %candidate, "find_successor hop failed: {err:#}");
                }
            }
        }
        Err(ChordError::LookupFailed { target })
    }

    /// Candidates for routing a lookup of `target`: this node, the finger
    /// table, and the successor list, closest clockwise-preceding first.
    fn closest_preceding_nodes(&self, state: &RingState, target: u64) -> Vec<NodeAddr> {
        let space = self.inner.space;
        let mut nodes = Vec::with_capacity(1 + state.fingers.len() + state.successors.len());
        nodes.push(self.inner.addr.clone());
        nodes.extend(state.fingers.iter().rev().cloned());
        nodes.extend(state.successors.iter().cloned());
        nodes.sort_by_key(|node| Reverse(space.ccw_distance(node.id, target)));
        nodes.dedup();
        nodes
    }

    /// Hash `filename` into the ring and resolve its holder.
    pub async fn lookup(&self, filename: &str) -> Result<(NodeAddr, u64), ChordError> {
        let id = self
            .inner
            .space
            .reduce_digest(&ring::filename_digest(filename));
        let holder = self.find_successor(id).await?;
        Ok((holder, id))
    }

    /// Resolve the holder for `filename` and ship `data` to it.
    pub async fn publish_file(
        &self,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<(NodeAddr, u64), ChordError> {
        let (holder, id) = self.lookup(filename).await?;
        if self
            .inner
            .rpc
            .store_file(&holder, id, filename, data)
            .await
        {
            Ok((holder, id))
        } else {
            Err(ChordError::Transport(anyhow::anyhow!(
                "store_file to {holder} failed"
            )))
        }
    }

    /// Resolve the holder for `filename` and fetch its bytes.
    pub async fn fetch_file(
        &self,
        filename: &str,
    ) -> Result<(NodeAddr, u64, Vec<u8>), ChordError> {
        let (holder, id) = self.lookup(filename).await?;
        let reply = self
            .inner
            .rpc
            .get_file(&holder, id)
            .await
            .map_err(ChordError::Transport)?;
        match reply.error {
            Some(message) if !message.is_empty() => Err(ChordError::FileNotFound { message }),
            _ => Ok((holder, id, reply.data)),
        }
    }

    fn file_miss_reply() -> FileData {
        FileData {
            data: Vec::new(),
            error: Some("file does not exist in the ring".into()),
        }
    }
}

#[async_trait]
impl RpcDispatcher for NodeHandle {
    async fn on_health_check(&mut self) -> anyhow::Result<WirePayload> {
        Ok(WirePayload::HealthCheckOk(HealthCheckOk {}))
    }

    async fn on_get_neighbors(&mut self) -> anyhow::Result<WirePayload> {
        let state = self.inner.state.lock().await;
        Ok(WirePayload::Neighbors(Neighbors {
            successors: state.successors.clone(),
            predecessor: state.predecessor.clone(),
        }))
    }

    async fn on_notify(&mut self, msg: NotifyRequest) -> anyhow::Result<WirePayload> {
        self.handle_notify(msg.candidate).await;
        Ok(WirePayload::NotifyOk(NotifyOk {}))
    }

    async fn on_find_successor(
        &mut self,
        msg: FindSuccessorRequest,
    ) -> anyhow::Result<WirePayload> {
        let addr = self.find_successor(msg.target).await?;
        Ok(WirePayload::SuccessorFound(SuccessorFound { addr }))
    }

    async fn on_store_file(&mut self, msg: StoreFileRequest) -> anyhow::Result<WirePayload> {
        let mut state = self.inner.state.lock().await;
        state.files.insert(
            msg.id,
            StoredFile {
                name: msg.name,
                data: msg.data,
            },
        );
        Ok(WirePayload::StoreFileOk(StoreFileOk {}))
    }

    async fn on_get_file(&mut self, msg: GetFileRequest) -> anyhow::Result<WirePayload> {
        let state = self.inner.state.lock().await;
        let reply = match state.files.get(msg.id) {
            Some(file) => FileData {
                data: file.data.clone(),
                error: None,
            },
            None => Self::file_miss_reply(),
        };
        Ok(WirePayload::FileData(reply))
    }
}
