// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::time::Duration;

use crate::ring::MAX_RING_BITS;

pub const MAX_SUCCESSOR_COUNT: usize = 32;
pub const MAX_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(60_000);

/// Static configuration for one node.
///
/// `bind_ip` doubles as the advertised address, so it must be reachable by
/// peers.  `port` 0 binds an ephemeral port; the advertised address picks up
/// whatever the listener actually bound.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_ip: String,
    pub port: u16,
    /// Ring exponent m; the identifier space is `[0, 2^m)`.
    pub ring_bits: u8,
    /// Successor-list length R.
    pub successor_count: usize,
    pub stabilize_interval: Duration,
    pub fix_fingers_interval: Duration,
    pub check_predecessor_interval: Duration,
    /// `(ip, port)` of an existing ring member to join; `None` creates a
    /// new ring.
    pub join: Option<(String, u16)>,
    /// Pre-computed 160-bit identifier digest, overriding the hash of the
    /// advertised endpoint.
    pub id_digest: Option<[u8; 20]>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_ip: "127.0.0.1".into(),
            port: 0,
            ring_bits: MAX_RING_BITS,
            successor_count: 4,
            stabilize_interval: Duration::from_millis(500),
            fix_fingers_interval: Duration::from_millis(300),
            check_predecessor_interval: Duration::from_millis(500),
            join: None,
            id_digest: None,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_ip.is_empty() {
            anyhow::bail!("bind address must not be empty");
        }
        if self.ring_bits == 0 || self.ring_bits > MAX_RING_BITS {
            anyhow::bail!(
                "ring bits must be in [1, {}], got {}",
                MAX_RING_BITS,
                self.ring_bits
            );
        }
        if self.successor_count == 0 || self.successor_count > MAX_SUCCESSOR_COUNT {
            anyhow::bail!(
                "successor count must be in [1, {}], got {}",
                MAX_SUCCESSOR_COUNT,
                self.successor_count
            );
        }
        for (name, interval) in [
            ("stabilize", self.stabilize_interval),
            ("fix-fingers", self.fix_fingers_interval),
            ("check-predecessor", self.check_predecessor_interval),
        ] {
            if interval.is_zero() || interval > MAX_MAINTENANCE_INTERVAL {
                anyhow::bail!(
                    "{name} interval must be in [1ms, {}ms], got {}ms",
                    MAX_MAINTENANCE_INTERVAL.as_millis(),
                    interval.as_millis()
                );
            }
        }
        if let Some((join_ip, _)) = &self.join {
            if join_ip.is_empty() {
                anyhow::bail!("join address must not be empty");
            }
        }
        Ok(())
    }
}
