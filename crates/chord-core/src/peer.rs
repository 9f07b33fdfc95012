// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::fmt;

use serde::{Deserialize, Serialize};

/// Address of a ring member: where to dial it and where it sits on the ring.
///
/// The nil address (empty ip) stands for "no such node"; live nodes always
/// advertise a non-empty ip, which keeps the two distinguishable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    pub ip: String,
    pub port: u16,
    pub id: u64,
}

impl NodeAddr {
    pub fn nil() -> Self {
        Self {
            ip: String::new(),
            port: 0,
            id: 0,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.ip.is_empty()
    }

    /// Dialable `ip:port` form.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "<nil>")
        } else {
            write!(f, "{}@{}:{}", self.id, self.ip, self.port)
        }
    }
}
