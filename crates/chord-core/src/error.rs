// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Error kinds surfaced by ring operations.

/// Failures a caller of the node API can act on.
#[derive(Debug, thiserror::Error)]
pub enum ChordError {
    /// A peer could not be reached: dial failure, timeout, or a closed
    /// connection mid-exchange.
    #[error("transport failure: {0}")]
    Transport(anyhow::Error),

    /// Every lookup candidate failed; the target id could not be resolved.
    #[error("lookup failed: no candidate could resolve id {target}")]
    LookupFailed { target: u64 },

    /// No successor answered during stabilization.  The ring is
    /// unrecoverable from this node's vantage point.
    #[error("could not stabilize with any successor")]
    RingUnreachable,

    /// The holder answered but does not store the requested id.
    #[error("file not found: {message}")]
    FileNotFound { message: String },
}
