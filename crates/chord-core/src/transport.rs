// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Inbound side of the node protocol: envelope framing over a TCP stream,
//! per-method dispatch, and the cancel-aware accept loop.
//!
//! Every method a node exposes is request/reply, so the dispatcher maps
//! one inbound envelope to exactly one outbound envelope; there are no
//! one-way messages on this wire.

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::wire::{
    Envelope, FindSuccessorRequest, GetFileRequest, NotifyRequest, RpcFailure, StoreFileRequest,
    WirePayload, FLAG_ERROR, FLAG_RESPONSE, MAX_ENVELOPE_BYTES, MAX_ENVELOPE_PAYLOAD_BYTES,
};

/// Send one envelope: a 4-byte big-endian length prefix, then the CBOR
/// bytes.  Chord envelopes are small except for file payloads, so anything
/// over the cap is a protocol violation, not a legitimate message.
pub async fn write_envelope<S>(io: &mut S, envelope: &Envelope) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let encoded = envelope.encode()?;
    if encoded.len() > MAX_ENVELOPE_BYTES {
        anyhow::bail!("envelope exceeds max size");
    }
    let len = u32::try_from(encoded.len()).context("envelope length prefix")?;
    io.write_u32(len).await?;
    io.write_all(&encoded).await?;
    io.flush().await?;
    Ok(())
}

/// Receive one envelope.  The length prefix is checked against the cap
/// before the body is allocated, so a hostile peer cannot make the node
/// reserve an arbitrarily large buffer.
pub async fn read_envelope<S>(io: &mut S) -> anyhow::Result<Envelope>
where
    S: AsyncRead + Unpin,
{
    let len = io.read_u32().await? as usize;
    if len > MAX_ENVELOPE_BYTES {
        anyhow::bail!("frame of {len} bytes exceeds the envelope cap");
    }
    let mut encoded = vec![0u8; len];
    io.read_exact(&mut encoded).await?;
    Envelope::decode_with_limits(&encoded, MAX_ENVELOPE_BYTES, MAX_ENVELOPE_PAYLOAD_BYTES)
}

/// One handler per inbound method.  Handlers return the reply payload;
/// [`dispatch_envelope`] wraps it in an envelope correlated with the
/// request, so implementations never touch req_ids or flags.
#[async_trait]
pub trait RpcDispatcher {
    async fn on_health_check(&mut self) -> anyhow::Result<WirePayload>;
    async fn on_get_neighbors(&mut self) -> anyhow::Result<WirePayload>;
    async fn on_notify(&mut self, msg: NotifyRequest) -> anyhow::Result<WirePayload>;
    async fn on_find_successor(
        &mut self,
        msg: FindSuccessorRequest,
    ) -> anyhow::Result<WirePayload>;
    async fn on_store_file(&mut self, msg: StoreFileRequest) -> anyhow::Result<WirePayload>;
    async fn on_get_file(&mut self, msg: GetFileRequest) -> anyhow::Result<WirePayload>;
}

/// Route one inbound envelope to its handler and build the reply.  A
/// handler error becomes a [`FLAG_ERROR`] reply rather than tearing down
/// the connection; a malformed envelope is an error for the caller (the
/// message loop drops the connection).
pub async fn dispatch_envelope<D: RpcDispatcher + Send>(
    dispatcher: &mut D,
    envelope: Envelope,
) -> anyhow::Result<Envelope> {
    let req_id = envelope.req_id;
    let result = match envelope.decode_typed()? {
        WirePayload::HealthCheck(_) => dispatcher.on_health_check().await,
        WirePayload::GetNeighbors(_) => dispatcher.on_get_neighbors().await,
        WirePayload::Notify(msg) => dispatcher.on_notify(msg).await,
        WirePayload::FindSuccessor(msg) => dispatcher.on_find_successor(msg).await,
        WirePayload::StoreFile(msg) => dispatcher.on_store_file(msg).await,
        WirePayload::GetFile(msg) => dispatcher.on_get_file(msg).await,
        other => anyhow::bail!("message type {:?} is not a request", other.msg_type()),
    };
    match result {
        Ok(reply) => Envelope::from_typed(req_id, FLAG_RESPONSE, &reply),
        Err(err) => Envelope::from_typed(
            req_id,
            FLAG_RESPONSE | FLAG_ERROR,
            &WirePayload::RpcFailure(RpcFailure {
                message: format!("{err:#}"),
            }),
        ),
    }
}

/// Serve one connection: answer envelopes until the peer hangs up or
/// sends something unreadable.
pub async fn run_message_loop<S, D>(io: &mut S, dispatcher: &mut D) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: RpcDispatcher + Send,
{
    loop {
        let incoming = read_envelope(io).await?;
        let reply = dispatch_envelope(dispatcher, incoming).await?;
        write_envelope(io, &reply).await?;
    }
}

/// Accept loop for the node's RPC listener.  Every accepted connection gets
/// its own dispatcher clone and message-loop task; cancelling the token
/// closes the listener and unwinds every connection task.
pub async fn serve_rpc<D>(
    listener: TcpListener,
    dispatcher: D,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    D: RpcDispatcher + Clone + Send + 'static,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("rpc listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (mut stream, remote) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!("accept failed: {err:#}");
                        continue;
                    }
                };
                let mut dispatcher = dispatcher.clone();
                let conn_cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = conn_cancel.cancelled() => {}
                        result = run_message_loop(&mut stream, &mut dispatcher) => {
                            if let Err(err) = result {
                                // EOF from a peer that dialled per call lands here
                                debug!(%remote, "connection closed: {err:#}");
                            }
                        }
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{FileData, HealthCheckOk, MsgType, Neighbors, NotifyOk, StoreFileOk, SuccessorFound};
    use crate::NodeAddr;

    #[derive(Clone)]
    struct TestDispatcher;

    #[async_trait]
    impl RpcDispatcher for TestDispatcher {
        async fn on_health_check(&mut self) -> anyhow::Result<WirePayload> {
            Ok(WirePayload::HealthCheckOk(HealthCheckOk {}))
        }

        async fn on_get_neighbors(&mut self) -> anyhow::Result<WirePayload> {
            Ok(WirePayload::Neighbors(Neighbors {
                successors: vec![],
                predecessor: NodeAddr::nil(),
            }))
        }

        async fn on_notify(&mut self, _msg: NotifyRequest) -> anyhow::Result<WirePayload> {
            Ok(WirePayload::NotifyOk(NotifyOk {}))
        }

        async fn on_find_successor(
            &mut self,
            msg: FindSuccessorRequest,
        ) -> anyhow::Result<WirePayload> {
            Ok(WirePayload::SuccessorFound(SuccessorFound {
                addr: NodeAddr {
                    ip: "127.0.0.1".into(),
                    port: 7000,
                    id: msg.target,
                },
            }))
        }

        async fn on_store_file(&mut self, _msg: StoreFileRequest) -> anyhow::Result<WirePayload> {
            Ok(WirePayload::StoreFileOk(StoreFileOk {}))
        }

        async fn on_get_file(&mut self, _msg: GetFileRequest) -> anyhow::Result<WirePayload> {
            anyhow::bail!("store is offline")
        }
    }

    #[tokio::test]
    async fn message_loop_replies_with_request_correlation() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut dispatcher = TestDispatcher;
            let _ = run_message_loop(&mut server, &mut dispatcher).await;
        });

        let request = Envelope::from_typed(
            17,
            0,
            &WirePayload::FindSuccessor(FindSuccessorRequest { target: 9 }),
        )
        .expect("encode request");
        write_envelope(&mut client, &request).await.expect("send");

        let reply = read_envelope(&mut client).await.expect("reply");
        assert_eq!(reply.req_id, 17);
        assert_eq!(reply.flags & FLAG_RESPONSE, FLAG_RESPONSE);
        assert_eq!(reply.flags & FLAG_ERROR, 0);
        match reply.decode_typed().expect("typed reply") {
            WirePayload::SuccessorFound(found) => assert_eq!(found.addr.id, 9),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_error_becomes_error_reply() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut dispatcher = TestDispatcher;
            let _ = run_message_loop(&mut server, &mut dispatcher).await;
        });

        let request = Envelope::from_typed(5, 0, &WirePayload::GetFile(GetFileRequest { id: 1 }))
            .expect("encode request");
        write_envelope(&mut client, &request).await.expect("send");

        let reply = read_envelope(&mut client).await.expect("reply");
        assert_eq!(reply.req_id, 5);
        assert_eq!(reply.flags & FLAG_ERROR, FLAG_ERROR);
        match reply.decode_typed().expect("typed reply") {
            WirePayload::RpcFailure(failure) => {
                assert!(failure.message.contains("store is offline"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_request_is_acknowledged() {
        let mut dispatcher = TestDispatcher;
        let request = Envelope::from_typed(
            2,
            0,
            &WirePayload::Notify(NotifyRequest {
                candidate: NodeAddr::nil(),
            }),
        )
        .expect("encode");
        let reply = dispatch_envelope(&mut dispatcher, request)
            .await
            .expect("dispatch");
        assert_eq!(reply.req_id, 2);
        assert_eq!(reply.flags, FLAG_RESPONSE);
        match reply.decode_typed().expect("typed reply") {
            WirePayload::NotifyOk(_) => {}
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn reply_types_are_rejected_as_requests() {
        let mut dispatcher = TestDispatcher;
        let bogus = Envelope::from_typed(
            1,
            0,
            &WirePayload::FileData(FileData {
                data: vec![],
                error: None,
            }),
        )
        .expect("encode");
        assert!(dispatch_envelope(&mut dispatcher, bogus).await.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            // A length prefix far beyond the cap; no payload follows.
            server
                .write_u32(MAX_ENVELOPE_BYTES as u32 + 1)
                .await
                .expect("write prefix");
        });

        assert!(read_envelope(&mut client).await.is_err());
    }

    #[test]
    fn msg_type_values_are_stable() {
        // Wire compatibility: these constants are the protocol.
        assert_eq!(MsgType::HealthCheck as u16, 100);
        assert_eq!(MsgType::GetNeighbors as u16, 110);
        assert_eq!(MsgType::Notify as u16, 120);
        assert_eq!(MsgType::FindSuccessor as u16, 130);
        assert_eq!(MsgType::StoreFile as u16, 140);
        assert_eq!(MsgType::GetFile as u16, 150);
    }
}
