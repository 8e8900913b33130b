//! Channel state machines: the data channels carrying BSON items and the
//! head-lookup request/response loop. Transport setup (TCP/WSS/TLS, auth)
//! belongs to the networking collaborator; these functions consume any
//! established byte stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context as _, Result};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Framed, FramedParts, FramedRead, LinesCodec};

use pdb_merge::{HeadLookupReq, MergeCandidate, MergeTree};
use pdb_storage::ReadOptions;
use pdb_types::{Item, Version};

use crate::codec::BsonItemCodec;
use crate::proto::{ControlMsg, DataRequest, StartFrom, MAX_HEAD_LOOKUP_LINE};

/// How a remote data channel behaves for one perspective.
#[derive(Debug, Clone)]
pub struct RemoteChannelConfig {
    pub perspective: String,
    /// Accept items from the peer into the perspective tree.
    pub import: bool,
    /// Send local items to the peer.
    pub export: bool,
    /// Read the peer's data request before sending ours.
    pub receive_before_send: bool,
}

/// Read one line-delimited control message without consuming bytes past the
/// newline, so the stream can be handed to a channel handler afterwards.
pub async fn read_control_line<S>(stream: &mut S) -> Result<ControlMsg>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            bail!("connection closed before a control message arrived");
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 4096 {
            bail!("control message exceeds 4096 bytes");
        }
    }
    Ok(serde_json::from_slice(&line)?)
}

/// Serve head lookups: LDJSON requests in (≤ 512 bytes each), one BSON item
/// (or an empty document) out per request.
pub async fn serve_head_lookup<S>(stream: S, mt: MergeTree) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = FramedRead::new(
        reader,
        LinesCodec::new_with_max_length(MAX_HEAD_LOOKUP_LINE),
    );
    while let Some(line) = lines.next().await {
        let line = line.context("reading head lookup request")?;
        let req: HeadLookupReq =
            serde_json::from_str(&line).context("parsing head lookup request")?;
        let reply = match mt.head_lookup(&req).await? {
            Some(item) => bson::to_vec(&item)?,
            None => bson::to_vec(&bson::Document::new())?,
        };
        writer.write_all(&reply).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Run one remote data channel: exchange data requests, then stream items
/// both ways until the peer hangs up or either direction fails.
pub async fn serve_remote_data_channel<S>(
    stream: S,
    mt: MergeTree,
    cfg: RemoteChannelConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = Framed::new(stream, LinesCodec::new_with_max_length(4096));

    let ours = DataRequest {
        start: if cfg.import {
            match mt.remote_tree(&cfg.perspective)?.last_version().await? {
                Some(v) => StartFrom::Offset(v),
                None => StartFrom::Send(true),
            }
        } else {
            StartFrom::Send(false)
        },
    };

    let theirs: DataRequest = if cfg.receive_before_send {
        let line = handshake
            .next()
            .await
            .context("peer hung up during handshake")??;
        handshake.send(serde_json::to_string(&ours)?).await?;
        serde_json::from_str(&line)?
    } else {
        handshake.send(serde_json::to_string(&ours)?).await?;
        let line = handshake
            .next()
            .await
            .context("peer hung up during handshake")??;
        serde_json::from_str(&line)?
    };
    tracing::debug!(pe = %cfg.perspective, ours = ?ours.start, theirs = ?theirs.start, "data channel negotiated");

    // Re-frame the connection for BSON, keeping bytes already buffered.
    let parts = handshake.into_parts();
    let mut bson_parts = FramedParts::new::<Item>(parts.io, BsonItemCodec);
    bson_parts.read_buf = parts.read_buf;
    let framed = Framed::from_parts(bson_parts);
    let (mut sink, mut incoming) = framed.split();

    let import = async {
        if cfg.import && ours.wants_data() {
            let mut writer = mt.remote_writer(&cfg.perspective)?;
            while let Some(item) = incoming.next().await {
                writer.write(item?).await?;
            }
        } else {
            // Nothing expected; drain to observe the peer's EOF.
            while let Some(item) = incoming.next().await {
                let _ = item?;
            }
        }
        anyhow::Ok(())
    };

    let export = async {
        if cfg.export && theirs.wants_data() {
            let since = match &theirs.start {
                StartFrom::Offset(v) => mt
                    .local_tree()
                    .get_by_version(v)
                    .await?
                    .and_then(|item| item.h.i),
                _ => None,
            };
            let mut items = Box::pin(mt.local_tree().read_stream(ReadOptions {
                since,
                tail: true,
                ..Default::default()
            }));
            while let Some(item) = items.next().await {
                sink.send(item?).await?;
            }
            anyhow::Ok(())
        } else {
            futures::future::pending().await
        }
    };

    tokio::select! {
        done = import => done,
        done = export => done,
    }
}

/// Run the local data channel: an external local writer on the far end.
/// Merge candidates flow out awaiting confirmation; incoming items are
/// either confirmations (matched by version) or locally-authored writes.
pub async fn serve_local_data_channel<S>(stream: S, mt: MergeTree) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let writer = mt.local_writer()?;
    let merges = mt.start_merge()?;
    let framed = Framed::new(stream, BsonItemCodec);
    let (mut sink, mut incoming) = framed.split();
    let pending: Arc<Mutex<HashMap<Version, MergeCandidate>>> = Arc::default();

    let emit = {
        let pending = pending.clone();
        async move {
            let mut merges = merges;
            while let Some(candidate) = merges.next().await {
                let candidate = candidate?;
                pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(candidate.item.h.v.clone(), candidate.clone());
                sink.send(candidate.item).await?;
            }
            anyhow::Ok(())
        }
    };

    let receive = async {
        while let Some(item) = incoming.next().await {
            let item = item?;
            let candidate = pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&item.h.v);
            match candidate {
                Some(candidate) => {
                    writer.confirm(&candidate).await?;
                }
                None => {
                    writer.write(item).await?;
                }
            }
        }
        anyhow::Ok(())
    };

    tokio::select! {
        done = receive => done,
        done = emit => done,
    }
}
