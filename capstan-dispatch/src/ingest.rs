//! Retrieving and ingesting the outputs of a finished build.
//!
//! Phase 1 queries path metadata for the declared outputs; phase 2 streams
//! each NAR into the destination store, dependencies first, while a
//! [`NarExtractor`] shadows the stream into the shared member collection.

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use capstan_nar::{NarExtractor, NarMemberMap};
use capstan_protocol::{Deserialize, ProtocolError, Serialize as _, ServeCommand};
use capstan_ssh_store::ServeConnection;
use capstan_store_core::{
    reverse_topo_sort_paths, Hash, Store, StorePath, StorePathSet, ValidPathInfo,
};

use crate::error::DispatchError;

/// Ask the worker for metadata about the declared outputs.
///
/// Returns the per-path infos plus the summed NAR size, so the caller can
/// enforce its output-size ceiling before any body is transferred.
pub async fn query_path_infos(
    conn: &mut ServeConnection,
    outputs: &StorePathSet,
) -> Result<(BTreeMap<StorePath, ValidPathInfo>, u64), DispatchError> {
    let version = conn.remote_version();

    ServeCommand::QueryPathInfos
        .serialize(&mut conn.to, version)
        .await?;
    outputs.serialize(&mut conn.to, version).await?;
    conn.flush().await?;

    let mut infos = BTreeMap::new();
    let mut total_nar_size = 0u64;
    loop {
        let printed = String::deserialize(&mut conn.from, version).await?;
        if printed.is_empty() {
            break;
        }
        let path = StorePath::new(printed);
        let deriver = String::deserialize(&mut conn.from, version).await?;
        let references: StorePathSet =
            <StorePathSet as Deserialize>::deserialize(&mut conn.from, version).await?;
        let _download_size = u64::deserialize(&mut conn.from, version).await?;
        let nar_size = u64::deserialize(&mut conn.from, version).await?;
        let nar_hash = Hash::parse(&String::deserialize(&mut conn.from, version).await?)
            .map_err(|e| ProtocolError::malformed("nar hash", e))?;
        let ca = String::deserialize(&mut conn.from, version).await?;
        let _sigs: Vec<String> =
            <Vec<String> as Deserialize>::deserialize(&mut conn.from, version).await?;

        if !outputs.contains(&path) {
            return Err(DispatchError::UnexpectedPathInfo {
                path: path.to_string(),
            });
        }

        total_nar_size += nar_size;
        let mut info = ValidPathInfo::new(path.clone(), nar_hash);
        info.references = references;
        info.nar_size = nar_size;
        info.content_address = (!ca.is_empty()).then_some(ca);
        if !deriver.is_empty() {
            info.deriver = Some(StorePath::new(deriver));
        }
        infos.insert(path, info);
    }
    Ok((infos, total_nar_size))
}

enum IngestState {
    Sending { pos: usize },
    Flushing,
    Reading,
}

/// A lazy, teeing NAR source.
///
/// Nothing is transmitted until the destination store actually reads: the
/// first `poll_read` writes the dump command, so a store that finds the
/// path already valid costs no traffic at all. Every byte handed to the
/// store is also pushed through the extractor, which doubles as the
/// end-of-archive detector inside the longer session stream.
struct IngestSource<'a, R, W> {
    from: &'a mut R,
    to: &'a mut W,
    command: Vec<u8>,
    state: IngestState,
    extractor: NarExtractor,
    started: bool,
}

impl<'a, R, W> IngestSource<'a, R, W> {
    fn new(from: &'a mut R, to: &'a mut W, command: Vec<u8>, extractor: NarExtractor) -> Self {
        Self {
            from,
            to,
            command,
            state: IngestState::Sending { pos: 0 },
            extractor,
            started: false,
        }
    }

    fn started(&self) -> bool {
        self.started
    }

    fn complete(&self) -> bool {
        self.extractor.is_complete()
    }
}

impl<R, W> AsyncRead for IngestSource<'_, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.state {
                IngestState::Sending { ref mut pos } => {
                    this.started = true;
                    while *pos < this.command.len() {
                        let n = ready!(
                            Pin::new(&mut *this.to).poll_write(cx, &this.command[*pos..])
                        )?;
                        if n == 0 {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "session write side closed",
                            )));
                        }
                        *pos += n;
                    }
                    this.state = IngestState::Flushing;
                }
                IngestState::Flushing => {
                    ready!(Pin::new(&mut *this.to).poll_flush(cx))?;
                    this.state = IngestState::Reading;
                }
                IngestState::Reading => {
                    if this.extractor.is_complete() {
                        return Poll::Ready(Ok(()));
                    }
                    let before = buf.filled().len();
                    ready!(Pin::new(&mut *this.from).poll_read(cx, buf))?;
                    let new_bytes = &buf.filled()[before..];
                    if new_bytes.is_empty() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "NAR stream ended early",
                        )));
                    }
                    let consumed = this
                        .extractor
                        .push(new_bytes)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    if consumed < new_bytes.len() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "data past the end of the NAR",
                        )));
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

/// Stream one output from the worker into the destination store.
async fn copy_path_from_remote(
    conn: &mut ServeConnection,
    dest_store: &dyn Store,
    info: &ValidPathInfo,
    nar_members: &NarMemberMap,
) -> Result<(), DispatchError> {
    let version = conn.remote_version();

    let mut command = Vec::new();
    ServeCommand::DumpStorePath
        .serialize(&mut command, version)
        .await?;
    info.path.serialize(&mut command, version).await?;

    let extractor = NarExtractor::new(info.path.clone(), nar_members.clone());
    let mut source = IngestSource::new(&mut conn.from, &mut conn.to, command, extractor);
    dest_store.add_to_store(info, &mut source).await?;

    if source.started() && !source.complete() {
        return Err(ProtocolError::malformed(
            "NAR ingest",
            format!("destination store stopped mid-archive for '{}'", info.path),
        )
        .into());
    }
    Ok(())
}

/// Stream all outputs, dependencies first.
pub async fn copy_paths_from_remote(
    conn: &mut ServeConnection,
    dest_store: &dyn Store,
    infos: &BTreeMap<StorePath, ValidPathInfo>,
    nar_members: &NarMemberMap,
) -> Result<(), DispatchError> {
    for path in reverse_topo_sort_paths(infos) {
        copy_path_from_remote(conn, dest_store, &infos[&path], nar_members).await?;
    }
    Ok(())
}
