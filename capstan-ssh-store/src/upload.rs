//! Pushing a closure of store paths into the worker's store.

use std::collections::BTreeMap;

use tracing::debug;

use capstan_protocol::{Deserialize, ProtocolError, Serialize as _, ServeCommand, EXPORT_MAGIC};
use capstan_store_core::{reverse_topo_sort_paths, Store, StorePathSet, ValidPathInfo};

use crate::error::SessionError;
use crate::session::ServeConnection;

/// Copy the closure of `roots` from `store` into the worker's store,
/// dependencies first, skipping anything the worker already has.
///
/// Returns the number of paths transferred.
pub async fn send_closure(
    conn: &mut ServeConnection,
    store: &dyn Store,
    roots: &StorePathSet,
) -> Result<usize, SessionError> {
    let version = conn.remote_version();
    let closure = store.compute_fs_closure(roots).await?;
    if closure.is_empty() {
        return Ok(0);
    }

    // Ask the worker which of these it already has (locking them against
    // garbage collection, no substitution).
    ServeCommand::QueryValidPaths
        .serialize(&mut conn.to, version)
        .await?;
    true.serialize(&mut conn.to, version).await?;
    false.serialize(&mut conn.to, version).await?;
    closure.serialize(&mut conn.to, version).await?;
    conn.flush().await?;
    let valid: StorePathSet = <StorePathSet as Deserialize>::deserialize(&mut conn.from, version).await?;

    let mut infos = BTreeMap::new();
    for path in closure.difference(&valid) {
        let info = store
            .query_path_info(path)
            .await?
            .ok_or_else(|| capstan_store_core::StoreError::PathNotValid(path.to_string()))?;
        infos.insert(path.clone(), info);
    }
    if infos.is_empty() {
        return Ok(0);
    }

    let order = reverse_topo_sort_paths(&infos);
    debug!(
        missing = order.len(),
        total = closure.len(),
        "sending closure to worker"
    );

    if version.minor >= 5 {
        for path in &order {
            send_add_nar(conn, store, &infos[path]).await?;
        }
    } else {
        send_import(conn, store, &order, &infos).await?;
    }
    Ok(order.len())
}

/// Modern upload: one add-NAR record per path, each individually
/// acknowledged.
async fn send_add_nar(
    conn: &mut ServeConnection,
    store: &dyn Store,
    info: &ValidPathInfo,
) -> Result<(), SessionError> {
    let version = conn.remote_version();

    ServeCommand::AddToStoreNar
        .serialize(&mut conn.to, version)
        .await?;
    info.path.serialize(&mut conn.to, version).await?;
    match &info.deriver {
        Some(deriver) => deriver.serialize(&mut conn.to, version).await?,
        None => "".serialize(&mut conn.to, version).await?,
    }
    info.nar_hash.to_hex().serialize(&mut conn.to, version).await?;
    info.references.serialize(&mut conn.to, version).await?;
    0u64.serialize(&mut conn.to, version).await?; // registration time
    info.nar_size.serialize(&mut conn.to, version).await?;
    false.serialize(&mut conn.to, version).await?; // ultimate
    Vec::<String>::new().serialize(&mut conn.to, version).await?; // sigs
    match &info.content_address {
        Some(ca) => ca.serialize(&mut conn.to, version).await?,
        None => "".serialize(&mut conn.to, version).await?,
    }

    store.nar_from_path(&info.path, &mut conn.to).await?;
    conn.flush().await?;

    if u64::deserialize(&mut conn.from, version).await? != 1 {
        return Err(SessionError::UploadRejected {
            path: info.path.to_string(),
        });
    }
    Ok(())
}

/// Legacy upload for workers below serve minor 5: a single import stream
/// in export framing, acknowledged once at the end.
async fn send_import(
    conn: &mut ServeConnection,
    store: &dyn Store,
    order: &[capstan_store_core::StorePath],
    infos: &BTreeMap<capstan_store_core::StorePath, ValidPathInfo>,
) -> Result<(), SessionError> {
    let version = conn.remote_version();

    ServeCommand::ImportPaths
        .serialize(&mut conn.to, version)
        .await?;
    for path in order {
        let info = &infos[path];
        1u64.serialize(&mut conn.to, version).await?;
        store.nar_from_path(path, &mut conn.to).await?;
        EXPORT_MAGIC.serialize(&mut conn.to, version).await?;
        path.serialize(&mut conn.to, version).await?;
        info.references.serialize(&mut conn.to, version).await?;
        match &info.deriver {
            Some(deriver) => deriver.serialize(&mut conn.to, version).await?,
            None => "".serialize(&mut conn.to, version).await?,
        }
        0u64.serialize(&mut conn.to, version).await?; // no legacy signature
    }
    0u64.serialize(&mut conn.to, version).await?;
    conn.flush().await?;

    if u64::deserialize(&mut conn.from, version).await? != 1 {
        return Err(ProtocolError::Remote {
            message: "import stream rejected".to_string(),
        }
        .into());
    }
    Ok(())
}
