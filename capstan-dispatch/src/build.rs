//! Driving the build command over an established session.

use std::time::{SystemTime, UNIX_EPOCH};

use capstan_protocol::{
    BuildResult, BuildStatus, Deserialize, DrvOutput, Realisation, Serialize as _, ServeCommand,
};
use capstan_ssh_store::ServeConnection;
use capstan_store_core::{BasicDerivation, StorePath};

use crate::counters::{Counter, MaintainCount};
use crate::error::DispatchError;
use crate::options::BuildOptions;

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Issue the build command and read the worker's typed result.
///
/// Wall-clock start/stop are measured around the status read and replaced
/// by the worker's own round times when it reports a non-zero pair
/// (serve minor >= 3).
pub async fn perform_build(
    conn: &mut ServeConnection,
    drv_path: &StorePath,
    drv: &BasicDerivation,
    options: &BuildOptions,
    nr_steps_building: &Counter,
) -> Result<BuildResult, DispatchError> {
    let version = conn.remote_version();

    ServeCommand::BuildDerivation
        .serialize(&mut conn.to, version)
        .await?;
    drv_path.serialize(&mut conn.to, version).await?;
    drv.serialize(&mut conn.to, version).await?;
    options
        .max_silent_time
        .serialize(&mut conn.to, version)
        .await?;
    options
        .build_timeout
        .serialize(&mut conn.to, version)
        .await?;
    if conn.protocol_minor() >= 2 {
        options
            .max_log_size
            .serialize(&mut conn.to, version)
            .await?;
    }
    if conn.protocol_minor() >= 3 {
        options.repeats.serialize(&mut conn.to, version).await?;
        options
            .enforce_determinism
            .serialize(&mut conn.to, version)
            .await?;
    }
    if conn.protocol_minor() >= 7 {
        false.serialize(&mut conn.to, version).await?; // keep-failed
    }
    conn.flush().await?;

    let mut result = BuildResult {
        start_time: unix_time(),
        ..BuildResult::default()
    };
    {
        let _building = MaintainCount::new(nr_steps_building);
        result.status = BuildStatus::from(u64::deserialize(&mut conn.from, version).await?);
    }
    result.stop_time = unix_time();

    result.error_msg = String::deserialize(&mut conn.from, version).await?;
    if conn.protocol_minor() >= 3 {
        result.times_built = u64::deserialize(&mut conn.from, version).await?;
        result.is_non_deterministic = bool::deserialize(&mut conn.from, version).await?;
        let start = u64::deserialize(&mut conn.from, version).await?;
        let stop = u64::deserialize(&mut conn.from, version).await?;
        if start != 0 && stop != 0 {
            // The worker's times cover a single build round and are more
            // accurate than our wall clock around the whole exchange.
            result.start_time = start;
            result.stop_time = stop;
        }
    }
    if conn.protocol_minor() >= 6 {
        result.built_outputs =
            <std::collections::BTreeMap<DrvOutput, Realisation> as Deserialize>::deserialize(
                &mut conn.from,
                version,
            )
            .await?;
    }
    Ok(result)
}
