//! Resolving a step's inputs and moving them to where the build runs.

use std::time::Instant;

use tracing::debug;

use capstan_ssh_store::{send_closure, ServeConnection};
use capstan_store_core::{copy_paths, BasicDerivation, Store};

use crate::counters::{DispatchCounters, MaintainCount};
use crate::error::DispatchError;
use crate::machine::Machine;
use crate::step::Step;

/// Resolve the step's derivation inputs to concrete store paths and make
/// the input closure available to the worker.
///
/// For a localhost worker the inputs are copied *into* the local store
/// (the builder reads the destination store directly); otherwise they are
/// pushed from the destination store through the session. Copy wall-clock
/// is added to `overhead_ms`.
#[allow(clippy::too_many_arguments)]
pub async fn send_inputs(
    local_store: &dyn Store,
    dest_store: &dyn Store,
    conn: &mut ServeConnection,
    machine: &Machine,
    step: &Step,
    counters: &DispatchCounters,
    overhead_ms: &mut u64,
) -> Result<BasicDerivation, DispatchError> {
    let mut basic = step.drv.to_basic();
    for (input_drv, output_names) in &step.drv.input_drvs {
        let input = local_store.read_derivation(input_drv).await?;
        for name in output_names {
            if let Some(output) = input.outputs.get(name) {
                if let Some(path) = &output.path {
                    basic.input_srcs.insert(path.clone());
                }
            }
        }
    }

    let waiting = MaintainCount::new(&counters.nr_steps_waiting);

    // Ensure the inputs exist in the destination store. A no-op when both
    // URIs name the same store; for a separate destination (e.g. a binary
    // cache) this uploads them first.
    if local_store.uri() != dest_store.uri() {
        let closure = local_store.compute_fs_closure(&step.drv.input_srcs).await?;
        copy_paths(local_store, dest_store, &closure).await?;
    }

    drop(waiting);
    let _copying = MaintainCount::new(&counters.nr_steps_copying_to);

    debug!(drv = %step.drv_path, machine = %machine.ssh_name, "sending input closure");
    let started = Instant::now();

    if machine.is_localhost() {
        let closure = dest_store.compute_fs_closure(&basic.input_srcs).await?;
        copy_paths(dest_store, local_store, &closure).await?;
    } else {
        send_closure(conn, dest_store, &basic.input_srcs).await?;
    }

    *overhead_ms += started.elapsed().as_millis() as u64;
    Ok(basic)
}
