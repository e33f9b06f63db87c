//! The per-step orchestrator.

use std::io::{Seek as _, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tracing::{debug, info, warn};

use capstan_nar::NarMemberMap;
use capstan_protocol::BuildStatus;
use capstan_ssh_store::Session;
use capstan_store_core::{Store, StorePathSet};

use crate::build;
use crate::closure;
use crate::connector::Connector;
use crate::counters::{DispatchCounters, MaintainCount};
use crate::error::DispatchError;
use crate::ingest;
use crate::log_file;
use crate::machine::Machine;
use crate::options::{BuildOptions, DispatchConfig};
use crate::result::{RemoteResult, StepStatus};
use crate::step::{ActiveStep, Step, StepState};

/// Drives one build step at a time on a remote worker. One dispatcher is
/// shared by all step tasks; everything per-step lives in the arguments.
pub struct Dispatcher {
    config: DispatchConfig,
    local_store: Arc<dyn Store>,
    counters: Arc<DispatchCounters>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, local_store: Arc<dyn Store>) -> Self {
        Self {
            config,
            local_store,
            counters: Arc::new(DispatchCounters::default()),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn counters(&self) -> &DispatchCounters {
        &self.counters
    }

    /// Build `step` on `machine`, ingesting outputs into `dest_store`.
    ///
    /// Remote build outcomes (including failures the worker reported
    /// cleanly) return `Ok` with the mapped [`RemoteResult`]; transport,
    /// protocol and local resource trouble returns `Err` after feeding the
    /// machine's backoff, with `result` carrying whatever metrics were
    /// gathered up to that point.
    #[allow(clippy::too_many_arguments)]
    pub async fn build_remote(
        &self,
        connector: &dyn Connector,
        dest_store: &Arc<dyn Store>,
        machine: &Arc<Machine>,
        step: &Step,
        options: &BuildOptions,
        result: &mut RemoteResult,
        active_step: &ActiveStep,
        update_step: &mut dyn FnMut(StepState),
        nar_members: &NarMemberMap,
    ) -> Result<(), DispatchError> {
        // Wire compatibility is load-bearing: the timeout status code is
        // persisted by the queue and must never drift.
        assert_eq!(u64::from(BuildStatus::TimedOut), 8);

        let (log_path, log_file) =
            log_file::open_log_file(&self.config.log_dir, &step.drv_path).await?;
        result.log_file = Some(log_path.clone());
        let log_handle = log_file
            .try_clone()
            .map_err(|e| DispatchError::io("duplicating log handle", e))?;

        // Scratch space for the step, removed again on every exit path.
        let _tmp_dir = tempfile::tempdir()
            .map_err(|e| DispatchError::io("creating step temporary directory", e))?;

        let mut keep_log = false;
        let outcome = self
            .run(
                connector,
                dest_store.as_ref(),
                machine,
                step,
                options,
                result,
                active_step,
                update_step,
                nar_members,
                log_file,
                log_handle,
                &log_path,
                &mut keep_log,
            )
            .await;

        active_step.clear_pid();

        if let Err(e) = &outcome {
            // Disable the machine for a while; the period grows with every
            // consecutive failure. Remote build outcomes come back as Ok
            // and never end up here.
            if let Some(seconds) =
                machine.note_failure(self.config.retry_interval, self.config.retry_backoff, SystemTime::now())
            {
                info!(machine = %machine.ssh_name, seconds, "disabling machine after failure");
            }
            result.step_status = StepStatus::Aborted;
            result.can_retry = e.can_retry();
            result.error_msg = e.to_string();
        }

        if !keep_log {
            // Nothing interesting was logged before the failure.
            let _ = std::fs::remove_file(&log_path);
            result.log_file = None;
        }

        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        connector: &dyn Connector,
        dest_store: &dyn Store,
        machine: &Arc<Machine>,
        step: &Step,
        options: &BuildOptions,
        result: &mut RemoteResult,
        active_step: &ActiveStep,
        update_step: &mut dyn FnMut(StepState),
        nar_members: &NarMemberMap,
        log_file: std::fs::File,
        log_handle: std::fs::File,
        log_path: &Path,
        keep_log: &mut bool,
    ) -> Result<(), DispatchError> {
        update_step(StepState::Connecting);
        if active_step.cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let mut session = connector.open(machine, log_file).await?;
        if let Some(pid) = session.child_pid() {
            active_step.set_pid(pid);
        }
        if active_step.cancelled() {
            return Err(DispatchError::Cancelled);
        }

        // The machine answered; clear its failure streak.
        machine.note_success();

        let phases = self
            .phases(
                &mut session,
                dest_store,
                machine,
                step,
                options,
                result,
                active_step,
                update_step,
                nar_members,
                log_handle,
                log_path,
                keep_log,
            )
            .await;

        result.bytes_sent = session.bytes_written();
        result.bytes_received = session.bytes_read();
        self.counters.bytes_sent.add(result.bytes_sent);
        self.counters.bytes_received.add(result.bytes_received);

        if let Err(e) = session.close().await {
            warn!(machine = %machine.ssh_name, error = %e, "closing session");
        }
        phases
    }

    #[allow(clippy::too_many_arguments)]
    async fn phases(
        &self,
        session: &mut Session,
        dest_store: &dyn Store,
        machine: &Arc<Machine>,
        step: &Step,
        options: &BuildOptions,
        result: &mut RemoteResult,
        active_step: &ActiveStep,
        update_step: &mut dyn FnMut(StepState),
        nar_members: &NarMemberMap,
        log_handle: std::fs::File,
        log_path: &Path,
        keep_log: &mut bool,
    ) -> Result<(), DispatchError> {
        update_step(StepState::SendingInputs);
        let basic = closure::send_inputs(
            self.local_store.as_ref(),
            dest_store,
            session.connection(),
            machine,
            step,
            &self.counters,
            &mut result.overhead,
        )
        .await?;

        *keep_log = true;

        // Drop the substitution chatter the worker produced while inputs
        // were copied; the log should start with the build proper.
        let mut log_handle = log_handle;
        log_handle
            .seek(SeekFrom::Start(0))
            .map_err(|e| DispatchError::io(format!("seeking log file '{}'", log_path.display()), e))?;
        log_handle
            .set_len(0)
            .map_err(|e| DispatchError::io(format!("truncating log file '{}'", log_path.display()), e))?;
        drop(log_handle);

        if active_step.cancelled() {
            return Err(DispatchError::Cancelled);
        }
        update_step(StepState::Building);
        debug!(drv = %step.drv_path, machine = %machine.ssh_name, "building derivation");

        let build_result = build::perform_build(
            session.connection(),
            &step.drv_path,
            &basic,
            options,
            &self.counters.nr_steps_building,
        )
        .await?;
        result.update_with_build_result(&build_result);

        if result.step_status != StepStatus::Success {
            return Ok(());
        }
        result.error_msg.clear();

        // A substituted or already-valid result produced no build log.
        if result.is_cached {
            info!(
                drv = %step.drv_path,
                machine = %machine.ssh_name,
                "outputs substituted or already valid on the worker"
            );
            let _ = std::fs::remove_file(log_path);
            result.log_file = None;
        }

        if !machine.is_localhost() || self.local_store.uri() != dest_store.uri() {
            if active_step.cancelled() {
                return Err(DispatchError::Cancelled);
            }
            update_step(StepState::ReceivingOutputs);
            let _copying = MaintainCount::new(&self.counters.nr_steps_copying_from);
            let started = Instant::now();

            let outputs: StorePathSet = step
                .drv
                .outputs_and_opt_paths()
                .into_iter()
                .filter_map(|(_, path)| path)
                .collect();

            let (infos, total_nar_size) =
                ingest::query_path_infos(session.connection(), &outputs).await?;

            if total_nar_size > self.config.max_output_size {
                result.step_status = StepStatus::NarSizeLimitExceeded;
                return Ok(());
            }

            debug!(
                drv = %step.drv_path,
                machine = %machine.ssh_name,
                bytes = total_nar_size,
                "copying outputs from the worker"
            );
            ingest::copy_paths_from_remote(
                session.connection(),
                dest_store,
                &infos,
                nar_members,
            )
            .await?;

            result.overhead += started.elapsed().as_millis() as u64;
        }

        Ok(())
    }
}
