//! End-to-end dispatch scenarios against a scripted in-process worker.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use capstan_dispatch::{
    ActiveStep, BuildOptions, Connector, DispatchConfig, DispatchError, Dispatcher, Machine,
    RemoteResult, Step, StepState, StepStatus,
};
use capstan_nar::{NarEntry, NarMemberMap};
use capstan_protocol::{BuildResult, BuildStatus, ProtocolVersion, ServeCommand};
use capstan_ssh_store::{ServeConnection, Session, SessionError};
use capstan_store_core::{
    Derivation, DerivationOutput, Hash, Store, StorePath, StorePathSet, ValidPathInfo,
};
use capstan_utils_test::{spawn_worker, MemoryStore, WorkerLog, WorkerScript};

fn path(name: &str) -> StorePath {
    StorePath::new(format!("/nix/store/{name}"))
}

/// A connector that wires each session to a fresh scripted worker.
struct TestConnector {
    script: WorkerScript,
    logs: Mutex<Vec<Arc<Mutex<WorkerLog>>>>,
}

impl TestConnector {
    fn new(script: WorkerScript) -> Self {
        Self {
            script,
            logs: Mutex::new(Vec::new()),
        }
    }

    fn worker_log(&self) -> Arc<Mutex<WorkerLog>> {
        self.logs.lock().unwrap().last().cloned().expect("no session opened")
    }
}

#[async_trait]
impl Connector for TestConnector {
    async fn open(&self, _machine: &Machine, _log: std::fs::File) -> Result<Session, SessionError> {
        let (client, log, _worker) = spawn_worker(self.script.clone());
        self.logs.lock().unwrap().push(log);
        let (reader, writer) = tokio::io::split(client);
        let conn = ServeConnection::handshake(reader, writer).await?;
        Ok(Session::from_connection(conn))
    }
}

/// A connector whose workers are unreachable.
struct FailingConnector;

#[async_trait]
impl Connector for FailingConnector {
    async fn open(&self, _machine: &Machine, _log: std::fs::File) -> Result<Session, SessionError> {
        Err(SessionError::Spawn {
            command: "ssh builder".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        })
    }
}

struct Harness {
    dispatcher: Dispatcher,
    local: Arc<MemoryStore>,
    dest: Arc<MemoryStore>,
    dest_dyn: Arc<dyn Store>,
    machine: Arc<Machine>,
    step: Step,
    nar_members: NarMemberMap,
    _log_dir: tempfile::TempDir,
}

impl Harness {
    /// One derivation `aaaa-foo.drv` with output `bbbb-foo` and one input
    /// source `cccc-input` seeded into the local store.
    fn new() -> Self {
        Self::with_config_tweak(|_| {})
    }

    fn with_config_tweak(tweak: impl FnOnce(&mut DispatchConfig)) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let log_dir = tempfile::tempdir().unwrap();
        let mut config = DispatchConfig::new(log_dir.path());
        config.retry_interval = 10;
        config.retry_backoff = 3.0;
        tweak(&mut config);

        let local = Arc::new(MemoryStore::new("memory://local"));
        let dest = Arc::new(MemoryStore::new("memory://dest"));
        local.seed_tree(path("cccc-input"), StorePathSet::new(), &NarEntry::file("dep"));

        let step = Step {
            drv_path: path("aaaa-foo.drv"),
            drv: Derivation {
                name: "foo".to_string(),
                outputs: [("out".to_string(), DerivationOutput::at(path("bbbb-foo")))]
                    .into_iter()
                    .collect(),
                input_srcs: StorePathSet::from([path("cccc-input")]),
                platform: "x86_64-linux".to_string(),
                builder: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "echo foo > $out".to_string()],
                env: BTreeMap::new(),
                input_drvs: BTreeMap::new(),
            },
        };

        let local_dyn: Arc<dyn Store> = local.clone();
        let dest_dyn: Arc<dyn Store> = dest.clone();
        Self {
            dispatcher: Dispatcher::new(config, local_dyn),
            local,
            dest,
            dest_dyn,
            machine: Arc::new(Machine::new("builder@worker").with_features(["big-parallel"])),
            step,
            nar_members: NarMemberMap::new(),
            _log_dir: log_dir,
        }
    }

    async fn dispatch(
        &self,
        connector: &dyn Connector,
    ) -> (RemoteResult, Vec<StepState>, Result<(), DispatchError>) {
        let active = ActiveStep::new();
        self.dispatch_with(connector, &active).await
    }

    async fn dispatch_with(
        &self,
        connector: &dyn Connector,
        active: &ActiveStep,
    ) -> (RemoteResult, Vec<StepState>, Result<(), DispatchError>) {
        let mut result = RemoteResult::default();
        let mut states = Vec::new();
        let mut update_step = |state: StepState| states.push(state);
        let outcome = self
            .dispatcher
            .build_remote(
                connector,
                &self.dest_dyn,
                &self.machine,
                &self.step,
                &BuildOptions::default(),
                &mut result,
                active,
                &mut update_step,
                &self.nar_members,
            )
            .await;
        (result, states, outcome)
    }
}

/// The output NAR plus a matching path info record.
fn output_fixture(name: &str, tree: &NarEntry) -> (ValidPathInfo, Vec<u8>) {
    let nar = tree.dump();
    let mut info = ValidPathInfo::new(path(name), Hash::digest(&nar));
    info.nar_size = nar.len() as u64;
    (info, nar)
}

fn built_script() -> (WorkerScript, ValidPathInfo, Vec<u8>) {
    let (info, nar) = output_fixture("bbbb-foo", &NarEntry::file("foo output"));
    let mut script = WorkerScript::new(BuildResult {
        status: BuildStatus::Built,
        error_msg: String::new(),
        times_built: 1,
        is_non_deterministic: false,
        start_time: 100,
        stop_time: 160,
        built_outputs: BTreeMap::new(),
    });
    script.path_infos = vec![info.clone()];
    script.nars.insert(info.path.clone(), nar.clone());
    (script, info, nar)
}

#[tokio::test]
async fn happy_path_builds_and_ingests() {
    let harness = Harness::new();
    let (script, info, _nar) = built_script();
    let connector = TestConnector::new(script);

    let (result, states, outcome) = harness.dispatch(&connector).await;
    outcome.unwrap();

    assert_eq!(result.step_status, StepStatus::Success);
    assert!(!result.is_cached);
    assert!(!result.can_cache);
    assert_eq!(result.error_msg, "");
    assert_eq!((result.start_time, result.stop_time), (100, 160));
    assert_eq!(result.times_built, 1);

    // The log file survives on disk.
    let log_file = result.log_file.as_ref().expect("log file retained");
    assert!(log_file.exists());

    // The destination store holds the output, and its metadata was
    // extracted from the streamed NAR.
    assert!(harness.dest.contains(&info.path));
    let member = harness
        .nar_members
        .get(&info.path, "")
        .expect("root member recorded");
    assert_eq!(member.file_size, Some("foo output".len() as u64));

    // The input is untouched locally and reached the worker, resolved
    // into the basic derivation.
    assert!(harness.local.contains(&path("cccc-input")));
    let log = connector.worker_log();
    let log = log.lock().unwrap();
    assert!(log.error.is_none(), "worker error: {:?}", log.error);
    assert_eq!(log.received_paths, vec![path("cccc-input")]);
    let built = log.built_drv.as_ref().unwrap();
    assert!(built.input_srcs.contains(&path("cccc-input")));
    assert_eq!(log.built_drv_path.as_deref(), Some("/nix/store/aaaa-foo.drv"));

    // Version 2.7 peer: all gated client fields were transmitted.
    assert_eq!(log.max_log_size, Some(BuildOptions::default().max_log_size));
    assert_eq!(log.repeats, Some(0));
    assert_eq!(log.enforce_determinism, Some(false));
    assert_eq!(log.keep_failed, Some(false));

    assert_eq!(
        states,
        vec![
            StepState::Connecting,
            StepState::SendingInputs,
            StepState::Building,
            StepState::ReceivingOutputs,
        ]
    );

    // Byte counters were finalised into both the result and the globals.
    assert!(result.bytes_sent > 0);
    assert!(result.bytes_received > 0);
    let counters = harness.dispatcher.counters();
    assert_eq!(counters.bytes_sent.get(), result.bytes_sent);
    assert_eq!(counters.bytes_received.get(), result.bytes_received);
    assert_eq!(counters.nr_steps_building.get(), 0);
    assert_eq!(counters.nr_steps_copying_to.get(), 0);
    assert_eq!(counters.nr_steps_copying_from.get(), 0);

    // The machine is healthy.
    assert_eq!(harness.machine.connect_info().consecutive_failures, 0);
}

#[tokio::test]
async fn cache_hit_skips_bodies_and_drops_log() {
    let harness = Harness::new();
    let (mut script, info, _nar) = built_script();
    script.build.status = BuildStatus::AlreadyValid;

    // The destination store already has the output, so the lazy dump
    // source must transmit nothing.
    harness.dest.seed_tree(info.path.clone(), StorePathSet::new(), &NarEntry::file("foo output"));

    let connector = TestConnector::new(script);
    let (result, states, outcome) = harness.dispatch(&connector).await;
    outcome.unwrap();

    assert_eq!(result.step_status, StepStatus::Success);
    assert!(result.is_cached);
    assert_eq!(result.log_file, None);

    // No log file anywhere under the log directory.
    let mut entries = walk(harness._log_dir.path());
    entries.retain(|p| p.is_file());
    assert!(entries.is_empty(), "stray log files: {entries:?}");

    // Metadata phase ran, but no NAR body was requested.
    let log = connector.worker_log();
    let log = log.lock().unwrap();
    assert!(log.commands.contains(&ServeCommand::QueryPathInfos));
    assert!(log.dumped_paths.is_empty());
    assert!(states.contains(&StepState::ReceivingOutputs));
}

#[tokio::test]
async fn permanent_failure_is_cacheable() {
    let harness = Harness::new();
    let (mut script, _, _) = built_script();
    script.build.status = BuildStatus::PermanentFailure;
    script.build.error_msg = "builder failed with exit 1".to_string();

    let connector = TestConnector::new(script);
    let (result, states, outcome) = harness.dispatch(&connector).await;
    outcome.unwrap();

    assert_eq!(result.step_status, StepStatus::Failed);
    assert!(result.can_cache);
    assert!(!result.can_retry);
    assert_eq!(result.error_msg, "");

    // A clean remote outcome never counts against the machine.
    assert_eq!(harness.machine.connect_info().consecutive_failures, 0);
    assert!(!states.contains(&StepState::ReceivingOutputs));
}

#[tokio::test]
async fn timeout_maps_to_timed_out() {
    let harness = Harness::new();
    let (mut script, _, _) = built_script();
    script.build.status = BuildStatus::TimedOut;
    script.build.error_msg = "timed out after 3600s".to_string();

    let connector = TestConnector::new(script);
    let (result, _, outcome) = harness.dispatch(&connector).await;
    outcome.unwrap();

    assert_eq!(result.step_status, StepStatus::TimedOut);
    assert_eq!(result.error_msg, "");
}

#[tokio::test]
async fn oversize_outputs_short_circuit_before_any_body() {
    let harness = Harness::with_config_tweak(|config| {
        config.max_output_size = 1 << 30;
    });

    let (big_info, _) = output_fixture("bbbb-foo", &NarEntry::file("big"));
    let (small_info, _) = output_fixture("dddd-doc", &NarEntry::file("doc"));
    let mut big_info = big_info;
    big_info.nar_size = 10 << 30;

    let mut script = WorkerScript::new(BuildResult {
        status: BuildStatus::Built,
        ..BuildResult::default()
    });
    script.path_infos = vec![big_info, small_info];

    // The step declares both outputs.
    let mut harness = harness;
    harness.step.drv.outputs.insert(
        "doc".to_string(),
        DerivationOutput::at(path("dddd-doc")),
    );

    let connector = TestConnector::new(script);
    let (result, _, outcome) = harness.dispatch(&connector).await;
    outcome.unwrap();

    assert_eq!(result.step_status, StepStatus::NarSizeLimitExceeded);

    let log = connector.worker_log();
    let log = log.lock().unwrap();
    assert!(!log.commands.contains(&ServeCommand::DumpStorePath));
    assert!(log.dumped_paths.is_empty());
}

#[tokio::test]
async fn transport_failures_back_off_the_machine() {
    let harness = Harness::new();
    let now = SystemTime::now();

    for _ in 0..3 {
        let (result, _, outcome) = harness.dispatch(&FailingConnector).await;
        assert!(matches!(outcome, Err(DispatchError::Session(_))));
        assert_eq!(result.step_status, StepStatus::Aborted);
        assert!(result.can_retry);
        assert_eq!(result.log_file, None);
    }

    // Three failures in quick succession count once.
    let info = harness.machine.connect_info();
    assert_eq!(info.consecutive_failures, 1);

    // disabled_until - now in [retry_interval, retry_interval + 30).
    let disabled_until = info.disabled_until.unwrap();
    let delta = disabled_until.duration_since(now).unwrap();
    assert!(delta >= Duration::from_secs(10), "delta {delta:?}");
    assert!(delta < Duration::from_secs(10 + 30 + 1), "delta {delta:?}");
}

#[tokio::test]
async fn cancellation_before_connect() {
    let harness = Harness::new();
    let (script, _, _) = built_script();
    let connector = TestConnector::new(script);

    let active = ActiveStep::new();
    active.cancel();
    let (result, states, outcome) = harness.dispatch_with(&connector, &active).await;

    assert!(matches!(outcome, Err(DispatchError::Cancelled)));
    assert!(!result.can_retry);
    assert_eq!(states, vec![StepState::Connecting]);
    assert_eq!(result.log_file, None);
}

#[tokio::test]
async fn old_peer_gets_no_gated_fields() {
    let harness = Harness::new();
    let (mut script, info, _) = built_script();
    script.version = ProtocolVersion::new(2, 1);
    // An old worker reports times in-band only from minor 3 on.
    script.build.times_built = 0;

    let connector = TestConnector::new(script);
    let (result, _, outcome) = harness.dispatch(&connector).await;
    outcome.unwrap();

    assert_eq!(result.step_status, StepStatus::Success);
    assert!(harness.dest.contains(&info.path));

    let log = connector.worker_log();
    let log = log.lock().unwrap();
    assert!(log.error.is_none(), "worker error: {:?}", log.error);
    // No gated client fields were transmitted...
    assert_eq!(log.max_log_size, None);
    assert_eq!(log.repeats, None);
    assert_eq!(log.keep_failed, None);
    // ...and the upload used the legacy import stream.
    assert!(log.commands.contains(&ServeCommand::ImportPaths));
    assert!(!log.commands.contains(&ServeCommand::AddToStoreNar));
    assert_eq!(log.received_paths, vec![path("cccc-input")]);
}

#[tokio::test]
async fn foreign_path_info_is_a_protocol_error() {
    let harness = Harness::new();
    let (mut script, _, _) = built_script();
    let (foreign, _) = output_fixture("eeee-unrelated", &NarEntry::file("?"));
    script.path_infos.push(foreign);

    let connector = TestConnector::new(script);
    let (result, _, outcome) = harness.dispatch(&connector).await;

    assert!(matches!(
        outcome,
        Err(DispatchError::UnexpectedPathInfo { .. })
    ));
    assert_eq!(result.step_status, StepStatus::Aborted);
    // Protocol violations count against the machine.
    assert_eq!(harness.machine.connect_info().consecutive_failures, 1);
}

#[tokio::test]
async fn success_implies_outputs_present() {
    let harness = Harness::new();
    let (script, _, _) = built_script();
    let connector = TestConnector::new(script);

    let (result, _, outcome) = harness.dispatch(&connector).await;
    outcome.unwrap();
    assert_eq!(result.step_status, StepStatus::Success);

    for (_, output_path) in harness.step.drv.outputs_and_opt_paths() {
        let output_path = output_path.unwrap();
        assert!(
            harness.dest.is_valid_path(&output_path).await.unwrap(),
            "output {output_path} missing from destination store"
        );
    }
}

fn walk(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let p = entry.path();
            if p.is_dir() {
                out.extend(walk(&p));
            } else {
                out.push(p);
            }
        }
    }
    out
}
