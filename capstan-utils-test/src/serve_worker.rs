//! A scripted in-process serve-protocol worker.
//!
//! Tests hand it one end of a duplex stream and a [`WorkerScript`]; it
//! performs the server half of the handshake, answers commands from the
//! script, and records everything it saw in a [`WorkerLog`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use capstan_nar::{NarExtractor, NarMemberMap};
use capstan_protocol::{
    BuildResult, Deserialize, ProtocolError, ProtocolVersion, Serialize, ServeCommand,
    EXPORT_MAGIC, PROTOCOL_VERSION, SERVE_MAGIC_1, SERVE_MAGIC_2,
};
use capstan_store_core::{BasicDerivation, StorePath, StorePathSet, ValidPathInfo};

/// What the worker should answer.
#[derive(Clone)]
pub struct WorkerScript {
    /// Version advertised in the handshake.
    pub version: ProtocolVersion,
    /// Paths reported as already valid when the client uploads.
    pub valid_paths: StorePathSet,
    /// Outcome of a build command.
    pub build: BuildResult,
    /// Records returned from a path-info query, in order.
    pub path_infos: Vec<ValidPathInfo>,
    /// NAR bodies served for dump commands.
    pub nars: BTreeMap<StorePath, Vec<u8>>,
}

impl WorkerScript {
    pub fn new(build: BuildResult) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            valid_paths: StorePathSet::new(),
            build,
            path_infos: Vec::new(),
            nars: BTreeMap::new(),
        }
    }
}

/// Everything the worker observed, for assertions.
#[derive(Default)]
pub struct WorkerLog {
    pub commands: Vec<ServeCommand>,
    /// Paths received through either upload flavour.
    pub received_paths: Vec<StorePath>,
    /// Paths the client asked to dump.
    pub dumped_paths: Vec<StorePath>,
    pub built_drv_path: Option<String>,
    pub built_drv: Option<BasicDerivation>,
    pub max_silent_time: u64,
    pub build_timeout: u64,
    pub max_log_size: Option<u64>,
    pub repeats: Option<u64>,
    pub enforce_determinism: Option<bool>,
    pub keep_failed: Option<bool>,
    /// Set when the worker hit a protocol error (usually because the
    /// client hung up first, which is fine for most tests).
    pub error: Option<String>,
}

/// Spawn a worker over an in-memory duplex pipe; returns the client end,
/// the shared log, and the worker task handle.
pub fn spawn_worker(
    script: WorkerScript,
) -> (
    tokio::io::DuplexStream,
    Arc<Mutex<WorkerLog>>,
    tokio::task::JoinHandle<()>,
) {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let log = Arc::new(Mutex::new(WorkerLog::default()));
    let worker_log = Arc::clone(&log);
    let handle = tokio::spawn(async move {
        let (reader, writer) = tokio::io::split(server);
        if let Err(e) = run_worker(reader, writer, script, Arc::clone(&worker_log)).await {
            worker_log.lock().unwrap().error = Some(e.to_string());
        }
    });
    (client, log, handle)
}

async fn run_worker<R, W>(
    mut from: R,
    mut to: W,
    script: WorkerScript,
    log: Arc<Mutex<WorkerLog>>,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let version = script.version;

    // Server half of the handshake.
    let magic = u64::deserialize(&mut from, version).await?;
    if magic != SERVE_MAGIC_1 {
        return Err(ProtocolError::InvalidMagic {
            expected: SERVE_MAGIC_1,
            actual: magic,
        });
    }
    let _client_version = u64::deserialize(&mut from, version).await?;
    SERVE_MAGIC_2.serialize(&mut to, version).await?;
    u64::from(version).serialize(&mut to, version).await?;
    to.flush().await.map_err(io_err)?;

    loop {
        let raw = match u64::deserialize(&mut from, version).await {
            Ok(raw) => raw,
            // Client closed the session.
            Err(ProtocolError::Io { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        let command = ServeCommand::try_from(raw)
            .map_err(|_| ProtocolError::malformed("command", raw))?;
        log.lock().unwrap().commands.push(command);

        match command {
            ServeCommand::QueryValidPaths => {
                let _lock = bool::deserialize(&mut from, version).await?;
                let _substitute = bool::deserialize(&mut from, version).await?;
                let asked: StorePathSet = <StorePathSet as Deserialize>::deserialize(&mut from, version).await?;
                let valid: StorePathSet = asked
                    .intersection(&script.valid_paths)
                    .cloned()
                    .collect();
                valid.serialize(&mut to, version).await?;
                to.flush().await.map_err(io_err)?;
            }

            ServeCommand::AddToStoreNar => {
                let path = StorePath::deserialize(&mut from, version).await?;
                let _deriver = String::deserialize(&mut from, version).await?;
                let _nar_hash = String::deserialize(&mut from, version).await?;
                let _references: StorePathSet =
                    <StorePathSet as Deserialize>::deserialize(&mut from, version).await?;
                let _registration_time = u64::deserialize(&mut from, version).await?;
                let _nar_size = u64::deserialize(&mut from, version).await?;
                let _ultimate = bool::deserialize(&mut from, version).await?;
                let _sigs: Vec<String> = <Vec<String> as Deserialize>::deserialize(&mut from, version).await?;
                let _ca = String::deserialize(&mut from, version).await?;
                read_nar_exact(&mut from).await?;
                log.lock().unwrap().received_paths.push(path);
                1u64.serialize(&mut to, version).await?;
                to.flush().await.map_err(io_err)?;
            }

            ServeCommand::ImportPaths => {
                loop {
                    if u64::deserialize(&mut from, version).await? == 0 {
                        break;
                    }
                    read_nar_exact(&mut from).await?;
                    let magic = u64::deserialize(&mut from, version).await?;
                    if magic != EXPORT_MAGIC {
                        return Err(ProtocolError::InvalidMagic {
                            expected: EXPORT_MAGIC,
                            actual: magic,
                        });
                    }
                    let path = StorePath::deserialize(&mut from, version).await?;
                    let _references: StorePathSet =
                        <StorePathSet as Deserialize>::deserialize(&mut from, version).await?;
                    let _deriver = String::deserialize(&mut from, version).await?;
                    let _signature = u64::deserialize(&mut from, version).await?;
                    log.lock().unwrap().received_paths.push(path);
                }
                1u64.serialize(&mut to, version).await?;
                to.flush().await.map_err(io_err)?;
            }

            ServeCommand::BuildDerivation => {
                let drv_path = String::deserialize(&mut from, version).await?;
                let drv = BasicDerivation::deserialize(&mut from, version).await?;
                let max_silent_time = u64::deserialize(&mut from, version).await?;
                let build_timeout = u64::deserialize(&mut from, version).await?;
                {
                    let mut log = log.lock().unwrap();
                    log.built_drv_path = Some(drv_path);
                    log.built_drv = Some(drv);
                    log.max_silent_time = max_silent_time;
                    log.build_timeout = build_timeout;
                }
                if version.minor >= 2 {
                    let v = u64::deserialize(&mut from, version).await?;
                    log.lock().unwrap().max_log_size = Some(v);
                }
                if version.minor >= 3 {
                    let repeats = u64::deserialize(&mut from, version).await?;
                    let enforce = bool::deserialize(&mut from, version).await?;
                    let mut log = log.lock().unwrap();
                    log.repeats = Some(repeats);
                    log.enforce_determinism = Some(enforce);
                }
                if version.minor >= 7 {
                    let v = bool::deserialize(&mut from, version).await?;
                    log.lock().unwrap().keep_failed = Some(v);
                }
                script.build.serialize(&mut to, version).await?;
                to.flush().await.map_err(io_err)?;
            }

            ServeCommand::QueryPathInfos => {
                let _asked: StorePathSet = <StorePathSet as Deserialize>::deserialize(&mut from, version).await?;
                for info in &script.path_infos {
                    info.path.serialize(&mut to, version).await?;
                    match &info.deriver {
                        Some(deriver) => deriver.serialize(&mut to, version).await?,
                        None => "".serialize(&mut to, version).await?,
                    }
                    info.references.serialize(&mut to, version).await?;
                    0u64.serialize(&mut to, version).await?; // download size
                    info.nar_size.serialize(&mut to, version).await?;
                    info.nar_hash.to_string().serialize(&mut to, version).await?;
                    match &info.content_address {
                        Some(ca) => ca.serialize(&mut to, version).await?,
                        None => "".serialize(&mut to, version).await?,
                    }
                    std::collections::BTreeSet::<String>::new()
                        .serialize(&mut to, version)
                        .await?;
                }
                "".serialize(&mut to, version).await?;
                to.flush().await.map_err(io_err)?;
            }

            ServeCommand::DumpStorePath => {
                let path = StorePath::deserialize(&mut from, version).await?;
                let nar = script.nars.get(&path).cloned().unwrap_or_default();
                log.lock().unwrap().dumped_paths.push(path);
                to.write_all(&nar).await.map_err(io_err)?;
                to.flush().await.map_err(io_err)?;
            }

            other => {
                return Err(ProtocolError::malformed(
                    "command",
                    format!("unscripted command {other:?}"),
                ));
            }
        }
    }
}

fn io_err(source: std::io::Error) -> ProtocolError {
    ProtocolError::Io {
        context: "worker stream".to_string(),
        source,
    }
}

/// Read exactly one NAR off the stream, one byte at a time (tests only).
async fn read_nar_exact<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut extractor = NarExtractor::new(
        StorePath::new("/nix/store/00000000000000000000000000000000-incoming"),
        NarMemberMap::new(),
    );
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    while !extractor.is_complete() {
        reader.read_exact(&mut byte).await.map_err(io_err)?;
        extractor
            .push(&byte)
            .map_err(|e| ProtocolError::malformed("incoming NAR", e))?;
        bytes.push(byte[0]);
    }
    Ok(bytes)
}
