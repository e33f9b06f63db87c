//! The seam between the orchestrator and the transport.

use async_trait::async_trait;

use capstan_ssh_store::{Session, SessionError, SshStoreConfig};

use crate::machine::Machine;

/// Opens transport sessions to workers. Production uses [`SshConnector`];
/// tests substitute an in-process peer.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session to `machine`, routing the worker's stderr (the build
    /// log) into `log`.
    async fn open(&self, machine: &Machine, log: std::fs::File) -> Result<Session, SessionError>;
}

/// Spawns `ssh … --serve --write` (or the serve endpoint directly for a
/// localhost machine).
#[derive(Debug, Default)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn open(&self, machine: &Machine, log: std::fs::File) -> Result<Session, SessionError> {
        let mut config = SshStoreConfig::new(machine.ssh_name.clone());
        config.ssh_key = machine.ssh_key.clone();
        config.system_features = machine.supported_features.clone();
        Session::open(&config, log).await
    }
}
