use std::path::PathBuf;

use capstan_protocol::{BuildResult, BuildStatus};

/// The queue-facing classification of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    Failed,
    Aborted,
    TimedOut,
    LogLimitExceeded,
    NarSizeLimitExceeded,
    NotDeterministic,
}

/// Outcome, metrics and cache-ability of a single remote build attempt.
#[derive(Debug, Clone)]
pub struct RemoteResult {
    pub step_status: StepStatus,
    /// Whether the queue may retry the step elsewhere.
    pub can_retry: bool,
    /// Whether a failure may be recorded as a cached failure.
    pub can_cache: bool,
    /// The outputs were substituted or already valid on the worker; no
    /// build ran and no log was produced.
    pub is_cached: bool,
    pub error_msg: String,
    pub times_built: u64,
    pub is_non_deterministic: bool,
    pub start_time: u64,
    pub stop_time: u64,
    /// Input/output copy time in milliseconds.
    pub overhead: u64,
    /// On-disk build log, when one was retained.
    pub log_file: Option<PathBuf>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl Default for RemoteResult {
    fn default() -> Self {
        Self {
            step_status: StepStatus::Aborted,
            can_retry: false,
            can_cache: false,
            is_cached: false,
            error_msg: String::new(),
            times_built: 0,
            is_non_deterministic: false,
            start_time: 0,
            stop_time: 0,
            overhead: 0,
            log_file: None,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }
}

impl RemoteResult {
    /// Map the worker's build result onto the queue-facing outcome.
    pub fn update_with_build_result(&mut self, build: &BuildResult) {
        self.start_time = build.start_time;
        self.stop_time = build.stop_time;
        self.times_built = build.times_built;
        self.error_msg = build.error_msg.clone();
        self.is_non_deterministic = build.is_non_deterministic;

        match build.status {
            BuildStatus::Built => {
                self.step_status = StepStatus::Success;
            }
            BuildStatus::Substituted | BuildStatus::AlreadyValid => {
                self.step_status = StepStatus::Success;
                self.is_cached = true;
            }
            BuildStatus::PermanentFailure => {
                self.step_status = StepStatus::Failed;
                self.can_cache = true;
                self.error_msg.clear();
            }
            BuildStatus::InputRejected | BuildStatus::OutputRejected => {
                self.step_status = StepStatus::Failed;
                self.can_cache = true;
            }
            BuildStatus::TransientFailure => {
                self.step_status = StepStatus::Failed;
                self.can_retry = true;
                self.error_msg.clear();
            }
            BuildStatus::TimedOut => {
                self.step_status = StepStatus::TimedOut;
                self.error_msg.clear();
            }
            BuildStatus::MiscFailure => {
                self.step_status = StepStatus::Aborted;
                self.can_retry = true;
            }
            BuildStatus::LogLimitExceeded => {
                self.step_status = StepStatus::LogLimitExceeded;
            }
            BuildStatus::NotDeterministic => {
                self.step_status = StepStatus::NotDeterministic;
                self.can_retry = false;
                self.can_cache = true;
            }
            _ => {
                self.step_status = StepStatus::Aborted;
            }
        }
    }
}
