//! Build outcomes as reported by the remote worker.

use std::collections::BTreeMap;

use num_enum::{FromPrimitive, IntoPrimitive};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;
use crate::realisation::{DrvOutput, Realisation};
use crate::serialization::{Deserialize, Serialize};
use crate::version::ProtocolVersion;

/// The status integer a worker reports for a build.
///
/// The numeric values are part of the wire contract and must not be
/// reordered; unknown codes from newer peers are preserved in `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum BuildStatus {
    Built = 0,
    Substituted = 1,
    AlreadyValid = 2,
    PermanentFailure = 3,
    InputRejected = 4,
    OutputRejected = 5,
    TransientFailure = 6,
    CachedFailure = 7,
    TimedOut = 8,
    MiscFailure = 9,
    DependencyFailed = 10,
    LogLimitExceeded = 11,
    NotDeterministic = 12,
    ResolvesToAlreadyValid = 13,
    NoSubstituters = 14,
    #[num_enum(catch_all)]
    Unknown(u64),
}

impl BuildStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            BuildStatus::Built | BuildStatus::Substituted | BuildStatus::AlreadyValid
        )
    }
}

/// Everything the worker tells us about one build attempt.
///
/// Which fields actually travel depends on the peer's minor version:
/// `times_built` through `stop_time` need minor >= 3, `built_outputs`
/// needs minor >= 6.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub error_msg: String,
    pub times_built: u64,
    pub is_non_deterministic: bool,
    pub start_time: u64,
    pub stop_time: u64,
    pub built_outputs: BTreeMap<DrvOutput, Realisation>,
}

impl Default for BuildStatus {
    fn default() -> Self {
        BuildStatus::MiscFailure
    }
}

impl Serialize for BuildResult {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        u64::from(self.status).serialize(writer, version).await?;
        self.error_msg.serialize(writer, version).await?;
        if version.minor >= 3 {
            self.times_built.serialize(writer, version).await?;
            self.is_non_deterministic.serialize(writer, version).await?;
            self.start_time.serialize(writer, version).await?;
            self.stop_time.serialize(writer, version).await?;
        }
        if version.minor >= 6 {
            self.built_outputs.serialize(writer, version).await?;
        }
        Ok(())
    }
}

impl Deserialize for BuildResult {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ProtocolError> {
        let mut result = BuildResult {
            status: BuildStatus::from(u64::deserialize(reader, version).await?),
            error_msg: String::deserialize(reader, version).await?,
            ..BuildResult::default()
        };
        if version.minor >= 3 {
            result.times_built = u64::deserialize(reader, version).await?;
            result.is_non_deterministic = bool::deserialize(reader, version).await?;
            result.start_time = u64::deserialize(reader, version).await?;
            result.stop_time = u64::deserialize(reader, version).await?;
        }
        if version.minor >= 6 {
            result.built_outputs =
                <BTreeMap<DrvOutput, Realisation> as Deserialize>::deserialize(reader, version)
                    .await?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Cursor;

    #[rstest]
    #[case(0, BuildStatus::Built)]
    #[case(1, BuildStatus::Substituted)]
    #[case(2, BuildStatus::AlreadyValid)]
    #[case(3, BuildStatus::PermanentFailure)]
    #[case(4, BuildStatus::InputRejected)]
    #[case(5, BuildStatus::OutputRejected)]
    #[case(6, BuildStatus::TransientFailure)]
    #[case(8, BuildStatus::TimedOut)]
    #[case(9, BuildStatus::MiscFailure)]
    #[case(11, BuildStatus::LogLimitExceeded)]
    #[case(12, BuildStatus::NotDeterministic)]
    fn status_codes_are_stable(#[case] code: u64, #[case] status: BuildStatus) {
        assert_eq!(BuildStatus::from(code), status);
        assert_eq!(u64::from(status), code);
    }

    #[test]
    fn unknown_codes_survive_roundtrip() {
        let status = BuildStatus::from(99u64);
        assert_eq!(status, BuildStatus::Unknown(99));
        assert_eq!(u64::from(status), 99);
    }

    #[test]
    fn timed_out_is_code_eight() {
        // Hard compatibility assertion shared with the dispatcher.
        assert_eq!(u64::from(BuildStatus::TimedOut), 8);
    }

    #[tokio::test]
    async fn result_roundtrip_gated_on_minor() {
        let full = BuildResult {
            status: BuildStatus::Built,
            error_msg: String::new(),
            times_built: 2,
            is_non_deterministic: true,
            start_time: 100,
            stop_time: 160,
            built_outputs: BTreeMap::new(),
        };

        for minor in [1u8, 3, 6, 7] {
            let version = ProtocolVersion::new(2, minor);
            let mut buf = Vec::new();
            full.serialize(&mut buf, version).await.unwrap();
            let mut cursor = Cursor::new(buf);
            let back = BuildResult::deserialize(&mut cursor, version).await.unwrap();

            assert_eq!(back.status, full.status);
            if minor >= 3 {
                assert_eq!(back.times_built, 2);
                assert_eq!(back.start_time, 100);
            } else {
                assert_eq!(back.times_built, 0);
                assert_eq!(back.start_time, 0);
            }
        }
    }
}
