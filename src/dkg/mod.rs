//! Block-timed distributed key generation.
//!
//! A session drives the local member through a fixed sequence of
//! cryptographic phases in lock-step with the chain: ephemeral key
//! exchange, symmetric key derivation, three threshold rounds, and
//! finalization. Slow or absent peers are marked inactive, provably
//! misbehaving peers are disqualified, and the session either terminates
//! with a shared group key handle or aborts with the member-accounting
//! evidence.
//!
//! The entry point is [`run_dkg`]; the threshold primitives behind the
//! rounds are supplied by the caller through the [`TssOracle`] trait.

use thiserror::Error;

use crate::chain::ChainShutdown;
use crate::ephemeral::KeyGenerationError;
use crate::group::MemberIndex;
use crate::net::SendError;

mod machine;
mod message;
mod protocol;
mod states;
mod tss;


pub use machine::run_dkg;
pub use message::{
    EphemeralPublicKeyMessage, ProtocolMessage, SessionId, TssRoundOneMessage,
    TssRoundThreeMessage, TssRoundTwoMessage,
};
pub use tss::{SecretShare, TssError, TssOracle, TssOutcome};

/// Quiet and active sub-windows composing one phase, in blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhaseTiming {
    /// Blocks after phase entry during which no outbound work happens.
    pub delay_blocks: u64,
    /// Blocks during which the phase initiates its work and accepts
    /// inbound messages.
    pub active_blocks: u64,
}

impl PhaseTiming {
    pub const fn new(delay_blocks: u64, active_blocks: u64) -> Self {
        PhaseTiming {
            delay_blocks,
            active_blocks,
        }
    }

    pub fn span(&self) -> u64 {
        self.delay_blocks + self.active_blocks
    }
}

/// Block timing of every protocol phase. The defaults are the published
/// protocol constants; both windows of every phase are caller-tunable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseSchedule {
    pub ephemeral_key_pair: PhaseTiming,
    pub symmetric_key: PhaseTiming,
    pub tss_round_one: PhaseTiming,
    pub tss_round_two: PhaseTiming,
    pub tss_round_three: PhaseTiming,
    pub finalization: PhaseTiming,
}

impl Default for PhaseSchedule {
    fn default() -> Self {
        PhaseSchedule {
            ephemeral_key_pair: PhaseTiming::new(1, 5),
            symmetric_key: PhaseTiming::new(0, 0),
            tss_round_one: PhaseTiming::new(1, 5),
            tss_round_two: PhaseTiming::new(1, 10),
            tss_round_three: PhaseTiming::new(1, 5),
            finalization: PhaseTiming::new(1, 2),
        }
    }
}

impl PhaseSchedule {
    /// Total number of blocks it takes to execute all the work defined by
    /// the protocol.
    pub fn protocol_blocks(&self) -> u64 {
        self.ephemeral_key_pair.span()
            + self.symmetric_key.span()
            + self.tss_round_one.span()
            + self.tss_round_two.span()
            + self.tss_round_three.span()
            + self.finalization.span()
    }
}

/// Session parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DkgConfig {
    /// Number of members the session starts with; the roster must match.
    pub group_size: u16,
    /// Signing threshold of the generated key, `1 <= threshold < group_size`.
    pub threshold: u16,
    pub schedule: PhaseSchedule,
}

impl DkgConfig {
    pub fn new(group_size: u16, threshold: u16) -> Self {
        DkgConfig {
            group_size,
            threshold,
            schedule: PhaseSchedule::default(),
        }
    }
}

/// Outcome of a completed session.
#[derive(Debug)]
pub struct DkgResult {
    /// Identical across all honest members that reached finalization.
    pub group_public_key: Vec<u8>,
    /// This member's private share of the group key.
    pub secret_share: SecretShare,
    /// Members excluded for provably malformed messages, ascending.
    pub disqualified: Vec<MemberIndex>,
    /// Members excluded for missing a phase deadline, ascending.
    pub inactive: Vec<MemberIndex>,
}

impl DkgResult {
    pub fn group_public_key_hex(&self) -> String {
        hex::encode(&self.group_public_key)
    }
}

/// Session-fatal conditions. Malformed peer traffic is never one of them:
/// it mutates the roster and the session continues while the operating set
/// stays viable.
#[derive(Debug, Error)]
pub enum DkgError {
    #[error("the group must have at least two members, got {0}")]
    TooFewMembers(u16),
    #[error("threshold must be in range [1; {group_size}), got {threshold}")]
    InvalidThreshold { threshold: u16, group_size: u16 },
    #[error("member index {index} is not part of the group roster")]
    InvalidMemberIndex { index: MemberIndex },
    #[error("roster holds {actual} members but the configured group size is {expected}")]
    RosterSizeMismatch { expected: u16, actual: usize },
    #[error("ephemeral key generation failed: {0}")]
    EphemeralKeyGenerationFailed(#[from] KeyGenerationError),
    #[error("inactive members detected: inactive {inactive:?}, disqualified {disqualified:?}")]
    InactiveMembersDetected {
        inactive: Vec<MemberIndex>,
        disqualified: Vec<MemberIndex>,
    },
    #[error("phase `{0}` did not complete within its active window")]
    PhaseTimeout(&'static str),
    #[error("cryptographic failure in phase `{phase}`: {source}")]
    CryptographicFailure {
        phase: &'static str,
        #[source]
        source: TssError,
    },
    #[error("broadcast transport shut down")]
    TransportShutdown,
    #[error("block height source terminated")]
    ChainShutdown,
    #[error("session cancelled")]
    Cancelled,
    #[error("unexpected session state: {0}")]
    Internal(String),
}

impl From<SendError> for DkgError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Shutdown => DkgError::TransportShutdown,
            SendError::Cancelled => DkgError::Cancelled,
        }
    }
}

impl From<ChainShutdown> for DkgError {
    fn from(_: ChainShutdown) -> Self {
        DkgError::ChainShutdown
    }
}

#[cfg(test)]
mod schedule_test {
    use super::*;

    #[test]
    fn default_schedule_spans_the_published_constants() {
        // delays 1+0+1+1+1+1 plus active windows 5+0+5+10+5+2
        assert_eq!(PhaseSchedule::default().protocol_blocks(), 32);
    }

    #[test]
    fn protocol_blocks_is_the_sum_of_all_windows() {
        let schedule = PhaseSchedule {
            ephemeral_key_pair: PhaseTiming::new(2, 3),
            symmetric_key: PhaseTiming::new(0, 1),
            tss_round_one: PhaseTiming::new(1, 4),
            tss_round_two: PhaseTiming::new(1, 7),
            tss_round_three: PhaseTiming::new(1, 4),
            finalization: PhaseTiming::new(2, 2),
        };
        assert_eq!(schedule.protocol_blocks(), 2 + 3 + 1 + 1 + 4 + 1 + 7 + 1 + 4 + 2 + 2);
    }
}
