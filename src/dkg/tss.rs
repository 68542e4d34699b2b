//! Contract for the threshold-scheme primitives driven by the scheduler.
//!
//! The state machine deliberately does not know which threshold-ECDSA (or
//! other) scheme produces the round payloads; it hands each round the
//! previous round's accepted messages in ascending sender order and expects
//! one outbound payload back. Swapping schemes must not change the state
//! machine.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroize;

use crate::ephemeral::SymmetricKeyring;
use crate::group::MemberIndex;

/// Failure of a round computation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TssError {
    /// The computation observed its cancellation token before finishing.
    /// The scheduler reports this as a phase timeout.
    #[error("computation cancelled before completion")]
    Cancelled,
    /// A specific member's previous-round payload failed cryptographic
    /// verification. The offender is disqualified before the session aborts.
    #[error("round input from member {0} failed cryptographic verification")]
    Misbehaviour(MemberIndex),
    /// The computation rejected its inputs without being able to attribute
    /// the fault.
    #[error("threshold computation failed: {0}")]
    Failure(String),
}

/// This member's private share of the generated group key.
pub struct SecretShare(Vec<u8>);

impl SecretShare {
    pub fn new(bytes: Vec<u8>) -> Self {
        SecretShare(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for SecretShare {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecretShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretShare(..)")
    }
}

/// Output of the closing threshold step.
#[derive(Debug)]
pub struct TssOutcome {
    /// Identical across all honest members that reach finalization.
    pub group_public_key: Vec<u8>,
    /// Private to this member.
    pub secret_share: SecretShare,
}

/// The opaque cryptographic oracle executing the threshold rounds.
///
/// Round inputs are `(sender, payload)` pairs in ascending sender order,
/// exactly the messages the scheduler accepted for the previous round.
/// Computations may be arbitrarily expensive; implementations must observe
/// `cancel` and return [`TssError::Cancelled`] promptly once it fires, and
/// should put CPU-heavy work on a blocking task internally.
#[async_trait]
pub trait TssOracle: Send + 'static {
    /// First round. Receives the symmetric keys derived during the key
    /// exchange, for protecting member-to-member payloads in this and
    /// later rounds.
    async fn round_one(
        &mut self,
        cancel: &CancellationToken,
        keys: SymmetricKeyring,
    ) -> Result<Vec<u8>, TssError>;

    async fn round_two(
        &mut self,
        cancel: &CancellationToken,
        round_one: &[(MemberIndex, Vec<u8>)],
    ) -> Result<Vec<u8>, TssError>;

    async fn round_three(
        &mut self,
        cancel: &CancellationToken,
        round_two: &[(MemberIndex, Vec<u8>)],
    ) -> Result<Vec<u8>, TssError>;

    /// Closing step; consumes the accepted round-three messages and yields
    /// the group key handle. No partial result is surfaced on failure.
    async fn finalize(
        &mut self,
        cancel: &CancellationToken,
        round_three: &[(MemberIndex, Vec<u8>)],
    ) -> Result<TssOutcome, TssError>;
}
