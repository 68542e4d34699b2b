//! The scheduler advancing a member through the protocol phases in
//! lock-step with the block clock.
//!
//! Phases occupy contiguous, non-overlapping block ranges starting at the
//! session's start block. Every phase gets a quiet window first, during
//! which inbound traffic is drained into it, then an active window during
//! which it initiates its outbound work and keeps accepting messages. When
//! the active window's closing block is observed the phase context is
//! cancelled and the phase's verdict decides whether the session moves on.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chain::BlockClock;
use crate::group::{Group, MemberIndex};
use crate::net::{BroadcastChannel, IncomingMessage};

use super::message::{ProtocolMessage, SessionId};
use super::protocol::EphemeralKeyPairGeneratingMember;
use super::states::{Phase, Transition};
use super::tss::TssOracle;
use super::{DkgConfig, DkgError, DkgResult};

/// Executes one full DKG session for the local member.
///
/// The session runs from `start_block` for at most
/// [`PhaseSchedule::protocol_blocks`](super::PhaseSchedule::protocol_blocks)
/// blocks and either yields the session [`DkgResult`] or aborts at the
/// first phase boundary that observes a fatal condition. `cancel` is the
/// session context: cancelling it aborts at the next suspension point.
#[allow(clippy::too_many_arguments)]
pub async fn run_dkg<T: TssOracle>(
    cancel: CancellationToken,
    session_id: SessionId,
    member_index: MemberIndex,
    group: Group,
    start_block: u64,
    channel: BroadcastChannel<ProtocolMessage>,
    clock: BlockClock,
    config: DkgConfig,
    oracle: T,
) -> Result<DkgResult, DkgError> {
    validate_parameters(&config, member_index, &group)?;

    info!(
        member = member_index,
        session = %session_id,
        start_block,
        group_size = config.group_size,
        threshold = config.threshold,
        "starting distributed key generation"
    );

    let (sender, mut incoming) = channel.split();
    let member = EphemeralKeyPairGeneratingMember::new(member_index, session_id.clone(), group);
    let mut phase = Phase::first(member, oracle);
    let mut entry = start_block;

    loop {
        let timing = phase.timing(&config.schedule);
        let initiate_at = entry + timing.delay_blocks;
        let window_end = initiate_at + timing.active_blocks;

        debug!(
            member = member_index,
            phase = phase.name(),
            entry,
            initiate_at,
            window_end,
            "entering phase"
        );

        // quiet window: network settles, early same-phase traffic is drained
        pump(&cancel, &clock, &mut incoming, &mut phase, initiate_at).await?;

        let phase_cancel = cancel.child_token();
        phase.initiate(&phase_cancel, &sender).await?;

        // active window
        pump(&cancel, &clock, &mut incoming, &mut phase, window_end).await?;

        // give a computation signalling on the closing block a chance to
        // land before the phase context is torn down
        tokio::task::yield_now().await;
        phase_cancel.cancel();

        let transition = tokio::select! {
            biased;
            transition = phase.finish() => transition?,
            _ = cancel.cancelled() => return Err(DkgError::Cancelled),
        };

        match transition {
            Transition::Continue(next) => {
                phase = next;
                entry = window_end;
            }
            Transition::Complete { outcome, group } => {
                info!(
                    member = member_index,
                    session = %session_id,
                    group_public_key = %hex::encode(&outcome.group_public_key),
                    "distributed key generation completed"
                );
                return Ok(DkgResult {
                    group_public_key: outcome.group_public_key,
                    secret_share: outcome.secret_share,
                    disqualified: group.disqualified_members(),
                    inactive: group.inactive_members(),
                });
            }
        }
    }
}

/// Routes inbound messages into the current phase until the chain reaches
/// `until`. The height check wins ties against queued traffic, so a message
/// observed after the boundary block never reaches the closing phase.
async fn pump<T: TssOracle>(
    cancel: &CancellationToken,
    clock: &BlockClock,
    incoming: &mut mpsc::Receiver<IncomingMessage<ProtocolMessage>>,
    phase: &mut Phase<T>,
    until: u64,
) -> Result<(), DkgError> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DkgError::Cancelled),
            reached = clock.wait_until(until) => {
                reached?;
                return Ok(());
            }
            received = incoming.recv() => match received {
                Some(message) => phase.receive(message),
                None => return Err(DkgError::TransportShutdown),
            },
        }
    }
}

fn validate_parameters(
    config: &DkgConfig,
    member_index: MemberIndex,
    group: &Group,
) -> Result<(), DkgError> {
    if config.group_size < 2 {
        return Err(DkgError::TooFewMembers(config.group_size));
    }
    if config.threshold == 0 || config.threshold >= config.group_size {
        return Err(DkgError::InvalidThreshold {
            threshold: config.threshold,
            group_size: config.group_size,
        });
    }
    if group.group_size() != usize::from(config.group_size) {
        return Err(DkgError::RosterSizeMismatch {
            expected: config.group_size,
            actual: group.group_size(),
        });
    }
    if !group.is_registered(member_index) {
        return Err(DkgError::InvalidMemberIndex {
            index: member_index,
        });
    }
    Ok(())
}
