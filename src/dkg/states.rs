//! The per-phase states the scheduler advances through.
//!
//! Each phase owns its accumulator and is consumed on transition; the
//! scheduler only ever sees the current variant. Message-producing phases
//! append to their accumulator through the shared acceptance pipeline;
//! computation-heavy phases run their cryptography on a background task and
//! report through a pair of single-use channels, so reception continues
//! while the computation is in flight.

use std::collections::BTreeMap;
use std::mem;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ephemeral::SymmetricKeyring;
use crate::group::{Group, MemberIndex, OperatorPublicKey};
use crate::net::{BroadcastSender, IncomingMessage};

use super::message::{
    EphemeralPublicKeyMessage, PhasePayload, ProtocolMessage, SessionId, TssRoundOneMessage,
    TssRoundThreeMessage, TssRoundTwoMessage,
};
use super::protocol::{EphemeralKeyPairGeneratingMember, MemberCore, SymmetricKeyGeneratingMember};
use super::tss::{TssError, TssOracle, TssOutcome};
use super::{DkgError, PhaseSchedule, PhaseTiming};

pub(super) const EPHEMERAL_KEY_PAIR_PHASE: &str = "ephemeral key pair generation";
pub(super) const SYMMETRIC_KEY_PHASE: &str = "symmetric key generation";
pub(super) const TSS_ROUND_ONE_PHASE: &str = "tss round one";
pub(super) const TSS_ROUND_TWO_PHASE: &str = "tss round two";
pub(super) const TSS_ROUND_THREE_PHASE: &str = "tss round three";
pub(super) const FINALIZATION_PHASE: &str = "finalization";

/// Current phase of one member's session.
pub(super) enum Phase<T: TssOracle> {
    EphemeralKeyPair(EphemeralKeyPairGenerationState<T>),
    SymmetricKey(SymmetricKeyGenerationState<T>),
    TssRoundOne(TssRoundOneState<T>),
    TssRoundTwo(TssRoundTwoState<T>),
    TssRoundThree(TssRoundThreeState<T>),
    Finalization(FinalizationState<T>),
}

/// What a finished phase hands back to the scheduler.
pub(super) enum Transition<T: TssOracle> {
    Continue(Phase<T>),
    Complete { outcome: TssOutcome, group: Group },
}

/// State during which members broadcast the public ephemeral keys generated
/// for the other members. Ephemeral public key messages are valid here.
pub(super) struct EphemeralKeyPairGenerationState<T: TssOracle> {
    member: EphemeralKeyPairGeneratingMember,
    oracle: T,
    phase_messages: BTreeMap<MemberIndex, EphemeralPublicKeyMessage>,
}

/// State during which members derive per-peer symmetric keys from the
/// exchanged ephemeral keys. No messages are valid here; the whole phase
/// runs synchronously inside its initiation.
pub(super) struct SymmetricKeyGenerationState<T: TssOracle> {
    member: SymmetricKeyGeneratingMember,
    oracle: T,
    previous_phase_messages: BTreeMap<MemberIndex, EphemeralPublicKeyMessage>,
}

/// State wrapping the first threshold round. Round-one messages are valid.
pub(super) struct TssRoundOneState<T: TssOracle> {
    core: MemberCore,
    launch: Option<(T, SymmetricKeyring)>,
    success: Option<oneshot::Receiver<T>>,
    error: Option<oneshot::Receiver<DkgError>>,
    phase_messages: BTreeMap<MemberIndex, TssRoundOneMessage>,
}

/// State wrapping the second threshold round. Round-two messages are valid.
pub(super) struct TssRoundTwoState<T: TssOracle> {
    core: MemberCore,
    launch: Option<T>,
    success: Option<oneshot::Receiver<T>>,
    error: Option<oneshot::Receiver<DkgError>>,
    previous_phase_messages: BTreeMap<MemberIndex, TssRoundOneMessage>,
    phase_messages: BTreeMap<MemberIndex, TssRoundTwoMessage>,
}

/// State wrapping the third threshold round. Round-three messages are valid.
pub(super) struct TssRoundThreeState<T: TssOracle> {
    core: MemberCore,
    launch: Option<T>,
    success: Option<oneshot::Receiver<T>>,
    error: Option<oneshot::Receiver<DkgError>>,
    previous_phase_messages: BTreeMap<MemberIndex, TssRoundTwoMessage>,
    phase_messages: BTreeMap<MemberIndex, TssRoundThreeMessage>,
}

/// The closing state. No messages are valid; the closing threshold step
/// produces the session result.
pub(super) struct FinalizationState<T: TssOracle> {
    core: MemberCore,
    launch: Option<T>,
    success: Option<oneshot::Receiver<TssOutcome>>,
    error: Option<oneshot::Receiver<DkgError>>,
    previous_phase_messages: BTreeMap<MemberIndex, TssRoundThreeMessage>,
}

impl<T: TssOracle> Phase<T> {
    pub(super) fn first(member: EphemeralKeyPairGeneratingMember, oracle: T) -> Self {
        Phase::EphemeralKeyPair(EphemeralKeyPairGenerationState {
            member,
            oracle,
            phase_messages: BTreeMap::new(),
        })
    }

    pub(super) fn name(&self) -> &'static str {
        match self {
            Phase::EphemeralKeyPair(_) => EPHEMERAL_KEY_PAIR_PHASE,
            Phase::SymmetricKey(_) => SYMMETRIC_KEY_PHASE,
            Phase::TssRoundOne(_) => TSS_ROUND_ONE_PHASE,
            Phase::TssRoundTwo(_) => TSS_ROUND_TWO_PHASE,
            Phase::TssRoundThree(_) => TSS_ROUND_THREE_PHASE,
            Phase::Finalization(_) => FINALIZATION_PHASE,
        }
    }

    pub(super) fn timing(&self, schedule: &PhaseSchedule) -> PhaseTiming {
        match self {
            Phase::EphemeralKeyPair(_) => schedule.ephemeral_key_pair,
            Phase::SymmetricKey(_) => schedule.symmetric_key,
            Phase::TssRoundOne(_) => schedule.tss_round_one,
            Phase::TssRoundTwo(_) => schedule.tss_round_two,
            Phase::TssRoundThree(_) => schedule.tss_round_three,
            Phase::Finalization(_) => schedule.finalization,
        }
    }

    /// Kicks off the phase's outbound work. The key-exchange phases complete
    /// synchronously; the threshold phases dispatch their computation on a
    /// background task sharing the phase context and return promptly so the
    /// scheduler can keep routing inbound messages.
    pub(super) async fn initiate(
        &mut self,
        cancel: &CancellationToken,
        sender: &BroadcastSender<ProtocolMessage>,
    ) -> Result<(), DkgError> {
        match self {
            Phase::EphemeralKeyPair(state) => {
                let message = state.member.generate_ephemeral_key_pairs()?;
                sender
                    .send(cancel, ProtocolMessage::EphemeralPublicKey(message))
                    .await?;
                Ok(())
            }
            Phase::SymmetricKey(state) => {
                state
                    .member
                    .core
                    .mark_inactive_members(&state.previous_phase_messages);
                check_group_viability(&state.member.core.group)?;

                state
                    .member
                    .generate_symmetric_keys(&state.previous_phase_messages);
                check_group_viability(&state.member.core.group)
            }
            Phase::TssRoundOne(state) => {
                let (oracle, keys) = state
                    .launch
                    .take()
                    .ok_or_else(|| DkgError::Internal("tss round one initiated twice".into()))?;
                let (success, error) = launch_round(
                    oracle,
                    cancel,
                    sender,
                    state.core.id,
                    state.core.session_id.clone(),
                    TSS_ROUND_ONE_PHASE,
                    move |mut oracle, cancel| async move {
                        let payload = oracle.round_one(&cancel, keys).await?;
                        Ok((oracle, payload))
                    },
                    |sender_id, session_id, payload| {
                        ProtocolMessage::TssRoundOne(TssRoundOneMessage {
                            sender_id,
                            session_id,
                            payload,
                        })
                    },
                );
                state.success = Some(success);
                state.error = Some(error);
                Ok(())
            }
            Phase::TssRoundTwo(state) => {
                state
                    .core
                    .mark_inactive_members(&state.previous_phase_messages);
                check_group_viability(&state.core.group)?;

                let oracle = state
                    .launch
                    .take()
                    .ok_or_else(|| DkgError::Internal("tss round two initiated twice".into()))?;
                let inputs: Vec<(MemberIndex, Vec<u8>)> =
                    mem::take(&mut state.previous_phase_messages)
                        .into_iter()
                        .map(|(member, message)| (member, message.payload))
                        .collect();
                let (success, error) = launch_round(
                    oracle,
                    cancel,
                    sender,
                    state.core.id,
                    state.core.session_id.clone(),
                    TSS_ROUND_TWO_PHASE,
                    move |mut oracle, cancel| async move {
                        let payload = oracle.round_two(&cancel, &inputs).await?;
                        Ok((oracle, payload))
                    },
                    |sender_id, session_id, payload| {
                        ProtocolMessage::TssRoundTwo(TssRoundTwoMessage {
                            sender_id,
                            session_id,
                            payload,
                        })
                    },
                );
                state.success = Some(success);
                state.error = Some(error);
                Ok(())
            }
            Phase::TssRoundThree(state) => {
                state
                    .core
                    .mark_inactive_members(&state.previous_phase_messages);
                check_group_viability(&state.core.group)?;

                let oracle = state
                    .launch
                    .take()
                    .ok_or_else(|| DkgError::Internal("tss round three initiated twice".into()))?;
                let inputs: Vec<(MemberIndex, Vec<u8>)> =
                    mem::take(&mut state.previous_phase_messages)
                        .into_iter()
                        .map(|(member, message)| (member, message.payload))
                        .collect();
                let (success, error) = launch_round(
                    oracle,
                    cancel,
                    sender,
                    state.core.id,
                    state.core.session_id.clone(),
                    TSS_ROUND_THREE_PHASE,
                    move |mut oracle, cancel| async move {
                        let payload = oracle.round_three(&cancel, &inputs).await?;
                        Ok((oracle, payload))
                    },
                    |sender_id, session_id, payload| {
                        ProtocolMessage::TssRoundThree(TssRoundThreeMessage {
                            sender_id,
                            session_id,
                            payload,
                        })
                    },
                );
                state.success = Some(success);
                state.error = Some(error);
                Ok(())
            }
            Phase::Finalization(state) => {
                state
                    .core
                    .mark_inactive_members(&state.previous_phase_messages);
                check_group_viability(&state.core.group)?;

                let mut oracle = state
                    .launch
                    .take()
                    .ok_or_else(|| DkgError::Internal("finalization initiated twice".into()))?;
                let inputs: Vec<(MemberIndex, Vec<u8>)> =
                    mem::take(&mut state.previous_phase_messages)
                        .into_iter()
                        .map(|(member, message)| (member, message.payload))
                        .collect();

                let (success_tx, success_rx) = oneshot::channel();
                let (error_tx, error_rx) = oneshot::channel();
                state.success = Some(success_rx);
                state.error = Some(error_rx);

                let cancel = cancel.clone();
                tokio::spawn(async move {
                    match oracle.finalize(&cancel, &inputs).await {
                        Ok(outcome) => {
                            let _ = success_tx.send(outcome);
                        }
                        Err(TssError::Cancelled) => {
                            let _ = error_tx.send(DkgError::Cancelled);
                        }
                        Err(source) => {
                            let _ = error_tx.send(DkgError::CryptographicFailure {
                                phase: FINALIZATION_PHASE,
                                source,
                            });
                        }
                    }
                });
                Ok(())
            }
        }
    }

    /// Routes one inbound message into the current phase. A payload whose
    /// variant does not belong to this phase is dropped silently; matching
    /// payloads go through the acceptance pipeline.
    pub(super) fn receive(&mut self, message: IncomingMessage<ProtocolMessage>) {
        let IncomingMessage {
            payload,
            sender_public_key,
        } = message;

        match self {
            Phase::EphemeralKeyPair(state) => match payload {
                ProtocolMessage::EphemeralPublicKey(m) => accept_message(
                    &state.member.core,
                    &mut state.phase_messages,
                    m,
                    &sender_public_key,
                    EPHEMERAL_KEY_PAIR_PHASE,
                ),
                other => drop_mismatched(state.member.core.id, &other, EPHEMERAL_KEY_PAIR_PHASE),
            },
            Phase::SymmetricKey(state) => {
                drop_mismatched(state.member.core.id, &payload, SYMMETRIC_KEY_PHASE)
            }
            Phase::TssRoundOne(state) => match payload {
                ProtocolMessage::TssRoundOne(m) => accept_message(
                    &state.core,
                    &mut state.phase_messages,
                    m,
                    &sender_public_key,
                    TSS_ROUND_ONE_PHASE,
                ),
                other => drop_mismatched(state.core.id, &other, TSS_ROUND_ONE_PHASE),
            },
            Phase::TssRoundTwo(state) => match payload {
                ProtocolMessage::TssRoundTwo(m) => accept_message(
                    &state.core,
                    &mut state.phase_messages,
                    m,
                    &sender_public_key,
                    TSS_ROUND_TWO_PHASE,
                ),
                other => drop_mismatched(state.core.id, &other, TSS_ROUND_TWO_PHASE),
            },
            Phase::TssRoundThree(state) => match payload {
                ProtocolMessage::TssRoundThree(m) => accept_message(
                    &state.core,
                    &mut state.phase_messages,
                    m,
                    &sender_public_key,
                    TSS_ROUND_THREE_PHASE,
                ),
                other => drop_mismatched(state.core.id, &other, TSS_ROUND_THREE_PHASE),
            },
            Phase::Finalization(state) => {
                drop_mismatched(state.core.id, &payload, FINALIZATION_PHASE)
            }
        }
    }

    /// Freezes the accumulated messages and produces the next phase, or the
    /// session result after finalization. For computation phases this
    /// settles the background task's verdict: success hands the oracle (or
    /// the outcome) forward, a cancellation becomes a phase timeout, and
    /// everything else aborts the session.
    pub(super) async fn finish(self) -> Result<Transition<T>, DkgError> {
        match self {
            Phase::EphemeralKeyPair(state) => {
                Ok(Transition::Continue(Phase::SymmetricKey(
                    SymmetricKeyGenerationState {
                        member: state.member.into_symmetric_key_generating(),
                        oracle: state.oracle,
                        previous_phase_messages: state.phase_messages,
                    },
                )))
            }
            Phase::SymmetricKey(state) => {
                let (core, keys) = state.member.into_tss_round_one();
                Ok(Transition::Continue(Phase::TssRoundOne(TssRoundOneState {
                    core,
                    launch: Some((state.oracle, keys)),
                    success: None,
                    error: None,
                    phase_messages: BTreeMap::new(),
                })))
            }
            Phase::TssRoundOne(mut state) => {
                let oracle = resolve_round(
                    state.success.take(),
                    state.error.take(),
                    &mut state.core.group,
                    TSS_ROUND_ONE_PHASE,
                )
                .await?;
                Ok(Transition::Continue(Phase::TssRoundTwo(TssRoundTwoState {
                    core: state.core,
                    launch: Some(oracle),
                    success: None,
                    error: None,
                    previous_phase_messages: state.phase_messages,
                    phase_messages: BTreeMap::new(),
                })))
            }
            Phase::TssRoundTwo(mut state) => {
                let oracle = resolve_round(
                    state.success.take(),
                    state.error.take(),
                    &mut state.core.group,
                    TSS_ROUND_TWO_PHASE,
                )
                .await?;
                Ok(Transition::Continue(Phase::TssRoundThree(
                    TssRoundThreeState {
                        core: state.core,
                        launch: Some(oracle),
                        success: None,
                        error: None,
                        previous_phase_messages: state.phase_messages,
                        phase_messages: BTreeMap::new(),
                    },
                )))
            }
            Phase::TssRoundThree(mut state) => {
                let oracle = resolve_round(
                    state.success.take(),
                    state.error.take(),
                    &mut state.core.group,
                    TSS_ROUND_THREE_PHASE,
                )
                .await?;
                Ok(Transition::Continue(Phase::Finalization(
                    FinalizationState {
                        core: state.core,
                        launch: Some(oracle),
                        success: None,
                        error: None,
                        previous_phase_messages: state.phase_messages,
                    },
                )))
            }
            Phase::Finalization(mut state) => {
                let outcome = resolve_round(
                    state.success.take(),
                    state.error.take(),
                    &mut state.core.group,
                    FINALIZATION_PHASE,
                )
                .await?;
                Ok(Transition::Complete {
                    outcome,
                    group: state.core.group,
                })
            }
        }
    }
}

#[cfg(test)]
impl<T: TssOracle> Phase<T> {
    /// Number of messages the current phase has accepted so far.
    pub(super) fn accepted_messages(&self) -> usize {
        match self {
            Phase::EphemeralKeyPair(state) => state.phase_messages.len(),
            Phase::SymmetricKey(state) => state.previous_phase_messages.len(),
            Phase::TssRoundOne(state) => state.phase_messages.len(),
            Phase::TssRoundTwo(state) => state.phase_messages.len(),
            Phase::TssRoundThree(state) => state.phase_messages.len(),
            Phase::Finalization(state) => state.previous_phase_messages.len(),
        }
    }
}

/// The acceptance pipeline every matching payload goes through: own traffic
/// and roster rejects are dropped, then session identity is checked, then
/// duplicates are discarded first-wins.
fn accept_message<M: PhasePayload>(
    core: &MemberCore,
    accumulator: &mut BTreeMap<MemberIndex, M>,
    message: M,
    sender_public_key: &OperatorPublicKey,
    phase: &'static str,
) {
    let sender = message.sender_id();

    if sender == core.id {
        debug!(member = core.id, phase, "dropping looped-back own message");
        return;
    }
    if !core.group.should_accept_message(sender, sender_public_key) {
        warn!(
            member = core.id,
            sender, phase, "dropping message not accepted by the roster"
        );
        return;
    }
    if message.session_id() != &core.session_id {
        warn!(
            member = core.id,
            sender,
            phase,
            session = %message.session_id(),
            "dropping message addressed to another session"
        );
        return;
    }
    if accumulator.contains_key(&sender) {
        debug!(member = core.id, sender, phase, "dropping duplicate message");
        return;
    }

    accumulator.insert(sender, message);
}

fn drop_mismatched(member: MemberIndex, payload: &ProtocolMessage, phase: &'static str) {
    debug!(
        member,
        sender = payload.sender_id(),
        phase,
        "dropping message belonging to another phase"
    );
}

fn check_group_viability(group: &Group) -> Result<(), DkgError> {
    if group.operating_member_ids().len() != group.group_size() {
        return Err(DkgError::InactiveMembersDetected {
            inactive: group.inactive_members(),
            disqualified: group.disqualified_members(),
        });
    }
    Ok(())
}

/// Dispatches one threshold round on a background task. The task computes,
/// broadcasts the result under the phase context, and signals exactly one of
/// the returned channels before it ends.
fn launch_round<T, C, F, W>(
    oracle: T,
    cancel: &CancellationToken,
    sender: &BroadcastSender<ProtocolMessage>,
    member_id: MemberIndex,
    session_id: SessionId,
    phase: &'static str,
    compute: C,
    wrap: W,
) -> (oneshot::Receiver<T>, oneshot::Receiver<DkgError>)
where
    T: TssOracle,
    C: FnOnce(T, CancellationToken) -> F + Send + 'static,
    F: std::future::Future<Output = Result<(T, Vec<u8>), TssError>> + Send + 'static,
    W: FnOnce(MemberIndex, SessionId, Vec<u8>) -> ProtocolMessage + Send + 'static,
{
    let (success_tx, success_rx) = oneshot::channel();
    let (error_tx, error_rx) = oneshot::channel();

    let cancel = cancel.clone();
    let sender = sender.clone();
    tokio::spawn(async move {
        match compute(oracle, cancel.clone()).await {
            Ok((oracle, payload)) => {
                let message = wrap(member_id, session_id, payload);
                match sender.send(&cancel, message).await {
                    Ok(()) => {
                        let _ = success_tx.send(oracle);
                    }
                    Err(err) => {
                        let _ = error_tx.send(DkgError::from(err));
                    }
                }
            }
            Err(TssError::Cancelled) => {
                let _ = error_tx.send(DkgError::Cancelled);
            }
            Err(source) => {
                let _ = error_tx.send(DkgError::CryptographicFailure { phase, source });
            }
        }
    });

    (success_rx, error_rx)
}

/// Settles a computation phase: the background task resolves exactly one of
/// the two channels. A cancellation seen there means the computation missed
/// its window; an attributable cryptographic failure extends the
/// disqualified set before the abort.
async fn resolve_round<S>(
    success: Option<oneshot::Receiver<S>>,
    error: Option<oneshot::Receiver<DkgError>>,
    group: &mut Group,
    phase: &'static str,
) -> Result<S, DkgError> {
    let success = match success {
        Some(success) => success,
        None => {
            return Err(DkgError::Internal(format!(
                "phase `{}` was never initiated",
                phase
            )))
        }
    };
    let error = match error {
        Some(error) => error,
        None => {
            return Err(DkgError::Internal(format!(
                "phase `{}` was never initiated",
                phase
            )))
        }
    };

    match success.await {
        Ok(value) => Ok(value),
        // the success channel closed: the computation took the error path
        Err(_) => match error.await {
            Ok(DkgError::Cancelled) => Err(DkgError::PhaseTimeout(phase)),
            Ok(DkgError::CryptographicFailure { phase, source }) => {
                if let TssError::Misbehaviour(member) = &source {
                    group.mark_disqualified(*member);
                }
                Err(DkgError::CryptographicFailure { phase, source })
            }
            Ok(other) => Err(other),
            Err(_) => Err(DkgError::PhaseTimeout(phase)),
        },
    }
}
