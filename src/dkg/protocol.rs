//! Per-phase member operations of the key-generation protocol.
//!
//! Each phase owns a member value carrying the state accumulated so far;
//! transitions consume the previous member and produce the next one. The
//! cryptographic steps of the key-exchange phases live here; the threshold
//! rounds delegate to the [`TssOracle`](super::tss::TssOracle).

use std::collections::BTreeMap;

use rand::rngs::OsRng;
use tracing::warn;

use crate::ephemeral::{EphemeralKeypair, KeyGenerationError, SymmetricKeyring};
use crate::group::{Group, MemberIndex};

use super::message::{EphemeralPublicKeyMessage, SessionId};

/// State every phase member carries: own index, session identity, and the
/// roster this member keeps for the session.
pub(super) struct MemberCore {
    pub(super) id: MemberIndex,
    pub(super) session_id: SessionId,
    pub(super) group: Group,
}

impl MemberCore {
    /// Marks as inactive every operating member, other than this one, with
    /// no entry in `messages`. Called at phase boundaries before the next
    /// computation starts.
    pub(super) fn mark_inactive_members<T>(&mut self, messages: &BTreeMap<MemberIndex, T>) {
        let missing: Vec<MemberIndex> = self
            .group
            .operating_member_ids()
            .into_iter()
            .filter(|&member| member != self.id && !messages.contains_key(&member))
            .collect();
        for member in missing {
            warn!(
                member = self.id,
                inactive = member,
                session = %self.session_id,
                "no valid message from operating member before the phase boundary"
            );
            self.group.mark_inactive(member);
        }
    }
}

/// Member of the ephemeral key generation phase.
pub(super) struct EphemeralKeyPairGeneratingMember {
    pub(super) core: MemberCore,
    ephemeral_keypairs: BTreeMap<MemberIndex, EphemeralKeypair>,
}

impl EphemeralKeyPairGeneratingMember {
    pub(super) fn new(id: MemberIndex, session_id: SessionId, group: Group) -> Self {
        EphemeralKeyPairGeneratingMember {
            core: MemberCore {
                id,
                session_id,
                group,
            },
            ephemeral_keypairs: BTreeMap::new(),
        }
    }

    /// Generates an ephemeral ECDH keypair for every other group member and
    /// returns the message broadcasting all the public halves.
    pub(super) fn generate_ephemeral_key_pairs(
        &mut self,
    ) -> Result<EphemeralPublicKeyMessage, KeyGenerationError> {
        let mut ephemeral_public_keys = BTreeMap::new();

        for member in self.core.group.member_ids() {
            if member == self.core.id {
                // don't generate a key with ourselves
                continue;
            }

            let keypair = EphemeralKeypair::generate(&mut OsRng)?;
            ephemeral_public_keys.insert(member, keypair.public_key());
            self.ephemeral_keypairs.insert(member, keypair);
        }

        Ok(EphemeralPublicKeyMessage {
            sender_id: self.core.id,
            session_id: self.core.session_id.clone(),
            ephemeral_public_keys,
        })
    }

    pub(super) fn into_symmetric_key_generating(self) -> SymmetricKeyGeneratingMember {
        SymmetricKeyGeneratingMember {
            core: self.core,
            ephemeral_keypairs: self.ephemeral_keypairs,
            symmetric_keys: SymmetricKeyring::new(),
        }
    }
}

/// Member of the symmetric key derivation phase.
pub(super) struct SymmetricKeyGeneratingMember {
    pub(super) core: MemberCore,
    ephemeral_keypairs: BTreeMap<MemberIndex, EphemeralKeypair>,
    symmetric_keys: SymmetricKeyring,
}

impl SymmetricKeyGeneratingMember {
    /// Derives a symmetric key for every peer whose ephemeral public keys
    /// arrived in time. A peer whose message does not cover the whole group,
    /// or carries an undecodable key, is disqualified on the spot; the
    /// session's viability is re-checked by the caller afterwards.
    pub(super) fn generate_symmetric_keys(
        &mut self,
        messages: &BTreeMap<MemberIndex, EphemeralPublicKeyMessage>,
    ) {
        for (&other_member, message) in messages {
            if !self.is_valid_ephemeral_public_key_message(message) {
                warn!(
                    member = self.core.id,
                    sender = other_member,
                    session = %self.core.session_id,
                    "member disqualified for an invalid ephemeral public key message"
                );
                self.core.group.mark_disqualified(other_member);
                continue;
            }

            // validity guarantees an entry addressed to us and a local
            // keypair generated for the sender
            let addressed_to_us = match message.ephemeral_public_keys.get(&self.core.id) {
                Some(public_key) => public_key,
                None => continue,
            };
            let keypair = match self.ephemeral_keypairs.get(&other_member) {
                Some(keypair) => keypair,
                None => continue,
            };

            match keypair.ecdh(addressed_to_us) {
                Ok(symmetric_key) => self.symmetric_keys.insert(other_member, symmetric_key),
                Err(_) => {
                    warn!(
                        member = self.core.id,
                        sender = other_member,
                        session = %self.core.session_id,
                        "member disqualified for an undecodable ephemeral public key"
                    );
                    self.core.group.mark_disqualified(other_member);
                }
            }
        }
    }

    /// A message is valid when it contains an ephemeral public key for every
    /// initial group member other than its sender.
    fn is_valid_ephemeral_public_key_message(&self, message: &EphemeralPublicKeyMessage) -> bool {
        for member in self.core.group.member_ids() {
            if member == message.sender_id {
                // messages carry keys only for the other group members
                continue;
            }

            if !message.ephemeral_public_keys.contains_key(&member) {
                warn!(
                    member = self.core.id,
                    sender = message.sender_id,
                    missing = member,
                    "ephemeral public key message misses a recipient"
                );
                return false;
            }
        }

        true
    }

    pub(super) fn into_tss_round_one(self) -> (MemberCore, SymmetricKeyring) {
        (self.core, self.symmetric_keys)
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use crate::group::OperatorPublicKey;

    use super::*;

    fn group_of(n: u16) -> Group {
        let members = (1..=n)
            .map(|i| (i, OperatorPublicKey::new(vec![i as u8])))
            .collect();
        Group::new(members)
    }

    fn member(id: MemberIndex, n: u16) -> EphemeralKeyPairGeneratingMember {
        EphemeralKeyPairGeneratingMember::new(id, SessionId::new(vec![0x01]), group_of(n))
    }

    #[test]
    fn keypairs_cover_every_other_member() {
        let mut generating = member(2, 4);
        let message = generating.generate_ephemeral_key_pairs().unwrap();

        assert_eq!(message.sender_id, 2);
        let recipients: Vec<MemberIndex> =
            message.ephemeral_public_keys.keys().copied().collect();
        assert_eq!(recipients, vec![1, 3, 4]);
    }

    #[test]
    fn peers_derive_matching_symmetric_keys() {
        let mut first = member(1, 2);
        let mut second = member(2, 2);
        let first_message = first.generate_ephemeral_key_pairs().unwrap();
        let second_message = second.generate_ephemeral_key_pairs().unwrap();

        let mut first = first.into_symmetric_key_generating();
        let mut second = second.into_symmetric_key_generating();

        let mut for_first = BTreeMap::new();
        for_first.insert(2, second_message);
        first.generate_symmetric_keys(&for_first);

        let mut for_second = BTreeMap::new();
        for_second.insert(1, first_message);
        second.generate_symmetric_keys(&for_second);

        let (_, first_keys) = first.into_tss_round_one();
        let (_, second_keys) = second.into_tss_round_one();

        let message = b"attested payload";
        let ciphertext = first_keys
            .get(2)
            .unwrap()
            .encrypt(&mut rand::rngs::OsRng, message);
        assert_eq!(
            second_keys.get(1).unwrap().decrypt(&ciphertext).unwrap(),
            message
        );
    }

    #[test]
    fn missing_recipient_disqualifies_the_sender() {
        let mut first = member(1, 3);
        let mut third = member(3, 3);
        first.generate_ephemeral_key_pairs().unwrap();
        let mut incomplete = third.generate_ephemeral_key_pairs().unwrap();
        // drop the entry addressed to member 2
        incomplete.ephemeral_public_keys.remove(&2);

        let mut first = first.into_symmetric_key_generating();
        let mut messages = BTreeMap::new();
        messages.insert(3, incomplete);
        first.generate_symmetric_keys(&messages);

        let (core, keys) = first.into_tss_round_one();
        assert_eq!(core.group.disqualified_members(), vec![3]);
        assert!(keys.is_empty());
    }

    #[test]
    fn silent_members_are_marked_inactive() {
        let mut generating = member(1, 4);
        generating.generate_ephemeral_key_pairs().unwrap();
        let mut symmetric = generating.into_symmetric_key_generating();

        // only member 2 spoke up
        let mut spoke = BTreeMap::new();
        spoke.insert(2u16, ());
        symmetric.core.mark_inactive_members(&spoke);

        assert_eq!(symmetric.core.group.inactive_members(), vec![3, 4]);
        assert_eq!(symmetric.core.group.operating_member_ids(), vec![1, 2]);
    }
}
