//! Membership accounting for a single DKG session.
//!
//! The roster is the sole authority consulted for every inbound protocol
//! message. Member status moves monotonically from operating to inactive or
//! disqualified; there is no way back within a session.

use std::collections::{BTreeMap, BTreeSet};

/// Index of a group member, unique and stable for the session duration.
/// Indices start at 1.
pub type MemberIndex = u16;

/// Long-term public key a member signs its network traffic with.
///
/// The key bytes are opaque to the protocol core; they are only ever compared
/// against the key the transport attached to an inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorPublicKey(Vec<u8>);

impl OperatorPublicKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        OperatorPublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for OperatorPublicKey {
    fn from(bytes: &[u8]) -> Self {
        OperatorPublicKey(bytes.to_vec())
    }
}

/// Per-session member roster.
///
/// Construction fixes the initial membership; afterwards the only mutations
/// are the two status transitions. The scheduler is the single writer.
#[derive(Clone, Debug)]
pub struct Group {
    members: BTreeMap<MemberIndex, OperatorPublicKey>,
    inactive: BTreeSet<MemberIndex>,
    disqualified: BTreeSet<MemberIndex>,
}

impl Group {
    pub fn new(members: BTreeMap<MemberIndex, OperatorPublicKey>) -> Self {
        Group {
            members,
            inactive: BTreeSet::new(),
            disqualified: BTreeSet::new(),
        }
    }

    /// Number of members the session started with. Status transitions do not
    /// change it.
    pub fn group_size(&self) -> usize {
        self.members.len()
    }

    /// All members of the initial roster, ascending.
    pub fn member_ids(&self) -> Vec<MemberIndex> {
        self.members.keys().copied().collect()
    }

    /// Members still in the operating state, ascending.
    pub fn operating_member_ids(&self) -> Vec<MemberIndex> {
        self.members
            .keys()
            .copied()
            .filter(|id| self.is_operating(*id))
            .collect()
    }

    pub fn is_registered(&self, id: MemberIndex) -> bool {
        self.members.contains_key(&id)
    }

    pub fn is_operating(&self, id: MemberIndex) -> bool {
        self.members.contains_key(&id)
            && !self.inactive.contains(&id)
            && !self.disqualified.contains(&id)
    }

    /// Marks a member inactive. Idempotent; a member already disqualified
    /// keeps its first classification.
    pub fn mark_inactive(&mut self, id: MemberIndex) {
        if self.members.contains_key(&id) && !self.disqualified.contains(&id) {
            self.inactive.insert(id);
        }
    }

    /// Marks a member disqualified. Idempotent; a member already inactive
    /// keeps its first classification.
    pub fn mark_disqualified(&mut self, id: MemberIndex) {
        if self.members.contains_key(&id) && !self.inactive.contains(&id) {
            self.disqualified.insert(id);
        }
    }

    pub fn inactive_members(&self) -> Vec<MemberIndex> {
        self.inactive.iter().copied().collect()
    }

    pub fn disqualified_members(&self) -> Vec<MemberIndex> {
        self.disqualified.iter().copied().collect()
    }

    /// The single acceptance predicate for inbound traffic: the sender must
    /// be a registered, still-operating member and the key the transport
    /// authenticated must equal the registered one. Everything that fails
    /// here is dropped before any cryptographic work.
    pub fn should_accept_message(
        &self,
        sender: MemberIndex,
        sender_public_key: &OperatorPublicKey,
    ) -> bool {
        if !self.is_operating(sender) {
            return false;
        }
        match self.members.get(&sender) {
            Some(registered) => registered == sender_public_key,
            None => false,
        }
    }
}
