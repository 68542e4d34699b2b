//! Core of a threshold-cryptography client taking part in a distributed
//! random beacon: a block-timed, multi-phase distributed key generation
//! state machine.
//!
//! The surrounding beacon wires chain events to sessions; this crate owns
//! everything between "a group was selected" and "the group has a key":
//! the phase scheduler, the member accounting, the ephemeral key exchange,
//! and the contract for the threshold primitives executed inside the
//! rounds. Protocol time is block height, observed through
//! [`chain::BlockClock`]; peer traffic arrives through an authenticated
//! [`net::BroadcastChannel`] the transport layer multiplexes per session.
//!
//! ## How to use it
//!
//! Supply the chain adapter, the per-session channel handle, the group
//! roster and a [`dkg::TssOracle`] implementation, then run the session:
//!
//! ```no_run
//! use std::collections::BTreeMap;
//!
//! use async_trait::async_trait;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! use beacon_dkg::chain::BlockClock;
//! use beacon_dkg::dkg::{
//!     run_dkg, DkgConfig, SecretShare, SessionId, TssError, TssOracle, TssOutcome,
//! };
//! use beacon_dkg::ephemeral::SymmetricKeyring;
//! use beacon_dkg::group::{Group, MemberIndex, OperatorPublicKey};
//! use beacon_dkg::net::BroadcastChannel;
//!
//! # struct Scheme;
//! #
//! # #[async_trait]
//! # impl TssOracle for Scheme {
//! #     async fn round_one(
//! #         &mut self,
//! #         _cancel: &CancellationToken,
//! #         _keys: SymmetricKeyring,
//! #     ) -> Result<Vec<u8>, TssError> {
//! #         Ok(Vec::new())
//! #     }
//! #     async fn round_two(
//! #         &mut self,
//! #         _cancel: &CancellationToken,
//! #         _round_one: &[(MemberIndex, Vec<u8>)],
//! #     ) -> Result<Vec<u8>, TssError> {
//! #         Ok(Vec::new())
//! #     }
//! #     async fn round_three(
//! #         &mut self,
//! #         _cancel: &CancellationToken,
//! #         _round_two: &[(MemberIndex, Vec<u8>)],
//! #     ) -> Result<Vec<u8>, TssError> {
//! #         Ok(Vec::new())
//! #     }
//! #     async fn finalize(
//! #         &mut self,
//! #         _cancel: &CancellationToken,
//! #         _round_three: &[(MemberIndex, Vec<u8>)],
//! #     ) -> Result<TssOutcome, TssError> {
//! #         Ok(TssOutcome {
//! #             group_public_key: Vec::new(),
//! #             secret_share: SecretShare::new(Vec::new()),
//! #         })
//! #     }
//! # }
//! #
//! # async fn session() -> Result<(), Box<dyn std::error::Error>> {
//! // the chain adapter publishes heights, the transport wires the queues
//! let (_height_tx, clock) = BlockClock::channel(100);
//! let (out_tx, _out_rx) = mpsc::channel(64);
//! let (_in_tx, in_rx) = mpsc::channel(64);
//! let channel = BroadcastChannel::new(out_tx, in_rx);
//!
//! let mut members = BTreeMap::new();
//! members.insert(1u16, OperatorPublicKey::new(vec![0x01]));
//! members.insert(2u16, OperatorPublicKey::new(vec![0x02]));
//!
//! let result = run_dkg(
//!     CancellationToken::new(),
//!     SessionId::new(b"request-7".to_vec()),
//!     1,
//!     Group::new(members),
//!     100,
//!     channel,
//!     clock,
//!     DkgConfig::new(2, 1),
//!     Scheme,
//! )
//! .await?;
//!
//! println!("group key: {}", result.group_public_key_hex());
//! # Ok(())
//! # }
//! ```
//!
//! A member whose expected message never arrives is marked inactive, a
//! member whose message is provably malformed is disqualified; both
//! exclusions are monotone for the session and surface in the result and
//! in every abort. Sessions never recover state across process restarts;
//! the caller starts a fresh session with a new [`dkg::SessionId`] instead.

pub mod chain;
pub mod dkg;
pub mod ephemeral;
pub mod group;
pub mod net;
