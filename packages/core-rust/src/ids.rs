//! 128-bit correlation identifiers and their generators.
//!
//! # Layout
//!
//! All identifiers are 16 bytes, little-endian:
//!
//! - transaction / action: `[0..8)` session id, `[8..16)` striped sequence value
//! - operation: `[0..6)` low 48 bits of the session id, `[6..14)` the owning
//!   action id's `[8..16)` verbatim, `[14..16)` per-action 16-bit counter
//!
//! An operation id therefore embeds the sequence component of its owning
//! action id, so the hierarchy is recoverable from the bytes alone. Packing
//! goes through the `bytes` crate's fixed-width little-endian writers.

use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{LifecycleError, Result};
use crate::sequence::{Sequence, StripedSequence};

/// Length in bytes of every identifier.
pub const ID_LEN: usize = 16;

/// Maximum number of operations a single action can mint.
pub const MAX_OPERATIONS_PER_ACTION: u64 = 65_535;

const SESSION_LOW_48_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Error returned when parsing an identifier from its hex form.
#[derive(Debug, thiserror::Error)]
#[error("invalid identifier {input:?}: {source}")]
pub struct ParseIdError {
    input: String,
    #[source]
    source: hex::FromHexError,
}

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Identifier of one process incarnation. Every id minted by the process
/// carries it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Draws a random non-zero session id.
    #[must_use]
    pub fn generate() -> Self {
        loop {
            let value: u64 = rand::random();
            if value != 0 {
                return Self(value);
            }
        }
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The low 48 bits embedded in operation ids.
    #[must_use]
    pub const fn low48(self) -> u64 {
        self.0 & SESSION_LOW_48_MASK
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

impl FromStr for SessionId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(s, &mut bytes).map_err(|source| ParseIdError {
            input: s.to_string(),
            source,
        })?;
        Ok(Self(u64::from_be_bytes(bytes)))
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Cow::<'de, str>::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// 128-bit ids
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            #[must_use]
            pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl From<[u8; ID_LEN]> for $name {
            fn from(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let mut bytes = [0u8; ID_LEN];
                hex::decode_to_slice(s, &mut bytes).map_err(|source| ParseIdError {
                    input: s.to_string(),
                    source,
                })?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let raw = Cow::<'de, str>::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

define_id!(
    /// Identifier of a [`Transaction`](crate::Transaction).
    TransactionId
);

define_id!(
    /// Identifier of an [`Action`](crate::Action).
    ActionId
);

define_id!(
    /// Identifier of an [`Operation`](crate::Operation), derived from its action's id.
    OperationId
);

/// Marker for ids using the session-scoped layout (transaction and action ids).
pub trait SessionScopedId: From<[u8; ID_LEN]> + Copy {}

macro_rules! session_scoped_accessors {
    ($($name:ident),+) => {
        $(
            impl SessionScopedId for $name {}

            impl $name {
                /// Session id stored in bytes `[0..8)`.
                #[must_use]
                pub fn session_id(&self) -> SessionId {
                    let mut head = &self.0[..8];
                    SessionId(head.get_u64_le())
                }

                /// Sequence value stored in bytes `[8..16)`.
                #[must_use]
                pub fn sequence(&self) -> u64 {
                    let mut tail = &self.0[8..];
                    tail.get_u64_le()
                }
            }
        )+
    };
}

session_scoped_accessors!(TransactionId, ActionId);

impl OperationId {
    /// Low 48 bits of the session id, bytes `[0..6)`.
    #[must_use]
    pub fn session_low48(&self) -> u64 {
        let mut head = &self.0[..6];
        head.get_uint_le(6)
    }

    /// Sequence component of the owning action id, bytes `[6..14)`.
    #[must_use]
    pub fn action_sequence(&self) -> u64 {
        let mut middle = &self.0[6..14];
        middle.get_u64_le()
    }

    /// Per-action operation counter, bytes `[14..16)`.
    #[must_use]
    pub fn local_sequence(&self) -> u16 {
        let mut tail = &self.0[14..];
        tail.get_u16_le()
    }

    /// Whether this operation id was derived from `action`.
    #[must_use]
    pub fn belongs_to(&self, action: &ActionId) -> bool {
        self.0[6..14] == action.0[8..16]
            && self.session_low48() == action.session_id().low48()
    }
}

fn pack_session_scoped(session: SessionId, sequence: u64) -> [u8; ID_LEN] {
    let mut out = [0u8; ID_LEN];
    let mut buf = &mut out[..];
    buf.put_u64_le(session.get());
    buf.put_u64_le(sequence);
    out
}

fn pack_operation(session: SessionId, action_sequence: u64, local: u16) -> [u8; ID_LEN] {
    let mut out = [0u8; ID_LEN];
    let mut buf = &mut out[..];
    buf.put_uint_le(session.low48(), 6);
    buf.put_u64_le(action_sequence);
    buf.put_u16_le(local);
    out
}

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

/// Mints session-scoped ids from a [`StripedSequence`].
#[derive(Debug)]
pub struct IdGenerator<I> {
    session: SessionId,
    lanes: StripedSequence,
    _kind: PhantomData<fn() -> I>,
}

/// Generator for [`TransactionId`]s.
pub type TransactionIdGenerator = IdGenerator<TransactionId>;

/// Generator for [`ActionId`]s.
pub type ActionIdGenerator = IdGenerator<ActionId>;

impl<I: SessionScopedId> IdGenerator<I> {
    /// Creates a generator with `lanes` striped sequences spanning the full
    /// 64-bit range.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidSequence`] if `lanes` is zero.
    pub fn new(name: &str, session: SessionId, lanes: usize) -> Result<Self> {
        Ok(Self {
            session,
            lanes: StripedSequence::new(name, lanes, u64::MAX)?,
            _kind: PhantomData,
        })
    }

    /// Mints the next id.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::SequenceExhausted`] if the selected lane is
    /// exhausted.
    pub fn next_id(&self) -> Result<I> {
        let sequence = self.lanes.next()?;
        Ok(I::from(pack_session_scoped(self.session, sequence)))
    }

    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }
}

/// Mints operation ids for one action.
#[derive(Debug)]
pub struct OperationIdGenerator {
    session: SessionId,
    action_sequence: u64,
    counter: Sequence,
}

impl OperationIdGenerator {
    /// Creates the generator for operations under `action`.
    ///
    /// # Errors
    ///
    /// Never fails for the fixed counter configuration; the `Result` mirrors
    /// [`Sequence::new`].
    pub fn new(action: ActionId) -> Result<Self> {
        Ok(Self {
            session: action.session_id(),
            action_sequence: action.sequence(),
            counter: Sequence::new(format!("operations:{action}"), 1, 1, MAX_OPERATIONS_PER_ACTION)?,
        })
    }

    /// Mints the next operation id.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::SequenceExhausted`] after
    /// [`MAX_OPERATIONS_PER_ACTION`] ids.
    pub fn next_id(&self) -> Result<OperationId> {
        let value = self.counter.next()?;
        let local = u16::try_from(value).map_err(|_| LifecycleError::SequenceExhausted {
            name: self.counter.name().to_string(),
            max_value: MAX_OPERATIONS_PER_ACTION,
        })?;
        Ok(OperationId(pack_operation(
            self.session,
            self.action_sequence,
            local,
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const SESSION: SessionId = SessionId::new(0x1122_3344_5566_7788);

    #[test]
    fn session_scoped_layout() {
        let ids = ActionIdGenerator::new("actions", SESSION, 4).unwrap();
        let first = ids.next_id().unwrap();
        let second = ids.next_id().unwrap();

        assert_eq!(&first.as_bytes()[..8], &SESSION.get().to_le_bytes());
        assert_eq!(first.session_id(), SESSION);
        assert_eq!(first.sequence(), 1);
        assert_eq!(second.sequence(), 2);
        assert_eq!(&second.as_bytes()[8..], &2u64.to_le_bytes());
    }

    #[test]
    fn operation_layout_embeds_action_sequence() {
        let actions = ActionIdGenerator::new("actions", SESSION, 2).unwrap();
        let action = actions.next_id().unwrap();
        let ops = OperationIdGenerator::new(action).unwrap();

        let op = ops.next_id().unwrap();
        assert_eq!(&op.as_bytes()[..6], &SESSION.get().to_le_bytes()[..6]);
        assert_eq!(&op.as_bytes()[6..14], &action.as_bytes()[8..16]);
        assert_eq!(op.local_sequence(), 1);
        assert_eq!(op.session_low48(), SESSION.low48());
        assert_eq!(op.action_sequence(), action.sequence());
        assert!(op.belongs_to(&action));

        let other_action = actions.next_id().unwrap();
        assert!(!op.belongs_to(&other_action));
    }

    #[test]
    fn operation_counter_strictly_increases_then_exhausts() {
        let action = ActionId::from(pack_session_scoped(SESSION, 42));
        let ops = OperationIdGenerator::new(action).unwrap();

        let mut previous = 0u16;
        for _ in 0..MAX_OPERATIONS_PER_ACTION {
            let id = ops.next_id().unwrap();
            assert!(id.local_sequence() > previous);
            previous = id.local_sequence();
        }
        assert_eq!(previous, u16::MAX);

        assert!(matches!(
            ops.next_id(),
            Err(LifecycleError::SequenceExhausted { max_value: 65_535, .. })
        ));
        assert!(ops.next_id().is_err());
    }

    #[test]
    fn million_concurrent_ids_do_not_collide() {
        let ids = TransactionIdGenerator::new("transactions", SESSION, 8).unwrap();
        let threads = 8;
        let per_thread = 125_000;

        let batches: Vec<Vec<TransactionId>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    scope.spawn(|| {
                        (0..per_thread)
                            .map(|_| ids.next_id().unwrap())
                            .collect::<Vec<TransactionId>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut seen = HashSet::with_capacity(threads * per_thread);
        for id in batches.into_iter().flatten() {
            assert_eq!(id.session_id(), SESSION);
            assert!(seen.insert(id), "collision on {id}");
        }
        assert_eq!(seen.len(), 1_000_000);
    }

    #[test]
    fn hex_form_parses_back() {
        let ids = ActionIdGenerator::new("actions", SESSION, 1).unwrap();
        let id = ids.next_id().unwrap();
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<ActionId>().unwrap(), id);

        assert!("not-hex".parse::<ActionId>().is_err());
        assert!("abcd".parse::<OperationId>().is_err());
    }

    #[test]
    fn serde_uses_hex_strings() {
        let id = TransactionId::from(pack_session_scoped(SESSION, 7));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: TransactionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        let session_json = serde_json::to_string(&SESSION).unwrap();
        assert_eq!(session_json, "\"1122334455667788\"");
        let session: SessionId = serde_json::from_str(&session_json).unwrap();
        assert_eq!(session, SESSION);
    }

    #[test]
    fn generated_session_is_nonzero() {
        assert_ne!(SessionId::generate().get(), 0);
    }
}
