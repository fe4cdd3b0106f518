//! Time-ordered entity identifiers
//!
//! Every entity in the portal is keyed by a ULID:
//! - 26 characters of Crockford base32, no padding
//! - lexicographic order equals creation order, even within one millisecond
//! - the creation instant is recoverable from the identifier itself
//!
//! Generation goes through a single process-wide monotonic generator so two
//! identifiers minted in the same millisecond still sort in mint order.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ulid::{Generator, Ulid};

/// Length of the textual form of an identifier
pub const ID_LEN: usize = 26;

static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();

/// Error raised when a string is not a valid identifier
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier: {0:?}")]
pub struct IdError(pub String);

/// Mint a new identifier.
///
/// Never fails: if the monotonic sequence for the current millisecond is
/// exhausted the generator falls back to a fresh random ULID, which is still
/// unique and still carries the current timestamp.
#[must_use]
pub fn new_id() -> Ulid {
    let generator = GENERATOR.get_or_init(|| Mutex::new(Generator::new()));
    let mut guard = generator.lock();
    guard.generate().unwrap_or_else(|_| Ulid::new())
}

/// Creation instant encoded in an identifier (millisecond precision)
#[must_use]
pub fn id_time(id: Ulid) -> DateTime<Utc> {
    DateTime::<Utc>::from(id.datetime())
}

/// Parse a 26 character identifier
pub fn parse_id(raw: &str) -> Result<Ulid, IdError> {
    if raw.len() != ID_LEN {
        return Err(IdError(raw.to_string()));
    }
    Ulid::from_string(raw).map_err(|_| IdError(raw.to_string()))
}

/// Whether a path segment has the shape of an identifier
#[must_use]
pub fn looks_like_id(raw: &str) -> bool {
    parse_id(raw).is_ok()
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Generate new identifier
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(new_id())
            }

            /// Instant this identifier was minted
            #[inline]
            #[must_use]
            pub fn created_at(&self) -> DateTime<Utc> {
                id_time(self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_id(s).map(Self)
            }
        }

        impl From<Ulid> for $name {
            fn from(value: Ulid) -> Self {
                Self(value)
            }
        }
    };
}

entity_id!(
    /// Unique workflow identifier
    WorkflowId
);
entity_id!(
    /// Unique activity identifier
    ActivityId
);
entity_id!(
    /// Unique dependency edge identifier
    DependencyId
);
entity_id!(
    /// Unique review identifier
    ReviewId
);
entity_id!(
    /// Unique session identifier
    SessionId
);
entity_id!(
    /// Unique audit record identifier
    AuditId
);
entity_id!(
    /// Unique principal (user) identifier
    PrincipalId
);
entity_id!(
    /// Project the workflow belongs to
    ProjectId
);
entity_id!(
    /// Workflow template the workflow was instantiated from
    TemplateId
);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;

    #[test]
    fn ids_sort_in_mint_order() {
        let ids: Vec<Ulid> = (0..1_000).map(|_| new_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);

        let strings: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let mut sorted_strings = strings.clone();
        sorted_strings.sort();
        assert_eq!(strings, sorted_strings);
    }

    #[test]
    fn id_time_is_close_to_now() {
        let before = Utc::now().timestamp_millis();
        let id = new_id();
        let after = Utc::now().timestamp_millis();
        let minted = id_time(id).timestamp_millis();
        assert!(minted >= before && minted <= after);
    }

    #[test]
    fn typed_id_display_parse() {
        let id = WorkflowId::new();
        let text = id.to_string();
        assert_eq!(text.len(), 26);
        assert_eq!(WorkflowId::from_str(&text).unwrap(), id);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(parse_id("01ARZ3NDEKTSV4RRFFQ69G5FA").is_err());
        assert!(parse_id("").is_err());
        assert!(!looks_like_id("users"));
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ActivityId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    proptest! {
        #[test]
        fn consecutive_ids_strictly_increase(n in 2usize..200) {
            let ids: Vec<Ulid> = (0..n).map(|_| new_id()).collect();
            for pair in ids.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
        }
    }
}
