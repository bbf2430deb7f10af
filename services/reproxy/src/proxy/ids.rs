//! Typed identifiers for proxy resources.
//!
//! IDs are process-local counters rendered as `{prefix}_{n}`, e.g.
//! `be_1`, `br_7`, `cl_42`, `pair_3`.

use std::fmt;

/// Define a typed, counter-backed ID with a display prefix.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Allocate the next ID of this type.
            pub(crate) fn next() -> Self {
                use std::sync::atomic::{AtomicU64, Ordering};
                static NEXT: AtomicU64 = AtomicU64::new(1);
                Self(NEXT.fetch_add(1, Ordering::Relaxed))
            }

            pub fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }
    };
}

define_id!(
    /// Identifies a backend pool.
    BackendId,
    "be"
);
define_id!(
    /// Identifies a bridge; stable across reconnects of the same slot.
    BridgeId,
    "br"
);
define_id!(
    /// Identifies an accepted client connection.
    ClientId,
    "cl"
);
define_id!(
    /// Identifies a bridged (client, backend) pair.
    PairId,
    "pair"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_prefixed() {
        let a = BridgeId::next();
        let b = BridgeId::next();
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(a.to_string(), format!("br_{}", a.as_u64()));
        assert!(PairId::next().to_string().starts_with("pair_"));
    }
}
