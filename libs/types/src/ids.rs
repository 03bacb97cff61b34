//! Identifiers
//!
//! Small copyable newtypes used across the runtime. Keeping them distinct
//! prevents a port index from being passed where a piece marker is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            pub const fn new(raw: $inner) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(raw: $inner) -> Self {
                Self(raw)
            }
        }
    };
}

id_newtype!(
    /// Identity of an actor; equal to the id of the task it drives.
    ActorId(u64),
    "actor-"
);

id_newtype!(
    /// Machine hosting an actor.
    NodeId(u32),
    "node-"
);

id_newtype!(
    /// Port index, local to one actor.
    PortId(u32),
    "port-"
);

id_newtype!(
    /// Worker thread an actor is bound to.
    WorkerId(u32),
    "worker-"
);

id_newtype!(
    /// Transfer issued to the transport layer.
    TransferId(u64),
    "xfer-"
);

/// Monotonically increasing sequence marker of data flowing through a port
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PieceId(pub u64);

impl PieceId {
    pub const ZERO: PieceId = PieceId(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The marker that follows this one
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "piece-{}", self.0)
    }
}

/// Identity of a register slot: the producing actor, its output port and
/// the slot index inside that port's fixed pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegisterId {
    pub producer: ActorId,
    pub port: PortId,
    pub slot: u32,
}

impl RegisterId {
    pub const fn new(producer: ActorId, port: PortId, slot: u32) -> Self {
        Self {
            producer,
            port,
            slot,
        }
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "regst-{}/{}/{}", self.producer.0, self.port.0, self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats() {
        assert_eq!(ActorId(7).to_string(), "actor-7");
        assert_eq!(PieceId(3).to_string(), "piece-3");
        assert_eq!(
            RegisterId::new(ActorId(1), PortId(2), 0).to_string(),
            "regst-1/2/0"
        );
    }

    #[test]
    fn test_piece_ordering() {
        let p = PieceId::ZERO;
        assert!(p < p.next());
        assert_eq!(p.next().next(), PieceId(2));
    }

    #[test]
    fn test_ids_deserialize_transparently() {
        let id: ActorId = serde_json::from_str("42").unwrap();
        assert_eq!(id, ActorId(42));
    }
}
