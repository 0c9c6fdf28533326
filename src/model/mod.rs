//! Core data model.
//!
//! One project owns sessions, a session owns queues, a queue owns tasks.
//! Every entity is a typed record; the store never hands out loose maps.

pub mod hierarchy;
pub mod task;

pub use hierarchy::*;
pub use task::*;

/// Declares a UUID-backed identifier newtype with parsing and display.
macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
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
            type Err = crate::error::Error;

            fn from_str(s: &str) -> crate::error::Result<Self> {
                uuid::Uuid::parse_str(s.trim()).map(Self).map_err(|e| {
                    crate::error::Error::Validation(format!(
                        "invalid {} '{s}': {e}",
                        stringify!($name)
                    ))
                })
            }
        }
    };
}

id_type!(
    /// Identifier of the singleton project.
    ProjectId
);
id_type!(
    /// Identifier of a work session.
    SessionId
);
id_type!(
    /// Identifier of a queue.
    QueueId
);
id_type!(
    /// Identifier of a task.
    TaskId
);
