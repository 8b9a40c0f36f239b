use thiserror::Error;

use crate::{Generation, ObjectRef};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    /// A table, segment or directory node could not be allocated. All
    /// partial work has been rolled back.
    #[error("out of memory while growing the handle table")]
    OutOfMemory,
    #[error("invalid handle table settings: {0}")]
    InvalidSettings(&'static str),
    /// A clump records an age older than one of its live referents.
    #[error(
        "clump age {age} is older than generation {generation} of {object:?}"
    )]
    AgeViolation {
        object: ObjectRef,
        age: Generation,
        generation: Generation,
    },
}
