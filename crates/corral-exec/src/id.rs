//! Process ID generation

use std::fmt;

use uuid::Uuid;

/// Source of IDs for processes launched without an explicit one
pub trait ProcessIdGenerator: Send + Sync + fmt::Debug {
    fn generate(&self) -> String;
}

/// Random v4 UUIDs
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl ProcessIdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// An ID must be usable as a single directory name under the processes root.
pub(crate) fn is_valid(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains('/')
        && !id.contains('\\')
        && !id.contains('\0')
}
