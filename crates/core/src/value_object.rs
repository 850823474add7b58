//! Value object trait: equality by value, not identity.
//!
//! Attachment records are values. A state change never edits a record in
//! place; it produces the next value from the previous one plus a reason
//! (see [`crate::AttachmentTransition`]).

/// Marker trait for value objects.
///
/// The trait requires:
/// - **Clone**: transitions start from a copy of the previous value
/// - **PartialEq**: two records with the same fields are the same record
/// - **Debug**: values show up in logs and test failures
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
