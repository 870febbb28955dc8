//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. To "modify" one,
/// build a new value. `UserSnapshot` is the main example: a propagation job
/// carries one, and retries re-read the very same value.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
