//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// A prediction record keeps its identity while it moves from `pending` to a
/// terminal status; two records with equal scores are still different records.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
