//! Entity identifiers and immutable entity sets.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Entity (patient) identifier.
pub type EntityId = u64;

/// Immutable, deduplicated set of entity identifiers.
///
/// Cloning is cheap (the backing set is shared). Every combinator returns a
/// new set and leaves its inputs untouched.
///
/// # Example
///
/// ```rust
/// use cohort_engine::EntitySet;
///
/// let on_art: EntitySet = [1, 2].into_iter().collect();
/// let pregnant: EntitySet = [2, 3].into_iter().collect();
///
/// assert_eq!(on_art.intersection(&pregnant).to_vec(), vec![2]);
/// assert_eq!(on_art.union(&pregnant).len(), 3);
/// assert_eq!(on_art.difference(&pregnant).to_vec(), vec![1]);
/// ```
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EntitySet {
    ids: Arc<HashSet<EntityId>>,
}

impl EntitySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set holding exactly one entity.
    pub fn single(id: EntityId) -> Self {
        std::iter::once(id).collect()
    }

    /// Returns the number of entities.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Checks if an entity is a member.
    pub fn contains(&self, id: EntityId) -> bool {
        self.ids.contains(&id)
    }

    /// Returns an iterator over members in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.ids.iter().copied()
    }

    /// Converts the set to a sorted Vec.
    pub fn to_vec(&self) -> Vec<EntityId> {
        let mut vec: Vec<EntityId> = self.ids.iter().copied().collect();
        vec.sort_unstable();
        vec
    }

    /// Entities in either set.
    pub fn union(&self, other: &EntitySet) -> EntitySet {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        self.ids.union(&other.ids).copied().collect()
    }

    /// Entities in both sets.
    pub fn intersection(&self, other: &EntitySet) -> EntitySet {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small.iter().filter(|id| large.contains(*id)).collect()
    }

    /// Entities in `self` but not in `other`.
    pub fn difference(&self, other: &EntitySet) -> EntitySet {
        if other.is_empty() {
            return self.clone();
        }
        self.ids.difference(&other.ids).copied().collect()
    }

    /// Entities of `universe` that are not in `self`.
    pub fn complement_within(&self, universe: &EntitySet) -> EntitySet {
        universe.difference(self)
    }

    /// Keeps only the entities for which `predicate` returns true.
    pub fn filter<F>(&self, predicate: F) -> EntitySet
    where
        F: Fn(EntityId) -> bool,
    {
        self.iter().filter(|id| predicate(*id)).collect()
    }

    /// Returns true if every member of `self` is in `other`.
    pub fn is_subset(&self, other: &EntitySet) -> bool {
        self.ids.is_subset(&other.ids)
    }

    /// Returns true if the sets share no member.
    pub fn is_disjoint(&self, other: &EntitySet) -> bool {
        self.ids.is_disjoint(&other.ids)
    }

    /// Order-independent content fingerprint.
    ///
    /// Equal sets always produce equal fingerprints regardless of how they
    /// were built. Used to identify in-progress calculation calls.
    pub fn fingerprint(&self) -> u64 {
        self.ids
            .iter()
            .fold(self.ids.len() as u64, |acc, id| acc.wrapping_add(mix(*id)))
    }
}

/// splitmix64 finalizer.
fn mix(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

impl FromIterator<EntityId> for EntitySet {
    fn from_iter<I: IntoIterator<Item = EntityId>>(iter: I) -> Self {
        Self {
            ids: Arc::new(iter.into_iter().collect()),
        }
    }
}

impl From<HashSet<EntityId>> for EntitySet {
    fn from(ids: HashSet<EntityId>) -> Self {
        Self { ids: Arc::new(ids) }
    }
}

impl From<Vec<EntityId>> for EntitySet {
    fn from(ids: Vec<EntityId>) -> Self {
        ids.into_iter().collect()
    }
}

impl<const N: usize> From<[EntityId; N]> for EntitySet {
    fn from(ids: [EntityId; N]) -> Self {
        ids.into_iter().collect()
    }
}

impl<'a> IntoIterator for &'a EntitySet {
    type Item = &'a EntityId;
    type IntoIter = std::collections::hash_set::Iter<'a, EntityId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

impl fmt::Debug for EntitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.to_vec()).finish()
    }
}
