use std::collections::btree_set;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::descriptor::TypeName;

/// The set of types assigned to one record.
///
/// Ordering is irrelevant: two sets with the same members compare and hash
/// equal no matter how they were built.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<TypeName>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Build a set from anything convertible into type names.
    pub fn of<I, T>(types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TypeName>,
    {
        Self(types.into_iter().map(Into::into).collect())
    }

    pub fn insert(&mut self, ty: impl Into<TypeName>) -> bool {
        self.0.insert(ty.into())
    }

    pub fn remove(&mut self, ty: &str) -> bool {
        self.0.remove(ty)
    }

    pub fn contains(&self, ty: &str) -> bool {
        self.0.contains(ty)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, TypeName> {
        self.0.iter()
    }

    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).cloned().collect())
    }

    pub fn difference(&self, other: &Self) -> Self {
        Self(self.0.difference(&other.0).cloned().collect())
    }

    pub fn is_superset(&self, other: &Self) -> bool {
        self.0.is_superset(&other.0)
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, ty) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{ty}")?;
        }
        write!(f, "}}")
    }
}

impl<T: Into<TypeName>> FromIterator<T> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::of(iter)
    }
}

impl<'a> IntoIterator for &'a CapabilitySet {
    type Item = &'a TypeName;
    type IntoIter = btree_set::Iter<'a, TypeName>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
