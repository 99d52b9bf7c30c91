//! Set algebra over endpoint ids
//!
//! The reconciler recognizes the difference between current and desired
//! tunnel state with plain set operations, so those operations live here as a
//! small utility type.

use std::collections::HashSet;

use crate::EndpointId;

/// A set of endpoint ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSet {
    ids: HashSet<EndpointId>,
}

impl EndpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        EndpointSet {
            ids: HashSet::with_capacity(capacity),
        }
    }

    /// Add an id to the set. Invalid ids are silently ignored; they carry no
    /// identity and must never take part in a diff.
    pub fn add(&mut self, id: EndpointId) {
        if !id.is_valid() {
            return;
        }
        self.ids.insert(id);
    }

    pub fn remove(&mut self, id: EndpointId) {
        self.ids.remove(&id);
    }

    pub fn has(&self, id: EndpointId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = EndpointId> + '_ {
        self.ids.iter().copied()
    }

    /// A fresh set holding every id in either set.
    pub fn union(&self, other: &EndpointSet) -> EndpointSet {
        let mut ret = EndpointSet::with_capacity(self.len() + other.len());
        ret.ids.extend(self.ids.iter().copied());
        ret.ids.extend(other.ids.iter().copied());
        ret
    }

    /// A fresh set holding every id in this set that is not in the other.
    pub fn subtract(&self, other: &EndpointSet) -> EndpointSet {
        let mut ret = EndpointSet::with_capacity(self.len());
        for id in self.iter() {
            if !other.has(id) {
                ret.add(id);
            }
        }
        ret
    }
}

impl FromIterator<EndpointId> for EndpointSet {
    fn from_iter<I: IntoIterator<Item = EndpointId>>(iter: I) -> Self {
        let mut set = EndpointSet::new();
        for id in iter {
            set.add(id);
        }
        set
    }
}
