use std::fmt;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Stable 64-bit object identifier. Unique and monotonic per object kind
/// within one storage instance; never reused within a run and preserved
/// across snapshot/WAL round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gid(u64);

impl Gid {
    pub const ZERO: Gid = Gid(0);
    pub const MAX: Gid = Gid(u64::MAX);

    pub const fn from_u64(raw: u64) -> Self {
        Gid(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! name_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl $name {
            pub const fn new(raw: u32) -> Self {
                $name(raw)
            }

            pub const fn as_u32(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

name_id!(
    /// Identifier of a vertex label.
    LabelId
);
name_id!(
    /// Identifier of a property key.
    PropertyId
);
name_id!(
    /// Identifier of an edge type.
    EdgeTypeId
);

/// Append-only bidirectional mapping between names and numeric ids.
///
/// One mapper is shared by labels, property keys and edge types; the typed
/// front doors live on `Storage`. Ids are dense and stable for the lifetime
/// of the storage instance, and the id→name direction is restored verbatim
/// from snapshots.
#[derive(Debug, Default)]
pub struct NameIdMapper {
    inner: RwLock<MapperInner>,
}

#[derive(Debug, Default)]
struct MapperInner {
    name_to_id: FxHashMap<String, u32>,
    id_to_name: Vec<String>,
}

impl NameIdMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `name`, allocating the next dense id on first use.
    pub fn name_to_id(&self, name: &str) -> u32 {
        if let Some(&id) = self.inner.read().name_to_id.get(name) {
            return id;
        }
        let mut inner = self.inner.write();
        if let Some(&id) = inner.name_to_id.get(name) {
            return id;
        }
        let id = inner.id_to_name.len() as u32;
        inner.id_to_name.push(name.to_owned());
        inner.name_to_id.insert(name.to_owned(), id);
        id
    }

    pub fn id_to_name(&self, id: u32) -> Option<String> {
        self.inner.read().id_to_name.get(id as usize).cloned()
    }

    /// All known names in id order, for snapshot serialization.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.read().id_to_name.clone()
    }

    /// Replaces the mapping wholesale; used when restoring a snapshot.
    pub fn restore(&self, names: Vec<String>) {
        let mut inner = self.inner.write();
        inner.name_to_id = names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id as u32))
            .collect();
        inner.id_to_name = names;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_stable() {
        let mapper = NameIdMapper::new();
        let a = mapper.name_to_id("Person");
        let b = mapper.name_to_id("KNOWS");
        assert_eq!(mapper.name_to_id("Person"), a);
        assert_ne!(a, b);
        assert_eq!(mapper.id_to_name(a).as_deref(), Some("Person"));
        assert_eq!(mapper.id_to_name(77), None);
    }

    #[test]
    fn restore_round_trip() {
        let mapper = NameIdMapper::new();
        mapper.name_to_id("a");
        mapper.name_to_id("b");
        let names = mapper.snapshot();

        let restored = NameIdMapper::new();
        restored.restore(names);
        assert_eq!(restored.name_to_id("a"), 0);
        assert_eq!(restored.name_to_id("b"), 1);
        assert_eq!(restored.name_to_id("c"), 2);
    }
}
