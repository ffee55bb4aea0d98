//! Fast hash map and hash set type aliases.
//!
//! Path indexes, ignore caches, debounce timers, and lock tables are all keyed
//! by strings or small integers and never see untrusted keys, so the Fx hash
//! from `rustc-hash` is used throughout the workspace.
//!
//! # Examples
//!
//! ```
//! use si_core::{FxHashMap, fx_hash_map};
//!
//! let mut by_path: FxHashMap<String, u64> = fx_hash_map();
//! by_path.insert("/library/a.mp4".to_owned(), 1);
//! assert_eq!(by_path.get("/library/a.mp4"), Some(&1));
//! ```

/// A [`HashMap`](std::collections::HashMap) using the Fx hash algorithm.
pub type FxHashMap<K, V> = rustc_hash::FxHashMap<K, V>;

/// A [`HashSet`](std::collections::HashSet) using the Fx hash algorithm.
pub type FxHashSet<V> = rustc_hash::FxHashSet<V>;

/// Creates a new empty [`FxHashMap`].
#[inline]
#[must_use]
pub fn fx_hash_map<K, V>() -> FxHashMap<K, V> {
    FxHashMap::default()
}

/// Creates a new empty [`FxHashSet`].
#[inline]
#[must_use]
pub fn fx_hash_set<V>() -> FxHashSet<V> {
    FxHashSet::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_keyed_map() {
        let mut map: FxHashMap<String, u64> = fx_hash_map();
        map.insert("/a/b.mp4".to_owned(), 1);
        map.insert("/a/c.mp4".to_owned(), 2);
        assert_eq!(map.get("/a/b.mp4"), Some(&1));
        assert_eq!(map.get("/a/d.mp4"), None);
    }

    #[test]
    fn test_id_set() {
        let mut set: FxHashSet<u64> = fx_hash_set();
        assert!(set.insert(7));
        assert!(!set.insert(7));
        assert!(set.contains(&7));
    }
}
