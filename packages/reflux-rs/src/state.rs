//! Path-addressed application state.
//!
//! The router notifies subscriptions per *path*, so the state type must be
//! able to answer "what is the value at this path". [`StateTree`] is that
//! capability; [`TreeState`] is a ready-made implementation keyed by
//! dot-separated paths such as `"layer1.layer2.calculation"`.

use std::collections::BTreeMap;
use std::fmt;

/// Separator between path segments.
pub const PATH_SEPARATOR: char = '.';

/// State that can be observed by path.
///
/// The store only reads state through this trait and never mutates it
/// outside of a reducer, except to clear the path of a ping action once its
/// notifications have run.
pub trait StateTree: Clone + Send + Sync + 'static {
    /// The value stored at a path.
    type Value: Clone + PartialEq + Send + Sync + 'static;

    /// Return the value at `path`, or `None` if the path is absent.
    fn value_at(&self, path: &str) -> Option<Self::Value>;

    /// Remove the value at `path` if present.
    fn remove_value(&mut self, path: &str);
}

/// A tree of values addressed by dot-separated paths.
///
/// # Example
///
/// ```ignore
/// let state = TreeState::empty()
///     .with_value("layer1.layer2.calculation", 0);
///
/// let next = state.map_value("layer1.layer2.calculation", |v| v.map(|n| n + 1));
/// assert_eq!(next.value("layer1.layer2.calculation"), Some(&1));
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct TreeState<V> {
    values: BTreeMap<String, V>,
}

impl<V> TreeState<V> {
    /// Create an empty tree.
    pub fn empty() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    /// Builder-style insert.
    pub fn with_value(mut self, path: impl Into<String>, value: V) -> Self {
        self.insert(path, value);
        self
    }

    /// Graft every value of `substate` under `path`.
    pub fn with_substate(mut self, path: &str, substate: TreeState<V>) -> Self {
        for (key, value) in substate.values {
            self.values.insert(join(path, &key), value);
        }
        self
    }

    /// Insert a value, returning the previous one at that path.
    pub fn insert(&mut self, path: impl Into<String>, value: V) -> Option<V> {
        self.values.insert(path.into(), value)
    }

    /// Remove the value at `path`, returning it.
    pub fn remove(&mut self, path: &str) -> Option<V> {
        self.values.remove(path)
    }

    /// Borrow the value at `path`.
    pub fn value(&self, path: &str) -> Option<&V> {
        self.values.get(path)
    }

    /// Returns true if a value exists at `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.values.contains_key(path)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no values are stored.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over stored paths in lexical order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl<V: Clone> TreeState<V> {
    /// Return a copy with the value at `path` replaced by `f(current)`.
    ///
    /// Returning `None` from `f` removes the path.
    pub fn map_value<F>(&self, path: &str, f: F) -> Self
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        let mut next = self.clone();
        match f(self.values.get(path)) {
            Some(value) => {
                next.values.insert(path.to_string(), value);
            }
            None => {
                next.values.remove(path);
            }
        }
        next
    }

    /// Return a copy with `value` stored at `path`.
    pub fn update_value(&self, path: &str, value: V) -> Self {
        self.map_value(path, |_| Some(value))
    }

    /// Extract every value nested under `path`, with the prefix stripped.
    ///
    /// Returns `None` if nothing lives under `path`.
    pub fn substate(&self, path: &str) -> Option<TreeState<V>> {
        let prefix = format!("{path}{PATH_SEPARATOR}");
        let values: BTreeMap<String, V> = self
            .values
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, value)| (key[prefix.len()..].to_string(), value.clone()))
            .collect();

        if values.is_empty() {
            None
        } else {
            Some(TreeState { values })
        }
    }
}

impl<V> Default for TreeState<V> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<V: fmt::Debug> fmt::Debug for TreeState<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.values.iter()).finish()
    }
}

impl<V> StateTree for TreeState<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    type Value = V;

    fn value_at(&self, path: &str) -> Option<V> {
        self.values.get(path).cloned()
    }

    fn remove_value(&mut self, path: &str) {
        self.values.remove(path);
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}{PATH_SEPARATOR}{key}")
    }
}
