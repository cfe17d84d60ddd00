//! String-keyed trees used for variable collections and their metadata.

use std::collections::BTreeMap;

/// A tree whose interior nodes are string-keyed maps.
#[derive(Clone, Debug, PartialEq)]
pub enum Nested<T> {
    Leaf(T),
    Map(BTreeMap<String, Nested<T>>),
}

impl<T> Default for Nested<T> {
    fn default() -> Self {
        Nested::Map(BTreeMap::new())
    }
}

impl<T> Nested<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leaf(&self) -> Option<&T> {
        match self {
            Nested::Leaf(value) => Some(value),
            Nested::Map(_) => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Nested<T>>> {
        match self {
            Nested::Map(map) => Some(map),
            Nested::Leaf(_) => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Nested<T>> {
        self.as_map().and_then(|map| map.get(key))
    }

    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Nested<T>> {
        path.iter().try_fold(self, |node, key| node.get(key.as_ref()))
    }

    /// The leaf at `path`, if any.
    pub fn leaf_at<S: AsRef<str>>(&self, path: &[S]) -> Option<&T> {
        self.get_path(path).and_then(Nested::leaf)
    }

    /// Inserts `value` under `key`, turning a leaf into an empty map first.
    pub fn insert(&mut self, key: impl Into<String>, value: Nested<T>) -> Option<Nested<T>> {
        self.map_mut().insert(key.into(), value)
    }

    /// Inserts a leaf at `path`, creating intermediate maps as needed.
    pub fn insert_path<S: AsRef<str>>(&mut self, path: &[S], value: T) {
        let Some((last, parents)) = path.split_last() else {
            *self = Nested::Leaf(value);
            return;
        };
        let mut node = self;
        for key in parents {
            node = node
                .map_mut()
                .entry(key.as_ref().to_owned())
                .or_default();
        }
        node.map_mut()
            .insert(last.as_ref().to_owned(), Nested::Leaf(value));
    }

    pub fn remove_path<S: AsRef<str>>(&mut self, path: &[S]) -> Option<Nested<T>> {
        let (last, parents) = path.split_last()?;
        let mut node = self;
        for key in parents {
            node = match node {
                Nested::Map(map) => map.get_mut(key.as_ref())?,
                Nested::Leaf(_) => return None,
            };
        }
        match node {
            Nested::Map(map) => map.remove(last.as_ref()),
            Nested::Leaf(_) => None,
        }
    }

    fn map_mut(&mut self) -> &mut BTreeMap<String, Nested<T>> {
        if let Nested::Leaf(_) = self {
            *self = Nested::Map(BTreeMap::new());
        }
        match self {
            Nested::Map(map) => map,
            Nested::Leaf(_) => unreachable!("leaf replaced by a map above"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Nested::Leaf(_) => false,
            Nested::Map(map) => map.values().all(Nested::is_empty),
        }
    }

    /// Leaves in key order, each with its path.
    pub fn leaves(&self) -> Vec<(Vec<String>, &T)> {
        let mut out = Vec::new();
        self.collect_leaves(&mut Vec::new(), &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, prefix: &mut Vec<String>, out: &mut Vec<(Vec<String>, &'a T)>) {
        match self {
            Nested::Leaf(value) => out.push((prefix.clone(), value)),
            Nested::Map(map) => {
                for (key, child) in map {
                    prefix.push(key.clone());
                    child.collect_leaves(prefix, out);
                    prefix.pop();
                }
            }
        }
    }

    pub fn map<U>(&self, f: impl Fn(&T) -> U) -> Nested<U> {
        self.map_ref(&f)
    }

    fn map_ref<U>(&self, f: &dyn Fn(&T) -> U) -> Nested<U> {
        match self {
            Nested::Leaf(value) => Nested::Leaf(f(value)),
            Nested::Map(map) => Nested::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.map_ref(f)))
                    .collect(),
            ),
        }
    }

    pub fn try_map<U, E>(&self, f: impl Fn(&T) -> Result<U, E>) -> Result<Nested<U>, E> {
        self.try_map_ref(&f)
    }

    fn try_map_ref<U, E>(&self, f: &dyn Fn(&T) -> Result<U, E>) -> Result<Nested<U>, E> {
        match self {
            Nested::Leaf(value) => f(value).map(Nested::Leaf),
            Nested::Map(map) => map
                .iter()
                .map(|(k, v)| v.try_map_ref(f).map(|v| (k.clone(), v)))
                .collect::<Result<BTreeMap<_, _>, E>>()
                .map(Nested::Map),
        }
    }

    /// Keeps leaves for which `f` returns `Some`, dropping emptied maps.
    pub fn filter_map<U>(&self, f: impl Fn(&T) -> Option<U>) -> Nested<U> {
        self.filter_map_ref(&f).unwrap_or_default()
    }

    fn filter_map_ref<U>(&self, f: &dyn Fn(&T) -> Option<U>) -> Option<Nested<U>> {
        match self {
            Nested::Leaf(value) => f(value).map(Nested::Leaf),
            Nested::Map(map) => {
                let kept: BTreeMap<_, _> = map
                    .iter()
                    .filter_map(|(k, v)| v.filter_map_ref(f).map(|v| (k.clone(), v)))
                    .collect();
                (!kept.is_empty()).then_some(Nested::Map(kept))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_insert_and_lookup() {
        let mut tree = Nested::new();
        tree.insert_path(&["encoder", "w"], 1);
        tree.insert_path(&["encoder", "b"], 2);
        tree.insert_path(&["head"], 3);

        assert_eq!(tree.leaf_at(&["encoder", "w"]), Some(&1));
        assert_eq!(tree.leaf_at(&["encoder"]), None);
        let paths: Vec<_> = tree.leaves().into_iter().map(|(p, v)| (p.join("/"), *v)).collect();
        assert_eq!(
            paths,
            vec![("encoder/b".into(), 2), ("encoder/w".into(), 1), ("head".into(), 3)]
        );

        assert_eq!(tree.remove_path(&["head"]), Some(Nested::Leaf(3)));
        assert_eq!(tree.leaf_at(&["head"]), None);
    }

    #[test]
    fn filter_map_drops_empty_branches() {
        let mut tree = Nested::new();
        tree.insert_path(&["a", "x"], 1);
        tree.insert_path(&["b", "y"], 2);
        let odd = tree.filter_map(|v| (v % 2 == 1).then_some(*v));
        assert_eq!(odd.leaf_at(&["a", "x"]), Some(&1));
        assert!(odd.get("b").is_none());
        assert!(Nested::<i32>::new().is_empty());
    }
}
