use std::collections::HashMap;

/// URL prefix trie with one node per path segment.
///
/// A node carries data only when its exact prefix was added; interior nodes
/// created on the way down stay data-less. Lookup walks the request path and
/// returns the deepest data-carrying node passed, which is exactly the
/// longest-prefix-match rule: a stored prefix `P` covers a path `R` when
/// `P == R`, `R` continues below `P` with a `/`, or `P` is the root.
#[derive(Debug)]
pub struct UrlTrie<T> {
    prefix: String,
    branches: HashMap<String, UrlTrie<T>>,
    size: usize,
    data: Option<T>,
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|part| !part.is_empty()).collect()
}

impl<T> Default for UrlTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> UrlTrie<T> {
    pub fn new() -> Self {
        Self::with_prefix("/".to_string())
    }

    fn with_prefix(prefix: String) -> Self {
        Self {
            prefix,
            branches: HashMap::new(),
            size: 0,
            data: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0 && self.data.is_none()
    }

    pub fn add(&mut self, path: &str, data: T) {
        self.insert(&segments(path), data);
    }

    fn insert(&mut self, path: &[&str], data: T) {
        let Some((part, rest)) = path.split_first() else {
            self.data = Some(data);
            return;
        };
        let prefix = if self.prefix == "/" {
            format!("/{part}")
        } else {
            format!("{}/{part}", self.prefix)
        };
        let size = &mut self.size;
        let child = self.branches.entry((*part).to_string()).or_insert_with(|| {
            *size += 1;
            UrlTrie::with_prefix(prefix)
        });
        child.insert(rest, data);
    }

    pub fn remove(&mut self, path: &str) {
        self.prune(&segments(path));
    }

    fn prune(&mut self, path: &[&str]) {
        let Some((part, rest)) = path.split_first() else {
            // Deleting the root leaves the tree structure in place.
            self.data = None;
            return;
        };
        let Some(child) = self.branches.get_mut(*part) else {
            // Nothing at that path: already removed.
            return;
        };
        child.prune(rest);
        if child.size == 0 && child.data.is_none() {
            self.branches.remove(*part);
            self.size -= 1;
        }
    }

    /// Longest-prefix match: the deepest data-carrying node covering `path`.
    pub fn get(&self, path: &str) -> Option<(&str, &T)> {
        self.lookup(&segments(path))
    }

    fn lookup(&self, path: &[&str]) -> Option<(&str, &T)> {
        let me = self.data.as_ref().map(|data| (self.prefix.as_str(), data));
        let Some((part, rest)) = path.split_first() else {
            return me;
        };
        match self.branches.get(*part) {
            // Prefix matches and there is no more specific child.
            None => me,
            // A deeper branch matches, but it only wins if a data-carrying
            // node lies on it.
            Some(child) => child.lookup(rest).or(me),
        }
    }

    /// Data stored at exactly `path`, if any.
    pub fn get_exact(&self, path: &str) -> Option<&T> {
        self.node(&segments(path)).and_then(|node| node.data.as_ref())
    }

    pub fn get_exact_mut(&mut self, path: &str) -> Option<&mut T> {
        let segs = segments(path);
        self.node_mut(&segs).and_then(|node| node.data.as_mut())
    }

    fn node(&self, path: &[&str]) -> Option<&Self> {
        match path.split_first() {
            None => Some(self),
            Some((part, rest)) => self.branches.get(*part).and_then(|child| child.node(rest)),
        }
    }

    fn node_mut(&mut self, path: &[&str]) -> Option<&mut Self> {
        match path.split_first() {
            None => Some(self),
            Some((part, rest)) => self
                .branches
                .get_mut(*part)
                .and_then(|child| child.node_mut(rest)),
        }
    }

    /// All `(prefix, data)` pairs in the trie.
    pub fn entries(&self) -> Vec<(&str, &T)> {
        let mut out = Vec::new();
        self.collect_entries(&mut out);
        out
    }

    fn collect_entries<'a>(&'a self, out: &mut Vec<(&'a str, &'a T)>) {
        if let Some(data) = &self.data {
            out.push((self.prefix.as_str(), data));
        }
        for child in self.branches.values() {
            child.collect_entries(out);
        }
    }
}
