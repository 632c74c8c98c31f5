//! Table of path prefixes exported by subordinate servers.

use crate::protocol::ExportSpec;
use crate::utils::ServerSet;

/// Which subordinates export some path, split by access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PathInfo {
    /// Every subordinate that serves the path.
    pub ro: ServerSet,
    /// Subordinates that serve the path writable.
    pub rw: ServerSet,
}

#[derive(Debug)]
struct Export {
    prefix: String,
    info: PathInfo,
}

/// Prefix table mapping exported paths to subordinate slot sets.
#[derive(Debug, Default)]
pub struct PathTable {
    exports: Vec<Export>,
}

// Is `path` equal to or beneath `prefix`?
fn under(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

impl PathTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the servers in `mask` export `prefix`.
    pub fn insert(&mut self, prefix: &str, mask: ServerSet, rw: bool) {
        let prefix = if prefix.len() > 1 {
            prefix.trim_end_matches('/')
        } else {
            prefix
        };
        let idx = match self.exports.iter().position(|e| e.prefix == prefix) {
            Some(idx) => idx,
            None => {
                self.exports.push(Export {
                    prefix: prefix.into(),
                    info: PathInfo::default(),
                });
                self.exports.len() - 1
            }
        };
        let info = &mut self.exports[idx].info;
        info.ro |= mask;
        if rw {
            info.rw |= mask;
        } else {
            info.rw = info.rw - mask;
        }
    }

    /// Records a whole login's export list for the servers in `mask`.
    pub fn insert_all(&mut self, exports: &[ExportSpec], mask: ServerSet) {
        for export in exports {
            self.insert(&export.prefix, mask, export.rw);
        }
    }

    /// Returns the union of exporters over every prefix covering `path`.
    pub fn find(&self, path: &str) -> PathInfo {
        self.exports
            .iter()
            .filter(|e| under(path, &e.prefix))
            .fold(PathInfo::default(), |acc, e| PathInfo {
                ro: acc.ro | e.info.ro,
                rw: acc.rw | e.info.rw,
            })
    }

    /// Forgets the servers in `mask` everywhere, dropping prefixes nobody
    /// exports any longer.
    pub fn remove(&mut self, mask: ServerSet) {
        for export in self.exports.iter_mut() {
            export.info.ro = export.info.ro - mask;
            export.info.rw = export.info.rw - mask;
        }
        self.exports.retain(|e| !e.info.ro.is_empty());
    }

    /// Number of distinct exported prefixes.
    pub fn len(&self) -> usize {
        self.exports.len()
    }

    /// Is nothing exported at all?
    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}
