//! Category path patterns
//!
//! Patterns are relative to a root (`etc/pve/`, `./etc/auto.*`). A trailing
//! `/` marks a directory whose whole subtree is included; glob segments are
//! expanded against the filesystem at use time.

use crate::error::{Error, Result};
use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use proxsafe_core::sys::{join_under, FileSystem};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Strip leading `./` and `/` from a pattern.
pub fn normalize_pattern(pattern: &str) -> &str {
    let mut p = pattern.trim();
    loop {
        if let Some(rest) = p.strip_prefix("./") {
            p = rest;
        } else if let Some(rest) = p.strip_prefix('/') {
            p = rest;
        } else {
            return p;
        }
    }
}

pub fn has_glob(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

fn glob_matcher(pattern: &str) -> Result<GlobMatcher> {
    Ok(GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| Error::manifest(pattern, format!("invalid glob: {}", e)))?
        .compile_matcher())
}

/// Decides whether a relative archive path belongs to a set of patterns.
#[derive(Debug, Clone)]
pub struct PathSelector {
    all: bool,
    exact: HashSet<String>,
    prefixes: Vec<String>,
    globs: GlobSet,
}

impl PathSelector {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut exact = HashSet::new();
        let mut prefixes = Vec::new();
        let mut globs = GlobSetBuilder::new();

        for pattern in patterns {
            let raw = normalize_pattern(pattern.as_ref());
            let is_dir = raw.ends_with('/');
            let trimmed = raw.trim_end_matches('/');
            if trimmed.is_empty() {
                continue;
            }
            if has_glob(trimmed) {
                let glob = GlobBuilder::new(trimmed)
                    .literal_separator(true)
                    .build()
                    .map_err(|e| Error::manifest(trimmed, format!("invalid glob: {}", e)))?;
                globs.add(glob);
            } else if is_dir {
                prefixes.push(trimmed.to_string());
            } else {
                exact.insert(trimmed.to_string());
            }
        }

        Ok(Self {
            all: false,
            exact,
            prefixes,
            globs: globs
                .build()
                .map_err(|e| Error::manifest("patterns", format!("invalid glob set: {}", e)))?,
        })
    }

    /// Selects every path.
    pub fn all() -> Self {
        Self {
            all: true,
            exact: HashSet::new(),
            prefixes: Vec::new(),
            globs: GlobSet::empty(),
        }
    }

    /// True when `rel` (or one of its ancestors) is selected.
    pub fn matches(&self, rel: &str) -> bool {
        let rel = normalize_pattern(rel).trim_end_matches('/');
        if rel.is_empty() {
            return false;
        }
        if self.all {
            return true;
        }
        if self
            .prefixes
            .iter()
            .any(|d| rel == d || rel.starts_with(&format!("{}/", d)))
        {
            return true;
        }

        let mut candidate = rel;
        loop {
            if self.exact.contains(candidate) || self.globs.is_match(candidate) {
                return true;
            }
            match candidate.rfind('/') {
                Some(idx) => candidate = &candidate[..idx],
                None => return false,
            }
        }
    }
}

/// Expand `pattern` under `root` into the logical paths that currently
/// exist. Glob segments are matched one directory level at a time.
pub fn expand(fs: &dyn FileSystem, root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let rel = normalize_pattern(pattern).trim_end_matches('/');
    if rel.is_empty() {
        return Ok(Vec::new());
    }
    if !has_glob(rel) {
        let path = join_under(root, Path::new(rel));
        return Ok(if fs.exists(&path) { vec![path] } else { Vec::new() });
    }

    let mut current = vec![root.to_path_buf()];
    for segment in rel.split('/').filter(|s| !s.is_empty()) {
        let mut next = Vec::new();
        if has_glob(segment) {
            let matcher = glob_matcher(segment)?;
            for dir in &current {
                let Ok(entries) = fs.read_dir(dir) else {
                    continue;
                };
                for entry in entries {
                    let matched = entry
                        .file_name()
                        .map(|n| matcher.is_match(Path::new(n)))
                        .unwrap_or(false);
                    if matched {
                        next.push(entry);
                    }
                }
            }
        } else {
            for dir in &current {
                let path = dir.join(segment);
                if fs.exists(&path) {
                    next.push(path);
                }
            }
        }
        if next.is_empty() {
            return Ok(Vec::new());
        }
        current = next;
    }
    current.sort();
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxsafe_core::testing::Sandbox;

    #[test]
    fn test_normalize_pattern() {
        assert_eq!(normalize_pattern("./etc/auto.*"), "etc/auto.*");
        assert_eq!(normalize_pattern("/etc/pve/"), "etc/pve/");
    }

    #[test]
    fn test_selector_dirs_files_and_globs() {
        let sel = PathSelector::new([
            "etc/pve/firewall/",
            "etc/hosts",
            "etc/proxmox-backup/tape*",
            "etc/pve/nodes/*/host.fw",
        ])
        .unwrap();
        assert!(sel.matches("etc/pve/firewall/cluster.fw"));
        assert!(sel.matches("./etc/hosts"));
        assert!(sel.matches("etc/proxmox-backup/tape.cfg"));
        assert!(sel.matches("etc/proxmox-backup/tape-encryption-keys.json"));
        assert!(sel.matches("etc/pve/nodes/pve1/host.fw"));
        assert!(!sel.matches("etc/pve/nodes/pve1/qemu-server/100.conf"));
        assert!(!sel.matches("etc/hostname"));
        assert!(!sel.matches("etc/pve/firewall2"));
    }

    #[test]
    fn test_expand_glob_segments() {
        let sandbox = Sandbox::new();
        sandbox.put("/etc/auto.master", "m");
        sandbox.put("/etc/auto.foo", "f");
        sandbox.put("/etc/other", "o");
        let fs = sandbox.fs();

        let found = expand(fs.as_ref(), Path::new("/"), "./etc/auto.*").unwrap();
        assert_eq!(
            found,
            vec![PathBuf::from("/etc/auto.foo"), PathBuf::from("/etc/auto.master")]
        );
        assert!(expand(fs.as_ref(), Path::new("/"), "etc/missing/*").unwrap().is_empty());
        assert_eq!(
            expand(fs.as_ref(), Path::new("/"), "etc/other").unwrap(),
            vec![PathBuf::from("/etc/other")]
        );
    }
}
