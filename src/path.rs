//! Path resolution and manipulation utilities.

use alloc::vec::Vec;

use crate::block_dev::BlockDevice;
use crate::error::{FsError, Result};
use crate::fs::Volume;
use crate::node::Node;

/// Splits a path into (parent, final component), ignoring trailing slashes.
/// e.g. "/a/b/c/" -> ("/a/b", "c"), "x" -> ("", "x").
pub fn split(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    }
}

impl<D: BlockDevice> Volume<D> {
    /// Resolves a path from the root directory to a node.
    /// "." is skipped; ".." goes back to the parent, stopping at the root.
    pub fn resolve(&self, path: &str) -> Result<Node> {
        let mut stack: Vec<Node> = Vec::new();
        let mut current = self.root();
        for component in path.split('/').filter(|s| !s.is_empty()) {
            match component {
                "." => {}
                ".." => {
                    if let Some(parent) = stack.pop() {
                        current = parent;
                    }
                }
                name => {
                    if !current.is_dir() {
                        return Err(FsError::NotDirectory);
                    }
                    let next = self.lookup(&current, name)?;
                    stack.push(core::mem::replace(&mut current, next));
                }
            }
        }
        Ok(current)
    }

    /// Resolves the parent directory of `path` and returns it with the final
    /// component's name.
    pub fn resolve_parent<'p>(&self, path: &'p str) -> Result<(Node, &'p str)> {
        let (parent, name) = split(path);
        if name.is_empty() || name == "." || name == ".." {
            return Err(FsError::InvalidFileName);
        }
        let dir = self.resolve(parent)?;
        if !dir.is_dir() {
            return Err(FsError::NotDirectory);
        }
        Ok((dir, name))
    }
}

#[cfg(test)]
mod tests {
    use super::split;

    #[test]
    fn split_paths() {
        assert_eq!(split("/a/b/c"), ("/a/b", "c"));
        assert_eq!(split("/a/b/c/"), ("/a/b", "c"));
        assert_eq!(split("/top"), ("/", "top"));
        assert_eq!(split("name"), ("", "name"));
        assert_eq!(split("/"), ("", ""));
    }
}
