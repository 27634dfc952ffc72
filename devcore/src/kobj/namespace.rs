//! Path index of published nodes.
//!
//! Publication is the registry's own bookkeeping: it assigns the path, records the parent
//! back-reference and rejects a duplicate path before any external collaborator sees the node.

use std::collections::BTreeMap;

use spin::RwLock;

use super::{KobjPtr, KobjWeak, same_node, validate_name};
use crate::error::KobjError;

#[derive(Default)]
pub struct Namespace {
    nodes: RwLock<BTreeMap<Box<str>, KobjWeak>>,
}

impl Namespace {
    pub const fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Publish `node` below `parent` (or at the top level) and return its path.
    pub fn publish(&self, node: &KobjPtr, parent: Option<&KobjPtr>) -> Result<Box<str>, KobjError> {
        let kobj = node.kobj();
        let name = kobj.name().ok_or(KobjError::InvalidName)?;
        validate_name(&name)?;
        if kobj.is_published() {
            return Err(KobjError::AlreadyPublished);
        }
        let parent_path = match parent {
            Some(parent) => parent.kobj().path().ok_or(KobjError::InvalidParent)?,
            None => Box::from(""),
        };
        let path: Box<str> = format!("{}/{}", parent_path, name).into();

        let mut nodes = self.nodes.write();
        if nodes.get(&path).is_some_and(|old| old.strong_count() > 0) {
            return Err(KobjError::Exists { path });
        }
        nodes.insert(path.clone(), KobjPtr::downgrade(node));
        kobj.attach(path.clone(), parent.map(KobjPtr::downgrade));
        Ok(path)
    }

    /// Take `node` out of the index. Unpublished nodes are left alone.
    pub fn unpublish(&self, node: &KobjPtr) {
        let kobj = node.kobj();
        let mut nodes = self.nodes.write();
        let Some(path) = kobj.path() else {
            return;
        };
        let owned = nodes
            .get(&path)
            .and_then(KobjWeak::upgrade)
            .is_some_and(|cur| same_node(&cur, node));
        if owned {
            nodes.remove(&path);
        }
        kobj.detach();
    }

    pub fn lookup(&self, path: &str) -> Option<KobjPtr> {
        self.nodes.read().get(path).and_then(KobjWeak::upgrade)
    }

    /// Names of the live nodes directly below `path`.
    pub fn children(&self, path: &str) -> Vec<Box<str>> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.nodes
            .read()
            .iter()
            .filter(|(_, node)| node.strong_count() > 0)
            .filter_map(|(key, _)| key.strip_prefix(prefix.as_str()))
            .filter(|rest| !rest.contains('/'))
            .map(Box::from)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes
            .read()
            .values()
            .filter(|node| node.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kobj::{Kobj, KobjDir};

    #[test]
    fn publish_assigns_nested_paths() {
        let ns = Namespace::new();
        let root = KobjDir::new("devices").node();
        let child = KobjDir::new("platform").node();
        assert_eq!(&*ns.publish(&root, None).unwrap(), "/devices");
        assert_eq!(&*ns.publish(&child, Some(&root)).unwrap(), "/devices/platform");
        assert!(same_node(&child.kobj().parent().unwrap(), &root));
        assert!(same_node(&ns.lookup("/devices/platform").unwrap(), &child));
        assert_eq!(ns.children("/devices"), vec![Box::<str>::from("platform")]);
    }

    #[test]
    fn duplicate_path_is_rejected() {
        let ns = Namespace::new();
        let a = KobjDir::new("a").node();
        let b = KobjDir::new("a").node();
        ns.publish(&a, None).unwrap();
        assert_eq!(
            ns.publish(&b, None),
            Err(KobjError::Exists { path: "/a".into() })
        );
        assert!(!b.kobj().is_published());
        assert_eq!(ns.publish(&a, None), Err(KobjError::AlreadyPublished));
    }

    #[test]
    fn dead_entries_do_not_block_reuse() {
        let ns = Namespace::new();
        {
            let a = KobjDir::new("a").node();
            ns.publish(&a, None).unwrap();
        }
        assert!(ns.is_empty());
        let again = KobjDir::new("a").node();
        ns.publish(&again, None).unwrap();
        ns.unpublish(&again);
        assert!(ns.lookup("/a").is_none());
        assert!(!again.kobj().is_published());
    }

    #[test]
    fn unpublished_parent_is_invalid() {
        let ns = Namespace::new();
        let parent = KobjDir::new("p").node();
        let child = KobjDir::new("c").node();
        assert_eq!(ns.publish(&child, Some(&parent)), Err(KobjError::InvalidParent));
    }
}
