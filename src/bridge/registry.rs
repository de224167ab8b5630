//! Object registry: object path → live [`BridgeResource`], plus a reverse index
//! by owner so a dead process's paths can be found without a scan.

use super::resource::BridgeResource;
use crate::error::BridgeError;
use crate::bus::ObjectPath;
use crate::process::Pid;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub struct ObjectRegistry<P> {
    entries: HashMap<ObjectPath, Arc<BridgeResource<P>>>,
    by_owner: HashMap<Pid, BTreeSet<ObjectPath>>,
}

impl<P> Default for ObjectRegistry<P> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            by_owner: HashMap::new(),
        }
    }
}

impl<P> ObjectRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &ObjectPath) -> bool {
        self.entries.contains_key(path)
    }

    /// Adds an entry. An occupied path is left untouched.
    pub fn insert(&mut self, resource: Arc<BridgeResource<P>>) -> Result<(), BridgeError> {
        let path = resource.path().clone();
        if self.entries.contains_key(&path) {
            return Err(BridgeError::RegistrationConflict(path));
        }
        self.by_owner
            .entry(resource.owner())
            .or_default()
            .insert(path.clone());
        self.entries.insert(path, resource);
        Ok(())
    }

    pub fn get(&self, path: &ObjectPath) -> Option<&Arc<BridgeResource<P>>> {
        self.entries.get(path)
    }

    pub fn remove(&mut self, path: &ObjectPath) -> Option<Arc<BridgeResource<P>>> {
        let resource = self.entries.remove(path)?;
        self.forget_owner_path(resource.owner(), path);
        Some(resource)
    }

    /// Removes the entry for `resource`'s path only if it is still this very
    /// resource (not a later registration of the same path).
    pub fn remove_if_same(&mut self, resource: &Arc<BridgeResource<P>>) -> bool {
        match self.entries.get(resource.path()) {
            Some(current) if Arc::ptr_eq(current, resource) => {
                self.remove(resource.path());
                true
            }
            _ => false,
        }
    }

    /// Removes and returns every entry owned by `owner`.
    pub fn remove_owner(&mut self, owner: Pid) -> Vec<Arc<BridgeResource<P>>> {
        let Some(paths) = self.by_owner.remove(&owner) else {
            return Vec::new();
        };
        paths
            .iter()
            .filter_map(|path| self.entries.remove(path))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<Arc<BridgeResource<P>>> {
        self.by_owner.clear();
        self.entries.drain().map(|(_, resource)| resource).collect()
    }

    /// Registered paths in sorted order.
    pub fn paths(&self) -> Vec<ObjectPath> {
        let mut paths: Vec<_> = self.entries.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn forget_owner_path(&mut self, owner: Pid, path: &ObjectPath) {
        if let Some(paths) = self.by_owner.get_mut(&owner) {
            paths.remove(path);
            if paths.is_empty() {
                self.by_owner.remove(&owner);
            }
        }
    }
}

#[cfg(test)]
impl<P> ObjectRegistry<P> {
    pub fn owned_by(&self, owner: Pid) -> usize {
        self.by_owner.get(&owner).map_or(0, BTreeSet::len)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Connection;
    use crate::mock::MockConnection;
    use crate::process::{LocalRuntime, ProcessRuntime};
    use std::sync::Weak;

    fn resource(path: &str, owner: Pid, payload: u32) -> Arc<BridgeResource<u32>> {
        let runtime: Arc<dyn ProcessRuntime> = Arc::new(LocalRuntime::new());
        let connection: Weak<dyn Connection> = Weak::<MockConnection>::new();
        Arc::new(BridgeResource::new(
            ObjectPath::parse(path).unwrap(),
            owner,
            payload,
            connection,
            runtime,
        ))
    }

    #[test]
    fn test_conflicting_insert_keeps_original() {
        let mut registry = ObjectRegistry::new();
        let alice = Pid::from_raw(1);
        let bob = Pid::from_raw(2);
        registry.insert(resource("/a", alice, 1)).unwrap();

        let result = registry.insert(resource("/a", bob, 2));
        assert!(matches!(result, Err(BridgeError::RegistrationConflict(_))));

        let path = ObjectPath::parse("/a").unwrap();
        let current = registry.get(&path).unwrap();
        assert_eq!(current.owner(), alice);
        assert_eq!(*current.payload(), 1);
        assert_eq!(registry.owned_by(bob), 0);
    }

    #[test]
    fn test_remove_owner() {
        let mut registry = ObjectRegistry::new();
        let alice = Pid::from_raw(1);
        let bob = Pid::from_raw(2);
        registry.insert(resource("/a", alice, 1)).unwrap();
        registry.insert(resource("/b", alice, 2)).unwrap();
        registry.insert(resource("/c", bob, 3)).unwrap();

        let removed = registry.remove_owner(alice);
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.paths(), vec![ObjectPath::parse("/c").unwrap()]);
        assert!(registry.remove_owner(alice).is_empty());
    }

    #[test]
    fn test_remove_if_same_ignores_newer_registration() {
        let mut registry = ObjectRegistry::new();
        let old = resource("/a", Pid::from_raw(1), 1);
        registry.insert(old.clone()).unwrap();
        registry.remove(old.path());

        let new = resource("/a", Pid::from_raw(2), 2);
        registry.insert(new.clone()).unwrap();
        assert!(!registry.remove_if_same(&old));
        assert!(registry.contains(new.path()));
        assert!(registry.remove_if_same(&new));
        assert!(registry.is_empty());
    }
}
