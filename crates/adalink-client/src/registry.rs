use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use adalink_core::types::Fnr;

use crate::repository::MapRepository;

type Key = (String, u32);

fn registry() -> &'static Mutex<HashMap<Key, Arc<MapRepository>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<Key, Arc<MapRepository>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a repository for (target, file). Idempotent: a second add for
/// the same key returns the already-registered instance.
pub fn add_repository(target: &str, fnr: Fnr) -> Arc<MapRepository> {
    let key = (target.to_string(), fnr.0);
    let mut table = lock();
    if let Some(existing) = table.get(&key) {
        return Arc::clone(existing);
    }
    let repository = Arc::new(MapRepository::new(target, fnr));
    table.insert(key, Arc::clone(&repository));
    log::debug!("registered map repository ({target}, {fnr})");
    repository
}

pub fn repository(target: &str, fnr: Fnr) -> Option<Arc<MapRepository>> {
    lock().get(&(target.to_string(), fnr.0)).map(Arc::clone)
}

pub fn remove_repository(target: &str, fnr: Fnr) {
    lock().remove(&(target.to_string(), fnr.0));
}

/// Registered (target, file) keys, in no particular order.
pub fn list_repositories() -> Vec<(String, Fnr)> {
    lock()
        .keys()
        .map(|(target, fnr)| (target.clone(), Fnr(*fnr)))
        .collect()
}

/// Drain the registry. Test teardown uses this to isolate cases.
pub fn reset_repositories() {
    lock().clear();
}

fn lock() -> std::sync::MutexGuard<'static, HashMap<Key, Arc<MapRepository>>> {
    match registry().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent_by_key() {
        reset_repositories();
        let first = add_repository("acj;target=7024", Fnr(4));
        let second = add_repository("acj;target=7024", Fnr(4));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(list_repositories().len(), 1);

        add_repository("acj;target=7024", Fnr(5));
        assert_eq!(list_repositories().len(), 2);

        remove_repository("acj;target=7024", Fnr(4));
        assert!(repository("acj;target=7024", Fnr(4)).is_none());
        assert!(repository("acj;target=7024", Fnr(5)).is_some());
        reset_repositories();
        assert!(list_repositories().is_empty());
    }
}
