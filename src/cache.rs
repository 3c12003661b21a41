//! In-process snapshot of system-scope settings with change callbacks.
//!
//! Readers never block on the store; typed accessors fall back to defaults
//! on missing keys or type mismatches. Callbacks fire outside the lock:
//! change lists are collected under the write lock and dispatched after it
//! is released, at most once per change event.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::store::{Setting, Store, StoreError};

type ChangeCallback = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

struct CacheState {
    data: HashMap<String, Value>,
    /// Global version cursor: the max setting version seen.
    version: i64,
}

pub struct SettingsCache {
    state: RwLock<CacheState>,
    callbacks: RwLock<Vec<ChangeCallback>>,
    store: Store,
}

impl SettingsCache {
    /// Build the cache and load the initial snapshot. A failed load leaves
    /// the cache empty; readers fall back to defaults until a refresh
    /// succeeds.
    pub fn new(store: Store) -> Self {
        let cache = Self {
            state: RwLock::new(CacheState {
                data: HashMap::new(),
                version: 0,
            }),
            callbacks: RwLock::new(Vec::new()),
            store,
        };
        cache.reload(false);
        cache
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.read().unwrap().data.get(key).cloned()
    }

    /// Integer accessor tolerating both integer- and float-shaped JSON
    /// numbers.
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(Value::String(s)) => s,
            _ => default.to_string(),
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => b,
            _ => default,
        }
    }

    pub fn version(&self) -> i64 {
        self.state.read().unwrap().version
    }

    /// Register a change callback. Called with `None` when a key is
    /// removed.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(&str, Option<&Value>) + Send + Sync + 'static,
    {
        self.callbacks.write().unwrap().push(Arc::new(callback));
    }

    /// Persist a system-scope setting through the store, then update the
    /// local snapshot and notify observers.
    pub fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut setting = Setting {
            key: key.to_string(),
            scope: "system".to_string(),
            value: value.clone(),
            ..Default::default()
        };
        self.store.upsert_setting(&mut setting)?;

        {
            let mut state = self.state.write().unwrap();
            state.data.insert(key.to_string(), value.clone());
            if setting.version > 0 {
                state.version = state.version.max(setting.version);
            } else {
                state.version += 1;
            }
        }
        self.notify(key, Some(&value));
        Ok(())
    }

    /// Update the snapshot after another component already persisted the
    /// change. No store write.
    pub fn update_local(&self, key: &str, value: Value, version: i64) {
        {
            let mut state = self.state.write().unwrap();
            state.data.insert(key.to_string(), value.clone());
            if version > 0 {
                state.version = state.version.max(version);
            }
        }
        self.notify(key, Some(&value));
    }

    /// Reload the snapshot from the store and fire callbacks for changed
    /// and removed keys. Invoked periodically by the host.
    pub fn refresh(&self) {
        self.reload(true);
    }

    fn reload(&self, notify: bool) {
        let settings = match self.store.list_settings(Some("system"), None, None) {
            Ok(settings) => settings,
            Err(_) => return,
        };

        let mut new_data = HashMap::with_capacity(settings.len());
        let mut max_version = 0;
        for s in settings {
            max_version = max_version.max(s.version);
            new_data.insert(s.key, s.value);
        }

        let mut changed: Vec<(String, Value)> = Vec::new();
        let mut removed: Vec<String> = Vec::new();
        {
            let mut state = self.state.write().unwrap();
            if notify {
                for (key, value) in &new_data {
                    if state.data.get(key) != Some(value) {
                        changed.push((key.clone(), value.clone()));
                    }
                }
                for key in state.data.keys() {
                    if !new_data.contains_key(key) {
                        removed.push(key.clone());
                    }
                }
            }
            state.data = new_data;
            if max_version > 0 {
                state.version = max_version;
            }
        }

        if notify {
            for (key, value) in &changed {
                self.notify(key, Some(value));
            }
            for key in &removed {
                self.notify(key, None);
            }
        }
    }

    fn notify(&self, key: &str, value: Option<&Value>) {
        let callbacks = self.callbacks.read().unwrap().clone();
        for callback in callbacks {
            callback(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_initial_load_and_typed_accessors() {
        let (store, _tmp) = test_store();
        let mut s = Setting {
            key: "max_conns".to_string(),
            value: json!(32.0),
            ..Default::default()
        };
        store.upsert_setting(&mut s).unwrap();
        let mut s = Setting {
            key: "banner".to_string(),
            value: json!("hello"),
            ..Default::default()
        };
        store.upsert_setting(&mut s).unwrap();

        let cache = SettingsCache::new(store);
        assert_eq!(cache.get_int("max_conns", 8), 32, "float-shaped number accepted");
        assert_eq!(cache.get_int("missing", 8), 8);
        assert_eq!(cache.get_int("banner", 8), 8, "type mismatch falls back");
        assert_eq!(cache.get_string("banner", "x"), "hello");
        assert_eq!(cache.get_bool("missing", true), true);
        assert_eq!(cache.version(), 2);
    }

    #[test]
    fn test_set_writes_through_and_notifies() {
        let (store, _tmp) = test_store();
        let cache = SettingsCache::new(store.clone());

        let events: Arc<Mutex<Vec<(String, Option<Value>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        cache.on_change(move |key, value| {
            sink.lock().unwrap().push((key.to_string(), value.cloned()));
        });

        cache.set("mode", json!("active")).unwrap();

        assert_eq!(cache.get_string("mode", ""), "active");
        assert_eq!(cache.version(), 1);
        assert_eq!(
            store.get_setting("mode", "system", None).unwrap().value,
            json!("active")
        );
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], ("mode".to_string(), Some(json!("active"))));
    }

    #[test]
    fn test_refresh_diffs_changed_and_removed() {
        let (store, _tmp) = test_store();
        let mut keep = Setting {
            key: "keep".to_string(),
            value: json!(1),
            ..Default::default()
        };
        store.upsert_setting(&mut keep).unwrap();
        let mut gone = Setting {
            key: "gone".to_string(),
            value: json!(2),
            ..Default::default()
        };
        store.upsert_setting(&mut gone).unwrap();

        let cache = SettingsCache::new(store.clone());

        let events: Arc<Mutex<Vec<(String, Option<Value>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        cache.on_change(move |key, value| {
            sink.lock().unwrap().push((key.to_string(), value.cloned()));
        });

        // Mutate behind the cache's back, then refresh.
        keep.value = json!(10);
        store.update_setting(&mut keep).unwrap();
        store.delete_setting("gone", "system", None).unwrap();
        cache.refresh();

        let mut events = events.lock().unwrap().clone();
        events.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(events.len(), 2, "unchanged keys fire nothing");
        assert_eq!(events[0], ("gone".to_string(), None));
        assert_eq!(events[1], ("keep".to_string(), Some(json!(10))));
        assert_eq!(cache.get("gone"), None);
        assert_eq!(cache.version(), 2);
    }

    #[test]
    fn test_update_local_skips_store() {
        let (store, _tmp) = test_store();
        let cache = SettingsCache::new(store.clone());

        cache.update_local("ephemeral", json!(5), 7);

        assert_eq!(cache.get_int("ephemeral", 0), 5);
        assert_eq!(cache.version(), 7);
        assert!(matches!(
            store.get_setting("ephemeral", "system", None),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_empty_store_serves_defaults() {
        let (store, _tmp) = test_store();
        let cache = SettingsCache::new(store);
        assert_eq!(cache.get_int("anything", 42), 42);
        assert_eq!(cache.version(), 0);
    }
}
