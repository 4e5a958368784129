use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use openerp_core::ServiceError;
use openerp_kv::KVStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const KEY_PREFIX: &str = "native_seq:";

fn key(name: &str) -> String {
    format!("{KEY_PREFIX}{name}")
}

/// Durable state of one native counter.
///
/// Mirrors a database `SEQUENCE`: until the first draw (`is_called ==
/// false`) the next value is `last_value` itself, afterwards it is
/// `last_value + increment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeState {
    pub last_value: i64,
    pub increment: i64,
    pub is_called: bool,
    /// Objects that reference this counter and block dropping it.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependents: BTreeSet<String>,
}

impl NativeState {
    fn predicted(&self) -> i64 {
        if self.is_called {
            self.last_value.saturating_add(self.increment)
        } else {
            self.last_value
        }
    }
}

/// `None` once the counter has been dropped, so late holders of the slot
/// cannot resurrect it.
type Slot = Arc<Mutex<Option<NativeState>>>;

/// Registry of native counters, persisted in the KV store.
///
/// Every draw is committed to the KV store before it returns and is never
/// undone by a caller's rollback. Draws on one counter serialize on that
/// counter's slot only; different counters never contend.
pub struct NativeSequences {
    kv: Arc<dyn KVStore>,
    slots: Mutex<HashMap<String, Slot>>,
}

fn zero_step() -> ServiceError {
    ServiceError::Validation("Step must not be zero.".into())
}

fn poisoned(e: impl std::fmt::Display) -> ServiceError {
    ServiceError::Internal(format!("native counter lock poisoned: {e}"))
}

impl NativeSequences {
    pub fn new(kv: Arc<dyn KVStore>) -> Self {
        Self {
            kv,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Find the slot for `name`, loading it from the KV store on first use.
    fn slot(&self, name: &str) -> Result<Slot, ServiceError> {
        let mut slots = self.slots.lock().map_err(poisoned)?;
        if let Some(slot) = slots.get(name) {
            return Ok(Arc::clone(slot));
        }

        let state = match self
            .kv
            .get(&key(name))
            .map_err(|e| ServiceError::Storage(e.to_string()))?
        {
            Some(data) => Some(
                serde_json::from_slice::<NativeState>(&data)
                    .map_err(|e| ServiceError::Internal(format!("corrupt counter {name}: {e}")))?,
            ),
            None => None,
        };
        let slot = Arc::new(Mutex::new(state));
        slots.insert(name.to_string(), Arc::clone(&slot));
        Ok(slot)
    }

    fn persist(&self, name: &str, state: &NativeState) -> Result<(), ServiceError> {
        let data = serde_json::to_vec(state).map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.kv
            .set(&key(name), &data)
            .map_err(|e| ServiceError::Storage(e.to_string()))
    }

    /// Create a counter whose first draw returns `start`.
    pub fn create(&self, name: &str, increment: i64, start: i64) -> Result<(), ServiceError> {
        if increment == 0 {
            return Err(zero_step());
        }
        let slot = self.slot(name)?;
        let mut state = slot.lock().map_err(poisoned)?;
        if state.is_some() {
            return Err(ServiceError::Conflict(format!("native counter {name} already exists")));
        }
        let fresh = NativeState {
            last_value: start,
            increment,
            is_called: false,
            dependents: BTreeSet::new(),
        };
        self.persist(name, &fresh)?;
        *state = Some(fresh);
        info!("created native counter {name} (step {increment}, start {start})");
        Ok(())
    }

    /// Like [`create`](Self::create) but leaves an existing counter untouched.
    pub fn ensure(&self, name: &str, increment: i64, start: i64) -> Result<(), ServiceError> {
        match self.create(name, increment, start) {
            Err(ServiceError::Conflict(_)) => Ok(()),
            other => other,
        }
    }

    pub fn exists(&self, name: &str) -> Result<bool, ServiceError> {
        let slot = self.slot(name)?;
        let state = slot.lock().map_err(poisoned)?;
        Ok(state.is_some())
    }

    /// Change the step and/or restart the counter. A missing counter is
    /// left alone.
    pub fn alter(
        &self,
        name: &str,
        increment: Option<i64>,
        restart: Option<i64>,
    ) -> Result<(), ServiceError> {
        if increment == Some(0) {
            return Err(zero_step());
        }
        let slot = self.slot(name)?;
        let mut guard = slot.lock().map_err(poisoned)?;
        let Some(current) = guard.as_ref() else {
            debug!("alter of absent native counter {name} ignored");
            return Ok(());
        };

        let mut next = current.clone();
        if let Some(step) = increment {
            next.increment = step;
        }
        if let Some(value) = restart {
            next.last_value = value;
            next.is_called = false;
        }
        self.persist(name, &next)?;
        *guard = Some(next);
        Ok(())
    }

    /// Draw the next value.
    pub fn nextval(&self, name: &str) -> Result<i64, ServiceError> {
        let slot = self.slot(name)?;
        let mut guard = slot.lock().map_err(poisoned)?;
        let current = guard
            .as_ref()
            .ok_or_else(|| ServiceError::NotFound(format!("native counter {name} not found")))?;

        let mut next = current.clone();
        if next.is_called {
            next.last_value = next.last_value.checked_add(next.increment).ok_or_else(|| {
                ServiceError::Validation(format!("native counter {name} reached its limit"))
            })?;
        } else {
            next.is_called = true;
        }
        self.persist(name, &next)?;
        let value = next.last_value;
        *guard = Some(next);
        Ok(value)
    }

    /// The value the next draw would return, without drawing it.
    pub fn peek(&self, name: &str) -> Result<Option<i64>, ServiceError> {
        let slot = self.slot(name)?;
        let state = slot.lock().map_err(poisoned)?;
        Ok(state.as_ref().map(NativeState::predicted))
    }

    /// Record that `dependent` references counter `name`.
    pub fn add_dependent(&self, name: &str, dependent: &str) -> Result<(), ServiceError> {
        self.update_dependents(name, |deps| {
            deps.insert(dependent.to_string());
        })
    }

    pub fn remove_dependent(&self, name: &str, dependent: &str) -> Result<(), ServiceError> {
        self.update_dependents(name, |deps| {
            deps.remove(dependent);
        })
    }

    fn update_dependents(
        &self,
        name: &str,
        f: impl FnOnce(&mut BTreeSet<String>),
    ) -> Result<(), ServiceError> {
        let slot = self.slot(name)?;
        let mut guard = slot.lock().map_err(poisoned)?;
        let current = guard
            .as_ref()
            .ok_or_else(|| ServiceError::NotFound(format!("native counter {name} not found")))?;
        let mut next = current.clone();
        f(&mut next.dependents);
        self.persist(name, &next)?;
        *guard = Some(next);
        Ok(())
    }

    /// Drop the named counters. Absent counters are skipped; if any counter
    /// still has dependents nothing is dropped.
    ///
    /// Returns the value each dropped counter would have drawn next, read
    /// under the same lock as the drop.
    pub fn drop_all(&self, names: &[String]) -> Result<Vec<(String, i64)>, ServiceError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        // Fixed lock order, and no slot locked twice.
        let mut names = names.to_vec();
        names.sort();
        names.dedup();

        let slots: Vec<(&String, Slot)> = names
            .iter()
            .map(|n| self.slot(n).map(|s| (n, s)))
            .collect::<Result<_, _>>()?;

        // Hold every slot while checking and dropping so no draw slips in.
        let mut guards = Vec::with_capacity(slots.len());
        let mut last = Vec::new();
        for (name, slot) in &slots {
            let guard = slot.lock().map_err(poisoned)?;
            if let Some(state) = guard.as_ref() {
                if !state.dependents.is_empty() {
                    let deps: Vec<&str> = state.dependents.iter().map(String::as_str).collect();
                    return Err(ServiceError::Conflict(format!(
                        "cannot drop native counter {name}: still referenced by {}",
                        deps.join(", ")
                    )));
                }
                last.push(((*name).clone(), state.predicted()));
            }
            guards.push(guard);
        }

        let keys: Vec<String> = names.iter().map(|n| key(n)).collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.kv
            .batch_delete(&key_refs)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;

        for guard in guards.iter_mut() {
            **guard = None;
        }
        drop(guards);

        let mut map = self.slots.lock().map_err(poisoned)?;
        for name in &names {
            map.remove(name);
        }
        info!("dropped native counters {}", names.join(", "));
        Ok(last)
    }

    /// Names of all persisted counters, sorted.
    pub fn names(&self) -> Result<Vec<String>, ServiceError> {
        let entries = self
            .kv
            .scan(KEY_PREFIX)
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        Ok(entries
            .into_iter()
            .filter_map(|(k, _)| k.strip_prefix(KEY_PREFIX).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use openerp_kv::RedbStore;

    use super::*;

    fn natives() -> NativeSequences {
        NativeSequences::new(Arc::new(RedbStore::open_in_memory().unwrap()))
    }

    #[test]
    fn first_draw_returns_start_then_steps() {
        let n = natives();
        n.create("ir_sequence_001", 5, 10).unwrap();
        assert_eq!(n.peek("ir_sequence_001").unwrap(), Some(10));
        assert_eq!(n.nextval("ir_sequence_001").unwrap(), 10);
        assert_eq!(n.nextval("ir_sequence_001").unwrap(), 15);
        assert_eq!(n.peek("ir_sequence_001").unwrap(), Some(20));
    }

    #[test]
    fn zero_step_rejected_before_any_write() {
        let n = natives();
        assert!(matches!(
            n.create("ir_sequence_001", 0, 1),
            Err(ServiceError::Validation(_))
        ));
        assert!(!n.exists("ir_sequence_001").unwrap());

        n.create("ir_sequence_001", 1, 1).unwrap();
        assert!(matches!(
            n.alter("ir_sequence_001", Some(0), None),
            Err(ServiceError::Validation(_))
        ));
        assert_eq!(n.nextval("ir_sequence_001").unwrap(), 1);
    }

    #[test]
    fn create_twice_conflicts_but_ensure_is_quiet() {
        let n = natives();
        n.create("a", 1, 1).unwrap();
        assert!(matches!(n.create("a", 1, 1), Err(ServiceError::Conflict(_))));
        n.ensure("a", 1, 99).unwrap();
        assert_eq!(n.nextval("a").unwrap(), 1);
    }

    #[test]
    fn alter_restart_and_step() {
        let n = natives();
        n.create("a", 1, 1).unwrap();
        n.nextval("a").unwrap();
        n.alter("a", Some(10), None).unwrap();
        assert_eq!(n.nextval("a").unwrap(), 11);
        n.alter("a", None, Some(100)).unwrap();
        assert_eq!(n.nextval("a").unwrap(), 100);
        assert_eq!(n.nextval("a").unwrap(), 110);
        // Absent counters are ignored.
        n.alter("missing", Some(3), Some(3)).unwrap();
        assert!(!n.exists("missing").unwrap());
    }

    #[test]
    fn drop_respects_dependents() {
        let n = natives();
        n.create("a", 1, 1).unwrap();
        n.create("b", 1, 1).unwrap();
        n.add_dependent("b", "report_view").unwrap();

        let names = vec!["a".to_string(), "b".to_string(), "gone".to_string()];
        assert!(matches!(n.drop_all(&names), Err(ServiceError::Conflict(_))));
        assert!(n.exists("a").unwrap());

        n.remove_dependent("b", "report_view").unwrap();
        n.nextval("b").unwrap();
        let dropped = n.drop_all(&names).unwrap();
        assert_eq!(dropped, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
        assert!(!n.exists("a").unwrap());
        assert!(!n.exists("b").unwrap());
        assert!(n.names().unwrap().is_empty());
        assert!(matches!(n.nextval("a"), Err(ServiceError::NotFound(_))));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("native.redb");
        {
            let n = NativeSequences::new(Arc::new(RedbStore::open(&path).unwrap()));
            n.create("ir_sequence_007", 1, 1).unwrap();
            n.nextval("ir_sequence_007").unwrap();
            n.nextval("ir_sequence_007").unwrap();
        }
        let n = NativeSequences::new(Arc::new(RedbStore::open(&path).unwrap()));
        assert_eq!(n.nextval("ir_sequence_007").unwrap(), 3);
        assert_eq!(n.names().unwrap(), vec!["ir_sequence_007".to_string()]);
    }

    #[test]
    fn concurrent_draws_are_distinct() {
        let n = Arc::new(natives());
        n.create("hot", 1, 1).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let n = Arc::clone(&n);
                thread::spawn(move || (0..25).map(|_| n.nextval("hot").unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        assert_eq!(all, (1..=200).collect::<Vec<_>>());
    }
}
