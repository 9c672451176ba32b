//! Live variable store feeding the rule engine.
//!
//! Variables carry hierarchical dotted names (`hosts.agx.ip`), a fixed
//! type, an owning source id, and read-only/persist flags. A `set` that
//! changes the stored value notifies change listeners synchronously,
//! before the call returns, so rule evaluation always observes a
//! consistent ordering of samples and events.

use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::KvStore;
use crate::value::{Value, ValueType, MAX_STRING_LEN};

/// Maximum length of a variable name, in bytes.
pub const MAX_NAME_LEN: usize = 63;

/// KV key prefix under which persist-flagged variables are stored.
const KV_PREFIX: &str = "var.";

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+(\.[A-Za-z0-9_-]+)*$").unwrap());

/// A registered variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: Value,
    /// Identifier of the producer that registered this variable.
    pub source_id: String,
    /// Writes through [`VariableStore::set`] are denied.
    pub read_only: bool,
    /// Included in [`VariableStore::save_all`] / [`VariableStore::load_all`].
    pub persist: bool,
}

impl Variable {
    /// Convenience constructor for a writable, non-persisted variable.
    pub fn new(name: &str, value: Value, source_id: &str) -> Self {
        Self {
            name: name.to_string(),
            value,
            source_id: source_id.to_string(),
            read_only: false,
            persist: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }
}

/// Payload delivered to change listeners.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub name: String,
    pub old: Value,
    pub new: Value,
}

type ChangeListener = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Namespaced typed variable store with synchronous change events.
pub struct VariableStore {
    inner: Mutex<HashMap<String, Variable>>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidArgument(format!(
                "variable name length must be 1..={MAX_NAME_LEN}: '{name}'"
            )));
        }
        if !NAME_RE.is_match(name) {
            return Err(Error::InvalidArgument(format!(
                "variable name must be dotted alphanumeric segments: '{name}'"
            )));
        }
        Ok(())
    }

    fn validate_value(value: &Value) -> Result<()> {
        if let Value::Str(s) = value
            && s.len() > MAX_STRING_LEN
        {
            return Err(Error::InvalidArgument(format!(
                "string value exceeds {MAX_STRING_LEN} bytes"
            )));
        }
        Ok(())
    }

    /// Registers a new variable. Fails with `AlreadyExists` when the name
    /// is taken.
    pub fn register(&self, var: Variable) -> Result<()> {
        Self::validate_name(&var.name)?;
        Self::validate_value(&var.value)?;
        let mut inner = self.lock();
        if inner.contains_key(&var.name) {
            return Err(Error::AlreadyExists(var.name));
        }
        debug!("variable registered: {} ({})", var.name, var.source_id);
        inner.insert(var.name.clone(), var);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        inner
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Removes every variable registered by `source_id`. Returns the
    /// number of removed entries.
    pub fn unregister_by_source(&self, source_id: &str) -> usize {
        let mut inner = self.lock();
        let before = inner.len();
        inner.retain(|_, v| v.source_id != source_id);
        before - inner.len()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.lock().get(name).map(|v| v.value.clone())
    }

    /// Full variable metadata, for inspection surfaces.
    pub fn get_info(&self, name: &str) -> Option<Variable> {
        self.lock().get(name).cloned()
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(|v| v.as_bool())
    }

    pub fn get_int(&self, name: &str) -> Option<i32> {
        self.get(name).and_then(|v| v.as_int())
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.as_f64())
    }

    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get(name).and_then(|v| match v {
            Value::Str(s) => Some(s),
            _ => None,
        })
    }

    /// Sets a variable through the public path; read-only variables are
    /// denied.
    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        self.set_impl(name, value, false)
    }

    /// Sets a variable through the internal path, bypassing the
    /// read-only flag. Reserved for the system owner of the variable.
    pub fn set_internal(&self, name: &str, value: Value) -> Result<()> {
        self.set_impl(name, value, true)
    }

    fn set_impl(&self, name: &str, value: Value, internal: bool) -> Result<()> {
        Self::validate_value(&value)?;
        let event = {
            let mut inner = self.lock();
            let var = inner
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?;
            if var.read_only && !internal {
                return Err(Error::InvalidState(format!("variable is read-only: {name}")));
            }
            let value = coerce(&var.value, value)?;
            if var.value == value {
                return Ok(());
            }
            let old = std::mem::replace(&mut var.value, value.clone());
            ChangeEvent {
                name: name.to_string(),
                old,
                new: value,
            }
        };
        // Lock released before listeners run; delivery stays synchronous
        // to the setter's task.
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            listener(&event);
        }
        Ok(())
    }

    /// Registers a change listener. Listeners run on the setter's task.
    pub fn on_change(&self, listener: ChangeListener) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Visits a snapshot of every variable.
    pub fn iterate(&self, mut cb: impl FnMut(&Variable)) {
        let snapshot: Vec<Variable> = self.lock().values().cloned().collect();
        for var in &snapshot {
            cb(var);
        }
    }

    /// Visits a snapshot of every variable whose name starts with `prefix`.
    pub fn enumerate(&self, prefix: &str, mut cb: impl FnMut(&Variable)) {
        let snapshot: Vec<Variable> = self
            .lock()
            .values()
            .filter(|v| v.name.starts_with(prefix))
            .cloned()
            .collect();
        for var in &snapshot {
            cb(var);
        }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Persists every persist-flagged variable to the local KV store in
    /// one transaction. Returns the number of saved entries.
    pub fn save_all(&self, kv: &KvStore) -> Result<usize> {
        let entries: Vec<(String, Vec<u8>)> = {
            let inner = self.lock();
            let mut entries = Vec::new();
            for var in inner.values().filter(|v| v.persist) {
                let blob = serde_json::to_vec(var)
                    .map_err(|e| Error::Parse(format!("variable encode: {e}")))?;
                entries.push((format!("{KV_PREFIX}{}", var.name), blob));
            }
            entries
        };
        let count = entries.len();
        kv.replace_prefix(KV_PREFIX, entries)?;
        debug!("saved {count} persisted variables");
        Ok(count)
    }

    /// Loads persist-flagged variables from the local KV store.
    /// Existing variables are updated through the internal path; unknown
    /// names are registered.
    pub fn load_all(&self, kv: &KvStore) -> Result<usize> {
        let mut loaded = 0;
        for (key, blob) in kv.list_prefix(KV_PREFIX)? {
            let var: Variable = match serde_json::from_slice(&blob) {
                Ok(v) => v,
                Err(e) => {
                    warn!("skipping undecodable persisted variable {key}: {e}");
                    continue;
                }
            };
            if self.exists(&var.name) {
                self.set_internal(&var.name, var.value)?;
            } else {
                self.register(var)?;
            }
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Exports the full store as a JSON array.
    pub fn export_json(&self) -> Result<String> {
        let snapshot: Vec<Variable> = self.lock().values().cloned().collect();
        serde_json::to_string_pretty(&snapshot)
            .map_err(|e| Error::Parse(format!("variable export: {e}")))
    }

    /// Imports variables from [`VariableStore::export_json`] output.
    /// Existing names are overwritten through the internal path.
    pub fn import_json(&self, json: &str) -> Result<usize> {
        let vars: Vec<Variable> =
            serde_json::from_str(json).map_err(|e| Error::Parse(format!("variable import: {e}")))?;
        let mut imported = 0;
        for var in vars {
            if self.exists(&var.name) {
                self.set_internal(&var.name, var.value)?;
            } else {
                self.register(var)?;
            }
            imported += 1;
        }
        Ok(imported)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Variable>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Coerces `value` to the declared type of the stored variable.
///
/// Int and Float interchange (an int-typed variable accepts `80.0`);
/// every other cross-type write is rejected.
fn coerce(current: &Value, value: Value) -> Result<Value> {
    let declared = current.value_type();
    if value.value_type() == declared {
        return Ok(value);
    }
    match (declared, &value) {
        (ValueType::Int, Value::Float(f)) if f.fract() == 0.0 => Ok(Value::Int(*f as i32)),
        (ValueType::Float, Value::Int(i)) => Ok(Value::Float(f64::from(*i))),
        _ => Err(Error::InvalidArgument(format!(
            "type mismatch: variable is {declared:?}, value is {:?}",
            value.value_type()
        ))),
    }
}
