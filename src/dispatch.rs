//! Runtime dispatcher: method id → invoker closure.
//!
//! The method id is the whole protocol between rewritten bodies and the
//! engine. Registration happens on the apply path; invocation comes from
//! the scheduler and any worker threads the application created, so the
//! table is read-mostly behind an `RwLock` and invokers are cloned out
//! before being called.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use crate::keys::MethodId;
use crate::runtime::value::Value;
use crate::runtime::{lock, read_lock, write_lock};

pub type InvokeResult = Result<Value, String>;

/// `(instance-or-null, argv) → result`.
pub type Invoker = Arc<dyn Fn(Option<Value>, &[Value]) -> InvokeResult + Send + Sync>;

pub struct Dispatcher {
    table: RwLock<HashMap<MethodId, Invoker>>,
    warned: Mutex<HashSet<MethodId>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Register or replace the invoker for an id. After this returns, every
    /// subsequent invoke for the id observes this invoker or a later one.
    pub fn register(&self, id: MethodId, invoker: Invoker) {
        write_lock(&self.table).insert(id, invoker);
        log::debug!(target: "respatch::dispatcher", "registered invoker for {id}");
    }

    pub fn contains(&self, id: MethodId) -> bool {
        read_lock(&self.table).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        read_lock(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        read_lock(&self.table).is_empty()
    }

    /// Invoke the registered closure. A miss returns null and warns once
    /// per unknown id; an invoker error is logged and yields null.
    pub fn invoke(&self, instance: Option<Value>, id: MethodId, argv: Option<&[Value]>) -> Value {
        let invoker = read_lock(&self.table).get(&id).cloned();
        let Some(invoker) = invoker else {
            if lock(&self.warned).insert(id) {
                log::warn!(target: "respatch::dispatcher", "no invoker registered for method id {id}");
            }
            return Value::Null;
        };
        match invoker(instance, argv.unwrap_or(&[])) {
            Ok(value) => value,
            Err(err) => {
                log::error!(target: "respatch::dispatcher", "invoker for {id} failed: {err}");
                Value::Null
            }
        }
    }

    /// Cleared on host teardown (playmode exit).
    pub fn clear(&self) {
        write_lock(&self.table).clear();
        lock(&self.warned).clear();
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
