//! Side storage for fields added by a patch.
//!
//! Already-loaded types cannot grow new slots, so rewritten bodies read and
//! write added fields here. Instance values hang off a weak-keyed map, the
//! identity-hashed analog of an ephemeron table, so the store never extends
//! an owner's lifetime. A dead entry is evicted as soon as its key is
//! touched again; everything else is swept by the scanner's maintenance
//! pass.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use crate::keys::FieldKey;
use crate::runtime::lock;
use crate::runtime::value::{Instance, ObjRef, Value, zero_value};

pub struct FieldStore {
    instances: Mutex<HashMap<usize, InstanceEntry>>,
    statics: Mutex<HashMap<FieldKey, Value>>,
}

struct InstanceEntry {
    owner: Weak<Instance>,
    fields: HashMap<FieldKey, Value>,
}

/// The entry for an owner, identity-checked on every touch. The map key is
/// the owner's address, which the allocator can hand to a new instance once
/// the old one dies; an entry whose weak owner is gone, or alive but a
/// different object, belongs to a previous tenant of the address and is
/// replaced, never reused.
fn live_entry<'a>(
    map: &'a mut HashMap<usize, InstanceEntry>,
    owner: &ObjRef,
) -> &'a mut InstanceEntry {
    let key = identity(owner);
    let stale = match map.get(&key) {
        Some(entry) => match entry.owner.upgrade() {
            Some(live) => !ObjRef::ptr_eq(&live, owner),
            None => true,
        },
        None => false,
    };
    if stale {
        map.remove(&key);
    }
    map.entry(key)
        .or_insert_with(|| InstanceEntry { owner: ObjRef::downgrade(owner), fields: HashMap::new() })
}

impl FieldStore {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            statics: Mutex::new(HashMap::new()),
        }
    }

    /// Read an instance field; an unset key is initialized to the declared
    /// type's zero value first.
    pub fn get_instance(&self, owner: &ObjRef, key: &FieldKey, field_type: &str) -> Value {
        let mut map = lock(&self.instances);
        live_entry(&mut map, owner)
            .fields
            .entry(key.clone())
            .or_insert_with(|| zero_value(field_type))
            .clone()
    }

    pub fn set_instance(&self, owner: &ObjRef, key: &FieldKey, value: Value) {
        let mut map = lock(&self.instances);
        live_entry(&mut map, owner).fields.insert(key.clone(), value);
    }

    pub fn get_static(&self, key: &FieldKey, field_type: &str) -> Value {
        lock(&self.statics)
            .entry(key.clone())
            .or_insert_with(|| zero_value(field_type))
            .clone()
    }

    pub fn set_static(&self, key: &FieldKey, value: Value) {
        lock(&self.statics).insert(key.clone(), value);
    }

    /// Drop entries whose owners are gone. Called from the scanner's
    /// maintenance pass.
    pub fn prune(&self) -> usize {
        let mut map = lock(&self.instances);
        let before = map.len();
        map.retain(|_, entry| entry.owner.strong_count() > 0);
        before - map.len()
    }

    pub fn instance_entry_count(&self) -> usize {
        lock(&self.instances).len()
    }

    /// Cleared on playmode exit.
    pub fn clear(&self) {
        lock(&self.instances).clear();
        lock(&self.statics).clear();
    }
}

impl Default for FieldStore {
    fn default() -> Self {
        Self::new()
    }
}

fn identity(owner: &ObjRef) -> usize {
    ObjRef::as_ptr(owner) as usize
}
