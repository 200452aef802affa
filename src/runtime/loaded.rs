//! A module as the runtime sees it: the loaded image, one swappable body
//! slot per method, the scheduler's entry-point cache, and dynamically
//! allocated methods.
//!
//! Detour and trampoline handles are RAII: dropping one restores the
//! original body or entry target. The installer owns every live handle;
//! a handle that falls out of scope silently removes its patch.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::entrypoints::{LifecycleKind, is_lifecycle_method};
use crate::image::instr::MethodBody;
use crate::image::{MemberRefRow, ModuleImage, TableKind, Token};
use crate::keys::{FieldKey, MethodId, MethodKey};
use crate::runtime::{read_lock, write_lock};

pub struct LoadedModule {
    name: String,
    uuid: Uuid,
    image: RwLock<ModuleImage>,
    slots: Vec<Arc<MethodSlot>>,
    entry_cache: RwLock<HashMap<(String, LifecycleKind), Arc<EntryCell>>>,
    dynamic: RwLock<Vec<Arc<DynamicMethod>>>,
}

/// Active body override for one method; `None` means the original body.
pub struct MethodSlot {
    active: RwLock<Option<Arc<MethodBody>>>,
}

/// Where a cached lifecycle entry currently leads.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryTarget {
    /// Invoke the method slot (original behavior).
    Method(Token),
    /// Forward to `dispatcher.invoke(receiver, id, null)`.
    Dispatch(MethodId),
}

pub struct EntryCell {
    original: EntryTarget,
    current: RwLock<EntryTarget>,
}

/// Live body replacement on an existing method. Dropping restores the
/// original body.
pub struct DetourHandle {
    slot: Arc<MethodSlot>,
}

impl Drop for DetourHandle {
    fn drop(&mut self) {
        *write_lock(&self.slot.active) = None;
    }
}

/// Live redirection of a cached lifecycle entry. Dropping restores the
/// original target.
pub struct TrampolineHandle {
    cell: Arc<EntryCell>,
}

impl Drop for TrampolineHandle {
    fn drop(&mut self) {
        *write_lock(&self.cell.current) = self.cell.original.clone();
    }
}

/// A freshly-minted method outside the module's metadata tables, holding a
/// rewritten body for dispatcher registration.
#[derive(Debug)]
pub struct DynamicMethod {
    pub name: String,
    /// True when the source method was an instance method: parameter 0 is
    /// the receiver slot and declared parameters follow.
    pub has_this: bool,
    pub params: Vec<String>,
    pub ret: String,
    pub body: MethodBody,
}

impl LoadedModule {
    /// Load an image, creating a body slot per method and snapshotting the
    /// lifecycle entry points the way the host scheduler does at type-load
    /// time.
    pub fn load(image: ModuleImage) -> Arc<LoadedModule> {
        let slots = (0..image.methods.len())
            .map(|_| Arc::new(MethodSlot { active: RwLock::new(None) }))
            .collect();

        let mut entry_cache = HashMap::new();
        for type_token in image.type_tokens() {
            let Some(ty) = image.type_def(type_token) else {
                continue;
            };
            for &method_token in &ty.methods {
                let Some(m) = image.method_def(method_token) else {
                    continue;
                };
                if is_lifecycle_method(&m.name, m.params.len(), &m.ret, m.is_static)
                    && let Some(kind) = LifecycleKind::from_method_name(&m.name)
                {
                    entry_cache.insert(
                        (ty.full_name.clone(), kind),
                        Arc::new(EntryCell {
                            original: EntryTarget::Method(method_token),
                            current: RwLock::new(EntryTarget::Method(method_token)),
                        }),
                    );
                }
            }
        }

        Arc::new(LoadedModule {
            name: image.name.clone(),
            uuid: image.mvid,
            image: RwLock::new(image),
            slots,
            entry_cache: RwLock::new(entry_cache),
            dynamic: RwLock::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Run a closure over the image. Readers never hold the guard across
    /// calls back into the module.
    pub fn with_image<R>(&self, f: impl FnOnce(&ModuleImage) -> R) -> R {
        f(&read_lock(&self.image))
    }

    /// The body a caller should execute for a method: the detoured body if
    /// one is installed, otherwise the original.
    pub fn active_body(&self, method: Token) -> Option<Arc<MethodBody>> {
        let slot = self.slots.get(method.index())?;
        if let Some(body) = read_lock(&slot.active).clone() {
            return Some(body);
        }
        read_lock(&self.image)
            .method_def(method)
            .and_then(|m| m.body.clone())
            .map(Arc::new)
    }

    // --- Lookups keyed by canonical names ---

    /// Every declared method, constructor, and type initializer, keyed by
    /// method key. Declared-only visibility across all access levels.
    pub fn methods_by_key(&self) -> HashMap<MethodKey, Token> {
        let image = read_lock(&self.image);
        let mut map = HashMap::new();
        for token in image.method_tokens() {
            if let Some(key) = image.method_key_of(token) {
                map.insert(key, token);
            }
        }
        map
    }

    pub fn fields_by_key(&self) -> HashMap<FieldKey, Token> {
        let image = read_lock(&self.image);
        let mut map = HashMap::new();
        for token in image.field_tokens() {
            if let Some(key) = image.field_key_of(token) {
                map.insert(key, token);
            }
        }
        map
    }

    pub fn find_type(&self, full_name: &str) -> Option<Token> {
        read_lock(&self.image).find_type(full_name)
    }

    /// Declared instance fields of a type, as (name, type) pairs. Used when
    /// the host instantiates components.
    pub fn declared_fields(&self, full_name: &str) -> Vec<(String, String)> {
        let image = read_lock(&self.image);
        let Some(ty) = image.find_type(full_name).and_then(|t| image.type_def(t)) else {
            return Vec::new();
        };
        ty.fields
            .iter()
            .filter_map(|t| image.field_def(*t))
            .filter(|f| !f.is_static)
            .map(|f| (f.name.clone(), f.field_type.clone()))
            .collect()
    }

    // --- Imports (rewriter support) ---

    pub fn import_type(&self, full_name: &str) -> Token {
        write_lock(&self.image).import_type_ref(full_name)
    }

    pub fn import_member(&self, row: MemberRefRow) -> Token {
        write_lock(&self.image).import_member_ref(row)
    }

    // --- Hook installation primitives ---

    /// Replace a method's body. The returned handle keeps the detour alive.
    pub fn install_detour(&self, method: Token, body: MethodBody) -> Result<DetourHandle, String> {
        if !method.is(TableKind::MethodDef) {
            return Err(format!("cannot detour non-method token {method}"));
        }
        let slot = self
            .slots
            .get(method.index())
            .ok_or_else(|| format!("no method slot for token {method}"))?;
        *write_lock(&slot.active) = Some(Arc::new(body));
        Ok(DetourHandle { slot: Arc::clone(slot) })
    }

    /// Redirect a cached lifecycle entry to the dispatcher. Fails when the
    /// scheduler never cached an entry for `(type, kind)`; the installer
    /// then falls back to dispatcher-only registration plus proxies.
    pub fn install_trampoline(
        &self,
        type_name: &str,
        kind: LifecycleKind,
        id: MethodId,
    ) -> Result<TrampolineHandle, String> {
        let cache = read_lock(&self.entry_cache);
        let cell = cache
            .get(&(type_name.to_string(), kind))
            .ok_or_else(|| format!("no cached entry point for {type_name}::{}", kind.method_name()))?;
        *write_lock(&cell.current) = EntryTarget::Dispatch(id);
        Ok(TrampolineHandle { cell: Arc::clone(cell) })
    }

    /// Current target of a cached entry, as the scheduler consults it.
    pub fn entry_target(&self, type_name: &str, kind: LifecycleKind) -> Option<EntryTarget> {
        let cache = read_lock(&self.entry_cache);
        let cell = cache.get(&(type_name.to_string(), kind))?;
        Some(read_lock(&cell.current).clone())
    }

    /// Allocate a dynamic method holding a rewritten body.
    pub fn allocate_dynamic_method(&self, method: DynamicMethod) -> Arc<DynamicMethod> {
        let arc = Arc::new(method);
        write_lock(&self.dynamic).push(Arc::clone(&arc));
        arc
    }
}
