//! Installer: takes rewritten bodies and puts them where the runtime will
//! execute them.
//!
//! Three installation kinds per patchable method:
//!  - detour: an existing ordinary method gets its body replaced;
//!  - trampoline: a lifecycle entry point is redirected into the dispatcher,
//!    both at the scheduler's cached entry and at the method body itself
//!    (the host caches lifecycle addresses at type-load time, so replacing
//!    the body alone would not reach a host that walks its own list);
//!  - dispatcher-only: methods with no runtime slot become dynamic methods
//!    registered under their method id; newly-added lifecycle methods also
//!    register with the entry-point manager for proxy attachment.
//!
//! Every handle is retained in the per-assembly hook tables until an
//! explicit reset. Handles are RAII: letting one drop restores the original
//! code, which is exactly how patches silently vanish when ownership is
//! sloppy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diagnostics::summarize_errors;
use crate::dispatch::{Dispatcher, Invoker};
use crate::entrypoints::{EntryPointManager, LifecycleKind, is_lifecycle_method};
use crate::host::HostServices;
use crate::image::instr::{Instruction, MethodBody, Op, Operand};
use crate::image::{ModuleImage, Token};
use crate::inspect::{PatchPlan, TokenPair, body_supported};
use crate::keys::{MethodId, MethodKey};
use crate::rewrite::Rewriter;
use crate::runtime::loaded::{DetourHandle, DynamicMethod, LoadedModule, TrampolineHandle};
use crate::runtime::{intrinsics, lock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchKind {
    Detoured,
    Trampolined,
    Dispatched,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodPatch {
    pub key: String,
    pub kind: PatchKind,
    pub note: Option<String>,
}

/// Outcome of one apply over one assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchApplyResult {
    pub assembly: String,
    pub runtime_module_uuid: Uuid,
    pub patched: usize,
    pub dispatched: usize,
    pub trampolines: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub token_pairs: Vec<TokenPair>,
    pub method_patches: Vec<MethodPatch>,
}

impl PatchApplyResult {
    pub fn installed_any(&self) -> bool {
        self.patched + self.dispatched + self.trampolines > 0
    }

    pub fn summary(&self, max_error_lines: usize) -> String {
        let mut s = format!(
            "{}: {} patched, {} dispatched, {} trampolines, {} skipped",
            self.assembly, self.patched, self.dispatched, self.trampolines, self.skipped
        );
        if !self.errors.is_empty() {
            s.push('\n');
            s.push_str(&summarize_errors(&self.errors, max_error_lines));
        }
        s
    }
}

/// A lifecycle trampoline is two hooks with one lifetime: the entry-cache
/// redirect for the scheduler and the stub-body detour for direct callers.
struct TrampolineHook {
    _entry: TrampolineHandle,
    _stub: DetourHandle,
}

#[derive(Default)]
struct HookTables {
    method_hooks: HashMap<MethodKey, DetourHandle>,
    trampoline_hooks: HashMap<MethodKey, TrampolineHook>,
}

/// Per-assembly installer. Owns every live hook for its module.
pub struct AssemblyPatcher {
    assembly: String,
    module: Arc<LoadedModule>,
    host: Arc<dyn HostServices>,
    dispatcher: Arc<Dispatcher>,
    entry_points: Arc<EntryPointManager>,
    hooks: Mutex<HookTables>,
}

impl AssemblyPatcher {
    pub fn new(
        module: Arc<LoadedModule>,
        host: Arc<dyn HostServices>,
        dispatcher: Arc<Dispatcher>,
        entry_points: Arc<EntryPointManager>,
    ) -> Self {
        Self {
            assembly: module.name().to_string(),
            module,
            host,
            dispatcher,
            entry_points,
            hooks: Mutex::new(HookTables::default()),
        }
    }

    pub fn module(&self) -> &Arc<LoadedModule> {
        &self.module
    }

    /// Install the plan's patchable methods. Partial-success tolerant: any
    /// per-method failure is recorded and the apply continues.
    pub fn apply(&self, new_image: &ModuleImage, plan: &PatchPlan) -> PatchApplyResult {
        let mut result = PatchApplyResult {
            assembly: self.assembly.clone(),
            runtime_module_uuid: self.module.uuid(),
            patched: 0,
            dispatched: 0,
            trampolines: 0,
            skipped: 0,
            errors: Vec::new(),
            token_pairs: plan.token_pairs.clone(),
            method_patches: Vec::new(),
        };

        let rewriter = Rewriter::new(new_image, plan, &self.module);
        let mut hooks = lock(&self.hooks);

        for &token in &plan.patchable {
            let Some(key) = new_image.method_key_of(token) else {
                continue;
            };
            if let Err(reason) = body_supported(new_image, token, &plan.runtime_fields) {
                self.skip(&mut result, &key, reason);
                continue;
            }
            let body = match rewriter.rewrite_body(token) {
                Ok(body) => body,
                Err(reason) => {
                    self.skip(&mut result, &key, reason);
                    continue;
                }
            };

            let Some(def) = new_image.method_def(token) else {
                continue;
            };
            let lifecycle =
                is_lifecycle_method(&def.name, def.params.len(), &def.ret, def.is_static);
            let runtime_slot = plan.resolve_runtime_method(token, &key);

            if lifecycle {
                let Some(kind) = LifecycleKind::from_method_name(&def.name) else {
                    continue;
                };
                let id = key.id();
                let owner = owner_name(new_image, def);
                self.register_invoker(new_image, token, &body, id);

                if runtime_slot.is_some() {
                    match self.install_trampoline(&mut hooks, &key, &owner, kind, id) {
                        Ok(()) => {
                            result.trampolines += 1;
                            result.method_patches.push(MethodPatch {
                                key: key.as_str().to_string(),
                                kind: PatchKind::Trampolined,
                                note: None,
                            });
                        }
                        Err(reason) => self.skip(&mut result, &key, reason),
                    }
                } else {
                    // No runtime slot at all: proxies carry the scheduler to
                    // the dispatcher for this type from now on.
                    self.entry_points.register(&owner, kind, id);
                    result.dispatched += 1;
                    result.method_patches.push(MethodPatch {
                        key: key.as_str().to_string(),
                        kind: PatchKind::Dispatched,
                        note: Some("lifecycle entry registered for proxy attachment".to_string()),
                    });
                }
                continue;
            }

            match runtime_slot {
                Some(slot) => {
                    // Release the previous detour for the key before
                    // installing the replacement.
                    hooks.method_hooks.remove(&key);
                    match self.module.install_detour(slot, body) {
                        Ok(handle) => {
                            hooks.method_hooks.insert(key.clone(), handle);
                            result.patched += 1;
                            result.method_patches.push(MethodPatch {
                                key: key.as_str().to_string(),
                                kind: PatchKind::Detoured,
                                note: None,
                            });
                        }
                        Err(reason) => self.skip(&mut result, &key, reason),
                    }
                }
                None => {
                    let id = key.id();
                    self.register_invoker(new_image, token, &body, id);
                    result.dispatched += 1;
                    result.method_patches.push(MethodPatch {
                        key: key.as_str().to_string(),
                        kind: PatchKind::Dispatched,
                        note: None,
                    });
                }
            }
        }

        log::info!(target: "respatch::installer", "{}", result.summary(5));
        result
    }

    fn skip(&self, result: &mut PatchApplyResult, key: &MethodKey, reason: String) {
        log::warn!(target: "respatch::installer", "skipping {key}: {reason}");
        result.skipped += 1;
        result.errors.push(format!("{key}: {reason}"));
        result.method_patches.push(MethodPatch {
            key: key.as_str().to_string(),
            kind: PatchKind::Skipped,
            note: Some(reason),
        });
    }

    /// Wrap a rewritten body as a dynamic method and register its invoker.
    fn register_invoker(&self, new_image: &ModuleImage, token: Token, body: &MethodBody, id: MethodId) {
        let Some(def) = new_image.method_def(token) else {
            return;
        };
        let dynamic = self.module.allocate_dynamic_method(DynamicMethod {
            name: def.name.clone(),
            has_this: !def.is_static,
            params: def.params.clone(),
            ret: def.ret.clone(),
            body: body.clone(),
        });
        let invoker: Invoker = self.host.make_invoker(&self.module, dynamic);
        self.dispatcher.register(id, invoker);
    }

    fn install_trampoline(
        &self,
        hooks: &mut HookTables,
        key: &MethodKey,
        type_name: &str,
        kind: LifecycleKind,
        id: MethodId,
    ) -> Result<(), String> {
        hooks.trampoline_hooks.remove(key);

        let entry = self.module.install_trampoline(type_name, kind, id)?;
        let runtime_token = self
            .module
            .methods_by_key()
            .get(key)
            .copied()
            .ok_or_else(|| format!("lifecycle method {key} lost its runtime slot"))?;
        let stub = self.module.install_detour(runtime_token, self.stub_body(id))?;

        hooks
            .trampoline_hooks
            .insert(key.clone(), TrampolineHook { _entry: entry, _stub: stub });
        Ok(())
    }

    /// Stub body: `dispatcher.invoke(this, id, null)`, result discarded.
    fn stub_body(&self, id: MethodId) -> MethodBody {
        let invoke = self.module.import_member(intrinsics::dispatch_invoke_ref());
        let mut body = MethodBody::new();
        body.instructions.push(Instruction::new(Op::LdArg, Operand::Arg(0)));
        body.instructions.push(Instruction::new(Op::LdcI4, Operand::I32(id.0 as i32)));
        body.instructions.push(Instruction::simple(Op::LdNull));
        body.instructions.push(Instruction::new(Op::Call, Operand::Method(invoke)));
        body.instructions.push(Instruction::simple(Op::Pop));
        body.instructions.push(Instruction::simple(Op::Ret));
        body.max_stack = 3;
        body
    }

    /// Number of live (detour, trampoline) hooks.
    pub fn hook_counts(&self) -> (usize, usize) {
        let hooks = lock(&self.hooks);
        (hooks.method_hooks.len(), hooks.trampoline_hooks.len())
    }

    /// Sorted keys of live hooks, for structural comparison in tests and
    /// status output.
    pub fn hooked_keys(&self) -> (Vec<String>, Vec<String>) {
        let hooks = lock(&self.hooks);
        let mut methods: Vec<String> =
            hooks.method_hooks.keys().map(|k| k.as_str().to_string()).collect();
        let mut trampolines: Vec<String> =
            hooks.trampoline_hooks.keys().map(|k| k.as_str().to_string()).collect();
        methods.sort();
        trampolines.sort();
        (methods, trampolines)
    }

    /// Release every hook, restoring original bodies and entries. Called on
    /// playmode exit.
    pub fn reset(&self) {
        let mut hooks = lock(&self.hooks);
        hooks.method_hooks.clear();
        hooks.trampoline_hooks.clear();
        log::debug!(target: "respatch::installer", "{}: hooks released", self.assembly);
    }
}

fn owner_name(image: &ModuleImage, def: &crate::image::MethodDef) -> String {
    image
        .type_def(def.owner)
        .map(|t| t.full_name.clone())
        .unwrap_or_default()
}
