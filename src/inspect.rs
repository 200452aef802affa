//! Module inspector: turns a freshly compiled image plus the loaded runtime
//! module into a patch plan, or rejects the pair as structurally
//! incompatible.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::entrypoints::is_lifecycle_method;
use crate::image::instr::{Op, Operand};
use crate::image::{ModuleImage, Token};
use crate::keys::{FieldKey, MethodId, MethodKey};
use crate::runtime::loaded::LoadedModule;

/// `(patch module token, runtime token)` association recorded as methods are
/// matched. Persisted with the patch so a replay can rebind even if a
/// method's textual key no longer matches the runtime slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub patch_token: u32,
    pub runtime_token: u32,
    pub method_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct PatchPlan {
    /// Every declared runtime method, keyed by canonical method key.
    pub runtime_methods: HashMap<MethodKey, Token>,
    pub runtime_fields: HashMap<FieldKey, Token>,
    /// Stable id per patchable method in the new image.
    pub method_ids: HashMap<MethodKey, MethodId>,
    /// Keys that must be invoked through the dispatcher.
    pub dispatch_keys: HashSet<MethodKey>,
    pub token_pairs: Vec<TokenPair>,
    /// Patchable method tokens of the new image.
    pub patchable: Vec<Token>,
    /// True when the structural compatibility check ran and passed.
    pub validated: bool,
}

#[derive(Debug)]
pub enum PlanOutcome {
    Plan(PatchPlan),
    Incompatible { reason: String },
}

/// Token resolution hints for replaying a persisted patch.
#[derive(Debug, Clone, Default)]
pub struct ReplayContext {
    pub token_pairs: Vec<TokenPair>,
    /// Whether the runtime module still has the UUID recorded at apply
    /// time. When false, only key-based resolution is used.
    pub uuid_matches: bool,
}

/// Build a patch plan. `fast_path` skips the structural compatibility check
/// unless the method-key sets disagree for a type, which demotes the apply
/// back to the slow path.
pub fn plan(
    new_image: &ModuleImage,
    runtime: &LoadedModule,
    fast_path: bool,
    replay: Option<&ReplayContext>,
) -> PlanOutcome {
    let runtime_methods = runtime.methods_by_key();
    let runtime_fields = runtime.fields_by_key();

    let mut validate = !fast_path;
    if fast_path && replay.is_none() && !fast_path_key_sets_match(new_image, &runtime_methods) {
        log::info!(
            target: "respatch::detector",
            "method-key set drifted on the fast path; demoting to full validation"
        );
        validate = true;
    }

    if validate && let Some(reason) = compatibility_error(new_image, runtime, &runtime_methods) {
        return PlanOutcome::Incompatible { reason };
    }

    let pair_map: HashMap<u32, u32> = match replay {
        Some(ctx) if ctx.uuid_matches => ctx
            .token_pairs
            .iter()
            .map(|p| (p.patch_token, p.runtime_token))
            .collect(),
        _ => HashMap::new(),
    };

    let mut plan = PatchPlan {
        runtime_methods,
        runtime_fields,
        validated: validate,
        ..PatchPlan::default()
    };

    for token in patchable_methods(new_image) {
        let Some(key) = new_image.method_key_of(token) else {
            continue;
        };
        let Some(method) = new_image.method_def(token) else {
            continue;
        };
        plan.method_ids.insert(key.clone(), key.id());
        plan.patchable.push(token);

        if is_lifecycle_method(&method.name, method.params.len(), &method.ret, method.is_static) {
            plan.dispatch_keys.insert(key.clone());
        }

        // Token pairs take precedence over keys when replaying against the
        // same runtime module build.
        let resolved = pair_map
            .get(&token.0)
            .map(|raw| Token(*raw))
            .filter(|t| runtime.with_image(|i| i.method_def(*t).is_some()))
            .or_else(|| plan.runtime_methods.get(&key).copied());

        match resolved {
            Some(runtime_token) => plan.token_pairs.push(TokenPair {
                patch_token: token.0,
                runtime_token: runtime_token.0,
                method_key: key.as_str().to_string(),
            }),
            None => {
                plan.dispatch_keys.insert(key);
            }
        }
    }

    PlanOutcome::Plan(plan)
}

impl PatchPlan {
    /// Runtime method slot for a patch-module token, using the recorded
    /// token pair when one exists and the key otherwise.
    pub fn resolve_runtime_method(&self, patch_token: Token, key: &MethodKey) -> Option<Token> {
        self.token_pairs
            .iter()
            .find(|p| p.patch_token == patch_token.0)
            .map(|p| Token(p.runtime_token))
            .or_else(|| self.runtime_methods.get(key).copied())
    }
}

/// Patchable: has a body, not abstract, not foreign-linked, not generic,
/// not inside a synthetic container.
pub fn patchable_methods(image: &ModuleImage) -> Vec<Token> {
    image
        .method_tokens()
        .filter(|t| {
            let Some(m) = image.method_def(*t) else {
                return false;
            };
            if m.body.is_none() || m.is_abstract || m.is_extern || m.generic_arity > 0 {
                return false;
            }
            match image.type_def(m.owner) {
                Some(owner) => !owner.is_synthetic() && owner.generic_arity == 0,
                None => false,
            }
        })
        .collect()
}

/// On the fast path the classifier claims bodies-only; verify the method-key
/// set per type actually matches the runtime before trusting it.
fn fast_path_key_sets_match(
    new_image: &ModuleImage,
    runtime_methods: &HashMap<MethodKey, Token>,
) -> bool {
    for ty in &new_image.types {
        if ty.is_synthetic() {
            continue;
        }
        let new_keys: HashSet<String> = ty
            .methods
            .iter()
            .filter_map(|t| new_image.method_key_of(*t))
            .map(|k| k.as_str().to_string())
            .collect();
        let runtime_keys: HashSet<String> = runtime_methods
            .keys()
            .filter(|k| k.owner() == ty.full_name)
            .map(|k| k.as_str().to_string())
            .collect();
        if new_keys != runtime_keys {
            return false;
        }
    }
    true
}

fn compatibility_error(
    new_image: &ModuleImage,
    runtime: &LoadedModule,
    runtime_methods: &HashMap<MethodKey, Token>,
) -> Option<String> {
    for ty in &new_image.types {
        if ty.is_synthetic() {
            continue;
        }
        if runtime.find_type(&ty.full_name).is_none() {
            return Some(format!("New type added: {}", ty.full_name));
        }

        let new_keys: HashSet<String> = ty
            .methods
            .iter()
            .filter_map(|t| new_image.method_key_of(*t))
            .map(|k| k.as_str().to_string())
            .collect();
        for key in runtime_methods.keys() {
            if key.owner() == ty.full_name && !new_keys.contains(key.as_str()) {
                return Some(format!("Method removed from {}: {}", ty.full_name, key));
            }
        }
        // A drifted field set is not fatal: missing fields are redirected to
        // the field store at rewrite time.
    }
    None
}

/// Operand support gate: a body is rejected when it carries an operand the
/// rewriter cannot move across modules, or takes the address of a field the
/// runtime does not have (the store holds values, not slots).
pub fn body_supported(
    image: &ModuleImage,
    method: Token,
    runtime_fields: &HashMap<FieldKey, Token>,
) -> Result<(), String> {
    let Some(def) = image.method_def(method) else {
        return Err("not a method definition".to_string());
    };
    let Some(body) = &def.body else {
        return Err("method has no body".to_string());
    };

    for instr in &body.instructions {
        if let Operand::Opaque(_) = instr.operand {
            return Err(format!("unsupported operand on {:?}", instr.op));
        }
        if matches!(instr.op, Op::Calli) {
            return Err("indirect calls are not supported".to_string());
        }
        if matches!(instr.op, Op::LdFlda | Op::LdSFlda) {
            let Operand::Field(field) = instr.operand else {
                return Err("field-address instruction without field operand".to_string());
            };
            let Some(view) = image.field_view(field) else {
                return Err("unresolvable field operand".to_string());
            };
            if !runtime_fields.contains_key(&view.key()) {
                return Err(format!("field address of missing field {}", view.key()));
            }
        }
    }
    Ok(())
}
