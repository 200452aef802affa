//! Host boundary.
//!
//! The engine consumes the host through `HostServices`: finding loaded
//! assemblies, enumerating live components, attaching lifecycle proxies,
//! and wrapping dynamic methods as invokers. `SimHost` is the in-tree host
//! the integration suite and the demo CLI drive: a scene of objects with
//! components, a single-threaded scheduler that invokes lifecycle entry
//! points from its type-load snapshot, and the interpreter for image
//! bodies.

pub mod interp;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::dispatch::{Dispatcher, Invoker};
use crate::entrypoints::{EntryPointManager, LifecycleKind};
use crate::field_store::FieldStore;
use crate::image::{FieldRefView, ModuleImage};
use crate::keys::MethodId;
use crate::runtime::loaded::{DynamicMethod, EntryTarget, LoadedModule};
use crate::runtime::value::{Instance, ObjRef, Value, zero_value};
use crate::runtime::{lock, read_lock, write_lock};

/// What the patch engine needs from the host application.
pub trait HostServices: Send + Sync {
    fn find_loaded_assembly(&self, name: &str) -> Option<Arc<LoadedModule>>;

    /// Which assembly a source file compiles into.
    fn assembly_for_source(&self, path: &Path) -> Option<String>;

    /// Wrap a dynamic method as an invoker closure
    /// `(instance, argv) → result` that coerces each argv slot to the
    /// declared parameter type and boxes the return.
    fn make_invoker(&self, module: &Arc<LoadedModule>, method: Arc<DynamicMethod>) -> Invoker;

    fn enumerate_live_components(&self, type_name: &str) -> Vec<ObjRef>;

    /// Attach a lifecycle-forwarding proxy. Idempotent per target; returns
    /// true when the proxy set actually changed.
    fn attach_proxy(&self, target: &ObjRef, hooks: &HashMap<LifecycleKind, MethodId>) -> bool;
}

/// Shared engine/runtime state: one set per host process.
pub struct RuntimeCtx {
    pub dispatcher: Arc<Dispatcher>,
    pub field_store: Arc<FieldStore>,
    pub entry_points: Arc<EntryPointManager>,
}

impl RuntimeCtx {
    pub fn new() -> Arc<RuntimeCtx> {
        Arc::new(RuntimeCtx {
            dispatcher: Arc::new(Dispatcher::new()),
            field_store: Arc::new(FieldStore::new()),
            entry_points: Arc::new(EntryPointManager::new()),
        })
    }
}

struct ComponentSlot {
    instance: ObjRef,
    module: Arc<LoadedModule>,
    /// Proxy hooks attached by the entry-point scanner.
    proxy: HashMap<LifecycleKind, MethodId>,
}

/// The reference host: owns loaded assemblies, the scene, and the output
/// sink the `print` intrinsic writes to.
pub struct SimHost {
    me: Weak<SimHost>,
    ctx: Arc<RuntimeCtx>,
    assemblies: RwLock<HashMap<String, Arc<LoadedModule>>>,
    components: Mutex<Vec<ComponentSlot>>,
    statics: Mutex<HashMap<(String, String), Value>>,
    output: Mutex<Vec<String>>,
}

impl SimHost {
    pub fn new(ctx: Arc<RuntimeCtx>) -> Arc<SimHost> {
        Arc::new_cyclic(|me| SimHost {
            me: me.clone(),
            ctx,
            assemblies: RwLock::new(HashMap::new()),
            components: Mutex::new(Vec::new()),
            statics: Mutex::new(HashMap::new()),
            output: Mutex::new(Vec::new()),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.ctx.dispatcher
    }

    pub fn field_store(&self) -> &Arc<FieldStore> {
        &self.ctx.field_store
    }

    pub fn entry_points(&self) -> &Arc<EntryPointManager> {
        &self.ctx.entry_points
    }

    /// Load an image as a runtime module, snapshotting lifecycle entries.
    pub fn load_assembly(&self, image: ModuleImage) -> Arc<LoadedModule> {
        let module = LoadedModule::load(image);
        write_lock(&self.assemblies).insert(module.name().to_string(), Arc::clone(&module));
        module
    }

    /// Instantiate a component of `type_name` and add it to the scene. The
    /// `OnInit` entry runs immediately when the type declares one.
    pub fn spawn(&self, assembly: &str, type_name: &str) -> Result<ObjRef, String> {
        let module = self
            .find_loaded_assembly(assembly)
            .ok_or_else(|| format!("assembly '{assembly}' is not loaded"))?;
        if module.find_type(type_name).is_none() {
            return Err(format!("type '{type_name}' not found in '{assembly}'"));
        }
        let instance = Instance::new(type_name, &module.declared_fields(type_name));
        lock(&self.components).push(ComponentSlot {
            instance: instance.clone(),
            module: Arc::clone(&module),
            proxy: HashMap::new(),
        });
        self.run_entry(&module, &instance, LifecycleKind::Init);
        Ok(instance)
    }

    /// Remove a component from the scene, dropping the host's reference.
    pub fn despawn(&self, target: &ObjRef) {
        lock(&self.components).retain(|c| !Arc::ptr_eq(&c.instance, target));
    }

    /// One scheduler tick: every component's `OnTick`, from the type-load
    /// snapshot or an attached proxy.
    pub fn tick(&self) {
        self.run_lifecycle(LifecycleKind::Tick);
    }

    pub fn run_lifecycle(&self, kind: LifecycleKind) {
        let components: Vec<(ObjRef, Arc<LoadedModule>, Option<MethodId>)> = lock(&self.components)
            .iter()
            .map(|c| (c.instance.clone(), Arc::clone(&c.module), c.proxy.get(&kind).copied()))
            .collect();

        for (instance, module, proxy_id) in components {
            match module.entry_target(&instance.type_name, kind) {
                Some(EntryTarget::Method(token)) => {
                    if let Err(err) = interp::call_method(
                        self,
                        &module,
                        token,
                        Some(Value::Obj(instance.clone())),
                        &[],
                    ) {
                        log::error!(target: "respatch::general", "{}::{} failed: {err}", instance.type_name, kind.method_name());
                    }
                }
                Some(EntryTarget::Dispatch(id)) => {
                    self.ctx.dispatcher.invoke(Some(Value::Obj(instance.clone())), id, None);
                }
                None => {
                    if let Some(id) = proxy_id {
                        self.ctx.dispatcher.invoke(Some(Value::Obj(instance.clone())), id, None);
                    }
                }
            }
        }
    }

    fn run_entry(&self, module: &Arc<LoadedModule>, instance: &ObjRef, kind: LifecycleKind) {
        if let Some(EntryTarget::Method(token)) = module.entry_target(&instance.type_name, kind) {
            if let Err(err) =
                interp::call_method(self, module, token, Some(Value::Obj(instance.clone())), &[])
            {
                log::error!(target: "respatch::general", "{}::{} failed: {err}", instance.type_name, kind.method_name());
            }
        } else if let Some(EntryTarget::Dispatch(id)) =
            module.entry_target(&instance.type_name, kind)
        {
            self.ctx.dispatcher.invoke(Some(Value::Obj(instance.clone())), id, None);
        }
    }

    /// Call a declared method directly, the way gameplay code would.
    pub fn call(
        &self,
        assembly: &str,
        type_name: &str,
        method_name: &str,
        this: Option<ObjRef>,
        args: &[Value],
    ) -> Result<Value, String> {
        let module = self
            .find_loaded_assembly(assembly)
            .ok_or_else(|| format!("assembly '{assembly}' is not loaded"))?;
        let token = module
            .with_image(|i| {
                i.method_tokens().find(|t| {
                    i.method_def(*t).is_some_and(|m| {
                        m.name == method_name
                            && i.type_def(m.owner).is_some_and(|ty| ty.full_name == type_name)
                    })
                })
            })
            .ok_or_else(|| format!("method '{type_name}::{method_name}' not found"))?;
        interp::call_method(self, &module, token, this.map(Value::Obj), args)
            .map_err(|e| e.to_string())
    }

    // --- Output sink (the print intrinsic) ---

    pub fn print(&self, value: &Value) {
        lock(&self.output).push(value.to_string());
    }

    pub fn output(&self) -> Vec<String> {
        lock(&self.output).clone()
    }

    pub fn take_output(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.output))
    }

    // --- Static field storage for declared statics ---

    pub(crate) fn static_field(&self, view: &FieldRefView) -> Value {
        lock(&self.statics)
            .entry((view.owner.clone(), view.name.clone()))
            .or_insert_with(|| zero_value(&view.field_type))
            .clone()
    }

    pub(crate) fn set_static_field(&self, view: &FieldRefView, value: Value) {
        lock(&self.statics).insert((view.owner.clone(), view.name.clone()), value);
    }

    /// Playmode exit: scene, statics, and shared engine tables reset.
    pub fn teardown(&self) {
        lock(&self.components).clear();
        lock(&self.statics).clear();
        self.ctx.dispatcher.clear();
        self.ctx.field_store.clear();
        self.ctx.entry_points.clear();
    }
}

impl HostServices for SimHost {
    fn find_loaded_assembly(&self, name: &str) -> Option<Arc<LoadedModule>> {
        read_lock(&self.assemblies).get(name).cloned()
    }

    fn assembly_for_source(&self, _path: &Path) -> Option<String> {
        // Single script assembly per project, like the host's compilation
        // pipeline: every watched source lands in the same module.
        let assemblies = read_lock(&self.assemblies);
        if assemblies.len() == 1 {
            assemblies.keys().next().cloned()
        } else {
            None
        }
    }

    fn make_invoker(&self, module: &Arc<LoadedModule>, method: Arc<DynamicMethod>) -> Invoker {
        let weak = self.me.clone();
        let module = Arc::clone(module);
        Arc::new(move |instance, argv| {
            let host = weak.upgrade().ok_or_else(|| "host torn down".to_string())?;

            let mut frame = Vec::with_capacity(method.params.len() + 1);
            if method.has_this {
                frame.push(instance.unwrap_or(Value::Null));
            }
            for (i, param_ty) in method.params.iter().enumerate() {
                let v = argv.get(i).cloned().unwrap_or_else(|| zero_value(param_ty));
                frame.push(coerce_arg(v, param_ty)?);
            }

            interp::call_dynamic(&host, &module, &method.body, frame).map_err(|e| e.to_string())
        })
    }

    fn enumerate_live_components(&self, type_name: &str) -> Vec<ObjRef> {
        lock(&self.components)
            .iter()
            .filter(|c| c.instance.type_name == type_name)
            .map(|c| c.instance.clone())
            .collect()
    }

    fn attach_proxy(&self, target: &ObjRef, hooks: &HashMap<LifecycleKind, MethodId>) -> bool {
        let mut components = lock(&self.components);
        let Some(slot) = components.iter_mut().find(|c| Arc::ptr_eq(&c.instance, target)) else {
            return false;
        };
        let mut changed = false;
        for (kind, id) in hooks {
            if slot.proxy.get(kind) != Some(id) {
                slot.proxy.insert(*kind, *id);
                changed = true;
            }
        }
        changed
    }
}

/// Unbox an argv slot to a declared parameter type. Null relaxes to the
/// type's zero value; anything else must already match.
fn coerce_arg(value: Value, param_ty: &str) -> Result<Value, String> {
    if value.is_null() {
        return Ok(zero_value(param_ty));
    }
    if param_ty == "object" || value.type_name() == param_ty {
        return Ok(value);
    }
    Err(format!("cannot convert {} to {param_ty}", value.type_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use crate::lower::{LowerOptions, lower_unit};
    use crate::parser::Parser;

    fn compile(src: &str) -> ModuleImage {
        let tokens = lex(src).unwrap();
        let unit = Parser::new(&tokens, src).parse_unit().unwrap();
        lower_unit(&unit, "Scripts", &LowerOptions { optimize: false }).unwrap()
    }

    fn host_with(src: &str) -> Arc<SimHost> {
        let host = SimHost::new(RuntimeCtx::new());
        host.load_assembly(compile(src));
        host
    }

    #[test]
    fn tick_runs_lifecycle_method() {
        let host = host_with("class C { void OnTick() { print(\"t\"); } }");
        host.spawn("Scripts", "C").unwrap();
        host.tick();
        host.tick();
        assert_eq!(host.take_output(), vec!["t", "t"]);
    }

    #[test]
    fn init_runs_on_spawn() {
        let host = host_with("class C { void OnInit() { print(\"hello\"); } }");
        host.spawn("Scripts", "C").unwrap();
        assert_eq!(host.take_output(), vec!["hello"]);
    }

    #[test]
    fn direct_call_and_fields() {
        let host = host_with(
            "class C { int counter; void Bump() { counter++; print(counter); } }",
        );
        let obj = host.spawn("Scripts", "C").unwrap();
        host.call("Scripts", "C", "Bump", Some(obj.clone()), &[]).unwrap();
        host.call("Scripts", "C", "Bump", Some(obj), &[]).unwrap();
        assert_eq!(host.take_output(), vec!["1", "2"]);
    }

    #[test]
    fn static_fields_shared_across_instances() {
        let host = host_with(
            "class C { static int total; void Bump() { total++; print(total); } }",
        );
        let a = host.spawn("Scripts", "C").unwrap();
        let b = host.spawn("Scripts", "C").unwrap();
        host.call("Scripts", "C", "Bump", Some(a), &[]).unwrap();
        host.call("Scripts", "C", "Bump", Some(b), &[]).unwrap();
        assert_eq!(host.take_output(), vec!["1", "2"]);
    }

    #[test]
    fn arithmetic_and_control_flow() {
        let host = host_with(
            "class C { int Fib(int n) { if (n < 2) { return n; } return Fib(n - 1) + Fib(n - 2); } }",
        );
        let obj = host.spawn("Scripts", "C").unwrap();
        let v = host
            .call("Scripts", "C", "Fib", Some(obj), &[Value::Int(10)])
            .unwrap();
        assert!(matches!(v, Value::Int(55)));
    }

    #[test]
    fn while_loop_executes() {
        let host = host_with(
            "class C { void Count() { int i = 0; while (i < 3) { i++; print(i); } } }",
        );
        let obj = host.spawn("Scripts", "C").unwrap();
        host.call("Scripts", "C", "Count", Some(obj), &[]).unwrap();
        assert_eq!(host.take_output(), vec!["1", "2", "3"]);
    }

    #[test]
    fn try_catch_catches_division() {
        let host = host_with(
            "class C { void T(int d) { try { int x = 10 / d; print(x); } catch { print(\"caught\"); } } }",
        );
        let obj = host.spawn("Scripts", "C").unwrap();
        host.call("Scripts", "C", "T", Some(obj.clone()), &[Value::Int(2)]).unwrap();
        host.call("Scripts", "C", "T", Some(obj), &[Value::Int(0)]).unwrap();
        assert_eq!(host.take_output(), vec!["5", "caught"]);
    }

    #[test]
    fn new_creates_instances() {
        let host = host_with(
            "class C { void T() { C other = new C(); print(other == null); } }",
        );
        let obj = host.spawn("Scripts", "C").unwrap();
        host.call("Scripts", "C", "T", Some(obj), &[]).unwrap();
        assert_eq!(host.take_output(), vec!["false"]);
    }

    #[test]
    fn despawn_removes_from_scheduler() {
        let host = host_with("class C { void OnTick() { print(\"t\"); } }");
        let obj = host.spawn("Scripts", "C").unwrap();
        host.tick();
        host.despawn(&obj);
        drop(obj);
        host.tick();
        assert_eq!(host.take_output(), vec!["t"]);
    }

    #[test]
    fn enumerate_and_proxy() {
        let host = host_with("class C { }");
        let obj = host.spawn("Scripts", "C").unwrap();
        assert_eq!(host.enumerate_live_components("C").len(), 1);

        let mut hooks = HashMap::new();
        hooks.insert(LifecycleKind::Tick, MethodId(5));
        assert!(host.attach_proxy(&obj, &hooks));
        // Second attachment is a no-op.
        assert!(!host.attach_proxy(&obj, &hooks));
    }

    #[test]
    fn logical_operators_short_circuit() {
        let host = host_with(
            "class C { bool Hit() { print(\"hit\"); return true; } void T() { if (false && Hit()) { } if (true || Hit()) { print(\"ok\"); } } }",
        );
        let obj = host.spawn("Scripts", "C").unwrap();
        host.call("Scripts", "C", "T", Some(obj), &[]).unwrap();
        assert_eq!(host.take_output(), vec!["ok"]);
    }
}
