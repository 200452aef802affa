//! IL rewriter: clones a method body out of the freshly compiled image into
//! the runtime module, retargeting every reference on the way.
//!
//! Three rewrites happen during the clone:
//!  - calls whose target key is in the plan's dispatch set are lowered into
//!    `dispatcher.invoke(this_or_null, method_id, argv)`;
//!  - accesses to fields the runtime does not have are redirected to the
//!    field store accessors;
//!  - every other method/field/type reference is resolved against the
//!    runtime module where a slot exists and imported as a reference where
//!    one does not.
//!
//! The produced body serves both installation modes: swapped into an
//! existing method slot (parameters map 1:1) or wrapped as a dynamic method
//! whose parameter list starts with a receiver slot for instance sources;
//! the argument indices are identical either way, only the invoker changes.

use crate::image::instr::{
    ExceptionHandler, Instruction, LocalVar, MethodBody, Op, Operand, optimize_macros,
};
use crate::image::{ModuleImage, Token};
use crate::inspect::PatchPlan;
use crate::keys::MethodId;
use crate::lower::compute_max_stack;
use crate::runtime::intrinsics;
use crate::runtime::loaded::LoadedModule;
use crate::runtime::value::is_value_type;

const MIN_MAX_STACK: u16 = 8;

pub struct Rewriter<'a> {
    source: &'a ModuleImage,
    plan: &'a PatchPlan,
    target: &'a LoadedModule,
}

impl<'a> Rewriter<'a> {
    pub fn new(source: &'a ModuleImage, plan: &'a PatchPlan, target: &'a LoadedModule) -> Self {
        Self { source, plan, target }
    }

    /// Clone `method`'s body for installation in the runtime module.
    pub fn rewrite_body(&self, method: Token) -> Result<MethodBody, String> {
        let def = self
            .source
            .method_def(method)
            .ok_or_else(|| format!("token {method} is not a method definition"))?;
        let src = def
            .body
            .as_ref()
            .ok_or_else(|| format!("method {} has no body", def.name))?;

        let mut out = MethodBody {
            max_stack: src.max_stack.max(MIN_MAX_STACK),
            init_locals: true,
            locals: Vec::with_capacity(src.locals.len()),
            instructions: Vec::with_capacity(src.instructions.len()),
            handlers: Vec::new(),
        };
        for local in &src.locals {
            self.import_type_name(&local.ty);
            out.locals.push(LocalVar { ty: local.ty.clone() });
        }

        // First pass: translate instruction by instruction. Branch operands
        // keep their source indices and are remapped once the layout is
        // final.
        let mut map = Vec::with_capacity(src.instructions.len() + 1);
        for instr in &src.instructions {
            map.push(out.instructions.len() as u32);
            self.translate(instr, &mut out)?;
        }
        map.push(out.instructions.len() as u32);

        // Second pass: remap branch and switch targets.
        for instr in &mut out.instructions {
            match &mut instr.operand {
                Operand::Target(t) => *t = map[*t as usize],
                Operand::Switch(targets) => {
                    for t in targets {
                        *t = map[*t as usize];
                    }
                }
                _ => {}
            }
        }

        // Exception handlers travel through the same map.
        for h in &src.handlers {
            let catch_type = h
                .catch_type
                .and_then(|t| self.source.type_name_of(t).map(str::to_string))
                .map(|name| self.target.import_type(&name));
            out.handlers.push(ExceptionHandler {
                kind: h.kind,
                catch_type,
                try_start: map[h.try_start as usize],
                try_end: map[h.try_end as usize],
                handler_start: map[h.handler_start as usize],
                handler_end: map[h.handler_end as usize],
            });
        }

        let computed = self
            .target
            .with_image(|image| compute_max_stack(image, &out.instructions));
        out.max_stack = out.max_stack.max(computed);

        optimize_macros(&mut out);
        Ok(out)
    }

    fn translate(&self, instr: &Instruction, out: &mut MethodBody) -> Result<(), String> {
        if let Operand::Opaque(_) = instr.operand {
            return Err(format!("unsupported operand on {:?}", instr.op));
        }

        match instr.op {
            Op::LdFld | Op::StFld | Op::LdSFld | Op::StSFld | Op::LdFlda | Op::LdSFlda => {
                self.translate_field(instr, out)
            }
            Op::Call | Op::CallVirt => self.translate_call(instr, out),
            Op::NewObj => {
                let Operand::Method(token) = instr.operand else {
                    return Err("newobj without method operand".to_string());
                };
                let resolved = self.resolve_method(token)?;
                out.instructions.push(Instruction::new(Op::NewObj, Operand::Method(resolved)));
                Ok(())
            }
            Op::Box | Op::UnboxAny | Op::CastClass | Op::NewArr | Op::LdToken => {
                let Operand::Type(token) = instr.operand else {
                    return Err(format!("{:?} without type operand", instr.op));
                };
                let name = self
                    .source
                    .type_name_of(token)
                    .ok_or_else(|| format!("unresolvable type operand on {:?}", instr.op))?
                    .to_string();
                let imported = self.target.import_type(&name);
                out.instructions.push(Instruction::new(instr.op, Operand::Type(imported)));
                Ok(())
            }
            _ => {
                out.instructions.push(instr.clone());
                Ok(())
            }
        }
    }

    // --- Field access ---

    fn translate_field(&self, instr: &Instruction, out: &mut MethodBody) -> Result<(), String> {
        let Operand::Field(token) = instr.operand else {
            return Err(format!("{:?} without field operand", instr.op));
        };
        let view = self
            .source
            .field_view(token)
            .ok_or_else(|| format!("unresolvable field operand on {:?}", instr.op))?;
        let key = view.key();

        if let Some(runtime_token) = self.plan.runtime_fields.get(&key) {
            out.instructions
                .push(Instruction::new(instr.op, Operand::Field(*runtime_token)));
            return Ok(());
        }

        // The runtime has no slot for this field: route through the store.
        let ty_token = self.target.import_type(&view.field_type);
        let key_str = key.as_str().to_string();
        match instr.op {
            Op::LdFlda | Op::LdSFlda => {
                Err(format!("field address not supported for missing field {key}"))
            }
            Op::LdFld => {
                // stack: …, obj
                out.instructions.push(Instruction::new(Op::LdStr, Operand::Str(key_str)));
                out.instructions.push(Instruction::new(Op::LdToken, Operand::Type(ty_token)));
                let get = self.target.import_member(intrinsics::field_get_instance_ref());
                out.instructions.push(Instruction::new(Op::Call, Operand::Method(get)));
                self.emit_result_coercion(&view.field_type, ty_token, out);
                Ok(())
            }
            Op::StFld => {
                // stack: …, obj, value. Spill the value to get at the owner.
                let tmp = new_local(out, &view.field_type);
                out.instructions.push(Instruction::new(Op::StLoc, Operand::Local(tmp)));
                out.instructions.push(Instruction::new(Op::LdStr, Operand::Str(key_str)));
                out.instructions.push(Instruction::new(Op::LdLoc, Operand::Local(tmp)));
                if is_value_type(&view.field_type) {
                    out.instructions.push(Instruction::new(Op::Box, Operand::Type(ty_token)));
                }
                let set = self.target.import_member(intrinsics::field_set_instance_ref());
                out.instructions.push(Instruction::new(Op::Call, Operand::Method(set)));
                Ok(())
            }
            Op::LdSFld => {
                out.instructions.push(Instruction::new(Op::LdStr, Operand::Str(key_str)));
                out.instructions.push(Instruction::new(Op::LdToken, Operand::Type(ty_token)));
                let get = self.target.import_member(intrinsics::field_get_static_ref());
                out.instructions.push(Instruction::new(Op::Call, Operand::Method(get)));
                self.emit_result_coercion(&view.field_type, ty_token, out);
                Ok(())
            }
            Op::StSFld => {
                // stack: …, value
                let tmp = new_local(out, &view.field_type);
                out.instructions.push(Instruction::new(Op::StLoc, Operand::Local(tmp)));
                out.instructions.push(Instruction::new(Op::LdStr, Operand::Str(key_str)));
                out.instructions.push(Instruction::new(Op::LdLoc, Operand::Local(tmp)));
                if is_value_type(&view.field_type) {
                    out.instructions.push(Instruction::new(Op::Box, Operand::Type(ty_token)));
                }
                let set = self.target.import_member(intrinsics::field_set_static_ref());
                out.instructions.push(Instruction::new(Op::Call, Operand::Method(set)));
                Ok(())
            }
            _ => unreachable!("translate_field called for field ops only"),
        }
    }

    // --- Calls ---

    fn translate_call(&self, instr: &Instruction, out: &mut MethodBody) -> Result<(), String> {
        let Operand::Method(token) = instr.operand else {
            return Err(format!("{:?} without method operand", instr.op));
        };
        let view = self
            .source
            .method_view(token)
            .ok_or_else(|| format!("unresolvable method operand on {:?}", instr.op))?;
        let key = view.key();

        if self.plan.dispatch_keys.contains(&key)
            && let Some(id) = self.plan.method_ids.get(&key).copied()
            && self.dispatch_lowering_allowed(&view)
        {
            return self.lower_dispatch_call(&view, id, out);
        }

        let resolved = self.resolve_method(token)?;
        out.instructions.push(Instruction::new(instr.op, Operand::Method(resolved)));
        Ok(())
    }

    /// By-ref and pointer arguments cannot be boxed into the argv array, and
    /// boxing a value-type receiver would mutate a copy; those calls stay
    /// direct.
    fn dispatch_lowering_allowed(&self, view: &crate::image::MethodRefView) -> bool {
        if view.params.iter().any(|p| p.ends_with('&') || p.ends_with('*')) {
            return false;
        }
        if view.has_this
            && let Some(owner) = self.source.find_type(&view.owner)
            && let Some(def) = self.source.type_def(owner)
            && def.is_value_type()
        {
            return false;
        }
        true
    }

    /// Lower a call into `<Dispatch>::Invoke(this_or_null, id, argv)`.
    fn lower_dispatch_call(
        &self,
        view: &crate::image::MethodRefView,
        id: MethodId,
        out: &mut MethodBody,
    ) -> Result<(), String> {
        let argc = view.params.len();
        let object_token = self.target.import_type("object");

        // Spill arguments (top of stack is the last argument), boxing value
        // types on the way into object-typed locals.
        let mut arg_slots = vec![0u16; argc];
        for i in (0..argc).rev() {
            if is_value_type(&view.params[i]) {
                let ty = self.target.import_type(&view.params[i]);
                out.instructions.push(Instruction::new(Op::Box, Operand::Type(ty)));
            }
            let slot = new_local(out, "object");
            out.instructions.push(Instruction::new(Op::StLoc, Operand::Local(slot)));
            arg_slots[i] = slot;
        }

        let this_slot = if view.has_this {
            let slot = new_local(out, "object");
            out.instructions.push(Instruction::new(Op::StLoc, Operand::Local(slot)));
            Some(slot)
        } else {
            None
        };

        match this_slot {
            Some(slot) => out.instructions.push(Instruction::new(Op::LdLoc, Operand::Local(slot))),
            None => out.instructions.push(Instruction::simple(Op::LdNull)),
        }
        out.instructions.push(Instruction::new(Op::LdcI4, Operand::I32(id.0 as i32)));

        out.instructions.push(Instruction::new(Op::LdcI4, Operand::I32(argc as i32)));
        out.instructions.push(Instruction::new(Op::NewArr, Operand::Type(object_token)));
        for (i, slot) in arg_slots.iter().enumerate() {
            out.instructions.push(Instruction::simple(Op::Dup));
            out.instructions.push(Instruction::new(Op::LdcI4, Operand::I32(i as i32)));
            out.instructions.push(Instruction::new(Op::LdLoc, Operand::Local(*slot)));
            out.instructions.push(Instruction::simple(Op::StElemRef));
        }

        let invoke = self.target.import_member(intrinsics::dispatch_invoke_ref());
        out.instructions.push(Instruction::new(Op::Call, Operand::Method(invoke)));

        match view.ret.as_str() {
            "void" => {
                out.instructions.push(Instruction::simple(Op::Pop));
            }
            "object" => {}
            ret => {
                let ty = self.target.import_type(ret);
                self.emit_result_coercion(ret, ty, out);
            }
        }
        Ok(())
    }

    // --- Reference resolution ---

    /// Retarget a method reference to the runtime slot with the same key, or
    /// import it as a member reference.
    fn resolve_method(&self, token: Token) -> Result<Token, String> {
        let view = self
            .source
            .method_view(token)
            .ok_or_else(|| format!("unresolvable method token {token}"))?;
        if let Some(resolved) = self.plan.resolve_runtime_method(token, &view.key()) {
            return Ok(resolved);
        }
        Ok(self.target.import_member(crate::image::MemberRefRow {
            owner: view.owner,
            name: view.name,
            sig: crate::image::MemberSig::Method {
                has_this: view.has_this,
                generic_arity: view.generic_arity,
                params: view.params,
                ret: view.ret,
            },
        }))
    }

    fn import_type_name(&self, name: &str) -> Option<Token> {
        if is_value_type(name) || name == "void" {
            return None;
        }
        Some(self.target.import_type(name))
    }

    /// Unbox value types, castclass reference types coming back as `object`.
    fn emit_result_coercion(&self, type_name: &str, ty_token: Token, out: &mut MethodBody) {
        if is_value_type(type_name) {
            out.instructions.push(Instruction::new(Op::UnboxAny, Operand::Type(ty_token)));
        } else if type_name != "object" {
            out.instructions.push(Instruction::new(Op::CastClass, Operand::Type(ty_token)));
        }
    }
}

fn new_local(out: &mut MethodBody, ty: &str) -> u16 {
    out.locals.push(LocalVar { ty: ty.to_string() });
    (out.locals.len() - 1) as u16
}
