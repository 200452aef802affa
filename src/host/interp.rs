//! Stack interpreter for image bodies.
//!
//! Executes whatever body a method slot currently holds, which is how
//! detours take effect: the interpreter asks the module for the active body
//! on every call. Intrinsic member references are resolved against the host
//! (print sink), the dispatcher, and the field store.

use std::sync::Arc;

use crate::host::SimHost;
use crate::image::instr::{HandlerKind, MethodBody, Op, Operand};
use crate::image::{FieldRefView, MethodRefView, TableKind, Token};
use crate::keys::{FieldKey, MethodId};
use crate::runtime::intrinsics;
use crate::runtime::loaded::LoadedModule;
use crate::runtime::value::{Value, value_eq, zero_value};

const STEP_LIMIT: usize = 1_000_000;
const CALL_DEPTH_LIMIT: usize = 256;

/// Raised values unwind like exceptions; faults are execution errors the
/// script cannot catch.
#[derive(Debug)]
pub enum ExecError {
    Raised(Value),
    Fault(String),
}

impl ExecError {
    pub fn fault(msg: impl Into<String>) -> Self {
        ExecError::Fault(msg.into())
    }

    fn raise(name: &str) -> Self {
        ExecError::Raised(Value::str(name))
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::Raised(v) => write!(f, "unhandled exception: {v}"),
            ExecError::Fault(msg) => write!(f, "execution fault: {msg}"),
        }
    }
}

/// Invoke a declared method through its slot (detours included).
pub fn call_method(
    host: &SimHost,
    module: &Arc<LoadedModule>,
    method: Token,
    this: Option<Value>,
    args: &[Value],
) -> Result<Value, ExecError> {
    call_method_at_depth(host, module, method, this, args, 0)
}

fn call_method_at_depth(
    host: &SimHost,
    module: &Arc<LoadedModule>,
    method: Token,
    this: Option<Value>,
    args: &[Value],
    depth: usize,
) -> Result<Value, ExecError> {
    if depth > CALL_DEPTH_LIMIT {
        return Err(ExecError::fault("call depth limit exceeded"));
    }
    let view = module
        .with_image(|i| i.method_view(method))
        .ok_or_else(|| ExecError::fault(format!("no method for token {method}")))?;
    let body = module
        .active_body(method)
        .ok_or_else(|| ExecError::fault(format!("method {} has no body", view.name)))?;

    let mut frame_args = Vec::with_capacity(args.len() + 1);
    if view.has_this {
        frame_args.push(this.unwrap_or(Value::Null));
    }
    frame_args.extend_from_slice(args);

    exec_body(host, module, &body, frame_args, depth)
}

/// Execute a dynamic method's body (dispatcher registration path).
pub fn call_dynamic(
    host: &SimHost,
    module: &Arc<LoadedModule>,
    body: &MethodBody,
    frame_args: Vec<Value>,
) -> Result<Value, ExecError> {
    exec_body(host, module, body, frame_args, 0)
}

enum Flow {
    Next,
    Jump(u32),
    Return(Value),
}

fn exec_body(
    host: &SimHost,
    module: &Arc<LoadedModule>,
    body: &MethodBody,
    mut args: Vec<Value>,
    depth: usize,
) -> Result<Value, ExecError> {
    let mut locals: Vec<Value> = body.locals.iter().map(|l| zero_value(&l.ty)).collect();
    let mut stack: Vec<Value> = Vec::with_capacity(body.max_stack as usize);
    let mut ip: usize = 0;
    let mut steps = 0usize;

    while ip < body.instructions.len() {
        steps += 1;
        if steps > STEP_LIMIT {
            return Err(ExecError::fault("step limit exceeded"));
        }

        let instr = &body.instructions[ip];
        let flow = step(host, module, instr, &mut stack, &mut locals, &mut args, depth);
        match flow {
            Ok(Flow::Next) => ip += 1,
            Ok(Flow::Jump(target)) => ip = target as usize,
            Ok(Flow::Return(value)) => return Ok(value),
            Err(ExecError::Raised(exception)) => {
                // Find a catch handler protecting the faulting instruction.
                let handler = body.handlers.iter().find(|h| {
                    h.kind == HandlerKind::Catch
                        && (h.try_start as usize) <= ip
                        && ip < (h.try_end as usize)
                });
                match handler {
                    Some(h) => {
                        stack.clear();
                        stack.push(exception);
                        ip = h.handler_start as usize;
                    }
                    None => return Err(ExecError::Raised(exception)),
                }
            }
            Err(fault) => return Err(fault),
        }
    }
    Ok(Value::Null)
}

fn step(
    host: &SimHost,
    module: &Arc<LoadedModule>,
    instr: &crate::image::instr::Instruction,
    stack: &mut Vec<Value>,
    locals: &mut [Value],
    args: &mut [Value],
    depth: usize,
) -> Result<Flow, ExecError> {
    match instr.op {
        Op::Nop => Ok(Flow::Next),
        Op::Pop => {
            pop(stack)?;
            Ok(Flow::Next)
        }
        Op::Dup => {
            let top = peek(stack)?.clone();
            stack.push(top);
            Ok(Flow::Next)
        }
        Op::Ret => Ok(Flow::Return(stack.pop().unwrap_or(Value::Null))),

        Op::LdcI4 => {
            let Operand::I32(v) = instr.operand else {
                return Err(ExecError::fault("ldc.i4 without i32 operand"));
            };
            stack.push(Value::Int(v));
            Ok(Flow::Next)
        }
        Op::LdcI8 => Err(ExecError::fault("64-bit integers are not supported by this host")),
        Op::LdcR8 => {
            let Operand::F64(v) = instr.operand else {
                return Err(ExecError::fault("ldc.r8 without f64 operand"));
            };
            stack.push(Value::Float(v));
            Ok(Flow::Next)
        }
        Op::LdStr => {
            let Operand::Str(s) = &instr.operand else {
                return Err(ExecError::fault("ldstr without string operand"));
            };
            stack.push(Value::str(s));
            Ok(Flow::Next)
        }
        Op::LdNull => {
            stack.push(Value::Null);
            Ok(Flow::Next)
        }

        Op::LdArg => {
            let idx = index_operand(&instr.operand)?;
            let v = args
                .get(idx)
                .cloned()
                .ok_or_else(|| ExecError::fault(format!("argument {idx} out of range")))?;
            stack.push(v);
            Ok(Flow::Next)
        }
        Op::StArg => {
            let idx = index_operand(&instr.operand)?;
            let v = pop(stack)?;
            *args
                .get_mut(idx)
                .ok_or_else(|| ExecError::fault(format!("argument {idx} out of range")))? = v;
            Ok(Flow::Next)
        }
        Op::LdLoc => {
            let idx = index_operand(&instr.operand)?;
            let v = locals
                .get(idx)
                .cloned()
                .ok_or_else(|| ExecError::fault(format!("local {idx} out of range")))?;
            stack.push(v);
            Ok(Flow::Next)
        }
        Op::StLoc => {
            let idx = index_operand(&instr.operand)?;
            let v = pop(stack)?;
            *locals
                .get_mut(idx)
                .ok_or_else(|| ExecError::fault(format!("local {idx} out of range")))? = v;
            Ok(Flow::Next)
        }

        Op::LdFld => {
            let view = field_view(module, &instr.operand)?;
            let obj = pop_obj(stack)?;
            stack.push(obj.get_field(&view.name));
            Ok(Flow::Next)
        }
        Op::StFld => {
            let view = field_view(module, &instr.operand)?;
            let value = pop(stack)?;
            let obj = pop_obj(stack)?;
            obj.set_field(&view.name, value);
            Ok(Flow::Next)
        }
        Op::LdSFld => {
            let view = field_view(module, &instr.operand)?;
            stack.push(host.static_field(&view));
            Ok(Flow::Next)
        }
        Op::StSFld => {
            let view = field_view(module, &instr.operand)?;
            let value = pop(stack)?;
            host.set_static_field(&view, value);
            Ok(Flow::Next)
        }
        Op::LdFlda | Op::LdSFlda => Err(ExecError::fault("field addresses are not executable here")),

        Op::Call | Op::CallVirt => do_call(host, module, &instr.operand, stack, depth),
        Op::NewObj => do_newobj(host, module, &instr.operand, stack, depth),
        Op::Calli => Err(ExecError::fault("indirect calls are not supported")),

        Op::Br | Op::BrS | Op::Leave | Op::LeaveS => Ok(Flow::Jump(target_operand(&instr.operand)?)),
        Op::BrTrue | Op::BrTrueS => {
            let v = pop(stack)?;
            if v.truthy() {
                Ok(Flow::Jump(target_operand(&instr.operand)?))
            } else {
                Ok(Flow::Next)
            }
        }
        Op::BrFalse | Op::BrFalseS => {
            let v = pop(stack)?;
            if v.truthy() {
                Ok(Flow::Next)
            } else {
                Ok(Flow::Jump(target_operand(&instr.operand)?))
            }
        }
        Op::Switch => {
            let Operand::Switch(targets) = &instr.operand else {
                return Err(ExecError::fault("switch without table"));
            };
            let v = pop(stack)?;
            let Value::Int(i) = v else {
                return Err(ExecError::fault("switch on non-int"));
            };
            match targets.get(i as usize) {
                Some(t) if i >= 0 => Ok(Flow::Jump(*t)),
                _ => Ok(Flow::Next),
            }
        }
        Op::Throw => Err(ExecError::Raised(pop(stack)?)),
        Op::EndFinally => Err(ExecError::fault("endfinally outside a finally handler")),

        Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Rem => {
            let b = pop(stack)?;
            let a = pop(stack)?;
            stack.push(arith(instr.op, a, b)?);
            Ok(Flow::Next)
        }
        Op::Neg => {
            let v = pop(stack)?;
            let r = match v {
                Value::Int(i) => Value::Int(i.wrapping_neg()),
                Value::Float(f) => Value::Float(-f),
                other => return Err(ExecError::fault(format!("cannot negate {}", other.type_name()))),
            };
            stack.push(r);
            Ok(Flow::Next)
        }
        Op::Not => {
            let v = pop(stack)?;
            stack.push(Value::Bool(!v.truthy()));
            Ok(Flow::Next)
        }
        Op::Ceq => {
            let b = pop(stack)?;
            let a = pop(stack)?;
            stack.push(Value::Bool(value_eq(&a, &b)));
            Ok(Flow::Next)
        }
        Op::Cgt | Op::Clt => {
            let b = pop(stack)?;
            let a = pop(stack)?;
            let ordering = match (&a, &b) {
                (Value::Int(x), Value::Int(y)) => x.partial_cmp(y),
                (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
                _ => {
                    return Err(ExecError::fault(format!(
                        "cannot compare {} with {}",
                        a.type_name(),
                        b.type_name()
                    )));
                }
            };
            let result = match (instr.op, ordering) {
                (Op::Cgt, Some(std::cmp::Ordering::Greater)) => true,
                (Op::Clt, Some(std::cmp::Ordering::Less)) => true,
                _ => false,
            };
            stack.push(Value::Bool(result));
            Ok(Flow::Next)
        }

        Op::Box => {
            // Values are uniform; boxing is the identity here.
            Ok(Flow::Next)
        }
        Op::UnboxAny => {
            let name = type_operand(module, &instr.operand)?;
            let v = peek(stack)?;
            if v.is_null() {
                return Err(ExecError::raise("System.NullReferenceException"));
            }
            if crate::runtime::value::is_value_type(&name) && v.type_name() != name {
                return Err(ExecError::raise("System.InvalidCastException"));
            }
            Ok(Flow::Next)
        }
        Op::CastClass => {
            let name = type_operand(module, &instr.operand)?;
            let v = peek(stack)?;
            let ok = v.is_null() || name == "object" || v.type_name() == name;
            if ok {
                Ok(Flow::Next)
            } else {
                Err(ExecError::raise("System.InvalidCastException"))
            }
        }

        Op::NewArr => {
            let v = pop(stack)?;
            let Value::Int(len) = v else {
                return Err(ExecError::fault("newarr with non-int length"));
            };
            if len < 0 {
                return Err(ExecError::raise("System.OverflowException"));
            }
            let arr = vec![Value::Null; len as usize];
            stack.push(Value::Arr(Arc::new(std::sync::Mutex::new(arr))));
            Ok(Flow::Next)
        }
        Op::LdElemRef => {
            let idx = pop_int(stack)?;
            let arr = pop_arr(stack)?;
            let guard = crate::runtime::lock(&arr);
            let v = guard
                .get(idx as usize)
                .cloned()
                .ok_or_else(|| ExecError::raise("System.IndexOutOfRangeException"))?;
            drop(guard);
            stack.push(v);
            Ok(Flow::Next)
        }
        Op::StElemRef => {
            let value = pop(stack)?;
            let idx = pop_int(stack)?;
            let arr = pop_arr(stack)?;
            let mut guard = crate::runtime::lock(&arr);
            let slot = guard
                .get_mut(idx as usize)
                .ok_or_else(|| ExecError::raise("System.IndexOutOfRangeException"))?;
            *slot = value;
            Ok(Flow::Next)
        }
        Op::LdLen => {
            let arr = pop_arr(stack)?;
            let len = crate::runtime::lock(&arr).len();
            stack.push(Value::Int(len as i32));
            Ok(Flow::Next)
        }

        Op::LdToken => {
            let name = type_operand(module, &instr.operand)?;
            stack.push(Value::TypeHandle(Arc::from(name.as_str())));
            Ok(Flow::Next)
        }
    }
}

fn do_call(
    host: &SimHost,
    module: &Arc<LoadedModule>,
    operand: &Operand,
    stack: &mut Vec<Value>,
    depth: usize,
) -> Result<Flow, ExecError> {
    let Operand::Method(token) = operand else {
        return Err(ExecError::fault("call without method operand"));
    };
    let view = module
        .with_image(|i| i.method_view(*token))
        .ok_or_else(|| ExecError::fault(format!("unresolved call token {token}")))?;

    if intrinsics::is_intrinsic_owner(&view.owner) {
        return call_intrinsic(host, &view, stack);
    }

    let call_args = pop_n(stack, view.params.len())?;
    let this = if view.has_this { Some(pop(stack)?) } else { None };

    // Resolve the callee: a method def token executes directly; a member
    // reference is matched by key against the module's declarations.
    let target = if token.is(TableKind::MethodDef) {
        *token
    } else {
        let key = view.key();
        module
            .methods_by_key()
            .get(&key)
            .copied()
            .ok_or_else(|| ExecError::fault(format!("unresolved member reference {key}")))?
    };

    if view.has_this && this.as_ref().is_some_and(Value::is_null) {
        return Err(ExecError::raise("System.NullReferenceException"));
    }

    let result = call_method_at_depth(host, module, target, this, &call_args, depth + 1)?;
    if view.ret != "void" {
        stack.push(result);
    }
    Ok(Flow::Next)
}

fn do_newobj(
    host: &SimHost,
    module: &Arc<LoadedModule>,
    operand: &Operand,
    stack: &mut Vec<Value>,
    depth: usize,
) -> Result<Flow, ExecError> {
    let Operand::Method(token) = operand else {
        return Err(ExecError::fault("newobj without method operand"));
    };
    let view = module
        .with_image(|i| i.method_view(*token))
        .ok_or_else(|| ExecError::fault(format!("unresolved constructor token {token}")))?;

    let args = pop_n(stack, view.params.len())?;
    let declared = module.declared_fields(&view.owner);
    let instance = crate::runtime::value::Instance::new(view.owner.clone(), &declared);

    let target = if token.is(TableKind::MethodDef) {
        *token
    } else {
        let key = view.key();
        module
            .methods_by_key()
            .get(&key)
            .copied()
            .ok_or_else(|| ExecError::fault(format!("unresolved constructor reference {key}")))?
    };
    call_method_at_depth(host, module, target, Some(Value::Obj(instance.clone())), &args, depth + 1)?;
    stack.push(Value::Obj(instance));
    Ok(Flow::Next)
}

fn call_intrinsic(
    host: &SimHost,
    view: &MethodRefView,
    stack: &mut Vec<Value>,
) -> Result<Flow, ExecError> {
    match (view.owner.as_str(), view.name.as_str()) {
        (intrinsics::HOST_TYPE, intrinsics::HOST_PRINT) => {
            let v = pop(stack)?;
            host.print(&v);
            Ok(Flow::Next)
        }
        (intrinsics::DISPATCH_TYPE, intrinsics::DISPATCH_INVOKE) => {
            let argv = pop(stack)?;
            let id = pop_int(stack)?;
            let receiver = pop(stack)?;
            let receiver = if receiver.is_null() { None } else { Some(receiver) };
            let args: Option<Vec<Value>> = match argv {
                Value::Null => None,
                Value::Arr(a) => Some(crate::runtime::lock(&a).clone()),
                other => {
                    return Err(ExecError::fault(format!(
                        "dispatch argv must be an array, got {}",
                        other.type_name()
                    )));
                }
            };
            let result = host.dispatcher().invoke(receiver, MethodId(id as u32), args.as_deref());
            stack.push(result);
            Ok(Flow::Next)
        }
        (intrinsics::FIELD_STORE_TYPE, intrinsics::FIELD_GET_INSTANCE) => {
            let ty = pop_type_handle(stack)?;
            let key = pop_str(stack)?;
            let owner = pop_obj(stack)?;
            let v = host.field_store().get_instance(&owner, &FieldKey::from_raw(key), &ty);
            stack.push(v);
            Ok(Flow::Next)
        }
        (intrinsics::FIELD_STORE_TYPE, intrinsics::FIELD_SET_INSTANCE) => {
            let value = pop(stack)?;
            let key = pop_str(stack)?;
            let owner = pop_obj(stack)?;
            host.field_store().set_instance(&owner, &FieldKey::from_raw(key), value);
            Ok(Flow::Next)
        }
        (intrinsics::FIELD_STORE_TYPE, intrinsics::FIELD_GET_STATIC) => {
            let ty = pop_type_handle(stack)?;
            let key = pop_str(stack)?;
            let v = host.field_store().get_static(&FieldKey::from_raw(key), &ty);
            stack.push(v);
            Ok(Flow::Next)
        }
        (intrinsics::FIELD_STORE_TYPE, intrinsics::FIELD_SET_STATIC) => {
            let value = pop(stack)?;
            let key = pop_str(stack)?;
            host.field_store().set_static(&FieldKey::from_raw(key), value);
            Ok(Flow::Next)
        }
        (owner, name) => Err(ExecError::fault(format!("unknown intrinsic {owner}::{name}"))),
    }
}

// --- Stack and operand helpers ---

fn pop(stack: &mut Vec<Value>) -> Result<Value, ExecError> {
    stack.pop().ok_or_else(|| ExecError::fault("evaluation stack underflow"))
}

fn peek(stack: &[Value]) -> Result<&Value, ExecError> {
    stack.last().ok_or_else(|| ExecError::fault("evaluation stack underflow"))
}

fn pop_n(stack: &mut Vec<Value>, n: usize) -> Result<Vec<Value>, ExecError> {
    if stack.len() < n {
        return Err(ExecError::fault("evaluation stack underflow"));
    }
    Ok(stack.split_off(stack.len() - n))
}

fn pop_int(stack: &mut Vec<Value>) -> Result<i32, ExecError> {
    match pop(stack)? {
        Value::Int(v) => Ok(v),
        other => Err(ExecError::fault(format!("expected int, got {}", other.type_name()))),
    }
}

fn pop_str(stack: &mut Vec<Value>) -> Result<String, ExecError> {
    match pop(stack)? {
        Value::Str(s) => Ok(s.to_string()),
        other => Err(ExecError::fault(format!("expected string, got {}", other.type_name()))),
    }
}

fn pop_obj(stack: &mut Vec<Value>) -> Result<crate::runtime::value::ObjRef, ExecError> {
    match pop(stack)? {
        Value::Obj(o) => Ok(o),
        Value::Null => Err(ExecError::raise("System.NullReferenceException")),
        other => Err(ExecError::fault(format!("expected object, got {}", other.type_name()))),
    }
}

fn pop_arr(stack: &mut Vec<Value>) -> Result<crate::runtime::value::ArrRef, ExecError> {
    match pop(stack)? {
        Value::Arr(a) => Ok(a),
        Value::Null => Err(ExecError::raise("System.NullReferenceException")),
        other => Err(ExecError::fault(format!("expected array, got {}", other.type_name()))),
    }
}

fn pop_type_handle(stack: &mut Vec<Value>) -> Result<String, ExecError> {
    match pop(stack)? {
        Value::TypeHandle(t) => Ok(t.to_string()),
        other => Err(ExecError::fault(format!("expected type handle, got {}", other.type_name()))),
    }
}

fn index_operand(operand: &Operand) -> Result<usize, ExecError> {
    match operand {
        Operand::Local(i) | Operand::Arg(i) => Ok(*i as usize),
        _ => Err(ExecError::fault("expected a local/argument index operand")),
    }
}

fn target_operand(operand: &Operand) -> Result<u32, ExecError> {
    match operand {
        Operand::Target(t) => Ok(*t),
        _ => Err(ExecError::fault("expected a branch target operand")),
    }
}

fn field_view(module: &Arc<LoadedModule>, operand: &Operand) -> Result<FieldRefView, ExecError> {
    let Operand::Field(token) = operand else {
        return Err(ExecError::fault("expected a field operand"));
    };
    module
        .with_image(|i| i.field_view(*token))
        .ok_or_else(|| ExecError::fault(format!("unresolved field token {token}")))
}

fn type_operand(module: &Arc<LoadedModule>, operand: &Operand) -> Result<String, ExecError> {
    let Operand::Type(token) = operand else {
        return Err(ExecError::fault("expected a type operand"));
    };
    module
        .with_image(|i| i.type_name_of(*token).map(str::to_string))
        .ok_or_else(|| ExecError::fault(format!("unresolved type token {token}")))
}

fn arith(op: Op, a: Value, b: Value) -> Result<Value, ExecError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            if matches!(op, Op::Div | Op::Rem) && y == 0 {
                return Err(ExecError::raise("System.DivideByZeroException"));
            }
            Ok(Value::Int(match op {
                Op::Add => x.wrapping_add(y),
                Op::Sub => x.wrapping_sub(y),
                Op::Mul => x.wrapping_mul(y),
                Op::Div => x.wrapping_div(y),
                Op::Rem => x.wrapping_rem(y),
                _ => unreachable!(),
            }))
        }
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(match op {
            Op::Add => x + y,
            Op::Sub => x - y,
            Op::Mul => x * y,
            Op::Div => x / y,
            Op::Rem => x % y,
            _ => unreachable!(),
        })),
        (Value::Str(x), Value::Str(y)) if op == Op::Add => {
            Ok(Value::str(format!("{x}{y}")))
        }
        (a, b) => Err(ExecError::fault(format!(
            "cannot apply {:?} to {} and {}",
            op,
            a.type_name(),
            b.type_name()
        ))),
    }
}
