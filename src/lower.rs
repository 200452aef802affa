//! AST → module image lowering.
//!
//! Produces flat metadata tables and stack-machine bodies. The optimized
//! configuration folds constants before lowering and runs the short-form
//! pass over each body; the unoptimized one emits long forms as-is.

use std::collections::HashMap;

use crate::diagnostics::CompileError;
use crate::image::instr::{Instruction, LocalVar, MethodBody, Op, Operand, optimize_macros};
use crate::image::{
    FieldDef, MethodDef, MethodKind, ModuleImage, Token, TypeDef, TypeKind,
};
use crate::parser::ast::*;
use crate::runtime::intrinsics;
use crate::runtime::value::is_value_type;
use crate::span::Span;

#[derive(Debug, Clone, Copy)]
pub struct LowerOptions {
    pub optimize: bool,
}

pub fn lower_unit(
    unit: &Unit,
    module_name: &str,
    opts: &LowerOptions,
) -> Result<ModuleImage, CompileError> {
    let mut image = ModuleImage::new(module_name);
    let index = declare_unit(unit, &mut image)?;

    for class in &unit.classes {
        let class_index = &index.classes[&class.name];
        for (mi, method) in class.methods.iter().enumerate() {
            let token = class_index.method_tokens[mi];
            let mut body = lower_method(&mut image, &index, class, method, opts)?;
            if opts.optimize {
                optimize_macros(&mut body);
            }
            image.methods[token.index()].body = Some(body);
        }
        if let Some(token) = class_index.synth_ctor {
            // Default constructor body is just `ret`.
            let mut body = MethodBody::new();
            body.instructions.push(Instruction::simple(Op::Ret));
            body.max_stack = 1;
            image.methods[token.index()].body = Some(body);
        }
    }

    Ok(image)
}

struct UnitIndex {
    classes: HashMap<String, ClassIndex>,
}

struct ClassIndex {
    token: Token,
    field_tokens: HashMap<String, Token>,
    /// Parallel to `ClassDecl::methods`.
    method_tokens: Vec<Token>,
    /// Explicit constructors: (token, parameter types).
    ctors: Vec<(Token, Vec<String>)>,
    synth_ctor: Option<Token>,
}

fn declare_unit(unit: &Unit, image: &mut ModuleImage) -> Result<UnitIndex, CompileError> {
    let mut classes = HashMap::new();

    for class in &unit.classes {
        if classes.contains_key(&class.name) {
            return Err(CompileError::lower(
                format!("duplicate type '{}'", class.name),
                class.span,
            ));
        }
        let type_token = image.add_type(TypeDef {
            full_name: class.name.clone(),
            kind: if class.is_struct { TypeKind::Struct } else { TypeKind::Class },
            generic_arity: 0,
            fields: Vec::new(),
            methods: Vec::new(),
        });

        let mut field_tokens = HashMap::new();
        for field in &class.fields {
            if field_tokens.contains_key(&field.name) {
                return Err(CompileError::lower(
                    format!("duplicate field '{}'", field.name),
                    field.span,
                ));
            }
            let t = image.add_field(FieldDef {
                owner: type_token,
                name: field.name.clone(),
                field_type: field.ty.clone(),
                is_static: field.is_static,
            });
            field_tokens.insert(field.name.clone(), t);
        }

        let mut method_tokens = Vec::new();
        let mut ctors = Vec::new();
        for method in &class.methods {
            let (name, kind) = if method.is_ctor {
                (".ctor".to_string(), MethodKind::Ctor)
            } else {
                (method.name.clone(), MethodKind::Normal)
            };
            let t = image.add_method(MethodDef {
                owner: type_token,
                name,
                generic_arity: 0,
                params: method.params.iter().map(|p| p.ty.clone()).collect(),
                ret: method.ret.clone(),
                is_static: method.is_static,
                is_abstract: false,
                is_extern: false,
                kind,
                body: None,
            });
            if method.is_ctor {
                ctors.push((t, method.params.iter().map(|p| p.ty.clone()).collect()));
            }
            method_tokens.push(t);
        }

        let synth_ctor = if class.methods.iter().any(|m| m.is_ctor) {
            None
        } else {
            Some(image.add_method(MethodDef {
                owner: type_token,
                name: ".ctor".to_string(),
                generic_arity: 0,
                params: Vec::new(),
                ret: "void".to_string(),
                is_static: false,
                is_abstract: false,
                is_extern: false,
                kind: MethodKind::Ctor,
                body: None,
            }))
        };

        classes.insert(
            class.name.clone(),
            ClassIndex { token: type_token, field_tokens, method_tokens, ctors, synth_ctor },
        );
    }

    Ok(UnitIndex { classes })
}

fn lower_method(
    image: &mut ModuleImage,
    index: &UnitIndex,
    class: &ClassDecl,
    method: &MethodDecl,
    opts: &LowerOptions,
) -> Result<MethodBody, CompileError> {
    let mut lowerer = FnLowerer {
        image,
        index,
        class,
        method,
        locals: Vec::new(),
        scope: Vec::new(),
        instrs: Vec::new(),
        handlers: Vec::new(),
        optimize: opts.optimize,
    };
    lowerer.lower_stmts(&method.body)?;

    // Implicit return for void methods and constructors.
    let ends_with_ret = matches!(lowerer.instrs.last(), Some(i) if i.op == Op::Ret);
    if method.ret == "void" {
        if !ends_with_ret {
            lowerer.emit(Op::Ret, Operand::None);
        }
    } else if !ends_with_ret {
        return Err(CompileError::lower(
            format!("method '{}' is missing a return", method.name),
            method.span,
        ));
    }

    let max_stack = compute_max_stack(lowerer.image, &lowerer.instrs);
    Ok(MethodBody {
        max_stack,
        init_locals: true,
        locals: lowerer.locals,
        instructions: lowerer.instrs,
        handlers: lowerer.handlers,
    })
}

struct FnLowerer<'a> {
    image: &'a mut ModuleImage,
    index: &'a UnitIndex,
    class: &'a ClassDecl,
    method: &'a MethodDecl,
    locals: Vec<LocalVar>,
    /// Declared locals visible to name resolution: (name, type, slot).
    scope: Vec<(String, String, u16)>,
    instrs: Vec<Instruction>,
    handlers: Vec<crate::image::instr::ExceptionHandler>,
    optimize: bool,
}

impl FnLowerer<'_> {
    fn emit(&mut self, op: Op, operand: Operand) -> usize {
        self.instrs.push(Instruction::new(op, operand));
        self.instrs.len() - 1
    }

    fn here(&self) -> u32 {
        self.instrs.len() as u32
    }

    fn patch_target(&mut self, at: usize, target: u32) {
        self.instrs[at].operand = Operand::Target(target);
    }

    fn new_local(&mut self, ty: &str) -> u16 {
        self.locals.push(LocalVar { ty: ty.to_string() });
        (self.locals.len() - 1) as u16
    }

    // --- Statements ---

    fn lower_stmts(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        for stmt in stmts {
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Local { ty, name, init, span } => {
                if self.scope.iter().any(|(n, _, _)| n == name) {
                    return Err(CompileError::lower(format!("duplicate local '{name}'"), *span));
                }
                let slot = self.new_local(ty);
                self.scope.push((name.clone(), ty.clone(), slot));
                if let Some(init) = init {
                    let got = self.lower_expr(init)?;
                    self.coerce(&got, ty, init.span())?;
                    self.emit(Op::StLoc, Operand::Local(slot));
                }
                Ok(())
            }
            Stmt::Assign { target, value, span } => self.lower_assign(target, value, *span),
            Stmt::Incr { target, delta, span } => self.lower_incr(target, *delta, *span),
            Stmt::If { cond, then_body, else_body, .. } => {
                let cond = self.fold(cond.clone());
                let got = self.lower_expr(&cond)?;
                self.expect_bool(&got, cond.span())?;
                let jump_else = self.emit(Op::BrFalse, Operand::Target(0));
                self.lower_stmts(then_body)?;
                if else_body.is_empty() {
                    let end = self.here();
                    self.patch_target(jump_else, end);
                } else {
                    let jump_end = self.emit(Op::Br, Operand::Target(0));
                    let else_start = self.here();
                    self.patch_target(jump_else, else_start);
                    self.lower_stmts(else_body)?;
                    let end = self.here();
                    self.patch_target(jump_end, end);
                }
                Ok(())
            }
            Stmt::While { cond, body, .. } => {
                let head = self.here();
                let cond = self.fold(cond.clone());
                let got = self.lower_expr(&cond)?;
                self.expect_bool(&got, cond.span())?;
                let jump_end = self.emit(Op::BrFalse, Operand::Target(0));
                self.lower_stmts(body)?;
                self.emit(Op::Br, Operand::Target(head));
                let end = self.here();
                self.patch_target(jump_end, end);
                Ok(())
            }
            Stmt::Return { value, span } => {
                match (value, self.method.ret.as_str()) {
                    (None, "void") => {}
                    (Some(_), "void") => {
                        return Err(CompileError::lower("void method cannot return a value", *span));
                    }
                    (None, ret) => {
                        return Err(CompileError::lower(
                            format!("method must return a value of type '{ret}'"),
                            *span,
                        ));
                    }
                    (Some(v), ret) => {
                        let ret = ret.to_string();
                        let got = self.lower_expr(v)?;
                        self.coerce(&got, &ret, v.span())?;
                    }
                }
                self.emit(Op::Ret, Operand::None);
                Ok(())
            }
            Stmt::Try { body, catch_body, .. } => {
                let try_start = self.here();
                self.lower_stmts(body)?;
                let leave_try = self.emit(Op::Leave, Operand::Target(0));
                let try_end = self.here();

                // The raised value arrives on the handler's stack.
                let handler_start = self.here();
                self.emit(Op::Pop, Operand::None);
                self.lower_stmts(catch_body)?;
                let leave_catch = self.emit(Op::Leave, Operand::Target(0));
                let handler_end = self.here();

                let end = self.here();
                self.patch_target(leave_try, end);
                self.patch_target(leave_catch, end);
                self.handlers.push(crate::image::instr::ExceptionHandler {
                    kind: crate::image::instr::HandlerKind::Catch,
                    catch_type: None,
                    try_start,
                    try_end,
                    handler_start,
                    handler_end,
                });
                Ok(())
            }
            Stmt::Expr { expr, .. } => {
                let expr = self.fold(expr.clone());
                let ty = self.lower_expr(&expr)?;
                if ty != "void" {
                    self.emit(Op::Pop, Operand::None);
                }
                Ok(())
            }
        }
    }

    fn lower_assign(&mut self, target: &Target, value: &Expr, span: Span) -> Result<(), CompileError> {
        let value = self.fold(value.clone());
        match self.resolve_target(target, span)? {
            Place::Local(slot, ty) => {
                let got = self.lower_expr(&value)?;
                self.coerce(&got, &ty, value.span())?;
                self.emit(Op::StLoc, Operand::Local(slot));
            }
            Place::Param(idx, ty) => {
                let got = self.lower_expr(&value)?;
                self.coerce(&got, &ty, value.span())?;
                self.emit(Op::StArg, Operand::Arg(idx));
            }
            Place::Field(token, ty) => {
                self.load_this(span)?;
                let got = self.lower_expr(&value)?;
                self.coerce(&got, &ty, value.span())?;
                self.emit(Op::StFld, Operand::Field(token));
            }
            Place::StaticField(token, ty) => {
                let got = self.lower_expr(&value)?;
                self.coerce(&got, &ty, value.span())?;
                self.emit(Op::StSFld, Operand::Field(token));
            }
        }
        Ok(())
    }

    fn lower_incr(&mut self, target: &Target, delta: i32, span: Span) -> Result<(), CompileError> {
        match self.resolve_target(target, span)? {
            Place::Local(slot, ty) => {
                self.expect_int(&ty, span)?;
                self.emit(Op::LdLoc, Operand::Local(slot));
                self.emit(Op::LdcI4, Operand::I32(delta));
                self.emit(Op::Add, Operand::None);
                self.emit(Op::StLoc, Operand::Local(slot));
            }
            Place::Param(idx, ty) => {
                self.expect_int(&ty, span)?;
                self.emit(Op::LdArg, Operand::Arg(idx));
                self.emit(Op::LdcI4, Operand::I32(delta));
                self.emit(Op::Add, Operand::None);
                self.emit(Op::StArg, Operand::Arg(idx));
            }
            Place::Field(token, ty) => {
                self.expect_int(&ty, span)?;
                self.load_this(span)?;
                self.emit(Op::Dup, Operand::None);
                self.emit(Op::LdFld, Operand::Field(token));
                self.emit(Op::LdcI4, Operand::I32(delta));
                self.emit(Op::Add, Operand::None);
                self.emit(Op::StFld, Operand::Field(token));
            }
            Place::StaticField(token, ty) => {
                self.expect_int(&ty, span)?;
                self.emit(Op::LdSFld, Operand::Field(token));
                self.emit(Op::LdcI4, Operand::I32(delta));
                self.emit(Op::Add, Operand::None);
                self.emit(Op::StSFld, Operand::Field(token));
            }
        }
        Ok(())
    }

    // --- Expressions ---

    fn lower_expr(&mut self, expr: &Expr) -> Result<String, CompileError> {
        match expr {
            Expr::Int(v, _) => {
                self.emit(Op::LdcI4, Operand::I32(*v));
                Ok("int".to_string())
            }
            Expr::Float(v, _) => {
                self.emit(Op::LdcR8, Operand::F64(*v));
                Ok("float".to_string())
            }
            Expr::Str(s, _) => {
                self.emit(Op::LdStr, Operand::Str(s.clone()));
                Ok("string".to_string())
            }
            Expr::Bool(b, _) => {
                self.emit(Op::LdcI4, Operand::I32(i32::from(*b)));
                Ok("bool".to_string())
            }
            Expr::Null(_) => {
                self.emit(Op::LdNull, Operand::None);
                Ok("object".to_string())
            }
            Expr::This(span) => {
                self.load_this(*span)?;
                Ok(self.class.name.clone())
            }
            Expr::Ident(name, span) => match self.resolve_target(&Target::Name(name.clone()), *span)? {
                Place::Local(slot, ty) => {
                    self.emit(Op::LdLoc, Operand::Local(slot));
                    Ok(ty)
                }
                Place::Param(idx, ty) => {
                    self.emit(Op::LdArg, Operand::Arg(idx));
                    Ok(ty)
                }
                Place::Field(token, ty) => {
                    self.load_this(*span)?;
                    self.emit(Op::LdFld, Operand::Field(token));
                    Ok(ty)
                }
                Place::StaticField(token, ty) => {
                    self.emit(Op::LdSFld, Operand::Field(token));
                    Ok(ty)
                }
            },
            Expr::ThisField(name, span) => {
                match self.resolve_target(&Target::ThisField(name.clone()), *span)? {
                    Place::Field(token, ty) => {
                        self.load_this(*span)?;
                        self.emit(Op::LdFld, Operand::Field(token));
                        Ok(ty)
                    }
                    Place::StaticField(token, ty) => {
                        self.emit(Op::LdSFld, Operand::Field(token));
                        Ok(ty)
                    }
                    _ => unreachable!("this-field resolves to a field place"),
                }
            }
            Expr::Call { name, args, span } => self.lower_call(name, args, *span),
            Expr::New { class, args, span } => self.lower_new(class, args, *span),
            Expr::Binary { op, lhs, rhs, span } => self.lower_binary(*op, lhs, rhs, *span),
            Expr::Unary { op, operand, span } => {
                let got = self.lower_expr(operand)?;
                match op {
                    UnOp::Neg => {
                        if got != "int" && got != "float" {
                            return Err(CompileError::lower(
                                format!("cannot negate '{got}'"),
                                *span,
                            ));
                        }
                        self.emit(Op::Neg, Operand::None);
                        Ok(got)
                    }
                    UnOp::Not => {
                        self.expect_bool(&got, *span)?;
                        self.emit(Op::Not, Operand::None);
                        Ok("bool".to_string())
                    }
                }
            }
        }
    }

    fn lower_call(&mut self, name: &str, args: &[Expr], span: Span) -> Result<String, CompileError> {
        let class_index = &self.index.classes[&self.class.name];

        // Same-class methods shadow the host print intrinsic.
        let candidates: Vec<usize> = self
            .class
            .methods
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.is_ctor && m.name == name && m.params.len() == args.len())
            .map(|(i, _)| i)
            .collect();

        match candidates.as_slice() {
            [] => {
                if name == "print" && args.len() == 1 {
                    return self.lower_print(&args[0]);
                }
                Err(CompileError::lower(
                    format!("no method '{name}' taking {} argument(s)", args.len()),
                    span,
                ))
            }
            [mi] => {
                let target = &self.class.methods[*mi];
                let token = class_index.method_tokens[*mi];
                let params: Vec<String> = target.params.iter().map(|p| p.ty.clone()).collect();
                let ret = target.ret.clone();
                let target_static = target.is_static;

                if !target_static {
                    self.load_this(span)?;
                }
                for (arg, param_ty) in args.iter().zip(&params) {
                    let arg = self.fold(arg.clone());
                    let got = self.lower_expr(&arg)?;
                    self.coerce(&got, param_ty, arg.span())?;
                }
                self.emit(Op::Call, Operand::Method(token));
                Ok(ret)
            }
            _ => Err(CompileError::lower(
                format!("ambiguous call to '{name}'"),
                span,
            )),
        }
    }

    fn lower_print(&mut self, arg: &Expr) -> Result<String, CompileError> {
        let arg = self.fold(arg.clone());
        let got = self.lower_expr(&arg)?;
        if is_value_type(&got) {
            let ty = self.image.import_type_ref(&got);
            self.emit(Op::Box, Operand::Type(ty));
        }
        let print_ref = self.image.import_member_ref(intrinsics::print_ref());
        self.emit(Op::Call, Operand::Method(print_ref));
        Ok("void".to_string())
    }

    fn lower_new(&mut self, class: &str, args: &[Expr], span: Span) -> Result<String, CompileError> {
        let Some(target_index) = self.index.classes.get(class) else {
            return Err(CompileError::lower(format!("unknown type '{class}'"), span));
        };

        if let Some(synth) = target_index.synth_ctor {
            if !args.is_empty() {
                return Err(CompileError::lower(
                    format!("'{class}' has no constructor taking {} argument(s)", args.len()),
                    span,
                ));
            }
            self.emit(Op::NewObj, Operand::Method(synth));
            return Ok(class.to_string());
        }

        let (token, params) = target_index
            .ctors
            .iter()
            .find(|(_, params)| params.len() == args.len())
            .cloned()
            .ok_or_else(|| {
                CompileError::lower(
                    format!("'{class}' has no constructor taking {} argument(s)", args.len()),
                    span,
                )
            })?;
        for (arg, param_ty) in args.iter().zip(&params) {
            let arg = self.fold(arg.clone());
            let got = self.lower_expr(&arg)?;
            self.coerce(&got, param_ty, arg.span())?;
        }
        self.emit(Op::NewObj, Operand::Method(token));
        Ok(class.to_string())
    }

    fn lower_binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> Result<String, CompileError> {
        if matches!(op, BinOp::And | BinOp::Or) {
            return self.lower_logical(op, lhs, rhs, span);
        }

        let lt = self.lower_expr(lhs)?;
        let rt = self.lower_expr(rhs)?;
        // Equality tolerates null (typed as object) on either side; the
        // rest require matching operand types.
        let null_compare = matches!(op, BinOp::Eq | BinOp::Ne) && (lt == "object" || rt == "object");
        if lt != rt && !null_compare {
            return Err(CompileError::lower(
                format!("operand types '{lt}' and '{rt}' do not match"),
                span,
            ));
        }

        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
                if lt != "int" && lt != "float" {
                    return Err(CompileError::lower(
                        format!("arithmetic requires int or float, got '{lt}'"),
                        span,
                    ));
                }
                let instr = match op {
                    BinOp::Add => Op::Add,
                    BinOp::Sub => Op::Sub,
                    BinOp::Mul => Op::Mul,
                    BinOp::Div => Op::Div,
                    BinOp::Rem => Op::Rem,
                    _ => unreachable!(),
                };
                self.emit(instr, Operand::None);
                Ok(lt)
            }
            BinOp::Eq => {
                self.emit(Op::Ceq, Operand::None);
                Ok("bool".to_string())
            }
            BinOp::Ne => {
                self.emit(Op::Ceq, Operand::None);
                self.emit(Op::Not, Operand::None);
                Ok("bool".to_string())
            }
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
                if lt != "int" && lt != "float" {
                    return Err(CompileError::lower(
                        format!("comparison requires int or float, got '{lt}'"),
                        span,
                    ));
                }
                match op {
                    BinOp::Lt => {
                        self.emit(Op::Clt, Operand::None);
                    }
                    BinOp::Gt => {
                        self.emit(Op::Cgt, Operand::None);
                    }
                    BinOp::Le => {
                        self.emit(Op::Cgt, Operand::None);
                        self.emit(Op::Not, Operand::None);
                    }
                    BinOp::Ge => {
                        self.emit(Op::Clt, Operand::None);
                        self.emit(Op::Not, Operand::None);
                    }
                    _ => unreachable!(),
                }
                Ok("bool".to_string())
            }
            BinOp::And | BinOp::Or => unreachable!(),
        }
    }

    /// Short-circuit lowering: `a && b` evaluates `b` only when `a` is true.
    fn lower_logical(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> Result<String, CompileError> {
        let lt = self.lower_expr(lhs)?;
        self.expect_bool(&lt, span)?;
        let (short_branch, short_value) = match op {
            BinOp::And => (Op::BrFalse, 0),
            BinOp::Or => (Op::BrTrue, 1),
            _ => unreachable!(),
        };
        let jump_short = self.emit(short_branch, Operand::Target(0));
        let rt = self.lower_expr(rhs)?;
        self.expect_bool(&rt, span)?;
        let jump_end = self.emit(Op::Br, Operand::Target(0));
        let short_at = self.here();
        self.patch_target(jump_short, short_at);
        self.emit(Op::LdcI4, Operand::I32(short_value));
        let end = self.here();
        self.patch_target(jump_end, end);
        Ok("bool".to_string())
    }

    // --- Name resolution and checks ---

    fn resolve_target(&self, target: &Target, span: Span) -> Result<Place, CompileError> {
        let class_index = &self.index.classes[&self.class.name];
        match target {
            Target::Name(name) => {
                if let Some((_, ty, slot)) = self.scope.iter().rev().find(|(n, _, _)| n == name) {
                    return Ok(Place::Local(*slot, ty.clone()));
                }
                if let Some(pos) = self.method.params.iter().position(|p| p.name == *name) {
                    let idx = if self.method.is_static { pos } else { pos + 1 } as u16;
                    return Ok(Place::Param(idx, self.method.params[pos].ty.clone()));
                }
                self.resolve_field(class_index, name, span)
            }
            Target::ThisField(name) => self.resolve_field(class_index, name, span),
        }
    }

    fn resolve_field(
        &self,
        class_index: &ClassIndex,
        name: &str,
        span: Span,
    ) -> Result<Place, CompileError> {
        let Some(field) = self.class.fields.iter().find(|f| f.name == *name) else {
            return Err(CompileError::lower(format!("unknown name '{name}'"), span));
        };
        let token = class_index.field_tokens[name];
        if field.is_static {
            Ok(Place::StaticField(token, field.ty.clone()))
        } else {
            Ok(Place::Field(token, field.ty.clone()))
        }
    }

    fn load_this(&mut self, span: Span) -> Result<(), CompileError> {
        if self.method.is_static {
            return Err(CompileError::lower(
                "cannot access instance state from a static method",
                span,
            ));
        }
        self.emit(Op::LdArg, Operand::Arg(0));
        Ok(())
    }

    fn coerce(&mut self, got: &str, want: &str, span: Span) -> Result<(), CompileError> {
        if got == want {
            return Ok(());
        }
        if want == "object" {
            if is_value_type(got) {
                let ty = self.image.import_type_ref(got);
                self.emit(Op::Box, Operand::Type(ty));
            }
            return Ok(());
        }
        if got == "object" {
            // Null literal assigned to a reference type.
            return Ok(());
        }
        Err(CompileError::lower(
            format!("expected '{want}', got '{got}'"),
            span,
        ))
    }

    fn expect_bool(&self, got: &str, span: Span) -> Result<(), CompileError> {
        if got == "bool" {
            Ok(())
        } else {
            Err(CompileError::lower(format!("expected 'bool', got '{got}'"), span))
        }
    }

    fn expect_int(&self, got: &str, span: Span) -> Result<(), CompileError> {
        if got == "int" {
            Ok(())
        } else {
            Err(CompileError::lower(
                format!("'++'/'--' requires an int, got '{got}'"),
                span,
            ))
        }
    }

    /// Constant folding for the optimized configuration.
    fn fold(&self, expr: Expr) -> Expr {
        if !self.optimize {
            return expr;
        }
        fold_expr(expr)
    }
}

enum Place {
    Local(u16, String),
    Param(u16, String),
    Field(Token, String),
    StaticField(Token, String),
}

fn fold_expr(expr: Expr) -> Expr {
    match expr {
        Expr::Binary { op, lhs, rhs, span } => {
            let lhs = fold_expr(*lhs);
            let rhs = fold_expr(*rhs);
            if let (Expr::Int(a, _), Expr::Int(b, _)) = (&lhs, &rhs) {
                let folded = match op {
                    BinOp::Add => Some(a.wrapping_add(*b)),
                    BinOp::Sub => Some(a.wrapping_sub(*b)),
                    BinOp::Mul => Some(a.wrapping_mul(*b)),
                    BinOp::Div if *b != 0 => Some(a.wrapping_div(*b)),
                    BinOp::Rem if *b != 0 => Some(a.wrapping_rem(*b)),
                    _ => None,
                };
                if let Some(v) = folded {
                    return Expr::Int(v, span);
                }
            }
            Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), span }
        }
        Expr::Unary { op, operand, span } => {
            let operand = fold_expr(*operand);
            if let (UnOp::Neg, Expr::Int(v, _)) = (op, &operand) {
                return Expr::Int(v.wrapping_neg(), span);
            }
            Expr::Unary { op, operand: Box::new(operand), span }
        }
        Expr::Call { name, args, span } => Expr::Call {
            name,
            args: args.into_iter().map(fold_expr).collect(),
            span,
        },
        Expr::New { class, args, span } => Expr::New {
            class,
            args: args.into_iter().map(fold_expr).collect(),
            span,
        },
        other => other,
    }
}

/// Linear max-stack estimate. Bodies are emitted in execution order, so a
/// forward scan that clamps at zero over-approximates safely.
pub fn compute_max_stack(image: &ModuleImage, instrs: &[Instruction]) -> u16 {
    let mut depth: i32 = 0;
    let mut max: i32 = 1;
    for instr in instrs {
        let (pops, pushes) = stack_effect(image, instr);
        depth -= pops as i32;
        if depth < 0 {
            depth = 0;
        }
        depth += pushes as i32;
        if depth > max {
            max = depth;
        }
    }
    max.max(1) as u16
}

fn stack_effect(image: &ModuleImage, instr: &Instruction) -> (u16, u16) {
    match instr.op {
        Op::Nop | Op::Br | Op::BrS | Op::Leave | Op::LeaveS | Op::EndFinally => (0, 0),
        Op::Pop | Op::StLoc | Op::StArg | Op::StSFld | Op::BrTrue | Op::BrTrueS | Op::BrFalse
        | Op::BrFalseS | Op::Switch | Op::Throw => (1, 0),
        Op::Ret => (1, 0),
        Op::Dup => (1, 2),
        Op::LdcI4 | Op::LdcI8 | Op::LdcR8 | Op::LdStr | Op::LdNull | Op::LdArg | Op::LdLoc
        | Op::LdSFld | Op::LdSFlda | Op::LdToken => (0, 1),
        Op::LdFld | Op::LdFlda | Op::Neg | Op::Not | Op::Box | Op::UnboxAny | Op::CastClass
        | Op::NewArr | Op::LdLen => (1, 1),
        Op::StFld => (2, 0),
        Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Rem | Op::Ceq | Op::Cgt | Op::Clt
        | Op::LdElemRef => (2, 1),
        Op::StElemRef => (3, 0),
        Op::Calli => (1, 1),
        Op::Call | Op::CallVirt | Op::NewObj => {
            let Operand::Method(token) = instr.operand else {
                return (0, 0);
            };
            let Some(view) = image.method_view(token) else {
                return (0, 0);
            };
            let mut pops = view.params.len() as u16;
            if view.has_this && instr.op != Op::NewObj {
                pops += 1;
            }
            let pushes = if instr.op == Op::NewObj || view.ret != "void" { 1 } else { 0 };
            (pops, pushes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use crate::parser::Parser;

    fn lower(src: &str, optimize: bool) -> ModuleImage {
        let tokens = lex(src).unwrap();
        let unit = Parser::new(&tokens, src).parse_unit().unwrap();
        lower_unit(&unit, "Test", &LowerOptions { optimize }).unwrap()
    }

    fn lower_err(src: &str) -> CompileError {
        let tokens = lex(src).unwrap();
        let unit = Parser::new(&tokens, src).parse_unit().unwrap();
        lower_unit(&unit, "Test", &LowerOptions { optimize: false }).unwrap_err()
    }

    fn body_of<'a>(image: &'a ModuleImage, method: &str) -> &'a MethodBody {
        let token = image
            .method_tokens()
            .find(|t| image.method_def(*t).unwrap().name == method)
            .unwrap();
        image.method_def(token).unwrap().body.as_ref().unwrap()
    }

    #[test]
    fn tick_prints() {
        let image = lower("class C { void Tick() { print(\"a\"); } }", false);
        let body = body_of(&image, "Tick");
        assert!(matches!(body.instructions[0].op, Op::LdStr));
        assert!(matches!(body.instructions[1].op, Op::Call));
        assert!(matches!(body.instructions.last().unwrap().op, Op::Ret));
    }

    #[test]
    fn print_boxes_ints() {
        let image = lower("class C { void T() { print(42); } }", false);
        let body = body_of(&image, "T");
        assert!(body.instructions.iter().any(|i| i.op == Op::Box));
    }

    #[test]
    fn field_increment_shape() {
        let image = lower("class C { int counter; void T() { counter++; } }", false);
        let body = body_of(&image, "T");
        let ops: Vec<Op> = body.instructions.iter().map(|i| i.op).collect();
        assert_eq!(
            &ops[..6],
            &[Op::LdArg, Op::Dup, Op::LdFld, Op::LdcI4, Op::Add, Op::StFld]
        );
    }

    #[test]
    fn static_field_access() {
        let image = lower("class C { static int total; void T() { total++; } }", false);
        let body = body_of(&image, "T");
        assert!(body.instructions.iter().any(|i| i.op == Op::LdSFld));
        assert!(body.instructions.iter().any(|i| i.op == Op::StSFld));
    }

    #[test]
    fn same_class_call_targets_method_def() {
        let image = lower(
            "class C { void Hello() { } void Tick() { Hello(); } }",
            false,
        );
        let body = body_of(&image, "Tick");
        let call = body.instructions.iter().find(|i| i.op == Op::Call).unwrap();
        let Operand::Method(token) = call.operand else { panic!() };
        assert_eq!(image.method_def(token).unwrap().name, "Hello");
        // Instance call loads `this` first.
        assert!(matches!(body.instructions[0].op, Op::LdArg));
    }

    #[test]
    fn default_ctor_synthesized() {
        let image = lower("class C { }", false);
        assert!(image.methods.iter().any(|m| m.name == ".ctor"));
    }

    #[test]
    fn if_else_branches() {
        let image = lower(
            "class C { void T(int n) { if (n < 3) { print(\"y\"); } else { print(\"n\"); } } }",
            false,
        );
        let body = body_of(&image, "T");
        assert!(body.instructions.iter().any(|i| i.op == Op::BrFalse));
        assert!(body.instructions.iter().any(|i| i.op == Op::Br));
    }

    #[test]
    fn while_loops_back() {
        let image = lower(
            "class C { void T() { int i = 0; while (i < 3) { i++; } } }",
            false,
        );
        let body = body_of(&image, "T");
        let back = body
            .instructions
            .iter()
            .enumerate()
            .any(|(at, i)| matches!(i.operand, Operand::Target(t) if (t as usize) < at && i.op == Op::Br));
        assert!(back);
    }

    #[test]
    fn try_catch_handler_recorded() {
        let image = lower(
            "class C { void T() { try { print(\"a\"); } catch { print(\"b\"); } } }",
            false,
        );
        let body = body_of(&image, "T");
        assert_eq!(body.handlers.len(), 1);
        let h = &body.handlers[0];
        assert!(h.try_start < h.try_end);
        assert!(h.handler_start < h.handler_end);
        assert!(h.try_end <= h.handler_start);
    }

    #[test]
    fn optimized_config_folds_constants() {
        let debug = lower("class C { void T() { print(1 + 2); } }", false);
        let release = lower("class C { void T() { print(1 + 2); } }", true);
        assert!(body_of(&debug, "T").instructions.iter().any(|i| i.op == Op::Add));
        assert!(!body_of(&release, "T").instructions.iter().any(|i| i.op == Op::Add));
    }

    #[test]
    fn missing_return_rejected() {
        let err = lower_err("class C { int T() { print(\"x\"); } }");
        assert!(err.to_string().contains("missing a return"));
    }

    #[test]
    fn static_cannot_touch_instance() {
        let err = lower_err("class C { int x; static void T() { x++; } }");
        assert!(err.to_string().contains("static"));
    }

    #[test]
    fn max_stack_reasonable() {
        let image = lower("class C { int x; void T() { x = 1 + 2 * 3; } }", false);
        let body = body_of(&image, "T");
        assert!(body.max_stack >= 3);
    }
}
