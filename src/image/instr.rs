//! Stack-machine instruction set for module images.
//!
//! Branch operands hold instruction indices, not byte offsets; byte layout
//! only matters to the short-form pass, which sizes instructions the way the
//! binary encoding would.

use serde::{Deserialize, Serialize};

use crate::image::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Nop,
    Pop,
    Dup,
    Ret,

    LdcI4,
    LdcI8,
    LdcR8,
    LdStr,
    LdNull,

    LdArg,
    StArg,
    LdLoc,
    StLoc,

    LdFld,
    StFld,
    LdSFld,
    StSFld,
    LdFlda,
    LdSFlda,

    Call,
    CallVirt,
    NewObj,
    Calli,

    Br,
    BrS,
    BrTrue,
    BrTrueS,
    BrFalse,
    BrFalseS,
    Switch,
    Leave,
    LeaveS,
    Throw,
    EndFinally,

    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Not,
    Ceq,
    Cgt,
    Clt,

    Box,
    UnboxAny,
    CastClass,

    NewArr,
    LdElemRef,
    StElemRef,
    LdLen,

    LdToken,
}

impl Op {
    /// The long form of a short branch, or `self` if not a short branch.
    pub fn long_form(self) -> Op {
        match self {
            Op::BrS => Op::Br,
            Op::BrTrueS => Op::BrTrue,
            Op::BrFalseS => Op::BrFalse,
            Op::LeaveS => Op::Leave,
            other => other,
        }
    }

    /// The short form of a long branch, or `self` if it has none.
    pub fn short_form(self) -> Op {
        match self {
            Op::Br => Op::BrS,
            Op::BrTrue => Op::BrTrueS,
            Op::BrFalse => Op::BrFalseS,
            Op::Leave => Op::LeaveS,
            other => other,
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Op::Br | Op::BrS | Op::BrTrue | Op::BrTrueS | Op::BrFalse | Op::BrFalseS | Op::Leave | Op::LeaveS
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    None,
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    /// Branch target: index into the body's instruction list.
    Target(u32),
    /// Switch table of instruction indices.
    Switch(Vec<u32>),
    Local(u16),
    Arg(u16),
    Method(Token),
    Field(Token),
    Type(Token),
    /// An operand the rewriter cannot carry across modules (indirect call
    /// signatures and the like). Bodies containing one are not patchable.
    Opaque(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Op,
    pub operand: Operand,
}

impl Instruction {
    pub fn new(op: Op, operand: Operand) -> Self {
        Self { op, operand }
    }

    pub fn simple(op: Op) -> Self {
        Self { op, operand: Operand::None }
    }

    /// Size of this instruction in the binary encoding. Opcodes are one byte;
    /// short branches carry a one-byte displacement, long ones four.
    pub fn encoded_size(&self) -> usize {
        let operand = match (&self.op, &self.operand) {
            (Op::BrS | Op::BrTrueS | Op::BrFalseS | Op::LeaveS, _) => 1,
            (_, Operand::None) => 0,
            (_, Operand::I32(_)) => 4,
            (_, Operand::I64(_) | Operand::F64(_)) => 8,
            (_, Operand::Str(_)) => 4,
            (_, Operand::Target(_)) => 4,
            (_, Operand::Switch(targets)) => 4 + 4 * targets.len(),
            (_, Operand::Local(_) | Operand::Arg(_)) => 2,
            (_, Operand::Method(_) | Operand::Field(_) | Operand::Type(_)) => 4,
            (_, Operand::Opaque(_)) => 4,
        };
        1 + operand
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalVar {
    pub ty: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    Catch,
    Finally,
}

/// Protected region. All bounds are instruction indices; `try_end` and
/// `handler_end` are exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionHandler {
    pub kind: HandlerKind,
    pub catch_type: Option<Token>,
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    pub max_stack: u16,
    pub init_locals: bool,
    pub locals: Vec<LocalVar>,
    pub instructions: Vec<Instruction>,
    pub handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    pub fn new() -> Self {
        Self {
            max_stack: 8,
            init_locals: true,
            locals: Vec::new(),
            instructions: Vec::new(),
            handlers: Vec::new(),
        }
    }
}

impl Default for MethodBody {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand every short branch to its long form.
pub fn simplify_macros(body: &mut MethodBody) {
    for instr in &mut body.instructions {
        instr.op = instr.op.long_form();
    }
}

/// Convert long branches to short forms where the byte displacement fits in
/// a signed byte. Runs to a fixpoint since shrinking one branch can bring
/// another into short range.
pub fn optimize_macros(body: &mut MethodBody) {
    loop {
        let offsets = byte_offsets(body);
        let mut changed = false;
        for i in 0..body.instructions.len() {
            let instr = &body.instructions[i];
            if !instr.op.is_branch() || instr.op.short_form() == instr.op {
                continue;
            }
            let Operand::Target(target) = instr.operand else {
                continue;
            };
            let short = Instruction::new(instr.op.short_form(), instr.operand.clone());
            let end_of_short = offsets[i] as i64 + short.encoded_size() as i64;
            let dest = offsets[target as usize] as i64;
            let disp = dest - end_of_short;
            if (-128..=127).contains(&disp) {
                body.instructions[i].op = short.op;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

fn byte_offsets(body: &MethodBody) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(body.instructions.len() + 1);
    let mut at = 0;
    for instr in &body.instructions {
        offsets.push(at);
        at += instr.encoded_size();
    }
    offsets.push(at);
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of(instrs: Vec<Instruction>) -> MethodBody {
        MethodBody { instructions: instrs, ..MethodBody::new() }
    }

    #[test]
    fn near_branch_shortens() {
        let mut body = body_of(vec![
            Instruction::new(Op::Br, Operand::Target(2)),
            Instruction::simple(Op::Nop),
            Instruction::simple(Op::Ret),
        ]);
        optimize_macros(&mut body);
        assert_eq!(body.instructions[0].op, Op::BrS);
    }

    #[test]
    fn far_branch_stays_long() {
        let mut instrs = vec![Instruction::new(Op::Br, Operand::Target(200))];
        for _ in 0..199 {
            instrs.push(Instruction::new(Op::LdcI4, Operand::I32(0)));
        }
        instrs.push(Instruction::simple(Op::Ret));
        let mut body = body_of(instrs);
        optimize_macros(&mut body);
        assert_eq!(body.instructions[0].op, Op::Br);
    }

    #[test]
    fn simplify_round_trips() {
        let mut body = body_of(vec![
            Instruction::new(Op::BrS, Operand::Target(1)),
            Instruction::simple(Op::Ret),
        ]);
        simplify_macros(&mut body);
        assert_eq!(body.instructions[0].op, Op::Br);
        optimize_macros(&mut body);
        assert_eq!(body.instructions[0].op, Op::BrS);
    }

    #[test]
    fn backward_branch_shortens() {
        let mut body = body_of(vec![
            Instruction::simple(Op::Nop),
            Instruction::new(Op::Br, Operand::Target(0)),
            Instruction::simple(Op::Ret),
        ]);
        optimize_macros(&mut body);
        assert_eq!(body.instructions[1].op, Op::BrS);
    }
}
