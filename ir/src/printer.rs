// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Pretty-printer for dfence IR; emits the same syntax the parser reads.

use crate::syntax::*;

fn operand(o: &Operand) -> String {
    match o {
        Operand::Const(Constant::Int(n)) => format!("{n}"),
        Operand::Const(Constant::Float(x)) => {
            // keep a dot so the parser reads it back as a float
            if x.fract() == 0.0 {
                format!("{x:.1}")
            } else {
                format!("{x}")
            }
        }
        Operand::Const(Constant::Null) => "null".to_string(),
        Operand::Const(Constant::BlockAddr(f, b)) => format!("blockaddress(@{f}, %{b})"),
        Operand::Local(l) => format!("%{l}"),
        Operand::Global(g) => format!("@{g}"),
    }
}

fn arith(op: BinArith) -> &'static str {
    match op {
        BinArith::Add => "add",
        BinArith::Sub => "sub",
        BinArith::Mul => "mul",
        BinArith::UDiv => "udiv",
        BinArith::SDiv => "sdiv",
        BinArith::URem => "urem",
        BinArith::SRem => "srem",
        BinArith::And => "and",
        BinArith::Or => "or",
        BinArith::Xor => "xor",
        BinArith::Shl => "shl",
        BinArith::LShr => "lshr",
        BinArith::AShr => "ashr",
        BinArith::FAdd => "fadd",
        BinArith::FSub => "fsub",
        BinArith::FMul => "fmul",
        BinArith::FDiv => "fdiv",
        BinArith::FRem => "frem",
    }
}

fn icmp(pred: ICmpPred) -> &'static str {
    match pred {
        ICmpPred::Eq => "eq",
        ICmpPred::Ne => "ne",
        ICmpPred::Ult => "ult",
        ICmpPred::Ule => "ule",
        ICmpPred::Ugt => "ugt",
        ICmpPred::Uge => "uge",
        ICmpPred::Slt => "slt",
        ICmpPred::Sle => "sle",
        ICmpPred::Sgt => "sgt",
        ICmpPred::Sge => "sge",
    }
}

fn fcmp(pred: FCmpPred) -> &'static str {
    match pred {
        FCmpPred::False => "false",
        FCmpPred::True => "true",
        FCmpPred::Oeq => "oeq",
        FCmpPred::One => "one",
        FCmpPred::Olt => "olt",
        FCmpPred::Ole => "ole",
        FCmpPred::Ogt => "ogt",
        FCmpPred::Oge => "oge",
        FCmpPred::Ord => "ord",
        FCmpPred::Uno => "uno",
        FCmpPred::Ueq => "ueq",
        FCmpPred::Une => "une",
        FCmpPred::Ult => "ult",
        FCmpPred::Ule => "ule",
        FCmpPred::Ugt => "ugt",
        FCmpPred::Uge => "uge",
    }
}

fn cast(op: CastOp) -> &'static str {
    match op {
        CastOp::Trunc => "trunc",
        CastOp::ZExt => "zext",
        CastOp::SExt => "sext",
        CastOp::FpTrunc => "fptrunc",
        CastOp::FpExt => "fpext",
        CastOp::FpToUi => "fptoui",
        CastOp::FpToSi => "fptosi",
        CastOp::UiToFp => "uitofp",
        CastOp::SiToFp => "sitofp",
        CastOp::PtrToInt => "ptrtoint",
        CastOp::IntToPtr => "inttoptr",
        CastOp::BitCast => "bitcast",
    }
}

fn args(args: &[(crate::types::Ty, Operand)]) -> String {
    args.iter()
        .map(|(t, v)| format!("{t} {}", operand(v)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn op(o: &Op) -> String {
    match o {
        Op::Bin { op, ty, lhs, rhs } => {
            format!("{} {ty} {}, {}", arith(*op), operand(lhs), operand(rhs))
        }
        Op::ICmp { pred, ty, lhs, rhs } => {
            format!("icmp {} {ty} {}, {}", icmp(*pred), operand(lhs), operand(rhs))
        }
        Op::FCmp { pred, ty, lhs, rhs } => {
            format!("fcmp {} {ty} {}, {}", fcmp(*pred), operand(lhs), operand(rhs))
        }
        Op::Cast {
            op: c,
            from,
            value,
            to,
        } => format!("{} {from} {} to {to}", cast(*c), operand(value)),
        Op::Alloca { ty, count } => match count {
            Operand::Const(Constant::Int(1)) => format!("alloca {ty}"),
            _ => format!("alloca {ty}, {}", operand(count)),
        },
        Op::Load { ty, ptr } => format!("load {ty}, {}", operand(ptr)),
        Op::Store { ty, value, ptr } => {
            format!("store {ty} {}, {}", operand(value), operand(ptr))
        }
        Op::Gep { base, ptr, indices } => {
            let idx = indices
                .iter()
                .map(|i| format!(", {}", operand(i)))
                .collect::<String>();
            format!("getelementptr {base}, {}{idx}", operand(ptr))
        }
        Op::Phi { ty, incoming } => {
            let inc = incoming
                .iter()
                .map(|(v, b)| format!("[ {}, %{b} ]", operand(v)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("phi {ty} {inc}")
        }
        Op::Select {
            ty,
            cond,
            on_true,
            on_false,
        } => format!(
            "select {}, {ty} {}, {}",
            operand(cond),
            operand(on_true),
            operand(on_false)
        ),
        Op::Call {
            ret,
            callee,
            args: a,
        } => format!("call {ret} {}({})", operand(callee), args(a)),
        Op::Invoke {
            ret,
            callee,
            args: a,
            normal,
            unwind,
        } => format!(
            "invoke {ret} {}({}) to label %{normal} unwind label %{unwind}",
            operand(callee),
            args(a)
        ),
        Op::Br { dest } => format!("br label %{dest}"),
        Op::CondBr {
            cond,
            on_true,
            on_false,
        } => format!(
            "br {}, label %{on_true}, label %{on_false}",
            operand(cond)
        ),
        Op::Switch {
            ty,
            value,
            default,
            cases,
        } => {
            let cs = cases
                .iter()
                .map(|(n, b)| format!("{n}, label %{b}"))
                .collect::<Vec<_>>()
                .join("  ");
            format!("switch {ty} {}, label %{default} [ {cs} ]", operand(value))
        }
        Op::IndirectBr { ptr } => format!("indirectbr {}", operand(ptr)),
        Op::Ret { value: None } => "ret void".to_string(),
        Op::Ret {
            value: Some((t, v)),
        } => format!("ret {t} {}", operand(v)),
        Op::Unwind => "unwind".to_string(),
        Op::Unreachable => "unreachable".to_string(),
    }
}

fn inst(i: &Inst) -> String {
    match &i.result {
        Some(r) => format!("%{r} = {}", op(&i.op)),
        None => op(&i.op),
    }
}

fn global(g: &GlobalVar) -> String {
    let init = match &g.init {
        Init::Zero => "zeroinitializer".to_string(),
        Init::Int(n) => format!("{n}"),
        Init::Array(ns) => format!(
            "[{}]",
            ns.iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    format!("global @{} : {} = {init}", g.name, g.ty)
}

fn func(f: &Function) -> String {
    let params = f
        .params
        .iter()
        .map(|(n, t)| format!("{t} %{n}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut out = format!("func @{}({params}) -> {} {{\n", f.name, f.ret);
    for b in &f.blocks {
        out.push_str(&format!("{}:\n", b.name));
        for i in &b.insts {
            out.push_str(&format!("  {}\n", inst(i)));
        }
    }
    out.push_str("}\n");
    out
}

/// Print a whole module.
pub fn fmt(m: &Module) -> String {
    let mut out = String::new();
    for g in &m.globals {
        out.push_str(&global(g));
        out.push('\n');
    }
    if !m.globals.is_empty() {
        out.push('\n');
    }
    for (i, f) in m.funcs.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&func(f));
    }
    out
}
