// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Parser for the textual dfence IR.
//!
//! The syntax is a compact LLVM-flavored assembly: `; line comments`,
//! `global @name : ty = init` definitions, and `func @name(...) -> ty`
//! bodies made of labeled blocks. Pointers are opaque (`ptr`); loads,
//! stores and geps carry the pointee type explicitly.

use crate::syntax::*;
use crate::types::Ty;
use codespan_reporting::diagnostic::{Diagnostic, Label};
use peg::{error::ParseError, str::LineCol};

enum Item {
    Global(GlobalVar),
    Func(Function),
}

peg::parser! {

grammar parser() for str {
    rule ident_start() = ['a'..='z' | 'A'..='Z' | '_']
    rule ident_char() = ident_start() / ['0'..='9']
    pub(super) rule ident() -> String
    = s:$(quiet!{ident_start() ident_char()*} / expected!("identifier"))
    { s.to_string() }

    rule nl() = quiet!{ ['\n' | '\r'] } / expected!("newline")
    rule comment() = ";" [^'\n' | '\r']*
    rule whitespace() = quiet!{ [' ' | '\t'] / comment() / nl() }
    rule _ = whitespace()*
    rule __ = whitespace()+

    rule num() -> i128
    = s:$(quiet!{"-"? ['0'..='9']+} / expected!("integer"))
    {? s.parse().or(Err("integer")) }

    rule float_num() -> f64
    = s:$("-"? ['0'..='9']+ "." ['0'..='9']+)
    {? s.parse().or(Err("float")) }

    pub(super) rule ty() -> Ty
    = "void" { Ty::Void }
    / "float" { Ty::Float }
    / "double" { Ty::Double }
    / "x86_fp80" { Ty::Fp80 }
    / "ptr" { Ty::Ptr }
    / "i" w:$(['0'..='9']+) {? w.parse().map(Ty::Int).or(Err("width")) }
    / "[" _ n:num() __ "x" __ t:ty() _ "]" { Ty::Array(n as u64, Box::new(t)) }
    / "{" _ ts:(ty() ** (_ "," _)) _ "}" { Ty::Struct(ts) }

    rule local() -> String = "%" i:ident() { i }
    rule at_name() -> String = "@" i:ident() { i }
    rule block_ref() -> String = "label" __ l:local() { l }

    pub(super) rule operand() -> Operand
    = l:local() { Operand::Local(l) }
    / g:at_name() { Operand::Global(g) }
    / "null" { Operand::Const(Constant::Null) }
    / "blockaddress" _ "(" _ f:at_name() _ "," _ b:local() _ ")"
      { Operand::Const(Constant::BlockAddr(f, b)) }
    / f:float_num() { Operand::Const(Constant::Float(f)) }
    / n:num() { Operand::Const(Constant::Int(n)) }

    rule arith_op() -> BinArith
    = "add" { BinArith::Add }
    / "sub" { BinArith::Sub }
    / "mul" { BinArith::Mul }
    / "udiv" { BinArith::UDiv }
    / "sdiv" { BinArith::SDiv }
    / "urem" { BinArith::URem }
    / "srem" { BinArith::SRem }
    / "and" { BinArith::And }
    / "or" { BinArith::Or }
    / "xor" { BinArith::Xor }
    / "shl" { BinArith::Shl }
    / "lshr" { BinArith::LShr }
    / "ashr" { BinArith::AShr }
    / "fadd" { BinArith::FAdd }
    / "fsub" { BinArith::FSub }
    / "fmul" { BinArith::FMul }
    / "fdiv" { BinArith::FDiv }
    / "frem" { BinArith::FRem }

    rule icmp_pred() -> ICmpPred
    = "eq" { ICmpPred::Eq }
    / "ne" { ICmpPred::Ne }
    / "ult" { ICmpPred::Ult }
    / "ule" { ICmpPred::Ule }
    / "ugt" { ICmpPred::Ugt }
    / "uge" { ICmpPred::Uge }
    / "slt" { ICmpPred::Slt }
    / "sle" { ICmpPred::Sle }
    / "sgt" { ICmpPred::Sgt }
    / "sge" { ICmpPred::Sge }

    rule fcmp_pred() -> FCmpPred
    = "false" { FCmpPred::False }
    / "true" { FCmpPred::True }
    / "oeq" { FCmpPred::Oeq }
    / "one" { FCmpPred::One }
    / "olt" { FCmpPred::Olt }
    / "ole" { FCmpPred::Ole }
    / "ogt" { FCmpPred::Ogt }
    / "oge" { FCmpPred::Oge }
    / "ord" { FCmpPred::Ord }
    / "uno" { FCmpPred::Uno }
    / "ueq" { FCmpPred::Ueq }
    / "une" { FCmpPred::Une }
    / "ult" { FCmpPred::Ult }
    / "ule" { FCmpPred::Ule }
    / "ugt" { FCmpPred::Ugt }
    / "uge" { FCmpPred::Uge }

    rule cast_op() -> CastOp
    = "trunc" { CastOp::Trunc }
    / "zext" { CastOp::ZExt }
    / "sext" { CastOp::SExt }
    / "fptrunc" { CastOp::FpTrunc }
    / "fpext" { CastOp::FpExt }
    / "fptoui" { CastOp::FpToUi }
    / "fptosi" { CastOp::FpToSi }
    / "uitofp" { CastOp::UiToFp }
    / "sitofp" { CastOp::SiToFp }
    / "ptrtoint" { CastOp::PtrToInt }
    / "inttoptr" { CastOp::IntToPtr }
    / "bitcast" { CastOp::BitCast }

    rule call_arg() -> (Ty, Operand)
    = t:ty() __ v:operand() { (t, v) }

    rule phi_pair() -> (Operand, String)
    = "[" _ v:operand() _ "," _ b:local() _ "]" { (v, b) }

    rule switch_case() -> (i128, String)
    = n:num() _ "," _ b:block_ref() { (n, b) }

    rule op() -> Op
    = "icmp" __ pred:icmp_pred() __ ty:ty() __ lhs:operand() _ "," _ rhs:operand()
      { Op::ICmp { pred, ty, lhs, rhs } }
    / "fcmp" __ pred:fcmp_pred() __ ty:ty() __ lhs:operand() _ "," _ rhs:operand()
      { Op::FCmp { pred, ty, lhs, rhs } }
    / "alloca" __ ty:ty() count:(_ "," _ n:operand() { n })?
      { Op::Alloca { ty, count: count.unwrap_or(Operand::Const(Constant::Int(1))) } }
    / "load" __ ty:ty() _ "," _ ptr:operand() { Op::Load { ty, ptr } }
    / "store" __ ty:ty() __ value:operand() _ "," _ ptr:operand()
      { Op::Store { ty, value, ptr } }
    / "getelementptr" __ base:ty() _ "," _ ptr:operand()
      indices:(_ "," _ i:operand() { i })+
      { Op::Gep { base, ptr, indices } }
    / "phi" __ ty:ty() __ incoming:(phi_pair() ** (_ "," _))
      { Op::Phi { ty, incoming } }
    / "select" __ cond:operand() _ "," _ ty:ty() __ on_true:operand() _ "," _ on_false:operand()
      { Op::Select { ty, cond, on_true, on_false } }
    / "invoke" __ ret:ty() __ callee:operand() _
      "(" _ args:(call_arg() ** (_ "," _)) _ ")" _
      "to" __ normal:block_ref() __ "unwind" __ unwind:block_ref()
      { Op::Invoke { ret, callee, args, normal, unwind } }
    / "call" __ ret:ty() __ callee:operand() _ "(" _ args:(call_arg() ** (_ "," _)) _ ")"
      { Op::Call { ret, callee, args } }
    / "br" __ dest:block_ref() { Op::Br { dest } }
    / "br" __ ("i1" __)? cond:operand() _ "," _ on_true:block_ref() _ "," _ on_false:block_ref()
      { Op::CondBr { cond, on_true, on_false } }
    / "switch" __ ty:ty() __ value:operand() _ "," _ default:block_ref() _
      "[" _ cases:(switch_case() ** __) _ "]"
      { Op::Switch { ty, value, default, cases } }
    / "indirectbr" __ ptr:operand() { Op::IndirectBr { ptr } }
    / "ret" __ "void" { Op::Ret { value: None } }
    / "ret" __ t:ty() __ v:operand() { Op::Ret { value: Some((t, v)) } }
    / "unwind" { Op::Unwind }
    / "unreachable" { Op::Unreachable }
    / op:arith_op() __ ty:ty() __ lhs:operand() _ "," _ rhs:operand()
      { Op::Bin { op, ty, lhs, rhs } }
    / op:cast_op() __ from:ty() __ value:operand() __ "to" __ to:ty()
      { Op::Cast { op, from, value, to } }

    rule inst() -> Inst
    = result:(l:local() _ "=" _ { l })? op:op()
      { Inst { label: 0, result, op } }

    rule block() -> Block
    = name:ident() _ ":" _ insts:(inst() ** __)
      { Block { name, insts } }

    rule param() -> (String, Ty)
    = t:ty() __ n:local() { (n, t) }

    rule func() -> Function
    = "func" __ name:at_name() _ "(" _ params:(param() ** (_ "," _)) _ ")" _
      "->" _ ret:ty() _ "{" _ blocks:(block() ** __) _ "}"
      { Function { name, params, ret, blocks } }

    rule init() -> Init
    = "zeroinitializer" { Init::Zero }
    / "[" _ ns:(num() ** (_ "," _)) _ "]" { Init::Array(ns) }
    / n:num() { Init::Int(n) }

    rule global_def() -> GlobalVar
    = "global" __ name:at_name() _ ":" _ ty:ty() _ "=" _ init:init()
      { GlobalVar { name, ty, init } }

    rule item() -> Item
    = g:global_def() { Item::Global(g) }
    / f:func() { Item::Func(f) }

    pub rule module() -> Module
    = _ items:(item() ** __) _
      {
        let mut globals = vec![];
        let mut funcs = vec![];
        for item in items {
            match item {
                Item::Global(g) => globals.push(g),
                Item::Func(f) => funcs.push(f),
            }
        }
        Module { globals, funcs }
      }
}

}

/// Parse a module, reporting a structured error on failure.
pub fn parse(s: &str) -> Result<Module, ParseError<LineCol>> {
    parser::module(s)
}

/// Convert an opaque FileId and error to a readable `Diagnostic`.
pub fn parse_error_diagnostic<FileId>(
    file_id: FileId,
    e: &ParseError<LineCol>,
) -> Diagnostic<FileId> {
    Diagnostic::error()
        .with_message("could not parse file")
        .with_labels(vec![Label::primary(
            file_id,
            e.location.offset..e.location.offset + 1,
        )
        .with_message(format!("expected {}", e.expected))])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_types() {
        assert_eq!(parser::ty("i32"), Ok(Ty::Int(32)));
        assert_eq!(parser::ty("ptr"), Ok(Ty::Ptr));
        assert_eq!(
            parser::ty("[4 x i32]"),
            Ok(Ty::Array(4, Box::new(Ty::Int(32))))
        );
        assert_eq!(
            parser::ty("{i8, i32}"),
            Ok(Ty::Struct(vec![Ty::Int(8), Ty::Int(32)]))
        );
        assert!(parser::ty("i").is_err());
    }

    #[test]
    fn test_operands() {
        assert_eq!(
            parser::operand("%x"),
            Ok(Operand::Local("x".to_string()))
        );
        assert_eq!(
            parser::operand("@g"),
            Ok(Operand::Global("g".to_string()))
        );
        assert_eq!(
            parser::operand("-3"),
            Ok(Operand::Const(Constant::Int(-3)))
        );
        assert_eq!(
            parser::operand("1.5"),
            Ok(Operand::Const(Constant::Float(1.5)))
        );
        assert_eq!(parser::operand("null"), Ok(Operand::Const(Constant::Null)));
    }

    #[test]
    fn test_module_parses() {
        let m = parse(
            "
            ; a global counter
            global @n : i32 = 7
            global @buf : [2 x i32] = zeroinitializer

            func @bump(i32 %d) -> i32 {
            entry:
              %old = load i32, @n
              %new = add i32 %old, %d
              store i32 %new, @n
              %big = icmp sgt i32 %new, 10
              br %big, label %yes, label %no
            yes:
              ret i32 1
            no:
              ret i32 0
            }

            func @main() -> i32 {
            entry:
              %r = call i32 @bump(i32 3)
              ret i32 %r
            }
            ",
        )
        .expect("module should parse");
        assert_eq!(m.globals.len(), 2);
        assert_eq!(m.funcs.len(), 2);
        assert_eq!(m.funcs[0].blocks.len(), 3);
        assert_eq!(m.funcs[0].params, vec![("d".to_string(), Ty::Int(32))]);
    }

    #[test]
    fn test_control_flow_forms() {
        let m = parse(
            "
            func @f(i32 %x) -> void {
            entry:
              switch i32 %x, label %done [ 0, label %a  1, label %b ]
            a:
              %p = alloca i32
              store i32 1, %p
              br label %done
            b:
              %v = phi i32 [ 0, %entry ], [ 1, %a ]
              br label %done
            done:
              ret void
            }
            ",
        )
        .expect("module should parse");
        let entry = &m.funcs[0].blocks[0];
        assert!(matches!(entry.insts[0].op, Op::Switch { ref cases, .. } if cases.len() == 2));
    }

    #[test]
    fn test_parse_error_position() {
        let err = parse("func @f() -> i32 { entry: retx }").unwrap_err();
        let diagnostic = parse_error_diagnostic((), &err);
        assert_eq!(diagnostic.labels.len(), 1);
    }
}
