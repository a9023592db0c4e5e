// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! The dfence AST for modules, functions, blocks and instructions.
//!
//! Every instruction carries a stable integer label assigned once at load
//! time; fences inserted by the synthesizer carry label 0 so later rounds
//! ignore them. Functions, blocks and instructions are owned by the module
//! and referenced by index everywhere else.

use crate::types::Ty;
use std::fmt;

/// A whole translation unit: globals plus functions.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Global variables, emitted into memory before execution.
    pub globals: Vec<GlobalVar>,
    /// Function definitions and declarations.
    pub funcs: Vec<Function>,
}

/// A global variable definition.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalVar {
    /// The `@name` of the global.
    pub name: String,
    /// The value type of the global.
    pub ty: Ty,
    /// Its initializer.
    pub init: Init,
}

/// A global initializer.
#[derive(Debug, Clone, PartialEq)]
pub enum Init {
    /// All-zero bytes.
    Zero,
    /// A scalar integer value.
    Int(i128),
    /// Integer array elements, one per array slot.
    Array(Vec<i128>),
}

/// A function definition (or declaration, when `blocks` is empty).
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    /// The `@name` of the function.
    pub name: String,
    /// Parameter names and types.
    pub params: Vec<(String, Ty)>,
    /// Return type.
    pub ret: Ty,
    /// Basic blocks; the first is the entry block.
    pub blocks: Vec<Block>,
}

impl Function {
    /// Whether this is a declaration with no body.
    pub fn is_decl(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Find a block index by name.
    pub fn block(&self, name: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.name == name)
    }
}

/// A basic block: a name and a straight-line instruction list ending in a
/// terminator.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// The block's `%name`.
    pub name: String,
    /// Its instructions.
    pub insts: Vec<Inst>,
}

/// A labeled instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    /// Stable label assigned at load time; 0 on synthesized fences.
    pub label: u32,
    /// The destination local, for value-producing instructions.
    pub result: Option<String>,
    /// The operation.
    pub op: Op,
}

/// An instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// An immediate constant.
    Const(Constant),
    /// A `%local` defined earlier in the function (or a parameter).
    Local(String),
    /// A `@global`: a global variable's address or a function's address.
    Global(String),
}

/// An immediate constant; integer constants take their width from the
/// instruction's type.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// An integer (interpreted at the instruction's width).
    Int(i128),
    /// A floating-point literal (interpreted at the instruction's type).
    Float(f64),
    /// The null pointer.
    Null,
    /// The address of a basic block, for `indirectbr` targets.
    BlockAddr(String, String),
}

/// Integer/float arithmetic and bitwise operators.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinArith {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
}

/// Integer (and pointer) comparison predicates.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ICmpPred {
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
}

/// Floating-point comparison predicates; the `U*` forms are true when
/// either operand is NaN.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FCmpPred {
    False,
    True,
    Oeq,
    One,
    Olt,
    Ole,
    Ogt,
    Oge,
    Ord,
    Uno,
    Ueq,
    Une,
    Ult,
    Ule,
    Ugt,
    Uge,
}

/// Conversion operators.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    FpTrunc,
    FpExt,
    FpToUi,
    FpToSi,
    UiToFp,
    SiToFp,
    PtrToInt,
    IntToPtr,
    BitCast,
}

/// The instruction set.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Two-operand arithmetic at the given type.
    Bin {
        /// The operator.
        op: BinArith,
        /// Operand type.
        ty: Ty,
        /// Left operand.
        lhs: Operand,
        /// Right operand.
        rhs: Operand,
    },
    /// Integer or pointer comparison producing an i1.
    ICmp {
        /// The predicate.
        pred: ICmpPred,
        /// Operand type.
        ty: Ty,
        /// Left operand.
        lhs: Operand,
        /// Right operand.
        rhs: Operand,
    },
    /// Floating-point comparison producing an i1.
    FCmp {
        /// The predicate.
        pred: FCmpPred,
        /// Operand type.
        ty: Ty,
        /// Left operand.
        lhs: Operand,
        /// Right operand.
        rhs: Operand,
    },
    /// A conversion between types.
    Cast {
        /// The conversion operator.
        op: CastOp,
        /// Source type.
        from: Ty,
        /// The converted operand.
        value: Operand,
        /// Destination type.
        to: Ty,
    },
    /// Stack allocation of `count` elements of `ty`.
    Alloca {
        /// Element type.
        ty: Ty,
        /// Element count.
        count: Operand,
    },
    /// Load a `ty` from a pointer.
    Load {
        /// Loaded type.
        ty: Ty,
        /// Address operand.
        ptr: Operand,
    },
    /// Store a `ty` to a pointer.
    Store {
        /// Stored type.
        ty: Ty,
        /// The stored value.
        value: Operand,
        /// Address operand.
        ptr: Operand,
    },
    /// Symbolic address arithmetic over a type's layout.
    Gep {
        /// The type the pointer is treated as addressing.
        base: Ty,
        /// Address operand.
        ptr: Operand,
        /// Indices; the first scales by the base type, the rest walk into
        /// arrays and structs.
        indices: Vec<Operand>,
    },
    /// SSA merge; all incoming values are read before any are written.
    Phi {
        /// Value type.
        ty: Ty,
        /// `(value, predecessor block)` pairs.
        incoming: Vec<(Operand, String)>,
    },
    /// Ternary select.
    Select {
        /// Value type.
        ty: Ty,
        /// The i1 condition.
        cond: Operand,
        /// Value when the condition is nonzero.
        on_true: Operand,
        /// Value when the condition is zero.
        on_false: Operand,
    },
    /// A (possibly indirect) call.
    Call {
        /// Return type.
        ret: Ty,
        /// The callee: a `@function` or a pointer-valued local.
        callee: Operand,
        /// Typed arguments.
        args: Vec<(Ty, Operand)>,
    },
    /// A call with explicit normal and unwind continuations.
    Invoke {
        /// Return type.
        ret: Ty,
        /// The callee.
        callee: Operand,
        /// Typed arguments.
        args: Vec<(Ty, Operand)>,
        /// Block to continue in after a normal return.
        normal: String,
        /// Block to continue in when the callee unwinds.
        unwind: String,
    },
    /// Unconditional branch.
    Br {
        /// Destination block.
        dest: String,
    },
    /// Conditional branch.
    CondBr {
        /// The i1 condition.
        cond: Operand,
        /// Destination when nonzero.
        on_true: String,
        /// Destination when zero.
        on_false: String,
    },
    /// Multi-way branch with linear case comparison.
    Switch {
        /// Scrutinee type.
        ty: Ty,
        /// The compared value.
        value: Operand,
        /// Destination when no case matches.
        default: String,
        /// `(case value, destination)` pairs.
        cases: Vec<(i128, String)>,
    },
    /// Branch through a pointer-valued operand holding a block address.
    IndirectBr {
        /// The target address.
        ptr: Operand,
    },
    /// Return from the current function.
    Ret {
        /// The returned value, absent for `ret void`.
        value: Option<(Ty, Operand)>,
    },
    /// Pop frames until an invoke is on top, then take its unwind edge.
    Unwind,
    /// Abort the run with a diagnostic.
    Unreachable,
}

impl Op {
    /// Whether this operation ends a basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Op::Br { .. }
                | Op::CondBr { .. }
                | Op::Switch { .. }
                | Op::IndirectBr { .. }
                | Op::Ret { .. }
                | Op::Unwind
                | Op::Unreachable
        )
    }
}

/// The position of an instruction inside a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstPos {
    /// Function index.
    pub func: usize,
    /// Block index within the function.
    pub block: usize,
    /// Instruction index within the block.
    pub idx: usize,
}

impl Module {
    /// Find a function index by name.
    pub fn func(&self, name: &str) -> Option<usize> {
        self.funcs.iter().position(|f| f.name == name)
    }

    /// Find a global variable by name.
    pub fn global(&self, name: &str) -> Option<&GlobalVar> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// Assign stable labels 1.. to every instruction in program order and
    /// return the number assigned. Called once, right after loading.
    pub fn assign_labels(&mut self) -> u32 {
        let mut label = 0;
        for f in &mut self.funcs {
            for b in &mut f.blocks {
                for i in &mut b.insts {
                    label += 1;
                    i.label = label;
                }
            }
        }
        label
    }

    /// Locate the instruction with the given (nonzero) label.
    pub fn find_label(&self, label: u32) -> Option<InstPos> {
        if label == 0 {
            return None;
        }
        for (fi, f) in self.funcs.iter().enumerate() {
            for (bi, b) in f.blocks.iter().enumerate() {
                for (ii, inst) in b.insts.iter().enumerate() {
                    if inst.label == label {
                        return Some(InstPos {
                            func: fi,
                            block: bi,
                            idx: ii,
                        });
                    }
                }
            }
        }
        None
    }

    /// Insert an instruction immediately after the given position.
    pub fn insert_after(&mut self, pos: InstPos, inst: Inst) {
        self.funcs[pos.func].blocks[pos.block]
            .insts
            .insert(pos.idx + 1, inst);
    }

    /// The instruction at a position.
    pub fn inst(&self, pos: InstPos) -> &Inst {
        &self.funcs[pos.func].blocks[pos.block].insts[pos.idx]
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", crate::printer::fmt(self))
    }
}
