// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! The instruction interpreter.
//!
//! One `Interp` executes one run: it owns the guest memory, the thread
//! stacks, the store buffers, both trace logs and the scheduler, and walks
//! the module (read-only) one instruction per scheduler tick until no
//! thread is enabled or the guest faults.

use crate::buffer::{StoreBuffers, TsoEntry};
use crate::conf::{Conf, Wmm};
use crate::history::History;
use crate::mem::Memory;
use crate::rwlog::{RwKind, RwLog};
use crate::sched::{Action, SchedError, SchedInputs, Scheduler};
use crate::thread::{CallerSite, Frame, ThreadId, ThreadKey, ThreadKeys};
use ir::syntax::*;
use ir::types::Ty;
use ir::value::{f64_to_fp80, fp80_to_f64, IntValue, Value};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Function addresses live in their own reserved range, disjoint from every
/// allocation the memory substrate can hand out.
const FUNC_BASE: u64 = 1 << 40;
/// Block addresses (for `indirectbr`) live above the function range.
const BLOCK_BASE: u64 = 1 << 41;

/// A host-level interpretation failure. Guest-level misbehavior (failed
/// asserts, segmentation faults) is *not* an error; it ends the run and
/// feeds the checker.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The entry function does not exist.
    #[error("'{0}' function not found in module")]
    EntryNotFound(String),
    /// An operand named an undefined local.
    #[error("use of undefined local %{0}")]
    UndefinedLocal(String),
    /// An operand named an undefined global or function.
    #[error("use of undefined global @{0}")]
    UndefinedGlobal(String),
    /// An indirect call through a value that is not a function address.
    #[error("called value {0:#x} is not a function")]
    NotAFunction(u64),
    /// A branch to a block that does not exist.
    #[error("branch to unknown block %{0}")]
    BadBlock(String),
    /// A phi node with no entry for the predecessor block.
    #[error("phi node has no entry for predecessor %{0}")]
    NoPhiEntry(String),
    /// An operand had the wrong value kind for its instruction.
    #[error("type error: {0}")]
    TypeMismatch(String),
    /// Integer division by zero.
    #[error("integer division by zero")]
    DivisionByZero,
    /// An intrinsic was called with the wrong number of arguments.
    #[error("not the right number of parameters for {0}")]
    IntrinsicArgs(&'static str),
    /// Something the interpreter does not model.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// memcpy32 through the store buffer requires 4-byte strides.
    #[error("unaligned type is on the buffer")]
    UnalignedCopy,
    /// The guest executed an `unreachable` instruction.
    #[error("program executed an 'unreachable' instruction")]
    GuestUnreachable,
    /// A block ended without a terminator.
    #[error("control fell off the end of block %{0}")]
    FellOffBlock(String),
    /// Unwinding emptied the stack without finding an invoke.
    #[error("empty stack during unwind")]
    EmptyStackDuringUnwind,
    /// A wrong number of arguments was passed to a guest function.
    #[error("invalid number of values passed to function invocation")]
    ArgCount,
    /// See [`SchedError`].
    #[error("{0}")]
    Sched(#[from] SchedError),
}

/// Classification of the last executed instruction, consumed by the
/// scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastInstr {
    /// The instruction blocked (a waiting join).
    pub blocked: bool,
    /// The instruction touched shared memory.
    pub shared: bool,
}

/// Everything one finished run leaves behind.
#[derive(Debug)]
pub struct RunTrace {
    /// The invocation history.
    pub history: History,
    /// The shared read/write log.
    pub rwlog: RwLog,
    /// The guest hit a segmentation fault (stale pointer, bad CAS, failed
    /// assert_exist).
    pub seg_fault: bool,
    /// Some run used assert_exist, so permutation checking is skipped.
    pub assert_exist_used: bool,
    /// The bootstrap thread's return value.
    pub exit_value: Option<Value>,
    /// One past the last allocated thread tag.
    pub next_thread: u32,
    /// Executed instruction count.
    pub steps: u64,
}

/// The interpreter state for a single run.
pub struct Interp<'m> {
    module: &'m Module,
    conf: &'m Conf,
    mem: Memory,
    globals: HashMap<String, u64>,
    stacks: BTreeMap<ThreadId, Vec<Frame>>,
    cur: ThreadId,
    next_thread: u32,
    buffers: StoreBuffers,
    keys: ThreadKeys,
    history: History,
    rwlog: RwLog,
    sched: Scheduler,
    rng: StdRng,
    last: LastInstr,
    seg_fault: bool,
    assert_exist_used: bool,
    exit_value: Option<Value>,
    steps: u64,
}

impl<'m> Interp<'m> {
    /// Build an interpreter over `module`: emit globals into memory and
    /// seed the scheduler and the guest-visible RNG.
    pub fn new(module: &'m Module, conf: &'m Conf, seed: u64) -> Interp<'m> {
        let mut mem = Memory::new();
        let mut globals = HashMap::new();
        for g in &module.globals {
            let addr = mem.alloc(g.ty.alloc_size());
            init_global(&mut mem, addr, &g.ty, &g.init);
            globals.insert(g.name.clone(), addr);
        }
        Interp {
            module,
            conf,
            mem,
            globals,
            stacks: BTreeMap::new(),
            cur: ThreadId(1),
            next_thread: 2,
            buffers: StoreBuffers::default(),
            keys: ThreadKeys::new(),
            history: History::new(conf.recorded.clone(), conf.rec_trace()),
            rwlog: RwLog::new(conf.logging),
            sched: Scheduler::new(conf.scheduler, seed),
            rng: StdRng::seed_from_u64(seed ^ 0x9e3779b97f4a7c15),
            last: LastInstr::default(),
            seg_fault: false,
            assert_exist_used: false,
            exit_value: None,
            steps: 0,
        }
    }

    /// Run `entry` with the given arguments until no thread is enabled or
    /// the guest faults, and hand back the trace.
    pub fn run(mut self, entry: &str, args: Vec<Value>) -> Result<RunTrace, ExecError> {
        let fidx = self
            .module
            .func(entry)
            .ok_or_else(|| ExecError::EntryNotFound(entry.to_string()))?;
        // like the original runFunction: never pass more arguments than the
        // entry declares
        let wanted = self.module.funcs[fidx].params.len();
        let args: Vec<Value> = args.into_iter().take(wanted).collect();
        if args.len() < wanted {
            return Err(ExecError::ArgCount);
        }
        self.push_frame(ThreadId(1), fidx, args)?;

        loop {
            let enabled = self.active_threads();
            if enabled.is_empty() {
                self.flush_all();
                break;
            }
            let pso_addrs: BTreeMap<ThreadId, Vec<u64>> = if self.conf.wmm == Wmm::Pso {
                enabled
                    .iter()
                    .map(|t| (*t, self.buffers.pso_nonempty_addrs(*t)))
                    .collect()
            } else {
                BTreeMap::new()
            };
            let action = self.sched.select(&SchedInputs {
                enabled: &enabled,
                current: self.cur,
                blocked: self.last.blocked,
                shared: self.last.shared,
                wmm: self.conf.wmm,
                flush_prob: self.conf.flush_prob,
                pso_addrs: &pso_addrs,
            })?;
            match action {
                Action::Switch(t) => {
                    self.cur = t;
                    self.step()?;
                }
                Action::FlushTso(t) => {
                    self.flush_one_tso(t);
                    self.rwlog.record_flush_tso(t);
                }
                Action::FlushPso(t, addr) => {
                    self.flush_one_pso(t, addr);
                    self.rwlog.record_flush_pso(RwKind::FlushRandomPso, t, addr);
                }
                Action::NoAction => {}
            }
            if self.seg_fault {
                println!("ERROR: Segmentation Fault!!! Exit!");
                log::debug!(
                    "guest segmentation fault on thread {} after {} steps",
                    self.cur,
                    self.steps
                );
                break;
            }
        }

        Ok(RunTrace {
            history: self.history,
            rwlog: self.rwlog,
            seg_fault: self.seg_fault,
            assert_exist_used: self.assert_exist_used,
            exit_value: self.exit_value,
            next_thread: self.next_thread,
            steps: self.steps,
        })
    }

    /// Run an entry point with a C-style `(argc, argv)` convention when it
    /// declares parameters; guest argv strings are copied into guest
    /// memory.
    pub fn run_main(mut self, entry: &str, argv: &[String]) -> Result<RunTrace, ExecError> {
        let fidx = self
            .module
            .func(entry)
            .ok_or_else(|| ExecError::EntryNotFound(entry.to_string()))?;
        let nparams = self.module.funcs[fidx].params.len();
        let mut args = vec![];
        if nparams >= 1 {
            args.push(Value::Int(IntValue::from_i128(32, argv.len() as i128)));
        }
        if nparams >= 2 {
            let mut ptrs = vec![];
            for s in argv {
                let p = self.mem.alloc(s.len() as u64 + 1);
                self.mem.write_bytes(p, s.as_bytes());
                ptrs.push(p);
            }
            let arr = self.mem.alloc(8 * (ptrs.len() as u64 + 1));
            for (i, p) in ptrs.iter().enumerate() {
                self.mem.store(&Ty::Ptr, arr + 8 * i as u64, &Value::Ptr(*p));
            }
            args.push(Value::Ptr(arr));
        }
        self.run(entry, args)
    }

    // ----- thread and frame plumbing -----

    fn active_threads(&self) -> Vec<ThreadId> {
        self.stacks
            .iter()
            .filter(|(_, s)| !s.is_empty())
            .map(|(t, _)| *t)
            .collect()
    }

    fn frame(&self) -> &Frame {
        self.stacks[&self.cur].last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.stacks.get_mut(&self.cur).unwrap().last_mut().unwrap()
    }

    fn push_frame(&mut self, t: ThreadId, fidx: usize, args: Vec<Value>) -> Result<(), ExecError> {
        let func = &self.module.funcs[fidx];
        if func.is_decl() {
            return Err(ExecError::Unsupported(format!(
                "call to external function @{}",
                func.name
            )));
        }
        if args.len() < func.params.len() {
            return Err(ExecError::ArgCount);
        }
        let mut frame = Frame::new(fidx);
        for ((name, _), v) in func.params.iter().zip(args.iter()) {
            frame.locals.insert(name.clone(), v.clone());
        }
        if args.len() > func.params.len() {
            frame.varargs = args[func.params.len()..].to_vec();
        }
        self.stacks.entry(t).or_default().push(frame);
        Ok(())
    }

    fn is_on_stack(&self, addr: u64) -> bool {
        self.stacks
            .get(&self.cur)
            .is_some_and(|frames| frames.iter().any(|f| f.owns_alloca(addr)))
    }

    fn func_addr(&self, fidx: usize) -> u64 {
        FUNC_BASE + (fidx as u64) * 16
    }

    fn func_of_addr(&self, addr: u64) -> Option<usize> {
        if !(FUNC_BASE..BLOCK_BASE).contains(&addr) || (addr - FUNC_BASE) % 16 != 0 {
            return None;
        }
        let idx = ((addr - FUNC_BASE) / 16) as usize;
        (idx < self.module.funcs.len()).then_some(idx)
    }

    fn block_addr(&self, fidx: usize, bidx: usize) -> u64 {
        BLOCK_BASE | ((fidx as u64) << 20) | bidx as u64
    }

    fn block_of_addr(&self, addr: u64) -> Option<(usize, usize)> {
        if addr < BLOCK_BASE {
            return None;
        }
        let rest = addr - BLOCK_BASE;
        let fidx = (rest >> 20) as usize;
        let bidx = (rest & ((1 << 20) - 1)) as usize;
        let f = self.module.funcs.get(fidx)?;
        (bidx < f.blocks.len()).then_some((fidx, bidx))
    }

    // ----- operand evaluation -----

    fn eval(&self, ty: &Ty, op: &Operand) -> Result<Value, ExecError> {
        match op {
            Operand::Const(Constant::Int(n)) => Ok(match ty {
                Ty::Int(w) => Value::Int(IntValue::from_i128(*w, *n)),
                Ty::Ptr => Value::Ptr(*n as u64),
                Ty::Float => Value::Float(*n as f32),
                Ty::Double => Value::Double(*n as f64),
                Ty::Fp80 => Value::Fp80(f64_to_fp80(*n as f64)),
                _ => {
                    return Err(ExecError::TypeMismatch(format!(
                        "integer constant at type {ty}"
                    )))
                }
            }),
            Operand::Const(Constant::Float(x)) => Ok(match ty {
                Ty::Float => Value::Float(*x as f32),
                Ty::Double => Value::Double(*x),
                Ty::Fp80 => Value::Fp80(f64_to_fp80(*x)),
                _ => {
                    return Err(ExecError::TypeMismatch(format!(
                        "float constant at type {ty}"
                    )))
                }
            }),
            Operand::Const(Constant::Null) => Ok(Value::Ptr(0)),
            Operand::Const(Constant::BlockAddr(f, b)) => {
                let fidx = self
                    .module
                    .func(f)
                    .ok_or_else(|| ExecError::UndefinedGlobal(f.clone()))?;
                let bidx = self.module.funcs[fidx]
                    .block(b)
                    .ok_or_else(|| ExecError::BadBlock(b.clone()))?;
                Ok(Value::Ptr(self.block_addr(fidx, bidx)))
            }
            Operand::Local(name) => self
                .frame()
                .locals
                .get(name)
                .cloned()
                .ok_or_else(|| ExecError::UndefinedLocal(name.clone())),
            Operand::Global(name) => {
                if let Some(addr) = self.globals.get(name) {
                    Ok(Value::Ptr(*addr))
                } else if let Some(fidx) = self.module.func(name) {
                    Ok(Value::Ptr(self.func_addr(fidx)))
                } else {
                    Err(ExecError::UndefinedGlobal(name.clone()))
                }
            }
        }
    }

    fn eval_addr(&self, op: &Operand) -> Result<u64, ExecError> {
        match self.eval(&Ty::Ptr, op)? {
            Value::Ptr(p) => Ok(p),
            Value::Int(v) => Ok(v.as_u64()),
            v => Err(ExecError::TypeMismatch(format!("{v} used as an address"))),
        }
    }

    fn set(&mut self, result: &Option<String>, v: Value) {
        if let Some(name) = result {
            self.frame_mut().locals.insert(name.clone(), v);
        }
    }

    // ----- the per-tick step -----

    fn step(&mut self) -> Result<(), ExecError> {
        self.last = LastInstr::default();
        let (fidx, bidx, iidx) = {
            let fr = self.frame();
            (fr.func, fr.block, fr.inst)
        };
        let block = &self.module.funcs[fidx].blocks[bidx];
        let inst = block
            .insts
            .get(iidx)
            .cloned()
            .ok_or_else(|| ExecError::FellOffBlock(block.name.clone()))?;
        self.frame_mut().inst += 1;
        self.steps += 1;
        self.exec_op(inst.label, &inst.result, inst.op)
    }

    fn exec_op(&mut self, label: u32, result: &Option<String>, op: Op) -> Result<(), ExecError> {
        match op {
            Op::Bin { op, ty, lhs, rhs } => {
                let a = self.eval(&ty, &lhs)?;
                let b = self.eval(&ty, &rhs)?;
                let v = binary_op(op, &ty, &a, &b)?;
                self.set(result, v);
                Ok(())
            }
            Op::ICmp { pred, ty, lhs, rhs } => {
                let a = self.eval(&ty, &lhs)?;
                let b = self.eval(&ty, &rhs)?;
                let v = icmp_values(pred, &a, &b)?;
                self.set(result, Value::Int(IntValue::bool(v)));
                Ok(())
            }
            Op::FCmp { pred, ty, lhs, rhs } => {
                let a = self.eval(&ty, &lhs)?;
                let b = self.eval(&ty, &rhs)?;
                let v = fcmp_values(pred, &a, &b)?;
                self.set(result, Value::Int(IntValue::bool(v)));
                Ok(())
            }
            Op::Cast {
                op,
                from,
                value,
                to,
            } => {
                let v = self.eval(&from, &value)?;
                let v = cast_value(op, &v, &to)?;
                self.set(result, v);
                Ok(())
            }
            Op::Alloca { ty, count } => {
                let n = self
                    .eval(&Ty::Int(64), &count)?
                    .as_int()
                    .map(|v| v.as_u64())
                    .ok_or_else(|| ExecError::TypeMismatch("alloca count".to_string()))?;
                let size = (ty.alloc_size() * n).max(1);
                let addr = self.mem.alloc(size);
                self.frame_mut().allocas.push((addr, size));
                self.set(result, Value::Ptr(addr));
                Ok(())
            }
            Op::Load { ty, ptr } => self.exec_load(label, result, &ty, &ptr),
            Op::Store { ty, value, ptr } => self.exec_store(label, &ty, &value, &ptr),
            Op::Gep { base, ptr, indices } => {
                let addr = self.eval_addr(&ptr)?;
                let off = self.gep_offset(&base, &indices)?;
                self.set(result, Value::Ptr(addr.wrapping_add(off as u64)));
                Ok(())
            }
            Op::Phi { .. } => Err(ExecError::TypeMismatch(
                "phi node outside block entry".to_string(),
            )),
            Op::Select {
                ty,
                cond,
                on_true,
                on_false,
            } => {
                let c = self.eval(&Ty::Int(1), &cond)?;
                let v = if c.truthy() {
                    self.eval(&ty, &on_true)?
                } else {
                    self.eval(&ty, &on_false)?
                };
                self.set(result, v);
                Ok(())
            }
            Op::Call { ret, callee, args } => {
                self.exec_call(label, result, ret, &callee, &args, None)
            }
            Op::Invoke {
                ret,
                callee,
                args,
                normal,
                unwind,
            } => self.exec_call(label, result, ret, &callee, &args, Some((normal, unwind))),
            Op::Br { dest } => self.switch_to_block(&dest),
            Op::CondBr {
                cond,
                on_true,
                on_false,
            } => {
                let c = self.eval(&Ty::Int(1), &cond)?;
                let dest = if c.truthy() { on_true } else { on_false };
                self.switch_to_block(&dest)
            }
            Op::Switch {
                ty,
                value,
                default,
                cases,
            } => {
                let v = self.eval(&ty, &value)?;
                let v = v
                    .as_int()
                    .ok_or_else(|| ExecError::TypeMismatch("switch scrutinee".to_string()))?;
                let width = v.width();
                let hit = cases
                    .iter()
                    .find(|(n, _)| IntValue::from_i128(width, *n) == *v)
                    .map(|(_, b)| b.clone())
                    .unwrap_or(default);
                self.switch_to_block(&hit)
            }
            Op::IndirectBr { ptr } => {
                let addr = self.eval_addr(&ptr)?;
                let (fidx, bidx) = self
                    .block_of_addr(addr)
                    .ok_or(ExecError::NotAFunction(addr))?;
                if fidx != self.frame().func {
                    return Err(ExecError::TypeMismatch(
                        "indirectbr into another function".to_string(),
                    ));
                }
                let dest = self.module.funcs[fidx].blocks[bidx].name.clone();
                self.switch_to_block(&dest)
            }
            Op::Ret { value } => {
                let v = match value {
                    Some((t, o)) => Some(self.eval(&t, &o)?),
                    None => None,
                };
                let fname = self.module.funcs[self.frame().func].name.clone();
                self.history.record_return(&fname, self.cur, v.as_ref());
                self.pop_and_return(v)
            }
            Op::Unwind => self.exec_unwind(),
            Op::Unreachable => Err(ExecError::GuestUnreachable),
        }
    }

    fn gep_offset(&self, base: &Ty, indices: &[Operand]) -> Result<i64, ExecError> {
        let mut it = indices.iter();
        let first = it.next().ok_or_else(|| {
            ExecError::TypeMismatch("getelementptr without indices".to_string())
        })?;
        let idx0 = self
            .eval(&Ty::Int(64), first)?
            .as_int()
            .map(|v| v.as_i128() as i64)
            .ok_or_else(|| ExecError::TypeMismatch("gep index".to_string()))?;
        let mut total = idx0 * base.alloc_size() as i64;
        let mut cur = base.clone();
        for idx_op in it {
            let idx = self
                .eval(&Ty::Int(64), idx_op)?
                .as_int()
                .map(|v| v.as_i128() as i64)
                .ok_or_else(|| ExecError::TypeMismatch("gep index".to_string()))?;
            match cur {
                Ty::Array(_, elem) => {
                    total += idx * elem.alloc_size() as i64;
                    cur = *elem;
                }
                Ty::Struct(_) => {
                    let (off, fty) = cur.field(idx as u64).ok_or_else(|| {
                        ExecError::TypeMismatch("gep struct index out of range".to_string())
                    })?;
                    let fty = fty.clone();
                    total += off as i64;
                    cur = fty;
                }
                other => {
                    return Err(ExecError::TypeMismatch(format!(
                        "getelementptr into scalar type {other}"
                    )))
                }
            }
        }
        Ok(total)
    }

    // ----- loads and stores under the three memory models -----

    fn exec_store(
        &mut self,
        label: u32,
        ty: &Ty,
        value: &Operand,
        ptr: &Operand,
    ) -> Result<(), ExecError> {
        let v = self.eval(ty, value)?;
        let addr = self.eval_addr(ptr)?;
        let on_stack = self.is_on_stack(addr);

        match self.conf.wmm {
            Wmm::None => {
                if !self.mem.store(ty, addr, &v) {
                    self.seg_fault = true;
                    return Ok(());
                }
                if !on_stack {
                    self.rwlog
                        .record_access(RwKind::Write, self.cur, addr, val_image(&v), label as i32);
                    self.last.shared = true;
                }
            }
            Wmm::Tso => {
                if on_stack {
                    if !self.mem.store(ty, addr, &v) {
                        self.seg_fault = true;
                    }
                    return Ok(());
                }
                self.buffers.tso_push(
                    self.cur,
                    TsoEntry {
                        addr,
                        value: v.clone(),
                        ty: ty.clone(),
                    },
                );
                self.rwlog
                    .record_access(RwKind::Write, self.cur, addr, val_image(&v), label as i32);
                self.last.shared = true;
            }
            Wmm::Pso => {
                if on_stack {
                    if !self.mem.store(ty, addr, &v) {
                        self.seg_fault = true;
                    }
                    return Ok(());
                }
                self.buffers.pso_push(self.cur, addr, v.clone(), ty.clone());
                self.rwlog
                    .record_access(RwKind::Write, self.cur, addr, val_image(&v), label as i32);
                self.last.shared = true;
            }
        }
        Ok(())
    }

    fn exec_load(
        &mut self,
        label: u32,
        result: &Option<String>,
        ty: &Ty,
        ptr: &Operand,
    ) -> Result<(), ExecError> {
        let addr = self.eval_addr(ptr)?;
        let on_stack = self.is_on_stack(addr);

        let buffered = match self.conf.wmm {
            Wmm::None => None,
            Wmm::Tso => self.buffers.tso_lookup(self.cur, addr).cloned(),
            Wmm::Pso => self.buffers.pso_newest(self.cur, addr).cloned(),
        };

        if let Some(v) = buffered {
            // read-own-write from the buffer
            if self.conf.wmm == Wmm::Pso && !on_stack && self.mem.base_of(addr).is_none() {
                self.seg_fault = true;
                return Ok(());
            }
            self.rwlog
                .record_access(RwKind::Read, self.cur, addr, val_image(&v), label as i32);
            if self.conf.wmm == Wmm::Pso && !on_stack {
                self.last.shared = true;
            }
            self.set(result, v);
            return Ok(());
        }

        let Some(v) = self.mem.load(ty, addr) else {
            self.seg_fault = true;
            return Ok(());
        };
        if !on_stack {
            self.rwlog
                .record_access(RwKind::Read, self.cur, addr, val_image(&v), label as i32);
            self.last.shared = true;
        }
        self.set(result, v);
        Ok(())
    }

    // ----- buffer flushing and fences -----

    fn flush_one_tso(&mut self, t: ThreadId) {
        if let Some(e) = self.buffers.tso_pop(t) {
            if self.mem.base_of(e.addr).is_none() {
                self.seg_fault = true;
                return;
            }
            self.mem.store(&e.ty, e.addr, &e.value);
        }
    }

    fn flush_one_pso(&mut self, t: ThreadId, addr: u64) {
        if let Some((v, ty)) = self.buffers.pso_pop(t, addr) {
            if self.mem.base_of(addr).is_none() {
                self.seg_fault = true;
                return;
            }
            self.mem.store(&ty, addr, &v);
        }
    }

    fn drain_tso(&mut self, t: ThreadId) {
        while self.buffers.tso_has_pending(t) {
            self.flush_one_tso(t);
        }
    }

    fn drain_pso_all(&mut self, t: ThreadId) {
        for addr in self.buffers.pso_nonempty_addrs(t) {
            while self.buffers.pso_queue_nonempty(t, addr) {
                self.flush_one_pso(t, addr);
            }
        }
    }

    fn membar_sl(&mut self, t: ThreadId) {
        match self.conf.wmm {
            Wmm::None => println!("warning: membar_sl has no effect on an SC WMM."),
            Wmm::Tso => self.drain_tso(t),
            Wmm::Pso => self.drain_pso_all(t),
        }
        self.rwlog.record_sync(RwKind::FlushFence, t);
    }

    fn membar_ss(&mut self, t: ThreadId) {
        match self.conf.wmm {
            Wmm::None => println!("warning: membar_ss has no effect on an SC WMM."),
            Wmm::Tso => println!("warning: membar_ss has no effect on TSO WMM."),
            Wmm::Pso => self.drain_pso_all(t),
        }
        self.rwlog.record_sync(RwKind::FlushFence, t);
    }

    /// At termination every pending store becomes visible, once per thread,
    /// before the final checker pass.
    fn flush_all(&mut self) {
        if self.conf.wmm == Wmm::None {
            return;
        }
        for tag in 1..self.next_thread {
            let t = ThreadId(tag);
            match self.conf.wmm {
                Wmm::Tso => self.drain_tso(t),
                Wmm::Pso => self.drain_pso_all(t),
                Wmm::None => {}
            }
            self.rwlog.record_sync(RwKind::FlushInstr, t);
        }
    }

    // ----- control flow -----

    fn switch_to_block(&mut self, dest: &str) -> Result<(), ExecError> {
        let module = self.module;
        let (fidx, prev_bidx) = {
            let fr = self.frame();
            (fr.func, fr.block)
        };
        let func = &module.funcs[fidx];
        let prev_name = &func.blocks[prev_bidx].name;
        let bidx = func
            .block(dest)
            .ok_or_else(|| ExecError::BadBlock(dest.to_string()))?;

        // read all phi inputs before writing any, so phis that feed each
        // other update simultaneously
        let mut results = vec![];
        for inst in &func.blocks[bidx].insts {
            let Op::Phi { ty, incoming } = &inst.op else {
                break;
            };
            let (v, _) = incoming
                .iter()
                .find(|(_, b)| b == prev_name)
                .ok_or_else(|| ExecError::NoPhiEntry(prev_name.clone()))?;
            let value = self.eval(ty, v)?;
            let name = inst
                .result
                .clone()
                .ok_or_else(|| ExecError::TypeMismatch("phi without result".to_string()))?;
            results.push((name, value));
        }

        let nphis = results.len();
        let fr = self.frame_mut();
        fr.block = bidx;
        fr.inst = nphis;
        for (name, value) in results {
            fr.locals.insert(name, value);
        }
        Ok(())
    }

    fn pop_and_return(&mut self, v: Option<Value>) -> Result<(), ExecError> {
        let frame = self.stacks.get_mut(&self.cur).unwrap().pop().unwrap();
        for (base, _) in &frame.allocas {
            self.mem.release(*base);
        }

        if self.stacks[&self.cur].is_empty() {
            if self.cur == ThreadId(1) {
                self.exit_value = v;
            }
            return Ok(());
        }

        let site = self.frame_mut().caller.take();
        if let Some(site) = site {
            if site.ret_ty != Ty::Void {
                if let (Some(name), Some(val)) = (site.result, v) {
                    self.frame_mut().locals.insert(name, val);
                }
            }
            if let Some(normal) = site.normal {
                self.switch_to_block(&normal)?;
            }
        }
        Ok(())
    }

    fn exec_unwind(&mut self) -> Result<(), ExecError> {
        loop {
            let frame = self
                .stacks
                .get_mut(&self.cur)
                .unwrap()
                .pop()
                .ok_or(ExecError::EmptyStackDuringUnwind)?;
            for (base, _) in &frame.allocas {
                self.mem.release(*base);
            }
            let Some(top) = self.stacks[&self.cur].last() else {
                return Err(ExecError::EmptyStackDuringUnwind);
            };
            if top.caller.as_ref().is_some_and(|s| s.unwind.is_some()) {
                let site = self.frame_mut().caller.take().unwrap();
                return self.switch_to_block(&site.unwind.unwrap());
            }
        }
    }

    // ----- calls and intrinsics -----

    fn resolve_callee(&self, callee: &Operand) -> Result<String, ExecError> {
        match callee {
            Operand::Global(name) => Ok(name.clone()),
            other => {
                let addr = self.eval_addr(other)?;
                let fidx = self
                    .func_of_addr(addr)
                    .ok_or(ExecError::NotAFunction(addr))?;
                Ok(self.module.funcs[fidx].name.clone())
            }
        }
    }

    fn exec_call(
        &mut self,
        label: u32,
        result: &Option<String>,
        ret: Ty,
        callee: &Operand,
        args: &[(Ty, Operand)],
        invoke: Option<(String, String)>,
    ) -> Result<(), ExecError> {
        let name = self.resolve_callee(callee)?;
        let argv = args
            .iter()
            .map(|(t, o)| self.eval(t, o))
            .collect::<Result<Vec<_>, _>>()?;

        if self.exec_intrinsic(&name, label, result, &argv)? {
            // invoking an intrinsic still takes the normal edge
            if let Some((normal, _)) = invoke {
                self.switch_to_block(&normal)?;
            }
            return Ok(());
        }

        let fidx = self
            .module
            .func(&name)
            .ok_or_else(|| ExecError::UndefinedGlobal(name.clone()))?;
        self.history.record_call(&name, self.cur, &argv);
        let (normal, unwind) = match invoke {
            Some((n, u)) => (Some(n), Some(u)),
            None => (None, None),
        };
        self.frame_mut().caller = Some(CallerSite {
            result: result.clone(),
            ret_ty: ret,
            normal,
            unwind,
        });
        self.push_frame(self.cur, fidx, argv)
    }

    /// Dispatch an intrinsic by name. Returns false when the name is not an
    /// intrinsic and should be executed as IR.
    fn exec_intrinsic(
        &mut self,
        name: &str,
        label: u32,
        result: &Option<String>,
        args: &[Value],
    ) -> Result<bool, ExecError> {
        match name {
            "spawn_thread" => self.intr_spawn(args)?,
            "join_all" => self.intr_join_all(args)?,
            "assert" => self.intr_assert(args)?,
            "assert_exist" => self.intr_assert_exist(args)?,
            "cas32" => self.intr_cas(label, result, args, false)?,
            "casio" => self.intr_cas(label, result, args, true)?,
            "caspo" => self.intr_caspo(result, args)?,
            "fasio" => self.intr_fasio(args)?,
            "faspo" => self.intr_faspo(result, args)?,
            "membar_sl" => self.membar_sl(self.cur),
            "membar_ss" => self.membar_ss(self.cur),
            "malloc" => self.intr_malloc(result, args)?,
            "free" => self.intr_free(args)?,
            "memset" => self.intr_memset(result, args)?,
            "memcpy32" => self.intr_memcpy32(label, result, args)?,
            "nprint_string" => self.intr_nprint_string(args)?,
            "nprint_int" => self.intr_nprint_int(args)?,
            "getenv" => self.intr_getenv(result, args)?,
            "rand" => {
                let r = (self.rng.gen::<u32>() >> 1) as i128;
                self.set(result, Value::Int(IntValue::from_i128(32, r)));
            }
            "sysconf" => self.intr_sysconf(result, args)?,
            "mmap" => self.intr_mmap(result, args)?,
            "munmap" => self.intr_munmap(result, args)?,
            "pthread_self" => {
                let t = self.cur.0 as i128;
                self.set(result, Value::Int(IntValue::from_i128(32, t)));
            }
            "key_create" => self.intr_key_create(result, args)?,
            "key_getspecific" => self.intr_key_getspecific(result, args)?,
            "key_setspecific" => self.intr_key_setspecific(args)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn intr_spawn(&mut self, args: &[Value]) -> Result<(), ExecError> {
        let [fp] = args else {
            return Err(ExecError::IntrinsicArgs("spawn_thread"));
        };
        let addr = fp
            .as_ptr()
            .ok_or_else(|| ExecError::TypeMismatch("spawn_thread argument".to_string()))?;
        let fidx = self
            .func_of_addr(addr)
            .ok_or(ExecError::NotAFunction(addr))?;
        let tag = ThreadId(self.next_thread);
        self.next_thread += 1;
        log::debug!("spawning thread {tag} running @{}", self.module.funcs[fidx].name);
        self.push_frame(tag, fidx, vec![])?;
        self.rwlog.record_sync(RwKind::Spawn, self.cur);
        Ok(())
    }

    fn intr_join_all(&mut self, args: &[Value]) -> Result<(), ExecError> {
        if !args.is_empty() {
            return Err(ExecError::IntrinsicArgs("join_all"));
        }
        let live = self.stacks.values().filter(|s| !s.is_empty()).count();
        if live > 1 {
            // still waiting: rewind so the join retries on the next tick
            self.last.blocked = true;
            self.frame_mut().inst -= 1;
        } else {
            self.rwlog.record_sync(RwKind::Join, self.cur);
        }
        Ok(())
    }

    fn intr_assert(&mut self, args: &[Value]) -> Result<(), ExecError> {
        let cond = args
            .first()
            .and_then(Value::as_int)
            .ok_or(ExecError::IntrinsicArgs("assert"))?;
        if cond.is_zero() {
            match args.get(1).and_then(Value::as_ptr) {
                Some(p) => match self.mem.read_cstr(p) {
                    Some(msg) => println!("Assert failed: {msg}"),
                    None => println!("Assert failed!"),
                },
                None => println!("Assert failed!"),
            }
        }
        Ok(())
    }

    fn intr_assert_exist(&mut self, args: &[Value]) -> Result<(), ExecError> {
        self.assert_exist_used = true;
        let [ptr, len, val] = args else {
            return Err(ExecError::IntrinsicArgs("assert_exist"));
        };
        let base = ptr
            .as_ptr()
            .ok_or_else(|| ExecError::TypeMismatch("assert_exist pointer".to_string()))?;
        let len = len
            .as_int()
            .map(|v| v.as_u64())
            .ok_or(ExecError::IntrinsicArgs("assert_exist"))?;
        let val = val
            .as_int()
            .map(|v| v.as_i128())
            .ok_or(ExecError::IntrinsicArgs("assert_exist"))?;

        let mut found = false;
        for i in 0..len {
            match self.mem.load(&Ty::Int(32), base + 4 * i) {
                Some(Value::Int(v)) if v.as_i128() == val => {
                    found = true;
                    break;
                }
                Some(_) => {}
                None => {
                    self.seg_fault = true;
                    return Ok(());
                }
            }
        }
        if !found {
            self.seg_fault = true;
        }
        Ok(())
    }

    fn intr_cas(
        &mut self,
        label: u32,
        result: &Option<String>,
        args: &[Value],
        fetch_old: bool,
    ) -> Result<(), ExecError> {
        let [ptr, expect, new] = args else {
            return Err(ExecError::IntrinsicArgs("cas32"));
        };
        let addr = ptr
            .as_ptr()
            .ok_or_else(|| ExecError::TypeMismatch("cas pointer".to_string()))?;

        // a CAS is sequentially consistent with this thread's prior stores:
        // TSO drains everything, PSO drains this address's queue
        match self.conf.wmm {
            Wmm::None => {}
            Wmm::Tso => self.drain_tso(self.cur),
            Wmm::Pso => {
                while self.buffers.pso_queue_nonempty(self.cur, addr) {
                    self.flush_one_pso(self.cur, addr);
                }
            }
        }

        if self.mem.base_of(addr).is_none() {
            self.seg_fault = true;
            return Ok(());
        }
        let Some(Value::Int(old)) = self.mem.load(&Ty::Int(32), addr) else {
            self.seg_fault = true;
            return Ok(());
        };
        let expect = expect.as_int().ok_or(ExecError::IntrinsicArgs("cas32"))?;
        let new = new.as_int().ok_or(ExecError::IntrinsicArgs("cas32"))?;

        let ret;
        if fetch_old {
            ret = old;
            if old == *expect {
                return Err(ExecError::Unsupported(
                    "casio would swap; its store half is not modeled".to_string(),
                ));
            }
        } else if old == *expect {
            self.mem.store(&Ty::Int(32), addr, &Value::Int(*new));
            ret = IntValue::from_i128(32, 1);
            match self.conf.wmm {
                Wmm::Tso => {
                    self.rwlog
                        .record_access(RwKind::Write, self.cur, addr, new.as_u64(), 0)
                }
                Wmm::Pso => self.rwlog.record_access(
                    RwKind::Write,
                    self.cur,
                    addr,
                    new.as_u64(),
                    label as i32,
                ),
                Wmm::None => {}
            }
        } else {
            ret = IntValue::from_i128(32, 0);
        }

        match self.conf.wmm {
            Wmm::Tso => self.rwlog.record_sync(RwKind::FlushCasTso, self.cur),
            Wmm::Pso => self
                .rwlog
                .record_flush_pso(RwKind::FlushCasPso, self.cur, addr),
            Wmm::None => {}
        }
        self.set(result, Value::Int(ret));
        Ok(())
    }

    fn intr_caspo(&mut self, result: &Option<String>, args: &[Value]) -> Result<(), ExecError> {
        self.membar_sl(self.cur);
        let [ptr, expect, new] = args else {
            return Err(ExecError::IntrinsicArgs("caspo"));
        };
        let addr = ptr
            .as_ptr()
            .ok_or_else(|| ExecError::TypeMismatch("caspo pointer".to_string()))?;
        if self.conf.wmm == Wmm::Pso {
            while self.buffers.pso_queue_nonempty(self.cur, addr) {
                self.flush_one_pso(self.cur, addr);
            }
        }
        let Some(Value::Ptr(old)) = self.mem.load(&Ty::Ptr, addr) else {
            self.seg_fault = true;
            return Ok(());
        };
        let expect = expect.as_ptr().ok_or(ExecError::IntrinsicArgs("caspo"))?;
        let new = new.as_ptr().ok_or(ExecError::IntrinsicArgs("caspo"))?;
        if old == expect {
            self.mem.store(&Ty::Ptr, addr, &Value::Ptr(new));
        }
        self.set(result, Value::Ptr(old));
        Ok(())
    }

    fn intr_fasio(&mut self, _args: &[Value]) -> Result<(), ExecError> {
        if self.conf.wmm != Wmm::None {
            return Err(ExecError::Unsupported(
                "fasio unsupported under TSO or PSO".to_string(),
            ));
        }
        Ok(())
    }

    fn intr_faspo(&mut self, result: &Option<String>, args: &[Value]) -> Result<(), ExecError> {
        if self.conf.wmm == Wmm::Tso {
            self.membar_sl(self.cur);
        }
        let [ptr, new] = args else {
            return Err(ExecError::IntrinsicArgs("faspo"));
        };
        let addr = ptr
            .as_ptr()
            .ok_or_else(|| ExecError::TypeMismatch("faspo pointer".to_string()))?;
        let Some(Value::Ptr(old)) = self.mem.load(&Ty::Ptr, addr) else {
            self.seg_fault = true;
            return Ok(());
        };
        let new = new.as_ptr().ok_or(ExecError::IntrinsicArgs("faspo"))?;
        self.mem.store(&Ty::Ptr, addr, &Value::Ptr(new));
        self.set(result, Value::Ptr(old));
        Ok(())
    }

    fn intr_malloc(&mut self, result: &Option<String>, args: &[Value]) -> Result<(), ExecError> {
        let n = args
            .first()
            .and_then(Value::as_int)
            .map(|v| v.as_u64())
            .ok_or(ExecError::IntrinsicArgs("malloc"))?;
        let addr = self.mem.alloc(n);
        self.set(result, Value::Ptr(addr));
        Ok(())
    }

    fn intr_free(&mut self, args: &[Value]) -> Result<(), ExecError> {
        let p = args
            .first()
            .and_then(Value::as_ptr)
            .ok_or(ExecError::IntrinsicArgs("free"))?;
        match self.mem.base_of(p) {
            Some(base) if base == p => {
                self.mem.release(p);
            }
            _ => self.seg_fault = true,
        }
        Ok(())
    }

    fn intr_memset(&mut self, result: &Option<String>, args: &[Value]) -> Result<(), ExecError> {
        let [ptr, value, size] = args else {
            return Err(ExecError::IntrinsicArgs("memset"));
        };
        let addr = ptr.as_ptr().ok_or(ExecError::IntrinsicArgs("memset"))?;
        let byte = value
            .as_int()
            .map(|v| v.as_u64() as u8)
            .ok_or(ExecError::IntrinsicArgs("memset"))?;
        let size = size
            .as_int()
            .map(|v| v.as_u64())
            .ok_or(ExecError::IntrinsicArgs("memset"))?;
        if !self.mem.write_bytes(addr, &vec![byte; size as usize]) {
            self.seg_fault = true;
            return Ok(());
        }
        self.set(result, Value::Ptr(addr));
        Ok(())
    }

    fn intr_memcpy32(
        &mut self,
        label: u32,
        result: &Option<String>,
        args: &[Value],
    ) -> Result<(), ExecError> {
        let [dst, src, size] = args else {
            return Err(ExecError::IntrinsicArgs("memcpy32"));
        };
        let dst = dst.as_ptr().ok_or(ExecError::IntrinsicArgs("memcpy32"))?;
        let src = src.as_ptr().ok_or(ExecError::IntrinsicArgs("memcpy32"))?;
        let size = size
            .as_int()
            .map(|v| v.as_u64())
            .ok_or(ExecError::IntrinsicArgs("memcpy32"))?;

        let direct = self.conf.wmm == Wmm::None || self.is_on_stack(dst);
        if direct {
            match self.mem.read_bytes(src, size) {
                Some(bytes) => {
                    if !self.mem.write_bytes(dst, &bytes) {
                        self.seg_fault = true;
                        return Ok(());
                    }
                }
                None => {
                    self.seg_fault = true;
                    return Ok(());
                }
            }
            self.set(result, Value::Ptr(dst));
            return Ok(());
        }

        // heap destination under a weak model: copy word by word through
        // the store buffer, so the copy is non-atomic like any other store
        let mut pending = vec![];
        let mut offset = 0u64;
        while offset < size {
            let (value, ty) = match self.conf.wmm {
                Wmm::Tso => match self.buffers.tso_lookup_entry(self.cur, src + offset) {
                    Some(e) => (e.value.clone(), e.ty.clone()),
                    None => match self.mem.load(&Ty::Int(32), src + offset) {
                        Some(v) => (v, Ty::Int(32)),
                        None => {
                            self.seg_fault = true;
                            return Ok(());
                        }
                    },
                },
                Wmm::Pso => match self.buffers.pso_newest(self.cur, src + offset) {
                    Some(v) => {
                        let ty = self
                            .buffers
                            .pso_ty(src + offset)
                            .cloned()
                            .unwrap_or(Ty::Int(32));
                        (v.clone(), ty)
                    }
                    None => match self.mem.load(&Ty::Int(32), src + offset) {
                        Some(v) => (v, Ty::Int(32)),
                        None => {
                            self.seg_fault = true;
                            return Ok(());
                        }
                    },
                },
                Wmm::None => unreachable!(),
            };
            if ty.store_size() != 4 {
                return Err(ExecError::UnalignedCopy);
            }
            match self.conf.wmm {
                Wmm::Tso => self.buffers.tso_push(
                    self.cur,
                    TsoEntry {
                        addr: dst + offset,
                        value: value.clone(),
                        ty,
                    },
                ),
                Wmm::Pso => {
                    if self.buffers.pso_queue_nonempty(self.cur, dst + offset)
                        && self.buffers.pso_ty(dst + offset) != Some(&ty)
                    {
                        return Err(ExecError::TypeMismatch(
                            "memcpy32 would mix types in one PSO queue".to_string(),
                        ));
                    }
                    self.buffers.pso_push(self.cur, dst + offset, value.clone(), ty)
                }
                Wmm::None => unreachable!(),
            }
            self.rwlog
                .record_access(RwKind::Read, self.cur, src, val_image(&value), label as i32);
            pending.push(value);
            offset += 4;
        }
        for v in pending {
            self.rwlog
                .record_access(RwKind::Write, self.cur, dst, val_image(&v), label as i32);
        }
        self.set(result, Value::Ptr(dst));
        Ok(())
    }

    fn intr_nprint_string(&mut self, args: &[Value]) -> Result<(), ExecError> {
        let p = args
            .first()
            .and_then(Value::as_ptr)
            .ok_or(ExecError::IntrinsicArgs("nprint_string"))?;
        match self.mem.read_cstr(p) {
            Some(s) => print!("{s}"),
            None => self.seg_fault = true,
        }
        Ok(())
    }

    fn intr_nprint_int(&mut self, args: &[Value]) -> Result<(), ExecError> {
        let [fmt, val] = args else {
            return Err(ExecError::IntrinsicArgs("nprint_int"));
        };
        let p = fmt.as_ptr().ok_or(ExecError::IntrinsicArgs("nprint_int"))?;
        let n = val
            .as_record_int()
            .ok_or(ExecError::IntrinsicArgs("nprint_int"))?;
        match self.mem.read_cstr(p) {
            Some(s) => print!("{}", s.replacen("%d", &n.to_string(), 1)),
            None => self.seg_fault = true,
        }
        Ok(())
    }

    fn intr_getenv(&mut self, result: &Option<String>, args: &[Value]) -> Result<(), ExecError> {
        let p = args
            .first()
            .and_then(Value::as_ptr)
            .ok_or(ExecError::IntrinsicArgs("getenv"))?;
        let Some(name) = self.mem.read_cstr(p) else {
            self.seg_fault = true;
            return Ok(());
        };
        let v = match std::env::var(&name) {
            Ok(v) => {
                let addr = self.mem.alloc(v.len() as u64 + 1);
                self.mem.write_bytes(addr, v.as_bytes());
                Value::Ptr(addr)
            }
            Err(_) => Value::Ptr(0),
        };
        self.set(result, v);
        Ok(())
    }

    fn intr_sysconf(&mut self, result: &Option<String>, args: &[Value]) -> Result<(), ExecError> {
        let name = args
            .first()
            .and_then(Value::as_int)
            .map(|v| v.as_i128())
            .ok_or(ExecError::IntrinsicArgs("sysconf"))?;
        // page size and online processor count are the queries the
        // benchmarks make
        let ret: i128 = match name {
            30 => 4096,
            84 => 2,
            _ => -1,
        };
        self.set(result, Value::Int(IntValue::from_i128(32, ret)));
        Ok(())
    }

    fn intr_mmap(&mut self, result: &Option<String>, args: &[Value]) -> Result<(), ExecError> {
        if args.len() != 6 {
            return Err(ExecError::IntrinsicArgs("mmap"));
        }
        let hint = args[0].as_ptr().unwrap_or(1);
        if hint != 0 {
            return Err(ExecError::Unsupported(
                "mmap with a placement hint".to_string(),
            ));
        }
        let len = args[1]
            .as_int()
            .map(|v| v.as_u64())
            .ok_or(ExecError::IntrinsicArgs("mmap"))?;
        let addr = self.mem.alloc(len);
        self.set(result, Value::Ptr(addr));
        Ok(())
    }

    fn intr_munmap(&mut self, result: &Option<String>, args: &[Value]) -> Result<(), ExecError> {
        let [ptr, _len] = args else {
            return Err(ExecError::IntrinsicArgs("munmap"));
        };
        let p = ptr.as_ptr().ok_or(ExecError::IntrinsicArgs("munmap"))?;
        match self.mem.base_of(p) {
            Some(base) if base == p => {
                self.mem.release(p);
            }
            _ => self.seg_fault = true,
        }
        self.set(result, Value::Int(IntValue::from_i128(32, 0)));
        Ok(())
    }

    fn intr_key_create(&mut self, result: &Option<String>, args: &[Value]) -> Result<(), ExecError> {
        let [key, destructor] = args else {
            return Err(ExecError::IntrinsicArgs("key_create"));
        };
        let key = key.as_ptr().ok_or(ExecError::IntrinsicArgs("key_create"))?;
        let daddr = destructor
            .as_ptr()
            .ok_or(ExecError::IntrinsicArgs("key_create"))?;
        let dest = self
            .func_of_addr(daddr)
            .ok_or(ExecError::NotAFunction(daddr))?;

        // a NULL value for every live thread, the destructor only for the
        // creating one
        for t in self.active_threads() {
            self.keys.insert((t, key), ThreadKey::default());
        }
        self.keys.insert(
            (self.cur, key),
            ThreadKey {
                value: 0,
                destructor: Some(dest),
            },
        );
        self.set(result, Value::Int(IntValue::from_i128(32, 0)));
        Ok(())
    }

    fn intr_key_getspecific(
        &mut self,
        result: &Option<String>,
        args: &[Value],
    ) -> Result<(), ExecError> {
        let key = args
            .first()
            .and_then(Value::as_ptr)
            .ok_or(ExecError::IntrinsicArgs("key_getspecific"))?;
        let value = self
            .keys
            .get(&(self.cur, key))
            .map(|k| k.value)
            .unwrap_or(0);
        self.set(result, Value::Ptr(value));
        Ok(())
    }

    fn intr_key_setspecific(&mut self, args: &[Value]) -> Result<(), ExecError> {
        let [key, value] = args else {
            return Err(ExecError::IntrinsicArgs("key_setspecific"));
        };
        let key = key
            .as_ptr()
            .ok_or(ExecError::IntrinsicArgs("key_setspecific"))?;
        let value = value
            .as_ptr()
            .ok_or(ExecError::IntrinsicArgs("key_setspecific"))?;
        self.keys.entry((self.cur, key)).or_default().value = value;
        Ok(())
    }
}

fn init_global(mem: &mut Memory, addr: u64, ty: &Ty, init: &Init) {
    match init {
        Init::Zero => {}
        Init::Int(n) => {
            let v = match ty {
                Ty::Ptr => Value::Ptr(*n as u64),
                Ty::Int(w) => Value::Int(IntValue::from_i128(*w, *n)),
                _ => panic!("scalar initializer for type {ty}"),
            };
            mem.store(ty, addr, &v);
        }
        Init::Array(vals) => {
            let Ty::Array(_, elem) = ty else {
                panic!("array initializer for type {ty}");
            };
            for (i, n) in vals.iter().enumerate() {
                let v = match elem.as_ref() {
                    Ty::Ptr => Value::Ptr(*n as u64),
                    Ty::Int(w) => Value::Int(IntValue::from_i128(*w, *n)),
                    other => panic!("array initializer for element type {other}"),
                };
                mem.store(elem, addr + i as u64 * elem.alloc_size(), &v);
            }
        }
    }
}

/// The integer image of a value, for the shared-RW log.
fn val_image(v: &Value) -> u64 {
    match v {
        Value::Int(x) => x.as_u64(),
        Value::Ptr(p) => *p,
        Value::Float(x) => x.to_bits() as u64,
        Value::Double(x) => x.to_bits(),
        Value::Fp80(x) => *x as u64,
    }
}

fn float_pair(ty: &Ty, a: &Value, b: &Value) -> Result<(f64, f64), ExecError> {
    let of = |v: &Value| match (ty, v) {
        (Ty::Float, Value::Float(x)) => Some(*x as f64),
        (Ty::Double, Value::Double(x)) => Some(*x),
        (Ty::Fp80, Value::Fp80(x)) => Some(fp80_to_f64(*x)),
        _ => None,
    };
    match (of(a), of(b)) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(ExecError::TypeMismatch(format!(
            "float operation at type {ty}"
        ))),
    }
}

fn float_result(ty: &Ty, x: f64) -> Value {
    match ty {
        Ty::Float => Value::Float(x as f32),
        Ty::Double => Value::Double(x),
        Ty::Fp80 => Value::Fp80(f64_to_fp80(x)),
        _ => unreachable!(),
    }
}

fn binary_op(op: BinArith, ty: &Ty, a: &Value, b: &Value) -> Result<Value, ExecError> {
    use BinArith::*;
    match op {
        FAdd | FSub | FMul | FDiv | FRem => {
            let (x, y) = float_pair(ty, a, b)?;
            let r = match op {
                FAdd => x + y,
                FSub => x - y,
                FMul => x * y,
                FDiv => x / y,
                FRem => x % y,
                _ => unreachable!(),
            };
            Ok(float_result(ty, r))
        }
        _ => {
            let (x, y) = match (a, b) {
                (Value::Int(x), Value::Int(y)) => (x, y),
                _ => {
                    return Err(ExecError::TypeMismatch(format!(
                        "integer operation on {a} and {b}"
                    )))
                }
            };
            let r = match op {
                Add => x.add(y),
                Sub => x.sub(y),
                Mul => x.mul(y),
                UDiv => x.udiv(y).ok_or(ExecError::DivisionByZero)?,
                SDiv => x.sdiv(y).ok_or(ExecError::DivisionByZero)?,
                URem => x.urem(y).ok_or(ExecError::DivisionByZero)?,
                SRem => x.srem(y).ok_or(ExecError::DivisionByZero)?,
                And => x.and(y),
                Or => x.or(y),
                Xor => x.xor(y),
                Shl => x.shl(y),
                LShr => x.lshr(y),
                AShr => x.ashr(y),
                _ => unreachable!(),
            };
            Ok(Value::Int(r))
        }
    }
}

fn icmp_values(pred: ICmpPred, a: &Value, b: &Value) -> Result<bool, ExecError> {
    use ICmpPred::*;
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        return Ok(match pred {
            Eq => x == y,
            Ne => x != y,
            Ult => x.ult(y),
            Ule => x.ule(y),
            Ugt => x.ugt(y),
            Uge => x.uge(y),
            Slt => x.slt(y),
            Sle => x.sle(y),
            Sgt => x.sgt(y),
            Sge => x.sge(y),
        });
    }
    // pointers compare with only as much width as an address has
    let img = |v: &Value| match v {
        Value::Ptr(p) => Some(*p),
        Value::Int(x) => Some(x.as_u64()),
        _ => None,
    };
    match (img(a), img(b)) {
        (Some(x), Some(y)) => Ok(match pred {
            Eq => x == y,
            Ne => x != y,
            Ult | Slt => x < y,
            Ule | Sle => x <= y,
            Ugt | Sgt => x > y,
            Uge | Sge => x >= y,
        }),
        _ => Err(ExecError::TypeMismatch(format!(
            "comparison of {a} and {b}"
        ))),
    }
}

fn fcmp_values(pred: FCmpPred, a: &Value, b: &Value) -> Result<bool, ExecError> {
    use FCmpPred::*;
    let ty = match a {
        Value::Float(_) => Ty::Float,
        Value::Double(_) => Ty::Double,
        Value::Fp80(_) => Ty::Fp80,
        _ => {
            return Err(ExecError::TypeMismatch(format!(
                "float comparison of {a} and {b}"
            )))
        }
    };
    let (x, y) = float_pair(&ty, a, b)?;
    let nan = x.is_nan() || y.is_nan();
    Ok(match pred {
        False => false,
        True => true,
        Ord => !nan,
        Uno => nan,
        Oeq => !nan && x == y,
        One => !nan && x != y,
        Olt => !nan && x < y,
        Ole => !nan && x <= y,
        Ogt => !nan && x > y,
        Oge => !nan && x >= y,
        Ueq => nan || x == y,
        Une => nan || x != y,
        Ult => nan || x < y,
        Ule => nan || x <= y,
        Ugt => nan || x > y,
        Uge => nan || x >= y,
    })
}

fn cast_value(op: CastOp, v: &Value, to: &Ty) -> Result<Value, ExecError> {
    use CastOp::*;
    let int_of = |v: &Value| {
        v.as_int()
            .copied()
            .ok_or_else(|| ExecError::TypeMismatch(format!("integer cast of {v}")))
    };
    let width_of = |ty: &Ty| match ty {
        Ty::Int(w) => Ok(*w),
        _ => Err(ExecError::TypeMismatch(format!("cast to {ty}"))),
    };
    let float_of = |v: &Value| match v {
        Value::Float(x) => Ok(*x as f64),
        Value::Double(x) => Ok(*x),
        Value::Fp80(x) => Ok(fp80_to_f64(*x)),
        _ => Err(ExecError::TypeMismatch(format!("float cast of {v}"))),
    };
    Ok(match op {
        Trunc => Value::Int(int_of(v)?.trunc(width_of(to)?)),
        ZExt => Value::Int(int_of(v)?.zext(width_of(to)?)),
        SExt => Value::Int(int_of(v)?.sext(width_of(to)?)),
        FpTrunc | FpExt => float_result(to, float_of(v)?),
        FpToUi => {
            let x = float_of(v)?;
            Value::Int(IntValue::new(width_of(to)?, x as u128))
        }
        FpToSi => {
            let x = float_of(v)?;
            Value::Int(IntValue::from_i128(width_of(to)?, x as i128))
        }
        UiToFp => float_result(to, int_of(v)?.bits() as f64),
        SiToFp => float_result(to, int_of(v)?.as_i128() as f64),
        PtrToInt => {
            let p = v
                .as_ptr()
                .ok_or_else(|| ExecError::TypeMismatch(format!("ptrtoint of {v}")))?;
            Value::Int(IntValue::new(width_of(to)?, p as u128))
        }
        IntToPtr => Value::Ptr(int_of(v)?.zext(64).as_u64()),
        BitCast => match (v, to) {
            (Value::Ptr(p), Ty::Ptr) => Value::Ptr(*p),
            (Value::Int(x), Ty::Int(w)) => Value::Int(IntValue::new(*w, x.bits())),
            (Value::Float(x), Ty::Int(w)) => Value::Int(IntValue::new(*w, x.to_bits() as u128)),
            (Value::Double(x), Ty::Int(w)) => Value::Int(IntValue::new(*w, x.to_bits() as u128)),
            (Value::Fp80(x), Ty::Int(w)) => Value::Int(IntValue::new(*w, *x)),
            (Value::Int(x), Ty::Float) => Value::Float(f32::from_bits(x.as_u64() as u32)),
            (Value::Int(x), Ty::Double) => Value::Double(f64::from_bits(x.as_u64())),
            (Value::Int(x), Ty::Fp80) => Value::Fp80(x.bits()),
            _ => {
                return Err(ExecError::TypeMismatch(format!("bitcast of {v} to {to}")))
            }
        },
    })
}
