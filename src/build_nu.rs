//! AST → Nu IR lowering for the P2 resident interpreter. Each function
//! body becomes one [`NuList`]; frame traffic goes through `ADD_DBASE`
//! (frame pointer) and `ADD_VBASE` (object base) address producers, and
//! control flow uses the compare-and-branch family so the peephole pass
//! has something to chew on.

use crate::{Compiler, FuncBody, FuncId, ModuleId, VisitPhase};
use crate::diag::DiagKind;
use crate::types::{AstId, NuLabelId};
use crate::types::ast::{AstKind, Op, Payload};
use crate::types::entity::{Lookup, SymKind, SymVal};
use crate::types::nu::{NuLabelPool, NuList, NuOp};

/// Per-function Nu backend data.
#[derive(Default)]
pub struct NuFuncData {
  pub irl: NuList,
  pub entry_label: Option<NuLabelId>,
  pub local_size: i32,
}

/// Per-module Nu backend data.
#[derive(Default)]
pub struct NuModData {
  pub dat_label: Option<NuLabelId>,
  pub compiled: bool,
}

/// Where an identifier's storage lives, for address-producer selection.
enum NuAddr {
  Local(i32),
  Member(i32),
  Func(FuncId),
  Unknown,
}

impl Compiler {
  fn nu_prepare(&mut self, m: ModuleId, labels: &mut NuLabelPool) {
    let funcs: Vec<FuncId> = self.module(m).functions.clone();
    for f in funcs {
      let mut data = NuFuncData::default();
      data.entry_label = Some(labels.create());
      self.func_mut(f).be = crate::FuncBackend::Nu(data);
    }
    self.module_mut(m).be = crate::ModBackend::Nu(NuModData {
      dat_label: Some(labels.create()),
      compiled: false,
    });
  }

  fn nu_addr_of(&self, f: FuncId, e: AstId) -> NuAddr {
    let Some(name) = self.ast.ident_name(e) else { return NuAddr::Unknown };
    if let Lookup::Direct(ent) = self.func(f).localsyms.lookup_in_scope(name) {
      if matches!(ent.kind, SymKind::LocalVar | SymKind::Parameter
                  | SymKind::Result | SymKind::TempVar) {
        return NuAddr::Local(ent.offset);
      }
    }
    let m = self.func(f).module;
    if let Lookup::Direct(ent) = self.module(m).objsyms.lookup_in_scope(name) {
      match (ent.kind, ent.val) {
        (SymKind::Variable, _) => return NuAddr::Member(ent.offset),
        (SymKind::Function, SymVal::Func(callee)) => return NuAddr::Func(callee),
        _ => {}
      }
    }
    NuAddr::Unknown
  }

  /// Push the value of an lvalue; returns items pushed.
  fn nu_compile_lvalue_read(&mut self, f: FuncId, irl: &mut NuList, e: AstId) -> i32 {
    match self.nu_addr_of(f, e) {
      NuAddr::Local(off) => {
        irl.emit_const(off);
        irl.emit(NuOp::AddDbase);
        let ld = irl.emit(NuOp::LdL);
        ld.comment = self.ast.ident_name(e);
        1
      }
      NuAddr::Member(off) => {
        irl.emit_const(off);
        irl.emit(NuOp::AddVbase);
        irl.emit(NuOp::LdL);
        1
      }
      NuAddr::Func(callee) => {
        let label = self.nu_entry_label(callee);
        if let Some(label) = label { irl.emit_address(label) }
        1
      }
      NuAddr::Unknown => {
        let span = self.ast.span(e);
        self.diag.error(span, DiagKind::Symbol,
          format!("undefined symbol in expression: {:?}", self.ast.ident_name(e)));
        0
      }
    }
  }

  fn nu_entry_label(&self, f: FuncId) -> Option<NuLabelId> {
    match &self.func(f).be {
      crate::FuncBackend::Nu(d) => d.entry_label,
      _ => None,
    }
  }

  /// Compile an expression; returns the number of longs left on the
  /// stack.
  pub fn nu_compile_expression(&mut self, f: FuncId, irl: &mut NuList,
                               labels: &mut NuLabelPool, ast: AstId) -> i32 {
    let e = self.ast.uncomment(ast);
    if let Some(v) = self.try_const_val(e) {
      irl.emit_const(v as i32);
      return 1;
    }
    let node = *self.ast.get(e);
    match node.kind {
      AstKind::Identifier | AstKind::LocalIdentifier => {
        self.nu_compile_lvalue_read(f, irl, e)
      }
      AstKind::Operator => {
        let Payload::Oper(op) = node.d else { return 0 };
        let binop = match op {
          Op::Add => Some(NuOp::Add), Op::Sub => Some(NuOp::Sub),
          Op::BitAnd => Some(NuOp::And), Op::BitOr => Some(NuOp::Ior),
          Op::BitXor => Some(NuOp::Xor),
          Op::Shl => Some(NuOp::Shl), Op::Shr => Some(NuOp::Shr),
          Op::Sar => Some(NuOp::Sar),
          Op::LimitMin => Some(NuOp::Mins), Op::LimitMax => Some(NuOp::Maxs),
          Op::LimitMinUns => Some(NuOp::Minu), Op::LimitMaxUns => Some(NuOp::Maxu),
          Op::SignExtend => Some(NuOp::SignX), Op::ZeroExtend => Some(NuOp::ZeroX),
          _ => None,
        };
        if let Some(bop) = binop {
          let mut n = 0;
          if let Some(l) = node.left { n += self.nu_compile_expression(f, irl, labels, l) }
          if let Some(r) = node.right { n += self.nu_compile_expression(f, irl, labels, r) }
          if n != 2 {
            let span = node.span;
            self.diag.error(span, DiagKind::Internal, "wrong operand count for operator");
          }
          irl.emit(bop);
          return 1;
        }
        match op {
          Op::Mul => {
            // signed 32x32: keep the low half
            if let Some(l) = node.left { self.nu_compile_expression(f, irl, labels, l); }
            if let Some(r) = node.right { self.nu_compile_expression(f, irl, labels, r); }
            irl.emit(NuOp::MulS);
            irl.emit(NuOp::Drop);
            1
          }
          Op::Div | Op::UnsDiv => {
            if let Some(l) = node.left { self.nu_compile_expression(f, irl, labels, l); }
            if let Some(r) = node.right { self.nu_compile_expression(f, irl, labels, r); }
            irl.emit(if op == Op::Div { NuOp::DivS } else { NuOp::DivU });
            irl.emit(NuOp::Drop); // drop the remainder
            1
          }
          Op::Mods | Op::UnsMod => {
            if let Some(l) = node.left { self.nu_compile_expression(f, irl, labels, l); }
            if let Some(r) = node.right { self.nu_compile_expression(f, irl, labels, r); }
            irl.emit(if op == Op::Mods { NuOp::DivS } else { NuOp::DivU });
            irl.emit(NuOp::Swap);
            irl.emit(NuOp::Drop);
            1
          }
          Op::Negate => {
            if let Some(r) = node.right.or(node.left) {
              self.nu_compile_expression(f, irl, labels, r);
            }
            irl.emit(NuOp::Neg);
            1
          }
          Op::BitNot => {
            if let Some(r) = node.right.or(node.left) {
              self.nu_compile_expression(f, irl, labels, r);
            }
            irl.emit(NuOp::Not);
            1
          }
          Op::Abs => {
            if let Some(r) = node.right.or(node.left) {
              self.nu_compile_expression(f, irl, labels, r);
            }
            irl.emit(NuOp::Abs);
            1
          }
          Op::Decode => {
            if let Some(r) = node.right {
              self.nu_compile_expression(f, irl, labels, r);
            }
            irl.emit_const(1);
            irl.emit(NuOp::Swap);
            irl.emit(NuOp::Shl);
            1
          }
          Op::Encode => {
            if let Some(r) = node.right.or(node.left) {
              self.nu_compile_expression(f, irl, labels, r);
            }
            irl.emit(NuOp::Encode);
            1
          }
          Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge
          | Op::Ltu | Op::Leu | Op::Gtu | Op::Geu => {
            // materialise a boolean: cb over constants
            let truelab = labels.create();
            let endlab = labels.create();
            if let Some(l) = node.left { self.nu_compile_expression(f, irl, labels, l); }
            if let Some(r) = node.right { self.nu_compile_expression(f, irl, labels, r); }
            irl.emit_branch(Self::nu_cb_for(op), truelab);
            irl.emit_const(0);
            irl.emit_branch(NuOp::Bra, endlab);
            irl.emit_label(truelab);
            irl.emit_const(-1);
            irl.emit_label(endlab);
            1
          }
          _ => {
            let span = node.span;
            self.diag.error(span, DiagKind::Internal,
              format!("cannot compile operator {op:?} for nucode yet"));
            0
          }
        }
      }
      AstKind::FuncCall => self.nu_compile_call(f, irl, labels, e),
      AstKind::MemRef => {
        let Some(addr) = node.right else { return 0 };
        self.nu_compile_expression(f, irl, labels, addr);
        let size = node.left.map_or(4, |t| self.type_size(t));
        irl.emit(match size { 1 => NuOp::LdB, 2 => NuOp::LdW, 8 => NuOp::LdD, _ => NuOp::LdL });
        if size == 8 { 2 } else { 1 }
      }
      AstKind::AddrOf | AstKind::AbsAddrOf => {
        let Some(inner) = node.left else { return 0 };
        match self.nu_addr_of(f, inner) {
          NuAddr::Local(off) => {
            irl.emit_const(off);
            irl.emit(NuOp::AddDbase);
            1
          }
          NuAddr::Member(off) => {
            irl.emit_const(off);
            irl.emit(NuOp::AddVbase);
            1
          }
          NuAddr::Func(callee) => {
            if let Some(label) = self.nu_entry_label(callee) {
              irl.emit_address(label);
            }
            1
          }
          NuAddr::Unknown => {
            let span = node.span;
            self.diag.error(span, DiagKind::Internal, "cannot take address for nucode");
            0
          }
        }
      }
      AstKind::Sequence => {
        if let Some(l) = node.left {
          let n = self.nu_compile_expression(f, irl, labels, l);
          for _ in 0..n { irl.emit(NuOp::Drop); }
        }
        match node.right {
          Some(r) => self.nu_compile_expression(f, irl, labels, r),
          None => 0,
        }
      }
      AstKind::SimpleFuncPtr => {
        let Some(inner) = node.left else { return 0 };
        match self.nu_addr_of(f, inner) {
          NuAddr::Func(callee) => {
            if let Some(label) = self.nu_entry_label(callee) {
              irl.emit_address(label);
            }
            1
          }
          _ => 0,
        }
      }
      _ => {
        let span = node.span;
        self.diag.error(span, DiagKind::Internal,
          format!("cannot compile {:?} for nucode yet", node.kind));
        0
      }
    }
  }

  fn nu_cb_for(op: Op) -> NuOp {
    match op {
      Op::Eq => NuOp::CbEq, Op::Ne => NuOp::CbNe,
      Op::Lt => NuOp::CbLts, Op::Le => NuOp::CbLes,
      Op::Gt => NuOp::CbGts, Op::Ge => NuOp::CbGes,
      Op::Ltu => NuOp::CbLtu, Op::Leu => NuOp::CbLeu,
      Op::Gtu => NuOp::CbGtu, Op::Geu => NuOp::CbGeu,
      _ => NuOp::CbNe,
    }
  }

  fn nu_compile_call(&mut self, f: FuncId, irl: &mut NuList,
                     labels: &mut NuLabelPool, call: AstId) -> i32 {
    let node = *self.ast.get(call);
    let arglist: Vec<AstId> = self.ast.list_iter(node.right).collect();
    for arg in arglist {
      self.nu_compile_expression(f, irl, labels, arg);
    }
    let Some(target) = node.left else { return 0 };
    match self.nu_addr_of(f, target) {
      NuAddr::Func(callee) => {
        if let Some(label) = self.nu_entry_label(callee) {
          let fname = self.func(callee).name;
          let call_ir = irl.emit(NuOp::CallA);
          call_ir.label = Some(label);
          call_ir.comment = Some(fname);
        }
        self.func_mut(callee).call_sites += 1;
        self.func(callee).numresults.max(0)
      }
      _ => {
        // computed call: address on the stack
        let n = self.nu_compile_expression(f, irl, labels, target);
        if n != 1 {
          let span = node.span;
          self.diag.error(span, DiagKind::Type, "called object is not a function");
        }
        irl.emit(NuOp::Call);
        1
      }
    }
  }

  /// Compile one statement.
  fn nu_compile_statement(&mut self, f: FuncId, irl: &mut NuList,
                          labels: &mut NuLabelPool, ast: AstId) {
    let stmt = self.ast.uncomment(ast);
    let node = *self.ast.get(stmt);
    match node.kind {
      AstKind::StmtList => self.nu_compile_stmt_list(f, irl, labels, Some(stmt)),
      AstKind::Assign => {
        let Some(lhs) = node.left else { return };
        let Some(rhs) = node.right else { return };
        let n = self.nu_compile_expression(f, irl, labels, rhs);
        if n != 1 {
          self.diag.error(node.span, DiagKind::Internal,
                          "tuple assignment not supported for nucode yet");
          return;
        }
        self.nu_store(f, irl, labels, lhs);
      }
      AstKind::Return => {
        let nargs = self.func(f).numparams;
        let nres = match node.left {
          Some(val) => self.nu_compile_expression(f, irl, labels, val),
          None => {
            // return the result variable(s)
            let nres = self.func(f).numresults;
            if nres > 0 {
              if let Some(rexpr) = self.func(f).result_expr {
                self.nu_compile_expression(f, irl, labels, rexpr);
              }
            }
            nres
          }
        };
        irl.emit_const(nargs);
        irl.emit_const(nres);
        irl.emit(NuOp::Ret);
      }
      AstKind::If => {
        let Some(cond) = node.left else { return };
        let Some(thenelse) = node.right else { return };
        let elselab = labels.create();
        let endlab = labels.create();
        self.nu_compile_condition(f, irl, labels, cond, elselab, false);
        let thenpart = self.ast.left(thenelse);
        let elsepart = self.ast.right(thenelse);
        if let Some(t) = thenpart { self.nu_compile_statement(f, irl, labels, t) }
        if let Some(e) = elsepart {
          irl.emit_branch(NuOp::Bra, endlab);
          irl.emit_label(elselab);
          self.nu_compile_statement(f, irl, labels, e);
          irl.emit_label(endlab);
        } else {
          irl.emit_label(elselab);
        }
      }
      AstKind::While => {
        let Some(cond) = node.left else { return };
        let toplab = labels.create();
        let exitlab = labels.create();
        irl.emit_label(toplab);
        self.nu_compile_condition(f, irl, labels, cond, exitlab, false);
        if let Some(body) = node.right { self.nu_compile_statement(f, irl, labels, body) }
        irl.emit_branch(NuOp::Bra, toplab);
        irl.emit_label(exitlab);
      }
      AstKind::DoWhile => {
        let Some(cond) = node.left else { return };
        let toplab = labels.create();
        irl.emit_label(toplab);
        if let Some(body) = node.right { self.nu_compile_statement(f, irl, labels, body) }
        self.nu_compile_condition(f, irl, labels, cond, toplab, true);
      }
      AstKind::FuncCall => {
        let n = self.nu_compile_call(f, irl, labels, stmt);
        for _ in 0..n { irl.emit(NuOp::Drop); }
      }
      AstKind::LineBreak | AstKind::Comment => {}
      AstKind::Label => {
        // user goto label: materialise one
        if let Some(name) = node.left.and_then(|l| self.ast.ident_name(l)) {
          let _ = name;
        }
        let lab = labels.create();
        irl.emit_label(lab);
      }
      _ => {
        let n = self.nu_compile_expression(f, irl, labels, stmt);
        for _ in 0..n { irl.emit(NuOp::Drop); }
      }
    }
  }

  /// Compile a branch on `cond`: jump to `target` when the condition is
  /// false (or true, when `branch_if_true`).
  fn nu_compile_condition(&mut self, f: FuncId, irl: &mut NuList,
                          labels: &mut NuLabelPool, cond: AstId,
                          target: NuLabelId, branch_if_true: bool) {
    let e = self.ast.uncomment(cond);
    let node = *self.ast.get(e);
    if node.kind == AstKind::Operator {
      if let Payload::Oper(op) = node.d {
        if matches!(op, Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge
                    | Op::Ltu | Op::Leu | Op::Gtu | Op::Geu) {
          if let Some(l) = node.left { self.nu_compile_expression(f, irl, labels, l); }
          if let Some(r) = node.right { self.nu_compile_expression(f, irl, labels, r); }
          let cb = Self::nu_cb_for(op);
          let cb = if branch_if_true { cb } else { cb.invert_condition() };
          irl.emit_branch(cb, target);
          return;
        }
      }
    }
    self.nu_compile_expression(f, irl, labels, e);
    irl.emit_branch(if branch_if_true { NuOp::Bnz } else { NuOp::Bz }, target);
  }

  fn nu_store(&mut self, f: FuncId, irl: &mut NuList,
              labels: &mut NuLabelPool, lhs: AstId) {
    match self.nu_addr_of(f, lhs) {
      NuAddr::Local(off) => {
        irl.emit_const(off);
        irl.emit(NuOp::AddDbase);
        irl.emit(NuOp::StL);
      }
      NuAddr::Member(off) => {
        irl.emit_const(off);
        irl.emit(NuOp::AddVbase);
        irl.emit(NuOp::StL);
      }
      _ => {
        if self.ast.kind(lhs) == AstKind::MemRef {
          if let Some(addr) = self.ast.right(lhs) {
            self.nu_compile_expression(f, irl, labels, addr);
            let size = self.ast.left(lhs).map_or(4, |t| self.type_size(t));
            irl.emit(match size {
              1 => NuOp::StB, 2 => NuOp::StW, 8 => NuOp::StD, _ => NuOp::StL,
            });
            return;
          }
        }
        let span = self.ast.span(lhs);
        self.diag.error(span, DiagKind::Internal,
                        "cannot store to this location for nucode yet");
      }
    }
  }

  fn nu_compile_stmt_list(&mut self, f: FuncId, irl: &mut NuList,
                          labels: &mut NuLabelPool, mut list: Option<AstId>) {
    while let Some(cell) = list {
      if let Some(stmt) = self.ast.left(cell) {
        self.nu_compile_statement(f, irl, labels, stmt);
      }
      list = self.ast.right(cell);
    }
  }

  /// Compile one function to Nu IR: entry label, frame setup, body, and
  /// a fallback return.
  pub fn nu_compile_function(&mut self, f: FuncId, labels: &mut NuLabelPool) {
    let save = self.current_function;
    self.current_function = Some(f);
    let mut irl = NuList::new();
    let entry = self.nu_entry_label(f).unwrap_or_else(|| labels.create());
    irl.emit_label(entry);
    let fname = self.func(f).name;
    let nargs = self.func(f).numparams;
    let nlocals = self.func(f).numlocals;
    let nres = self.func(f).numresults;
    irl.emit_commented(NuOp::Comment, fname);
    irl.emit_const(nres);
    irl.emit_const(nargs);
    irl.emit_const(nlocals);
    irl.emit(NuOp::Enter);
    if let FuncBody::Stmts(body) = self.func(f).body {
      self.nu_compile_stmt_list(f, &mut irl, labels, Some(body));
    }
    // fall-off-the-end return
    let needs_ret = !matches!(irl.ir.last().map(|i| i.op), Some(NuOp::Ret));
    if needs_ret {
      if nres > 0 {
        if let Some(rexpr) = self.func(f).result_expr {
          self.nu_compile_expression(f, &mut irl, labels, rexpr);
        }
      }
      irl.emit_const(nargs);
      irl.emit_const(nres);
      irl.emit(NuOp::Ret);
    }
    if let crate::FuncBackend::Nu(data) = &mut self.func_mut(f).be {
      data.irl = irl;
      data.local_size = nlocals * 4;
    }
    self.current_function = save;
  }

  /// Compile the whole program to Nu IR (used by
  /// [`Compiler::output_nu_code`] and the tests).
  pub fn nu_compile_program(&mut self, top: ModuleId) -> NuLabelPool {
    let mut labels = NuLabelPool::new();
    // pool must be shared across the visitor; thread it through a cell
    let labels_ref = std::cell::RefCell::new(&mut labels);
    self.visit_recursive(top, VisitPhase::Init, &mut |c, m| {
      c.nu_prepare(m, &mut labels_ref.borrow_mut());
    });
    self.visit_recursive(top, VisitPhase::CompileFuncs, &mut |c, m| {
      let funcs: Vec<FuncId> = c.module(m).functions.clone();
      for f in funcs {
        c.nu_compile_function(f, &mut labels_ref.borrow_mut());
      }
    });
    drop(labels_ref);
    labels
  }

  /// Register the local variables of `f` with consecutive frame offsets
  /// (parameters first, then results, then locals), so the lowering can
  /// address them. Normally the front end has done this already; this
  /// fills in anything missing.
  pub fn nu_assign_frame_offsets(&mut self, f: FuncId) {
    let mut offset = 0;
    let mut names: Vec<(crate::symbol::Symbol, SymKind)> = Vec::new();
    let params = self.func(f).params;
    for p in self.ast.list_iter(params) {
      if let Some(n) = self.ast.ident_name(p) { names.push((n, SymKind::Parameter)) }
    }
    if let Some(r) = self.func(f).result_expr {
      if let Some(n) = self.ast.ident_name(r) { names.push((n, SymKind::Result)) }
    }
    let locals = self.func(f).locals;
    for l in self.ast.list_iter(locals) {
      if let Some(n) = self.ast.ident_name(l) { names.push((n, SymKind::LocalVar)) }
    }
    let ty = self.long_type(false);
    for (name, kind) in names {
      if self.func(f).localsyms.contains(name) { continue }
      if let Ok(e) = self.funcs[f.idx()].localsyms.add(name, kind, SymVal::Ast(ty)) {
        e.offset = offset;
      }
      offset += 4;
    }
  }

  /// Write the complete Nu interpreter + bytecode source for `top`.
  pub fn output_nu_code(&mut self, path: &str, top: ModuleId) -> std::io::Result<()> {
    self.top_module = Some(top);
    self.calc_clk_freq(top);
    for ix in 0..self.funcs.len() {
      self.nu_assign_frame_offsets(crate::types::FuncId::from_usize(ix));
    }
    let mut labels = self.nu_compile_program(top);
    if self.options.optimize.contains(crate::OptimizeFlags::PEEPHOLE) {
      for ix in 0..self.funcs.len() {
        let fid = crate::types::FuncId::from_usize(ix);
        if let crate::FuncBackend::Nu(data) = &mut self.funcs[fid.idx()].be {
          let mut irl = std::mem::take(&mut data.irl);
          self.nu_optimize(&mut irl, &mut labels);
          if let crate::FuncBackend::Nu(data) = &mut self.funcs[fid.idx()].be {
            data.irl = irl;
          }
        }
      }
    }
    if self.diag.errors() > 0 { return Ok(()) }
    let text = self.pack_and_emit(top, &mut labels);
    std::fs::write(path, text)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::{Compiler, Options, Language};
  use crate::types::ast::AstKind;
  use crate::types::nu::NuOp;

  fn mk_func(c: &mut Compiler, m: ModuleId, name: &str,
             params: &[&str], locals: &[&str], result: Option<&str>,
             body: AstId) -> FuncId {
    let nm = c.ast.identifier(name);
    let res = result.map(|r| c.ast.identifier(r));
    let decl = c.ast.new_node(AstKind::FuncDecl, Some(nm), res);
    let mk_list = |c: &mut Compiler, names: &[&str]| {
      let mut list = None;
      for n in names {
        let id = c.ast.identifier(n);
        let cell = c.ast.new_node(AstKind::ListHolder, Some(id), None);
        list = Some(c.ast.list_append(list, cell));
      }
      list
    };
    let ps = mk_list(c, params);
    let ls = mk_list(c, locals);
    let vars = c.ast.new_node(AstKind::FuncVars, ps, ls);
    let fdef = c.ast.new_node(AstKind::FuncDef, Some(decl), Some(vars));
    let f = c.declare_function(m, None, true, fdef, Some(body), None, None);
    c.nu_assign_frame_offsets(f);
    f
  }

  fn ops(irl: &NuList) -> Vec<NuOp> {
    irl.ir.iter().map(|i| i.op)
      .filter(|&op| op != NuOp::Comment && op != NuOp::Label)
      .collect()
  }

  #[test]
  fn method_body_lowering() {
    // pub main() : r | x
    //   x := 2 + 3
    //   r := x * x
    let mut c = Compiler::new(Options::default());
    c.diag.capture();
    let m = c.new_module("t.spin2", Language::Spin2);
    c.current_module = Some(m);

    let x1 = c.ast.identifier("x");
    let two = c.ast.integer(2);
    let three = c.ast.integer(3);
    let sum = c.ast.operator(Op::Add, Some(two), Some(three));
    let a1 = c.ast.assign(x1, sum);
    let x2 = c.ast.identifier("x");
    let x3 = c.ast.identifier("x");
    let prod = c.ast.operator(Op::Mul, Some(x2), Some(x3));
    let r1 = c.ast.identifier("r");
    let a2 = c.ast.assign(r1, prod);
    let s2 = c.ast.new_node(AstKind::StmtList, Some(a2), None);
    let s1cell = c.ast.new_node(AstKind::StmtList, Some(a1), Some(s2));

    let f = mk_func(&mut c, m, "main", &[], &["x"], Some("r"), s1cell);
    // typecheck folds 2+3 before lowering
    c.current_function = Some(f);
    c.check_types(s1cell);
    c.current_function = None;
    let mut labels = c.nu_compile_program(m);
    let _ = &mut labels;
    let crate::FuncBackend::Nu(data) = &c.func(f).be else { panic!() };
    let got = ops(&data.irl);
    // PUSHI 0/0/1 ENTER; PUSHI 5; PUSHI off; ADD_DBASE; STL;
    // (LDL x) x2; MULS; DROP; STL r; PUSHI 0; PUSHI 1; RET
    assert_eq!(c.diag.errors(), 0, "{:?}", c.diag.captured());
    assert!(got.windows(2).any(|w| w == [NuOp::MulS, NuOp::Drop]),
            "multiply keeps the low half: {got:?}");
    assert!(got.contains(&NuOp::Enter));
    assert_eq!(*got.last().unwrap(), NuOp::Ret);
    // the folded 2+3 arrives as a single PUSHI 5
    assert!(data.irl.ir.iter().any(|i| i.op == NuOp::PushI && i.val == 5));
  }

  #[test]
  fn while_loop_shapes() {
    let mut c = Compiler::new(Options::default());
    c.diag.capture();
    let m = c.new_module("t.spin2", Language::Spin2);
    c.current_module = Some(m);
    // while x < 10 : x := x + 1
    let x = c.ast.identifier("x");
    let ten = c.ast.integer(10);
    let cond = c.ast.operator(Op::Lt, Some(x), Some(ten));
    let x2 = c.ast.identifier("x");
    let one = c.ast.integer(1);
    let inc = c.ast.operator(Op::Add, Some(x2), Some(one));
    let x3 = c.ast.identifier("x");
    let assign = c.ast.assign(x3, inc);
    let bodylist = c.ast.new_node(AstKind::StmtList, Some(assign), None);
    let wh = c.ast.new_node(AstKind::While, Some(cond), Some(bodylist));
    let stmts = c.ast.new_node(AstKind::StmtList, Some(wh), None);
    let f = mk_func(&mut c, m, "spin", &[], &["x"], None, stmts);
    c.nu_compile_program(m);
    let crate::FuncBackend::Nu(data) = &c.func(f).be else { panic!() };
    let got = ops(&data.irl);
    assert_eq!(c.diag.errors(), 0, "{:?}", c.diag.captured());
    // `while x < 10` branches out on the inverted condition
    assert!(got.contains(&NuOp::CbGes), "{got:?}");
    assert!(got.contains(&NuOp::Bra));
  }

  #[test]
  fn call_counts_sites() {
    let mut c = Compiler::new(Options::default());
    c.diag.capture();
    let m = c.new_module("t.spin2", Language::Spin2);
    c.current_module = Some(m);
    let empty = c.ast.new_node(AstKind::StmtList, None, None);
    let callee = mk_func(&mut c, m, "helper", &[], &[], None, empty);
    let target = c.ast.identifier("helper");
    let call = c.ast.new_node(AstKind::FuncCall, Some(target), None);
    let stmts = c.ast.new_node(AstKind::StmtList, Some(call), None);
    let _caller = mk_func(&mut c, m, "main", &[], &[], None, stmts);
    c.nu_compile_program(m);
    assert_eq!(c.func(callee).call_sites, 1);
  }
}
