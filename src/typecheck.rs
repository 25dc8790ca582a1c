//! The type-check / coercion pass. A single recursive walk rewrites the
//! AST in place and returns a type for each expression: integer
//! promotion, float and 64-bit lowering to named helper calls, pointer
//! arithmetic scaling, assignment coercions, varargs boxing, and the
//! expression-level operator peephole all live here.

use if_chain::if_chain;
use crate::{Compiler, Language, LONG_SIZE};
use crate::diag::DiagKind;
use crate::types::AstId;
use crate::types::ast::{AstKind, Op, Payload};
use crate::types::entity::{SymKind, SymVal};

impl Compiler {
  fn cur_language(&self) -> Language {
    match self.current_function {
      Some(f) => self.func(f).language,
      None => match self.current_module {
        Some(m) => self.module(m).language,
        None => Language::Spin2,
      },
    }
  }

  /// The boolean type of the current surface language: C booleans are
  /// unsigned 0/1, Spin/BASIC booleans are signed 0/-1.
  fn cur_bool_type(&mut self) -> AstId {
    if self.cur_language() == Language::C {
      self.bool_type(false, LONG_SIZE)
    } else {
      self.bool_type(true, LONG_SIZE)
    }
  }

  /// Build a call to helper `name` with up to three arguments, reporting
  /// errors at `report`'s location.
  fn make_op_call(&mut self, name: &str, report: AstId,
                  args: &[AstId]) -> AstId {
    let save = self.ast.report_as(report);
    let func = self.ast.identifier(name);
    let mut list: Option<AstId> = None;
    for &a in args {
      let cell = self.ast.expr_item(a);
      list = Some(self.ast.list_append(list, cell));
    }
    let call = self.ast.new_node(AstKind::FuncCall, Some(func), list);
    self.ast.report_done(save);
    call
  }

  /// The result for an unordered float comparison, so that `x < NaN` and
  /// `x > NaN` behave consistently.
  fn unordered_result(op: Op) -> i64 {
    match op {
      Op::Gt | Op::Ge | Op::Gtu | Op::Geu => -1,
      _ => 1,
    }
  }

  // ---- promotion machinery ----------------------------------------------

  /// Sign/zero extend `expr` from `srcbytes` up to `destbytes`.
  fn do_promote(&mut self, expr: AstId, srcbytes: i32, destbytes: i32,
                unsigned: bool) -> AstId {
    if srcbytes >= 4 && destbytes < 8 { return expr }
    let save = self.ast.report_as(expr);
    let result;
    if destbytes == 8 {
      let low32 = if srcbytes < 4 {
        self.do_promote(expr, srcbytes, 4, unsigned)
      } else { expr };
      if let Some(v) = self.try_const_val(low32) {
        // constant: split into low/high halves right here
        let lo = self.ast.integer(v & 0xffff_ffff);
        let hi = self.ast.integer(if unsigned { (v as u32 as u64 >> 32) as i64 }
                                  else { (v as i32 as i64) >> 32 });
        let getlo = self.ast.new_node(AstKind::GetLow, Some(lo), None);
        let gethi = self.ast.new_node(AstKind::GetHigh, Some(hi), None);
        let tail = self.ast.expr_item(gethi);
        let head = self.ast.new_node(AstKind::ExprList, Some(getlo), Some(tail));
        result = head;
      } else {
        let conv = if unsigned { "_int64_zerox" } else { "_int64_signx" };
        result = self.make_op_call(conv, expr, &[low32]);
      }
    } else if srcbytes < 4 {
      let bits = self.ast.integer(i64::from(srcbytes * 8));
      let op = if unsigned { Op::ZeroExtend } else { Op::SignExtend };
      result = self.ast.operator(op, Some(expr), Some(bits));
    } else {
      result = expr;
    }
    self.ast.report_done(save);
    result
  }

  fn force_promote(&mut self, ty: Option<AstId>, expr: AstId) -> AstId {
    let Some(ty) = ty else { return expr };
    if !self.is_int_type(ty) && !self.is_generic_type(ty) { return expr }
    let size = self.type_size(ty);
    if size < LONG_SIZE {
      self.do_promote(expr, size, LONG_SIZE, self.is_unsigned_type(ty))
    } else { expr }
  }

  /// Promote both sides of a binary node to a common integer width:
  /// any 64-bit side forces 64 bits; mixed signedness at the same width
  /// is signed-dominant.
  fn match_integer_types(&mut self, node: AstId, lefttype: AstId,
                         righttype: AstId) -> AstId {
    let lsize = self.type_size(lefttype);
    let rsize = self.type_size(righttype);
    let lu = self.is_unsigned_type(lefttype);
    let ru = self.is_unsigned_type(righttype);
    let finalsize = if lsize > LONG_SIZE || rsize > LONG_SIZE { 8 } else { LONG_SIZE };
    if lsize < finalsize {
      if let Some(l) = self.ast.left(node) {
        let p = self.do_promote(l, lsize, finalsize, lu);
        self.ast.get_mut(node).left = Some(p);
      }
    }
    if rsize < finalsize {
      if let Some(r) = self.ast.right(node) {
        let p = self.do_promote(r, rsize, finalsize, ru);
        self.ast.get_mut(node).right = Some(p);
      }
    }
    let unsigned = lu && ru;
    match (finalsize, unsigned) {
      (8, true) => self.long64_type(true),
      (8, false) => self.long64_type(false),
      (_, true) => self.long_type(true),
      (_, false) => self.long_type(false),
    }
  }

  fn make_float(&mut self, ty: Option<AstId>, expr: AstId) -> AstId {
    let Some(ty) = ty else { return expr };
    if self.is_generic_type(ty) || self.is_float_type(ty) { return expr }
    if self.options.fixedreal {
      let sixteen = self.ast.integer(16);
      let shifted = self.ast.operator(Op::Shl, Some(expr), Some(sixteen));
      return self.fold_if_const(shifted);
    }
    if !self.is_int_type(ty) {
      let span = self.ast.span(expr);
      self.diag.error(span, DiagKind::Type, "Unable to cast this type to float");
      return expr;
    }
    let promoted = self.force_promote(Some(ty), expr);
    if let Some(v) = self.try_const_val(promoted) {
      let f = if self.is_unsigned_type(ty) { v as u64 as f32 } else { v as f32 };
      return self.ast.float(f);
    }
    let size = self.type_size(ty);
    let name = match (size, self.is_unsigned_type(ty)) {
      (8, true) => "_float_fromuns64",
      (8, false) => "_float_fromint64",
      (_, true) => "_float_fromuns",
      (_, false) => "_float_fromint",
    };
    self.make_op_call(name, expr, &[promoted])
  }

  fn float_to_int(&mut self, expr: AstId, srctype: AstId) -> AstId {
    if self.options.fixedreal {
      let sixteen = self.ast.integer(16);
      return self.ast.operator(Op::Sar, Some(expr), Some(sixteen));
    }
    if self.is_float64_type(srctype) {
      return self.make_op_call("_double_toint", expr, &[expr]);
    }
    if let Some(bits) = self.try_const_val(expr) {
      let f = f32::from_bits(bits as u32);
      return self.ast.integer(f as i64);
    }
    self.make_op_call("_float_toint", expr, &[expr])
  }

  fn fold_if_const(&mut self, e: AstId) -> AstId {
    match self.try_const_val(e) {
      Some(v) => {
        let save = self.ast.report_as(e);
        let n = self.ast.integer(v);
        self.ast.report_done(save);
        n
      }
      None => e,
    }
  }

  // ---- the operator peephole --------------------------------------------

  /// Fold `(x + a) + b` shapes: if `node` is a non-constant add/sub with
  /// one constant side, strip it off and return the constant.
  fn opt_nested_add(&mut self, node: AstId) -> Option<(AstId, i64)> {
    if self.ast.kind(node) != AstKind::Operator { return None }
    if self.is_const_expr(node) { return None }
    let Payload::Oper(op) = self.ast.get(node).d else { return None };
    let l = self.ast.left(node)?;
    let r = self.ast.right(node)?;
    match op {
      Op::Add => {
        if let Some(v) = self.try_const_val(l) { return Some((r, v)) }
        if let Some(v) = self.try_const_val(r) { return Some((l, v)) }
        None
      }
      Op::Sub => self.try_const_val(r).map(|v| (l, -v)),
      _ => None,
    }
  }

  /// Expression-level operator rewrites, applied before any IR is
  /// produced. Returns true when the node changed.
  pub fn optimize_operator(&mut self, node: AstId) -> bool {
    let Payload::Oper(mut op) = self.ast.get(node).d else { return false };
    let mut left = self.ast.left(node);
    let mut right = self.ast.right(node);
    let mut changed = false;

    // 1<<x can use the interpreter's decode opcode
    if op == Op::Shl && self.interp_prefers_decode() {
      if let Some(l) = left {
        if self.try_const_val(l) == Some(1) {
          self.ast.get_mut(node).d = Payload::Oper(Op::Decode);
          self.ast.get_mut(node).left = None;
          return true;
        }
      }
    }
    // zero-extend by a constant is a mask
    if op == Op::ZeroExtend {
      if let Some(n) = right.and_then(|r| self.try_const_val(r)) {
        let mask = if n >= 32 { -1 } else { (1i64 << n) - 1 };
        let m = self.ast.integer(mask);
        self.ast.get_mut(node).d = Payload::Oper(Op::BitAnd);
        self.ast.get_mut(node).right = Some(m);
        return true;
      }
    }
    // nested add/sub folding
    loop {
      let rconst = right.and_then(|r| self.try_const_val(r));
      if op == Op::Add || op == Op::Sub {
        if let (Some(l), Some(rv)) = (left, rconst) {
          if let Some((core, addv)) = self.opt_nested_add(l) {
            // (x+a) + b => x + (a+b);  (x+a) - b => x - (b-a)
            let kv = match op {
              Op::Add => rv + addv,
              _ => rv - addv,
            };
            let k = self.ast.integer(kv);
            self.ast.get_mut(node).left = Some(core);
            self.ast.get_mut(node).right = Some(k);
            left = Some(core);
            right = Some(k);
            changed = true;
            continue;
          }
        }
      }
      break;
    }
    // x != 0 flattens inside boolean operators
    if op.is_bool() {
      for side in [left, right] {
        if_chain! {
          if let Some(s) = side;
          if self.ast.kind(s) == AstKind::Operator;
          if let Payload::Oper(Op::Ne) = self.ast.get(s).d;
          then {
            let sl = self.ast.left(s);
            let sr = self.ast.right(s);
            if sl.and_then(|x| self.try_const_val(x)) == Some(0) {
              if let Some(keep) = sr { *self.ast.get_mut(s) = *self.ast.get(keep); changed = true }
            } else if sr.and_then(|x| self.try_const_val(x)) == Some(0) {
              if let Some(keep) = sl { *self.ast.get_mut(s) = *self.ast.get(keep); changed = true }
            }
          }
        }
      }
    }

    // commute a constant to the right so the rules below see it there
    if op.commutes() {
      if let (Some(l), Some(r)) = (left, right) {
        if self.is_const_expr(l) && !self.is_const_expr(r) {
          self.ast.get_mut(node).left = Some(r);
          self.ast.get_mut(node).right = Some(l);
          left = Some(r);
          right = Some(l);
          changed = true;
        }
      }
    }

    let rval = right.and_then(|r| self.try_const_val(r));
    if let (Some(l), Some(rv)) = (left, rval) {
      let save = self.ast.report_as(node);
      let fired = match op {
        Op::Mul if rv == 1 => { self.replace_with(node, l); true }
        Op::Mul if rv == 0 && !self.has_side_effects(l) => {
          self.ast.nullify(node); true
        }
        Op::Mul if rv > 0 && (rv as u64).is_power_of_two() => {
          let k = self.ast.integer(63 - (rv as u64).leading_zeros() as i64);
          self.ast.get_mut(node).d = Payload::Oper(Op::Shl);
          self.ast.get_mut(node).right = Some(k);
          true
        }
        Op::Mul => {
          // C = 2^a ± 2^b decomposes into shift+add
          if let Some((shift, addsub, first)) = decompose_bits(rv as u32) {
            if addsub != 0 {
              let k1 = self.ast.integer(i64::from(first));
              let t1 = self.ast.operator(Op::Shl, Some(l), Some(k1));
              let l2 = self.ast.dup(l);
              let inner_op = if addsub > 0 { Op::Add } else { Op::Sub };
              let sum = self.ast.operator(inner_op, Some(t1), Some(l2));
              let k2 = self.ast.integer(i64::from(shift));
              self.ast.get_mut(node).d = Payload::Oper(Op::Shl);
              self.ast.get_mut(node).left = Some(sum);
              self.ast.get_mut(node).right = Some(k2);
              true
            } else { false }
          } else { false }
        }
        Op::UnsDiv if rv > 0 && (rv as u64).is_power_of_two() => {
          let k = self.ast.integer(63 - (rv as u64).leading_zeros() as i64);
          self.ast.get_mut(node).d = Payload::Oper(Op::Shr);
          self.ast.get_mut(node).right = Some(k);
          true
        }
        Op::Div if rv == 1 => { self.replace_with(node, l); true }
        Op::Shl | Op::Shr | Op::Sar | Op::Rotl | Op::Rotr if rv == 0 => {
          self.replace_with(node, l); true
        }
        Op::Add | Op::Sub if rv == 0 => { self.replace_with(node, l); true }
        Op::Add | Op::Sub if rv < 0 && rv != i64::from(i32::MIN) => {
          let neg = self.ast.integer(-rv);
          let flip = if op == Op::Add { Op::Sub } else { Op::Add };
          self.ast.get_mut(node).d = Payload::Oper(flip);
          self.ast.get_mut(node).right = Some(neg);
          true
        }
        Op::BitAnd if rv == -1 => { self.replace_with(node, l); true }
        Op::BitAnd if rv == 0 && !self.has_side_effects(l) => {
          self.ast.nullify(node); true
        }
        Op::BitOr | Op::BitXor if rv == 0 => { self.replace_with(node, l); true }
        Op::Gtu if rv == 0 => {
          self.ast.get_mut(node).d = Payload::Oper(Op::Ne);
          true
        }
        Op::Eq if rv == 0 => {
          self.ast.get_mut(node).d = Payload::Oper(Op::BoolNot);
          self.ast.get_mut(node).left = None;
          self.ast.get_mut(node).right = Some(l);
          true
        }
        _ => false,
      };
      self.ast.report_done(save);
      if fired { return true }
    } else if let (_, Some(r)) = (left, right) {
      // L + (-R) can be L - R
      if_chain! {
        if op == Op::Add || op == Op::Sub;
        if self.ast.kind(r) == AstKind::Operator;
        if let Payload::Oper(Op::Negate) = self.ast.get(r).d;
        if let Some(inner) = self.ast.right(r);
        then {
          let flip = if op == Op::Add { Op::Sub } else { Op::Add };
          self.ast.get_mut(node).d = Payload::Oper(flip);
          self.ast.get_mut(node).right = Some(inner);
          return true;
        }
      }
    }
    let _ = op;
    changed
  }

  fn replace_with(&mut self, node: AstId, src: AstId) {
    let span = self.ast.span(node);
    let mut copy = *self.ast.get(src);
    copy.span = span;
    *self.ast.get_mut(node) = copy;
  }

  fn has_side_effects(&self, e: AstId) -> bool {
    let node = self.ast.get(e);
    match node.kind {
      AstKind::FuncCall | AstKind::Assign | AstKind::PostSet
      | AstKind::New | AstKind::Delete | AstKind::CogInit => true,
      AstKind::Operator => {
        if let Payload::Oper(Op::Increment | Op::Decrement) = node.d { return true }
        node.left.is_some_and(|l| self.has_side_effects(l))
          || node.right.is_some_and(|r| self.has_side_effects(r))
      }
      _ => {
        node.left.is_some_and(|l| self.has_side_effects(l))
          || node.right.is_some_and(|r| self.has_side_effects(r))
      }
    }
  }

  /// Whether the selected interpreter has a fast DECODE bytecode.
  fn interp_prefers_decode(&self) -> bool {
    self.options.interp_kind == crate::InterpKind::NuCode
  }

  /// Whether the selected backend can express a native varargs call.
  fn no_varargs_output(&self) -> bool {
    matches!(self.options.output, crate::Output::Bytecode)
  }

  // ---- operator typing ---------------------------------------------------

  fn handle_two_numerics(&mut self, node: AstId, op: Op,
                         lefttype: Option<AstId>, righttype: Option<AstId>) -> AstId {
    let lt = lefttype.unwrap_or_else(|| self.long_type(false));
    let rt = righttype.unwrap_or_else(|| self.long_type(false));
    let lfloat = self.is_float_type(lt);
    let rfloat = self.is_float_type(rt);

    if op == Op::Mods && (lfloat || rfloat) {
      // MOD converts float operands to integer
      if lfloat {
        if let Some(l) = self.ast.left(node) {
          let conv = self.float_to_int(l, lt);
          self.ast.get_mut(node).left = Some(conv);
        }
      }
      if rfloat {
        if let Some(r) = self.ast.right(node) {
          let conv = self.float_to_int(r, rt);
          self.ast.get_mut(node).right = Some(conv);
        }
      }
      let l2 = self.long_type(false);
      return self.handle_two_numerics(node, op, Some(l2), Some(l2));
    }

    if lfloat || rfloat {
      // any float wins: promote the other side, then lower to a helper
      let is64 = self.is_float64_type(lt) || self.is_float64_type(rt);
      if !lfloat {
        if let Some(l) = self.ast.left(node) {
          let conv = self.make_float(Some(lt), l);
          self.ast.get_mut(node).left = Some(conv);
        }
      }
      if !rfloat {
        if let Some(r) = self.ast.right(node) {
          let conv = self.make_float(Some(rt), r);
          self.ast.get_mut(node).right = Some(conv);
        }
      }
      if self.options.fixedreal {
        // 16.16 representation: shifts and multiplies, no helpers
        let l = self.ast.left(node);
        let r = self.ast.right(node);
        match op {
          Op::Mul => {
            let mul = self.ast.operator(Op::Mul, l, r);
            let sixteen = self.ast.integer(16);
            self.ast.get_mut(node).d = Payload::Oper(Op::Sar);
            self.ast.get_mut(node).left = Some(mul);
            self.ast.get_mut(node).right = Some(sixteen);
          }
          Op::Div => {
            let sixteen = self.ast.integer(16);
            let scaled = self.ast.operator(Op::Shl, l, Some(sixteen));
            self.ast.get_mut(node).d = Payload::Oper(Op::Div);
            self.ast.get_mut(node).left = Some(scaled);
            self.ast.get_mut(node).right = r;
          }
          _ => {} // add/sub work unchanged on 16.16
        }
        return self.float_type();
      }
      let helper = match (op, is64) {
        (Op::Add, false) => "_float_add",
        (Op::Sub, false) => "_float_sub",
        (Op::Mul, false) => "_float_mul",
        (Op::Div, false) => "_float_div",
        (Op::Add, true) => "_double_add",
        (Op::Sub, true) => "_double_sub",
        (Op::Mul, true) => "_double_mul",
        (Op::Div, true) => "_double_div",
        _ => {
          let span = self.ast.span(node);
          self.diag.error(span, DiagKind::Type,
                          "operation not supported on float operands");
          return self.float_type();
        }
      };
      let l = self.ast.left(node);
      let r = self.ast.right(node);
      let call = self.make_op_call(helper, node, &[l.unwrap_or(node), r.unwrap_or(node)]);
      self.replace_with(node, call);
      return if is64 { self.double_type() } else { self.float_type() };
    }

    let restype = self.match_integer_types(node, lt, rt);
    if self.type_size(restype) == 8 {
      // 64-bit arithmetic lowers to helper calls
      let unsigned = self.is_unsigned_type(restype);
      let helper = match op {
        Op::Add => "_int64_add",
        Op::Sub => "_int64_sub",
        Op::Mul => if unsigned { "_int64_mulu" } else { "_int64_muls" },
        Op::Div => if unsigned { "_int64_divu" } else { "_int64_divs" },
        Op::Mods => if unsigned { "_int64_modu" } else { "_int64_mods" },
        Op::BitAnd => "_int64_and",
        Op::BitOr => "_int64_or",
        Op::BitXor => "_int64_xor",
        Op::Shl => "_int64_shl",
        Op::Shr => "_int64_shr",
        Op::Sar => "_int64_sar",
        _ => {
          let span = self.ast.span(node);
          self.diag.error(span, DiagKind::Type,
                          "operation not supported on 64-bit operands");
          return restype;
        }
      };
      let l = self.ast.left(node);
      let r = self.ast.right(node);
      let call = self.make_op_call(helper, node, &[l.unwrap_or(node), r.unwrap_or(node)]);
      self.replace_with(node, call);
    }
    restype
  }

  fn compile_comparison(&mut self, node: AstId, op: Op,
                        lefttype: Option<AstId>, righttype: Option<AstId>) -> AstId {
    let lt = lefttype.unwrap_or_else(|| self.long_type(false));
    let rt = righttype.unwrap_or_else(|| self.long_type(false));
    let lfloat = self.is_float_type(lt);
    let rfloat = self.is_float_type(rt);
    if (lfloat || rfloat) && !self.options.fixedreal {
      // lower to a three-way compare helper taking the unordered result
      if !lfloat {
        if let Some(l) = self.ast.left(node) {
          let conv = self.make_float(Some(lt), l);
          self.ast.get_mut(node).left = Some(conv);
        }
      }
      if !rfloat {
        if let Some(r) = self.ast.right(node) {
          let conv = self.make_float(Some(rt), r);
          self.ast.get_mut(node).right = Some(conv);
        }
      }
      let is64 = self.is_float64_type(lt) || self.is_float64_type(rt);
      let helper = if is64 { "_double_cmp" } else { "_float_cmp" };
      let unordered = self.ast.integer(Self::unordered_result(op));
      let l = self.ast.left(node).unwrap_or(node);
      let r = self.ast.right(node).unwrap_or(node);
      let call = self.make_op_call(helper, node, &[l, r, unordered]);
      let zero = self.ast.integer(0);
      // x < y  =>  _float_cmp(x, y, u) < 0
      let signed_op = match op {
        Op::Ltu => Op::Lt, Op::Gtu => Op::Gt,
        Op::Leu => Op::Le, Op::Geu => Op::Ge,
        other => other,
      };
      self.ast.get_mut(node).d = Payload::Oper(signed_op);
      self.ast.get_mut(node).left = Some(call);
      self.ast.get_mut(node).right = Some(zero);
      return self.cur_bool_type();
    }
    // mixed signed/unsigned at the same width is signed-dominant,
    // but a genuinely unsigned pair selects the unsigned comparison
    let bothuns = self.is_unsigned_type(lt) && self.is_unsigned_type(rt);
    if bothuns {
      let flip = match op {
        Op::Lt => Op::Ltu, Op::Gt => Op::Gtu,
        Op::Le => Op::Leu, Op::Ge => Op::Geu,
        other => other,
      };
      self.ast.get_mut(node).d = Payload::Oper(flip);
    }
    self.match_integer_types(node, lt, rt);
    self.cur_bool_type()
  }

  // ---- assignment coercion ----------------------------------------------

  /// Coerce `expr` (the `right` child of `node`) to `desttype`. Returns
  /// the resulting type.
  pub fn coerce_assign(&mut self, node: AstId, desttype: AstId,
                       srctype: Option<AstId>, what: &str) -> AstId {
    let Some(expr) = self.ast.right(node) else { return desttype };
    let srctype = match srctype {
      Some(t) => t,
      None => return desttype,
    };
    let span = self.ast.span(node);
    let dest = self.remove_type_modifiers(desttype);
    let src = self.remove_type_modifiers(srctype);

    // arrays decay to pointers
    if self.is_array_type(src) && self.is_pointer_type(dest) {
      let addr = self.ast.new_node(AstKind::AddrOf, Some(expr), None);
      self.ast.get_mut(node).right = Some(addr);
      return desttype;
    }
    // functions decay to method pointers
    if self.is_func_type(src) && !self.is_func_type(dest) {
      let fptr = self.ast.new_node(AstKind::SimpleFuncPtr, Some(expr), None);
      self.bump_method_ptr(expr);
      self.ast.get_mut(node).right = Some(fptr);
      return desttype;
    }
    // interface conversion
    if_chain! {
      if self.is_class_type(dest);
      if let Some(di) = self.class_ptr(dest);
      if self.module(di).is_interface;
      if self.is_class_type(src) || (self.is_pointer_type(src)
        && self.base_type(src).is_some_and(|b| self.is_class_type(b)));
      then {
        let classty = if self.is_class_type(src) { src }
          else { self.base_type(src).expect("checked above") };
        if let Some(call) = self.convert_interface(dest, classty, expr) {
          self.ast.get_mut(node).right = Some(call);
          return desttype;
        }
      }
    }
    // int/float conversions
    if self.is_float_type(dest) && self.is_int_type(src) {
      let conv = self.make_float(Some(src), expr);
      self.ast.get_mut(node).right = Some(conv);
      return desttype;
    }
    if self.is_int_type(dest) && self.is_float_type(src) {
      let conv = self.float_to_int(expr, src);
      self.ast.get_mut(node).right = Some(conv);
      return desttype;
    }
    // small integers widen
    if self.is_int_type(dest) && self.is_int_type(src) {
      let ssize = self.type_size(src);
      let dsize = self.type_size(dest);
      if ssize < dsize {
        let conv = self.do_promote(expr, ssize, dsize, self.is_unsigned_type(src));
        self.ast.get_mut(node).right = Some(conv);
      }
      return desttype;
    }
    // const-ness is dropped with a warning
    if self.ast.kind(srctype) == AstKind::ModifierConst
      && self.ast.kind(desttype) != AstKind::ModifierConst
      && self.is_pointer_type(dest) && self.is_pointer_type(src)
    {
      self.diag.warning(span, DiagKind::Type,
                        format!("{what} discards const qualifier"));
      return desttype;
    }
    if !self.compatible_types(Some(dest), Some(src)) {
      self.diag.error(span, DiagKind::Type,
        format!("incompatible types in {what}"));
    }
    desttype
  }

  fn bump_method_ptr(&mut self, expr: AstId) {
    if let Some(name) = self.ast.ident_name(expr) {
      if let Some(e) = self.lookup_symbol(name) {
        if let (SymKind::Function, SymVal::Func(f)) = (e.kind, e.val) {
          self.func_mut(f).method_ptr_uses += 1;
        }
      }
    }
  }

  // ---- the recursive walk ------------------------------------------------

  /// Type-check and rewrite `ast`, returning its type (None for
  /// statements and for expressions whose type could not be inferred,
  /// which also reports an error).
  pub fn check_types(&mut self, ast: AstId) -> Option<AstId> {
    if self.diag.too_many() { return None }
    let node = *self.ast.get(ast);
    match node.kind {
      AstKind::Integer | AstKind::BitValue => Some(self.long_type(false)),
      AstKind::Float => Some(self.float_type()),
      AstKind::String => {
        let b = self.byte_type(true);
        let c = self.ast.new_node(AstKind::ModifierConst, Some(b), None);
        Some(self.ptr_type(c))
      }
      AstKind::StringPtr => {
        let b = self.byte_type(true);
        Some(self.ptr_type(b))
      }
      AstKind::Identifier | AstKind::LocalIdentifier => {
        let name = self.ast.ident_name(ast)?;
        match self.lookup_symbol(name) {
          Some(e) => match (e.kind, e.val) {
            (SymKind::Constant, _) => Some(self.long_type(false)),
            (SymKind::FloatConstant, _) => Some(self.float_type()),
            (SymKind::Variable | SymKind::LocalVar | SymKind::TempVar
             | SymKind::Parameter | SymKind::Result, SymVal::Ast(t)) => Some(t),
            (SymKind::Function, SymVal::Func(f)) => {
              self.func(f).overall_type
                .or_else(|| Some(self.generic_type()))
            }
            (SymKind::Label, _) => Some(self.generic_type()),
            (SymKind::HwReg, _) => Some(self.long_type(true)),
            _ => Some(self.generic_type()),
          },
          None => {
            self.diag.error(node.span, DiagKind::Symbol,
                            format!("unknown symbol {name}"));
            None
          }
        }
      }
      AstKind::Operator => {
        let lt = node.left.and_then(|l| self.check_types(l));
        let rt = node.right.and_then(|r| self.check_types(r));
        self.optimize_operator(ast);
        // re-read: the rewrite may have replaced the node outright
        let node = *self.ast.get(ast);
        let Payload::Oper(op) = node.d else {
          return self.check_types_shallow(ast, lt, rt);
        };
        match op {
          Op::Add | Op::Sub => {
            // pointer arithmetic scales by the target size
            let lptr = lt.is_some_and(|t| self.is_pointer_type(t));
            let rptr = rt.is_some_and(|t| self.is_pointer_type(t));
            if lptr && rptr && op == Op::Sub {
              let base = lt.and_then(|t| self.base_type(t));
              let size = base.map_or(1, |b| self.type_size(b));
              if size > 1 {
                let l = self.ast.left(ast);
                let r = self.ast.right(ast);
                let diff = self.ast.operator(Op::Sub, l, r);
                let k = self.ast.integer(i64::from(size));
                self.ast.get_mut(ast).d = Payload::Oper(Op::Div);
                self.ast.get_mut(ast).left = Some(diff);
                self.ast.get_mut(ast).right = Some(k);
              }
              return Some(self.long_type(false));
            }
            if lptr || rptr {
              let (pt, scaled_side) = if lptr { (lt, false) } else { (rt, true) };
              let base = pt.and_then(|t| self.base_type(t));
              let size = base.map_or(1, |b| self.type_size(b));
              if size > 1 {
                let side = if scaled_side { self.ast.left(ast) } else { self.ast.right(ast) };
                if let Some(s) = side {
                  let k = self.ast.integer(i64::from(size));
                  let scaled = self.ast.operator(Op::Mul, Some(s), Some(k));
                  let folded = self.fold_if_const(scaled);
                  if scaled_side {
                    self.ast.get_mut(ast).left = Some(folded);
                  } else {
                    self.ast.get_mut(ast).right = Some(folded);
                  }
                }
              }
              return pt;
            }
            Some(self.handle_two_numerics(ast, op, lt, rt))
          }
          Op::Mul | Op::Div | Op::Mods => {
            Some(self.handle_two_numerics(ast, op, lt, rt))
          }
          Op::BitAnd | Op::BitOr | Op::BitXor | Op::Shl | Op::Rotl | Op::Rotr => {
            Some(self.handle_two_numerics(ast, op, lt, rt))
          }
          Op::Shr | Op::Sar => {
            // shift right is SAR for signed left sides, SHR otherwise
            let signed = lt.is_some_and(|t| {
              self.is_int_type(t) && !self.is_unsigned_type(t)
            });
            let actual = if signed { Op::Sar } else { Op::Shr };
            if self.ast.kind(ast) == AstKind::Operator {
              self.ast.get_mut(ast).d = Payload::Oper(actual);
            }
            Some(self.handle_two_numerics(ast, actual, lt, rt))
          }
          Op::Lt | Op::Gt | Op::Le | Op::Ge | Op::Eq | Op::Ne
          | Op::Ltu | Op::Gtu | Op::Leu | Op::Geu => {
            Some(self.compile_comparison(ast, op, lt, rt))
          }
          Op::BoolAnd | Op::BoolOr | Op::BoolNot | Op::BoolXor
          | Op::LogicAnd | Op::LogicOr | Op::LogicXor => {
            Some(self.cur_bool_type())
          }
          Op::Negate | Op::Abs | Op::BitNot => {
            let t = rt.or(lt);
            if t.is_some_and(|t| self.is_float_type(t)) && !self.options.fixedreal {
              let arg = node.right.or(node.left)?;
              let helper = match op {
                Op::Negate => "_float_negate",
                Op::Abs => "_float_abs",
                _ => {
                  let conv = self.float_to_int(arg, t.expect("checked"));
                  self.ast.get_mut(ast).right = Some(conv);
                  return Some(self.long_type(false));
                }
              };
              let call = self.make_op_call(helper, ast, &[arg]);
              self.replace_with(ast, call);
              return Some(self.float_type());
            }
            t.or_else(|| Some(self.long_type(false)))
          }
          _ => Some(self.long_type(false)),
        }
      }
      AstKind::Assign => {
        let desttype = node.left.and_then(|l| self.check_types(l));
        let srctype = node.right.and_then(|r| self.check_types(r));
        // multi-return: a tuple satisfies several targets
        if_chain! {
          if let Some(l) = node.left;
          if self.ast.kind(l) == AstKind::ExprList;
          then {
            let wanted = self.ast.list_len(Some(l));
            if let Some(st) = srctype {
              if self.ast.kind(st) == AstKind::TupleType {
                let got = self.ast.list_len(self.ast.left(st));
                if wanted != got {
                  self.diag.error(node.span, DiagKind::Type,
                    format!("expected {wanted} values on left of assignment, got {got}"));
                }
              }
            }
            return srctype;
          }
        }
        if !self.check_lvalue(node.left) {
          self.diag.error(node.span, DiagKind::Type,
                          "left side of assignment is not an lvalue");
          return None;
        }
        match desttype {
          Some(dt) => Some(self.coerce_assign(ast, dt, srctype, "assignment")),
          None => srctype,
        }
      }
      AstKind::FuncCall => self.check_call(ast),
      AstKind::AddrOf | AstKind::AbsAddrOf => {
        let inner = node.left?;
        let it = self.check_types(inner);
        // taking the address of a function makes a method pointer
        if it.is_some_and(|t| self.is_func_type(t)) {
          self.bump_method_ptr(inner);
          let save = self.ast.report_as(ast);
          let fptr = self.ast.new_node(AstKind::SimpleFuncPtr, Some(inner), None);
          self.ast.report_done(save);
          self.replace_with(ast, fptr);
          let g = self.generic_type();
          return Some(self.ptr_type(g));
        }
        let base = it.unwrap_or_else(|| self.generic_type());
        Some(self.ptr_type(base))
      }
      AstKind::DatAddrOf => {
        let g = self.generic_type();
        Some(self.ptr_type(g))
      }
      AstKind::ArrayRef => {
        let at = node.left.and_then(|l| self.check_types(l));
        node.right.and_then(|r| self.check_types(r));
        at.and_then(|t| self.base_type(t))
          .or_else(|| Some(self.long_type(false)))
      }
      AstKind::MemRef => {
        // left is the type, right the address expression
        node.right.and_then(|r| self.check_types(r));
        node.left
      }
      AstKind::Cast => {
        let desttype = node.left?;
        let srctype = node.right.and_then(|r| self.check_types(r));
        if_chain! {
          if let Some(st) = srctype;
          if self.is_class_type(desttype);
          if let Some(m) = self.class_ptr(desttype);
          if self.module(m).is_interface;
          if self.is_class_type(st);
          then {
            if let Some(r) = node.right {
              if let Some(call) = self.convert_interface(desttype, st, r) {
                self.ast.get_mut(ast).right = Some(call);
              }
            }
          }
        }
        Some(desttype)
      }
      AstKind::VaArg => {
        // va_arg(T): read through the buffer pointer, then bump it
        let ty = node.left?;
        let ptr = node.right?;
        self.check_types(ptr)?;
        let save = self.ast.report_as(ast);
        let size = self.type_size(ty);
        let read = self.ast.new_node(AstKind::MemRef, Some(ty), Some(ptr));
        let k = self.ast.integer(i64::from(size));
        let ptr2 = self.ast.dup(ptr);
        let bump = self.ast.operator(Op::Add, Some(ptr2), Some(k));
        let ptr3 = self.ast.dup(ptr);
        let store = self.ast.assign(ptr3, bump);
        let seq_inner = self.ast.new_node(AstKind::Sequence, Some(store), Some(read));
        self.ast.report_done(save);
        self.replace_with(ast, seq_inner);
        Some(ty)
      }
      AstKind::SizeOf => {
        let ty = node.left?;
        let size = self.type_size(ty);
        let save = self.ast.report_as(ast);
        let k = self.ast.integer(i64::from(size));
        self.ast.report_done(save);
        self.replace_with(ast, k);
        Some(self.long_type(true))
      }
      AstKind::CondResult => {
        node.left.and_then(|l| self.check_types(l));
        let te = node.right?;
        let tt = self.ast.left(te).and_then(|t| self.check_types(t));
        self.ast.right(te).and_then(|e| self.check_types(e));
        tt
      }
      AstKind::Sequence => {
        node.left.and_then(|l| self.check_types(l));
        node.right.and_then(|r| self.check_types(r))
      }
      AstKind::ExprList => {
        let mut tys: Option<AstId> = None;
        let items: Vec<AstId> = self.ast.list_iter(Some(ast)).collect();
        let n = items.len();
        for item in items {
          let t = self.check_types(item);
          if let Some(t) = t {
            let cell = self.ast.expr_item(t);
            tys = Some(self.ast.list_append(tys, cell));
          }
        }
        if n > 1 {
          Some(self.ast.new_node(AstKind::TupleType, tys, None))
        } else {
          tys.and_then(|t| self.ast.left(t))
        }
      }
      // statements: walk children, no type
      AstKind::StmtList | AstKind::CommentedNode | AstKind::If
      | AstKind::ThenElse | AstKind::While | AstKind::DoWhile
      | AstKind::For | AstKind::ForAtLeastOnce | AstKind::Case
      | AstKind::CaseItem | AstKind::Other | AstKind::Scope => {
        node.left.and_then(|l| self.check_types(l));
        node.right.and_then(|r| self.check_types(r));
        None
      }
      AstKind::Return => {
        let rt = node.left.and_then(|l| self.check_types(l));
        if_chain! {
          if let Some(f) = self.current_function;
          if let Some(ft) = self.func(f).overall_type;
          if let Some(want) = self.ast.left(ft);
          if let Some(got) = rt;
          then {
            if !self.compatible_types(Some(want), Some(got)) {
              self.diag.error(node.span, DiagKind::Type,
                              "incompatible return type");
            }
          }
        }
        None
      }
      _ => {
        node.left.and_then(|l| self.check_types(l));
        node.right.and_then(|r| self.check_types(r));
        Some(self.generic_type())
      }
    }
  }

  fn check_types_shallow(&mut self, ast: AstId, lt: Option<AstId>,
                         rt: Option<AstId>) -> Option<AstId> {
    // the peephole replaced the operator with a plain expression
    match self.ast.kind(ast) {
      AstKind::Integer => Some(self.long_type(false)),
      _ => lt.or(rt),
    }
  }

  fn check_lvalue(&self, e: Option<AstId>) -> bool {
    let Some(e) = e else { return false };
    match self.ast.kind(e) {
      AstKind::Identifier | AstKind::LocalIdentifier | AstKind::ArrayRef
      | AstKind::MemRef | AstKind::MethodRef | AstKind::HwReg
      | AstKind::Result | AstKind::SprRef | AstKind::RangeRef
      | AstKind::ExprList => true,
      AstKind::Operator => {
        matches!(self.ast.get(e).d, Payload::Oper(Op::Increment | Op::Decrement))
      }
      _ => false,
    }
  }

  fn check_call(&mut self, ast: AstId) -> Option<AstId> {
    let node = *self.ast.get(ast);
    let funcnode = node.left?;
    let ftype = self.check_types(funcnode);
    let Some(ftype) = ftype else {
      return None;
    };
    if !self.is_func_type(ftype) && !self.is_generic_type(ftype)
      && !(self.is_pointer_type(ftype)
           && self.base_type(ftype).is_some_and(|b| self.is_func_type(b)))
    {
      self.diag.error(node.span, DiagKind::Type, "called object is not a function");
      return None;
    }
    let ftype = if self.is_pointer_type(ftype) {
      self.base_type(ftype).unwrap_or(ftype)
    } else { ftype };

    let params: Vec<AstId> = self.ast.list_iter(self.ast.right(ftype)).collect();
    let args: Vec<AstId> = {
      let mut v = Vec::new();
      let mut cur = node.right;
      while let Some(cell) = cur {
        v.push(cell);
        cur = self.ast.right(cell);
      }
      v
    };
    let variadic = params.last()
      .is_some_and(|&p| self.ast.kind(p) == AstKind::VarArgs);
    let fixed = if variadic { params.len() - 1 } else { params.len() };
    if !self.is_generic_type(ftype) && !params.is_empty() {
      if args.len() < fixed || (!variadic && args.len() > fixed) {
        self.diag.error(node.span, DiagKind::Type,
          format!("expected {fixed} arguments, got {}", args.len()));
      }
    }
    for (i, &argcell) in args.iter().enumerate() {
      let Some(arg) = self.ast.left(argcell) else { continue };
      let at = self.check_types(arg);
      if i < fixed && !params.is_empty() && !self.is_generic_type(ftype) {
        let pty = self.param_type(params[i]);
        if let Some(pty) = pty {
          // large structs declared copyref are boxed on the heap
          if self.ast.kind(self.remove_type_modifiers(pty)) == AstKind::CopyRefType {
            let boxed = self.box_on_heap(arg);
            self.ast.get_mut(argcell).left = Some(boxed);
            continue;
          }
          // reuse the assignment machinery for argument conversion
          let fake = self.ast.new_node(AstKind::Assign, None, Some(arg));
          self.coerce_assign(fake, pty, at, "argument passing");
          if let Some(newarg) = self.ast.right(fake) {
            self.ast.get_mut(argcell).left = Some(newarg);
          }
        }
      }
    }
    // variadic tails become a heap buffer on backends without native
    // varargs support
    if variadic && self.no_varargs_output() && args.len() > fixed {
      self.rewrite_varargs_tail(ast, &args[fixed..]);
    }
    // return type
    self.ast.left(ftype).or_else(|| Some(self.generic_type()))
  }

  fn param_type(&self, p: AstId) -> Option<AstId> {
    match self.ast.kind(p) {
      AstKind::DeclareVar => self.ast.left(p),
      AstKind::Identifier | AstKind::LocalIdentifier => None,
      _ => Some(p),
    }
  }

  /// Box `arg` on the managed heap: allocate, copy, pass the pointer.
  fn box_on_heap(&mut self, arg: AstId) -> AstId {
    self.need_heap = true;
    let save = self.ast.report_as(arg);
    let at = self.ast.new_node(AstKind::AddrOf, Some(arg), None);
    let size_of = self.expr_byte_size(arg);
    let size = self.ast.integer(i64::from(size_of));
    let alloc = self.make_op_call("_gc_alloc_managed", arg, &[size]);
    let size2 = self.ast.integer(i64::from(size_of));
    let copy = self.make_op_call("__builtin_memcpy", arg, &[alloc, at, size2]);
    self.ast.report_done(save);
    copy
  }

  fn expr_byte_size(&mut self, e: AstId) -> i32 {
    if let Some(name) = self.ast.ident_name(e) {
      if let Some(ent) = self.lookup_symbol(name) {
        if let SymVal::Ast(t) = ent.val {
          return self.type_size(t);
        }
      }
    }
    LONG_SIZE
  }

  /// Rewrite a variadic tail into an explicit heap buffer: allocate it,
  /// store each argument at its natural offset, pass the buffer pointer
  /// in place of the tail.
  fn rewrite_varargs_tail(&mut self, call: AstId, tail: &[AstId]) {
    self.need_heap = true;
    let total: i32 = tail.len() as i32 * LONG_SIZE;
    let Some(first_cell) = tail.first().copied() else { return };
    let save = self.ast.report_as(call);
    let size = self.ast.integer(i64::from(total));
    let alloc = self.make_op_call("_gc_alloc_managed", call, &[size]);
    let bufname = self.ast.temp_identifier("_varargs_");
    let setup = self.ast.assign(bufname, alloc);
    // store each argument into the buffer
    let mut seq = setup;
    for (i, &cell) in tail.iter().enumerate() {
      let Some(arg) = self.ast.left(cell) else { continue };
      let base = self.ast.dup(bufname);
      let off = self.ast.integer(i64::from(i as i32 * LONG_SIZE));
      let addr = self.ast.operator(Op::Add, Some(base), Some(off));
      let long_t = self.long_type(false);
      let slot = self.ast.new_node(AstKind::MemRef, Some(long_t), Some(addr));
      let store = self.ast.assign(slot, arg);
      seq = self.ast.new_node(AstKind::Sequence, Some(seq), Some(store));
    }
    let result = self.ast.dup(bufname);
    let boxed = self.ast.new_node(AstKind::Sequence, Some(seq), Some(result));
    // first tail cell now carries the buffer, the rest disappear
    self.ast.get_mut(first_cell).left = Some(boxed);
    self.ast.get_mut(first_cell).right = None;
    self.ast.report_done(save);
  }
}

/// Decompose `val` into shift/add form: returns
/// `(final_shift, +1 | -1 | 0, initial_shift)` when `val` is
/// `2^a`, `(2^b + 1) << a` or `(2^b - 1) << a`; `None` otherwise.
#[must_use] pub fn decompose_bits(val: u32) -> Option<(u32, i32, u32)> {
  if val == 0 { return None }
  let shift = val.trailing_zeros();
  let v = val >> shift;
  if v == 1 { return Some((shift, 0, 0)) }
  if (v - 1).is_power_of_two() {
    return Some((shift, 1, (v - 1).trailing_zeros()));
  }
  if (v + 1).is_power_of_two() {
    return Some((shift, -1, (v + 1).trailing_zeros()));
  }
  None
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::{Compiler, Options, Language, Output};
  use crate::types::ast::AstKind;

  fn session() -> Compiler {
    let mut c = Compiler::new(Options::default());
    c.diag.capture();
    let m = c.new_module("t.spin2", Language::Spin2);
    c.current_module = Some(m);
    c
  }

  fn declare_var(c: &mut Compiler, name: &str, ty: AstId) {
    let m = c.current_module.unwrap();
    let ident = c.ast.identifier(name);
    c.declare_one_member_var(m, ident, ty);
  }

  #[test]
  fn decompose() {
    assert_eq!(decompose_bits(8), Some((3, 0, 0)));
    assert_eq!(decompose_bits(10), Some((1, 1, 2)));   // (4+1)<<1
    assert_eq!(decompose_bits(7), Some((0, -1, 3)));   // 8-1
    assert_eq!(decompose_bits(22), None);
    assert_eq!(decompose_bits(0), None);
  }

  #[test]
  fn constant_folds_through_operator() {
    let mut c = session();
    let two = c.ast.integer(2);
    let three = c.ast.integer(3);
    let sum = c.ast.operator(Op::Add, Some(two), Some(three));
    let x = c.ast.identifier("x");
    let long_t = c.long_type(false);
    declare_var(&mut c, "x", long_t);
    let assign = c.ast.assign(x, sum);
    let t = c.check_types(assign);
    assert!(t.is_some());
    assert_eq!(c.diag.errors(), 0, "{:?}", c.diag.captured());
  }

  #[test]
  fn mul_pow2_becomes_shift() {
    let mut c = session();
    let long_t = c.long_type(false);
    declare_var(&mut c, "x", long_t);
    let x = c.ast.identifier("x");
    let eight = c.ast.integer(8);
    let mul = c.ast.operator(Op::Mul, Some(x), Some(eight));
    c.check_types(mul);
    assert_eq!(c.ast.get(mul).d, Payload::Oper(Op::Shl));
    assert_eq!(c.ast.right(mul).and_then(|r| c.try_const_val(r)), Some(3));
  }

  #[test]
  fn nested_add_folds() {
    let mut c = session();
    let long_t = c.long_type(false);
    declare_var(&mut c, "x", long_t);
    let x = c.ast.identifier("x");
    let two = c.ast.integer(2);
    let inner = c.ast.operator(Op::Add, Some(x), Some(two));
    let three = c.ast.integer(3);
    let outer = c.ast.operator(Op::Add, Some(inner), Some(three));
    c.check_types(outer);
    // (x+2)+3 => x+5
    assert_eq!(c.ast.right(outer).and_then(|r| c.try_const_val(r)), Some(5));
    assert!(c.ast.is_identifier(c.ast.left(outer).unwrap()));
  }

  #[test]
  fn shift_right_signedness() {
    let mut c = session();
    let l = c.long_type(false);
    let ul = c.long_type(true);
    declare_var(&mut c, "s", l);
    declare_var(&mut c, "u", ul);
    let s = c.ast.identifier("s");
    let one = c.ast.integer(1);
    let shr_s = c.ast.operator(Op::Shr, Some(s), Some(one));
    c.check_types(shr_s);
    assert_eq!(c.ast.get(shr_s).d, Payload::Oper(Op::Sar), "signed lhs uses SAR");
    let u = c.ast.identifier("u");
    let one2 = c.ast.integer(1);
    let shr_u = c.ast.operator(Op::Shr, Some(u), Some(one2));
    c.check_types(shr_u);
    assert_eq!(c.ast.get(shr_u).d, Payload::Oper(Op::Shr));
  }

  #[test]
  fn float_add_lowered_to_helper() {
    let mut c = session();
    let f = c.float_type();
    declare_var(&mut c, "fv", f);
    let fv = c.ast.identifier("fv");
    let one = c.ast.integer(1);
    let add = c.ast.operator(Op::Add, Some(fv), Some(one));
    let t = c.check_types(add).unwrap();
    assert!(c.is_float_type(t));
    assert_eq!(c.ast.kind(add), AstKind::FuncCall);
    let callee = c.ast.left(add).unwrap();
    assert_eq!(c.ast.ident_name(callee), Some(crate::symbol::intern("_float_add")));
  }

  #[test]
  fn float_compare_uses_unordered_result() {
    let mut c = session();
    let f = c.float_type();
    declare_var(&mut c, "fv", f);
    let fv = c.ast.identifier("fv");
    let fv2 = c.ast.identifier("fv");
    let cmp = c.ast.operator(Op::Gt, Some(fv), Some(fv2));
    c.check_types(cmp);
    // rewritten to _float_cmp(l, r, -1) > 0
    assert_eq!(c.ast.get(cmp).d, Payload::Oper(Op::Gt));
    let call = c.ast.left(cmp).unwrap();
    assert_eq!(c.ast.kind(call), AstKind::FuncCall);
    let args: Vec<_> = c.ast.list_iter(c.ast.right(call)).collect();
    assert_eq!(args.len(), 3);
    assert_eq!(c.try_const_val(args[2]), Some(-1), "unordered result for >");
  }

  #[test]
  fn fixedreal_mul_is_shift_and_mul() {
    let mut opts = Options::default();
    opts.fixedreal = true;
    let mut c = Compiler::new(opts);
    c.diag.capture();
    let m = c.new_module("t.spin2", Language::Spin2);
    c.current_module = Some(m);
    let f = c.float_type();
    declare_var(&mut c, "fv", f);
    let fv = c.ast.identifier("fv");
    let fv2 = c.ast.identifier("fv");
    let mul = c.ast.operator(Op::Mul, Some(fv), Some(fv2));
    c.check_types(mul);
    assert_eq!(c.ast.get(mul).d, Payload::Oper(Op::Sar),
               "16.16 multiply ends in a sar 16, no helper call");
  }

  #[test]
  fn int64_add_lowered() {
    let mut c = session();
    let q = c.long64_type(false);
    declare_var(&mut c, "big", q);
    let b = c.ast.identifier("big");
    let one = c.ast.integer(1);
    let add = c.ast.operator(Op::Add, Some(b), Some(one));
    c.check_types(add);
    assert_eq!(c.ast.kind(add), AstKind::FuncCall);
    let callee = c.ast.left(add).unwrap();
    assert_eq!(c.ast.ident_name(callee), Some(crate::symbol::intern("_int64_add")));
  }

  #[test]
  fn pointer_arithmetic_scales() {
    let mut c = session();
    let l = c.long_type(false);
    let pl = c.ptr_type(l);
    declare_var(&mut c, "p", pl);
    let p = c.ast.identifier("p");
    let three = c.ast.integer(3);
    let add = c.ast.operator(Op::Add, Some(p), Some(three));
    let t = c.check_types(add).unwrap();
    assert!(c.is_pointer_type(t));
    assert_eq!(c.ast.right(add).and_then(|r| c.try_const_val(r)), Some(12),
               "p + 3 scales by sizeof(long)");
  }

  #[test]
  fn sizeof_collapses() {
    let mut c = session();
    let w = c.word_type(false);
    let arr = c.array_type(w, 5);
    let so = c.ast.new_node(AstKind::SizeOf, Some(arr), None);
    let t = c.check_types(so).unwrap();
    assert!(c.is_unsigned_type(t));
    assert_eq!(c.try_const_val(so), Some(10));
  }

  #[test]
  fn assignment_rejects_incompatible() {
    let mut c = session();
    let l = c.long_type(false);
    let pl = c.ptr_type(l);
    let f = c.float_type();
    declare_var(&mut c, "p", pl);
    declare_var(&mut c, "g", f);
    // assigning a pointer into... another pointer type of float is fine
    // via generic, but float into pointer errors
    let p = c.ast.identifier("p");
    let g = c.ast.identifier("g");
    let assign = c.ast.assign(p, g);
    c.check_types(assign);
    assert!(c.diag.errors() > 0);
  }

  #[test]
  fn not_an_lvalue() {
    let mut c = session();
    let one = c.ast.integer(1);
    let two = c.ast.integer(2);
    let assign = c.ast.assign(one, two);
    c.check_types(assign);
    assert_eq!(c.diag.errors(), 1);
  }

  #[test]
  fn varargs_tail_boxed_for_bytecode() {
    let mut opts = Options::default();
    opts.output = Output::Bytecode;
    let mut c = Compiler::new(opts);
    c.diag.capture();
    let m = c.new_module("t.spin2", Language::Spin2);
    c.current_module = Some(m);

    // declare printf-ish: f(fmt, ...)
    let b = c.byte_type(true);
    let pb = c.ptr_type(b);
    let fmt_param = c.ast.new_node(AstKind::DeclareVar, Some(pb), None);
    let fp = c.ast.new_node(AstKind::ListHolder, Some(fmt_param), None);
    let va = c.ast.new_node(AstKind::VarArgs, None, None);
    let vp = c.ast.new_node(AstKind::ListHolder, Some(va), None);
    let params = c.ast.list_append(Some(fp), vp);
    let void = c.void_type();
    let fty = c.func_type(Some(void), Some(params));
    let fname = crate::symbol::intern("emit");
    let m0 = c.current_module.unwrap();
    c.modules[m0.idx()].objsyms
      .add(fname, SymKind::Variable, SymVal::Ast(fty)).unwrap();

    let callee = c.ast.identifier("emit");
    let a0 = c.ast.string_ptr("x=%d");
    let a1 = c.ast.integer(42);
    let a2 = c.ast.integer(43);
    let cells: Vec<_> = [a0, a1, a2].iter().map(|&a| c.ast.expr_item(a)).collect();
    let mut args = None;
    for cell in cells { args = Some(c.ast.list_append(args, cell)) }
    let call = c.ast.new_node(AstKind::FuncCall, Some(callee), args);
    c.check_types(call);
    assert_eq!(c.diag.errors(), 0, "{:?}", c.diag.captured());
    assert!(c.need_heap, "varargs boxing marks the heap as needed");
    // tail collapsed into one boxed argument
    let arglist: Vec<_> = c.ast.list_iter(c.ast.right(call)).collect();
    assert_eq!(arglist.len(), 2);
    assert_eq!(c.ast.kind(arglist[1]), AstKind::Sequence);
  }
}
