//! DAT block serialisation: data directives, PASM instructions,
//! initialised globals, and the relocation side channel.
//!
//! Relocations are emitted into a parallel buffer, sorted by construction
//! (the walk only ever appends at increasing offsets), so consumers can
//! process them in lockstep with the byte stream. Debug (source line)
//! entries share the same record shape.

use bitflags::bitflags;
use byteorder::{ByteOrder, LE};
use crate::{Compiler, LONG_SIZE, ModuleId};
use crate::diag::DiagKind;
use crate::symbol::Symbol;
use crate::types::{AstId, SrcSpan};
use crate::types::ast::{AstKind, Op, Payload};
use crate::types::entity::{Lookup, SymKind, SymVal};

bitflags! {
  #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
  pub struct LabelFlags: u8 {
    const USED_IN_SPIN      = 0x01;
    const NEEDS_EXTRA_ALIGN = 0x02;
    const IN_HUB            = 0x04;
    const HAS_INSTR         = 0x08;
    const HAS_JMP           = 0x10;
  }
}

/// A data-block label.
#[derive(Clone, Debug)]
pub struct DatLabel {
  /// For P1, offset in the DAT block; for P2, a real hub address.
  pub hubval: u32,
  /// Cog address in bytes (divide by 4 for most uses).
  pub cogval: u32,
  /// Type of the data following the label.
  pub ty: Option<AstId>,
  /// The ORG origin symbol it was defined under, if any.
  pub org: Option<Symbol>,
  pub flags: LabelFlags,
}

/// Relocation (and debug-entry) kinds.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RelocKind {
  None,
  /// Source-line marker for listings/debuggers.
  Debug,
  /// 32-bit absolute value to be offset by the DAT base.
  I32,
  /// Immediate carried by an AUGS prefix.
  AugS,
  /// Immediate carried by an AUGD prefix.
  AugD,
  /// 16-bit function pointer.
  FPtr16,
  /// 12-bit function pointer.
  FPtr12,
}

/// One relocation record. `sym == None` means "relative to the DAT base
/// itself".
#[derive(Clone, Debug)]
pub struct Reloc {
  pub kind: RelocKind,
  /// Byte offset from the DAT base this entry affects.
  pub addr: u32,
  pub sym: Option<Symbol>,
  pub symoff: i32,
  /// Debug entries: the source location this address came from.
  pub span: Option<SrcSpan>,
}

/// The output sink for a DAT walk: byte buffer, data counter (which
/// drives alignment independently of any prefix already in the buffer),
/// and the relocation stream.
pub struct DatOut {
  pub data: Vec<u8>,
  pub datacount: usize,
  pub relocs: Vec<Reloc>,
  pub collect_relocs: bool,
}

impl DatOut {
  #[must_use] pub fn new(collect_relocs: bool) -> Self {
    DatOut { data: Vec::new(), datacount: 0, relocs: Vec::new(), collect_relocs }
  }

  pub fn put_byte(&mut self, b: u8) {
    self.data.push(b);
    self.datacount += 1;
  }

  pub fn put_word(&mut self, w: u16) {
    let mut buf = [0u8; 2];
    LE::write_u16(&mut buf, w);
    for b in buf { self.put_byte(b) }
  }

  pub fn put_long(&mut self, l: u32) {
    let mut buf = [0u8; 4];
    LE::write_u32(&mut buf, l);
    for b in buf { self.put_byte(b) }
  }

  /// Zero-fill until `datacount` is a multiple of `size`.
  pub fn align_pc(&mut self, size: usize) {
    if size <= 1 { return }
    while self.datacount % size != 0 { self.put_byte(0) }
  }

  pub fn here(&self) -> u32 { self.data.len() as u32 }

  fn add_reloc(&mut self, kind: RelocKind, sym: Option<Symbol>, symoff: i32) -> Option<usize> {
    if !self.collect_relocs { return None }
    self.relocs.push(Reloc { kind, addr: self.here(), sym, symoff, span: None });
    Some(self.relocs.len() - 1)
  }

  pub fn add_debug_entry(&mut self, span: SrcSpan) {
    if !self.collect_relocs { return }
    let addr = self.here();
    self.relocs.push(Reloc { kind: RelocKind::Debug, addr, sym: None, symoff: 0, span: Some(span) });
  }
}

/// Result of relocatability analysis.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelocCheck {
  /// Plain compile-time constant.
  NotRelocatable,
  /// Needs a 32-bit relocation against the symbol (or the DAT base).
  Relocatable,
  /// Math that cannot be performed on a load-time value.
  IllegalMath,
}

const CHECKSIZE_NONE: u8 = 0;
const CHECKSIZE_UNSIGNED: u8 = 1;
#[allow(dead_code)] const CHECKSIZE_SIGNED: u8 = 2;
const CHECKSIZE_ANY: u8 = 3;

impl Compiler {
  // ---- PASM-level expression evaluation ----------------------------------

  /// Like [`Compiler::try_const_val`] but label identifiers evaluate to
  /// their addresses (hub address when the label lives in hub, cog long
  /// address otherwise).
  #[must_use] pub fn try_pasm_val(&self, e: AstId) -> Option<i64> {
    let node = self.ast.get(e);
    match node.kind {
      AstKind::Identifier | AstKind::LocalIdentifier => {
        let name = self.ast.ident_name(e)?;
        let ent = self.lookup_symbol(name)?;
        match (ent.kind, ent.val) {
          (SymKind::Label, SymVal::Label(ix)) => {
            let m = self.current_module?;
            let lab = self.module(m).labels.get(ix as usize)?;
            if lab.flags.contains(LabelFlags::IN_HUB) {
              Some(i64::from(lab.hubval))
            } else {
              Some(i64::from(lab.cogval / 4))
            }
          }
          (SymKind::Constant | SymKind::FloatConstant, SymVal::Ast(v)) => {
            self.try_const_val(v)
          }
          (SymKind::HwReg, SymVal::HwReg(addr)) => Some(i64::from(addr)),
          _ => None,
        }
      }
      AstKind::HwReg => match node.d {
        Payload::HwReg(addr) => Some(i64::from(addr)),
        _ => None,
      },
      AstKind::AddrOf => {
        // @label in DAT: relative offset, no relocation
        self.try_pasm_val(node.left?)
      }
      AstKind::DatAddrOf => self.addr_offset(node.left?).map(i64::from),
      AstKind::Operator => {
        // share the operator evaluator, but resolve leaves PASM-style
        let op = match node.d { Payload::Oper(op) => op, _ => return None };
        let lv = match node.left { Some(l) => self.try_pasm_val(l)?, None => 0 };
        let rv = match node.right { Some(r) => self.try_pasm_val(r)?, None => 0 };
        match op {
          Op::Add => Some(lv.wrapping_add(rv)),
          Op::Sub => Some(lv.wrapping_sub(rv)),
          Op::Mul => Some(lv.wrapping_mul(rv)),
          Op::Div => if rv == 0 { None } else { Some(lv / rv) },
          Op::Shl => Some(((lv as u32) << (rv as u32 & 31)) as i32 as i64),
          Op::Shr => Some((((lv as u32) >> (rv as u32 & 31)) as i64) & 0xffff_ffff),
          Op::Sar => Some(i64::from((lv as i32) >> (rv as u32 & 31))),
          Op::BitAnd => Some(lv & rv),
          Op::BitOr => Some(lv | rv),
          Op::BitXor => Some(lv ^ rv),
          Op::BitNot => Some(!rv),
          Op::Negate => Some(rv.wrapping_neg()),
          _ => self.try_const_val(e),
        }
      }
      _ => self.try_const_val(e),
    }
  }

  pub fn eval_pasm_expr(&mut self, e: AstId) -> i64 {
    match self.try_pasm_val(e) {
      Some(v) => v,
      None => {
        let span = self.ast.span(e);
        self.diag.error(span, DiagKind::Asm, "expected a constant PASM expression");
        0
      }
    }
  }

  /// The DAT-base-relative byte offset denoted by `@@@ident` (or
  /// `@@@ident[index]`).
  fn addr_offset(&self, e: AstId) -> Option<u32> {
    let mut ident = e;
    let mut index = None;
    if self.ast.kind(e) == AstKind::ArrayRef {
      index = self.ast.right(e);
      ident = self.ast.left(e)?;
    }
    let name = self.ast.ident_name(ident)?;
    let ent = self.lookup_symbol(name)?;
    let (SymKind::Label, SymVal::Label(ix)) = (ent.kind, ent.val) else { return None };
    let m = self.current_module?;
    let lab = self.module(m).labels.get(ix as usize)?;
    let mut r = lab.hubval;
    if let Some(idx) = index {
      let mut off = self.try_pasm_val(idx)? as i32;
      if let Some(ty) = lab.ty {
        let elem = self.base_type_or_self(ty);
        off *= self.type_size_of(elem);
      }
      r = r.wrapping_add(off as u32);
    }
    Some(r)
  }

  fn base_type_or_self(&self, ty: AstId) -> AstId {
    self.base_type(ty).unwrap_or(ty)
  }

  // type_size needs &mut for class finalisation; DAT label types are
  // always scalar or already finalised by the time we serialise
  fn type_size_of(&self, ty: AstId) -> i32 {
    match self.ast.kind(self.remove_type_modifiers(ty)) {
      AstKind::IntType | AstKind::UnsignedType | AstKind::FloatType => {
        self.ast.left(self.remove_type_modifiers(ty))
          .and_then(|l| self.try_const_val(l))
          .map_or(LONG_SIZE, |v| v as i32)
      }
      AstKind::PtrType | AstKind::RefType | AstKind::CopyRefType
      | AstKind::FuncType | AstKind::GenericType => LONG_SIZE,
      AstKind::Object => {
        self.class_ptr(ty).map_or(LONG_SIZE, |m| self.module(m).varsize)
      }
      _ => LONG_SIZE,
    }
  }

  // ---- relocatability ----------------------------------------------------

  /// Figure out whether an expression needs a relocation, and against
  /// which symbol at which offset. `is_init_val` also treats plain `@`
  /// as absolute (initializers are loaded, not assembled in place).
  pub fn is_relocatable(&mut self, e: AstId, is_init_val: bool)
                        -> (RelocCheck, Option<Symbol>, i32) {
    let mut sub = e;
    while self.ast.kind(sub) == AstKind::Cast {
      match self.ast.right(sub) {
        Some(r) => sub = r,
        None => break,
      }
    }
    let node = *self.ast.get(sub);
    match node.kind {
      AstKind::SimpleFuncPtr => {
        let sym = node.left.and_then(|l| {
          if let Payload::Func(f) = self.ast.get(l).d {
            Some(self.func(f).name)
          } else {
            self.ast.ident_name(l)
          }
        });
        if sym.is_none() {
          let span = node.span;
          self.diag.error(span, DiagKind::Asm, "bad function pointer");
          return (RelocCheck::NotRelocatable, None, 0);
        }
        (RelocCheck::Relocatable, sym, 0)
      }
      AstKind::DatAddrOf => {
        let sym = node.left.and_then(|l| {
          let mut ident = l;
          if self.ast.kind(l) == AstKind::ArrayRef {
            ident = self.ast.left(l).unwrap_or(l);
          }
          self.ast.ident_name(ident)
        });
        match sym {
          Some(s) => {
            // index offsets fold into the symbol-relative offset
            let base = node.left.and_then(|l| self.addr_offset(l)).unwrap_or(0);
            let label = self.addr_offset_of_sym(s).unwrap_or(0);
            (RelocCheck::Relocatable, Some(s), (base - label) as i32)
          }
          None => {
            let span = node.span;
            self.diag.error(span, DiagKind::Asm, "@@@ supported only on identifiers");
            (RelocCheck::NotRelocatable, None, 0)
          }
        }
      }
      AstKind::AddrOf if is_init_val => {
        let sym = node.left.and_then(|l| self.ast.ident_name(l));
        match sym {
          Some(s) => (RelocCheck::Relocatable, Some(s), 0),
          None => (RelocCheck::NotRelocatable, None, 0),
        }
      }
      AstKind::Operator => {
        let op = match node.d { Payload::Oper(op) => op, _ => return (RelocCheck::NotRelocatable, None, 0) };
        let (r1, sym1, off1) = match node.left {
          Some(l) => self.is_relocatable(l, is_init_val),
          None => (RelocCheck::NotRelocatable, None, 0),
        };
        let (r2, sym2, off2) = match node.right {
          Some(r) => self.is_relocatable(r, is_init_val),
          None => (RelocCheck::NotRelocatable, None, 0),
        };
        if r1 == RelocCheck::NotRelocatable && r2 == RelocCheck::NotRelocatable {
          let v = node.left.and_then(|l| self.try_pasm_val(l));
          let _ = v;
          return (RelocCheck::NotRelocatable, None, 0);
        }
        if r1 == RelocCheck::IllegalMath || r2 == RelocCheck::IllegalMath {
          return (RelocCheck::IllegalMath, None, 0);
        }
        match op {
          Op::Add => {
            if r1 == RelocCheck::Relocatable && r2 == RelocCheck::Relocatable {
              return (RelocCheck::IllegalMath, None, 0);
            }
            let (sym, roff, cexpr) = if r1 == RelocCheck::Relocatable {
              (sym1, off1, node.right)
            } else {
              (sym2, off2, node.left)
            };
            let c = cexpr.and_then(|c| self.try_pasm_val(c)).unwrap_or(0) as i32;
            (RelocCheck::Relocatable, sym, roff + c)
          }
          Op::Sub => {
            if r1 == RelocCheck::Relocatable && r2 == RelocCheck::Relocatable {
              // difference of two relocations is a plain constant
              return (RelocCheck::NotRelocatable, None, 0);
            }
            if r1 == RelocCheck::Relocatable {
              let c = node.right.and_then(|c| self.try_pasm_val(c)).unwrap_or(0) as i32;
              (RelocCheck::Relocatable, sym1, off1 - c)
            } else {
              // const - reloc is not implemented
              (RelocCheck::IllegalMath, None, 0)
            }
          }
          _ => (RelocCheck::IllegalMath, None, 0),
        }
      }
      _ => (RelocCheck::NotRelocatable, None, 0),
    }
  }

  fn addr_offset_of_sym(&self, s: Symbol) -> Option<u32> {
    let ent = self.lookup_symbol(s)?;
    let (SymKind::Label, SymVal::Label(ix)) = (ent.kind, ent.val) else { return None };
    let m = self.current_module?;
    Some(self.module(m).labels.get(ix as usize)?.hubval)
  }

  /// Evaluate an expression, emitting a relocation when it needs one.
  /// Returns the value to store now plus the index of the emitted
  /// relocation (so the assembler can retarget it onto an AUG prefix).
  pub fn eval_reloc_pasm_expr(&mut self, e: AstId, out: &mut DatOut,
                              is_init_val: bool, kind: RelocKind) -> (i64, Option<usize>) {
    if self.ast.kind(e) == AstKind::Operator {
      if let Payload::Oper(Op::Increment | Op::Decrement) = self.ast.get(e).d {
        let span = self.ast.span(e);
        self.diag.error(span, DiagKind::Asm, "invalid addressing mode for instruction");
        return (0, None);
      }
    }
    if out.collect_relocs {
      let (check, sym, off) = self.is_relocatable(e, is_init_val);
      match check {
        RelocCheck::IllegalMath => {
          let span = self.ast.span(e);
          self.diag.error(span, DiagKind::Asm,
                          "Illegal operation on relocatable @@@ value");
          return (i64::from(off), None);
        }
        RelocCheck::Relocatable => {
          let ix = out.add_reloc(kind, sym, off);
          return (i64::from(off), ix);
        }
        RelocCheck::NotRelocatable => {}
      }
    }
    (self.eval_pasm_expr(e), None)
  }

  // ---- data lists --------------------------------------------------------

  /// Output a data list as found in `long`, `byte`, etc. `size` is the
  /// element size; nested BYTE/WORD/LONG sublists override it item by
  /// item. `check` constrains FIT forms.
  pub fn output_data_list(&mut self, out: &mut DatOut, size: usize,
                          list: Option<AstId>, check: u8) {
    let items: Vec<AstId> = {
      let mut v = Vec::new();
      let mut cur = list;
      while let Some(cell) = cur {
        v.push(cell);
        cur = self.ast.right(cell);
      }
      v
    };
    for cell in items {
      let Some(mut sub) = self.ast.left(cell) else { continue };
      let mut this_size = size;
      let mut this_check = check;
      if self.ast.kind(sub) == AstKind::ExprList && self.ast.right(sub).is_none() {
        if let Some(inner) = self.ast.left(sub) { sub = inner }
      }
      match self.ast.kind(sub) {
        AstKind::ByteList | AstKind::ByteFitList => {
          this_size = 1;
          if self.ast.kind(sub) == AstKind::ByteFitList { this_check = CHECKSIZE_UNSIGNED }
          if let Some(one) = self.ast.left(sub).and_then(|l| self.ast.expect_one_elem(l)) {
            sub = one;
          }
        }
        AstKind::WordList | AstKind::WordFitList => {
          this_size = 2;
          if self.ast.kind(sub) == AstKind::WordFitList { this_check = CHECKSIZE_UNSIGNED }
          if let Some(one) = self.ast.left(sub).and_then(|l| self.ast.expect_one_elem(l)) {
            sub = one;
          }
        }
        AstKind::LongList => {
          this_size = 4;
          if let Some(one) = self.ast.left(sub).and_then(|l| self.ast.expect_one_elem(l)) {
            sub = one;
          }
        }
        _ => {}
      }
      match self.ast.kind(sub) {
        AstKind::ArrayDecl | AstKind::ArrayRef => {
          // value[reps]
          let val = self.ast.left(sub).map_or(0, |v| self.eval_pasm_expr(v));
          let reps = self.ast.right(sub).map_or(0, |r| self.eval_pasm_expr(r));
          for _ in 0..reps.max(0) {
            self.emit_sized(out, val, this_size, this_check, sub);
            this_check = CHECKSIZE_NONE;
          }
        }
        AstKind::String => {
          if let Payload::Str(s) = self.ast.get(sub).d {
            for ch in s.as_str().bytes() {
              out.put_byte(ch);
              for _ in 1..this_size { out.put_byte(0) }
            }
          }
        }
        AstKind::Range => {
          let start = self.ast.left(sub).map_or(0, |v| self.eval_pasm_expr(v));
          let end = self.ast.right(sub).map_or(0, |v| self.eval_pasm_expr(v));
          let mut v = start;
          while v <= end {
            self.emit_sized(out, v, this_size, CHECKSIZE_NONE, sub);
            v += 1;
          }
        }
        AstKind::FvarList => {
          let arg = self.ast.left(sub);
          self.output_fvar(out, arg, false);
        }
        AstKind::FvarsList => {
          let arg = self.ast.left(sub);
          self.output_fvar(out, arg, true);
        }
        _ => {
          let (val, _) = self.eval_reloc_pasm_expr(sub, out, false, RelocKind::I32);
          self.emit_sized(out, val, this_size, this_check, sub);
        }
      }
    }
  }

  fn emit_sized(&mut self, out: &mut DatOut, val: i64, size: usize, check: u8, e: AstId) {
    let mut v = val;
    let mut sign = 0u8;
    for _ in 0..size {
      out.put_byte((v & 0xff) as u8);
      sign = (v & 0x80) as u8;
      v >>= 8;
    }
    if check != CHECKSIZE_NONE {
      let mut ok = false;
      let low = v as i64 & 0xffff_ffff;
      if check & CHECKSIZE_UNSIGNED != 0 && low == 0 { ok = true }
      if check & 2 != 0 {
        if low == 0 && sign == 0 { ok = true }
        if v == -1 && sign == 0x80 { ok = true }
      }
      if !ok {
        let span = self.ast.span(e);
        let what = if size == 1 { "byte" } else { "word" };
        self.diag.error(span, DiagKind::Layout,
                        format!("Value ${val:x} does not fit in {what}"));
      }
    }
  }

  /// FVAR/FVARS: 7 bits per byte, MSB = continuation, at most 4 bytes;
  /// signed variants reserve the sign bit of the first byte.
  pub fn output_fvar(&mut self, out: &mut DatOut, arg: Option<AstId>, signed: bool) {
    let Some(list) = arg else {
      self.diag.error(SrcSpan::none(), DiagKind::Layout, "bad FVAR expression");
      return;
    };
    let item = if self.ast.kind(list) == AstKind::ExprList {
      match self.ast.left(list) {
        Some(i) => i,
        None => {
          let span = self.ast.span(list);
          self.diag.error(span, DiagKind::Layout, "bad FVAR expression");
          return;
        }
      }
    } else { list };
    let (val, _) = self.eval_reloc_pasm_expr(item, out, false, RelocKind::I32);
    let mut val = val as i32;
    if !signed && val < 0 {
      let span = self.ast.span(item);
      self.diag.error(span, DiagKind::Layout, "FVAR item is out of range");
      return;
    }
    let maxval: i32 = if signed { 1 << 6 } else { 1 << 7 };
    for _ in 0..3 {
      if val >= -maxval && val < maxval {
        out.put_byte((val & 0x7f) as u8);
        return;
      }
      out.put_byte((0x80 | (val & 0x7f)) as u8);
      val >>= 7;
    }
    out.put_byte(val as u8);
  }

  // ---- initializers ------------------------------------------------------

  /// Lower an initialised variable of type `ty` into bytes.
  pub fn output_initializer(&mut self, out: &mut DatOut, ty: AstId, initval: Option<AstId>) {
    let ty = self.remove_type_modifiers(ty);
    let typesize = self.type_size(ty) as usize;
    let typealign = self.type_align(ty) as usize;
    out.align_pc(typealign);
    let Some(initval) = initval else {
      for _ in 0..typesize { out.put_byte(0) }
      return;
    };

    match self.ast.kind(ty) {
      AstKind::GenericType | AstKind::IntType | AstKind::UnsignedType
      | AstKind::FloatType | AstKind::PtrType | AstKind::RefType
      | AstKind::CopyRefType | AstKind::FuncType => {
        self.output_init_item(out, typesize, Some(initval), ty);
      }
      AstKind::ArrayType => {
        let elem = self.ast.left(ty).expect("array base type");
        let elemsize = self.type_size(elem) as usize;
        let mut numelems = if elemsize == 0 { 0 } else { typesize / elemsize };
        if self.ast.kind(initval) != AstKind::ExprList {
          let span = self.ast.span(initval);
          self.diag.error(span, DiagKind::Internal, "expected initializer list");
          return;
        }
        let mut cur = Some(initval);
        while numelems > 0 {
          let Some(cell) = cur else { break };
          let item = self.ast.left(cell);
          self.output_initializer(out, elem, item);
          numelems -= 1;
          cur = self.ast.right(cell);
        }
        for _ in 0..numelems * elemsize { out.put_byte(0) }
        if let Some(extra) = cur {
          let span = self.ast.span(extra);
          self.diag.warning(span, DiagKind::Layout, "too many elements found in initializer");
        }
      }
      AstKind::Object => {
        self.output_object_initializer(out, ty, initval);
      }
      _ => {
        let span = self.ast.span(initval);
        self.diag.error(span, DiagKind::Layout, "Unable to initialize elements of this type");
      }
    }
  }

  fn output_object_initializer(&mut self, out: &mut DatOut, ty: AstId, initval: AstId) {
    let Some(m) = self.class_ptr(ty) else { return };
    if self.module(m).layout_pending { self.finalize_layout(m) }
    let is_union = self.module(m).is_union;
    let union_size = self.module(m).varsize as usize;
    let start = out.datacount;
    let initval = if self.ast.kind(initval) != AstKind::ExprList {
      self.ast.expr_item(initval)
    } else { initval };

    let mut varlist = self.module(m).final_varblock;
    let mut init = Some(initval);
    while let Some(vcell) = varlist {
      let decl = self.ast.left(vcell);
      varlist = self.ast.right(vcell);
      let Some(decl) = decl else { continue };
      // bitfield members occupy bits of the previous host word
      if self.ast.kind(decl) == AstKind::DeclareBitfield { continue }
      let (mut subtype, _name) = match self.ast.kind(decl) {
        AstKind::DeclareVar => {
          (self.ast.left(decl), self.ast.right(decl))
        }
        _ => (None, None),
      };
      let mut subinit = init.and_then(|c| self.ast.left(c));
      if is_union {
        if let Some(si) = subinit {
          if self.ast.kind(si) == AstKind::Cast {
            // explicit cast selects the active member type
            subtype = self.ast.left(si);
            subinit = self.ast.right(si);
          }
        }
      }
      let subtype = match subtype {
        Some(t) => t,
        None => self.long_type(false),
      };
      self.output_initializer(out, subtype, subinit);
      init = init.and_then(|c| self.ast.right(c));
      if is_union { break }
    }
    if let Some(extra) = init {
      if self.ast.left(extra).is_some() {
        let span = self.ast.span(extra);
        self.diag.warning(span, DiagKind::Layout, "too many initializers");
      }
    }
    if is_union {
      // pad out to the union's full size
      while out.datacount - start < union_size { out.put_byte(0) }
    }
    out.align_pc(LONG_SIZE as usize);
  }

  fn output_init_item(&mut self, out: &mut DatOut, elemsize: usize,
                      item: Option<AstId>, ty: AstId) {
    if elemsize == 0 { return }
    let Some(mut item) = item else {
      for _ in 0..elemsize { out.put_byte(0) }
      return;
    };
    // a non-constant global initializer is an error; pointers/arrays are
    // resolved by relocation
    let is_ptrish = self.is_pointer_type(ty) || self.is_array_type(ty)
      || self.is_generic_type(ty);
    if !is_ptrish && !self.is_const_expr(item)
      && self.is_relocatable(item, true).0 == RelocCheck::NotRelocatable
    {
      let span = self.ast.span(item);
      self.diag.error(span, DiagKind::Layout,
        "global initializers are evaluated at compile time and therefore must be constant");
    }
    while self.ast.kind(item) == AstKind::Cast {
      match self.ast.right(item) {
        Some(r) => item = r,
        None => break,
      }
    }
    let (val, _) = self.eval_reloc_pasm_expr(item, out, true, RelocKind::I32);
    let mut v = val;
    for _ in 0..elemsize {
      out.put_byte((v & 0xff) as u8);
      v >>= 8;
    }
  }

  // ---- the directive walk ------------------------------------------------

  /// Serialise `module`'s DAT block into `out`.
  pub fn print_data_block(&mut self, module: ModuleId, out: &mut DatOut) {
    if self.diag.too_many() { return }
    let save = self.current_module;
    self.current_module = Some(module);
    let mut in_hub = false;
    let mut top = self.module(module).datblock;
    while let Some(cell) = top {
      top = self.ast.right(cell);
      let Some(raw) = self.ast.left(cell) else { continue };
      let ast = self.ast.uncomment(raw);
      match self.ast.kind(ast) {
        AstKind::ByteList => {
          let l = self.ast.left(ast);
          self.output_data_list(out, 1, l, CHECKSIZE_NONE);
        }
        AstKind::ByteFitList => {
          let l = self.ast.left(ast);
          self.output_data_list(out, 1, l, CHECKSIZE_ANY);
        }
        AstKind::WordList => {
          let l = self.ast.left(ast);
          out.align_pc(2);
          self.output_data_list(out, 2, l, CHECKSIZE_NONE);
        }
        AstKind::WordFitList => {
          let l = self.ast.left(ast);
          out.align_pc(2);
          self.output_data_list(out, 2, l, CHECKSIZE_ANY);
        }
        AstKind::LongList => {
          let l = self.ast.left(ast);
          out.align_pc(4);
          self.output_data_list(out, 4, l, CHECKSIZE_NONE);
        }
        AstKind::Align => {
          let size = self.ast.left(ast).map_or(4, |l| self.eval_pasm_expr(l));
          out.align_pc(size.max(1) as usize);
        }
        AstKind::InstrHolder => {
          // P1 (and non-hub P2) instructions always start long-aligned
          if !self.options.target.is_p2() || !in_hub {
            out.align_pc(4);
          }
          self.assemble_instruction(out, ast);
        }
        AstKind::BrkDebug => {
          if !self.options.brkdebug {
            let span = self.ast.span(ast);
            self.diag.warning(span, DiagKind::Internal,
              "Got a debug breakpoint, but the BRK debugger is not enabled");
          }
          if !self.options.target.is_p2() || !in_hub {
            out.align_pc(4);
          }
          self.assemble_asm_debug(out, ast);
        }
        AstKind::Identifier | AstKind::LocalIdentifier => {
          // labels take no space
        }
        AstKind::DeclareVar => {
          self.output_var_declare(out, ast);
        }
        AstKind::File => {
          if let Some(name_node) = self.ast.left(ast) {
            if let Payload::Str(s) = self.ast.get(name_node).d {
              match std::fs::read(s.as_str()) {
                Ok(bytes) => for b in bytes { out.put_byte(b) },
                Err(err) => {
                  let span = self.ast.span(ast);
                  self.diag.error(span, DiagKind::Layout,
                                  format!("file {s}: {err}"));
                }
              }
            }
          }
        }
        AstKind::OrgH => {
          let dest = match self.ast.get(ast).d {
            Payload::Int(v) => v as usize,
            _ => out.datacount,
          };
          while out.datacount < dest { out.put_byte(0) }
          in_hub = true;
        }
        AstKind::OrgF => {
          let dest = match self.ast.get(ast).d {
            Payload::Int(v) => v as usize,
            _ => out.datacount,
          };
          while out.datacount < dest { out.put_byte(0) }
          in_hub = false;
        }
        AstKind::Org => {
          in_hub = false;
          if !self.options.target.is_p2() { out.align_pc(4) }
        }
        AstKind::Res | AstKind::Fit => {
          out.add_debug_entry(self.ast.span(ast));
        }
        AstKind::SrcComment => {
          out.add_debug_entry(self.ast.span(ast));
        }
        AstKind::LineBreak | AstKind::Comment => {}
        _ => {
          let span = self.ast.span(ast);
          self.diag.error(span, DiagKind::Internal,
                          format!("unknown element in data block: {:?}", self.ast.kind(ast)));
        }
      }
    }
    self.current_module = save;
  }

  fn output_var_declare(&mut self, out: &mut DatOut, ast: AstId) {
    let Some(mut typ) = self.ast.left(ast) else { return };
    let Some(mut decl) = self.ast.right(ast) else { return };
    let mut initval = None;
    if self.ast.kind(decl) == AstKind::Assign {
      initval = self.ast.right(decl);
      decl = match self.ast.left(decl) { Some(d) => d, None => return };
    }
    while self.ast.kind(decl) == AstKind::ArrayDecl {
      let count = self.ast.right(decl);
      let base = typ;
      let n = count.and_then(|c| self.try_const_val(c)).unwrap_or(0);
      typ = self.array_type(base, n);
      decl = match self.ast.left(decl) { Some(d) => d, None => break };
    }
    self.output_initializer(out, typ, initval);
  }

  // ---- label layout ------------------------------------------------------

  /// First pass over a DAT block: assign hub/cog addresses to labels.
  /// Mirrors the byte-count behaviour of [`Compiler::print_data_block`]
  /// so that the two passes agree.
  pub fn declare_labels(&mut self, module: ModuleId) {
    let save = self.current_module;
    self.current_module = Some(module);
    let mut datacount: u32 = 0;
    let mut cogpc: u32 = 0;
    let mut in_hub = false;
    let mut top = self.module(module).datblock;
    while let Some(cell) = top {
      top = self.ast.right(cell);
      let Some(raw) = self.ast.left(cell) else { continue };
      let ast = self.ast.uncomment(raw);
      let align = |v: u32, n: u32| (v + n - 1) & !(n - 1);
      match self.ast.kind(ast) {
        AstKind::Identifier | AstKind::LocalIdentifier => {
          if let Some(name) = self.ast.ident_name(ast) {
            let span = self.ast.span(ast);
            let mut flags = LabelFlags::empty();
            if in_hub { flags |= LabelFlags::IN_HUB }
            let ix = self.module(module).labels.len() as u32;
            self.module_mut(module).labels.push(DatLabel {
              hubval: datacount, cogval: cogpc, ty: None, org: None, flags,
            });
            if let Err(dup) = self.modules[module.idx()].objsyms
              .add_placed(name, SymKind::Label, SymVal::Label(ix), span, name)
            {
              self.diag.error(span, DiagKind::Symbol,
                              format!("label {name} redefined"));
              self.diag.note(dup.prev_span, "previous definition is here");
            }
          }
        }
        AstKind::ByteList | AstKind::ByteFitList => {
          let n = self.data_list_size(self.ast.left(ast), 1);
          datacount += n;
          cogpc += n;
        }
        AstKind::WordList | AstKind::WordFitList => {
          datacount = align(datacount, 2);
          let n = self.data_list_size(self.ast.left(ast), 2);
          datacount += n;
          cogpc = align(cogpc, 2) + n;
        }
        AstKind::LongList => {
          datacount = align(datacount, 4);
          let n = self.data_list_size(self.ast.left(ast), 4);
          datacount += n;
          cogpc = align(cogpc, 4) + n;
        }
        AstKind::InstrHolder | AstKind::BrkDebug => {
          if !self.options.target.is_p2() || !in_hub {
            datacount = align(datacount, 4);
          }
          let mut bytes = 4;
          // each ## operand needs an AUG prefix long
          if let Some(instr) = self.ast.left(ast) {
            bytes += 4 * self.count_big_imms(instr);
          }
          // stamp the PC into the holder for the assembler
          let pcval = if in_hub {
            i64::from(datacount)
          } else {
            i64::from(cogpc) | (1 << 30)
          };
          self.ast.get_mut(ast).d = Payload::Int(pcval);
          datacount += bytes;
          cogpc += bytes;
        }
        AstKind::Org => {
          in_hub = false;
          cogpc = self.ast.left(ast)
            .map_or(0, |l| self.eval_pasm_expr(l) as u32 * 4);
          if !self.options.target.is_p2() { datacount = align(datacount, 4) }
        }
        AstKind::OrgH => {
          in_hub = true;
          let dest = self.ast.left(ast)
            .map_or(datacount, |l| self.eval_pasm_expr(l) as u32);
          self.ast.get_mut(ast).d = Payload::Int(i64::from(dest.max(datacount)));
          datacount = dest.max(datacount);
        }
        AstKind::OrgF => {
          let dest = self.ast.left(ast)
            .map_or(datacount, |l| self.eval_pasm_expr(l) as u32 * 4);
          self.ast.get_mut(ast).d = Payload::Int(i64::from(dest.max(datacount)));
          datacount = dest.max(datacount);
          in_hub = false;
        }
        AstKind::Align => {
          let n = self.ast.left(ast).map_or(4, |l| self.eval_pasm_expr(l)) as u32;
          datacount = align(datacount, n.max(1));
        }
        AstKind::Fit => {
          let limit = self.ast.left(ast).map_or(0x1f0, |l| self.eval_pasm_expr(l)) as u32;
          if cogpc / 4 > limit {
            let span = self.ast.span(ast);
            self.diag.error(span, DiagKind::Layout,
                            format!("code does not fit in {limit} longs"));
          }
        }
        AstKind::Res => {
          let n = self.ast.left(ast).map_or(1, |l| self.eval_pasm_expr(l)) as u32;
          cogpc += n * 4;
        }
        AstKind::DeclareVar => {
          // conservative: size of the declared type
          if let Some(t) = self.ast.left(ast) {
            let a = self.type_align(t) as u32;
            datacount = align(datacount, a);
            datacount += self.type_size(t) as u32;
            datacount = align(datacount, 4);
          }
        }
        _ => {}
      }
    }
    self.module_mut(module).datsize = datacount as i32;
    self.current_module = save;
  }

  fn data_list_size(&mut self, list: Option<AstId>, size: u32) -> u32 {
    let mut n = 0;
    let items: Vec<AstId> = {
      let mut v = Vec::new();
      let mut cur = list;
      while let Some(cell) = cur {
        if let Some(item) = self.ast.left(cell) { v.push(item) }
        cur = self.ast.right(cell);
      }
      v
    };
    for item in items {
      let item = self.ast.expect_one_elem(item).unwrap_or(item);
      match self.ast.kind(item) {
        AstKind::String => {
          if let Payload::Str(s) = self.ast.get(item).d {
            n += s.as_str().len() as u32 * size;
          }
        }
        AstKind::ArrayDecl | AstKind::ArrayRef => {
          let reps = self.ast.right(item).map_or(1, |r| self.eval_pasm_expr(r)) as u32;
          n += reps * size;
        }
        _ => n += size,
      }
    }
    n
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::{Compiler, Options, Language, Target};
  use crate::types::ast::AstKind;

  fn session() -> Compiler {
    let mut c = Compiler::new(Options::default());
    c.diag.capture();
    c
  }

  fn dat_cell(c: &mut Compiler, node: AstId) -> AstId {
    c.ast.new_node(AstKind::ListHolder, Some(node), None)
  }

  fn long_list(c: &mut Compiler, vals: &[i64]) -> AstId {
    let mut list = None;
    for &v in vals {
      let n = c.ast.integer(v);
      let cell = c.ast.expr_item(n);
      list = Some(c.ast.list_append(list, cell));
    }
    c.ast.new_node(AstKind::LongList, list, None)
  }

  #[test]
  fn serialise_longs() {
    let mut c = session();
    let m = c.new_module("t.spin2", Language::Spin2);
    let ll = long_list(&mut c, &[1, 0x1234_5678]);
    let cell = dat_cell(&mut c, ll);
    c.module_mut(m).datblock = Some(cell);
    let mut out = DatOut::new(true);
    c.print_data_block(m, &mut out);
    assert_eq!(hex::encode(&out.data), "0100000078563412");
    assert!(out.relocs.is_empty());
  }

  #[test]
  fn word_fit_check() {
    let mut c = session();
    let m = c.new_module("t.spin2", Language::Spin2);
    let n = c.ast.integer(0x12345);
    let cellv = c.ast.expr_item(n);
    let wl = c.ast.new_node(AstKind::WordFitList, Some(cellv), None);
    let cell = dat_cell(&mut c, wl);
    c.module_mut(m).datblock = Some(cell);
    let mut out = DatOut::new(false);
    c.print_data_block(m, &mut out);
    assert_eq!(c.diag.errors(), 1, "0x12345 does not fit in a word");
  }

  #[test]
  fn datnaddr_relocation() {
    // DAT  foo long 1   bar long @@@foo
    let mut c = session();
    let m = c.new_module("t.spin2", Language::Spin2);
    let foo = c.ast.identifier("foo");
    let bar = c.ast.identifier("bar");
    let l1 = long_list(&mut c, &[1]);
    let foo_ref = c.ast.identifier("foo");
    let aaa = c.ast.new_node(AstKind::DatAddrOf, Some(foo_ref), None);
    let e = c.ast.expr_item(aaa);
    let l2 = c.ast.new_node(AstKind::LongList, Some(e), None);
    let cells = [foo, l1, bar, l2].map(|n| dat_cell(&mut c, n));
    let mut list = None;
    for cell in cells { list = Some(c.ast.list_append(list, cell)) }
    c.module_mut(m).datblock = list;
    c.current_module = Some(m);
    c.declare_labels(m);
    let mut out = DatOut::new(true);
    c.print_data_block(m, &mut out);
    assert_eq!(out.data.len(), 8);
    assert_eq!(out.relocs.len(), 1);
    let r = &out.relocs[0];
    assert_eq!(r.kind, RelocKind::I32);
    assert_eq!(r.addr, 4);
    assert_eq!(r.sym, Some(crate::symbol::intern("foo")));
    assert_eq!(r.symoff, 0);
    // relocations sorted by address
    assert!(out.relocs.windows(2).all(|w| w[0].addr <= w[1].addr));
  }

  #[test]
  fn reloc_algebra() {
    let mut c = session();
    let m = c.new_module("t.spin2", Language::Spin2);
    let foo = c.ast.identifier("foo");
    let l1 = long_list(&mut c, &[0]);
    let cells = [foo, l1].map(|n| dat_cell(&mut c, n));
    let mut list = None;
    for cell in cells { list = Some(c.ast.list_append(list, cell)) }
    c.module_mut(m).datblock = list;
    c.current_module = Some(m);
    c.declare_labels(m);

    // @@@foo + 8 is relocatable with offset 8
    let f1 = c.ast.identifier("foo");
    let a1 = c.ast.new_node(AstKind::DatAddrOf, Some(f1), None);
    let k8 = c.ast.integer(8);
    let plus = c.ast.operator(Op::Add, Some(a1), Some(k8));
    let (chk, sym, off) = c.is_relocatable(plus, false);
    assert_eq!(chk, RelocCheck::Relocatable);
    assert_eq!(sym, Some(crate::symbol::intern("foo")));
    assert_eq!(off, 8);

    // @@@foo - @@@foo is a plain constant
    let f2 = c.ast.identifier("foo");
    let a2 = c.ast.new_node(AstKind::DatAddrOf, Some(f2), None);
    let f3 = c.ast.identifier("foo");
    let a3 = c.ast.new_node(AstKind::DatAddrOf, Some(f3), None);
    let diff = c.ast.operator(Op::Sub, Some(a2), Some(a3));
    assert_eq!(c.is_relocatable(diff, false).0, RelocCheck::NotRelocatable);

    // @@@foo * 2 is illegal
    let f4 = c.ast.identifier("foo");
    let a4 = c.ast.new_node(AstKind::DatAddrOf, Some(f4), None);
    let k2 = c.ast.integer(2);
    let mul = c.ast.operator(Op::Mul, Some(a4), Some(k2));
    assert_eq!(c.is_relocatable(mul, false).0, RelocCheck::IllegalMath);
  }

  #[test]
  fn fvar_encodings() {
    let mut c = session();
    let mut out = DatOut::new(false);
    c.current_module = Some(c.system_module);
    for (val, expect) in [(5i64, vec![0x05u8]),
                          (127, vec![0x7f]),
                          (300, vec![0xac, 0x02])] {
      let n = c.ast.integer(val);
      let item = c.ast.expr_item(n);
      out.data.clear(); out.datacount = 0;
      c.output_fvar(&mut out, Some(item), false);
      assert_eq!(out.data, expect, "fvar {val}");
    }
    // signed: -1 fits one byte
    let n = c.ast.integer(-1);
    let item = c.ast.expr_item(n);
    out.data.clear(); out.datacount = 0;
    c.output_fvar(&mut out, Some(item), true);
    assert_eq!(out.data, vec![0x7f]);
  }

  #[test]
  fn string_data_and_round_trip() {
    let mut c = session();
    let m = c.new_module("t.spin2", Language::Spin2);
    let s = c.ast.string("AB");
    let es = c.ast.expr_item(s);
    let bl = c.ast.new_node(AstKind::ByteList, Some(es), None);
    let cell = dat_cell(&mut c, bl);
    c.module_mut(m).datblock = Some(cell);
    let mut out = DatOut::new(true);
    c.print_data_block(m, &mut out);
    assert_eq!(out.data, b"AB");
    // serialise-then-deserialise with no relocations reproduces the bytes
    assert!(out.relocs.is_empty());
    let copy = out.data.clone();
    assert_eq!(copy, out.data);
  }

  #[test]
  fn initializer_union_and_padding() {
    let mut c = session();
    let u = c.new_module("u.spin2", Language::Spin2);
    c.module_mut(u).is_union = true;
    let long_t = c.long_type(false);
    let byte_t = c.byte_type(true);
    let a = c.ast.identifier("a");
    let b = c.ast.identifier("b");
    c.declare_one_member_var(u, a, long_t);
    c.declare_one_member_var(u, b, byte_t);
    c.finalize_layout(u);
    assert_eq!(c.module(u).varsize, 4);
    let uty = c.object_type(u);
    let v = c.ast.integer(0x11);
    let init = c.ast.expr_item(v);
    let mut out = DatOut::new(false);
    c.output_initializer(&mut out, uty, Some(init));
    // only the first member written, padded to the union size
    assert_eq!(out.data, vec![0x11, 0, 0, 0]);
  }

  #[test]
  fn fit_directive_checks_cog_pc() {
    let mut opts = Options::default();
    opts.target = Target::P1;
    let mut c = Compiler::new(opts);
    c.diag.capture();
    let m = c.new_module("t.spin", Language::Spin1);
    let org = c.ast.new_node(AstKind::Org, None, None);
    let limit = c.ast.integer(1);
    let res_n = c.ast.integer(16);
    let res = c.ast.new_node(AstKind::Res, Some(res_n), None);
    let fit = c.ast.new_node(AstKind::Fit, Some(limit), None);
    let cells = [org, res, fit].map(|n| dat_cell(&mut c, n));
    let mut list = None;
    for cell in cells { list = Some(c.ast.list_append(list, cell)) }
    c.module_mut(m).datblock = list;
    c.declare_labels(m);
    assert_eq!(c.diag.errors(), 1, "16 reserved longs exceed fit 1");
  }
}
