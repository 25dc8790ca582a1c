//! The PASM assembler: decodes the operand ASTs attached to an
//! instruction, applies modifiers, selects direct/relative/indirect
//! encodings, emits AUG prefixes for `##` immediates, and writes the
//! 32-bit instruction longs into the DAT stream.

use arrayvec::ArrayVec;
use smallvec::SmallVec;
use crate::{Compiler, Target};
use crate::dat::{DatOut, LabelFlags, RelocKind};
use crate::diag::DiagKind;
use crate::instr::{self, Instruction, InstrOps,
  FLAG_WZ, FLAG_WC, FLAG_WCZ, FLAG_ANDC, FLAG_ANDZ, FLAG_ORC, FLAG_ORZ,
  FLAG_XORC, FLAG_XORZ, FLAG_WARN_NOTUSED, FLAG_P2_CZTEST, FLAG_JMPSET,
  IMMEDIATE_INSTR, P2_IMM_SRC, P2_IMM_DST};
use crate::types::AstId;
use crate::types::ast::{AstKind, Op, Payload};
use crate::types::entity::{SymKind, SymVal};
use crate::types::ir::IrOp;

// internal immediate-mask bits, below the real opcode bits
pub const BIG_IMM_SRC: u32 = 0x01;
pub const BIG_IMM_DST: u32 = 0x02;
const DUMMY_MASK: u32 = 0x80;

const MAX_OPERANDS: usize = 3;

struct Decoded {
  operands: SmallVec<[AstId; MAX_OPERANDS]>,
  opimm: SmallVec<[u32; MAX_OPERANDS]>,
  val: u32,
  effects: u32,
}

impl Compiler {
  fn is_p2(&self) -> bool { self.options.target.is_p2() }

  /// Count `##` operands of an instruction AST; each needs one AUG
  /// prefix long.
  #[must_use] pub fn count_big_imms(&self, mut ast: AstId) -> u32 {
    if self.ast.kind(ast) == AstKind::CompressInstr {
      match self.ast.left(ast) { Some(l) => ast = l, None => return 0 }
    }
    let mut n = 0;
    let mut cur = self.ast.right(ast);
    while let Some(cell) = cur {
      if self.ast.kind(cell) == AstKind::ExprList {
        if let Some(op) = self.ast.left(cell) {
          if self.ast.kind(op) == AstKind::BigImmHolder { n += 1 }
        }
      }
      cur = self.ast.right(cell);
    }
    n
  }

  /// The immediate bits for operand `opnum` of `instr`, or an error when
  /// that position cannot take an immediate.
  fn imm_mask(&mut self, instr: &Instruction, opnum: usize, big: bool, ast: AstId) -> u32 {
    let span = self.ast.span(ast);
    let mut mask = if self.is_p2() {
      let mut m = P2_IMM_SRC;
      if big { m |= BIG_IMM_SRC }
      m
    } else {
      IMMEDIATE_INSTR
    };
    match instr.ops {
      InstrOps::P2Jump | InstrOps::P2Loc | InstrOps::P2Calld | InstrOps::P2Aug
      | InstrOps::P2JintOperands | InstrOps::JmpOperand | InstrOps::CallOperand => {
        if big {
          self.diag.error(span, DiagKind::Asm,
                          format!("## is not legal with {}", instr.name));
        }
        mask
      }
      InstrOps::SrcOnly => mask,
      InstrOps::TwoOperands | InstrOps::TwoOperandsOptional
      | InstrOps::TwoOperandsDefz | InstrOps::JmpRetOperands
      | InstrOps::P2TjzOperands | InstrOps::P2TwoOperands
      | InstrOps::P2RdWrOperands | InstrOps::ThreeOperandsByte
      | InstrOps::ThreeOperandsNibble | InstrOps::ThreeOperandsWord => {
        if self.is_p2() {
          if opnum == 0 {
            // the L bit shares Z's position, so instructions that can
            // take wz/wcz cannot take a first-operand immediate
            if instr.flags & (FLAG_WZ | FLAG_WCZ | FLAG_ANDZ) != 0 {
              self.diag.error(span, DiagKind::Asm,
                format!("Immediate values are not allowed for first operand of {}", instr.name));
            }
            mask = P2_IMM_DST;
            if big { mask |= BIG_IMM_DST }
          } else if opnum == 2 {
            mask = DUMMY_MASK;
          }
        } else if opnum == 0 {
          self.diag.error(span, DiagKind::Asm,
                          format!("bad immediate operand to {}", instr.name));
          return 0;
        }
        mask
      }
      InstrOps::P2DstConstOk => {
        // uses the I bit in place of L
        let mut m = P2_IMM_SRC;
        if big { m |= BIG_IMM_DST }
        m
      }
      _ => {
        self.diag.error(span, DiagKind::Asm,
          format!("immediate value not supported for {} instruction", instr.name));
        0
      }
    }
  }

  /// Decode the special `ptra++[n]` / `ptrb[n]` / `++ptra` pointer forms
  /// of the rd/wr instructions into the pointer-indexing scheme. A zero
  /// return means "not a pointer form" (plain register source).
  fn special_rd_operand(&mut self, ast: AstId, opimm: u32) -> u32 {
    let span = self.ast.span(ast);
    if opimm != 0 && self.ast.kind(ast) != AstKind::RangeRef {
      let v = self.try_pasm_val(ast).unwrap_or(0);
      if v > 0xff && opimm & BIG_IMM_SRC == 0 {
        self.diag.warning(span, DiagKind::Asm, "immediate value out of range");
      }
    }
    let mut val: u32 = 0;
    let mut subval: i64 = 0;
    let mut saw_array = false;
    let mut node = ast;

    // ptra++[IDX] parses as (ptra++)[IDX]
    if self.ast.kind(node) == AstKind::ArrayRef {
      subval = self.ast.right(node).map_or(0, |r| self.eval_pasm_expr(r));
      node = match self.ast.left(node) { Some(l) => l, None => return 0 };
      saw_array = true;
    }
    if self.ast.kind(node) == AstKind::Operator {
      if let Payload::Oper(op @ (Op::Increment | Op::Decrement)) = self.ast.get(node).d {
        if subval == 0 {
          if saw_array {
            self.diag.error(span, DiagKind::Asm, "PTRx index of 0 is not valid");
          }
          subval = 1;
        }
        let (inner, base) = match (self.ast.left(node), self.ast.right(node)) {
          (Some(l), _) => (l, 0x60),    // post-form
          (None, Some(r)) => (r, 0x40), // pre-form
          _ => return 0,
        };
        val = base;
        if op == Op::Decrement { subval = -subval }
        node = inner;
      }
    }
    let negsub = if subval < 0 { -1 } else { 1 };
    if self.ast.kind(node) == AstKind::RangeRef {
      if let Some(idx) = self.ast.right(node) {
        subval = self.eval_pasm_expr(idx) * negsub;
      }
      node = match self.ast.left(node) { Some(l) => l, None => return 0 };
    }
    if self.ast.kind(node) == AstKind::HwReg {
      let addr = match self.ast.get(node).d {
        Payload::HwReg(a) => a,
        _ => return 0,
      };
      match addr {
        0x1f8 => val |= 0x100, // ptra
        0x1f9 => val |= 0x180, // ptrb
        _ => {
          if val != 0 {
            self.diag.error(span, DiagKind::Asm, "only ptra or ptrb allowed");
          }
          return 0;
        }
      }
    } else if val != 0 || saw_array {
      self.diag.error(span, DiagKind::Asm,
                      "bad rd*/wr* pointer: only ptra or ptrb allowed");
      return 0x100;
    } else {
      return 0;
    }

    if opimm & BIG_IMM_SRC != 0 && val & 0x100 != 0 {
      // 20-bit index with the mode bits moved up
      return (val << 15) | (subval as u32 & 0xfffff);
    }
    // rev A allows -16..31 everywhere; rev B widens plain indexing
    if val & 0x60 != 0 || self.options.target == Target::P2RevA {
      if !(-16..=15).contains(&subval) {
        if subval == 16 && self.options.target != Target::P2RevA {
          // 16 encodes as 0 on rev B
        } else {
          self.diag.error(span, DiagKind::Asm, "ptr index out of range -16 to 31");
          subval = 0;
        }
      }
      val | (subval as u32 & 0x1f)
    } else {
      if !(-32..=31).contains(&subval) {
        self.diag.error(span, DiagKind::Asm, "ptr index out of range");
        subval = 0;
      }
      val | (subval as u32 & 0x3f)
    }
  }

  fn fixup_three_operands(&mut self, val: u32, op: Option<AstId>, immflags: u32,
                          max_n: u32, line: AstId, instr: &Instruction) -> u32 {
    let span = self.ast.span(line);
    let Some(op) = op else {
      self.diag.error(span, DiagKind::Asm,
        format!("Third operand to {} must be an immediate", instr.name));
      return val;
    };
    if immflags == 0 {
      self.diag.error(span, DiagKind::Asm,
        format!("Third operand to {} must be an immediate", instr.name));
      return val;
    }
    let nn = self.eval_pasm_expr(op) as u32;
    if nn >= max_n {
      self.diag.error(span, DiagKind::Asm,
        format!("Third operand to {} must be less than {max_n}", instr.name));
      return val;
    }
    val | (nn << 19)
  }

  fn is_const_integer(&self, op: AstId) -> bool {
    let constant = match self.ast.kind(op) {
      AstKind::Integer => true,
      AstKind::Identifier | AstKind::LocalIdentifier => self.is_const_expr(op),
      _ => false,
    };
    if !constant { return false }
    let n = self.try_pasm_val(op).unwrap_or(0);
    // constants in $1C0..$1EF pass for registers without complaint
    !(0x1c0..0x1f0).contains(&n)
  }

  fn warn_about_consts_mask(&self, instr: &Instruction) -> u32 {
    if !self.options.warn.contains(crate::WarnFlags::ASM_USAGE) { return 0 }
    match instr.ops {
      InstrOps::TwoOperands | InstrOps::TwoOperandsDefz
      | InstrOps::TwoOperandsOptional | InstrOps::P2Loc => 2,
      InstrOps::P2TwoOperands => 3,
      InstrOps::P2DstConstOk => 1,
      _ => 0,
    }
  }

  /// Decode modifiers and operands. Returns `None` after reporting when
  /// the instruction cannot be decoded.
  fn decode_asm_operands(&mut self, tbl: &'static [Instruction], instr_ix: usize,
                         ast: AstId) -> Option<Decoded> {
    let instr = &tbl[instr_ix];
    let line_span = self.ast.span(ast);
    let mut d = Decoded {
      operands: SmallVec::new(),
      opimm: SmallVec::new(),
      val: instr.binary,
      effects: 0,
    };
    if instr.opc != IrOp::Nop {
      // everything except NOP defaults to "execute always"
      d.val |= if self.is_p2() { 0xf << 28 } else { 0xf << 18 };
    }
    let mut saw_flag_used = false;

    let mut cur = self.ast.right(ast);
    while let Some(cell) = cur {
      cur = self.ast.right(cell);
      match self.ast.kind(cell) {
        AstKind::SrcComment | AstKind::Comment => {}
        AstKind::ExprList => {
          if d.operands.len() >= MAX_OPERANDS {
            self.diag.error(line_span, DiagKind::Asm, "Too many operands to instruction");
            return None;
          }
          let (imask, op) = match self.ast.left(cell) {
            Some(h) if self.ast.kind(h) == AstKind::ImmHolder => {
              (self.imm_mask(instr, d.operands.len(), false, cell),
               self.ast.left(h)?)
            }
            Some(h) if self.ast.kind(h) == AstKind::BigImmHolder => {
              (self.imm_mask(instr, d.operands.len(), true, cell),
               self.ast.left(h)?)
            }
            Some(op) => (0, op),
            None => continue,
          };
          d.operands.push(op);
          d.opimm.push(imask);
        }
        AstKind::InstrModifier => {
          let Payload::Modifier(mix) = self.ast.get(cell).d else { continue };
          let table = instr::modifier_table(self.options.target);
          let Some(m) = table.get(mix as usize) else { continue };
          if m.flags & crate::instr::FLAG_CZSET != 0 { saw_flag_used = true }
          d.effects |= m.flags;
          if m.flags != 0 {
            if m.flags & instr.flags == 0 {
              self.diag.error(line_span, DiagKind::Asm,
                format!("modifier {} not valid for {}", m.name, instr.name));
            }
            if instr.flags == FLAG_P2_CZTEST {
              // and/or/xor test kinds tweak the opcode
              let instr_mask: u32 = match m.flags {
                f if f == FLAG_WZ || f == FLAG_WC => 0,
                f if f == FLAG_ANDC || f == FLAG_ANDZ => 2,
                f if f == FLAG_ORC || f == FLAG_ORZ => 4,
                f if f == FLAG_XORC || f == FLAG_XORZ => 6,
                _ => 0,
              };
              if instr.ops == InstrOps::P2DstConstOk {
                d.val |= instr_mask;        // testp: src bits
              } else if instr.ops == InstrOps::TwoOperands {
                d.val |= instr_mask << 21;  // testb: opcode bits
              } else {
                self.diag.error(line_span, DiagKind::Internal,
                                "internal error in instruction table");
              }
            }
          } else if instr.opc == IrOp::Nop {
            self.diag.error(line_span, DiagKind::Asm,
                            "attempt to modify NOP with condition");
          }
          if m.modifier & 0x0003_ffff != 0 {
            d.val &= m.modifier;
          } else {
            d.val |= m.modifier;
          }
        }
        other => {
          self.diag.error(line_span, DiagKind::Internal,
            format!("expected instruction modifier, found {other:?}"));
          return None;
        }
      }
    }

    // `_ret_ cmp 0, #0` may deliberately set no flags (it can double as
    // a counter); a zeroed condition nibble suppresses the warning
    let cond_mask = if self.is_p2() { 0xfu32 << 28 } else { 0xf << 18 };
    if d.val & cond_mask == 0 { saw_flag_used = true }
    if instr.flags == FLAG_P2_CZTEST && !saw_flag_used {
      self.diag.error(line_span, DiagKind::Asm,
        format!("instruction {} requires flags to be tested", instr.name));
    } else if instr.flags & FLAG_WARN_NOTUSED != 0 && !saw_flag_used {
      self.diag.warning(line_span, DiagKind::Asm,
        format!("instruction {} used without flags being set", instr.name));
    }
    if instr.opc == IrOp::Break && d.val & cond_mask != cond_mask {
      self.diag.warning(line_span, DiagKind::Asm,
                        "conditional BRK instruction does not work");
    }

    // operand count handling, including canned defaults
    let (expectops, jump_operand): (usize, Option<usize>) = match instr.ops {
      InstrOps::NoOperands => (0, None),
      InstrOps::JmpRetOperands | InstrOps::P2TjzOperands => (2, Some(1)),
      InstrOps::TwoOperands | InstrOps::TwoOperandsOptional
      | InstrOps::TwoOperandsDefz | InstrOps::P2TwoOperands
      | InstrOps::P2RdWrOperands | InstrOps::P2Loc | InstrOps::P2Calld
      | InstrOps::P2Modcz => (2, None),
      InstrOps::ThreeOperandsByte | InstrOps::ThreeOperandsWord
      | InstrOps::ThreeOperandsNibble => (3, None),
      InstrOps::JmpOperand | InstrOps::P2Jump | InstrOps::CallOperand => (1, Some(0)),
      _ => (1, None),
    };
    if instr.ops == InstrOps::TwoOperandsOptional && d.operands.len() == 1 {
      // neg r0 -> neg r0, r0
      let op = d.operands[0];
      let im = d.opimm[0];
      d.operands.push(op);
      d.opimm.push(im);
    } else if instr.ops == InstrOps::TwoOperandsDefz && d.operands.len() == 1 {
      let defval = if instr.name == "alti" { 0x164 } else { 0 };
      let z = self.ast.integer(defval);
      d.operands.push(z);
      d.opimm.push(P2_IMM_SRC);
    } else if instr.ops == InstrOps::P2Modcz && d.operands.len() == 1 {
      if instr.name == "modc" {
        let z = self.ast.integer(0);
        d.operands.push(z);
        d.opimm.push(0);
      } else if instr.name == "modz" {
        let z = self.ast.integer(0);
        d.operands.insert(0, z);
        d.opimm.insert(0, 0);
      }
    } else if instr.opc == IrOp::GetRnd && d.operands.is_empty() {
      let z = self.ast.integer(0);
      d.operands.push(z);
      d.opimm.push(1);
    }
    if expectops == 3 && d.operands.len() == 1 {
      // SETNIB reg/# -> SETNIB 0, reg/#, #0 ; GETBYTE reg -> GETBYTE reg, 0, #0
      if instr.name.starts_with("set") {
        let z = self.ast.integer(0);
        let im0 = d.opimm[0];
        d.opimm[0] = im0 >> 1; // dst imm becomes src imm
        d.operands.insert(0, z);
        d.opimm.insert(0, 0);
      } else {
        let z = self.ast.integer(0);
        d.operands.push(z);
        d.opimm.push(0);
      }
      let z2 = self.ast.integer(0);
      d.operands.push(z2);
      d.opimm.push(DUMMY_MASK);
    }
    if expectops != d.operands.len() {
      self.diag.error(line_span, DiagKind::Asm,
        format!("Expected {expectops} operands for {}, found {}",
                instr.name, d.operands.len()));
      return None;
    }

    if let Some(jop) = jump_operand {
      if d.opimm[jop] == 0 {
        // branching to a label without # is usually a forgotten immediate
        let op = d.operands[jop];
        if self.ast.is_identifier(op) {
          if let Some(name) = self.ast.ident_name(op) {
            if let Some(e) = self.lookup_symbol(name) {
              if e.kind == SymKind::Label {
                if let (SymVal::Label(ix), Some(m)) = (e.val, self.current_module) {
                  let lab = &self.module(m).labels[ix as usize];
                  if lab.flags.contains(LabelFlags::HAS_INSTR)
                    && !lab.flags.contains(LabelFlags::HAS_JMP)
                  {
                    self.diag.warning(line_span, DiagKind::Asm,
                      format!("{} to {} without #; are you sure this is correct?",
                              instr.name, name));
                  }
                }
              }
            }
          }
        }
      }
    } else {
      let warn_mask = self.warn_about_consts_mask(instr);
      for (bit, ix) in [(1u32, 0usize), (2, 1)] {
        if warn_mask & bit != 0 && d.operands.len() > ix && d.opimm[ix] == 0
          && self.is_const_integer(d.operands[ix])
        {
          self.diag.warning(line_span, DiagKind::Asm,
            format!("operand {} to {} is a constant used without #; is this correct?",
                    ix + 1, instr.name));
        }
      }
    }
    Some(d)
  }

  /// Assemble one instruction (an `InstrHolder` node) into `out`.
  pub fn assemble_instruction(&mut self, out: &mut DatOut, holder: AstId) {
    let pcinfo = match self.ast.get(holder).d {
      Payload::Int(v) => v,
      _ => 0,
    };
    let curpc = (pcinfo & 0x00ff_ffff) as u32;
    let in_hub = pcinfo & (1 << 30) == 0;
    let Some(mut ast) = self.ast.left(holder) else { return };
    let line_span = self.ast.span(holder);

    let mut compress = false;
    if self.ast.kind(ast) == AstKind::CompressInstr {
      compress = true;
      ast = match self.ast.left(ast) { Some(l) => l, None => return };
    }
    let tbl = instr::instr_table(self.options.target);
    let mut instr_ix = match self.ast.get(ast).d {
      Payload::Instr(ix) => ix as usize,
      _ => {
        self.diag.error(line_span, DiagKind::Internal, "missing instruction table entry");
        return;
      }
    };

    let mut need_indirect = false;
    'decode: loop {
      let instr = &tbl[instr_ix];
      let Some(mut d) = self.decode_asm_operands(tbl, instr_ix, ast) else { return };
      let mut immmask: u32 = d.opimm.iter().fold(0, |a, &b| a | b);
      let mut src: i64 = 0;
      let mut dst: i64 = 0;
      let mut src_reloc: Option<usize> = None;
      let mut dst_reloc: Option<usize> = None;
      let mut val = d.val;
      let mut skip_range_checks = false;

      match instr.ops {
        InstrOps::NoOperands => {}
        InstrOps::P2TwoOperands if instr.name == "rep" && !d.operands.is_empty()
          && self.ast.kind(d.operands[0]) == AstKind::AddrOf && d.opimm[0] == 0 =>
        {
          // rep @x, N: count the instructions between here and x
          let label = self.ast.left(d.operands[0])
            .map_or(0, |l| self.eval_pasm_expr(l));
          let mut count = if in_hub {
            (label - i64::from(curpc + 4)) / 4
          } else {
            label - i64::from(curpc + 4) / 4
          };
          if immmask & BIG_IMM_SRC != 0 { count -= 1 } // AUG prefix is free
          dst = count;
          immmask |= P2_IMM_DST;
          d.opimm[0] = P2_IMM_DST;
          src = self.eval_operand(instr, d.operands[1]);
        }
        InstrOps::TwoOperands | InstrOps::JmpRetOperands
        | InstrOps::TwoOperandsOptional | InstrOps::TwoOperandsDefz
        | InstrOps::P2TwoOperands => {
          (dst, dst_reloc) = self.eval_reloc_pasm_expr(d.operands[0], out, true, RelocKind::AugD);
          (src, src_reloc) = self.eval_reloc_pasm_expr(d.operands[1], out, true, RelocKind::AugS);
        }
        InstrOps::ThreeOperandsNibble => {
          val = self.fixup_three_operands(val, d.operands.get(2).copied(),
                                          d.opimm[2], 8, holder, instr);
          (dst, dst_reloc) = self.eval_reloc_pasm_expr(d.operands[0], out, true, RelocKind::AugD);
          (src, src_reloc) = self.eval_reloc_pasm_expr(d.operands[1], out, true, RelocKind::AugS);
        }
        InstrOps::ThreeOperandsByte => {
          val = self.fixup_three_operands(val, d.operands.get(2).copied(),
                                          d.opimm[2], 4, holder, instr);
          (dst, dst_reloc) = self.eval_reloc_pasm_expr(d.operands[0], out, true, RelocKind::AugD);
          (src, src_reloc) = self.eval_reloc_pasm_expr(d.operands[1], out, true, RelocKind::AugS);
        }
        InstrOps::ThreeOperandsWord => {
          val = self.fixup_three_operands(val, d.operands.get(2).copied(),
                                          d.opimm[2], 2, holder, instr);
          (dst, dst_reloc) = self.eval_reloc_pasm_expr(d.operands[0], out, true, RelocKind::AugD);
          (src, src_reloc) = self.eval_reloc_pasm_expr(d.operands[1], out, true, RelocKind::AugS);
        }
        InstrOps::P2Modcz => {
          dst = self.eval_operand(instr, d.operands[0]);
          src = self.eval_operand(instr, d.operands[1]);
          if dst > 0xf || src > 0xf {
            self.diag.error(line_span, DiagKind::Asm,
                            format!("bad operand for {}", instr.name));
            dst = 0; src = 0;
          }
          dst = (dst << 4) | src;
          src = 0;
        }
        InstrOps::P2RdWrOperands => {
          dst = self.eval_operand(instr, d.operands[0]);
          let special = self.special_rd_operand(d.operands[1], d.opimm[1]);
          if special == 0 {
            src = self.eval_pasm_expr(d.operands[1]);
          } else {
            src = i64::from(special);
            immmask |= P2_IMM_SRC;
          }
        }
        InstrOps::P2TjzOperands | InstrOps::P2JintOperands => {
          let opidx = if instr.ops == InstrOps::P2TjzOperands {
            dst = self.eval_operand(instr, d.operands[0]);
            // calld to pa/pb/ptra/ptrb falls back to the loc form when
            // the direct 9-bit range will not reach
            if instr.name == "calld" && d.opimm[1] != 0 && (0x1f6..=0x1f9).contains(&dst) {
              let isrc0 = self.eval_operand(instr, d.operands[1]);
              let mut reach = false;
              let mut isrc = isrc0;
              if isrc < 0x400 {
                if !in_hub {
                  isrc *= 4;
                  let rel = isrc - i64::from(curpc + 4);
                  if rel % 4 == 0 {
                    let rel = rel / 4;
                    reach = (-256..=255).contains(&rel);
                  }
                }
              } else if in_hub {
                let rel = isrc - i64::from(curpc + 4);
                if rel % 4 == 0 {
                  reach = (-256..=255).contains(&(rel / 4));
                }
              }
              if !reach {
                if let Some(ix) = instr::find_instruction(self.options.target, "calld.loc") {
                  instr_ix = ix as usize;
                  continue 'decode;
                }
                self.diag.error(line_span, DiagKind::Internal, "calld fallback missing");
                return;
              }
            }
            1
          } else { 0 };
          if d.opimm[opidx] != 0 {
            let rel_hub = self.is_relative_hub_address(d.operands[opidx]);
            let mut isrc = self.eval_operand(instr, d.operands[opidx]);
            let mut dst_hub = true;
            let mut dst_lut = false;
            if isrc < 0x400 && !rel_hub {
              dst_hub = false;
              dst_lut = isrc >= 0x200;
              isrc *= 4;
            }
            if in_hub {
              if !dst_hub {
                let what = if dst_lut { "HUB/LUT" } else { "HUB/COG" };
                self.diag.error(line_span, DiagKind::Asm,
                  format!("{} branch crosses {what} boundary", instr.name));
              }
            } else if dst_hub {
              self.diag.warning(line_span, DiagKind::Asm,
                format!("{} branch crosses HUB/COG boundary", instr.name));
            }
            // crossing LUT/COG inside the cog is accepted; silicon allows it
            let mut rel = (isrc - i64::from(curpc + 4)) / 4;
            if immmask & BIG_IMM_DST != 0 { rel -= 1 }
            if !(-256..=255).contains(&rel) {
              self.diag.error(line_span, DiagKind::Asm,
                format!("Source out of range for relative branch {}", instr.name));
              rel = 0;
            }
            src = rel & 0x1ff;
          } else {
            src = self.eval_pasm_expr(d.operands[opidx]);
          }
        }
        InstrOps::JmpOperand | InstrOps::SrcOnly | InstrOps::P2Aug => {
          src = self.eval_operand(instr, d.operands[0]);
        }
        InstrOps::P2Loc | InstrOps::P2Calld | InstrOps::P2Jump => {
          let opidx = if instr.ops == InstrOps::P2Jump { 0 } else {
            dst = self.eval_operand(instr, d.operands[0]);
            if (0x1f6..=0x1f9).contains(&dst) {
              val |= ((dst - 0x1f6) as u32 & 0x3) << 21;
            } else {
              self.diag.error(line_span, DiagKind::Asm,
                format!("bad first operand to {} instruction", instr.name));
            }
            1
          };
          if need_indirect || d.opimm[opidx] == 0 {
            if instr.ops == InstrOps::P2Loc {
              self.diag.error(line_span, DiagKind::Asm, "loc requires immediate operand");
              return;
            }
            let ind = format!("{}.ind", instr.name);
            match instr::find_instruction(self.options.target, &ind) {
              Some(ix) => { instr_ix = ix as usize; need_indirect = false; continue 'decode }
              None => {
                self.diag.error(line_span, DiagKind::Internal,
                                format!("could not find {ind}"));
                return;
              }
            }
          }
          if d.effects & FLAG_JMPSET != 0 {
            self.diag.error(line_span, DiagKind::Asm,
              format!("wc and wz not valid with this form of {}", instr.name));
          }
          dst = 0;
          immmask = 0; // jump immediates are encoded in the 20-bit field
          let op = d.operands[opidx];
          let (is_rel, isrc, reloc);
          if self.ast.kind(op) == AstKind::Catch {
            // \xxx forces the absolute form
            let real = self.ast.left(op).unwrap_or(op);
            let (v, r) = self.eval_reloc_pasm_expr(real, out, true, RelocKind::I32);
            isrc = v; reloc = r; is_rel = false;
          } else {
            let rel_hub = self.is_relative_hub_address(op);
            let (v, r) = self.eval_reloc_pasm_expr(op, out, true, RelocKind::I32);
            isrc = v; reloc = r;
            is_rel = if in_hub {
              if rel_hub { true }
              else if self.options.no_spin { isrc >= 0x400 }
              else { false }
            } else if isrc >= 0x400 {
              false
            } else if isrc >= 0x200 {
              curpc >= 0x800 // destination in LUT
            } else {
              curpc < 0x800
            };
          }
          if is_rel {
            let mut r = isrc;
            if !in_hub { r *= 4 }
            r -= i64::from(curpc + 4);
            if instr.ops == InstrOps::P2Loc && !in_hub { r >>= 2 }
            if !(-0x80000..=0x7ffff).contains(&r) {
              // promote to the indirect form rather than failing
              if instr.ops == InstrOps::P2Jump {
                need_indirect = true;
                continue 'decode;
              }
              self.diag.error(line_span, DiagKind::Asm,
                format!("Operand for {} is out of range", instr.name));
            }
            src = r & 0xfffff;
            val |= 1 << 20;
            if let Some(rix) = reloc {
              // relative branches need no load-time fixup
              out.relocs[rix].kind = RelocKind::None;
            }
          } else {
            if !(0..=0xfffff).contains(&isrc) {
              self.diag.error(line_span, DiagKind::Asm,
                format!("Operand for {} is out of range", instr.name));
            }
            src = isrc & 0xfffff;
            src_reloc = reloc;
          }
          skip_range_checks = true;
        }
        InstrOps::DstOnly | InstrOps::P2DstConstOk => {
          (dst, dst_reloc) = self.eval_reloc_pasm_expr(d.operands[0], out, true, RelocKind::AugD);
        }
        InstrOps::CallOperand => {
          // P1 call: the return address register is <name>_ret
          let op = d.operands[0];
          let Some(name) = self.ast.ident_name(op) else {
            let span = self.ast.span(op);
            self.diag.error(span, DiagKind::Asm, "call operand must be an identifier");
            return;
          };
          src = self.eval_pasm_expr(op);
          let retname = crate::symbol::intern(&format!("{name}_ret"));
          let retast = self.ast.identifier_sym(retname);
          dst = self.eval_pasm_expr(retast);
        }
        InstrOps::P2DstTestp => {
          (dst, dst_reloc) = self.eval_reloc_pasm_expr(d.operands[0], out, true, RelocKind::AugD);
        }
      }

      // one instruction is at most three longs: AUGD + AUGS + the op
      let mut encoded: ArrayVec<u8, 12> = ArrayVec::new();

      if instr.ops == InstrOps::P2Aug {
        if immmask == 0 {
          self.diag.error(line_span, DiagKind::Asm,
                          format!("{} requires immediate operand", instr.name));
        }
        immmask = 0;
        src = (src as u32 >> 9).into();
      } else if !skip_range_checks {
        if immmask & BIG_IMM_DST != 0 {
          let mut augval = val & 0xf000_0000; // preserve condition
          if augval == 0 { augval = 0xf000_0000 } // except _ret_
          if let Some(rix) = dst_reloc {
            if src_reloc.is_some() {
              self.diag.error(line_span, DiagKind::Asm,
                "two relocations on one instruction are not supported");
            }
            out.relocs[rix].kind = RelocKind::AugD;
            out.relocs[rix].symoff = dst as i32;
            dst = 0;
            dst_reloc = None;
          }
          augval |= (dst as u32 >> 9) & 0x007f_ffff;
          augval |= 0x0f80_0000; // AUGD
          dst &= 0x1ff;
          encoded.try_extend_from_slice(&augval.to_le_bytes())
            .expect("instruction overflow");
          immmask &= !BIG_IMM_DST;
        } else if dst_reloc.is_some() {
          self.diag.error(line_span, DiagKind::Asm,
                          "Use of immediate hub address in dest requires ##");
        }
        if immmask & BIG_IMM_SRC != 0 {
          let mut augval = val & 0xf000_0000;
          if augval == 0 { augval = 0xf000_0000 }
          if let Some(rix) = src_reloc {
            out.relocs[rix].kind = RelocKind::AugS;
            out.relocs[rix].symoff = src as i32;
            src = 0;
            src_reloc = None;
          }
          augval |= (src as u32 >> 9) & 0x007f_ffff;
          augval |= 0x0f00_0000; // AUGS
          src &= 0x1ff;
          encoded.try_extend_from_slice(&augval.to_le_bytes())
            .expect("instruction overflow");
          immmask &= !BIG_IMM_SRC;
        } else if src_reloc.is_some() {
          self.diag.error(line_span, DiagKind::Asm,
                          "Use of immediate hub address in src requires ##");
          src_reloc = None;
        }
        if src > 511 || src < 0 {
          self.diag.error(line_span, DiagKind::Asm,
                          format!("Source operand too big for {}", instr.name));
          return;
        }
        if dst > 511 || dst < 0 {
          self.diag.error(line_span, DiagKind::Asm,
                          format!("Destination operand too big for {}", instr.name));
          return;
        }
      }

      let mut word = val | ((dst as u32) << 9) | (src as u32 & 0xfffff)
        | (immmask & !0xff);
      if let Some(rix) = src_reloc {
        out.relocs[rix].symoff = word as i32;
      }
      if compress {
        word = (word >> 14) | (word << 18);
        encoded.try_extend_from_slice(&(word as u16).to_le_bytes())
          .expect("instruction overflow");
      } else {
        encoded.try_extend_from_slice(&word.to_le_bytes())
          .expect("instruction overflow");
      }
      for b in encoded { out.put_byte(b) }
      return;
    }
  }

  fn eval_operand(&mut self, instr: &Instruction, op: AstId) -> i64 {
    let span = self.ast.span(op);
    match self.ast.kind(op) {
      AstKind::Catch => {
        self.diag.error(span, DiagKind::Asm,
          format!("\\ absolute expression marker not valid for {}", instr.name));
        0
      }
      AstKind::Operator => {
        if let Payload::Oper(Op::Increment | Op::Decrement) = self.ast.get(op).d {
          self.diag.error(span, DiagKind::Asm,
            format!("invalid addressing mode for {}", instr.name));
          return 0;
        }
        self.eval_pasm_expr(op)
      }
      AstKind::RangeRef => {
        self.diag.error(span, DiagKind::Asm,
          format!("invalid addressing mode for {}", instr.name));
        0
      }
      _ => self.eval_pasm_expr(op),
    }
  }

  /// Is this expression (transitively) a label that lives in hub memory?
  #[must_use] pub fn is_relative_hub_address(&self, e: AstId) -> bool {
    let node = self.ast.get(e);
    match node.kind {
      AstKind::Integer | AstKind::HwReg => false,
      AstKind::LocalIdentifier => {
        node.left.is_some_and(|l| self.is_relative_hub_address(l))
      }
      AstKind::Identifier => {
        let Some(name) = self.ast.ident_name(e) else { return false };
        let Some(ent) = self.lookup_symbol(name) else { return false };
        let (SymKind::Label, SymVal::Label(ix)) = (ent.kind, ent.val) else { return false };
        let Some(m) = self.current_module else { return false };
        self.module(m).labels.get(ix as usize)
          .is_some_and(|l| l.flags.contains(LabelFlags::IN_HUB))
      }
      _ => {
        node.left.is_some_and(|l| self.is_relative_hub_address(l))
          || node.right.is_some_and(|r| self.is_relative_hub_address(r))
      }
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::{Compiler, Options, Language};
  use crate::types::ast::AstKind;

  fn session() -> Compiler {
    let mut c = Compiler::new(Options::default());
    c.diag.capture();
    let m = c.new_module("t.spin2", Language::Spin2);
    c.current_module = Some(m);
    c
  }

  /// Build `mnemonic dst, {#}src` as an InstrHolder at `pc`.
  fn mk_instr(c: &mut Compiler, name: &str, ops: &[(i64, bool, bool)], pc: i64) -> AstId {
    let ix = instr::find_instruction(c.options.target, name).unwrap();
    let inode = c.ast.new_with(AstKind::Instr, Payload::Instr(ix), None, None);
    let mut chain: Option<AstId> = None;
    for &(v, imm, big) in ops {
      let opnode = c.ast.integer(v);
      let holder = if big {
        c.ast.new_node(AstKind::BigImmHolder, Some(opnode), None)
      } else if imm {
        c.ast.new_node(AstKind::ImmHolder, Some(opnode), None)
      } else {
        opnode
      };
      let cell = c.ast.new_node(AstKind::ExprList, Some(holder), None);
      chain = Some(c.ast.list_append(chain, cell));
    }
    c.ast.get_mut(inode).right = chain;
    c.ast.new_with(AstKind::InstrHolder, Payload::Int(pc), Some(inode), None)
  }

  #[test]
  fn p2_add_imm_encoding() {
    let mut c = session();
    // add 5, #3  (dst register 5, src immediate 3)
    let h = mk_instr(&mut c, "add", &[(5, false, false), (3, true, false)], 0);
    let mut out = DatOut::new(true);
    c.assemble_instruction(&mut out, h);
    assert_eq!(c.diag.errors(), 0, "{:?}", c.diag.captured());
    assert_eq!(out.data.len(), 4);
    let word = u32::from_le_bytes(out.data[..4].try_into().unwrap());
    let expect = (0b000_1000 << 21) | (0xf << 28) | P2_IMM_SRC | (5 << 9) | 3;
    assert_eq!(word, expect, "got {word:#010x} want {expect:#010x}");
  }

  #[test]
  fn p2_big_imm_emits_augs() {
    let mut c = session();
    // mov 1, ##$12345
    let h = mk_instr(&mut c, "mov", &[(1, false, false), (0x12345, false, true)], 0);
    let mut out = DatOut::new(true);
    c.assemble_instruction(&mut out, h);
    assert_eq!(c.diag.errors(), 0, "{:?}", c.diag.captured());
    assert_eq!(out.data.len(), 8, "AUGS prefix + instruction");
    let aug = u32::from_le_bytes(out.data[..4].try_into().unwrap());
    let ins = u32::from_le_bytes(out.data[4..8].try_into().unwrap());
    assert_eq!(aug & 0x0f80_0000, 0x0f00_0000, "AUGS marker");
    assert_eq!(aug & 0x007f_ffff, 0x12345 >> 9);
    assert_eq!(ins & 0x1ff, 0x12345 & 0x1ff);
    assert_ne!(ins & P2_IMM_SRC, 0);
  }

  #[test]
  fn p2_relative_branch_in_range() {
    let mut c = session();
    // cog instruction at pc 0x20 (bytes): jmp #$10 (cog long address)
    let pc = 0x20 | (1 << 30);
    let h = mk_instr(&mut c, "jmp", &[(0x10, true, false)], pc);
    let mut out = DatOut::new(true);
    c.assemble_instruction(&mut out, h);
    assert_eq!(c.diag.errors(), 0, "{:?}", c.diag.captured());
    let word = u32::from_le_bytes(out.data[..4].try_into().unwrap());
    assert_ne!(word & (1 << 20), 0, "relative form selected");
    // displacement: 0x10*4 - (0x20+4) = 0x1c
    assert_eq!(word & 0xfffff, 0x1c);
  }

  #[test]
  fn p2_tjz_branch_out_of_range_errors() {
    let mut c = session();
    // djnz 1, #target where target is way out of 9-bit range
    let pc = 0 | (1 << 30);
    let h = mk_instr(&mut c, "djnz", &[(1, false, false), (0x150, true, false)], pc);
    let mut out = DatOut::new(true);
    c.assemble_instruction(&mut out, h);
    assert_eq!(c.diag.errors(), 1, "+0x150 longs exceeds the 9-bit branch range");
  }

  #[test]
  fn compressed_rotation() {
    let mut c = session();
    let ix = instr::find_instruction(c.options.target, "nop").unwrap();
    let inode = c.ast.new_with(AstKind::Instr, Payload::Instr(ix), None, None);
    let wrapped = c.ast.new_node(AstKind::CompressInstr, Some(inode), None);
    let h = c.ast.new_with(AstKind::InstrHolder, Payload::Int(0), Some(wrapped), None);
    let mut out = DatOut::new(false);
    c.assemble_instruction(&mut out, h);
    // nop encodes as 0, rotation keeps it 0, compressed to 16 bits
    assert_eq!(out.data, vec![0, 0]);
  }

  #[test]
  fn modcz_packs_nibbles() {
    let mut c = session();
    let h = mk_instr(&mut c, "modcz", &[(0xa, false, false), (0x5, false, false)], 0);
    let mut out = DatOut::new(false);
    c.assemble_instruction(&mut out, h);
    let word = u32::from_le_bytes(out.data[..4].try_into().unwrap());
    let dfield = (word >> 9) & 0x1ff;
    assert_eq!(dfield & 0xf, 0x5, "z nibble in low bits");
  }
}
