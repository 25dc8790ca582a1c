//! Nu interpreter intermediate representation: a fixed set of logical
//! opcodes addressed through a packed 8-bit bytecode. Each function
//! lowers to one [`NuList`]; the packer assigns dispatch-table slots
//! afterwards ([`crate::packer`]).

use crate::symbol::Symbol;
use crate::types::NuLabelId;

/// The logical opcode set. Stack effects are noted where they matter to
/// the optimiser; `tos` is top of stack, `nos` next on stack.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum NuOp {
  // loads and stores; address on tos
  LdB, LdW, LdL, LdD,
  /// Sign-extending narrow loads.
  LdBs, LdWs,
  StB, StW, StL, StD,
  LdReg, StReg,
  // base-relative address producers: tos += base
  AddVbase, AddDbase, AddSp, AddPc, AddSuper,
  /// tos := nos SIGNX tos.
  SignX,
  ZeroX,
  // arithmetic: tos := nos OP tos
  Add, Sub, And, Ior, Xor, Shl, Shr, Sar,
  Neg, Not, Abs, Isqrt, Rev, Double, Inc, Dec,
  Encode, Encode2,
  Mins, Maxs, Minu, Maxu,
  /// Low 32 bits of the product.
  Mul,
  /// 32×32→64 producing two stack items (low, high).
  MulU, MulS,
  /// Divide producing quotient and remainder.
  DivU, DivS,
  MovByts,
  // stack manipulation
  Dup, Dup2, Drop, Drop2, Swap, Swap2, Over,
  // frames and control transfer through registers
  Enter, Ret, Call, CallA, CallM, GoSub,
  SetJmp, LongJmp, Break, GetHeap, InlineAsm,
  // pins
  PinLo, PinHi, PinNot, PinRnd, PinWr, PinRd,
  /// Push a 32-bit immediate.
  PushI,
  /// Push a label address.
  PushA,
  // absolute control flow
  Jmp, JmpRel,
  // relative branches (encoded with an FVAR displacement, except Bra3)
  Bra,
  /// Fixed 3-byte branch, used in `JmpRel` jump tables.
  Bra3,
  Bz, Bnz, Djnz, DjnzFast,
  // compare-and-branch
  CbEq, CbNe, CbLts, CbLes, CbLtu, CbLeu, CbGts, CbGes, CbGtu, CbGeu,
  /// Error/undefined.
  Illegal,
  // pseudo-ops: this and everything below needs no code
  Dummy, Label, Align, Comment,
}

impl NuOp {
  #[must_use] pub fn needs_no_code(self) -> bool {
    matches!(self, NuOp::Dummy | NuOp::Label | NuOp::Align | NuOp::Comment)
  }

  /// Any transfer of control, relative or absolute.
  #[must_use] pub fn is_any_branch(self) -> bool {
    self.is_rel_branch()
      || matches!(self, NuOp::Jmp | NuOp::JmpRel | NuOp::Ret | NuOp::Call
                  | NuOp::CallA | NuOp::CallM | NuOp::GoSub | NuOp::LongJmp)
  }

  /// Branches encoded with a relative displacement; these can never be
  /// folded into macros because the displacement is measured from the
  /// opcode itself.
  #[must_use] pub fn is_rel_branch(self) -> bool {
    matches!(self, NuOp::Bra | NuOp::Bra3 | NuOp::Bz | NuOp::Bnz
             | NuOp::Djnz | NuOp::DjnzFast) || self.is_cb()
  }

  /// The compare-and-branch family (the `CBxx` supermatch).
  #[must_use] pub fn is_cb(self) -> bool {
    matches!(self, NuOp::CbEq | NuOp::CbNe | NuOp::CbLts | NuOp::CbLes
             | NuOp::CbLtu | NuOp::CbLeu | NuOp::CbGts | NuOp::CbGes
             | NuOp::CbGtu | NuOp::CbGeu)
  }

  /// The base-relative address producers (the `ADD_xBASE` supermatch).
  #[must_use] pub fn is_add_base(self) -> bool {
    matches!(self, NuOp::AddVbase | NuOp::AddDbase | NuOp::AddSp
             | NuOp::AddPc | NuOp::AddSuper)
  }

  /// Two-in one-out operators eligible for `PUSH_n_<op>` fusion.
  #[must_use] pub fn is_binary_op(self) -> bool {
    matches!(self, NuOp::Add | NuOp::Sub | NuOp::And | NuOp::Ior | NuOp::Xor
             | NuOp::Shl | NuOp::Shr | NuOp::Sar | NuOp::SignX | NuOp::ZeroX
             | NuOp::Mins | NuOp::Maxs | NuOp::Minu | NuOp::Maxu | NuOp::Mul
             | NuOp::MovByts)
  }

  /// Does a branch with this opcode carry a label operand?
  #[must_use] pub fn takes_label(self) -> bool {
    self.is_rel_branch() || self == NuOp::PushA
  }

  /// Invert the sense of a conditional branch (for `CBxx L; BRA M; L:`).
  #[must_use] pub fn invert_condition(self) -> NuOp {
    match self {
      NuOp::Bz => NuOp::Bnz,
      NuOp::Bnz => NuOp::Bz,
      NuOp::CbEq => NuOp::CbNe,
      NuOp::CbNe => NuOp::CbEq,
      NuOp::CbLts => NuOp::CbGes,
      NuOp::CbGes => NuOp::CbLts,
      NuOp::CbLes => NuOp::CbGts,
      NuOp::CbGts => NuOp::CbLes,
      NuOp::CbLtu => NuOp::CbGeu,
      NuOp::CbGeu => NuOp::CbLtu,
      NuOp::CbLeu => NuOp::CbGtu,
      NuOp::CbGtu => NuOp::CbLeu,
      other => other,
    }
  }

  /// Swap the operand order of a comparison (for `SWAP; CBxx`).
  #[must_use] pub fn reverse_condition(self) -> NuOp {
    match self {
      NuOp::CbLts => NuOp::CbGts,
      NuOp::CbGts => NuOp::CbLts,
      NuOp::CbLes => NuOp::CbGes,
      NuOp::CbGes => NuOp::CbLes,
      NuOp::CbLtu => NuOp::CbGtu,
      NuOp::CbGtu => NuOp::CbLtu,
      NuOp::CbLeu => NuOp::CbGeu,
      NuOp::CbGeu => NuOp::CbLeu,
      other => other,
    }
  }

  /// Mnemonic as it appears in the interpreter source (`impl_<NAME>`).
  #[must_use] pub fn name(self) -> &'static str {
    match self {
      NuOp::LdB => "LDB", NuOp::LdW => "LDW", NuOp::LdL => "LDL", NuOp::LdD => "LDD",
      NuOp::LdBs => "LDBS", NuOp::LdWs => "LDWS",
      NuOp::StB => "STB", NuOp::StW => "STW", NuOp::StL => "STL", NuOp::StD => "STD",
      NuOp::LdReg => "LDREG", NuOp::StReg => "STREG",
      NuOp::AddVbase => "ADD_VBASE", NuOp::AddDbase => "ADD_DBASE",
      NuOp::AddSp => "ADD_SP", NuOp::AddPc => "ADD_PC", NuOp::AddSuper => "ADD_SUPER",
      NuOp::SignX => "SIGNX", NuOp::ZeroX => "ZEROX",
      NuOp::Add => "ADD", NuOp::Sub => "SUB", NuOp::And => "AND",
      NuOp::Ior => "IOR", NuOp::Xor => "XOR",
      NuOp::Shl => "SHL", NuOp::Shr => "SHR", NuOp::Sar => "SAR",
      NuOp::Neg => "NEG", NuOp::Not => "NOT", NuOp::Abs => "ABS",
      NuOp::Isqrt => "ISQRT", NuOp::Rev => "REV", NuOp::Double => "DOUBLE",
      NuOp::Inc => "INC", NuOp::Dec => "DEC",
      NuOp::Encode => "ENCODE", NuOp::Encode2 => "ENCODE2",
      NuOp::Mins => "MINS", NuOp::Maxs => "MAXS",
      NuOp::Minu => "MINU", NuOp::Maxu => "MAXU",
      NuOp::Mul => "MUL", NuOp::MulU => "MULU", NuOp::MulS => "MULS",
      NuOp::DivU => "DIVU", NuOp::DivS => "DIVS",
      NuOp::MovByts => "MOVBYTS",
      NuOp::Dup => "DUP", NuOp::Dup2 => "DUP2",
      NuOp::Drop => "DROP", NuOp::Drop2 => "DROP2",
      NuOp::Swap => "SWAP", NuOp::Swap2 => "SWAP2", NuOp::Over => "OVER",
      NuOp::Enter => "ENTER", NuOp::Ret => "RET", NuOp::Call => "CALL",
      NuOp::CallA => "CALLA", NuOp::CallM => "CALLM", NuOp::GoSub => "GOSUB",
      NuOp::SetJmp => "SETJMP", NuOp::LongJmp => "LONGJMP",
      NuOp::Break => "BREAK", NuOp::GetHeap => "GETHEAP",
      NuOp::InlineAsm => "INLINEASM",
      NuOp::PinLo => "PINLO", NuOp::PinHi => "PINHI", NuOp::PinNot => "PINNOT",
      NuOp::PinRnd => "PINRND", NuOp::PinWr => "PINWR", NuOp::PinRd => "PINRD",
      NuOp::PushI => "PUSHI", NuOp::PushA => "PUSHA",
      NuOp::Jmp => "JMP", NuOp::JmpRel => "JMPREL",
      NuOp::Bra => "BRA", NuOp::Bra3 => "BRA3",
      NuOp::Bz => "BZ", NuOp::Bnz => "BNZ",
      NuOp::Djnz => "DJNZ", NuOp::DjnzFast => "DJNZ_FAST",
      NuOp::CbEq => "CBEQ", NuOp::CbNe => "CBNE",
      NuOp::CbLts => "CBLTS", NuOp::CbLes => "CBLES",
      NuOp::CbLtu => "CBLTU", NuOp::CbLeu => "CBLEU",
      NuOp::CbGts => "CBGTS", NuOp::CbGes => "CBGES",
      NuOp::CbGtu => "CBGTU", NuOp::CbGeu => "CBGEU",
      NuOp::Illegal => "UNDEF",
      NuOp::Dummy => "DUMMY", NuOp::Label => "LABEL",
      NuOp::Align => "ALIGN", NuOp::Comment => "COMMENT",
    }
  }
}

/// A jump target / address constant.
#[derive(Clone, Debug)]
pub struct NuLabel {
  pub name: String,
  pub offset: i32,
  /// Sequence number of the defining `Label` instruction (set by the
  /// optimiser's scan pass).
  pub seqno: u32,
  /// The single branch that reaches this label, when provably unique.
  pub comefrom: Option<u32>,
  pub comefrom_valid: bool,
}

/// One Nu IR instruction.
#[derive(Clone, Debug)]
pub struct NuIr {
  pub op: NuOp,
  pub val: i32,
  pub label: Option<NuLabelId>,
  pub comment: Option<Symbol>,
  /// Assigned by the optimiser's pre-pass; 0 means unassigned.
  pub seqno: u32,
  /// Dispatch-table slot handle assigned by the packer.
  pub bytecode: Option<crate::packer::BcId>,
}

impl NuIr {
  #[must_use] pub fn new(op: NuOp) -> Self {
    NuIr { op, val: 0, label: None, comment: None, seqno: 0, bytecode: None }
  }
}

/// One function's instruction list.
#[derive(Default, Clone)]
pub struct NuList {
  pub ir: Vec<NuIr>,
}

impl NuList {
  #[must_use] pub fn new() -> Self { Self::default() }

  pub fn emit(&mut self, op: NuOp) -> &mut NuIr {
    self.ir.push(NuIr::new(op));
    self.ir.last_mut().expect("just pushed")
  }

  pub fn emit_const(&mut self, val: i32) {
    self.emit(NuOp::PushI).val = val;
  }

  pub fn emit_address(&mut self, label: NuLabelId) {
    self.emit(NuOp::PushA).label = Some(label);
  }

  pub fn emit_branch(&mut self, op: NuOp, label: NuLabelId) {
    self.emit(op).label = Some(label);
  }

  pub fn emit_label(&mut self, label: NuLabelId) {
    self.emit(NuOp::Label).label = Some(label);
  }

  pub fn emit_commented(&mut self, op: NuOp, comment: Symbol) {
    self.emit(op).comment = Some(comment);
  }
}

/// Label pool shared by all lists of a compilation.
#[derive(Default)]
pub struct NuLabelPool {
  labels: Vec<NuLabel>,
}

impl NuLabelPool {
  #[must_use] pub fn new() -> Self { Self::default() }

  pub fn create(&mut self) -> NuLabelId {
    let id = NuLabelId::from_usize(self.labels.len());
    self.labels.push(NuLabel {
      name: format!("__Label_{:05}", id.0),
      offset: 0, seqno: 0, comefrom: None, comefrom_valid: false,
    });
    id
  }

  #[must_use] pub fn get(&self, id: NuLabelId) -> &NuLabel { &self.labels[id.idx()] }
  pub fn get_mut(&mut self, id: NuLabelId) -> &mut NuLabel { &mut self.labels[id.idx()] }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn condition_tables() {
    assert_eq!(NuOp::CbLts.invert_condition(), NuOp::CbGes);
    assert_eq!(NuOp::CbGes.invert_condition(), NuOp::CbLts);
    assert_eq!(NuOp::CbLeu.reverse_condition(), NuOp::CbGeu);
    assert_eq!(NuOp::CbEq.reverse_condition(), NuOp::CbEq);
    // invert then invert is the identity across the family
    for op in [NuOp::CbEq, NuOp::CbNe, NuOp::CbLts, NuOp::CbLes, NuOp::CbLtu,
               NuOp::CbLeu, NuOp::CbGts, NuOp::CbGes, NuOp::CbGtu, NuOp::CbGeu] {
      assert_eq!(op.invert_condition().invert_condition(), op);
    }
  }

  #[test]
  fn classifications() {
    assert!(NuOp::CbLtu.is_cb());
    assert!(NuOp::CbLtu.is_rel_branch());
    assert!(NuOp::Ret.is_any_branch());
    assert!(!NuOp::Ret.is_rel_branch());
    assert!(NuOp::AddDbase.is_add_base());
    assert!(NuOp::Ior.is_binary_op());
    assert!(!NuOp::Dup.is_binary_op());
    assert!(NuOp::Label.needs_no_code());
  }
}
