//! PASM intermediate representation, used by the assembler back end and
//! its optimiser. Most instructions pass straight through; a number of
//! common ones are recognised specially by the optimiser, and pseudo-ops
//! cover data directives and layout markers.

use bitflags::bitflags;
use crate::symbol::Symbol;
use crate::types::AstId;

/// Opcodes known to the optimiser, plus the `Generic*` escape hatches for
/// everything else and pseudo-ops for data directives.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum IrOp {
  Abs, Add, AddSx, AddX, AltD, AltS, And, AndN, Call, Cmp, CmpS,
  CogId, CogStop, Djnz, Jump, JmpRet,
  LockClr, LockNew, LockRet, LockSet,
  MaxS, MinS, MaxU, MinU,
  Mov, MovD, MovS, MuxC, MuxNc, MuxNz, MuxZ,
  Neg, NegC, NegNc, NegNz, NegZ, Nop, Or,
  RdByte, RdLong, RdWord, Ret, RevP1, RevP2,
  Rcl, Rcr, Rol, Ror, Sar, Shl, Shr, Sub, SubSx, SubX,
  SumC, SumNc, SumNz, SumZ, Test, TestN, WaitCnt,
  WrByte, WrLong, WrWord, Xor,
  // P2 instructions
  AddCt1, BitC, BitNc, BitH, BitL, BitNot, BMask, Break,
  Decod, DrvC, DrvH, DrvL, DrvNc, DrvNz, DrvZ, Encod,
  GetByte, GetCt, GetNib, GetQx, GetQy, GetRnd, GetWord,
  HubSet, JmpRel, LockTry, LockRel, MulS, MulU, Not, Ones,
  Pop, Push, QDiv, QExp, QFrac, QLog, QMul, QRotate, QSqrt, QVector,
  MuxQ, RdPin, SetByte, SetWord, SetQ, SetQ2, SignX, SubR,
  TestB, TestBn, WaitX, Wrc, WrNc, WrNz, Wrz, ZeroX,
  Repeat, RepeatEnd,
  /// Unknown to the optimiser (must follow the real instructions).
  Generic,
  /// Like `Generic` but guaranteed not to write its destination.
  GenericNr,
  /// Like `Generic` but affects the next instruction too.
  GenericDelay,
  /// Like `Generic` but known not to use flags.
  GenericNoFlags,
  GenericNrNoFlags,
  /// A branch the optimiser does not know about.
  GenericBranch,
  /// A conditional branch whose destination is in the src field.
  GenericBrCond,
  // pseudo-instructions below
  PushRegs, PopRegs,
  HubMode, Org, OrgF, Fit,
  Literal, Comment,
  Label, Byte, Word, Long, StringData, LabeledBlob,
  Reserve, ReserveH, AlignL,
  FCache,
  Compress2, Compress3,
  Live, Const, Dummy,
  Unknown,
}

impl IrOp {
  /// Real machine instructions (everything before `Generic`) plus the
  /// generic escapes are emittable; pseudo-ops are not.
  #[must_use] pub fn is_instruction(self) -> bool {
    (self as u32) <= (IrOp::GenericBrCond as u32)
  }

  #[must_use] pub fn is_branch(self) -> bool {
    matches!(self, IrOp::Call | IrOp::Djnz | IrOp::Jump | IrOp::JmpRet
             | IrOp::JmpRel | IrOp::GenericBranch | IrOp::GenericBrCond)
  }
}

/// Condition codes for conditional execution. These are the hardware bit
/// patterns inverted, so `Always` is zero and bit operations on pairs
/// work out.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
#[repr(u8)]
pub enum IrCond {
  #[default]
  Always = 0,      // hardware 1111
  COrZ,            // 1110
  COrNz,           // 1101
  C,               // 1100
  NcOrZ,           // 1011
  Z,               // 1010
  CEqZ,            // 1001
  CAndZ,           // 1000
  NcOrNz,          // 0111
  CNeZ,            // 0110
  Nz,              // 0101
  CAndNz,          // 0100
  Nc,              // 0011
  NcAndZ,          // 0010
  NcAndNz,         // 0001
  Never,           // 0000
}

impl IrCond {
  pub const LE: IrCond = IrCond::COrZ;
  pub const LT: IrCond = IrCond::C;
  pub const GE: IrCond = IrCond::Nc;
  pub const EQ: IrCond = IrCond::Z;
  pub const NE: IrCond = IrCond::Nz;
  pub const GT: IrCond = IrCond::NcAndNz;

  /// The 4-bit hardware encoding.
  #[must_use] pub fn bits(self) -> u32 { 0xf ^ (self as u32) }

  /// The logical complement. With the inverted encoding this is just the
  /// bitwise complement of the discriminant.
  #[must_use] pub fn invert(self) -> IrCond {
    use IrCond::*;
    const TABLE: [IrCond; 16] = [
      Never, NcAndNz, NcAndZ, Nc, CAndNz, Nz, CNeZ, NcOrNz,
      CAndZ, CEqZ, Z, NcOrZ, C, COrNz, COrZ, Always,
    ];
    TABLE[self as usize]
  }
}

bitflags! {
  /// Per-instruction feature and effect flags; high bits belong to the
  /// optimiser.
  #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
  pub struct InstrFlags: u32 {
    const WZ  = 0x1;
    const WC  = 0x2;
    const NR  = 0x4;
    const WR  = 0x8;
    const WCZ = 0x10;
    const ANDC = 0x20;
    const ANDZ = 0x40;
    const ORC  = 0x80;
    const ORZ  = 0x100;
    const XORC = 0x200;
    const XORZ = 0x400;
    /// Warn if there are no wc/wz markers on the instruction.
    const WARN_NOTUSED = 0x800;
    /// Must not be touched by the optimiser.
    const KEEP_INSTR = 0x1000;
    const JMPTABLE_INSTR = 0x2000;
    const LABEL_NOJUMP = 0x4000;
    /// Came from user inline assembly.
    const USER_INSTR = 0x8000;
    const LABEL_USED = 0x10_0000;
    const INSTR_NEW  = 0x20_0000;
  }
}

impl InstrFlags {
  #[must_use] pub fn p1_std() -> Self {
    InstrFlags::WZ | InstrFlags::WC | InstrFlags::NR | InstrFlags::WR
  }
  #[must_use] pub fn p2_std() -> Self {
    InstrFlags::WZ | InstrFlags::WC | InstrFlags::WCZ
  }
  #[must_use] pub fn p2_jmp() -> Self { Self::p2_std() | InstrFlags::WR }
  #[must_use] pub fn p2_cztest() -> Self {
    InstrFlags::WZ | InstrFlags::WC | InstrFlags::ANDC | InstrFlags::ANDZ
      | InstrFlags::ORC | InstrFlags::ORZ | InstrFlags::XORC | InstrFlags::XORZ
  }
  #[must_use] pub fn czset() -> Self { Self::p2_cztest() | InstrFlags::WCZ }
  #[must_use] pub fn jmpset() -> Self { Self::czset() | InstrFlags::WR }
}

/// Where an operand's value lives.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OperandKind {
  /// Immediate value (possibly materialised in a register later).
  ImmInt,
  /// Immediate holding a COG memory address.
  ImmCogLabel,
  /// Immediate holding a HUB memory address.
  ImmHubLabel,
  ImmString,
  /// A whole DAT section including relocations.
  ImmBinary,
  HwReg,
  Reg,
  /// Live only inside one function.
  LocalReg,
  TempReg,
  /// Register holding a hub address.
  HubPtr,
  CogPtr,
  ArgReg,
  ResultReg,
  /// Offset into a composite register; `name` is the base register.
  SubReg,
  /// Register-indirect hub memory access; `val` is the offset.
  HubMemRef,
  CogMemRef,
  StringDef,
  LongDef,
  WordDef,
  ByteDef,
  PcRelative,
}

impl OperandKind {
  #[must_use] pub fn is_register(self) -> bool {
    matches!(self, OperandKind::HwReg | OperandKind::Reg | OperandKind::LocalReg
             | OperandKind::TempReg | OperandKind::HubPtr | OperandKind::CogPtr
             | OperandKind::ArgReg | OperandKind::ResultReg | OperandKind::SubReg)
  }

  #[must_use] pub fn is_mem_ref(self) -> bool {
    matches!(self, OperandKind::HubMemRef | OperandKind::CogMemRef)
  }
}

/// Source/destination effect annotations (pointer auto-increment forms
/// and addressing overrides).
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum OpEffect {
  #[default]
  None,
  PreDec,
  PostDec,
  PreInc,
  PostInc,
  ForceAbs,
  ForceHub,
  NoImm,
  DummyZero,
}

/// An operand. Operands live in a per-program pool so registers can be
/// shared between instructions and use counts accumulated.
#[derive(Clone, Debug)]
pub struct Operand {
  pub kind: OperandKind,
  pub name: Symbol,
  pub val: i64,
  /// Only meaningful for memory references.
  pub size: i32,
  pub used: u32,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct OperandId(pub u32);

/// One IR instruction (or pseudo-op).
#[derive(Clone, Debug)]
pub struct Ir {
  pub opc: IrOp,
  pub cond: IrCond,
  pub dst: Option<OperandId>,
  pub src: Option<OperandId>,
  /// For the few three-operand instructions (getword and friends).
  pub src2: Option<OperandId>,
  pub flags: InstrFlags,
  pub addr: u32,
  /// Index into the PASM instruction table once matched.
  pub instr: Option<u32>,
  pub src_effect: OpEffect,
  pub dst_effect: OpEffect,
  /// If set, the FCACHE block root this instruction belongs to.
  pub fcache: Option<OperandId>,
  /// Originating source construct, for error messages.
  pub line: Option<AstId>,
}

impl Ir {
  #[must_use] pub fn new(opc: IrOp) -> Self {
    Ir {
      opc, cond: IrCond::Always,
      dst: None, src: None, src2: None,
      flags: InstrFlags::empty(), addr: 0, instr: None,
      src_effect: OpEffect::None, dst_effect: OpEffect::None,
      fcache: None, line: None,
    }
  }
}

/// An instruction list plus its operand pool. The original keeps a
/// doubly-linked list; splicing a vector by index is equivalent and keeps
/// ownership simple.
#[derive(Default)]
pub struct IrProgram {
  pub ir: Vec<Ir>,
  pub operands: Vec<Operand>,
}

impl IrProgram {
  #[must_use] pub fn new() -> Self { Self::default() }

  pub fn new_operand(&mut self, kind: OperandKind, name: Symbol, val: i64) -> OperandId {
    let id = OperandId(u32::try_from(self.operands.len()).expect("operand overflow"));
    self.operands.push(Operand { kind, name, val, size: 0, used: 0 });
    id
  }

  pub fn new_immediate(&mut self, val: i64) -> OperandId {
    self.new_operand(OperandKind::ImmInt, crate::symbol::intern(""), val)
  }

  #[must_use] pub fn operand(&self, id: OperandId) -> &Operand { &self.operands[id.0 as usize] }
  pub fn operand_mut(&mut self, id: OperandId) -> &mut Operand { &mut self.operands[id.0 as usize] }

  pub fn append(&mut self, ir: Ir) -> usize {
    self.ir.push(ir);
    self.ir.len() - 1
  }

  pub fn insert_before(&mut self, at: usize, ir: Ir) { self.ir.insert(at, ir) }

  /// Mark for removal; [`IrProgram::sweep_dummies`] compacts.
  pub fn delete(&mut self, at: usize) { self.ir[at].opc = IrOp::Dummy }

  pub fn sweep_dummies(&mut self) {
    self.ir.retain(|ir| ir.opc != IrOp::Dummy);
  }

  /// Remove labels that no branch references. Returns the removal count.
  pub fn remove_unused_labels(&mut self) -> usize {
    let mut used: Vec<OperandId> = Vec::new();
    for ir in &self.ir {
      if ir.opc == IrOp::Label { continue }
      if let Some(d) = ir.dst { used.push(d) }
      if let Some(s) = ir.src { used.push(s) }
    }
    let before = self.ir.len();
    self.ir.retain(|ir| {
      if ir.opc != IrOp::Label { return true }
      if ir.flags.contains(InstrFlags::LABEL_NOJUMP) { return true }
      match ir.dst {
        Some(d) => used.contains(&d),
        None => true,
      }
    });
    before - self.ir.len()
  }

  /// Remove unconditional jumps to the immediately following label.
  pub fn remove_jumps_to_next(&mut self) -> usize {
    let mut removed = 0;
    let mut i = 0;
    while i + 1 < self.ir.len() {
      let is_jump = self.ir[i].opc == IrOp::Jump
        && self.ir[i].cond == IrCond::Always;
      if is_jump && self.ir[i + 1].opc == IrOp::Label
        && self.ir[i].src == self.ir[i + 1].dst
      {
        self.ir.remove(i);
        removed += 1;
        continue;
      }
      i += 1;
    }
    removed
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::symbol::intern;

  #[test]
  fn cond_bits() {
    assert_eq!(IrCond::Always.bits(), 0xf);
    assert_eq!(IrCond::Never.bits(), 0x0);
    assert_eq!(IrCond::Z.bits(), 0b1010 ^ 0); // EQ pattern
    assert_eq!(IrCond::EQ, IrCond::Z);
  }

  #[test]
  fn unused_label_sweep() {
    let mut prog = IrProgram::new();
    let lab_a = prog.new_operand(OperandKind::ImmCogLabel, intern("a"), 0);
    let lab_b = prog.new_operand(OperandKind::ImmCogLabel, intern("b"), 0);
    let mut l1 = Ir::new(IrOp::Label); l1.dst = Some(lab_a);
    let mut l2 = Ir::new(IrOp::Label); l2.dst = Some(lab_b);
    let mut jmp = Ir::new(IrOp::Jump); jmp.src = Some(lab_a);
    prog.append(l1);
    prog.append(l2);
    prog.append(jmp);
    assert_eq!(prog.remove_unused_labels(), 1);
    assert_eq!(prog.ir.len(), 2);
  }

  #[test]
  fn jump_to_next_removed() {
    let mut prog = IrProgram::new();
    let lab = prog.new_operand(OperandKind::ImmCogLabel, intern("l"), 0);
    let mut jmp = Ir::new(IrOp::Jump); jmp.src = Some(lab);
    let mut l = Ir::new(IrOp::Label); l.dst = Some(lab);
    prog.append(jmp);
    prog.append(l);
    assert_eq!(prog.remove_jumps_to_next(), 1);
    assert_eq!(prog.ir.len(), 1);
  }
}
