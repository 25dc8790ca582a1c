//! PASM instruction and modifier tables. Each mnemonic row carries the
//! 32-bit binary template, an operand-form tag driving the decoder, the
//! IR opcode the optimiser knows it as, and the mask of allowed
//! `wc`/`wz`/... modifiers.
//!
//! P1 layout: `OOOOOO ZCRI CCCC DDDDDDDDD SSSSSSSSS` (cond at bit 18,
//! immediate bit 22). P2 layout: `EEEE OOOOOOO CZI DDDDDDDDD SSSSSSSSS`
//! (cond at bit 28, src-imm bit 18, dst-imm bit 19).

use crate::Target;
use crate::types::ir::IrOp;

/// Operand forms accepted by an instruction.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InstrOps {
  NoOperands,
  SrcOnly,
  DstOnly,
  TwoOperands,
  CallOperand,
  JmpRetOperands,
  JmpOperand,
  /// One of the two operands is optional (`neg r0` == `neg r0, r0`).
  TwoOperandsOptional,
  P2TjzOperands,
  /// Like TJZ, but source only.
  P2JintOperands,
  /// rdlong/wrlong and friends: source accepts ptr expressions with
  /// post-increment and such.
  P2RdWrOperands,
  /// Destination only, but an immediate is OK (encoded in the src slot).
  P2DstConstOk,
  /// Jump and call; the opcode may change based on the destination.
  P2Jump,
  /// `loc` instruction: destination must be pa/pb/ptra/ptrb.
  P2Loc,
  /// `calld`: like loc, but jump addressing.
  P2Calld,
  /// Two operands, both may be immediate.
  P2TwoOperands,
  /// Special flag handling for testp/testpn.
  P2DstTestp,
  ThreeOperandsNibble,
  ThreeOperandsByte,
  ThreeOperandsWord,
  P2Aug,
  P2Modcz,
  /// Two operands; a missing second operand defaults to `#0` (or the
  /// alti canned default).
  TwoOperandsDefz,
}

// flag-mask bits, mirroring types::ir::InstrFlags
pub const FLAG_WZ: u32 = 0x1;
pub const FLAG_WC: u32 = 0x2;
pub const FLAG_NR: u32 = 0x4;
pub const FLAG_WR: u32 = 0x8;
pub const FLAG_WCZ: u32 = 0x10;
pub const FLAG_ANDC: u32 = 0x20;
pub const FLAG_ANDZ: u32 = 0x40;
pub const FLAG_ORC: u32 = 0x80;
pub const FLAG_ORZ: u32 = 0x100;
pub const FLAG_XORC: u32 = 0x200;
pub const FLAG_XORZ: u32 = 0x400;
pub const FLAG_WARN_NOTUSED: u32 = 0x800;

pub const FLAG_P1_STD: u32 = FLAG_WZ | FLAG_WC | FLAG_NR | FLAG_WR;
pub const FLAG_P2_STD: u32 = FLAG_WZ | FLAG_WC | FLAG_WCZ;
pub const FLAG_P2_JMP: u32 = FLAG_P2_STD | FLAG_WR;
pub const FLAG_P2_CZTEST: u32 = FLAG_WZ | FLAG_WC | FLAG_ANDC | FLAG_ANDZ
  | FLAG_ORC | FLAG_ORZ | FLAG_XORC | FLAG_XORZ;
pub const FLAG_CZSET: u32 = FLAG_P2_CZTEST | FLAG_WCZ;
pub const FLAG_CSET: u32 = FLAG_WC | FLAG_WCZ | FLAG_ANDC | FLAG_ORC | FLAG_XORC;
pub const FLAG_ZSET: u32 = FLAG_WZ | FLAG_WCZ | FLAG_ANDZ | FLAG_ORZ | FLAG_XORZ;
pub const FLAG_JMPSET: u32 = FLAG_CZSET | FLAG_WR;

/// P1 immediate bit.
pub const IMMEDIATE_INSTR: u32 = 1 << 22;
/// P2 source-immediate bit (the I field).
pub const P2_IMM_SRC: u32 = 1 << 18;
/// P2 destination-immediate bit (the L field, sharing Z's position).
pub const P2_IMM_DST: u32 = 1 << 19;

/// One instruction-table row.
pub struct Instruction {
  pub name: &'static str,
  pub binary: u32,
  pub ops: InstrOps,
  pub opc: IrOp,
  pub flags: u32,
}

const fn p2(op: u32) -> u32 { op << 21 }
const fn p1(op: u32) -> u32 { op << 26 }
// P1 default ZCRI nibble: result write enabled
const P1_WR: u32 = 1 << 23;

use InstrOps::*;

/// The P2 instruction table. Sorted roughly by function; looked up
/// linearly by name (the table is small and assembly is not hot).
pub static INSTR_P2: &[Instruction] = &[
  Instruction { name: "nop", binary: 0, ops: NoOperands, opc: IrOp::Nop, flags: 0 },
  // shifts and rotates: opcode block 0000xxx
  Instruction { name: "ror", binary: p2(0b000_0000), ops: TwoOperands, opc: IrOp::Ror, flags: FLAG_P2_STD },
  Instruction { name: "rol", binary: p2(0b000_0001), ops: TwoOperands, opc: IrOp::Rol, flags: FLAG_P2_STD },
  Instruction { name: "shr", binary: p2(0b000_0010), ops: TwoOperands, opc: IrOp::Shr, flags: FLAG_P2_STD },
  Instruction { name: "shl", binary: p2(0b000_0011), ops: TwoOperands, opc: IrOp::Shl, flags: FLAG_P2_STD },
  Instruction { name: "rcr", binary: p2(0b000_0100), ops: TwoOperands, opc: IrOp::Rcr, flags: FLAG_P2_STD },
  Instruction { name: "rcl", binary: p2(0b000_0101), ops: TwoOperands, opc: IrOp::Rcl, flags: FLAG_P2_STD },
  Instruction { name: "sar", binary: p2(0b000_0110), ops: TwoOperands, opc: IrOp::Sar, flags: FLAG_P2_STD },
  // basic arithmetic
  Instruction { name: "add", binary: p2(0b000_1000), ops: TwoOperands, opc: IrOp::Add, flags: FLAG_P2_STD },
  Instruction { name: "addx", binary: p2(0b000_1001), ops: TwoOperands, opc: IrOp::AddX, flags: FLAG_P2_STD },
  Instruction { name: "adds", binary: p2(0b000_1010), ops: TwoOperands, opc: IrOp::Add, flags: FLAG_P2_STD },
  Instruction { name: "addsx", binary: p2(0b000_1011), ops: TwoOperands, opc: IrOp::AddSx, flags: FLAG_P2_STD },
  Instruction { name: "sub", binary: p2(0b000_1101), ops: TwoOperands, opc: IrOp::Sub, flags: FLAG_P2_STD },
  Instruction { name: "subx", binary: p2(0b000_1110), ops: TwoOperands, opc: IrOp::SubX, flags: FLAG_P2_STD },
  Instruction { name: "cmp", binary: p2(0b001_0000), ops: TwoOperands, opc: IrOp::Cmp, flags: FLAG_P2_STD | FLAG_WARN_NOTUSED },
  Instruction { name: "cmps", binary: p2(0b001_0001), ops: TwoOperands, opc: IrOp::CmpS, flags: FLAG_P2_STD | FLAG_WARN_NOTUSED },
  Instruction { name: "subr", binary: p2(0b001_0100), ops: TwoOperands, opc: IrOp::SubR, flags: FLAG_P2_STD },
  Instruction { name: "mins", binary: p2(0b001_1000), ops: TwoOperands, opc: IrOp::MinS, flags: FLAG_P2_STD },
  Instruction { name: "maxs", binary: p2(0b001_1001), ops: TwoOperands, opc: IrOp::MaxS, flags: FLAG_P2_STD },
  Instruction { name: "minu", binary: p2(0b001_1010), ops: TwoOperands, opc: IrOp::MinU, flags: FLAG_P2_STD },
  Instruction { name: "maxu", binary: p2(0b001_1011), ops: TwoOperands, opc: IrOp::MaxU, flags: FLAG_P2_STD },
  Instruction { name: "sumc", binary: p2(0b001_1100), ops: TwoOperands, opc: IrOp::SumC, flags: FLAG_P2_STD },
  Instruction { name: "sumnc", binary: p2(0b001_1101), ops: TwoOperands, opc: IrOp::SumNc, flags: FLAG_P2_STD },
  Instruction { name: "sumz", binary: p2(0b001_1110), ops: TwoOperands, opc: IrOp::SumZ, flags: FLAG_P2_STD },
  Instruction { name: "sumnz", binary: p2(0b001_1111), ops: TwoOperands, opc: IrOp::SumNz, flags: FLAG_P2_STD },
  // bit operations
  Instruction { name: "testb", binary: p2(0b010_0000), ops: TwoOperands, opc: IrOp::TestB, flags: FLAG_P2_CZTEST },
  Instruction { name: "testbn", binary: p2(0b010_0001), ops: TwoOperands, opc: IrOp::TestBn, flags: FLAG_P2_CZTEST },
  Instruction { name: "bitl", binary: p2(0b010_0000) | (1 << 19), ops: TwoOperandsDefz, opc: IrOp::BitL, flags: FLAG_WCZ },
  Instruction { name: "bith", binary: p2(0b010_0001) | (1 << 19), ops: TwoOperandsDefz, opc: IrOp::BitH, flags: FLAG_WCZ },
  Instruction { name: "bitc", binary: p2(0b010_0010) | (1 << 19), ops: TwoOperandsDefz, opc: IrOp::BitC, flags: FLAG_WCZ },
  Instruction { name: "bitnc", binary: p2(0b010_0011) | (1 << 19), ops: TwoOperandsDefz, opc: IrOp::BitNc, flags: FLAG_WCZ },
  Instruction { name: "bitnot", binary: p2(0b010_0111) | (1 << 19), ops: TwoOperandsDefz, opc: IrOp::BitNot, flags: FLAG_WCZ },
  // logic
  Instruction { name: "and", binary: p2(0b010_1000), ops: TwoOperands, opc: IrOp::And, flags: FLAG_P2_STD },
  Instruction { name: "andn", binary: p2(0b010_1001), ops: TwoOperands, opc: IrOp::AndN, flags: FLAG_P2_STD },
  Instruction { name: "or", binary: p2(0b010_1010), ops: TwoOperands, opc: IrOp::Or, flags: FLAG_P2_STD },
  Instruction { name: "xor", binary: p2(0b010_1011), ops: TwoOperands, opc: IrOp::Xor, flags: FLAG_P2_STD },
  Instruction { name: "muxc", binary: p2(0b010_1100), ops: TwoOperands, opc: IrOp::MuxC, flags: FLAG_P2_STD },
  Instruction { name: "muxnc", binary: p2(0b010_1101), ops: TwoOperands, opc: IrOp::MuxNc, flags: FLAG_P2_STD },
  Instruction { name: "muxz", binary: p2(0b010_1110), ops: TwoOperands, opc: IrOp::MuxZ, flags: FLAG_P2_STD },
  Instruction { name: "muxnz", binary: p2(0b010_1111), ops: TwoOperands, opc: IrOp::MuxNz, flags: FLAG_P2_STD },
  Instruction { name: "mov", binary: p2(0b011_0000), ops: TwoOperands, opc: IrOp::Mov, flags: FLAG_P2_STD },
  Instruction { name: "not", binary: p2(0b011_0001), ops: TwoOperandsOptional, opc: IrOp::Not, flags: FLAG_P2_STD },
  Instruction { name: "abs", binary: p2(0b011_0010), ops: TwoOperandsOptional, opc: IrOp::Abs, flags: FLAG_P2_STD },
  Instruction { name: "neg", binary: p2(0b011_0011), ops: TwoOperandsOptional, opc: IrOp::Neg, flags: FLAG_P2_STD },
  Instruction { name: "negc", binary: p2(0b011_0100), ops: TwoOperandsOptional, opc: IrOp::NegC, flags: FLAG_P2_STD },
  Instruction { name: "negnc", binary: p2(0b011_0101), ops: TwoOperandsOptional, opc: IrOp::NegNc, flags: FLAG_P2_STD },
  Instruction { name: "negz", binary: p2(0b011_0110), ops: TwoOperandsOptional, opc: IrOp::NegZ, flags: FLAG_P2_STD },
  Instruction { name: "negnz", binary: p2(0b011_0111), ops: TwoOperandsOptional, opc: IrOp::NegNz, flags: FLAG_P2_STD },
  Instruction { name: "test", binary: p2(0b011_1110), ops: TwoOperandsOptional, opc: IrOp::Test, flags: FLAG_P2_CZTEST },
  Instruction { name: "testn", binary: p2(0b011_1111), ops: TwoOperands, opc: IrOp::TestN, flags: FLAG_P2_CZTEST },
  // multiply / cordic
  Instruction { name: "mul", binary: p2(0b100_0000), ops: TwoOperands, opc: IrOp::MulU, flags: FLAG_WZ },
  Instruction { name: "muls", binary: p2(0b100_0001), ops: TwoOperands, opc: IrOp::MulS, flags: FLAG_WZ },
  Instruction { name: "qmul", binary: p2(0b101_0000), ops: P2TwoOperands, opc: IrOp::QMul, flags: 0 },
  Instruction { name: "qdiv", binary: p2(0b101_0001), ops: P2TwoOperands, opc: IrOp::QDiv, flags: 0 },
  Instruction { name: "qfrac", binary: p2(0b101_0010), ops: P2TwoOperands, opc: IrOp::QFrac, flags: 0 },
  Instruction { name: "qsqrt", binary: p2(0b101_0011), ops: P2TwoOperands, opc: IrOp::QSqrt, flags: 0 },
  Instruction { name: "qrotate", binary: p2(0b101_0100), ops: P2TwoOperands, opc: IrOp::QRotate, flags: 0 },
  Instruction { name: "qvector", binary: p2(0b101_0101), ops: P2TwoOperands, opc: IrOp::QVector, flags: 0 },
  Instruction { name: "qlog", binary: p2(0b110_1110) | 0b01110, ops: SrcOnly, opc: IrOp::QLog, flags: 0 },
  Instruction { name: "qexp", binary: p2(0b110_1110) | 0b01111, ops: SrcOnly, opc: IrOp::QExp, flags: 0 },
  // field extraction: third operand is a small immediate shifted into the opcode
  Instruction { name: "getnib", binary: p2(0b100_0100), ops: ThreeOperandsNibble, opc: IrOp::GetNib, flags: 0 },
  Instruction { name: "setnib", binary: p2(0b100_0000), ops: ThreeOperandsNibble, opc: IrOp::Generic, flags: 0 },
  Instruction { name: "getbyte", binary: p2(0b100_0110), ops: ThreeOperandsByte, opc: IrOp::GetByte, flags: 0 },
  Instruction { name: "setbyte", binary: p2(0b100_0010), ops: ThreeOperandsByte, opc: IrOp::SetByte, flags: 0 },
  Instruction { name: "getword", binary: p2(0b100_0111), ops: ThreeOperandsWord, opc: IrOp::GetWord, flags: 0 },
  Instruction { name: "setword", binary: p2(0b100_0011), ops: ThreeOperandsWord, opc: IrOp::SetWord, flags: 0 },
  // alt / indirection prefixes
  Instruction { name: "alts", binary: p2(0b100_1101), ops: TwoOperandsDefz, opc: IrOp::AltS, flags: 0 },
  Instruction { name: "altd", binary: p2(0b100_1110), ops: TwoOperandsDefz, opc: IrOp::AltD, flags: 0 },
  Instruction { name: "alti", binary: p2(0b100_1100), ops: TwoOperandsDefz, opc: IrOp::Generic, flags: 0 },
  // misc data ops
  Instruction { name: "decod", binary: p2(0b111_0100) | (0b01 << 19), ops: TwoOperandsOptional, opc: IrOp::Decod, flags: 0 },
  Instruction { name: "encod", binary: p2(0b111_0101), ops: TwoOperandsOptional, opc: IrOp::Encod, flags: FLAG_P2_STD },
  Instruction { name: "bmask", binary: p2(0b111_0110), ops: TwoOperandsOptional, opc: IrOp::BMask, flags: 0 },
  Instruction { name: "ones", binary: p2(0b111_0111), ops: TwoOperandsOptional, opc: IrOp::Ones, flags: FLAG_P2_STD },
  Instruction { name: "rev", binary: p2(0b110_1001) | 0b1101000, ops: DstOnly, opc: IrOp::RevP2, flags: 0 },
  Instruction { name: "signx", binary: p2(0b111_0010), ops: TwoOperands, opc: IrOp::SignX, flags: FLAG_P2_STD },
  Instruction { name: "zerox", binary: p2(0b111_0011), ops: TwoOperands, opc: IrOp::ZeroX, flags: FLAG_P2_STD },
  // hub memory
  Instruction { name: "rdbyte", binary: p2(0b101_0110), ops: P2RdWrOperands, opc: IrOp::RdByte, flags: FLAG_P2_STD },
  Instruction { name: "rdword", binary: p2(0b101_0111), ops: P2RdWrOperands, opc: IrOp::RdWord, flags: FLAG_P2_STD },
  Instruction { name: "rdlong", binary: p2(0b101_1000), ops: P2RdWrOperands, opc: IrOp::RdLong, flags: FLAG_P2_STD },
  Instruction { name: "wrbyte", binary: p2(0b110_0010), ops: P2RdWrOperands, opc: IrOp::WrByte, flags: 0 },
  Instruction { name: "wrword", binary: p2(0b110_0010) | (1 << 19), ops: P2RdWrOperands, opc: IrOp::WrWord, flags: 0 },
  Instruction { name: "wrlong", binary: p2(0b110_0011), ops: P2RdWrOperands, opc: IrOp::WrLong, flags: 0 },
  Instruction { name: "rdlut", binary: p2(0b101_0101), ops: P2RdWrOperands, opc: IrOp::Generic, flags: FLAG_P2_STD },
  Instruction { name: "wrlut", binary: p2(0b110_0001), ops: P2RdWrOperands, opc: IrOp::Generic, flags: 0 },
  // branches
  Instruction { name: "tjz", binary: p2(0b101_1101), ops: P2TjzOperands, opc: IrOp::GenericBrCond, flags: 0 },
  Instruction { name: "tjnz", binary: p2(0b101_1101) | (1 << 19), ops: P2TjzOperands, opc: IrOp::GenericBrCond, flags: 0 },
  Instruction { name: "djnz", binary: p2(0b101_1011), ops: P2TjzOperands, opc: IrOp::Djnz, flags: 0 },
  Instruction { name: "jint", binary: p2(0b101_1111), ops: P2JintOperands, opc: IrOp::GenericBrCond, flags: 0 },
  Instruction { name: "jct1", binary: p2(0b101_1111) | (0b000000001 << 9), ops: P2JintOperands, opc: IrOp::GenericBrCond, flags: 0 },
  Instruction { name: "jmp", binary: p2(0b110_1100), ops: P2Jump, opc: IrOp::Jump, flags: 0 },
  Instruction { name: "call", binary: p2(0b110_1101), ops: P2Jump, opc: IrOp::Call, flags: 0 },
  Instruction { name: "calla", binary: p2(0b110_1110), ops: P2Jump, opc: IrOp::Call, flags: 0 },
  Instruction { name: "jmp.ind", binary: p2(0b110_1011) | 0b101100 << 9 | 1 << 18, ops: SrcOnly, opc: IrOp::Jump, flags: FLAG_JMPSET },
  Instruction { name: "call.ind", binary: p2(0b110_1011) | 0b101101 << 9 | 1 << 18, ops: SrcOnly, opc: IrOp::Call, flags: FLAG_JMPSET },
  Instruction { name: "calld", binary: p2(0b101_1001), ops: P2TjzOperands, opc: IrOp::GenericBranch, flags: FLAG_P2_JMP },
  Instruction { name: "calld.loc", binary: p2(0b111_0000), ops: P2Calld, opc: IrOp::GenericBranch, flags: 0 },
  Instruction { name: "loc", binary: p2(0b111_0100), ops: P2Loc, opc: IrOp::GenericNoFlags, flags: 0 },
  Instruction { name: "rep", binary: p2(0b110_1100) | (1 << 19), ops: P2TwoOperands, opc: IrOp::Repeat, flags: 0 },
  Instruction { name: "ret", binary: p2(0b110_1011) | 0b101101 << 9 | 0x000 | (1 << 18), ops: NoOperands, opc: IrOp::Ret, flags: FLAG_P2_STD },
  Instruction { name: "jmprel", binary: p2(0b110_0110) | 0b11000 , ops: P2DstConstOk, opc: IrOp::JmpRel, flags: 0 },
  // pins and test
  Instruction { name: "testp", binary: p2(0b110_1101) | 0b1000000, ops: P2DstConstOk, opc: IrOp::Generic, flags: FLAG_P2_CZTEST },
  Instruction { name: "testpn", binary: p2(0b110_1101) | 0b1000001, ops: P2DstConstOk, opc: IrOp::Generic, flags: FLAG_P2_CZTEST },
  Instruction { name: "drvl", binary: p2(0b110_1101) | 0b1011000, ops: P2DstConstOk, opc: IrOp::DrvL, flags: FLAG_WCZ },
  Instruction { name: "drvh", binary: p2(0b110_1101) | 0b1011001, ops: P2DstConstOk, opc: IrOp::DrvH, flags: FLAG_WCZ },
  Instruction { name: "drvnot", binary: p2(0b110_1101) | 0b1011010, ops: P2DstConstOk, opc: IrOp::Generic, flags: FLAG_WCZ },
  Instruction { name: "drvrnd", binary: p2(0b110_1101) | 0b1011011, ops: P2DstConstOk, opc: IrOp::Generic, flags: FLAG_WCZ },
  Instruction { name: "dirl", binary: p2(0b110_1101) | 0b1000000, ops: P2DstConstOk, opc: IrOp::Generic, flags: FLAG_WCZ },
  Instruction { name: "dirh", binary: p2(0b110_1101) | 0b1000001, ops: P2DstConstOk, opc: IrOp::Generic, flags: FLAG_WCZ },
  // system
  Instruction { name: "hubset", binary: p2(0b110_0110) | 0b00000, ops: P2DstConstOk, opc: IrOp::HubSet, flags: 0 },
  Instruction { name: "cogid", binary: p2(0b110_0110) | 0b00001, ops: P2DstConstOk, opc: IrOp::CogId, flags: FLAG_WC },
  Instruction { name: "cogstop", binary: p2(0b110_0110) | 0b00011, ops: P2DstConstOk, opc: IrOp::CogStop, flags: 0 },
  Instruction { name: "coginit", binary: p2(0b110_0101), ops: P2TwoOperands, opc: IrOp::Generic, flags: FLAG_WC },
  Instruction { name: "waitx", binary: p2(0b110_0110) | 0b11111, ops: P2DstConstOk, opc: IrOp::WaitX, flags: FLAG_P2_STD },
  Instruction { name: "getct", binary: p2(0b110_0110) | 0b11010, ops: DstOnly, opc: IrOp::GetCt, flags: FLAG_WC },
  Instruction { name: "getrnd", binary: p2(0b110_0110) | 0b11011, ops: DstOnly, opc: IrOp::GetRnd, flags: FLAG_P2_STD },
  Instruction { name: "getqx", binary: p2(0b110_0110) | 0b11000, ops: DstOnly, opc: IrOp::GetQx, flags: FLAG_P2_STD },
  Instruction { name: "getqy", binary: p2(0b110_0110) | 0b11001, ops: DstOnly, opc: IrOp::GetQy, flags: FLAG_P2_STD },
  Instruction { name: "pop", binary: p2(0b110_0110) | 0b10101, ops: DstOnly, opc: IrOp::Pop, flags: FLAG_P2_STD },
  Instruction { name: "push", binary: p2(0b110_0110) | 0b10100, ops: P2DstConstOk, opc: IrOp::Push, flags: 0 },
  Instruction { name: "brk", binary: p2(0b110_0110) | 0b110110, ops: P2DstConstOk, opc: IrOp::Break, flags: 0 },
  Instruction { name: "setq", binary: p2(0b110_0110) | 0b101000, ops: P2DstConstOk, opc: IrOp::SetQ, flags: 0 },
  Instruction { name: "setq2", binary: p2(0b110_0110) | 0b101001, ops: P2DstConstOk, opc: IrOp::SetQ2, flags: 0 },
  Instruction { name: "waitcnt", binary: p2(0b110_0110) | 0b100011, ops: TwoOperands, opc: IrOp::WaitCnt, flags: FLAG_P2_STD },
  Instruction { name: "addct1", binary: p2(0b101_1010), ops: TwoOperands, opc: IrOp::AddCt1, flags: 0 },
  Instruction { name: "locknew", binary: p2(0b110_0110) | 0b000100, ops: DstOnly, opc: IrOp::LockNew, flags: FLAG_WC },
  Instruction { name: "lockret", binary: p2(0b110_0110) | 0b000101, ops: P2DstConstOk, opc: IrOp::LockRet, flags: 0 },
  Instruction { name: "locktry", binary: p2(0b110_0110) | 0b000110, ops: P2DstConstOk, opc: IrOp::LockTry, flags: FLAG_WC },
  Instruction { name: "lockrel", binary: p2(0b110_0110) | 0b000111, ops: P2DstConstOk, opc: IrOp::LockRel, flags: FLAG_WC },
  // prefixes and modcz
  Instruction { name: "augs", binary: p2(0b111_1000), ops: P2Aug, opc: IrOp::Generic, flags: 0 },
  Instruction { name: "augd", binary: p2(0b111_1100), ops: P2Aug, opc: IrOp::Generic, flags: 0 },
  Instruction { name: "modcz", binary: p2(0b110_1001) | (0b1101111 << 0), ops: P2Modcz, opc: IrOp::Generic, flags: FLAG_P2_STD },
  Instruction { name: "modc", binary: p2(0b110_1001) | (0b1101111 << 0), ops: P2Modcz, opc: IrOp::Generic, flags: FLAG_CSET },
  Instruction { name: "modz", binary: p2(0b110_1001) | (0b1101111 << 0), ops: P2Modcz, opc: IrOp::Generic, flags: FLAG_ZSET },
];

/// The P1 instruction table.
pub static INSTR_P1: &[Instruction] = &[
  Instruction { name: "nop", binary: 0, ops: NoOperands, opc: IrOp::Nop, flags: 0 },
  Instruction { name: "abs", binary: p1(0b101010) | P1_WR, ops: TwoOperands, opc: IrOp::Abs, flags: FLAG_P1_STD },
  Instruction { name: "absneg", binary: p1(0b101011) | P1_WR, ops: TwoOperands, opc: IrOp::Generic, flags: FLAG_P1_STD },
  Instruction { name: "add", binary: p1(0b100000) | P1_WR, ops: TwoOperands, opc: IrOp::Add, flags: FLAG_P1_STD },
  Instruction { name: "addabs", binary: p1(0b100010) | P1_WR, ops: TwoOperands, opc: IrOp::Generic, flags: FLAG_P1_STD },
  Instruction { name: "adds", binary: p1(0b110100) | P1_WR, ops: TwoOperands, opc: IrOp::Add, flags: FLAG_P1_STD },
  Instruction { name: "addsx", binary: p1(0b110110) | P1_WR, ops: TwoOperands, opc: IrOp::AddSx, flags: FLAG_P1_STD },
  Instruction { name: "addx", binary: p1(0b110010) | P1_WR, ops: TwoOperands, opc: IrOp::AddX, flags: FLAG_P1_STD },
  Instruction { name: "and", binary: p1(0b011000) | P1_WR, ops: TwoOperands, opc: IrOp::And, flags: FLAG_P1_STD },
  Instruction { name: "andn", binary: p1(0b011001) | P1_WR, ops: TwoOperands, opc: IrOp::AndN, flags: FLAG_P1_STD },
  Instruction { name: "call", binary: p1(0b010111) | P1_WR | IMMEDIATE_INSTR, ops: CallOperand, opc: IrOp::Call, flags: FLAG_P1_STD },
  Instruction { name: "cmp", binary: p1(0b100001), ops: TwoOperands, opc: IrOp::Cmp, flags: FLAG_P1_STD | FLAG_WARN_NOTUSED },
  Instruction { name: "cmps", binary: p1(0b110000), ops: TwoOperands, opc: IrOp::CmpS, flags: FLAG_P1_STD | FLAG_WARN_NOTUSED },
  Instruction { name: "cmpsub", binary: p1(0b111000), ops: TwoOperands, opc: IrOp::Generic, flags: FLAG_P1_STD },
  Instruction { name: "djnz", binary: p1(0b111001) | P1_WR, ops: JmpRetOperands, opc: IrOp::Djnz, flags: FLAG_P1_STD },
  Instruction { name: "jmp", binary: p1(0b010111), ops: JmpOperand, opc: IrOp::Jump, flags: FLAG_P1_STD },
  Instruction { name: "jmpret", binary: p1(0b010111) | P1_WR, ops: JmpRetOperands, opc: IrOp::JmpRet, flags: FLAG_P1_STD },
  Instruction { name: "mov", binary: p1(0b101000) | P1_WR, ops: TwoOperands, opc: IrOp::Mov, flags: FLAG_P1_STD },
  Instruction { name: "movd", binary: p1(0b010101) | P1_WR, ops: TwoOperands, opc: IrOp::MovD, flags: FLAG_P1_STD },
  Instruction { name: "movs", binary: p1(0b010100) | P1_WR, ops: TwoOperands, opc: IrOp::MovS, flags: FLAG_P1_STD },
  Instruction { name: "muxc", binary: p1(0b011100) | P1_WR, ops: TwoOperands, opc: IrOp::MuxC, flags: FLAG_P1_STD },
  Instruction { name: "muxnc", binary: p1(0b011101) | P1_WR, ops: TwoOperands, opc: IrOp::MuxNc, flags: FLAG_P1_STD },
  Instruction { name: "muxz", binary: p1(0b011110) | P1_WR, ops: TwoOperands, opc: IrOp::MuxZ, flags: FLAG_P1_STD },
  Instruction { name: "muxnz", binary: p1(0b011111) | P1_WR, ops: TwoOperands, opc: IrOp::MuxNz, flags: FLAG_P1_STD },
  Instruction { name: "neg", binary: p1(0b101001) | P1_WR, ops: TwoOperands, opc: IrOp::Neg, flags: FLAG_P1_STD },
  Instruction { name: "or", binary: p1(0b011010) | P1_WR, ops: TwoOperands, opc: IrOp::Or, flags: FLAG_P1_STD },
  Instruction { name: "rdbyte", binary: p1(0b000000) | P1_WR, ops: TwoOperands, opc: IrOp::RdByte, flags: FLAG_P1_STD },
  Instruction { name: "rdword", binary: p1(0b000001) | P1_WR, ops: TwoOperands, opc: IrOp::RdWord, flags: FLAG_P1_STD },
  Instruction { name: "rdlong", binary: p1(0b000010) | P1_WR, ops: TwoOperands, opc: IrOp::RdLong, flags: FLAG_P1_STD },
  Instruction { name: "ret", binary: p1(0b010111) | IMMEDIATE_INSTR, ops: NoOperands, opc: IrOp::Ret, flags: FLAG_P1_STD },
  Instruction { name: "rev", binary: p1(0b001111) | P1_WR, ops: TwoOperands, opc: IrOp::RevP1, flags: FLAG_P1_STD },
  Instruction { name: "rcl", binary: p1(0b001101) | P1_WR, ops: TwoOperands, opc: IrOp::Rcl, flags: FLAG_P1_STD },
  Instruction { name: "rcr", binary: p1(0b001100) | P1_WR, ops: TwoOperands, opc: IrOp::Rcr, flags: FLAG_P1_STD },
  Instruction { name: "rol", binary: p1(0b001001) | P1_WR, ops: TwoOperands, opc: IrOp::Rol, flags: FLAG_P1_STD },
  Instruction { name: "ror", binary: p1(0b001000) | P1_WR, ops: TwoOperands, opc: IrOp::Ror, flags: FLAG_P1_STD },
  Instruction { name: "sar", binary: p1(0b001110) | P1_WR, ops: TwoOperands, opc: IrOp::Sar, flags: FLAG_P1_STD },
  Instruction { name: "shl", binary: p1(0b001011) | P1_WR, ops: TwoOperands, opc: IrOp::Shl, flags: FLAG_P1_STD },
  Instruction { name: "shr", binary: p1(0b001010) | P1_WR, ops: TwoOperands, opc: IrOp::Shr, flags: FLAG_P1_STD },
  Instruction { name: "sub", binary: p1(0b100001) | P1_WR, ops: TwoOperands, opc: IrOp::Sub, flags: FLAG_P1_STD },
  Instruction { name: "subs", binary: p1(0b110101) | P1_WR, ops: TwoOperands, opc: IrOp::Sub, flags: FLAG_P1_STD },
  Instruction { name: "test", binary: p1(0b011000), ops: TwoOperands, opc: IrOp::Test, flags: FLAG_P1_STD },
  Instruction { name: "testn", binary: p1(0b011001), ops: TwoOperands, opc: IrOp::TestN, flags: FLAG_P1_STD },
  Instruction { name: "tjnz", binary: p1(0b111010), ops: JmpRetOperands, opc: IrOp::GenericBrCond, flags: FLAG_P1_STD },
  Instruction { name: "tjz", binary: p1(0b111011), ops: JmpRetOperands, opc: IrOp::GenericBrCond, flags: FLAG_P1_STD },
  Instruction { name: "waitcnt", binary: p1(0b111110) | P1_WR, ops: TwoOperands, opc: IrOp::WaitCnt, flags: FLAG_P1_STD },
  Instruction { name: "wrbyte", binary: p1(0b000000), ops: TwoOperands, opc: IrOp::WrByte, flags: FLAG_P1_STD },
  Instruction { name: "wrword", binary: p1(0b000001), ops: TwoOperands, opc: IrOp::WrWord, flags: FLAG_P1_STD },
  Instruction { name: "wrlong", binary: p1(0b000010), ops: TwoOperands, opc: IrOp::WrLong, flags: FLAG_P1_STD },
  Instruction { name: "xor", binary: p1(0b011011) | P1_WR, ops: TwoOperands, opc: IrOp::Xor, flags: FLAG_P1_STD },
];

/// An instruction modifier: either a condition code (replacing the
/// condition field) or an effect flag (OR-ing into the flag nibble).
/// A modifier whose mask has low bits set is an AND-mask (conditions);
/// otherwise it ORs into the opcode.
pub struct InstrModifier {
  pub name: &'static str,
  pub modifier: u32,
  /// Internal meaning; zero for condition codes.
  pub flags: u32,
}

const fn p2_cond(hw: u32) -> u32 { (hw << 28) | 0x0fff_ffff }
const fn p1_cond(hw: u32) -> u32 { (hw << 18) | !(0xf << 18) }

pub static MODIFIERS_P2: &[InstrModifier] = &[
  InstrModifier { name: "_ret_", modifier: p2_cond(0b0000), flags: 0 },
  InstrModifier { name: "if_nc_and_nz", modifier: p2_cond(0b0001), flags: 0 },
  InstrModifier { name: "if_nc_and_z", modifier: p2_cond(0b0010), flags: 0 },
  InstrModifier { name: "if_nc", modifier: p2_cond(0b0011), flags: 0 },
  InstrModifier { name: "if_c_and_nz", modifier: p2_cond(0b0100), flags: 0 },
  InstrModifier { name: "if_nz", modifier: p2_cond(0b0101), flags: 0 },
  InstrModifier { name: "if_c_ne_z", modifier: p2_cond(0b0110), flags: 0 },
  InstrModifier { name: "if_nc_or_nz", modifier: p2_cond(0b0111), flags: 0 },
  InstrModifier { name: "if_c_and_z", modifier: p2_cond(0b1000), flags: 0 },
  InstrModifier { name: "if_c_eq_z", modifier: p2_cond(0b1001), flags: 0 },
  InstrModifier { name: "if_z", modifier: p2_cond(0b1010), flags: 0 },
  InstrModifier { name: "if_nc_or_z", modifier: p2_cond(0b1011), flags: 0 },
  InstrModifier { name: "if_c", modifier: p2_cond(0b1100), flags: 0 },
  InstrModifier { name: "if_c_or_nz", modifier: p2_cond(0b1101), flags: 0 },
  InstrModifier { name: "if_c_or_z", modifier: p2_cond(0b1110), flags: 0 },
  InstrModifier { name: "if_always", modifier: p2_cond(0b1111), flags: 0 },
  InstrModifier { name: "wz", modifier: 1 << 19, flags: FLAG_WZ },
  InstrModifier { name: "wc", modifier: 1 << 20, flags: FLAG_WC },
  InstrModifier { name: "wcz", modifier: 3 << 19, flags: FLAG_WCZ },
  InstrModifier { name: "andc", modifier: 1 << 20, flags: FLAG_ANDC },
  InstrModifier { name: "andz", modifier: 1 << 19, flags: FLAG_ANDZ },
  InstrModifier { name: "orc", modifier: 1 << 20, flags: FLAG_ORC },
  InstrModifier { name: "orz", modifier: 1 << 19, flags: FLAG_ORZ },
  InstrModifier { name: "xorc", modifier: 1 << 20, flags: FLAG_XORC },
  InstrModifier { name: "xorz", modifier: 1 << 19, flags: FLAG_XORZ },
];

pub static MODIFIERS_P1: &[InstrModifier] = &[
  InstrModifier { name: "if_never", modifier: p1_cond(0b0000), flags: 0 },
  InstrModifier { name: "if_nc_and_nz", modifier: p1_cond(0b0001), flags: 0 },
  InstrModifier { name: "if_nc_and_z", modifier: p1_cond(0b0010), flags: 0 },
  InstrModifier { name: "if_nc", modifier: p1_cond(0b0011), flags: 0 },
  InstrModifier { name: "if_c_and_nz", modifier: p1_cond(0b0100), flags: 0 },
  InstrModifier { name: "if_nz", modifier: p1_cond(0b0101), flags: 0 },
  InstrModifier { name: "if_c_ne_z", modifier: p1_cond(0b0110), flags: 0 },
  InstrModifier { name: "if_nc_or_nz", modifier: p1_cond(0b0111), flags: 0 },
  InstrModifier { name: "if_c_and_z", modifier: p1_cond(0b1000), flags: 0 },
  InstrModifier { name: "if_c_eq_z", modifier: p1_cond(0b1001), flags: 0 },
  InstrModifier { name: "if_z", modifier: p1_cond(0b1010), flags: 0 },
  InstrModifier { name: "if_nc_or_z", modifier: p1_cond(0b1011), flags: 0 },
  InstrModifier { name: "if_c", modifier: p1_cond(0b1100), flags: 0 },
  InstrModifier { name: "if_c_or_nz", modifier: p1_cond(0b1101), flags: 0 },
  InstrModifier { name: "if_c_or_z", modifier: p1_cond(0b1110), flags: 0 },
  InstrModifier { name: "if_always", modifier: p1_cond(0b1111), flags: 0 },
  InstrModifier { name: "wz", modifier: 1 << 25, flags: FLAG_WZ },
  InstrModifier { name: "wc", modifier: 1 << 24, flags: FLAG_WC },
  InstrModifier { name: "wr", modifier: 1 << 23, flags: FLAG_WR },
  InstrModifier { name: "nr", modifier: !(1 << 23), flags: FLAG_NR },
];

/// The active instruction table for a target.
#[must_use] pub fn instr_table(target: Target) -> &'static [Instruction] {
  if target.is_p2() { INSTR_P2 } else { INSTR_P1 }
}

#[must_use] pub fn modifier_table(target: Target) -> &'static [InstrModifier] {
  if target.is_p2() { MODIFIERS_P2 } else { MODIFIERS_P1 }
}

/// Look up a mnemonic, case-insensitively.
#[must_use] pub fn find_instruction(target: Target, name: &str) -> Option<u32> {
  instr_table(target).iter()
    .position(|i| i.name.eq_ignore_ascii_case(name))
    .map(|i| i as u32)
}

#[must_use] pub fn find_modifier(target: Target, name: &str) -> Option<u32> {
  modifier_table(target).iter()
    .position(|m| m.name.eq_ignore_ascii_case(name))
    .map(|i| i as u32)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn lookups() {
    let add = find_instruction(Target::P2RevB, "ADD").unwrap();
    assert_eq!(INSTR_P2[add as usize].binary, 0b000_1000 << 21);
    assert!(find_instruction(Target::P2RevB, "frobnicate").is_none());
    assert!(find_instruction(Target::P1, "jmpret").is_some());
    assert!(find_instruction(Target::P1, "augs").is_none(), "AUG is P2 only");
  }

  #[test]
  fn modifier_shapes() {
    let t = MODIFIERS_P2;
    let wc = &t[find_modifier(Target::P2RevB, "wc").unwrap() as usize];
    assert_eq!(wc.modifier, 1 << 20);
    assert_eq!(wc.flags, FLAG_WC);
    let ret = &t[find_modifier(Target::P2RevB, "_ret_").unwrap() as usize];
    assert_eq!(ret.flags, 0, "condition codes carry no effect flags");
    // condition masks have low bits set (AND-mask); effects do not
    assert_ne!(ret.modifier & 0x0003_ffff, 0);
    assert_eq!(wc.modifier & 0x0003_ffff, 0);
  }

  #[test]
  fn indirect_variants_exist() {
    // the encoder falls back to these for out-of-range branches
    assert!(find_instruction(Target::P2RevB, "jmp.ind").is_some());
    assert!(find_instruction(Target::P2RevB, "calld.loc").is_some());
  }
}
