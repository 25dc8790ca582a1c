//! BRK debugger bytecode. Each `DEBUG(...)` directive compiles into a
//! small stack-oriented byte program; the programs are collected per
//! breakpoint number and appended (behind an offset table) to the
//! debugger stub blob that gets prepended to the final image.

use log::debug;
use crate::Compiler;
use crate::diag::DiagKind;
use crate::dat::DatOut;
use crate::types::{AstId, SrcSpan};
use crate::types::ast::{AstKind, Payload};

// simple codes
const DBC_DONE: u8 = 0;
const DBC_ASMMODE: u8 = 1;
const DBC_IF: u8 = 2;
const DBC_IFNOT: u8 = 3;
const DBC_COGN: u8 = 4;
const DBC_CHAR: u8 = 5;
const DBC_STRING: u8 = 6;
const DBC_DELAY: u8 = 7;
// flags
const DBC_FLAG_NOCOMMA: u8 = 0x01;
const DBC_FLAG_NOEXPR: u8 = 0x02;
const DBC_FLAG_ARRAY: u8 = 0x10;
const DBC_FLAG_SIGNED: u8 = 0x20;
// numeric sizes
const DBC_SIZE_BYTE: u8 = 0x04;
const DBC_SIZE_WORD: u8 = 0x08;
const DBC_SIZE_LONG: u8 = 0x0C;
// output types
const DBC_TYPE_STR: u8 = 0x20 | DBC_SIZE_BYTE;
const DBC_TYPE_FLP: u8 = 0x20; // overlaps the signed flag and the string type
const DBC_TYPE_DEC: u8 = 0x40;
const DBC_TYPE_HEX: u8 = 0x80;
const DBC_TYPE_BIN: u8 = 0xC0;

pub const MAX_BRK: usize = 256;

struct DebugFunc {
  name: &'static str,
  opcode: u8,
}

static DEBUG_FUNC_TABLE: &[DebugFunc] = &[
  DebugFunc { name: "if", opcode: DBC_IF },
  DebugFunc { name: "ifnot", opcode: DBC_IFNOT },
  DebugFunc { name: "dly", opcode: DBC_DELAY },

  DebugFunc { name: "zstr", opcode: DBC_TYPE_STR },
  DebugFunc { name: "lstr", opcode: DBC_TYPE_STR | DBC_FLAG_ARRAY },

  DebugFunc { name: "fdec", opcode: DBC_TYPE_FLP | DBC_SIZE_LONG },
  DebugFunc { name: "fdec_reg_array", opcode: DBC_TYPE_FLP | DBC_FLAG_ARRAY },
  DebugFunc { name: "fdec_array", opcode: DBC_TYPE_FLP | DBC_SIZE_LONG | DBC_FLAG_ARRAY },

  DebugFunc { name: "udec", opcode: DBC_TYPE_DEC },
  DebugFunc { name: "udec_byte", opcode: DBC_TYPE_DEC | DBC_SIZE_BYTE },
  DebugFunc { name: "udec_word", opcode: DBC_TYPE_DEC | DBC_SIZE_WORD },
  DebugFunc { name: "udec_long", opcode: DBC_TYPE_DEC | DBC_SIZE_LONG },
  DebugFunc { name: "udec_reg_array", opcode: DBC_TYPE_DEC | DBC_FLAG_ARRAY },
  DebugFunc { name: "udec_byte_array", opcode: DBC_TYPE_DEC | DBC_SIZE_BYTE | DBC_FLAG_ARRAY },
  DebugFunc { name: "udec_word_array", opcode: DBC_TYPE_DEC | DBC_SIZE_WORD | DBC_FLAG_ARRAY },
  DebugFunc { name: "udec_long_array", opcode: DBC_TYPE_DEC | DBC_SIZE_LONG | DBC_FLAG_ARRAY },

  DebugFunc { name: "sdec", opcode: DBC_FLAG_SIGNED | DBC_TYPE_DEC },
  DebugFunc { name: "sdec_byte", opcode: DBC_FLAG_SIGNED | DBC_TYPE_DEC | DBC_SIZE_BYTE },
  DebugFunc { name: "sdec_word", opcode: DBC_FLAG_SIGNED | DBC_TYPE_DEC | DBC_SIZE_WORD },
  DebugFunc { name: "sdec_long", opcode: DBC_FLAG_SIGNED | DBC_TYPE_DEC | DBC_SIZE_LONG },
  DebugFunc { name: "sdec_reg_array", opcode: DBC_FLAG_SIGNED | DBC_TYPE_DEC | DBC_FLAG_ARRAY },
  DebugFunc { name: "sdec_byte_array", opcode: DBC_FLAG_SIGNED | DBC_TYPE_DEC | DBC_SIZE_BYTE | DBC_FLAG_ARRAY },
  DebugFunc { name: "sdec_word_array", opcode: DBC_FLAG_SIGNED | DBC_TYPE_DEC | DBC_SIZE_WORD | DBC_FLAG_ARRAY },
  DebugFunc { name: "sdec_long_array", opcode: DBC_FLAG_SIGNED | DBC_TYPE_DEC | DBC_SIZE_LONG | DBC_FLAG_ARRAY },

  DebugFunc { name: "uhex", opcode: DBC_TYPE_HEX },
  DebugFunc { name: "uhex_byte", opcode: DBC_TYPE_HEX | DBC_SIZE_BYTE },
  DebugFunc { name: "uhex_word", opcode: DBC_TYPE_HEX | DBC_SIZE_WORD },
  DebugFunc { name: "uhex_long", opcode: DBC_TYPE_HEX | DBC_SIZE_LONG },
  DebugFunc { name: "uhex_reg_array", opcode: DBC_TYPE_HEX | DBC_FLAG_ARRAY },
  DebugFunc { name: "uhex_byte_array", opcode: DBC_TYPE_HEX | DBC_SIZE_BYTE | DBC_FLAG_ARRAY },
  DebugFunc { name: "uhex_word_array", opcode: DBC_TYPE_HEX | DBC_SIZE_WORD | DBC_FLAG_ARRAY },
  DebugFunc { name: "uhex_long_array", opcode: DBC_TYPE_HEX | DBC_SIZE_LONG | DBC_FLAG_ARRAY },

  DebugFunc { name: "shex", opcode: DBC_FLAG_SIGNED | DBC_TYPE_HEX },
  DebugFunc { name: "shex_byte", opcode: DBC_FLAG_SIGNED | DBC_TYPE_HEX | DBC_SIZE_BYTE },
  DebugFunc { name: "shex_word", opcode: DBC_FLAG_SIGNED | DBC_TYPE_HEX | DBC_SIZE_WORD },
  DebugFunc { name: "shex_long", opcode: DBC_FLAG_SIGNED | DBC_TYPE_HEX | DBC_SIZE_LONG },
  DebugFunc { name: "shex_reg_array", opcode: DBC_FLAG_SIGNED | DBC_TYPE_HEX | DBC_FLAG_ARRAY },
  DebugFunc { name: "shex_byte_array", opcode: DBC_FLAG_SIGNED | DBC_TYPE_HEX | DBC_SIZE_BYTE | DBC_FLAG_ARRAY },
  DebugFunc { name: "shex_word_array", opcode: DBC_FLAG_SIGNED | DBC_TYPE_HEX | DBC_SIZE_WORD | DBC_FLAG_ARRAY },
  DebugFunc { name: "shex_long_array", opcode: DBC_FLAG_SIGNED | DBC_TYPE_HEX | DBC_SIZE_LONG | DBC_FLAG_ARRAY },

  DebugFunc { name: "ubin", opcode: DBC_TYPE_BIN },
  DebugFunc { name: "ubin_byte", opcode: DBC_TYPE_BIN | DBC_SIZE_BYTE },
  DebugFunc { name: "ubin_word", opcode: DBC_TYPE_BIN | DBC_SIZE_WORD },
  DebugFunc { name: "ubin_long", opcode: DBC_TYPE_BIN | DBC_SIZE_LONG },
  DebugFunc { name: "ubin_reg_array", opcode: DBC_TYPE_BIN | DBC_FLAG_ARRAY },
  DebugFunc { name: "ubin_byte_array", opcode: DBC_TYPE_BIN | DBC_SIZE_BYTE | DBC_FLAG_ARRAY },
  DebugFunc { name: "ubin_word_array", opcode: DBC_TYPE_BIN | DBC_SIZE_WORD | DBC_FLAG_ARRAY },
  DebugFunc { name: "ubin_long_array", opcode: DBC_TYPE_BIN | DBC_SIZE_LONG | DBC_FLAG_ARRAY },

  DebugFunc { name: "sbin", opcode: DBC_FLAG_SIGNED | DBC_TYPE_BIN },
  DebugFunc { name: "sbin_byte", opcode: DBC_FLAG_SIGNED | DBC_TYPE_BIN | DBC_SIZE_BYTE },
  DebugFunc { name: "sbin_word", opcode: DBC_FLAG_SIGNED | DBC_TYPE_BIN | DBC_SIZE_WORD },
  DebugFunc { name: "sbin_long", opcode: DBC_FLAG_SIGNED | DBC_TYPE_BIN | DBC_SIZE_LONG },
  DebugFunc { name: "sbin_reg_array", opcode: DBC_FLAG_SIGNED | DBC_TYPE_BIN | DBC_FLAG_ARRAY },
  DebugFunc { name: "sbin_byte_array", opcode: DBC_FLAG_SIGNED | DBC_TYPE_BIN | DBC_SIZE_BYTE | DBC_FLAG_ARRAY },
  DebugFunc { name: "sbin_word_array", opcode: DBC_FLAG_SIGNED | DBC_TYPE_BIN | DBC_SIZE_WORD | DBC_FLAG_ARRAY },
  DebugFunc { name: "sbin_long_array", opcode: DBC_FLAG_SIGNED | DBC_TYPE_BIN | DBC_SIZE_LONG | DBC_FLAG_ARRAY },

  DebugFunc { name: "uchar#", opcode: DBC_CHAR },
];

/// What a backend reports about one debug operand.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DebugEval {
  IsConst(u32),
  IsReg(u32),
  /// Multi-register result: the first register plus 1..3 more.
  IsReg2(u32),
  IsReg3(u32),
  IsReg4(u32),
}

/// Breakpoint state for a session. Code zero is reserved.
pub struct BrkState {
  pub assigned: usize,
  exprs: Vec<Vec<u8>>,
}

impl BrkState {
  #[must_use] pub fn new() -> Self {
    BrkState { assigned: 1, exprs: vec![Vec::new()] }
  }

  #[must_use] pub fn program(&self, code: usize) -> Option<&[u8]> {
    self.exprs.get(code).map(Vec::as_slice)
  }
}

impl Default for BrkState {
  fn default() -> Self { Self::new() }
}

/// Literal small integers pack into a 14-bit short form; larger ones use
/// a marker byte plus four LE bytes.
fn emit_constant(f: &mut Vec<u8>, val: u32) {
  if val < 0x4000 {
    f.push((val >> 8) as u8);
    f.push((val & 255) as u8);
  } else {
    f.push(0b0100_0000);
    f.extend_from_slice(&val.to_le_bytes());
  }
}

fn emit_regref(c: &mut Compiler, f: &mut Vec<u8>, reg: u32) {
  if reg >= 1024 {
    c.diag.error(SrcSpan::none(), DiagKind::Resource, "Debug regref out of range");
    return;
  }
  f.push(0x80 | (reg >> 8) as u8);
  f.push((reg & 255) as u8);
}

impl Compiler {
  /// The PASM-level operand evaluator: `#expr` is a constant, anything
  /// else names a register.
  pub fn pasm_debug_eval(&mut self, arg: AstId, _arg_num: i32) -> DebugEval {
    if self.ast.kind(arg) == AstKind::ImmHolder {
      let inner = self.ast.left(arg).unwrap_or(arg);
      return DebugEval::IsConst(self.eval_pasm_expr(inner) as u32);
    }
    DebugEval::IsReg(self.eval_pasm_expr(arg) as u32)
  }

  /// Compile a `DEBUG(...)` directive into a breakpoint program.
  /// Returns the assigned breakpoint code, 0 for a bare `DEBUG`
  /// (interactive debugger), or -1 when debugging is disabled.
  pub fn asm_debug_codegen(&mut self, ast: AstId,
                           eval: &mut dyn FnMut(&mut Compiler, AstId, i32) -> DebugEval)
                           -> i32 {
    let top = self.top_level_module();
    if self.const_or_default(top, "DEBUG_DISABLE", 0) != 0 {
      return -1;
    }
    if self.ast.kind(ast) != AstKind::BrkDebug {
      let span = self.ast.span(ast);
      self.diag.error(span, DiagKind::Internal, "expected a debug breakpoint node");
      return -1;
    }
    let Some(exprlist) = self.ast.left(ast) else {
      // parenless DEBUG triggers the interactive debugger
      return 0;
    };

    let brk_code = self.brk.assigned;
    self.brk.assigned += 1;
    if brk_code >= MAX_BRK {
      let span = self.ast.span(ast);
      self.diag.error(span, DiagKind::Resource, "MAX_BRK exceeded");
      return -1;
    }

    let mut f: Vec<u8> = Vec::with_capacity(64);
    // the parser inserts a LABEL cell when a COGn prefix is wanted
    let mut exprbase = Some(exprlist);
    let mut do_cogn = false;
    if self.ast.left(exprlist).is_some_and(|l| self.ast.kind(l) == AstKind::Label) {
      exprbase = self.ast.right(exprlist);
      do_cogn = true;
    }
    f.push(DBC_ASMMODE);
    if do_cogn { f.push(DBC_COGN) }

    debug!("building DEBUG program for BRK #{brk_code}");
    let mut need_comma = false;
    let mut reg_num: i32 = 0;
    let items: Vec<AstId> = self.ast.list_iter(exprbase).collect();
    for mut item in items {
      if self.ast.kind(item) == AstKind::ExprList && self.ast.right(item).is_none() {
        if let Some(single) = self.ast.left(item) { item = single }
      }
      match self.ast.kind(item) {
        AstKind::String => {
          f.push(DBC_STRING);
          if let Payload::Str(s) = self.ast.get(item).d {
            f.extend_from_slice(s.as_str().as_bytes());
          }
          f.push(0);
          need_comma = false;
        }
        AstKind::Integer => {
          f.push(DBC_CHAR);
          if let Payload::Int(v) = self.ast.get(item).d {
            emit_constant(&mut f, v as u32);
          }
        }
        AstKind::FuncCall => {
          self.debug_funcall(item, &mut f, eval, &mut need_comma, &mut reg_num);
        }
        other => {
          let span = self.ast.span(item);
          self.diag.error(span, DiagKind::Internal,
                          format!("unhandled node kind {other:?} in DEBUG"));
        }
      }
    }
    f.push(DBC_DONE);
    self.brk.exprs.push(f);
    brk_code as i32
  }

  fn debug_funcall(&mut self, item: AstId, f: &mut Vec<u8>,
                   eval: &mut dyn FnMut(&mut Compiler, AstId, i32) -> DebugEval,
                   need_comma: &mut bool, reg_num: &mut i32) {
    let span = self.ast.span(item);
    let Some(name_node) = self.ast.left(item) else { return };
    let Some(name) = self.ast.user_name(name_node) else {
      self.diag.error(span, DiagKind::Internal, "expected identifier in DEBUG call");
      return;
    };
    let name = name.as_str();
    let mut name_len = name.len();
    let no_expr = name.ends_with('_');
    if no_expr { name_len -= 1 }
    let stem = &name[..name_len];
    let Some(func) = DEBUG_FUNC_TABLE.iter()
      .find(|df| df.name.eq_ignore_ascii_case(stem))
    else {
      self.diag.error(span, DiagKind::Symbol,
                      format!("Unknown debug function {name}"));
      return;
    };
    let mut opcode = func.opcode;
    let simple = opcode & 0xE0 == 0;
    if simple && no_expr {
      self.diag.error(span, DiagKind::Type,
                      "Cannot use underscore on simple functions");
    }
    if !simple && !*need_comma { opcode |= DBC_FLAG_NOCOMMA }
    if !simple && no_expr { opcode |= DBC_FLAG_NOEXPR }

    let expected_args = if func.opcode & DBC_FLAG_ARRAY != 0 { 2 } else { 1 };
    let mut got_args = 0;
    let args: Vec<AstId> = self.ast.list_iter(self.ast.right(item)).collect();
    for arg in args {
      if got_args == 0 {
        f.push(opcode);
        debug!("emitting DEBUG opcode {opcode:02X}");
      }
      got_args += 1;
      if got_args == 1 && !simple && !no_expr {
        // the expression label, so the output can echo `x = ...`
        let mut expr = arg;
        if self.ast.kind(expr) == AstKind::ImmHolder {
          f.push(b'#');
          expr = self.ast.left(expr).unwrap_or(expr);
        }
        match self.ast.user_name(expr) {
          Some(s) => f.extend_from_slice(s.as_str().as_bytes()),
          None => f.extend_from_slice(b"(expr)"),
        }
        f.push(0);
      }
      let kind = eval(self, arg, *reg_num);
      match kind {
        DebugEval::IsConst(v) => emit_constant(f, v),
        DebugEval::IsReg(r) => {
          emit_regref(self, f, r);
          *reg_num += 1;
        }
        DebugEval::IsReg2(r) | DebugEval::IsReg3(r) | DebugEval::IsReg4(r) => {
          let extra = match kind {
            DebugEval::IsReg2(_) => 1,
            DebugEval::IsReg3(_) => 2,
            _ => 3,
          };
          emit_regref(self, f, r);
          *reg_num += 1;
          let mut addr = r + 1;
          for _ in 0..extra {
            if got_args == expected_args {
              // re-emit the opcode for the sibling registers: comma
              // restored once, expression label suppressed
              opcode &= !DBC_FLAG_NOCOMMA;
              f.push(opcode | DBC_FLAG_NOEXPR);
              got_args = 1;
            } else {
              got_args += 1;
            }
            emit_regref(self, f, addr);
            addr += 1;
            *reg_num += 1;
          }
          *need_comma = true;
        }
      }
      if got_args == expected_args {
        got_args = 0;
        *need_comma = true;
        opcode &= !DBC_FLAG_NOCOMMA;
      }
    }
    if got_args != 0 {
      self.diag.error(span, DiagKind::Type,
        format!("{name} expects {expected_args} args, got {got_args}"));
    }
    *need_comma = true;
  }

  /// Assemble a `DEBUG` inside PASM: compile the program, then emit the
  /// P2 `BRK #code` instruction long.
  pub fn assemble_asm_debug(&mut self, out: &mut DatOut, ast: AstId) {
    if !self.options.target.is_p2() {
      let span = self.ast.span(ast);
      self.diag.error(span, DiagKind::Asm, "ASM DEBUG is only supported on P2");
    }
    let brk_code = self.asm_debug_codegen(ast, &mut |c, arg, n| c.pasm_debug_eval(arg, n));
    if brk_code >= 0 {
      out.put_long(0b1111_1101_0110_0100_0000_0000_0011_0110 + ((brk_code as u32) << 9));
    } else {
      out.put_long(0);
    }
  }

  /// Build the debugger prepend blob: the embedded stub DAT with the
  /// parameter longs patched in, followed by the per-breakpoint offset
  /// table and the concatenated programs.
  pub fn compile_brk_debugger(&mut self, appsize: usize) -> Vec<u8> {
    const STUB: &[u8] = include_bytes!("sys/p2_brkdebug.dat");
    if !self.options.target.is_p2() {
      self.diag.error(SrcSpan::none(), DiagKind::Resource,
                      "BRK debug is only available on P2");
    }
    let top = self.top_level_module();
    let clkfreq = self.const_or_default(top, "__clkfreq_con", 10_000_000) as u32;
    let clkmode = self.const_or_default(top, "__clkmode_con", 0) as u32;
    debug!("debugger gets CLKMODE {clkmode:08X} and CLKFREQ {clkfreq}");
    let millisecond = clkfreq / 1000 - 6;
    let default_baud = if self.options.default_baud != 0 {
      self.options.default_baud
    } else { 2_000_000 };

    let mut f = STUB.to_vec();
    let patch = |f: &mut Vec<u8>, off: usize, val: u32| {
      f[off..off + 4].copy_from_slice(&val.to_le_bytes());
    };
    let txpin = self.const_or_default(top, "DEBUG_PIN_TX",
      self.const_or_default(top, "DEBUG_PIN", 62)) as u32;
    let rxpin = self.const_or_default(top, "DEBUG_PIN_RX", 63) as u32;
    let timestamp = self.module(top).objsyms
      .contains(crate::symbol::intern("DEBUG_TIMESTAMP"));
    patch(&mut f, 0x0d4, clkfreq);
    patch(&mut f, 0x0d8, clkmode & !3); // RCFAST variant first
    patch(&mut f, 0x0dc, clkmode);
    patch(&mut f, 0x0e0,
          self.const_or_default(top, "DEBUG_DELAY", 0) as u32 * millisecond);
    patch(&mut f, 0x0e4, appsize as u32);
    patch(&mut f, 0x0e8,
          (self.const_or_default(top, "DEBUG_COGS", 0xff) as u32 & 255) | 0x2003_0000);
    patch(&mut f, 0x140, txpin);
    patch(&mut f, 0x144, rxpin | if timestamp { 1 << 31 } else { 0 });
    patch(&mut f, 0x148,
          self.const_or_default(top, "DEBUG_BAUD", i64::from(default_baud)) as u32);

    // offset table (16-bit entries) followed by the programs
    let mut tab: Vec<u8> = Vec::new();
    let mut pos = self.brk.assigned * 2;
    for i in 1..self.brk.assigned {
      tab.push((pos & 255) as u8);
      tab.push((pos >> 8) as u8);
      pos += self.brk.exprs[i].len();
    }
    for i in 1..self.brk.assigned {
      tab.extend_from_slice(&self.brk.exprs[i]);
    }
    let data_len = tab.len() + 2;
    if data_len + 0xFC000 > 0xFEC00 {
      self.diag.error(SrcSpan::none(), DiagKind::Resource, "BRK debug data too big");
    }
    f.push((data_len & 255) as u8);
    f.push((data_len >> 8) as u8);
    f.extend_from_slice(&tab);
    f
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
    c.top_module = Some(m);
    c.current_module = Some(m);
    c
  }

  /// Build DEBUG(udec(x)) style AST: BrkDebug(ExprList(FuncCall))
  fn mk_debug(c: &mut Compiler, func: &str, args: &[AstId]) -> AstId {
    let fname = c.ast.identifier(func);
    let mut arglist = None;
    for &a in args {
      let cell = c.ast.expr_item(a);
      arglist = Some(c.ast.list_append(arglist, cell));
    }
    let call = c.ast.new_node(AstKind::FuncCall, Some(fname), arglist);
    let cell = c.ast.expr_item(call);
    c.ast.new_node(AstKind::BrkDebug, Some(cell), None)
  }

  #[test]
  fn udec_program_shape() {
    // DEBUG(udec(x)) assembles to [ASMMODE, TYPE_DEC|SIZE_LONG|NOCOMMA,
    //                              'x',0, regref, DONE]
    let mut c = session();
    let x = c.ast.identifier("x");
    let dbg = mk_debug(&mut c, "udec_long", &[x]);
    let code = c.asm_debug_codegen(dbg, &mut |_, _, _| DebugEval::IsReg(5));
    assert_eq!(code, 1, "breakpoints assigned densely from 1");
    let prog = c.brk.program(1).unwrap();
    assert_eq!(prog[0], DBC_ASMMODE);
    assert_eq!(prog[1], DBC_TYPE_DEC | DBC_SIZE_LONG | DBC_FLAG_NOCOMMA);
    assert_eq!(&prog[2..4], b"x\0");
    assert_eq!(&prog[4..6], &[0x80, 5]);
    assert_eq!(*prog.last().unwrap(), DBC_DONE);
  }

  #[test]
  fn string_and_char_items() {
    let mut c = session();
    let s = c.ast.string("hi");
    let n = c.ast.integer(13);
    let cs = c.ast.expr_item(s);
    let cn = c.ast.expr_item(n);
    let list = c.ast.list_append(Some(cs), cn);
    let dbg = c.ast.new_node(AstKind::BrkDebug, Some(list), None);
    let code = c.asm_debug_codegen(dbg, &mut |_, _, _| DebugEval::IsConst(0));
    let prog = c.brk.program(code as usize).unwrap().to_vec();
    assert_eq!(&prog[..6], &[DBC_ASMMODE, DBC_STRING, b'h', b'i', 0, DBC_CHAR]);
    // 13 < 0x4000: 14-bit short constant form
    assert_eq!(&prog[6..8], &[0, 13]);
  }

  #[test]
  fn large_constant_form() {
    let mut f = Vec::new();
    emit_constant(&mut f, 0x12345);
    assert_eq!(f, vec![0x40, 0x45, 0x23, 0x01, 0x00]);
    f.clear();
    emit_constant(&mut f, 0x3fff);
    assert_eq!(f, vec![0x3f, 0xff]);
  }

  #[test]
  fn multireg_reemits_opcode() {
    let mut c = session();
    let x = c.ast.identifier("pair");
    let dbg = mk_debug(&mut c, "udec", &[x]);
    let code = c.asm_debug_codegen(dbg, &mut |_, _, _| DebugEval::IsReg2(8));
    let prog = c.brk.program(code as usize).unwrap().to_vec();
    // first reg, then the opcode again with NOEXPR and a comma, then reg+1
    let reemit = DBC_TYPE_DEC | DBC_FLAG_NOEXPR;
    let first_reg = [0x80u8, 8];
    let second_reg = [0x80u8, 9];
    let bytes = prog.as_slice();
    let pos1 = bytes.windows(2).position(|w| w == first_reg).unwrap();
    assert_eq!(bytes[pos1 + 2], reemit);
    assert_eq!(&bytes[pos1 + 3..pos1 + 5], &second_reg);
  }

  #[test]
  fn bare_debug_is_interactive() {
    let mut c = session();
    let dbg = c.ast.new_node(AstKind::BrkDebug, None, None);
    assert_eq!(c.asm_debug_codegen(dbg, &mut |_, _, _| DebugEval::IsConst(0)), 0);
  }

  #[test]
  fn debug_disable_suppresses() {
    let mut c = session();
    let m = c.top_module.unwrap();
    c.add_internal_symbol(m, "DEBUG_DISABLE", 1);
    let x = c.ast.identifier("x");
    let dbg = mk_debug(&mut c, "udec", &[x]);
    assert_eq!(c.asm_debug_codegen(dbg, &mut |_, _, _| DebugEval::IsReg(0)), -1);
  }

  #[test]
  fn prepend_blob_layout() {
    let mut c = session();
    let m = c.top_module.unwrap();
    c.add_internal_symbol(m, "__clkfreq_con", 160_000_000);
    c.add_internal_symbol(m, "__clkmode_con", 0x010c_3f04);
    let x = c.ast.identifier("x");
    let dbg = mk_debug(&mut c, "uhex", &[x]);
    let code = c.asm_debug_codegen(dbg, &mut |_, _, _| DebugEval::IsReg(3));
    assert_eq!(code, 1);
    let proglen = c.brk.program(1).unwrap().len();
    let blob = c.compile_brk_debugger(0x1234);
    let stub_len = include_bytes!("sys/p2_brkdebug.dat").len();
    // patched parameters land at the fixed offsets
    assert_eq!(&blob[0x0d4..0x0d8], &160_000_000u32.to_le_bytes());
    assert_eq!(&blob[0x0e4..0x0e8], &0x1234u32.to_le_bytes());
    assert_eq!(&blob[0x140..0x144], &62u32.to_le_bytes());
    assert_eq!(&blob[0x144..0x148], &63u32.to_le_bytes());
    // length word + offset table + program
    let data_len = u16::from_le_bytes(blob[stub_len..stub_len + 2].try_into().unwrap());
    assert_eq!(data_len as usize, 2 + 2 + proglen);
    let off = u16::from_le_bytes(blob[stub_len + 2..stub_len + 4].try_into().unwrap());
    assert_eq!(off, 4, "one breakpoint: program right after the 2-entry table");
  }
}
