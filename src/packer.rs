//! The Nu bytecode packer. After every function has produced its IR
//! list, the packer canonicalises each instruction to a bytecode
//! descriptor, assigns the 248 free dispatch-table slots greedily by
//! usage, and then spends any remaining slots on constant
//! specialisations and macro fusions while they keep saving bytes.
//! Finally it emits the interpreter preamble, the opcode table, the
//! bytecode itself, and the interpreter epilogue.

use std::fmt::Write as _;
use hashbrown::HashMap;
use itertools::Itertools;
use log::debug;
use crate::{Compiler, FuncId, ModuleId, LONG_SIZE};
use crate::types::NuLabelId;
use crate::types::nu::{NuLabelPool, NuList, NuOp};

pub const DIRECT_BYTECODE: i32 = 0;
pub const PUSHI_BYTECODE: i32 = 1;
pub const PUSHA_BYTECODE: i32 = 2;
pub const CALLA_BYTECODE: i32 = 3;
pub const FIRST_BYTECODE: i32 = 4;
pub const MAX_BYTECODE: i32 = 0xf8;

/// Implementations longer than this cannot be concatenated in the LUT
/// and fall back to a call+jmp pair.
const MAX_INSTR_SEQ_LEN: i32 = 4;
const MAX_MACRO_DEPTH: u32 = 4;

/// Handle to a bytecode descriptor.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct BcId(pub u32);

/// One dispatch-table descriptor: a logical opcode, a specialised
/// constant, or a fused macro.
#[derive(Clone, Debug)]
pub struct NuBytecode {
  pub code: i32,
  pub usage: u32,
  pub name: String,
  pub impl_text: String,
  /// LUT footprint in longs.
  pub impl_size: i32,
  pub value: i64,
  pub is_const: bool,
  pub is_label: bool,
  pub is_any_branch: bool,
  pub is_rel_branch: bool,
  pub is_binary_op: bool,
  pub is_inline_asm: bool,
  pub is_small_const: bool,
  pub macro_depth: u32,
  pub in_hub: bool,
}

impl NuBytecode {
  fn new(name: String) -> Self {
    NuBytecode {
      code: DIRECT_BYTECODE, usage: 1, name,
      impl_text: String::new(), impl_size: 0, value: 0,
      is_const: false, is_label: false,
      is_any_branch: false, is_rel_branch: false, is_binary_op: false,
      is_inline_asm: false, is_small_const: false,
      macro_depth: 0, in_hub: false,
    }
  }
}

/// The embedded interpreter source: prologue, form-feed, `impl_<OP>`
/// blocks, form-feed, epilogue.
const NUINTERP_SPIN: &str = include_str!("sys/nuinterp.spin");

/// Opcodes whose implementations are woven into the interpreter core;
/// referencing them costs a single jump.
const BUILTIN_OPS: &[NuOp] = &[
  NuOp::Drop, NuOp::Drop2, NuOp::Dup, NuOp::Dup2, NuOp::Swap, NuOp::Swap2,
  NuOp::Over, NuOp::Call, NuOp::CallM, NuOp::Enter, NuOp::Ret,
  NuOp::PushI, NuOp::PushA, NuOp::CallA, NuOp::Break, NuOp::GetHeap,
];

/// Count the emitted longs of an implementation block: one per line,
/// skipping the label and comment lines, plus one per `##` prefix.
fn impl_size_of(text: &str) -> i32 {
  let mut size = 0;
  for line in text.lines() {
    let t = line.trim_start();
    if t.is_empty() { break }
    if t.starts_with("impl_") { continue }
    if t.starts_with('\'') { continue }
    size += 1;
    if t.contains("##") { size += 1 }
  }
  size
}

/// Per-opcode implementation text scanned out of the interpreter source.
fn scan_impls() -> HashMap<String, String> {
  let mut map = HashMap::new();
  let Some(body_start) = NUINTERP_SPIN.find('\u{c}') else { return map };
  let body = &NUINTERP_SPIN[body_start + 1..];
  let body_end = body.find('\u{c}').unwrap_or(body.len());
  let body = &body[..body_end];
  let mut cur_name: Option<String> = None;
  let mut cur_text = String::new();
  for line in body.lines() {
    if let Some(rest) = line.strip_prefix("impl_") {
      if let Some(name) = cur_name.take() {
        map.insert(name, std::mem::take(&mut cur_text));
      }
      cur_name = Some(rest.trim_end().to_owned());
      cur_text = format!("{line}\n");
    } else if cur_name.is_some() {
      if line.trim().is_empty() {
        let name = cur_name.take().expect("checked");
        map.insert(name, std::mem::take(&mut cur_text));
      } else {
        cur_text.push_str(line);
        cur_text.push('\n');
      }
    }
  }
  if let Some(name) = cur_name.take() {
    map.insert(name, cur_text);
  }
  map
}

/// Parameters substituted into the interpreter source escapes.
pub struct NuContext {
  pub clock_freq: u32,
  pub clock_mode: u32,
  pub entry_pt: Option<NuLabelId>,
  pub init_obj: Option<NuLabelId>,
  pub init_frame: Option<NuLabelId>,
  pub init_sp: Option<NuLabelId>,
  pub heap_size: u32,
  pub var_size: u32,
}

/// Packer state for one compilation.
pub struct NuPacker {
  pub bytecodes: Vec<NuBytecode>,
  static_ops: HashMap<NuOp, BcId>,
  const_ops: HashMap<(i64, i32), BcId>,
  impls: HashMap<String, String>,
}

impl Default for NuPacker {
  fn default() -> Self { Self::new() }
}

impl NuPacker {
  #[must_use] pub fn new() -> Self {
    NuPacker {
      bytecodes: Vec::new(),
      static_ops: HashMap::new(),
      const_ops: HashMap::new(),
      impls: scan_impls(),
    }
  }

  fn alloc(&mut self, bc: NuBytecode) -> BcId {
    let id = BcId(self.bytecodes.len() as u32);
    self.bytecodes.push(bc);
    id
  }

  #[must_use] pub fn get(&self, id: BcId) -> &NuBytecode { &self.bytecodes[id.0 as usize] }
  fn get_mut(&mut self, id: BcId) -> &mut NuBytecode { &mut self.bytecodes[id.0 as usize] }

  fn bytecode_for_const(&mut self, val: i64, is_label: bool, code: i32) -> BcId {
    if let Some(&id) = self.const_ops.get(&(val, code)) {
      self.get_mut(id).usage += 1;
      return id;
    }
    let mut bc = NuBytecode::new(String::new());
    bc.code = code;
    bc.value = val;
    bc.is_const = true;
    bc.is_label = is_label;
    let id = self.alloc(bc);
    self.const_ops.insert((val, code), id);
    id
  }

  /// Canonicalise one IR instruction to its descriptor. `PUSHI`/`PUSHA`
  /// key on the concrete immediate so every unique constant can earn its
  /// own opcode.
  pub fn bytecode_for(&mut self, op: NuOp, val: i32, label: Option<NuLabelId>) -> Option<BcId> {
    if op.needs_no_code() { return None }
    match op {
      NuOp::PushI => return Some(self.bytecode_for_const(i64::from(val), false, PUSHI_BYTECODE)),
      NuOp::PushA => return Some(self.bytecode_for_const(
        i64::from(label.map_or(0, |l| l.0)), true, PUSHA_BYTECODE)),
      NuOp::CallA => return Some(self.bytecode_for_const(
        i64::from(label.map_or(0, |l| l.0)), true, CALLA_BYTECODE)),
      _ => {}
    }
    if let Some(&id) = self.static_ops.get(&op) {
      self.get_mut(id).usage += 1;
      return Some(id);
    }
    let name = op.name().to_owned();
    let mut bc = NuBytecode::new(name.clone());
    if BUILTIN_OPS.contains(&op) {
      // built into the interpreter core: dispatch is a plain jump
      bc.impl_text = format!("\tjmp\t#\\impl_{name}\n");
      bc.impl_size = 1;
    } else if let Some(text) = self.impls.get(&name) {
      bc.impl_text = text.clone();
      bc.impl_size = impl_size_of(text);
    }
    bc.is_any_branch = op.is_any_branch();
    bc.is_rel_branch = op.is_rel_branch();
    bc.is_binary_op = op.is_binary_op();
    bc.is_inline_asm = op == NuOp::InlineAsm;
    let id = self.alloc(bc);
    self.static_ops.insert(op, id);
    Some(id)
  }
}

/// Copy an implementation body, optionally rewriting the terminal
/// `_ret_`/`jmp` so two bodies can be concatenated.
fn copy_impl(out: &mut String, text: &str, skip_ret: bool) {
  for line in text.lines() {
    if line.trim_start().starts_with("impl_") { continue }
    if line.trim().is_empty() { break }
    let mut line = line.to_owned();
    if skip_ret {
      if let Some(ix) = line.find("_ret_") {
        line.replace_range(ix..ix + 5, "     ");
      } else if let Some(ix) = line.find("jmp") {
        line.replace_range(ix..ix + 3, "call");
      }
    }
    out.push_str(&line);
    out.push('\n');
  }
}

/// Synthesize the implementation for a fused pair.
fn merge_impls(name: &str, first: &NuBytecode, second: &NuBytecode) -> String {
  let mut out = format!("impl_{name}\n");
  if first.is_small_const && second.is_binary_op
    && (0..=511).contains(&first.value)
  {
    let opname = match second.name.as_str() {
      "MINS" => "fges".to_owned(),
      "MAXS" => "fles".to_owned(),
      "MINU" => "fge".to_owned(),
      "MAXU" => "fle".to_owned(),
      "IOR" => "or".to_owned(),
      other => other.to_ascii_lowercase(),
    };
    let _ = writeln!(out, " _ret_\t{opname}\ttos, #{}", first.value);
  } else if first.impl_size + second.impl_size <= MAX_INSTR_SEQ_LEN {
    copy_impl(&mut out, &first.impl_text, true);
    copy_impl(&mut out, &second.impl_text, false);
  } else if first.impl_size + 1 <= MAX_INSTR_SEQ_LEN {
    copy_impl(&mut out, &first.impl_text, true);
    let _ = writeln!(out, "\tjmp\t#\\impl_{}", second.name);
  } else if second.impl_size + 1 <= MAX_INSTR_SEQ_LEN {
    let _ = writeln!(out, "\tcall\t#\\impl_{}", first.name);
    copy_impl(&mut out, &second.impl_text, false);
  } else {
    let _ = writeln!(out, "\tcall\t#\\impl_{}", first.name);
    let _ = writeln!(out, "\tjmp\t#\\impl_{}", second.name);
  }
  out.push('\n');
  out
}

struct MacroCandidate {
  first: BcId,
  second: BcId,
  count: u32,
  depth: u32,
}

impl Compiler {
  /// Step 1–4 of the packing algorithm over all function lists.
  pub fn nu_create_bytecodes(&mut self, packer: &mut NuPacker, lists: &mut [&mut NuList]) {
    // canonicalise
    for irl in lists.iter_mut() {
      for ir in &mut irl.ir {
        ir.bytecode = packer.bytecode_for(ir.op, ir.val, ir.label);
      }
    }
    // sort by usage, assign slots greedily
    let order: Vec<BcId> = (0..packer.bytecodes.len() as u32).map(BcId)
      .sorted_by_key(|&id| std::cmp::Reverse(packer.get(id).usage))
      .collect();
    let mut code = FIRST_BYTECODE;
    for id in order {
      let bc = packer.get_mut(id);
      if bc.is_const {
        // keyed constants ride the predefined PUSHI/PUSHA/CALLA slots
      } else if bc.is_rel_branch {
        // relative branches measure from their own opcode and must be
        // single-byte
        bc.code = code;
        code += 1;
      } else if code >= MAX_BYTECODE {
        bc.code = DIRECT_BYTECODE;
      } else {
        bc.code = code;
        code += 1;
      }
    }

    // opportunistic compression
    let mut lut_size = 0x300;
    while code < MAX_BYTECODE - 1
      && self.options.optimize.contains(crate::OptimizeFlags::MAKE_MACROS)
    {
      self.nu_recalc_usage(packer, lists);
      let const_cand = Self::find_compress_const(packer);
      let macro_cand = Self::scan_for_macros(packer, lists);
      let (pick_const, cost) = match (&const_cand, &macro_cand) {
        (Some((_, cv)), Some((_, mv))) => if cv >= mv { (true, *cv) } else { (false, *mv) },
        (Some((_, cv)), None) => (true, *cv),
        (None, Some((_, mv))) => (false, *mv),
        (None, None) => break,
      };
      if cost <= 0 && lut_size > 0x3f8 {
        // no byte savings and no LUT room for speculative speed wins
        break;
      }
      let new_id = if pick_const {
        let (id, _) = const_cand.expect("picked const");
        Self::specialise_constant(packer, id);
        id
      } else {
        let (cand, _) = macro_cand.expect("picked macro");
        self.replace_macro(packer, lists, &cand)
      };
      packer.get_mut(new_id).code = code;
      code += 1;
      lut_size += packer.get(new_id).impl_size;
      debug!("packer: slot {code} -> {} (lut {lut_size:#x})",
             packer.get(new_id).name);
    }
  }

  fn nu_recalc_usage(&self, packer: &mut NuPacker, lists: &mut [&mut NuList]) {
    for bc in &mut packer.bytecodes { bc.usage = 0 }
    for irl in lists.iter() {
      for ir in &irl.ir {
        if let Some(id) = ir.bytecode {
          packer.get_mut(id).usage += 1;
        }
      }
    }
  }

  /// Best `PUSHI`/`PUSHA` constant worth a dedicated single-byte opcode.
  /// Score = invocation savings × usage − implementation cost.
  fn find_compress_const(packer: &NuPacker) -> Option<(BcId, i32)> {
    let order = (0..packer.bytecodes.len() as u32).map(BcId)
      .sorted_by_key(|&id| std::cmp::Reverse(packer.get(id).usage));
    for id in order {
      let bc = packer.get(id);
      if (bc.code == PUSHI_BYTECODE || bc.code == PUSHA_BYTECODE) && bc.usage > 1 {
        let mut impl_cost = (MAX_INSTR_SEQ_LEN + 1) * 4;
        let invoke_cost = if (0..=0xff).contains(&bc.value) { 1 }
          else if (0..=0xffff).contains(&bc.value) { 2 }
          else { 4 };
        if (-511..=511).contains(&bc.value) {
          impl_cost -= 4; // small immediates need no AUG prefix
        }
        let saved = invoke_cost * bc.usage as i32 - impl_cost;
        if saved < 0 { return None }
        return Some((id, saved));
      }
    }
    None
  }

  fn specialise_constant(packer: &mut NuPacker, id: BcId) {
    let bc = packer.get_mut(id);
    let mut val = bc.value;
    let mut instr = "mov";
    let mut prefix = "PUSH_";
    if !bc.is_label && val < 0 {
      val = -val;
      instr = "neg";
      prefix = "PUSH_M";
    }
    let (name, valstr) = if bc.is_label {
      (format!("PUSH_L{:05}", bc.value), format!("__Label_{:05}", bc.value))
    } else {
      (format!("{prefix}{val}"), format!("{val}"))
    };
    let immflag = if !bc.is_label && (0..512).contains(&val) { "" } else { "#" };
    bc.name = name;
    bc.impl_text = format!(
      "impl_{}\n\tcall\t#\\impl_DUP\n _ret_\t{instr}\ttos, #{immflag}{valstr}\n\n",
      bc.name);
    bc.impl_size = if immflag.is_empty() { 2 } else { 3 };
    if !bc.is_label { bc.is_small_const = (0..512).contains(&bc.value) }
    bc.is_const = false; // no PUSHI operand needed any more
  }

  /// Best adjacent pair for macro fusion: both already single-byte, no
  /// relative branches or inline asm, nesting depth below the cap. The
  /// macro needs at least 8 implementation bytes and saves one byte per
  /// invocation.
  fn scan_for_macros(packer: &NuPacker, lists: &mut [&mut NuList])
                     -> Option<(MacroCandidate, i32)> {
    let mut counts: HashMap<(BcId, BcId), u32> = HashMap::new();
    let mut best: Option<(BcId, BcId)> = None;
    let mut best_count = 0;
    for irl in lists.iter() {
      let mut prev: Option<BcId> = None;
      for ir in &irl.ir {
        let mut cur = ir.bytecode;
        if let Some(id) = cur {
          let bc = packer.get(id);
          if bc.is_inline_asm || bc.is_rel_branch { cur = None }
        }
        if let (Some(p), Some(c)) = (prev, cur) {
          let pb = packer.get(p);
          let cb = packer.get(c);
          if pb.macro_depth < MAX_MACRO_DEPTH && cb.macro_depth < MAX_MACRO_DEPTH
            && pb.code >= FIRST_BYTECODE && cb.code >= FIRST_BYTECODE
          {
            let n = counts.entry((p, c)).or_insert(0);
            *n += 1;
            if *n > best_count {
              best_count = *n;
              best = Some((p, c));
            }
          }
        }
        prev = match cur {
          Some(id) if !packer.get(id).is_any_branch => Some(id),
          _ => None,
        };
      }
    }
    let (first, second) = best?;
    let saved = best_count as i32 - 7;
    if saved < 0 { return None }
    let depth = packer.get(first).macro_depth.max(packer.get(second).macro_depth) + 1;
    Some((MacroCandidate { first, second, count: best_count, depth }, saved))
  }

  fn replace_macro(&self, packer: &mut NuPacker, lists: &mut [&mut NuList],
                   cand: &MacroCandidate) -> BcId {
    let first = packer.get(cand.first).clone();
    let second = packer.get(cand.second).clone();
    let mut bc = NuBytecode::new(format!("{}_{}", first.name, second.name));
    bc.usage = 0;
    bc.macro_depth = cand.depth;
    bc.is_any_branch = first.is_any_branch || second.is_any_branch;
    bc.impl_text = merge_impls(&bc.name, &first, &second);
    bc.impl_size = impl_size_of(&bc.impl_text);
    let id = packer.alloc(bc);
    debug!("packer: fusing {}+{} ({} sites)", first.name, second.name, cand.count);
    // rewrite the affected sites, splicing out the consumed neighbour
    for irl in lists.iter_mut() {
      let mut i = 0;
      while i + 1 < irl.ir.len() {
        if irl.ir[i].bytecode == Some(cand.first)
          && irl.ir[i + 1].bytecode == Some(cand.second)
        {
          irl.ir[i].bytecode = Some(id);
          irl.ir.remove(i + 1);
          packer.get_mut(id).usage += 1;
          let f = packer.get_mut(cand.first); f.usage = f.usage.saturating_sub(1);
          let s = packer.get_mut(cand.second); s.usage = s.usage.saturating_sub(1);
        }
        i += 1;
      }
    }
    id
  }

  // ---- emission ----------------------------------------------------------

  fn output_escaped(&self, out: &mut String, c: u8, ctxt: &NuContext,
                    labels: &NuLabelPool) {
    let put_label = |out: &mut String, l: Option<NuLabelId>| {
      match l {
        Some(l) => out.push_str(&labels.get(l).name),
        None => out.push('0'),
      }
    };
    match c {
      b'0' => { let _ = write!(out, "{}", ctxt.clock_freq); }
      b'1' => { let _ = write!(out, "${:x}", ctxt.clock_mode); }
      b'2' => put_label(out, ctxt.entry_pt),
      b'3' => put_label(out, ctxt.init_obj),
      b'4' => put_label(out, ctxt.init_frame),
      b'5' => put_label(out, ctxt.init_sp),
      b'6' => { let _ = write!(out, "{}", ctxt.heap_size / 4); }
      b'7' => { let _ = write!(out, "{}", ctxt.var_size / 4); }
      _ => {}
    }
  }

  /// Interpreter preamble: coginit header, interpreter body with escape
  /// substitution, opcode implementations ($300.. in LUT, spilling to
  /// hub behind a trampoline), and the dispatch table.
  pub fn nu_output_interpreter(&mut self, out: &mut String, packer: &mut NuPacker,
                               ctxt: &NuContext, labels: &NuLabelPool) {
    let _ = writeln!(out, "con");
    let _ = writeln!(out, "  _clkfreq = {}", ctxt.clock_freq);
    let _ = writeln!(out, "  clock_freq_addr = $14");
    let _ = writeln!(out, "  clock_mode_addr = $18\n");
    let _ = writeln!(out, "dat");
    if !self.options.no_coginit && self.options.output != crate::Output::CogSpin {
      out.push_str("\torg 0\n\tnop\n\tcogid\tpa\n\tcoginit\tpa, ##@real_init\n");
      let _ = writeln!(out, "\torgh\t$10");
      out.push_str("\tlong\t0\t' reserved\n");
      out.push_str("\tlong\t0\t' clock frequency ($14)\n");
      out.push_str("\tlong\t0\t' clock mode      ($18)\n");
      out.push_str("\tlong\t0\t' reserved for baud ($1c)\n");
      out.push_str("\torgh\t$80\t' $40-$80 reserved\n");
    }
    // interpreter body up to the first form feed
    let mut bytes = NUINTERP_SPIN.bytes().peekable();
    while let Some(c) = bytes.next() {
      if c == 0x0c { break }
      if c == 0x01 {
        if let Some(esc) = bytes.next() {
          self.output_escaped(out, esc, ctxt, labels);
        }
      } else {
        out.push(c as char);
      }
    }

    // opcode implementations, starting in LUT at $300
    out.push_str("\ndat\n\torg\t$300\nIMPL_LUT\n");
    let mut impl_pc = 0x300;
    let impl_max = 0x3f8; // really $3ff; leave slack
    let mut saw_orgh = false;
    let order: Vec<BcId> = (0..packer.bytecodes.len() as u32).map(BcId)
      .sorted_by_key(|&id| packer.get(id).code)
      .collect();
    for id in order.iter().copied() {
      let bc = packer.get(id);
      if bc.impl_text.is_empty() {
        if !bc.is_const && bc.code >= FIRST_BYTECODE {
          let name = bc.name.clone();
          self.diag.warning(crate::types::SrcSpan::none(),
                            crate::diag::DiagKind::Internal,
                            format!("no implementation for {name}"));
        }
        continue;
      }
      if !bc.impl_text.starts_with("impl_") && !bc.impl_text.starts_with("\tjmp") {
        continue;
      }
      if bc.impl_text.starts_with("\tjmp") {
        // builtin alias: dispatch jumps into the interpreter core
        continue;
      }
      impl_pc += bc.impl_size;
      if impl_pc >= impl_max && !saw_orgh {
        saw_orgh = true;
        out.push_str("\torgh\n");
      }
      if saw_orgh {
        packer.get_mut(id).in_hub = true;
      }
      let bc = packer.get(id);
      out.push_str(&bc.impl_text);
      if !bc.impl_text.ends_with("\n\n") { out.push('\n') }
      if !saw_orgh {
        let _ = writeln!(out, "' pc= 0x{impl_pc:x}");
      }
    }
    if !saw_orgh {
      out.push_str("\n\torgh ($ < $400) ? $400 : $\n");
    }

    // dispatch table: the four fixed entries, then one long per slot
    out.push_str("\nOPC_TABLE\n");
    out.push_str("\tlong\timpl_DIRECT\n");
    out.push_str("\tlong\timpl_PUSHI\n");
    out.push_str("\tlong\timpl_PUSHA\n");
    out.push_str("\tlong\timpl_CALLA\n");
    for id in order.iter().copied() {
      let bc = packer.get(id);
      if bc.code >= FIRST_BYTECODE {
        if bc.in_hub {
          let _ = writeln!(out, "\tlong\t(impl_{}<<16)|trampoline  ' in HUB", bc.name);
        } else {
          let _ = writeln!(out, "\tlong\timpl_{}", bc.name);
        }
      }
    }
    out.push_str("\talignl\nOPC_TABLE_END\n");

    // symbolic constants for the generated bytecode below
    out.push_str("\ncon\n");
    let _ = writeln!(out, "\tNU_OP_DIRECT = {DIRECT_BYTECODE}");
    let _ = writeln!(out, "\tNU_OP_PUSHI = {PUSHI_BYTECODE}");
    let _ = writeln!(out, "\tNU_OP_PUSHA = {PUSHA_BYTECODE}");
    let _ = writeln!(out, "\tNU_OP_CALLA = {CALLA_BYTECODE}");
    for id in order {
      let bc = packer.get(id);
      if bc.code >= FIRST_BYTECODE {
        let _ = writeln!(out, "\tNU_OP_{} = {}  ' (used {} times)",
                         bc.name, bc.code, bc.usage);
      }
    }
    out.push_str("\ndat\n\torgh\n");
  }

  fn bytecode_ref(packer: &NuPacker, id: BcId) -> String {
    let bc = packer.get(id);
    match bc.code {
      DIRECT_BYTECODE => format!("NU_OP_DIRECT, word impl_{}", bc.name),
      PUSHI_BYTECODE => "NU_OP_PUSHI".to_owned(),
      PUSHA_BYTECODE => "NU_OP_PUSHA".to_owned(),
      CALLA_BYTECODE => "NU_OP_CALLA".to_owned(),
      _ => format!("NU_OP_{}", bc.name),
    }
  }

  /// Emit one function's bytecode stream as source lines.
  pub fn nu_output_ir_list(&mut self, out: &mut String, packer: &NuPacker,
                           labels: &NuLabelPool, irl: &NuList,
                           rel_counter: &mut u32) {
    let label_name = |l: Option<NuLabelId>| -> String {
      l.map_or_else(|| "0".to_owned(), |l| labels.get(l).name.clone())
    };
    for ir in &irl.ir {
      let comment = ir.comment.map(|c| c.as_str());
      match ir.op {
        NuOp::Label => {
          if let Some(l) = ir.label { out.push_str(&labels.get(l).name) }
        }
        NuOp::Align => out.push_str("\talignl"),
        NuOp::Comment => {
          if let Some(c) = comment { let _ = write!(out, "' {c}"); }
          out.push('\n');
          continue;
        }
        NuOp::Bra3 => {
          // fixed 3 bytes for jump-table use
          *rel_counter += 1;
          let Some(id) = ir.bytecode else { continue };
          let target = label_name(ir.label);
          let _ = write!(out, "\tbyte\t{}, word ({target} - __L_relbranch_{:05})",
                         Self::bytecode_ref(packer, id), rel_counter);
          let _ = write!(out, "\n__L_relbranch_{:05}", rel_counter);
        }
        op if op.is_rel_branch() => {
          *rel_counter += 1;
          let Some(id) = ir.bytecode else { continue };
          let target = label_name(ir.label);
          let _ = write!(out, "\tbyte\t{}, fvars ({target} - __L_relbranch_{:05})",
                         Self::bytecode_ref(packer, id), rel_counter);
          if let Some(c) = comment {
            let _ = write!(out, "\t' {c}");
          }
          let _ = write!(out, "\n__L_relbranch_{:05}", rel_counter);
          out.push('\n');
          continue;
        }
        _ => {
          let Some(id) = ir.bytecode else { continue };
          let bc = packer.get(id);
          if bc.is_const {
            let name = Self::bytecode_ref(packer, id);
            if bc.is_label {
              let target = label_name(ir.label);
              let _ = write!(out, "\tbyte\t{name}, fvar {target}");
            } else if (0..=0xff_ffff).contains(&ir.val) {
              // small positive constants ride the variable-length form
              let _ = write!(out, "\tbyte\tNU_OP_PUSHA, fvar {}", ir.val);
            } else {
              let _ = write!(out, "\tbyte\t{name}, long {}", ir.val);
            }
          } else {
            let _ = write!(out, "\tbyte\t{}", Self::bytecode_ref(packer, id));
          }
        }
      }
      if let Some(c) = comment {
        let _ = write!(out, "\t' {c}");
      }
      out.push('\n');
    }
  }

  /// Interpreter epilogue, after the last form feed.
  pub fn nu_output_finish(&mut self, out: &mut String, ctxt: &NuContext,
                          labels: &NuLabelPool) {
    let Some(last_ff) = NUINTERP_SPIN.rfind('\u{c}') else { return };
    let tail = &NUINTERP_SPIN[last_ff + 1..];
    let mut bytes = tail.bytes().peekable();
    while let Some(c) = bytes.next() {
      if c == 0x01 {
        if let Some(esc) = bytes.next() {
          self.output_escaped(out, esc, ctxt, labels);
        }
      } else {
        out.push(c as char);
      }
    }
  }

  /// Drive the whole packing + emission pipeline for `top`.
  pub fn pack_and_emit(&mut self, top: ModuleId, labels: &mut NuLabelPool) -> String {
    let mut packer = NuPacker::new();
    // pull the per-function lists out so the packer can own them briefly
    let fids: Vec<FuncId> = (0..self.funcs.len())
      .map(crate::types::FuncId::from_usize).collect();
    let mut taken: Vec<(FuncId, NuList)> = Vec::new();
    for f in &fids {
      if let crate::FuncBackend::Nu(d) = &mut self.funcs[f.idx()].be {
        taken.push((*f, std::mem::take(&mut d.irl)));
      }
    }
    {
      let mut refs: Vec<&mut NuList> = taken.iter_mut().map(|(_, l)| l).collect();
      self.nu_create_bytecodes(&mut packer, &mut refs);
    }

    let (clock_freq, clock_mode) = self.get_clk_freq(top).unwrap_or((10_000_000, 0));
    let heap_longs = self.const_or_default(self.system_module, "__real_heapsize__", 0);
    let mut heap_size = if self.need_heap {
      (heap_longs as u32) * LONG_SIZE as u32 + 4 * LONG_SIZE as u32
    } else { 0 };
    heap_size = (heap_size + 4 + 3) & !3;
    let entry = self.module(top).functions.first().copied()
      .and_then(|f| match &self.func(f).be {
        crate::FuncBackend::Nu(d) => d.entry_label,
        _ => None,
      });
    let ctxt = NuContext {
      clock_freq, clock_mode,
      entry_pt: entry,
      init_obj: None, init_frame: None, init_sp: None,
      heap_size,
      var_size: self.module(top).varsize as u32,
    };

    let mut out = String::new();
    self.nu_output_interpreter(&mut out, &mut packer, &ctxt, labels);
    let mut rel_counter = 0;
    for (f, irl) in &taken {
      let name = self.func(*f).name;
      let _ = writeln!(out, "' function {name}");
      self.nu_output_ir_list(&mut out, &packer, labels, irl, &mut rel_counter);
    }
    self.nu_output_finish(&mut out, &ctxt, labels);

    // hand the lists back
    for (f, irl) in taken {
      if let crate::FuncBackend::Nu(d) = &mut self.funcs[f.idx()].be {
        d.irl = irl;
      }
    }
    out
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::{Compiler, Options};
  use crate::types::nu::{NuLabelPool, NuList, NuOp};

  fn session() -> Compiler {
    let mut opts = Options::default();
    opts.optimize |= crate::OptimizeFlags::MAKE_MACROS;
    let mut c = Compiler::new(opts);
    c.diag.capture();
    c
  }

  #[test]
  fn impl_scan_finds_blocks() {
    let p = NuPacker::new();
    assert!(p.impls.contains_key("ADD"), "interpreter carries impl_ADD");
    assert!(p.impls.contains_key("LDL"));
    let add = &p.impls["ADD"];
    assert!(add.starts_with("impl_ADD"));
    assert!(impl_size_of(add) >= 1);
  }

  #[test]
  fn descriptors_keyed_by_constant() {
    let mut p = NuPacker::new();
    let a = p.bytecode_for(NuOp::PushI, 42, None).unwrap();
    let b = p.bytecode_for(NuOp::PushI, 42, None).unwrap();
    let c = p.bytecode_for(NuOp::PushI, 43, None).unwrap();
    assert_eq!(a, b, "same constant shares a descriptor");
    assert_ne!(a, c);
    assert_eq!(p.get(a).usage, 2);
    let d = p.bytecode_for(NuOp::Add, 0, None).unwrap();
    let e = p.bytecode_for(NuOp::Add, 0, None).unwrap();
    assert_eq!(d, e);
  }

  #[test]
  fn codes_unique_and_bounded() {
    let mut c = session();
    let mut p = NuPacker::new();
    let mut irl = NuList::new();
    for i in 0..10 {
      irl.emit_const(i);
      irl.emit(NuOp::Add);
      irl.emit(NuOp::Drop);
    }
    let mut lists = [&mut irl];
    c.nu_create_bytecodes(&mut p, &mut lists);
    let mut seen = std::collections::HashSet::new();
    for bc in &p.bytecodes {
      assert!((0..256).contains(&bc.code));
      if bc.code >= FIRST_BYTECODE {
        assert!(seen.insert(bc.code), "code {} assigned twice", bc.code);
      }
    }
  }

  #[test]
  fn hot_pair_gets_fused() {
    let mut c = session();
    let mut p = NuPacker::new();
    let mut irl = NuList::new();
    // many adjacent MULS/DROP pairs: worth a macro
    for _ in 0..32 {
      irl.emit(NuOp::MulS);
      irl.emit(NuOp::Drop);
    }
    let before = irl.ir.len();
    let mut lists = [&mut irl];
    c.nu_create_bytecodes(&mut p, &mut lists);
    assert!(p.bytecodes.iter().any(|bc| bc.name == "MULS_DROP"),
            "fused opcode exists");
    assert!(irl.ir.len() < before, "sites rewritten to the fused opcode");
    // idempotent on the consumed neighbours: every surviving pair site
    // references the macro
    let fused = p.bytecodes.iter().position(|bc| bc.name == "MULS_DROP").unwrap();
    assert!(irl.ir.iter().filter_map(|ir| ir.bytecode)
      .any(|id| id.0 as usize == fused));
  }

  #[test]
  fn constant_specialisation_scoring() {
    let mut c = session();
    let mut p = NuPacker::new();
    let mut irl = NuList::new();
    // a hot small constant: 1-byte invocations, cheap implementation
    for _ in 0..40 { irl.emit_const(7) }
    let mut lists = [&mut irl];
    c.nu_create_bytecodes(&mut p, &mut lists);
    let spec = p.bytecodes.iter().find(|bc| bc.name == "PUSH_7");
    let spec = spec.expect("hot constant gets its own opcode");
    assert!(spec.impl_text.contains("#7"), "no-# small form: {}", spec.impl_text);
    assert_eq!(spec.impl_size, 2);
  }

  #[test]
  fn emission_mentions_dispatch_table() {
    let mut c = session();
    let mut labels = NuLabelPool::new();
    let mut p = NuPacker::new();
    let mut irl = NuList::new();
    irl.emit_const(1);
    irl.emit(NuOp::Add);
    {
      let mut lists = [&mut irl];
      c.nu_create_bytecodes(&mut p, &mut lists);
    }
    let ctxt = NuContext {
      clock_freq: 160_000_000, clock_mode: 0x10c3f04,
      entry_pt: None, init_obj: None, init_frame: None, init_sp: None,
      heap_size: 0, var_size: 0,
    };
    let mut out = String::new();
    c.nu_output_interpreter(&mut out, &mut p, &ctxt, &labels);
    assert!(out.contains("OPC_TABLE"));
    assert!(out.contains("\tlong\timpl_DIRECT"));
    assert!(out.contains("NU_OP_ADD"));
    let mut rel = 0;
    c.nu_output_ir_list(&mut out, &p, &labels, &irl, &mut rel);
    assert!(out.contains("byte\tNU_OP_PUSHA, fvar 1"),
            "small positive constant uses the fvar form");
  }
}
