//! Nu bytecode peephole optimisation: a small pattern-matching engine
//! over the per-function IR lists, plus a few analyses that do not fit
//! the pattern shape (stack-tracking dup/drop removal, dead code,
//! DJNZ_FAST conversion, unused-label sweeping).

use crate::Compiler;
use crate::types::nu::{NuIr, NuLabelPool, NuList, NuOp};

const MATCH_ARG: u32 = 0x1;
const MATCH_IMM: u32 = 0x2;
const MATCH_OP: u32 = 0x4;

/// What an element of a match sequence accepts.
#[derive(Copy, Clone)]
enum PatOp {
  Is(NuOp),
  /// Any compare-and-branch (the `CBxx` supermatch).
  AnyCb,
  /// Any base-relative address producer (`ADD_xBASE`).
  AnyAddBase,
}

#[derive(Copy, Clone)]
struct PatElem {
  op: PatOp,
  arg: i64,
  flags: u32,
}

const fn m(op: NuOp) -> PatElem { PatElem { op: PatOp::Is(op), arg: 0, flags: 0 } }
const fn m_imm(op: NuOp, imm: i64) -> PatElem {
  PatElem { op: PatOp::Is(op), arg: imm, flags: MATCH_IMM }
}
const fn m_arg(op: NuOp, n: i64) -> PatElem {
  PatElem { op: PatOp::Is(op), arg: n, flags: MATCH_ARG }
}
const fn m_cb() -> PatElem { PatElem { op: PatOp::AnyCb, arg: 0, flags: 0 } }
const fn m_base() -> PatElem { PatElem { op: PatOp::AnyAddBase, arg: 0, flags: 0 } }
const fn m_base_as(n: i64) -> PatElem {
  PatElem { op: PatOp::AnyAddBase, arg: n, flags: MATCH_OP }
}
const fn m_label_of(n: i64) -> PatElem {
  PatElem { op: PatOp::Is(NuOp::Label), arg: n, flags: MATCH_ARG }
}

/// A replacement element: emit `op` (or the opcode of match `arg` with
/// MATCH_OP), with an immediate from the literal or from match `arg`.
type RepElem = PatElem;

struct Peephole {
  pat: &'static [PatElem],
  rep: &'static [RepElem],
  /// Extra processing after the structural match, when the rewrite needs
  /// label surgery the table cannot express.
  special: Option<fn(&mut NuList, usize, usize) -> bool>,
}

// DUP; DROP vanishes
static PAT_DUP_DROP: &[PatElem] = &[m(NuOp::Dup), m(NuOp::Drop)];
// PUSHI 0; ADD vanishes
static PAT_ADD_0: &[PatElem] = &[m_imm(NuOp::PushI, 0), m(NuOp::Add)];
// PUSHI 1; BZ L vanishes (never taken)
static PAT_PUSH1_BZ: &[PatElem] = &[m_imm(NuOp::PushI, 1), m(NuOp::Bz)];
// LDW; PUSHI 15; SIGNX => LDWS
static PAT_LDWS: &[PatElem] = &[m(NuOp::LdW), m_imm(NuOp::PushI, 15), m(NuOp::SignX)];
static REP_LDWS: &[RepElem] = &[m(NuOp::LdWs)];
static PAT_LDBS: &[PatElem] = &[m(NuOp::LdB), m_imm(NuOp::PushI, 7), m(NuOp::SignX)];
static REP_LDBS: &[RepElem] = &[m(NuOp::LdBs)];
// sign-extending an already sign-extended load is a no-op
static PAT_LDWSS: &[PatElem] = &[m(NuOp::LdWs), m_imm(NuOp::PushI, 15), m(NuOp::SignX)];
static REP_LDWS2: &[RepElem] = &[m(NuOp::LdWs)];
static PAT_LDBSS: &[PatElem] = &[m(NuOp::LdBs), m_imm(NuOp::PushI, 7), m(NuOp::SignX)];
static REP_LDBS2: &[RepElem] = &[m(NuOp::LdBs)];
// masking a narrow load with its own width is a no-op
static PAT_LDBAND: &[PatElem] = &[m(NuOp::LdB), m_imm(NuOp::PushI, 255), m(NuOp::And)];
static REP_LDB: &[RepElem] = &[m(NuOp::LdB)];
static PAT_LDWAND: &[PatElem] = &[m(NuOp::LdW), m_imm(NuOp::PushI, 0xffff), m(NuOp::And)];
static REP_LDW: &[RepElem] = &[m(NuOp::LdW)];
// PUSHI 1; SUB => DEC ; PUSHI 1; ADD => INC
static PAT_DEC: &[PatElem] = &[m_imm(NuOp::PushI, 1), m(NuOp::Sub)];
static REP_DEC: &[RepElem] = &[m(NuOp::Dec)];
static PAT_INC: &[PatElem] = &[m_imm(NuOp::PushI, 1), m(NuOp::Add)];
static REP_INC: &[RepElem] = &[m(NuOp::Inc)];
// PUSHI 1; SHL => DOUBLE ; DUP; ADD => DOUBLE
static PAT_SHL1: &[PatElem] = &[m_imm(NuOp::PushI, 1), m(NuOp::Shl)];
static REP_DOUBLE: &[RepElem] = &[m(NuOp::Double)];
static PAT_DUP_ADD: &[PatElem] = &[m(NuOp::Dup), m(NuOp::Add)];
// SWAP before a commutative operator is dead
static PAT_SWAP_ADD: &[PatElem] = &[m(NuOp::Swap), m(NuOp::Add)];
static REP_ADD: &[RepElem] = &[m(NuOp::Add)];
static PAT_SWAP_AND: &[PatElem] = &[m(NuOp::Swap), m(NuOp::And)];
static REP_AND: &[RepElem] = &[m(NuOp::And)];
static PAT_SWAP_IOR: &[PatElem] = &[m(NuOp::Swap), m(NuOp::Ior)];
static REP_IOR: &[RepElem] = &[m(NuOp::Ior)];
static PAT_SWAP_XOR: &[PatElem] = &[m(NuOp::Swap), m(NuOp::Xor)];
static REP_XOR: &[RepElem] = &[m(NuOp::Xor)];
// CBxx L; BRA M; L: => CBnotxx M; L:
static PAT_CBXX: &[PatElem] = &[m_cb(), m(NuOp::Bra), m_label_of(0)];
// SWAP; CBxx => CBreversedxx
static PAT_SWAP_CBXX: &[PatElem] = &[m(NuOp::Swap), m_cb()];
// PUSHI 0; CBNE L => BNZ L ; PUSHI 0; CBEQ L => BZ L
static PAT_CBNZ: &[PatElem] = &[m_imm(NuOp::PushI, 0), m(NuOp::CbNe)];
static PAT_CBZ: &[PatElem] = &[m_imm(NuOp::PushI, 0), m(NuOp::CbEq)];
// store-then-reload keeps a copy on the stack instead
static PAT_ST_LD: &[PatElem] = &[
  m(NuOp::PushI), m_base(), m(NuOp::StL),
  m_arg(NuOp::PushI, 0), m_base_as(1), m(NuOp::LdL),
];
static REP_ST_LD: &[RepElem] = &[
  m(NuOp::Dup), m_arg(NuOp::PushI, 0), m_base_as(1), m(NuOp::StL),
];
// store before return is dead; replaced by a DROP (special)
static PAT_DEAD_ST: &[PatElem] = &[
  m(NuOp::PushI), m(NuOp::AddDbase), m(NuOp::StL), m(NuOp::PushI), m(NuOp::Ret),
];
// a repeated load of the same slot becomes a DUP (special)
static PAT_LD_LD: &[PatElem] = &[
  m(NuOp::PushI), m(NuOp::AddDbase), m(NuOp::LdL),
  m_arg(NuOp::PushI, 0), m(NuOp::AddDbase), m(NuOp::LdL),
];
// loop-counter tail: load/dec/store/branch collapses to DJNZ
static PAT_DJNZ: &[PatElem] = &[
  m(NuOp::PushI), m_base(), m(NuOp::LdL), m(NuOp::Dec), m(NuOp::Dup),
  m_arg(NuOp::PushI, 0), m_base_as(1), m(NuOp::StL), m(NuOp::Bnz),
];
static REP_DJNZ: &[RepElem] = &[
  m_arg(NuOp::PushI, 0), m_base_as(1), m_arg(NuOp::Djnz, 8),
];

fn replace_cbxx(irl: &mut NuList, pos: usize, _count: usize) -> bool {
  // CBxx L; BRA M; LABEL L  ->  CBnotxx M; LABEL L
  let bra_label = irl.ir[pos + 1].label;
  let cb = irl.ir[pos].op.invert_condition();
  irl.ir[pos].op = cb;
  irl.ir[pos].label = bra_label;
  irl.ir.remove(pos + 1);
  true
}

fn replace_swap_cbxx(irl: &mut NuList, pos: usize, _count: usize) -> bool {
  let new_op = irl.ir[pos + 1].op.reverse_condition();
  irl.ir[pos + 1].op = new_op;
  irl.ir.remove(pos);
  true
}

fn replace_cbnz(irl: &mut NuList, pos: usize, _count: usize) -> bool {
  irl.ir[pos + 1].op = NuOp::Bnz;
  irl.ir.remove(pos);
  true
}

fn replace_cbz(irl: &mut NuList, pos: usize, _count: usize) -> bool {
  irl.ir[pos + 1].op = NuOp::Bz;
  irl.ir.remove(pos);
  true
}

fn replace_dead_st(irl: &mut NuList, pos: usize, _count: usize) -> bool {
  // drop the stored value instead of spilling it
  irl.ir[pos].op = NuOp::Drop;
  irl.ir[pos].val = 0;
  irl.ir.remove(pos + 2);
  irl.ir.remove(pos + 1);
  true
}

fn replace_ld_ld(irl: &mut NuList, pos: usize, _count: usize) -> bool {
  // second identical load becomes a DUP
  irl.ir.splice(pos + 3..pos + 6, [NuIr::new(NuOp::Dup)]);
  true
}

static PEEPS: &[Peephole] = &[
  Peephole { pat: PAT_DUP_DROP, rep: &[], special: None },
  Peephole { pat: PAT_ADD_0, rep: &[], special: None },
  Peephole { pat: PAT_PUSH1_BZ, rep: &[], special: None },
  Peephole { pat: PAT_LDWS, rep: REP_LDWS, special: None },
  Peephole { pat: PAT_LDBS, rep: REP_LDBS, special: None },
  Peephole { pat: PAT_LDWSS, rep: REP_LDWS2, special: None },
  Peephole { pat: PAT_LDBSS, rep: REP_LDBS2, special: None },
  Peephole { pat: PAT_LDBAND, rep: REP_LDB, special: None },
  Peephole { pat: PAT_LDWAND, rep: REP_LDW, special: None },
  Peephole { pat: PAT_CBXX, rep: &[], special: Some(replace_cbxx) },
  Peephole { pat: PAT_SWAP_CBXX, rep: &[], special: Some(replace_swap_cbxx) },
  Peephole { pat: PAT_CBNZ, rep: &[], special: Some(replace_cbnz) },
  Peephole { pat: PAT_CBZ, rep: &[], special: Some(replace_cbz) },
  Peephole { pat: PAT_INC, rep: REP_INC, special: None },
  Peephole { pat: PAT_DEC, rep: REP_DEC, special: None },
  Peephole { pat: PAT_SHL1, rep: REP_DOUBLE, special: None },
  Peephole { pat: PAT_DUP_ADD, rep: REP_DOUBLE, special: None },
  Peephole { pat: PAT_SWAP_ADD, rep: REP_ADD, special: None },
  Peephole { pat: PAT_SWAP_AND, rep: REP_AND, special: None },
  Peephole { pat: PAT_SWAP_IOR, rep: REP_IOR, special: None },
  Peephole { pat: PAT_SWAP_XOR, rep: REP_XOR, special: None },
  Peephole { pat: PAT_DJNZ, rep: REP_DJNZ, special: None },
  Peephole { pat: PAT_ST_LD, rep: REP_ST_LD, special: None },
  Peephole { pat: PAT_DEAD_ST, rep: &[], special: Some(replace_dead_st) },
  Peephole { pat: PAT_LD_LD, rep: &[], special: Some(replace_ld_ld) },
];

fn pat_matches(ir: &NuIr, elem: &PatElem, matched: &[usize], irl: &NuList) -> bool {
  match elem.op {
    PatOp::Is(op) if op != ir.op => return false,
    PatOp::AnyCb if !ir.op.is_cb() => return false,
    PatOp::AnyAddBase if !ir.op.is_add_base() => return false,
    _ => {}
  }
  if elem.flags & MATCH_OP != 0 {
    let Some(&mpos) = matched.get(elem.arg as usize) else { return false };
    if irl.ir[mpos].op != ir.op { return false }
  }
  if elem.flags & MATCH_ARG != 0 {
    let Some(&mpos) = matched.get(elem.arg as usize) else { return false };
    // labels compare as labels, immediates as immediates
    if irl.ir[mpos].label.is_some() || ir.label.is_some() {
      if irl.ir[mpos].label != ir.label { return false }
    } else if irl.ir[mpos].val != ir.val {
      return false;
    }
  } else if elem.flags & MATCH_IMM != 0 && i64::from(ir.val) != elem.arg {
    return false;
  }
  true
}

fn try_peephole(irl: &mut NuList, peep: &Peephole, pos: usize) -> bool {
  if pos + peep.pat.len() > irl.ir.len() { return false }
  let mut matched: Vec<usize> = Vec::with_capacity(peep.pat.len());
  for (k, elem) in peep.pat.iter().enumerate() {
    if !pat_matches(&irl.ir[pos + k], elem, &matched, irl) { return false }
    matched.push(pos + k);
  }
  if let Some(special) = peep.special {
    return special(irl, pos, peep.pat.len());
  }
  let replacement: Vec<NuIr> = peep.rep.iter().map(|elem| {
    let mut ir = match elem.op {
      PatOp::Is(op) => NuIr::new(op),
      _ => NuIr::new(NuOp::Dummy),
    };
    if elem.flags & MATCH_OP != 0 {
      ir.op = irl.ir[matched[elem.arg as usize]].op;
    }
    if elem.flags & MATCH_ARG != 0 {
      let src = &irl.ir[matched[elem.arg as usize]];
      ir.val = src.val;
      ir.label = src.label;
    } else if elem.flags & MATCH_IMM != 0 {
      ir.val = elem.arg as i32;
    }
    ir
  }).collect();
  irl.ir.splice(pos..pos + peep.pat.len(), replacement);
  true
}

impl Compiler {
  /// One peephole sweep; returns the number of rewrites.
  pub fn nu_optimize_peephole(&mut self, irl: &mut NuList) -> u32 {
    let mut changes = 0;
    let mut pos = 0;
    while pos < irl.ir.len() {
      if irl.ir[pos].op == NuOp::Dummy || irl.ir[pos].op == NuOp::Comment {
        pos += 1;
        continue;
      }
      let mut fired = false;
      for peep in PEEPS {
        if try_peephole(irl, peep, pos) {
          changes += 1;
          fired = true;
          break;
        }
      }
      if !fired { pos += 1 }
    }
    changes
  }

  /// Remove DUP whose copy is provably DROPped with nothing consuming
  /// it, tracking the net stack height through simple opcodes.
  pub fn nu_remove_dup_drop(&mut self, irl: &mut NuList) -> u32 {
    fn stack_change(op: NuOp) -> Option<i32> {
      match op {
        NuOp::PushI => Some(1),
        NuOp::AddDbase | NuOp::AddVbase | NuOp::LdL | NuOp::Neg
        | NuOp::Inc | NuOp::Dec | NuOp::Double | NuOp::Not | NuOp::Abs => Some(0),
        NuOp::Add | NuOp::Sub | NuOp::And | NuOp::Ior | NuOp::Xor
        | NuOp::Shl | NuOp::Shr | NuOp::Sar | NuOp::Mul => Some(-1),
        NuOp::StL => Some(-2),
        _ => None,
      }
    }
    let mut changes = 0;
    let mut i = 0;
    'outer: while i < irl.ir.len() {
      if irl.ir[i].op == NuOp::Dup {
        let mut level = 1;
        let mut j = i + 1;
        while j < irl.ir.len() {
          if irl.ir[j].op == NuOp::Drop && level == 0 {
            irl.ir.remove(j);
            irl.ir.remove(i);
            changes += 1;
            continue 'outer;
          }
          match stack_change(irl.ir[j].op) {
            Some(d) => level += d,
            None => break,
          }
          j += 1;
        }
      }
      i += 1;
    }
    changes
  }

  /// Drop everything between an unconditional transfer and the next
  /// label, except `BRA3` runs following `JMPREL` (jump tables).
  pub fn nu_remove_dead_code(&mut self, irl: &mut NuList) -> u32 {
    let mut changes = 0;
    let mut in_dead = false;
    let mut in_jump_table = false;
    for ir in &mut irl.ir {
      if in_dead {
        if ir.op == NuOp::Label {
          in_dead = false;
        } else if !ir.op.needs_no_code() {
          ir.op = NuOp::Dummy;
          ir.label = None;
          changes += 1;
        }
      } else if in_jump_table {
        if !ir.op.needs_no_code() && ir.op != NuOp::Bra3 {
          in_jump_table = false;
        }
      } else if ir.op == NuOp::JmpRel {
        in_jump_table = true;
      } else if matches!(ir.op, NuOp::Bra | NuOp::Jmp | NuOp::Ret | NuOp::LongJmp) {
        in_dead = true;
      }
    }
    irl.ir.retain(|ir| ir.op != NuOp::Dummy);
    changes
  }

  /// Assign sequence numbers and single-source (`comefrom`) facts used
  /// by the DJNZ conversion.
  fn nu_scan(&mut self, irl: &mut NuList, labels: &mut NuLabelPool) {
    let mut seq = 1;
    for (ix, ir) in irl.ir.iter_mut().enumerate() {
      ir.seqno = seq;
      seq += 1;
      if ir.op == NuOp::Label {
        if let Some(l) = ir.label {
          labels.get_mut(l).seqno = ir.seqno;
        }
      } else if ir.op == NuOp::PushA || ir.op.is_rel_branch() {
        if let Some(l) = ir.label {
          let lab = labels.get_mut(l);
          if lab.comefrom_valid && lab.comefrom != Some(ix as u32) {
            lab.comefrom = None; // multiple sources
          } else {
            lab.comefrom = Some(ix as u32);
            lab.comefrom_valid = true;
          }
        }
      }
    }
  }

  /// Check that `DBASE[offset]` is not touched between the loop head and
  /// the DJNZ tail, and that control cannot leave or enter the region.
  fn no_djnz_conflict(&self, irl: &NuList, labels: &NuLabelPool,
                      head: usize, tail: usize, offset: i32) -> bool {
    let start_seq = irl.ir[head].seqno;
    let end_seq = irl.ir[tail].seqno;
    let inside = |seq: u32| seq != 0 && seq >= start_seq && seq <= end_seq;
    let mut i = head + 1;
    while i < tail {
      let ir = &irl.ir[i];
      if ir.op == NuOp::PushI && ir.val == offset
        && irl.ir.get(i + 1).is_some_and(|n| n.op == NuOp::AddDbase)
      {
        // touching the counter slot is only fine at the very tail
        return i + 2 == tail;
      }
      match ir.op {
        NuOp::Jmp | NuOp::Ret | NuOp::LongJmp | NuOp::JmpRel
        | NuOp::CallA | NuOp::CallM | NuOp::Call => return false,
        NuOp::Label => {
          let Some(l) = ir.label else { return false };
          let lab = labels.get(l);
          match (lab.comefrom_valid, lab.comefrom) {
            (true, Some(src)) => {
              let Some(src_ir) = irl.ir.get(src as usize) else { return false };
              if !inside(src_ir.seqno) { return false }
            }
            _ => return false,
          }
        }
        op if op.is_cb() => {
          let Some(l) = ir.label else { return false };
          if !inside(labels.get(l).seqno) { return false }
        }
        _ => {}
      }
      i += 1;
    }
    false
  }

  /// Rewrite counter loops ending in `PUSHI off; ADD_DBASE; LDL; DEC;
  /// DUP; PUSHI off; ADD_DBASE; STL; BNZ L` (already reduced by the
  /// pattern pass to `PUSHI off; ADD_DBASE; DJNZ L`) into the
  /// stack-resident `DJNZ_FAST` form.
  pub fn nu_convert_djnz(&mut self, irl: &mut NuList, labels: &mut NuLabelPool) -> u32 {
    self.nu_scan(irl, labels);
    let mut changes = 0;
    let mut i = 2;
    while i < irl.ir.len() {
      if irl.ir[i].op == NuOp::Djnz
        && irl.ir[i - 1].op == NuOp::AddDbase
        && irl.ir[i - 2].op == NuOp::PushI
      {
        let offset = irl.ir[i - 2].val;
        let Some(target) = irl.ir[i].label else { i += 1; continue };
        // find the loop head label
        let mut head = None;
        for j in (0..i).rev() {
          if irl.ir[j].op == NuOp::Label && irl.ir[j].label == Some(target) {
            head = Some(j);
            break;
          }
        }
        let Some(head) = head else { i += 1; continue };
        if self.no_djnz_conflict(irl, labels, head, i, offset) {
          // load the counter once before the loop...
          let mut pre = vec![NuIr::new(NuOp::PushI), NuIr::new(NuOp::AddDbase),
                             NuIr::new(NuOp::LdL)];
          pre[0].val = offset;
          irl.ir.splice(head..head, pre);
          let i2 = i + 3;
          // ...keep it on the stack in the loop...
          irl.ir[i2].op = NuOp::DjnzFast;
          irl.ir.drain(i2 - 2..i2);
          // ...and store it back after
          let mut post = vec![NuIr::new(NuOp::PushI), NuIr::new(NuOp::AddDbase),
                              NuIr::new(NuOp::StL)];
          post[0].val = offset;
          let after = i2 - 2 + 1;
          irl.ir.splice(after..after, post);
          changes += 1;
          self.nu_scan(irl, labels);
        }
      }
      i += 1;
    }
    changes
  }

  /// Sweep labels that nothing references.
  pub fn nu_remove_unused_labels(&mut self, irl: &mut NuList) -> u32 {
    let used: Vec<_> = irl.ir.iter()
      .filter(|ir| ir.op != NuOp::Label)
      .filter_map(|ir| ir.label)
      .collect();
    let before = irl.ir.len();
    let mut first = true;
    irl.ir.retain(|ir| {
      if ir.op != NuOp::Label { return true }
      if first {
        // the entry label stays even when only the call table knows it
        first = false;
        return true;
      }
      ir.label.is_none_or(|l| used.contains(&l))
    });
    (before - irl.ir.len()) as u32
  }

  /// Run the whole Nu optimisation stack to a fixed point.
  pub fn nu_optimize(&mut self, irl: &mut NuList, labels: &mut NuLabelPool) {
    loop {
      let mut changes = 0;
      changes += self.nu_optimize_peephole(irl);
      changes += self.nu_remove_dup_drop(irl);
      if self.options.optimize.contains(crate::OptimizeFlags::DEADCODE) {
        changes += self.nu_remove_dead_code(irl);
      }
      changes += self.nu_convert_djnz(irl, labels);
      changes += self.nu_remove_unused_labels(irl);
      if changes == 0 { break }
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::{Compiler, Options};

  fn session() -> Compiler {
    let mut c = Compiler::new(Options::default());
    c.diag.capture();
    c
  }

  fn list(ops: &[(NuOp, i32)]) -> NuList {
    let mut irl = NuList::new();
    for &(op, v) in ops {
      irl.emit(op).val = v;
    }
    irl
  }

  fn ops(irl: &NuList) -> Vec<(NuOp, i32)> {
    irl.ir.iter().map(|i| (i.op, i.val)).collect()
  }

  #[test]
  fn dup_drop_vanishes() {
    let mut c = session();
    let mut irl = list(&[(NuOp::Dup, 0), (NuOp::Drop, 0)]);
    assert_eq!(c.nu_optimize_peephole(&mut irl), 1);
    assert!(irl.ir.is_empty());
  }

  #[test]
  fn sign_extend_fuses() {
    let mut c = session();
    let mut irl = list(&[(NuOp::LdW, 0), (NuOp::PushI, 15), (NuOp::SignX, 0)]);
    c.nu_optimize_peephole(&mut irl);
    assert_eq!(ops(&irl), vec![(NuOp::LdWs, 0)]);
    // and doing it again to an LDWS is still just LDWS
    let mut irl = list(&[(NuOp::LdWs, 0), (NuOp::PushI, 15), (NuOp::SignX, 0)]);
    c.nu_optimize_peephole(&mut irl);
    assert_eq!(ops(&irl), vec![(NuOp::LdWs, 0)]);
  }

  #[test]
  fn inc_dec_double() {
    let mut c = session();
    let mut irl = list(&[(NuOp::PushI, 1), (NuOp::Sub, 0)]);
    c.nu_optimize_peephole(&mut irl);
    assert_eq!(ops(&irl), vec![(NuOp::Dec, 0)]);
    let mut irl = list(&[(NuOp::Dup, 0), (NuOp::Add, 0)]);
    c.nu_optimize_peephole(&mut irl);
    assert_eq!(ops(&irl), vec![(NuOp::Double, 0)]);
  }

  #[test]
  fn cb_invert_through_bra() {
    let mut c = session();
    let mut labels = NuLabelPool::new();
    let l = labels.create();
    let m_ = labels.create();
    let mut irl = NuList::new();
    irl.emit_branch(NuOp::CbLts, l);
    irl.emit_branch(NuOp::Bra, m_);
    irl.emit_label(l);
    c.nu_optimize_peephole(&mut irl);
    assert_eq!(irl.ir.len(), 2);
    assert_eq!(irl.ir[0].op, NuOp::CbGes, "condition inverted");
    assert_eq!(irl.ir[0].label, Some(m_), "branches to the BRA target");
    assert_eq!(irl.ir[1].op, NuOp::Label);
  }

  #[test]
  fn swap_cb_reverses() {
    let mut c = session();
    let mut labels = NuLabelPool::new();
    let l = labels.create();
    let mut irl = NuList::new();
    irl.emit(NuOp::Swap);
    irl.emit_branch(NuOp::CbLeu, l);
    c.nu_optimize_peephole(&mut irl);
    assert_eq!(irl.ir.len(), 1);
    assert_eq!(irl.ir[0].op, NuOp::CbGeu);
  }

  #[test]
  fn pushi0_cbne_is_bnz() {
    let mut c = session();
    let mut labels = NuLabelPool::new();
    let l = labels.create();
    let mut irl = NuList::new();
    irl.emit_const(0);
    irl.emit_branch(NuOp::CbNe, l);
    c.nu_optimize_peephole(&mut irl);
    assert_eq!(irl.ir.len(), 1);
    assert_eq!(irl.ir[0].op, NuOp::Bnz);
    assert_eq!(irl.ir[0].label, Some(l));
  }

  #[test]
  fn store_load_keeps_copy() {
    let mut c = session();
    let mut irl = list(&[
      (NuOp::PushI, 8), (NuOp::AddDbase, 0), (NuOp::StL, 0),
      (NuOp::PushI, 8), (NuOp::AddDbase, 0), (NuOp::LdL, 0),
    ]);
    c.nu_optimize_peephole(&mut irl);
    assert_eq!(ops(&irl), vec![
      (NuOp::Dup, 0), (NuOp::PushI, 8), (NuOp::AddDbase, 0), (NuOp::StL, 0),
    ]);
  }

  #[test]
  fn store_load_different_slots_untouched() {
    let mut c = session();
    let orig = [
      (NuOp::PushI, 8), (NuOp::AddDbase, 0), (NuOp::StL, 0),
      (NuOp::PushI, 12), (NuOp::AddDbase, 0), (NuOp::LdL, 0),
    ];
    let mut irl = list(&orig);
    c.nu_optimize_peephole(&mut irl);
    assert_eq!(ops(&irl), orig.to_vec());
  }

  #[test]
  fn dead_code_sweep_protects_jump_tables() {
    let mut c = session();
    let mut labels = NuLabelPool::new();
    let l = labels.create();
    let mut irl = NuList::new();
    irl.emit(NuOp::JmpRel);
    irl.emit_branch(NuOp::Bra3, l);
    irl.emit_branch(NuOp::Bra3, l);
    irl.emit(NuOp::Ret);
    irl.emit(NuOp::PushI).val = 42; // dead
    irl.emit_label(l);
    irl.emit(NuOp::PushI).val = 7;
    c.nu_remove_dead_code(&mut irl);
    let got: Vec<NuOp> = irl.ir.iter().map(|i| i.op).collect();
    assert_eq!(got, vec![NuOp::JmpRel, NuOp::Bra3, NuOp::Bra3, NuOp::Ret,
                         NuOp::Label, NuOp::PushI],
               "jump table survives, dead PUSHI does not");
  }

  #[test]
  fn optimizer_reaches_fixed_point() {
    let mut c = session();
    let mut labels = NuLabelPool::new();
    let mut irl = list(&[
      (NuOp::PushI, 5), (NuOp::Dup, 0), (NuOp::Drop, 0),
      (NuOp::PushI, 1), (NuOp::Add, 0),
    ]);
    c.nu_optimize(&mut irl, &mut labels);
    let snapshot = ops(&irl);
    // running again changes nothing
    c.nu_optimize(&mut irl, &mut labels);
    assert_eq!(ops(&irl), snapshot);
    assert_eq!(snapshot, vec![(NuOp::PushI, 5), (NuOp::Inc, 0)]);
  }

  #[test]
  fn djnz_fast_conversion() {
    let mut c = session();
    let mut labels = NuLabelPool::new();
    let top = labels.create();
    let mut irl = NuList::new();
    // head label, loop body (a harmless push/drop), counter tail
    irl.emit_label(top);
    irl.emit_const(0);
    irl.emit(NuOp::Drop);
    irl.emit_const(8);
    irl.emit(NuOp::AddDbase);
    irl.emit_branch(NuOp::Djnz, top);
    let n = c.nu_convert_djnz(&mut irl, &mut labels);
    assert_eq!(n, 1);
    let got: Vec<NuOp> = irl.ir.iter().map(|i| i.op).collect();
    // counter loaded before the loop, kept on stack, stored after
    assert_eq!(got, vec![
      NuOp::PushI, NuOp::AddDbase, NuOp::LdL,
      NuOp::Label, NuOp::PushI, NuOp::Drop,
      NuOp::DjnzFast,
      NuOp::PushI, NuOp::AddDbase, NuOp::StL,
    ]);
  }
}
