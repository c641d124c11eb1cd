// exec.rs - Graph traversal against input text.
//
// The compiled graph stays immutable during matching; everything a match
// mutates (captures, tickers, depth counters, the last-match-end position,
// runtime errors) lives in `MatchState`, borrowed exclusively for the
// duration of a match. `can_enter` is the per-node entry test - it may move
// the cursor, and the shared step loops advance one position after every
// accepted node, which is why zero-width variants step the cursor back to
// stay transparent.

use std::collections::HashMap;

use crate::assemble::Program;
use crate::chunk::{push_unique, InRef, NodeRef, OutRef};
use crate::cursor::Cursor;
use crate::error::RuntimeError;
use crate::node::{CaptureSlot, NodeKind, Ticker};

/// User callback behind a `(?{name})` node. The function may advance the
/// cursor; the step loop compensates for its own advance either way.
pub type HookFn = Box<dyn Fn(&mut Cursor<'_>)>;
pub type HookMap = HashMap<String, HookFn>;

/// Everything a single match mutates.
#[derive(Debug)]
pub struct MatchState {
    pub caps: Vec<CaptureSlot>,
    pub tickers: Vec<Ticker>,
    pub depths: Vec<u32>,
    /// Offset of the final character of the previous find-all match; the
    /// `\G` gate accepts positions one past it.
    pub last_match_end: Option<isize>,
    pub runtime_errors: Vec<RuntimeError>,
    /// Nodes currently inside a ceding walk; re-entry is refused so two
    /// adjacent optional quantifiers cannot bounce control forever.
    ceding: Vec<NodeRef>,
    /// (node, position) pairs that already handed control to a taker. A
    /// repeat visit refuses entry, letting the step loop reach the taker
    /// instead of re-picking the quantifier without progress.
    ceded_at: Vec<(NodeRef, isize)>,
}

impl MatchState {
    pub fn new(prog: &Program) -> MatchState {
        let mut caps = Vec::with_capacity(prog.caps.len());
        for def in &prog.caps {
            let mut slot = CaptureSlot::default();
            slot.last = def.initial;
            caps.push(slot);
        }
        MatchState {
            caps,
            tickers: prog.ticker_maxes.iter().map(|&m| Ticker::new(m)).collect(),
            depths: vec![0; prog.depth_slots],
            last_match_end: None,
            runtime_errors: Vec::new(),
            ceding: Vec::new(),
            ceded_at: Vec::new(),
        }
    }

    /// Restores the pre-match baseline: tickers to their maxima, non-manual
    /// captures cleared, depth counters zeroed (an aborted match may have
    /// left some mid-flight).
    fn reset_pre_match(&mut self, prog: &Program) {
        for ticker in &mut self.tickers {
            ticker.reset();
        }
        for (id, def) in prog.caps.iter().enumerate() {
            if !def.manual {
                self.caps[id].reset(def.initial);
            }
        }
        for depth in &mut self.depths {
            *depth = 0;
        }
        self.ceding.clear();
        self.ceded_at.clear();
    }
}

pub struct ExecCtx<'p> {
    pub prog: &'p Program,
    pub state: &'p mut MatchState,
    pub hooks: &'p HookMap,
}

/// The text a group consumed: `[start, end]` inclusive of the end position
/// unless the walk came back zero-width.
fn span_text(start: Cursor<'_>, end: Cursor<'_>) -> String {
    let mut out = String::new();
    let mut it = start;
    while it < end {
        if let Some(c) = it.get() {
            out.push(c);
        }
        it.advance();
    }
    if !end.is_end() && end >= start {
        if let Some(c) = end.get() {
            out.push(c);
        }
    }
    out
}

/// All entry and exit connectors of one chunk, for conditional arms.
fn chunk_boundary(prog: &Program, id: crate::chunk::ChunkId) -> (Vec<InRef>, Vec<OutRef>) {
    match prog.graph.chunk(id) {
        Some(chunk) => (
            (0..chunk.ins.len()).map(|i| InRef { chunk: id, index: i as u32 }).collect(),
            (0..chunk.outs.len()).map(|i| OutRef { chunk: id, index: i as u32 }).collect(),
        ),
        None => (Vec::new(), Vec::new()),
    }
}

impl<'p> ExecCtx<'p> {
    fn ghost_in_nexts(&self, in_ref: InRef) -> Vec<NodeRef> {
        self.prog.ghost_in(in_ref).map(|g| g.nexts.clone()).unwrap_or_default()
    }

    /// A ghost-out reaches real nodes through its outgoing ghost-ins.
    fn ghost_out_nexts(&self, out_ref: OutRef) -> Vec<NodeRef> {
        let mut out = Vec::new();
        if let Some(ghost) = self.prog.ghost_out(out_ref) {
            for &in_ref in &ghost.nexts {
                for next in self.ghost_in_nexts(in_ref) {
                    push_unique(&mut out, next);
                }
            }
        }
        out
    }

    fn base_nexts(&self, nr: NodeRef) -> Vec<NodeRef> {
        let mut out = Vec::new();
        if let Some(node) = self.prog.node(nr) {
            for &next in &node.nexts {
                push_unique(&mut out, next);
            }
            for &ghost in &node.ghost_nexts {
                for next in self.ghost_out_nexts(ghost) {
                    push_unique(&mut out, next);
                }
            }
        }
        out
    }

    /// Real successor candidates, in the order the step loop should try
    /// them. Self-looping variants place their self-edge first when greedy
    /// and last when lazy; a loop whose mandatory ticker still has visits
    /// left admits only itself.
    pub fn node_nexts(&self, nr: NodeRef) -> Vec<NodeRef> {
        let Some(node) = self.prog.node(nr) else { return Vec::new() };
        match &node.kind {
            NodeKind::NoneOrMore { once, lazy, .. } => {
                let mut nexts = self.base_nexts(nr);
                if !*once && !nexts.contains(&nr) {
                    if *lazy {
                        nexts.push(nr);
                    } else {
                        nexts.insert(0, nr);
                    }
                }
                nexts
            }
            NodeKind::Loop { ticker, lazy, .. } => {
                if let Some(t) = *ticker {
                    let tk = self.state.tickers[t];
                    if tk.is_mandatory() && !tk.is_exhausted() {
                        return vec![nr];
                    }
                }
                let mut nexts = self.base_nexts(nr);
                if !nexts.contains(&nr) {
                    if *lazy {
                        nexts.push(nr);
                    } else {
                        nexts.insert(0, nr);
                    }
                }
                nexts
            }
            _ => self.base_nexts(nr),
        }
    }

    fn ghosts_intersect(&self, nr: NodeRef, outs: &[OutRef]) -> bool {
        self.prog
            .node(nr)
            .map(|n| n.ghost_nexts.iter().any(|g| outs.contains(g)))
            .unwrap_or(false)
    }

    /// The inner walk shared by every group-like node and the top level:
    /// repeatedly enter the first willing candidate, harvest its successor
    /// set, and advance (or retreat, for look-behind). A lazy walk returns
    /// at the first boundary hit; a greedy walk remembers the last one and
    /// restores it when no further progress is possible.
    fn match_body<'t>(
        &mut self,
        ins: &[InRef],
        outs: &[OutRef],
        lazy: bool,
        input: &Cursor<'t>,
        outers: &[NodeRef],
        reverse: bool,
    ) -> Result<Option<Cursor<'t>>, RuntimeError> {
        let mut out_end = *input;

        let mut candidates: Vec<NodeRef> = Vec::new();
        for &in_ref in ins {
            for next in self.ghost_in_nexts(in_ref) {
                push_unique(&mut candidates, next);
            }
        }

        let mut curr: Option<NodeRef> = None;
        let mut last_match = out_end;
        while !candidates.is_empty()
            && !(if reverse { out_end.is_pre_begin() } else { out_end.is_end() })
        {
            let mut found = None;
            for &cand in &candidates {
                if self.can_enter(cand, &mut out_end, outers)? {
                    found = Some(cand);
                    break;
                }
            }
            let Some(found) = found else { break };

            curr = Some(found);
            candidates = self.node_nexts(found);

            if self.ghosts_intersect(found, outs) {
                if lazy {
                    return Ok(Some(out_end));
                }
                last_match = out_end;
            }

            if reverse {
                out_end.retreat();
            } else {
                out_end.advance();
            }
        }

        if reverse {
            out_end.advance();
        } else {
            out_end.retreat();
        }

        if let Some(curr) = curr {
            if self.ghosts_intersect(curr, outs) {
                return Ok(Some(out_end));
            }
        }

        if last_match != *input {
            return Ok(Some(last_match));
        }
        Ok(None)
    }

    /// Consumes the target capture's recorded text at the cursor. On
    /// success the cursor lands on the final matched character (one step
    /// back for an empty capture, neutralizing the outer advance).
    fn enter_capture_text(&mut self, cap: usize, input: &mut Cursor<'_>) -> bool {
        if !self.state.caps[cap].succeeded {
            return false;
        }
        let text = self.state.caps[cap].text(self.prog.caps[cap].kind).to_owned();
        let mut copy = *input;
        for ch in text.chars() {
            if copy.is_end() || copy.get() != Some(ch) {
                return false;
            }
            copy.advance();
        }
        copy.retreat();
        *input = copy;
        true
    }

    /// Quantifier ceding: walks up the outer stack, outermost last, looking
    /// for any successor other than `me` willing to take the current
    /// position. A taker steps the cursor back to neutralize the step
    /// loop's advance.
    fn try_any_takers<'t>(
        &mut self,
        me: NodeRef,
        input: &mut Cursor<'t>,
        outers: &[NodeRef],
    ) -> Result<bool, RuntimeError> {
        if self.state.ceding.contains(&me) {
            return Ok(false);
        }
        self.state.ceding.push(me);
        let result = self.try_any_takers_inner(me, input, outers);
        self.state.ceding.retain(|&r| r != me);
        result
    }

    fn try_any_takers_inner<'t>(
        &mut self,
        me: NodeRef,
        input: &mut Cursor<'t>,
        outers: &[NodeRef],
    ) -> Result<bool, RuntimeError> {
        let mut final_copy = *input;
        let mut cands: Vec<NodeRef> = outers.to_vec();
        cands.push(me);

        for ind in (0..cands.len()).rev() {
            let nexts = self.node_nexts(cands[ind]);
            for next in nexts {
                if next == me {
                    continue;
                }
                if self.can_enter(next, &mut final_copy, &cands)? {
                    input.retreat();
                    return Ok(true);
                }
                final_copy = *input;
            }
        }
        Ok(false)
    }

    /// Per-variant entry test. May move `input`; the caller's step loop
    /// advances once more after a success.
    fn can_enter<'t>(
        &mut self,
        nr: NodeRef,
        input: &mut Cursor<'t>,
        outers: &[NodeRef],
    ) -> Result<bool, RuntimeError> {
        let prog = self.prog;
        let Some(node) = prog.node(nr) else { return Ok(false) };

        match &node.kind {
            NodeKind::Literal => {
                for &class in &node.classes {
                    if !prog.classes.matches(class, input) {
                        return Ok(false);
                    }
                }
                Ok(true)
            }

            NodeKind::StartAnchor { exclusive, at_last_match } => {
                if *exclusive && *at_last_match {
                    if input.is_begin() {
                        return Ok(true);
                    }
                    let mut prev = *input;
                    prev.retreat();
                    return Ok(self.state.last_match_end == Some(prev.pos()));
                }
                if input.is_begin() {
                    return Ok(true);
                }
                if !*exclusive {
                    if let Some(&line) = node.classes.first() {
                        let mut prev = *input;
                        prev.retreat();
                        return Ok(prog.classes.matches(line, &mut prev));
                    }
                }
                Ok(false)
            }

            NodeKind::EndAnchor { exclusive, before_final_break } => {
                let line = node.classes.first().copied();
                let line_at = |at: Cursor<'_>| -> bool {
                    match line {
                        Some(class) => {
                            let mut probe = at;
                            prog.classes.matches(class, &mut probe)
                        }
                        None => false,
                    }
                };

                let mut success = false;
                let mut true_end = input.clone_at_end();
                if *before_final_break {
                    while true_end != *input {
                        true_end.retreat();
                        if !line_at(true_end) {
                            true_end.advance();
                            break;
                        }
                    }
                    if true_end == *input && line_at(true_end) {
                        success = true;
                    }
                }
                if !success {
                    success = *input == true_end || (!*exclusive && line_at(*input));
                }
                Ok(success)
            }

            NodeKind::WordBoundary { negated } => {
                let word = node.classes.first().copied();
                let word_at = |at: Cursor<'_>| -> bool {
                    match word {
                        Some(class) => {
                            let mut probe = at;
                            prog.classes.matches(class, &mut probe)
                        }
                        None => false,
                    }
                };

                let mut one_past = *input;
                one_past.advance();
                let edge = input.is_begin() || input.is_end() || one_past.is_end();
                let success = if edge {
                    if input.is_begin() {
                        input.retreat();
                    }
                    true
                } else {
                    let mut prev = *input;
                    prev.retreat();
                    let around = word_at(prev) || word_at(one_past);
                    if word_at(*input) {
                        !around
                    } else {
                        around
                    }
                };
                Ok(success != *negated)
            }

            NodeKind::Backref { target, .. } => {
                let Some(cap) = *target else { return Ok(false) };
                Ok(self.enter_capture_text(cap, input))
            }

            NodeKind::Group(body) => {
                let mut ap = outers.to_vec();
                ap.push(nr);
                match self.match_body(&body.ins, &body.outs, body.lazy, input, &ap, false)? {
                    Some(end) => {
                        *input = end;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }

            NodeKind::Capture { target, body, .. } => {
                let Some(cap) = *target else { return Ok(false) };
                self.state.caps[cap].succeeded = false;

                let mut ap = outers.to_vec();
                ap.push(nr);
                match self.match_body(&body.ins, &body.outs, body.lazy, input, &ap, false)? {
                    Some(end) => {
                        let text = span_text(*input, end);
                        let kind = prog.caps[cap].kind;
                        self.state.caps[cap].set(kind, text, false);
                        self.state.caps[cap].last = Some(nr);
                        if end < *input {
                            input.retreat();
                        } else {
                            *input = end;
                        }
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }

            NodeKind::LookAhead { negated, body } => {
                let found = self
                    .match_body(&body.ins, &body.outs, body.lazy, input, &[], false)?
                    .is_some();
                Ok(found != *negated)
            }

            NodeKind::LookBehind { negated, body } => {
                let mut back = *input;
                back.retreat();
                let found = self
                    .match_body(&body.ins, &body.outs, body.lazy, &back, &[], true)?
                    .is_some();
                let success = found != *negated;
                if success {
                    input.retreat();
                }
                Ok(success)
            }

            NodeKind::NoneOrMore { lazy, body, .. } => {
                let at = input.pos();
                if self.state.ceded_at.contains(&(nr, at)) {
                    return Ok(false);
                }
                let mut ap = outers.to_vec();
                ap.push(nr);
                if *lazy {
                    if self.try_any_takers(nr, input, outers)? {
                        self.state.ceded_at.push((nr, at));
                    } else if let Some(end) =
                        self.match_body(&body.ins, &body.outs, false, input, &ap, false)?
                    {
                        *input = end;
                    }
                } else {
                    match self.match_body(&body.ins, &body.outs, false, input, &ap, false)? {
                        Some(end) => *input = end,
                        None => {
                            if self.try_any_takers(nr, input, outers)? {
                                self.state.ceded_at.push((nr, at));
                            }
                        }
                    }
                }
                Ok(true)
            }

            NodeKind::Loop { ticker, body, .. } => {
                if let Some(t) = *ticker {
                    if self.state.tickers[t].is_exhausted() {
                        return Ok(false);
                    }
                }
                let mut ap = outers.to_vec();
                ap.push(nr);
                match self.match_body(&body.ins, &body.outs, false, input, &ap, false)? {
                    Some(end) => {
                        if let Some(t) = *ticker {
                            self.state.tickers[t].tick();
                        }
                        *input = end;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }

            NodeKind::Recursion { max_depth, slot, body } => {
                let kept = self.state.depths[*slot];
                if kept >= *max_depth {
                    return Err(RuntimeError::DepthExceeded);
                }
                self.state.depths[*slot] = kept + 1;
                let mut ap = outers.to_vec();
                ap.push(nr);
                let result =
                    self.match_body(&body.ins, &body.outs, body.lazy, input, &ap, false);
                self.state.depths[*slot] = kept;
                match result? {
                    Some(end) => {
                        *input = end;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }

            NodeKind::Subroutine { target, max_depth, slot, .. } => {
                let Some(cap) = *target else { return Ok(false) };
                // a capture that already succeeded this match is consumed as
                // its recorded text; an unseeded one (a DEFINE body, or a
                // call ahead of the group) re-enters the group pattern
                if self.state.caps[cap].succeeded {
                    return Ok(self.enter_capture_text(cap, input));
                }
                let Some(entry) = self.state.caps[cap].last.or(prog.caps[cap].initial) else {
                    return Ok(false);
                };
                let kept = self.state.depths[*slot];
                if kept >= *max_depth {
                    return Err(RuntimeError::DepthExceeded);
                }
                self.state.depths[*slot] = kept + 1;
                let result = self.can_enter(entry, input, outers);
                self.state.depths[*slot] = kept;
                result
            }

            NodeKind::Conditional { cond, then_arm, else_arm, lazy } => {
                // a lone back-reference condition branches on the capture's
                // success flag without consuming input; anything else is
                // matched as a sub-pattern
                let mut cap_flag: Option<bool> = None;
                if let Some(chunk) = prog.graph.chunk(*cond) {
                    if chunk.nodes.len() == 1 {
                        if let NodeKind::Backref { target, .. } = &chunk.nodes[0].kind {
                            cap_flag = Some(
                                target.map(|c| self.state.caps[c].succeeded).unwrap_or(false),
                            );
                        }
                    }
                }

                let mut ap = outers.to_vec();
                ap.push(nr);

                let taken = match cap_flag {
                    Some(flag) => flag,
                    None => {
                        let (ins, outs) = chunk_boundary(prog, *cond);
                        self.match_body(&ins, &outs, *lazy, input, &ap, false)?.is_some()
                    }
                };

                let arm = if taken { Some(*then_arm) } else { *else_arm };
                let Some(arm) = arm else { return Ok(false) };
                let (ins, outs) = chunk_boundary(prog, arm);
                match self.match_body(&ins, &outs, *lazy, input, &ap, false)? {
                    Some(end) => {
                        *input = end;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }

            NodeKind::CodeHook { name } => {
                if let Some(hook) = self.hooks.get(name) {
                    hook(input);
                }
                input.retreat();
                Ok(true)
            }
        }
    }
}

/// The top-level step loop. Returns the cursor past the last consumed
/// position when the walk ended on a node whose ghost-outs reach the end
/// set. A leading anchor suppresses the very first advance; a trailing
/// anchor grants one grace step at end of input.
fn step_loop<'t>(ctx: &mut ExecCtx<'_>, mut iter: Cursor<'t>) -> Option<Cursor<'t>> {
    let prog = ctx.prog;

    let mut candidates: Vec<NodeRef> = Vec::new();
    for &in_ref in &prog.starts {
        for next in ctx.ghost_in_nexts(in_ref) {
            push_unique(&mut candidates, next);
        }
    }

    let mut first_time = true;
    let mut last_time = prog.trailing_anchor;
    let mut curr: Option<NodeRef> = None;

    while !candidates.is_empty() && (!iter.is_end() || last_time) {
        let mut found = None;
        for &cand in &candidates {
            match ctx.can_enter(cand, &mut iter, &[]) {
                Ok(true) => {
                    found = Some(cand);
                    break;
                }
                Ok(false) => {}
                Err(err) => {
                    ctx.state.runtime_errors.push(err);
                    return None;
                }
            }
        }
        let Some(found) = found else { break };

        curr = Some(found);
        candidates = ctx.node_nexts(found);

        if prog.leading_anchor && first_time {
            first_time = false;
        } else if !iter.is_end() {
            iter.advance();
        } else if last_time {
            last_time = false;
        }
    }

    let curr = curr?;
    if ctx.ghosts_intersect(curr, &prog.ends) {
        Some(iter)
    } else {
        None
    }
}

/// Whole-text match from the beginning.
pub fn run_match(prog: &Program, state: &mut MatchState, hooks: &HookMap, text: &[char]) -> bool {
    state.runtime_errors.clear();
    state.reset_pre_match(prog);
    let mut ctx = ExecCtx { prog, state, hooks };
    step_loop(&mut ctx, Cursor::new(text)).is_some()
}

/// Match from `offset`; on success returns the matched substring.
pub fn run_match_from(
    prog: &Program,
    state: &mut MatchState,
    hooks: &HookMap,
    text: &[char],
    offset: usize,
) -> Option<String> {
    state.runtime_errors.clear();
    state.reset_pre_match(prog);
    let mut ctx = ExecCtx { prog, state, hooks };
    let end = step_loop(&mut ctx, Cursor::at(text, offset as isize))?;

    let lo = offset.min(text.len());
    let hi = end.pos().clamp(lo as isize, text.len() as isize) as usize;
    Some(text[lo..hi].iter().collect())
}

/// Repeated non-overlapping find-next across the whole text. Each success
/// records its final character's offset as the new last-match-end; a
/// zero-width success is kept but ends the scan.
pub fn run_match_all(
    prog: &Program,
    state: &mut MatchState,
    hooks: &HookMap,
    text: &[char],
) -> Vec<String> {
    let mut found = Vec::new();
    let mut at = 0usize;
    while at < text.len() {
        match run_match_from(prog, state, hooks, text, at) {
            Some(sub) => {
                let len = sub.chars().count();
                found.push(sub);
                if len == 0 {
                    break;
                }
                at += len;
                state.last_match_end = Some(at as isize - 1);
            }
            None => at += 1,
        }
    }
    found
}
