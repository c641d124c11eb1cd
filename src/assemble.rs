// assemble.rs - Builds the graph automaton from the postfix instruction
// stream.
//
// Atomic instructions push a one-node chunk's loose ends onto a stack;
// binary operators pop two and push one; grouping instructions pop one,
// collapse and prune the popped sub-graph, and wrap it under a group node.
// Referential instructions record their binding intent into pending-link
// tables that a post-link pass resolves once every capture exists.

use std::collections::HashMap;

use log::debug;

use crate::charclass::{CharClass, ClassSet, ClassSymbol};
use crate::chunk::{push_unique, ChunkId, Graph, InRef, NodeRef, OutRef};
use crate::error::CompileError;
use crate::instr::{Instr, Opcode};
use crate::node::{CapId, CaptureDef, CaptureKind, GroupBody, Node, NodeKind};

type AResult<T> = Result<T, CompileError>;

/// The compiled automaton: the graph plus every table the matcher needs.
#[derive(Debug)]
pub struct Program {
    pub graph: Graph,
    pub classes: ClassSet,
    /// Every capture record, numbered groups and defined-only subroutines
    /// alike.
    pub caps: Vec<CaptureDef>,
    /// Declaration-ordered numbered groups; external index N is
    /// `numbered[N - 1]`.
    pub numbered: Vec<CapId>,
    /// Records owned by `(?(DEFINE)...)` blocks, reset before every match.
    pub defined: Vec<CapId>,
    pub names: HashMap<String, CapId>,
    /// Maximum values for the repeat tickers, in creation order.
    pub ticker_maxes: Vec<i32>,
    /// Number of recursion/subroutine depth counters.
    pub depth_slots: usize,
    pub starts: Vec<InRef>,
    pub ends: Vec<OutRef>,
    /// The pattern opens with an anchor; the first step must not advance.
    pub leading_anchor: bool,
    /// The pattern closes with an anchor; one grace step runs at end of
    /// input.
    pub trailing_anchor: bool,
}

impl Program {
    pub fn node(&self, r: NodeRef) -> Option<&Node> {
        self.graph.node(r)
    }

    pub fn ghost_in(&self, r: InRef) -> Option<&crate::chunk::GhostIn> {
        self.graph.ghost_in(r)
    }

    pub fn ghost_out(&self, r: OutRef) -> Option<&crate::chunk::GhostOut> {
        self.graph.ghost_out(r)
    }
}

/// Working value tracking which chunks, entry ghosts, and exit ghosts
/// participate in an in-progress construction.
#[derive(Clone, Debug, Default)]
pub struct LooseEnds {
    pub chunks: Vec<ChunkId>,
    pub ins: Vec<InRef>,
    pub outs: Vec<OutRef>,
}

impl LooseEnds {
    fn of_chunk(graph: &Graph, id: ChunkId) -> LooseEnds {
        let chunk = match graph.chunk(id) {
            Some(c) => c,
            None => return LooseEnds::default(),
        };
        LooseEnds {
            chunks: vec![id],
            ins: (0..chunk.ins.len())
                .map(|i| InRef { chunk: id, index: i as u32 })
                .collect(),
            outs: (0..chunk.outs.len())
                .map(|i| OutRef { chunk: id, index: i as u32 })
                .collect(),
        }
    }
}

/// Referential nodes waiting for their post-link binding. Collapse clones
/// nodes, so entries are re-keyed onto the surviving clone as it goes.
#[derive(Default)]
struct PendingLinks {
    backs_numbered: HashMap<NodeRef, usize>,
    backs_named: HashMap<NodeRef, String>,
    subs_numbered: HashMap<NodeRef, usize>,
    subs_named: HashMap<NodeRef, String>,
    recursions: Vec<NodeRef>,
    caps_numbered: HashMap<NodeRef, usize>,
    caps_named: HashMap<NodeRef, String>,
}

impl PendingLinks {
    fn refit(&mut self, old: NodeRef, new: NodeRef, kind: &NodeKind) {
        match kind {
            NodeKind::Backref { .. } => {
                if let Some(v) = self.backs_numbered.remove(&old) {
                    self.backs_numbered.entry(new).or_insert(v);
                } else if let Some(v) = self.backs_named.remove(&old) {
                    self.backs_named.entry(new).or_insert(v);
                }
            }
            NodeKind::Subroutine { .. } => {
                if let Some(v) = self.subs_numbered.remove(&old) {
                    self.subs_numbered.entry(new).or_insert(v);
                } else if let Some(v) = self.subs_named.remove(&old) {
                    self.subs_named.entry(new).or_insert(v);
                }
            }
            NodeKind::Recursion { .. } => {
                if let Some(ind) = self.recursions.iter().position(|&r| r == old) {
                    self.recursions[ind] = new;
                } else {
                    push_unique(&mut self.recursions, new);
                }
            }
            NodeKind::Capture { .. } => {
                if let Some(v) = self.caps_numbered.remove(&old) {
                    self.caps_numbered.entry(new).or_insert(v);
                } else if let Some(v) = self.caps_named.remove(&old) {
                    self.caps_named.entry(new).or_insert(v);
                }
            }
            _ => {}
        }
    }
}

/// "a|b": union of both sides' chunks, entries, and exits. This leaves the
/// graph in NFA form; the next collapse de-duplicates it.
fn alternate(lhs: LooseEnds, rhs: LooseEnds) -> LooseEnds {
    let mut chunks = lhs.chunks;
    for c in rhs.chunks {
        push_unique(&mut chunks, c);
    }
    let mut ins = lhs.ins;
    for i in rhs.ins {
        push_unique(&mut ins, i);
    }
    let mut outs = lhs.outs;
    for o in rhs.outs {
        push_unique(&mut outs, o);
    }
    LooseEnds { chunks, ins, outs }
}

struct Assembler {
    graph: Graph,
    classes: ClassSet,
    caps: Vec<CaptureDef>,
    numbered: Vec<CapId>,
    defined: Vec<CapId>,
    names: HashMap<String, CapId>,
    ticker_maxes: Vec<i32>,
    depth_slots: usize,
    stack: Vec<LooseEnds>,
    pend: PendingLinks,
    leading_anchor: bool,
    trailing_anchor: bool,
}

fn parse_index(arg: &str) -> AResult<usize> {
    arg.parse().map_err(|_| CompileError::MalformedStream)
}

fn parse_flag(arg: &str) -> bool {
    arg == "t"
}

fn arg(instr: &Instr, ind: usize) -> AResult<&str> {
    instr.args.get(ind).map(String::as_str).ok_or(CompileError::MalformedStream)
}

fn first_char(arg: &str) -> AResult<char> {
    arg.chars().next().ok_or(CompileError::MalformedStream)
}

/// Assembles an instruction stream into a complete automaton.
pub fn assemble(instrs: &[Instr]) -> AResult<Program> {
    let mut asm = Assembler {
        graph: Graph::new(),
        classes: ClassSet::default(),
        caps: Vec::new(),
        numbered: Vec::new(),
        defined: Vec::new(),
        names: HashMap::new(),
        ticker_maxes: Vec::new(),
        depth_slots: 0,
        stack: Vec::new(),
        pend: PendingLinks::default(),
        leading_anchor: false,
        trailing_anchor: false,
    };

    for (ind, instr) in instrs.iter().enumerate() {
        asm.dispatch(instr, ind, instrs.len())?;
    }

    if asm.stack.is_empty() {
        return Err(CompileError::EmptyPattern);
    }

    asm.post_link()?;

    let first = asm.stack.swap_remove(0);
    let final_ends = asm.collapse(first)?;
    asm.prune(&final_ends);

    for rec in asm.pend.recursions.clone() {
        if let Some(node) = asm.graph.node_mut(rec) {
            if let Some(body) = node.body_mut() {
                body.ins = final_ends.ins.clone();
                body.outs = final_ends.outs.clone();
            }
        }
    }

    debug!(
        "assembled {} live chunks, {} captures, {} tickers",
        asm.graph.live_chunk_count(),
        asm.caps.len(),
        asm.ticker_maxes.len()
    );

    Ok(Program {
        graph: asm.graph,
        classes: asm.classes,
        caps: asm.caps,
        numbered: asm.numbered,
        defined: asm.defined,
        names: asm.names,
        ticker_maxes: asm.ticker_maxes,
        depth_slots: asm.depth_slots,
        starts: final_ends.ins,
        ends: final_ends.outs,
        leading_anchor: asm.leading_anchor,
        trailing_anchor: asm.trailing_anchor,
    })
}

impl Assembler {
    fn pop(&mut self) -> AResult<LooseEnds> {
        self.stack.pop().ok_or(CompileError::MalformedStream)
    }

    fn push_wrapped(&mut self, node: Node) -> NodeRef {
        let (id, node_ref) = self.graph.wrap_node(node);
        self.stack.push(LooseEnds::of_chunk(&self.graph, id));
        node_ref
    }

    fn class_arg(&self, instr: &Instr, ind: usize) -> AResult<usize> {
        let class = parse_index(arg(instr, ind)?)?;
        if class >= self.classes.classes.len() {
            return Err(CompileError::MalformedStream);
        }
        Ok(class)
    }

    fn make_capture(&mut self, instr: &Instr, kind: CaptureKind) -> AResult<()> {
        let manual = parse_flag(arg(instr, 0)?);
        self.caps.push(CaptureDef { kind, manual, initial: None });
        let id = self.caps.len() - 1;
        self.numbered.push(id);
        for name in instr.args.iter().skip(1) {
            self.names.entry(name.clone()).or_insert(id);
        }
        Ok(())
    }

    fn dispatch(&mut self, instr: &Instr, ind: usize, total: usize) -> AResult<()> {
        match instr.op {
            Opcode::MakeCapture => self.make_capture(instr, CaptureKind::Single)?,
            Opcode::MakeCaptureCollection => self.make_capture(instr, CaptureKind::Collection)?,

            Opcode::MakeClassSymbol => {
                let lo = first_char(arg(instr, 0)?)?;
                let hi = first_char(arg(instr, 1)?)?;
                self.classes.symbols.push(ClassSymbol::range(lo, hi));
            }
            Opcode::MakeClassLigatureSymbol => {
                let mut chars = Vec::with_capacity(instr.args.len());
                for piece in &instr.args {
                    chars.push(first_char(piece)?);
                }
                self.classes.symbols.push(ClassSymbol::ligature(&chars));
            }
            Opcode::MakeLiteralClass => {
                let negate = parse_flag(arg(instr, 0)?);
                let fold_case = parse_flag(arg(instr, 1)?);
                let mut symbols = Vec::new();
                for piece in instr.args.iter().skip(2) {
                    let sym = parse_index(piece)?;
                    if sym >= self.classes.symbols.len() {
                        return Err(CompileError::MalformedStream);
                    }
                    symbols.push(sym);
                }
                self.classes.classes.push(CharClass::Literal { symbols, negate, fold_case });
            }
            Opcode::MakeUnionClass => {
                let lhs = self.class_arg(instr, 0)?;
                let rhs = self.class_arg(instr, 1)?;
                self.classes.classes.push(CharClass::Union { lhs, rhs });
            }
            Opcode::MakeSubtractClass => {
                let lhs = self.class_arg(instr, 0)?;
                let rhs = self.class_arg(instr, 1)?;
                self.classes.classes.push(CharClass::Subtract { lhs, rhs });
            }
            Opcode::MakeIntersectClass => {
                let lhs = self.class_arg(instr, 0)?;
                let rhs = self.class_arg(instr, 1)?;
                self.classes.classes.push(CharClass::Intersect { lhs, rhs });
            }

            Opcode::Literal => {
                let mut classes = Vec::with_capacity(instr.args.len());
                for piece in &instr.args {
                    let class = parse_index(piece)?;
                    if class >= self.classes.classes.len() {
                        return Err(CompileError::MalformedStream);
                    }
                    classes.push(class);
                }
                let id = self.graph.literal_chunk(classes);
                self.stack.push(LooseEnds::of_chunk(&self.graph, id));
            }

            Opcode::StartCheck => {
                let exclusive = parse_flag(arg(instr, 0)?);
                let at_last_match = parse_flag(arg(instr, 1)?);
                let line = self.class_arg(instr, 2)?;
                self.push_wrapped(Node::new(
                    NodeKind::StartAnchor { exclusive, at_last_match },
                    vec![line],
                ));
                self.leading_anchor = true;
            }
            Opcode::EndCheck => {
                let exclusive = parse_flag(arg(instr, 0)?);
                let before_final_break = parse_flag(arg(instr, 1)?);
                let line = self.class_arg(instr, 2)?;
                self.push_wrapped(Node::new(
                    NodeKind::EndAnchor { exclusive, before_final_break },
                    vec![line],
                ));
                self.trailing_anchor = true;
            }
            Opcode::WordBoundary => {
                let negated = parse_flag(arg(instr, 0)?);
                let word = self.class_arg(instr, 1)?;
                self.push_wrapped(Node::new(NodeKind::WordBoundary { negated }, vec![word]));
                if ind + 2 >= total {
                    self.trailing_anchor = true;
                }
            }

            Opcode::BackrefNumbered => {
                let num = parse_index(arg(instr, 0)?)?;
                let name = arg(instr, 0)?.to_string();
                let node_ref =
                    self.push_wrapped(Node::new(NodeKind::Backref { name, target: None }, vec![]));
                self.pend.backs_numbered.insert(node_ref, num);
            }
            Opcode::BackrefNamed => {
                let name = arg(instr, 0)?.to_string();
                let node_ref = self.push_wrapped(Node::new(
                    NodeKind::Backref { name: name.clone(), target: None },
                    vec![],
                ));
                self.pend.backs_named.insert(node_ref, name);
            }

            Opcode::SubroutineNumbered => {
                let num = parse_index(arg(instr, 0)?)?;
                let max_depth = parse_index(arg(instr, 1)?)? as u32;
                let slot = self.depth_slots;
                self.depth_slots += 1;
                let node_ref = self.push_wrapped(Node::new(
                    NodeKind::Subroutine {
                        name: arg(instr, 0)?.to_string(),
                        target: None,
                        max_depth,
                        slot,
                    },
                    vec![],
                ));
                self.pend.subs_numbered.insert(node_ref, num);
            }
            Opcode::SubroutineNamed => {
                let name = arg(instr, 0)?.to_string();
                let max_depth = parse_index(arg(instr, 1)?)? as u32;
                let slot = self.depth_slots;
                self.depth_slots += 1;
                let node_ref = self.push_wrapped(Node::new(
                    NodeKind::Subroutine { name: name.clone(), target: None, max_depth, slot },
                    vec![],
                ));
                self.pend.subs_named.insert(node_ref, name);
            }

            Opcode::Recursion => {
                let max_depth = parse_index(arg(instr, 0)?)? as u32;
                let lazy = parse_flag(arg(instr, 1)?);
                let slot = self.depth_slots;
                self.depth_slots += 1;
                let node_ref = self.push_wrapped(Node::new(
                    NodeKind::Recursion { max_depth, slot, body: GroupBody::empty(lazy) },
                    vec![],
                ));
                push_unique(&mut self.pend.recursions, node_ref);
            }

            Opcode::CaptureGroupNumbered | Opcode::CaptureGroupNamed => {
                let name = arg(instr, 0)?.to_string();
                let lazy = parse_flag(arg(instr, 1)?);
                let popped = self.pop()?;
                let node = Node::new(
                    NodeKind::Capture {
                        name: name.clone(),
                        target: None,
                        body: GroupBody::empty(lazy),
                    },
                    vec![],
                );
                let (ends, node_ref) = self.assemble_group(popped, node)?;
                if instr.op == Opcode::CaptureGroupNumbered {
                    self.pend.caps_numbered.insert(node_ref, parse_index(&name)?);
                } else {
                    self.pend.caps_named.insert(node_ref, name);
                }
                self.stack.push(ends);
            }

            Opcode::NonCaptureGroup => {
                let lazy = parse_flag(arg(instr, 0)?);
                let popped = self.pop()?;
                let node = Node::new(NodeKind::Group(GroupBody::empty(lazy)), vec![]);
                let (ends, _) = self.assemble_group(popped, node)?;
                self.stack.push(ends);
            }

            Opcode::LookAhead | Opcode::LookBehind => {
                let negated = parse_flag(arg(instr, 0)?);
                let lazy = parse_flag(arg(instr, 1)?);
                let popped = self.pop()?;
                let body = GroupBody::empty(lazy);
                let kind = if instr.op == Opcode::LookAhead {
                    NodeKind::LookAhead { negated, body }
                } else {
                    NodeKind::LookBehind { negated, body }
                };
                let (ends, _) = self.assemble_group(popped, Node::new(kind, vec![]))?;
                self.stack.push(ends);
            }

            Opcode::DefineAsSubroutine => {
                let name = arg(instr, 0)?.to_string();
                let popped = self.pop()?;
                let initial = popped
                    .chunks
                    .first()
                    .map(|&c| NodeRef { chunk: c, index: 0 });
                self.caps.push(CaptureDef {
                    kind: CaptureKind::Single,
                    manual: false,
                    initial,
                });
                let id = self.caps.len() - 1;
                self.defined.push(id);
                self.names.insert(name, id);
            }

            Opcode::CodeHook => {
                let name = arg(instr, 0)?.to_string();
                self.push_wrapped(Node::new(NodeKind::CodeHook { name }, vec![]));
            }

            Opcode::Conditional => {
                let branches = arg(instr, 0)?;
                let lazy = parse_flag(arg(instr, 1)?);
                let else_arm = if branches == "2" {
                    let popped = self.pop()?;
                    Some(*popped.chunks.first().ok_or(CompileError::MalformedStream)?)
                } else {
                    None
                };
                let then_popped = self.pop()?;
                let then_arm =
                    *then_popped.chunks.first().ok_or(CompileError::MalformedStream)?;
                let cond_popped = self.pop()?;
                let cond = *cond_popped.chunks.first().ok_or(CompileError::MalformedStream)?;
                self.push_wrapped(Node::new(
                    NodeKind::Conditional { cond, then_arm, else_arm, lazy },
                    vec![],
                ));
            }

            Opcode::NoneOrOnce | Opcode::NoneOrOnceLazy => {
                let lazy = instr.op == Opcode::NoneOrOnceLazy;
                let popped = self.pop()?;
                let ends = self.occur_none_or_more(popped, true, lazy)?;
                self.stack.push(ends);
            }
            Opcode::NoneOrMore | Opcode::NoneOrMoreLazy => {
                let lazy = instr.op == Opcode::NoneOrMoreLazy;
                let popped = self.pop()?;
                let ends = self.occur_none_or_more(popped, false, lazy)?;
                self.stack.push(ends);
            }
            Opcode::OncePlus | Opcode::OncePlusLazy => {
                let lazy = instr.op == Opcode::OncePlusLazy;
                let popped = self.pop()?;
                let ends = self.occur_once_plus(popped, lazy)?;
                self.stack.push(ends);
            }

            Opcode::Repeat | Opcode::RepeatLazy => {
                let lazy = instr.op == Opcode::RepeatLazy;
                let kind = arg(instr, 0)?;
                let min = parse_index(arg(instr, 1)?)? as i32;
                let max = parse_index(arg(instr, 2)?)? as i32;
                let popped = self.pop()?;
                let ends = match kind {
                    "Exact" => self.repeat_exact(popped, min, lazy)?,
                    "Min" => self.repeat_min(popped, min, lazy)?,
                    "MinMax" => self.repeat_min_max(popped, min, max, lazy)?,
                    _ => return Err(CompileError::InvalidRepeat),
                };
                self.stack.push(ends);
            }

            Opcode::Concat => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let joined = self.concat(lhs, rhs);
                self.stack.push(joined);
            }
            Opcode::Alternate => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.stack.push(alternate(lhs, rhs));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Construction operations
    // ========================================================================

    /// "ab": wire every left exit ghost into every right entry ghost; the
    /// joined loose ends run from the left entries to the right exits.
    fn concat(&mut self, lhs: LooseEnds, rhs: LooseEnds) -> LooseEnds {
        for &out_ref in &lhs.outs {
            if let Some(out) = self.graph.ghost_out_mut(out_ref) {
                for &in_ref in &rhs.ins {
                    push_unique(&mut out.nexts, in_ref);
                }
            }
        }

        let mut chunks = lhs.chunks;
        for c in rhs.chunks {
            push_unique(&mut chunks, c);
        }
        LooseEnds { chunks, ins: lhs.ins, outs: rhs.outs }
    }

    /// Collapses and prunes the popped sub-graph, hands it to `node` as its
    /// body, and wraps `node` in a fresh one-node chunk.
    fn assemble_group(&mut self, ends: LooseEnds, mut node: Node) -> AResult<(LooseEnds, NodeRef)> {
        let collapsed = self.collapse(ends)?;
        self.prune(&collapsed);

        if let Some(body) = node.body_mut() {
            body.chunks = collapsed.chunks.clone();
            body.ins = collapsed.ins.clone();
            body.outs = collapsed.outs.clone();
        }

        let (id, node_ref) = self.graph.wrap_node(node);
        Ok((LooseEnds::of_chunk(&self.graph, id), node_ref))
    }

    /// Wraps several group nodes around one shared body, collapsing only
    /// once. Used by the two-loop repeat constructions.
    fn assemble_groups(
        &mut self,
        ends: LooseEnds,
        nodes: Vec<Node>,
    ) -> AResult<Vec<LooseEnds>> {
        let collapsed = self.collapse(ends)?;
        self.prune(&collapsed);

        let mut out = Vec::with_capacity(nodes.len());
        for mut node in nodes {
            if let Some(body) = node.body_mut() {
                body.chunks = collapsed.chunks.clone();
                body.ins = collapsed.ins.clone();
                body.outs = collapsed.outs.clone();
            }
            let (id, _) = self.graph.wrap_node(node);
            out.push(LooseEnds::of_chunk(&self.graph, id));
        }
        Ok(out)
    }

    /// "a?" and "a*".
    fn occur_none_or_more(
        &mut self,
        ends: LooseEnds,
        once: bool,
        lazy: bool,
    ) -> AResult<LooseEnds> {
        let node = Node::new(
            NodeKind::NoneOrMore { once, lazy, body: GroupBody::empty(false) },
            vec![],
        );
        Ok(self.assemble_group(ends, node)?.0)
    }

    /// "a+".
    fn occur_once_plus(&mut self, ends: LooseEnds, lazy: bool) -> AResult<LooseEnds> {
        let node = Node::new(
            NodeKind::Loop { ticker: None, lazy, body: GroupBody::empty(false) },
            vec![],
        );
        Ok(self.assemble_group(ends, node)?.0)
    }

    /// "a{N}": one loop with a mandatory ticker.
    fn repeat_exact(&mut self, ends: LooseEnds, times: i32, lazy: bool) -> AResult<LooseEnds> {
        if times < 2 {
            return Ok(ends);
        }
        self.ticker_maxes.push(times);
        let ticker = self.ticker_maxes.len() - 1;
        let node = Node::new(
            NodeKind::Loop { ticker: Some(ticker), lazy, body: GroupBody::empty(false) },
            vec![],
        );
        Ok(self.assemble_group(ends, node)?.0)
    }

    /// "a{N,}": a mandatory loop for the first N-1 visits, concatenated with
    /// an unbounded loop that supplies the rest.
    fn repeat_min(&mut self, ends: LooseEnds, min: i32, lazy: bool) -> AResult<LooseEnds> {
        if min < 2 {
            return self.occur_once_plus(ends, lazy);
        }

        self.ticker_maxes.push(min - 1);
        let ticker = self.ticker_maxes.len() - 1;
        let mandatory = Node::new(
            NodeKind::Loop { ticker: Some(ticker), lazy: false, body: GroupBody::empty(false) },
            vec![],
        );
        let open = Node::new(
            NodeKind::Loop { ticker: None, lazy, body: GroupBody::empty(false) },
            vec![],
        );

        let mut sides = self.assemble_groups(ends, vec![mandatory, open])?;
        let rhs = sides.pop().ok_or(CompileError::MalformedStream)?;
        let lhs = sides.pop().ok_or(CompileError::MalformedStream)?;
        Ok(self.concat(lhs, rhs))
    }

    /// "a{N,M}": a mandatory loop for the first N-1 visits concatenated
    /// with a permissive loop for the remaining M-(N-1).
    fn repeat_min_max(
        &mut self,
        ends: LooseEnds,
        min: i32,
        max: i32,
        lazy: bool,
    ) -> AResult<LooseEnds> {
        let lo = min.min(max);
        let hi = min.max(max);
        if lo == hi {
            return self.repeat_exact(ends, lo, lazy);
        }

        self.ticker_maxes.push(lo - 1);
        let mandatory_ticker = self.ticker_maxes.len() - 1;
        self.ticker_maxes.push((lo - 1) - hi);
        let permissive_ticker = self.ticker_maxes.len() - 1;

        let mandatory = Node::new(
            NodeKind::Loop {
                ticker: Some(mandatory_ticker),
                lazy: false,
                body: GroupBody::empty(false),
            },
            vec![],
        );
        let permissive = Node::new(
            NodeKind::Loop {
                ticker: Some(permissive_ticker),
                lazy,
                body: GroupBody::empty(false),
            },
            vec![],
        );

        let mut sides = self.assemble_groups(ends, vec![mandatory, permissive])?;
        let rhs = sides.pop().ok_or(CompileError::MalformedStream)?;
        let lhs = sides.pop().ok_or(CompileError::MalformedStream)?;
        Ok(self.concat(lhs, rhs))
    }

    // ========================================================================
    // Collapse
    // ========================================================================

    /// Rebuilds the sub-graph behind `ends` as one fresh chunk, merging
    /// language-equivalent sibling nodes and unifying ghost connectors.
    /// Consumed chunks are dropped from the arena; the result exposes a
    /// single entry ghost-in and a single exit ghost-out.
    fn collapse(&mut self, ends: LooseEnds) -> AResult<LooseEnds> {
        let new_id = self.graph.reserve_chunk();

        // The chunk under construction: edges stay empty while the phases
        // run over "pending" lists of references into the old graph, then a
        // rewire pass installs the recorded index maps.
        let mut nodes: Vec<Node> = Vec::new();
        let mut ins_pending: Vec<Vec<NodeRef>> = Vec::new();
        let mut outs_pending: Vec<Vec<InRef>> = Vec::new();
        let mut node_pending: Vec<Vec<OutRef>> = Vec::new();

        let mut ins_to_inds: Vec<Vec<usize>> = Vec::new();
        let mut nodes_to_inds: Vec<Vec<usize>> = Vec::new();
        let mut outs_to_inds: Vec<Vec<usize>> = Vec::new();

        // phase zero: one merged entry ghost-in
        let mut entry: Vec<NodeRef> = Vec::new();
        for &in_ref in &ends.ins {
            if let Some(ghost) = self.graph.ghost_in(in_ref) {
                for &next in &ghost.nexts {
                    push_unique(&mut entry, next);
                }
            }
        }
        ins_pending.push(entry);
        ins_to_inds.push(Vec::new());

        let mut end_ind: Option<usize> = None;
        let mut curr_ins: Vec<usize> = vec![0];

        while !curr_ins.is_empty() {
            // collapse ins: clone (or merge into) the real successors of
            // every frontier ghost-in
            let mut curr_nodes: Vec<usize> = Vec::new();
            for &ii in curr_ins.iter() {
                let pending = std::mem::take(&mut ins_pending[ii]);
                let mut segged: Vec<usize> = Vec::new();
                for old_ref in pending {
                    let Some(old) = self.graph.node(old_ref) else { continue };

                    let mut found: Option<usize> = None;
                    for &ci in &segged {
                        if old.similar_to(&nodes[ci]) {
                            found = Some(ci);
                            break;
                        }
                    }
                    let fi = match found {
                        Some(fi) => fi,
                        None => {
                            nodes.push(old.clone_unwired());
                            node_pending.push(Vec::new());
                            nodes_to_inds.push(Vec::new());
                            nodes.len() - 1
                        }
                    };
                    let new_ref = NodeRef { chunk: new_id, index: fi as u32 };
                    let kind = nodes[fi].kind.clone();
                    self.pend.refit(old_ref, new_ref, &kind);

                    let old_ghosts: Vec<OutRef> =
                        self.graph.node(old_ref).map(|n| n.ghost_nexts.to_vec()).unwrap_or_default();
                    for g in old_ghosts {
                        push_unique(&mut node_pending[fi], g);
                    }

                    push_unique(&mut ins_to_inds[ii], fi);
                    push_unique(&mut curr_nodes, fi);
                    push_unique(&mut segged, fi);
                }
            }

            // collapse nodes: route every node's old ghost-outs into either
            // the single end ghost-out or one constructed ghost-out
            let mut curr_outs: Vec<usize> = Vec::new();
            for &ni in curr_nodes.iter() {
                let pending = std::mem::take(&mut node_pending[ni]);
                let mut constructed: Option<usize> = None;
                for old_out in pending {
                    let fi = if ends.outs.contains(&old_out) {
                        *end_ind.get_or_insert_with(|| {
                            outs_pending.push(Vec::new());
                            outs_to_inds.push(Vec::new());
                            outs_pending.len() - 1
                        })
                    } else {
                        *constructed.get_or_insert_with(|| {
                            outs_pending.push(Vec::new());
                            outs_to_inds.push(Vec::new());
                            outs_pending.len() - 1
                        })
                    };

                    if let Some(ghost) = self.graph.ghost_out(old_out) {
                        for &target in &ghost.nexts {
                            push_unique(&mut outs_pending[fi], target);
                        }
                    }
                    push_unique(&mut nodes_to_inds[ni], fi);
                    push_unique(&mut curr_outs, fi);
                }
            }

            // collapse outs: each constructed ghost-out funnels its targets
            // into one fresh ghost-in, forming the next frontier
            curr_ins.clear();
            for &oi in curr_outs.iter() {
                let pending = std::mem::take(&mut outs_pending[oi]);
                let mut constructed: Option<usize> = None;
                for old_in in pending {
                    let fi = *constructed.get_or_insert_with(|| {
                        ins_pending.push(Vec::new());
                        ins_to_inds.push(Vec::new());
                        ins_pending.len() - 1
                    });
                    if let Some(ghost) = self.graph.ghost_in(old_in) {
                        for &target in &ghost.nexts {
                            push_unique(&mut ins_pending[fi], target);
                        }
                    }
                    push_unique(&mut outs_to_inds[oi], fi);
                    push_unique(&mut curr_ins, fi);
                }
            }
        }

        let end_ind = match end_ind {
            Some(e) => e,
            None => {
                outs_pending.push(Vec::new());
                outs_to_inds.push(Vec::new());
                outs_pending.len() - 1
            }
        };

        // rewire through the recorded index maps
        let mut chunk = crate::chunk::Chunk {
            nodes,
            ins: (0..ins_pending.len()).map(|_| crate::chunk::GhostIn::default()).collect(),
            outs: (0..outs_pending.len()).map(|_| crate::chunk::GhostOut::default()).collect(),
        };
        for (ii, inds) in ins_to_inds.iter().enumerate() {
            for &ni in inds {
                chunk.ins[ii].nexts.push(NodeRef { chunk: new_id, index: ni as u32 });
            }
        }
        for (ni, inds) in nodes_to_inds.iter().enumerate() {
            for &oi in inds {
                chunk.nodes[ni]
                    .ghost_nexts
                    .push(OutRef { chunk: new_id, index: oi as u32 });
            }
        }
        for (oi, inds) in outs_to_inds.iter().enumerate() {
            for &ii in inds {
                chunk.outs[oi].nexts.push(InRef { chunk: new_id, index: ii as u32 });
            }
        }

        self.graph.set_chunk(new_id, chunk);

        for old in ends.chunks {
            if old != new_id {
                self.graph.remove_chunk(old);
            }
        }

        Ok(LooseEnds {
            chunks: vec![new_id],
            ins: vec![InRef { chunk: new_id, index: 0 }],
            outs: vec![OutRef { chunk: new_id, index: end_ind as u32 }],
        })
    }

    // ========================================================================
    // Prune
    // ========================================================================

    /// Short-circuits intermediary ghost hops: every ghost-out that is not
    /// part of the boundary is bypassed by direct real edges and severed.
    /// The ghost records stay in their chunks, unreachable, so live typed
    /// indices keep their meaning.
    fn prune(&mut self, ends: &LooseEnds) {
        let mut currs: Vec<NodeRef> = Vec::new();
        for &in_ref in &ends.ins {
            if let Some(ghost) = self.graph.ghost_in(in_ref) {
                for &next in &ghost.nexts {
                    push_unique(&mut currs, next);
                }
            }
        }

        while !currs.is_empty() {
            let mut frontier: Vec<NodeRef> = Vec::new();
            for &node_ref in &currs {
                let ghost_list: Vec<OutRef> = match self.graph.node(node_ref) {
                    Some(n) => n.ghost_nexts.to_vec(),
                    None => continue,
                };

                let mut through: Vec<NodeRef> = Vec::new();
                let mut kept: Vec<OutRef> = Vec::new();
                for out_ref in ghost_list {
                    let targets: Vec<InRef> = self
                        .graph
                        .ghost_out(out_ref)
                        .map(|g| g.nexts.clone())
                        .unwrap_or_default();
                    for in_ref in targets {
                        if let Some(ghost) = self.graph.ghost_in(in_ref) {
                            for &next in &ghost.nexts {
                                push_unique(&mut through, next);
                            }
                        }
                    }
                    if ends.outs.contains(&out_ref) {
                        kept.push(out_ref);
                    }
                }

                if let Some(node) = self.graph.node_mut(node_ref) {
                    for &t in &through {
                        crate::chunk::push_unique_small(&mut node.nexts, t);
                    }
                    node.ghost_nexts = kept.into_iter().collect();
                }
                for t in through {
                    push_unique(&mut frontier, t);
                }
            }
            currs = frontier;
        }
    }

    // ========================================================================
    // Post-link
    // ========================================================================

    /// Binds referential nodes to their capture records, validates that
    /// every numbered or named target exists, and arranges the subroutine
    /// reset fallback.
    fn post_link(&mut self) -> AResult<()> {
        for (&node_ref, &num) in &self.pend.backs_numbered {
            if num < 1 || num > self.numbered.len() {
                return Err(CompileError::UnknownGroup(num.to_string()));
            }
            let cap = self.numbered[num - 1];
            if let Some(NodeKind::Backref { target, .. }) =
                self.graph.node_mut(node_ref).map(|n| &mut n.kind)
            {
                *target = Some(cap);
            }
        }

        let named_backs: Vec<(NodeRef, String)> = self
            .pend
            .backs_named
            .iter()
            .map(|(&r, n)| (r, n.clone()))
            .collect();
        for (node_ref, name) in named_backs {
            let cap = *self
                .names
                .get(&name)
                .ok_or_else(|| CompileError::UnknownGroup(name.clone()))?;
            if let Some(NodeKind::Backref { target, .. }) =
                self.graph.node_mut(node_ref).map(|n| &mut n.kind)
            {
                *target = Some(cap);
            }
        }

        let numbered_subs: Vec<(NodeRef, usize)> =
            self.pend.subs_numbered.iter().map(|(&r, &n)| (r, n)).collect();
        for (node_ref, num) in numbered_subs {
            if num < 1 || num > self.numbered.len() {
                return Err(CompileError::UnknownGroup(num.to_string()));
            }
            let cap = self.numbered[num - 1];
            self.bind_subroutine(node_ref, cap);
        }

        let named_subs: Vec<(NodeRef, String)> = self
            .pend
            .subs_named
            .iter()
            .map(|(&r, n)| (r, n.clone()))
            .collect();
        for (node_ref, name) in named_subs {
            let cap = *self
                .names
                .get(&name)
                .ok_or_else(|| CompileError::UnknownGroup(name.clone()))?;
            self.bind_subroutine(node_ref, cap);
        }

        for (&node_ref, &num) in &self.pend.caps_numbered {
            if num < 1 || num > self.numbered.len() {
                return Err(CompileError::UnknownGroup(num.to_string()));
            }
            let cap = self.numbered[num - 1];
            if let Some(NodeKind::Capture { target, .. }) =
                self.graph.node_mut(node_ref).map(|n| &mut n.kind)
            {
                *target = Some(cap);
            }
        }

        let named_caps: Vec<(NodeRef, String)> = self
            .pend
            .caps_named
            .iter()
            .map(|(&r, n)| (r, n.clone()))
            .collect();
        for (node_ref, name) in named_caps {
            let cap = *self
                .names
                .get(&name)
                .ok_or_else(|| CompileError::UnknownGroup(name.clone()))?;
            if let Some(NodeKind::Capture { target, .. }) =
                self.graph.node_mut(node_ref).map(|n| &mut n.kind)
            {
                *target = Some(cap);
            }
        }

        Ok(())
    }

    fn bind_subroutine(&mut self, node_ref: NodeRef, cap: CapId) {
        let mut bound = false;
        if let Some(NodeKind::Subroutine { target, .. }) =
            self.graph.node_mut(node_ref).map(|n| &mut n.kind)
        {
            *target = Some(cap);
            bound = true;
        }
        // a capture that nothing else seeds falls back to the call site, so
        // a reset lands the call back on itself
        if bound && self.caps[cap].initial.is_none() {
            self.caps[cap].initial = Some(node_ref);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::translate;

    fn program(pattern: &str) -> Program {
        assemble(&translate(pattern, 100).unwrap()).unwrap()
    }

    #[test]
    fn literal_automaton_shape() {
        let prog = program("a");
        assert_eq!(prog.starts.len(), 1);
        assert_eq!(prog.ends.len(), 1);
        assert!(prog.numbered.is_empty());
        assert!(!prog.leading_anchor);
        assert!(!prog.trailing_anchor);
    }

    #[test]
    fn empty_stream_is_rejected() {
        assert!(matches!(assemble(&[]), Err(CompileError::EmptyPattern)));
    }

    #[test]
    fn anchors_set_flags() {
        let prog = program("^a$");
        assert!(prog.leading_anchor);
        assert!(prog.trailing_anchor);
    }

    #[test]
    fn trailing_word_boundary_sets_flag() {
        let prog = program(r"a\b");
        assert!(prog.trailing_anchor);
        let prog = program(r"\ba");
        assert!(!prog.trailing_anchor);
    }

    #[test]
    fn captures_register_in_order() {
        let prog = program("(a)(?<x>b)");
        assert_eq!(prog.numbered.len(), 2);
        assert_eq!(prog.names.get("x"), Some(&prog.numbered[1]));
    }

    #[test]
    fn alternation_collapse_merges_identical_branches() {
        // both branches start with the same class, so the collapsed start
        // set exposes a single literal node
        let prog = program("ab|ac");
        let mut starters = 0;
        for &in_ref in &prog.starts {
            starters += prog.graph.ghost_in(in_ref).map(|g| g.nexts.len()).unwrap_or(0);
        }
        assert_eq!(starters, 1);
    }

    #[test]
    fn alternation_distinct_branches_stay_separate() {
        let prog = program("ab|cd");
        let mut starters = 0;
        for &in_ref in &prog.starts {
            starters += prog.graph.ghost_in(in_ref).map(|g| g.nexts.len()).unwrap_or(0);
        }
        assert_eq!(starters, 2);
    }

    #[test]
    fn backref_out_of_range_is_error() {
        let err = assemble(&translate(r"(a)\3", 100).unwrap());
        assert!(matches!(err, Err(CompileError::UnknownGroup(_))));
    }

    #[test]
    fn named_backref_unknown_is_error() {
        let err = assemble(&translate(r"(a)\k<missing>", 100).unwrap());
        assert!(matches!(err, Err(CompileError::UnknownGroup(_))));
    }

    #[test]
    fn repeats_allocate_tickers() {
        let prog = program("a{3}");
        assert_eq!(prog.ticker_maxes, vec![3]);

        let prog = program("a{2,5}");
        assert_eq!(prog.ticker_maxes, vec![1, -4]);

        let prog = program("a{2,}");
        assert_eq!(prog.ticker_maxes, vec![1]);
    }

    #[test]
    fn degenerate_repeats_skip_tickers() {
        // a{1} is just a; a{1,} is a+
        assert!(program("a{1}").ticker_maxes.is_empty());
        assert!(program("a{1,}").ticker_maxes.is_empty());
    }

    #[test]
    fn define_registers_without_numbering() {
        let prog = program("(?(DEFINE)(?<w>ab))x");
        assert!(prog.numbered.is_empty());
        assert_eq!(prog.defined.len(), 1);
        assert!(prog.names.contains_key("w"));
        let def = &prog.caps[prog.defined[0]];
        assert!(def.initial.is_some());
    }

    #[test]
    fn recursion_binds_to_final_ends() {
        let prog = program("(a(?R)?b)");
        let mut found = false;
        for id in 0..prog.graph.chunk_count() as u32 {
            let Some(chunk) = prog.graph.chunk(crate::chunk::ChunkId(id)) else { break };
            for node in &chunk.nodes {
                if let NodeKind::Recursion { body, .. } = &node.kind {
                    assert_eq!(body.ins, prog.starts);
                    assert_eq!(body.outs, prog.ends);
                    found = true;
                }
            }
        }
        assert!(found, "recursion node not present in the final graph");
    }

    #[test]
    fn depth_slots_counted() {
        let prog = program(r"(a)\g<1>(?R)");
        assert_eq!(prog.depth_slots, 2);
    }
}
