// node.rs - Typed automaton nodes, capture records, and repeat tickers.
//
// Every node carries a predicate set (character-class indices), its real
// successors, and its ghost-out successors. The behavioral differences
// between variants live in `NodeKind`; the matcher dispatches on it with
// exhaustive matches (see exec.rs), and the assembler's collapse relies on
// `similar_to` to decide which siblings may merge.

use smallvec::SmallVec;

use crate::charclass::ClassId;
use crate::chunk::{ChunkId, InRef, NodeRef, OutRef};

pub type CapId = usize;
pub type TickerId = usize;
pub type DepthSlot = usize;

/// The inner sub-automaton owned by a group-like node: the chunks it spans
/// and the ghost boundary it is entered and left through.
#[derive(Clone, Debug, Default)]
pub struct GroupBody {
    pub chunks: Vec<ChunkId>,
    pub ins: Vec<InRef>,
    pub outs: Vec<OutRef>,
    pub lazy: bool,
}

impl GroupBody {
    pub fn empty(lazy: bool) -> GroupBody {
        GroupBody { chunks: Vec::new(), ins: Vec::new(), outs: Vec::new(), lazy }
    }
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    /// A plain predicate node: `a`, `[a-z]`, `.`, a shorthand class.
    Literal,
    /// `^` / `\A` / `\G`. The predicate set holds the line-delimiter class.
    StartAnchor { exclusive: bool, at_last_match: bool },
    /// `$` / `\z` / `\Z`. The predicate set holds the line-delimiter class.
    EndAnchor { exclusive: bool, before_final_break: bool },
    /// `\b` / `\B`. The predicate set holds the word class.
    WordBoundary { negated: bool },
    /// `\N`, `\k<name>`; bound to a capture record after assembly.
    Backref { name: String, target: Option<CapId> },
    /// `(?:...)`.
    Group(GroupBody),
    /// `(...)`, `(?<name>...)`, `(?@...)`; records its match into a capture.
    Capture { name: String, target: Option<CapId>, body: GroupBody },
    LookAhead { negated: bool, body: GroupBody },
    LookBehind { negated: bool, body: GroupBody },
    /// `?` / `??` (`once`) and `*` / `*?`.
    NoneOrMore { once: bool, lazy: bool, body: GroupBody },
    /// `+`, and the ticker-driven halves of `{N}` / `{N,}` / `{N,M}`.
    Loop { ticker: Option<TickerId>, lazy: bool, body: GroupBody },
    /// `(?R)`; the body is bound to the automaton's start/end sets post-link.
    Recursion { max_depth: u32, slot: DepthSlot, body: GroupBody },
    /// `\g<name>`; re-enters the target capture's most recent group node.
    Subroutine { name: String, target: Option<CapId>, max_depth: u32, slot: DepthSlot },
    /// `(?(cond) then | else)`.
    Conditional { cond: ChunkId, then_arm: ChunkId, else_arm: Option<ChunkId>, lazy: bool },
    /// `(?{name})`; zero-width user callback.
    CodeHook { name: String },
}

#[derive(Clone, Debug)]
pub struct Node {
    /// Predicate classes; all must hold for `Literal`, and anchor-like
    /// variants keep their line/word class here. Sorted, so set equality
    /// is plain vector equality.
    pub classes: Vec<ClassId>,
    pub nexts: SmallVec<[NodeRef; 4]>,
    pub ghost_nexts: SmallVec<[OutRef; 2]>,
    pub kind: NodeKind,
}

impl Node {
    pub fn new(kind: NodeKind, mut classes: Vec<ClassId>) -> Node {
        classes.sort_unstable();
        classes.dedup();
        Node { classes, nexts: SmallVec::new(), ghost_nexts: SmallVec::new(), kind }
    }

    /// Collapse merges siblings that accept the same language step. Group
    /// variants never merge; referential variants merge only with an exact
    /// same-named twin.
    pub fn similar_to(&self, other: &Node) -> bool {
        match (&self.kind, &other.kind) {
            (NodeKind::Literal, NodeKind::Literal) => self.classes == other.classes,
            (NodeKind::WordBoundary { negated: a }, NodeKind::WordBoundary { negated: b }) => {
                a == b
            }
            (NodeKind::Backref { name: a, .. }, NodeKind::Backref { name: b, .. }) => a == b,
            (NodeKind::Subroutine { name: a, .. }, NodeKind::Subroutine { name: b, .. }) => a == b,
            (NodeKind::CodeHook { name: a }, NodeKind::CodeHook { name: b }) => a == b,
            _ => false,
        }
    }

    /// A fresh copy with the same predicates and kind but no edges; collapse
    /// re-wires edges through its index maps.
    pub fn clone_unwired(&self) -> Node {
        Node {
            classes: self.classes.clone(),
            nexts: SmallVec::new(),
            ghost_nexts: SmallVec::new(),
            kind: self.kind.clone(),
        }
    }

    pub fn body(&self) -> Option<&GroupBody> {
        match &self.kind {
            NodeKind::Group(body)
            | NodeKind::Capture { body, .. }
            | NodeKind::LookAhead { body, .. }
            | NodeKind::LookBehind { body, .. }
            | NodeKind::NoneOrMore { body, .. }
            | NodeKind::Loop { body, .. }
            | NodeKind::Recursion { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn body_mut(&mut self) -> Option<&mut GroupBody> {
        match &mut self.kind {
            NodeKind::Group(body)
            | NodeKind::Capture { body, .. }
            | NodeKind::LookAhead { body, .. }
            | NodeKind::LookBehind { body, .. }
            | NodeKind::NoneOrMore { body, .. }
            | NodeKind::Loop { body, .. }
            | NodeKind::Recursion { body, .. } => Some(body),
            _ => None,
        }
    }
}

// === Captures ===

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureKind {
    /// Overwrites on every successful visit.
    Single,
    /// Appends on every successful visit.
    Collection,
}

/// The compiled half of a capture record. The per-match half lives in
/// `exec::MatchState` as a `CaptureSlot`.
#[derive(Clone, Debug)]
pub struct CaptureDef {
    pub kind: CaptureKind,
    /// User-managed; skipped by the automatic pre-match reset.
    pub manual: bool,
    /// The node a subroutine call falls back to after a reset.
    pub initial: Option<NodeRef>,
}

#[derive(Clone, Debug, Default)]
pub struct CaptureSlot {
    pub succeeded: bool,
    pub single: String,
    pub collection: Vec<String>,
    /// The most recent group node that wrote this capture; subroutine
    /// dispatch re-enters it.
    pub last: Option<NodeRef>,
}

impl CaptureSlot {
    pub fn reset(&mut self, initial: Option<NodeRef>) {
        self.succeeded = false;
        self.single.clear();
        self.collection.clear();
        self.last = initial;
    }

    pub fn set(&mut self, kind: CaptureKind, value: String, reset: bool) {
        match kind {
            CaptureKind::Single => self.single = value,
            CaptureKind::Collection => {
                if reset {
                    self.collection.clear();
                }
                self.collection.push(value);
            }
        }
        self.succeeded = true;
    }

    /// The text a back-reference compares against. For collections this is
    /// the latest entry.
    pub fn text(&self, kind: CaptureKind) -> &str {
        match kind {
            CaptureKind::Single => &self.single,
            CaptureKind::Collection => {
                self.collection.last().map(String::as_str).unwrap_or("")
            }
        }
    }
}

// === Tickers ===

/// Bounded-repeat counter. A positive maximum means that many iterations are
/// mandatory; a negative maximum permits up to that many. Ticks move toward
/// zero from either side.
#[derive(Clone, Copy, Debug)]
pub struct Ticker {
    pub max: i32,
    pub curr: i32,
}

impl Ticker {
    pub fn new(max: i32) -> Ticker {
        Ticker { max, curr: max }
    }

    pub fn is_exhausted(&self) -> bool {
        self.curr == 0
    }

    pub fn is_mandatory(&self) -> bool {
        self.max > 0
    }

    pub fn tick(&mut self) {
        if self.max > 0 {
            self.curr -= 1;
        } else {
            self.curr += 1;
        }
    }

    pub fn reset(&mut self) {
        self.curr = self.max;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_mandatory_counts_down() {
        let mut t = Ticker::new(2);
        assert!(t.is_mandatory());
        assert!(!t.is_exhausted());
        t.tick();
        t.tick();
        assert!(t.is_exhausted());
        t.reset();
        assert!(!t.is_exhausted());
    }

    #[test]
    fn ticker_permissive_counts_up() {
        let mut t = Ticker::new(-3);
        assert!(!t.is_mandatory());
        t.tick();
        t.tick();
        t.tick();
        assert!(t.is_exhausted());
    }

    #[test]
    fn literal_similarity_is_predicate_equality() {
        let a = Node::new(NodeKind::Literal, vec![2, 1]);
        let b = Node::new(NodeKind::Literal, vec![1, 2]);
        let c = Node::new(NodeKind::Literal, vec![1]);
        assert!(a.similar_to(&b));
        assert!(!a.similar_to(&c));
    }

    #[test]
    fn groups_never_similar() {
        let a = Node::new(NodeKind::Group(GroupBody::empty(false)), vec![]);
        let b = Node::new(NodeKind::Group(GroupBody::empty(false)), vec![]);
        assert!(!a.similar_to(&b));
    }

    #[test]
    fn named_referentials_merge_by_name() {
        let a = Node::new(NodeKind::Backref { name: "w".into(), target: None }, vec![]);
        let b = Node::new(NodeKind::Backref { name: "w".into(), target: None }, vec![]);
        let c = Node::new(NodeKind::Backref { name: "x".into(), target: None }, vec![]);
        assert!(a.similar_to(&b));
        assert!(!a.similar_to(&c));
    }

    #[test]
    fn capture_slot_collection_appends() {
        let mut slot = CaptureSlot::default();
        slot.set(CaptureKind::Collection, "a".into(), false);
        slot.set(CaptureKind::Collection, "b".into(), false);
        assert_eq!(slot.collection, vec!["a", "b"]);
        assert_eq!(slot.text(CaptureKind::Collection), "b");
        slot.set(CaptureKind::Collection, "c".into(), true);
        assert_eq!(slot.collection, vec!["c"]);
        assert!(slot.succeeded);
    }
}
