// chunk.rs - Chunks of nodes, ghost connectors, and the graph arena.
//
// A chunk owns a run of nodes plus the ghost-in/ghost-out connectors that
// form its boundary. Chunks are spliced together through ghost edges and
// progressively consumed by collapse; the automaton addresses everything
// through typed (chunk, index) references, so cycles are plain data.

use smallvec::SmallVec;

use crate::charclass::ClassId;
use crate::node::{Node, NodeKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub chunk: ChunkId,
    pub index: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InRef {
    pub chunk: ChunkId,
    pub index: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutRef {
    pub chunk: ChunkId,
    pub index: u32,
}

/// Zero-width entry connector: points at real nodes inside some chunk.
#[derive(Clone, Debug, Default)]
pub struct GhostIn {
    pub nexts: Vec<NodeRef>,
}

/// Zero-width exit connector: points at ghost-ins, possibly across chunks.
#[derive(Clone, Debug, Default)]
pub struct GhostOut {
    pub nexts: Vec<InRef>,
}

#[derive(Clone, Debug, Default)]
pub struct Chunk {
    pub nodes: Vec<Node>,
    pub ins: Vec<GhostIn>,
    pub outs: Vec<GhostOut>,
}

impl Chunk {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.ins.is_empty() && self.outs.is_empty()
    }
}

/// Arena of chunks. Removal clears a chunk in place so that every live
/// typed reference keeps its meaning; references into a cleared chunk
/// simply resolve to nothing.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    chunks: Vec<Chunk>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn reserve_chunk(&mut self) -> ChunkId {
        self.chunks.push(Chunk::default());
        ChunkId(self.chunks.len() as u32 - 1)
    }

    pub fn set_chunk(&mut self, id: ChunkId, chunk: Chunk) {
        self.chunks[id.0 as usize] = chunk;
    }

    pub fn add_chunk(&mut self, chunk: Chunk) -> ChunkId {
        self.chunks.push(chunk);
        ChunkId(self.chunks.len() as u32 - 1)
    }

    pub fn remove_chunk(&mut self, id: ChunkId) {
        if let Some(chunk) = self.chunks.get_mut(id.0 as usize) {
            *chunk = Chunk::default();
        }
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(id.0 as usize)
    }

    pub fn chunk_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        self.chunks.get_mut(id.0 as usize)
    }

    pub fn node(&self, r: NodeRef) -> Option<&Node> {
        self.chunk(r.chunk)?.nodes.get(r.index as usize)
    }

    pub fn node_mut(&mut self, r: NodeRef) -> Option<&mut Node> {
        self.chunk_mut(r.chunk)?.nodes.get_mut(r.index as usize)
    }

    pub fn ghost_in(&self, r: InRef) -> Option<&GhostIn> {
        self.chunk(r.chunk)?.ins.get(r.index as usize)
    }

    pub fn ghost_in_mut(&mut self, r: InRef) -> Option<&mut GhostIn> {
        self.chunk_mut(r.chunk)?.ins.get_mut(r.index as usize)
    }

    pub fn ghost_out(&self, r: OutRef) -> Option<&GhostOut> {
        self.chunk(r.chunk)?.outs.get(r.index as usize)
    }

    pub fn ghost_out_mut(&mut self, r: OutRef) -> Option<&mut GhostOut> {
        self.chunk_mut(r.chunk)?.outs.get_mut(r.index as usize)
    }

    pub fn live_chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| !c.is_empty()).count()
    }

    /// Total chunk slots ever allocated, cleared ones included.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// One-node chunk for a literal atom: ghost-in -> node -> ghost-out.
    pub fn literal_chunk(&mut self, classes: Vec<ClassId>) -> ChunkId {
        self.wrap_node(Node::new(NodeKind::Literal, classes)).0
    }

    /// Wraps a lone node (usually a group node) as its own chunk.
    pub fn wrap_node(&mut self, node: Node) -> (ChunkId, NodeRef) {
        let id = self.reserve_chunk();
        let node_ref = NodeRef { chunk: id, index: 0 };
        let out_ref = OutRef { chunk: id, index: 0 };

        let mut node = node;
        node.ghost_nexts = SmallVec::from_slice(&[out_ref]);

        let chunk = Chunk {
            nodes: vec![node],
            ins: vec![GhostIn { nexts: vec![node_ref] }],
            outs: vec![GhostOut::default()],
        };
        self.set_chunk(id, chunk);
        (id, node_ref)
    }
}

/// Order-preserving set insert for the small edge vectors.
pub fn push_unique<T: PartialEq>(v: &mut Vec<T>, x: T) {
    if !v.contains(&x) {
        v.push(x);
    }
}

pub fn push_unique_small<T: PartialEq, const N: usize>(v: &mut SmallVec<[T; N]>, x: T)
where
    [T; N]: smallvec::Array<Item = T>,
{
    if !v.contains(&x) {
        v.push(x);
    }
}
