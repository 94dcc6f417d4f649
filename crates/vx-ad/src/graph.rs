//! The AD node graph: storage, edges, gradient accumulation, and the
//! forward/backward tape sweeps.
//!
//! Nodes are created in program order, so a backward sweep visits ids
//! descending and a forward sweep ascending; both directions reuse the
//! same reverse edges (node → operands).

use vx_core::VarType;
use vx_ir::{IrContext, IrError};

use crate::AdError;
use crate::custom::CustomOp;

/// How one node's value depends on a predecessor.
#[derive(Debug)]
pub(crate) enum Weight {
    /// Elementwise local partial derivative (owned IR handle).
    Partial(u32),
    /// Node is `gather(source, index, mask)`.
    Gather {
        index: u32,
        mask: u32,
        source_size: usize,
    },
    /// Node is `scatter(_, source, index, mask)` (the written value).
    ScatterValue { index: u32, mask: u32 },
    /// Node is `scatter(source, _, index, mask)` (the carried target).
    ScatterTarget { index: u32, mask: u32 },
    /// Structural dependency only (custom-op attachment).
    Null,
}

#[derive(Debug)]
pub(crate) struct Edge {
    pub source: u32,
    pub weight: Weight,
}

pub(crate) struct Node {
    pub refcount: u32,
    pub ty: VarType,
    pub size: usize,
    /// Accumulated gradient (owned IR handle, 0 = unset).
    pub grad: u32,
    pub edges: Vec<Edge>,
    pub custom: Option<Box<dyn CustomOp>>,
    pub custom_inputs: Vec<u32>,
    pub custom_outputs: Vec<u32>,
    /// IR handles the node keeps alive (a custom op's saved call state).
    pub held_ir: Vec<u32>,
    pub alive: bool,
}

pub(crate) struct Boundary {
    pub watermark: u32,
    pub implicit: Vec<u32>,
}

pub(crate) struct AdGraph {
    pub nodes: Vec<Node>,
    pub free: Vec<u32>,
    pub queue: Vec<u32>,
    pub boundaries: Vec<Boundary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdMode {
    Forward,
    Backward,
}

/// What a traversal clears when it finishes. `ClearNone` keeps all
/// accumulated gradients in place for the caller to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdFlag {
    ClearNone,
}

impl AdGraph {
    pub fn new() -> Self {
        Self {
            // Id 0 is the "not differentiable" sentinel.
            nodes: vec![Node {
                refcount: 0,
                ty: VarType::F64,
                size: 0,
                grad: 0,
                edges: Vec::new(),
                custom: None,
                custom_inputs: Vec::new(),
                custom_outputs: Vec::new(),
                held_ir: Vec::new(),
                alive: false,
            }],
            free: Vec::new(),
            queue: Vec::new(),
            boundaries: Vec::new(),
        }
    }

    pub fn node(&self, id: u32) -> Result<&Node, AdError> {
        match self.nodes.get(id as usize) {
            Some(node) if node.alive => Ok(node),
            _ => Err(AdError::InvalidNode(id)),
        }
    }

    pub fn node_mut(&mut self, id: u32) -> Result<&mut Node, AdError> {
        match self.nodes.get_mut(id as usize) {
            Some(node) if node.alive => Ok(node),
            _ => Err(AdError::InvalidNode(id)),
        }
    }

    pub fn alloc(&mut self, ty: VarType, size: usize, edges: Vec<Edge>) -> u32 {
        let node = Node {
            refcount: 1,
            ty,
            size,
            grad: 0,
            edges,
            custom: None,
            custom_inputs: Vec::new(),
            custom_outputs: Vec::new(),
            held_ir: Vec::new(),
            alive: true,
        };
        if let Some(reused) = self.free.pop() {
            self.nodes[reused as usize] = node;
            reused
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as u32
        }
    }

    pub fn inc_ref(&mut self, id: u32) -> Result<(), AdError> {
        self.node_mut(id)?.refcount += 1;
        Ok(())
    }

    /// Releases one reference; dead nodes release their edges (AD refs on
    /// sources, IR refs on weights) and their gradient.
    pub fn dec_ref(&mut self, id: u32, ir: &IrContext) -> Result<(), AdError> {
        let mut worklist = vec![id];
        while let Some(current) = worklist.pop() {
            let node = self.node_mut(current)?;
            debug_assert!(node.refcount > 0, "over-release of a{current}");
            node.refcount -= 1;
            if node.refcount > 0 {
                continue;
            }
            node.alive = false;
            let edges = std::mem::take(&mut node.edges);
            let custom_inputs = std::mem::take(&mut node.custom_inputs);
            let held_ir = std::mem::take(&mut node.held_ir);
            let grad = std::mem::replace(&mut node.grad, 0);
            node.custom = None;
            node.custom_outputs.clear();

            if grad != 0 {
                ir.dec_ref(grad)?;
            }
            for handle in held_ir {
                ir.dec_ref(handle)?;
            }
            for edge in edges {
                release_weight(&edge.weight, ir)?;
                worklist.push(edge.source);
            }
            worklist.extend(custom_inputs);
            self.free.push(current);
        }
        Ok(())
    }

    pub fn watermark(&self) -> u32 {
        self.nodes.len() as u32
    }
}

pub(crate) fn release_weight(weight: &Weight, ir: &IrContext) -> Result<(), IrError> {
    match weight {
        Weight::Partial(partial) => ir.dec_ref(*partial),
        Weight::Gather { index, mask, .. }
        | Weight::ScatterValue { index, mask }
        | Weight::ScatterTarget { index, mask } => {
            ir.dec_ref(*index)?;
            ir.dec_ref(*mask)
        }
        Weight::Null => Ok(()),
    }
}
