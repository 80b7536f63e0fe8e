//! Triangle nodes: memory-bounded subtrees of dense position layers
//!
//! A [`TriangleNode`] owns a stack of layers. Layer 0 is a single record (the
//! node's root) and layer `k` holds the `7^k` records reached by every move
//! sequence of length `k`, stored breadth first so that the children of the
//! record at index `i` in one layer sit at indices `7*i .. 7*i + 7` of the next.
//!
//! Once a layer is mostly childless, the node holds `max_depth` layers, or the
//! next layer would not fit in the memory budget, the node stops growing and
//! instead spawns one child node per live record of its last layer. A node
//! that has started delegating keeps delegating until its last layer is done. Nodes live in a [`NodeArena`] and refer to their children by
//! [`NodeId`]; every node has exactly one parent, so ownership is a strict tree.

use log::debug;
use serde::Serialize;

use std::collections::BTreeMap;
use std::mem;

use crate::budget::WorkBudget;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::move_order;
use crate::record::{self, Player, Record, RECORD_SIZE};
use crate::{HEIGHT, WIDTH};

/// Stable handle to a node in a [`NodeArena`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// What a call to [`TriangleNode::deepen`] decided
enum DeepenStep {
    /// A new empty layer was appended, the node must be generated again
    Densified,
    /// Records of the last layer (index, position) that need a child node
    Delegated(Vec<(usize, Record)>),
}

/// Outcome of deepening one node within the current work slice
#[derive(Debug, Default)]
pub struct Deepened {
    /// Whether this node has nothing left to deepen in the current round
    pub exhausted: bool,
    /// Nodes that must be generated in the next round
    pub frontier: Vec<NodeId>,
}

/// The two deepest layers of a subtree, see [`NodeArena::two_deepest_layers`]
#[derive(Debug, Default)]
pub struct DeepestLayers {
    /// Depth of the deepest layer below the subtree's base
    pub depth: usize,
    /// Nodes whose last layer is at `depth`
    pub deepest: Vec<NodeId>,
    /// Nodes whose last layer is at `depth - 1`
    pub almost_deepest: Vec<NodeId>,
    /// Bytes held by every layer buffer in the subtree, roots excluded
    pub allocated_bytes: usize,
}

impl DeepestLayers {
    fn merge(&mut self, mut other: DeepestLayers) {
        self.allocated_bytes += other.allocated_bytes;

        if other.depth > self.depth || self.deepest.is_empty() {
            if other.depth == self.depth + 1 {
                other.almost_deepest.append(&mut self.deepest);
            }
            self.depth = other.depth;
            self.deepest = other.deepest;
            self.almost_deepest = other.almost_deepest;
        } else if other.depth == self.depth {
            self.deepest.append(&mut other.deepest);
            self.almost_deepest.append(&mut other.almost_deepest);
        } else if other.depth + 1 == self.depth {
            self.almost_deepest.append(&mut other.deepest);
        }
    }
}

/// Diagnostic summary of a node and its subtree
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDump {
    pub id: usize,
    pub root: String,
    /// records per layer
    pub layers: Vec<usize>,
    pub turns: Vec<u8>,
    pub creation_index: usize,
    pub deepen_index: usize,
    pub split: Option<bool>,
    pub complete: bool,
    pub children: BTreeMap<usize, NodeDump>,
}

#[derive(Debug, Clone)]
pub struct TriangleNode {
    layers: Vec<Vec<u8>>,
    // the player whose move produced each layer
    turns: Vec<Player>,
    // index in the last layer -> node rooted at that record
    child_nodes: BTreeMap<usize, NodeId>,

    // next record of the second to last layer to expand
    creation_index: usize,
    // next record of the last layer to delegate
    deepen_index: usize,

    childless_boards: usize,
    split: Option<bool>,
    complete: bool,
}

fn slot(layer: &[u8], index: usize) -> &[u8] {
    &layer[index * RECORD_SIZE..(index + 1) * RECORD_SIZE]
}

fn slot_mut(layer: &mut [u8], index: usize) -> &mut [u8] {
    &mut layer[index * RECORD_SIZE..(index + 1) * RECORD_SIZE]
}

fn record_count(layer: &[u8]) -> usize {
    layer.len() / RECORD_SIZE
}

impl TriangleNode {
    /// Creates a node rooted at `root` with an empty layer for its children
    ///
    /// `turn` is the player whose move produced `root`. The caller accounts
    /// for the `WIDTH * RECORD_SIZE` bytes of the new layer.
    pub fn new(root: &[u8], turn: Player) -> Self {
        let mut root_layer = vec![0; RECORD_SIZE];
        root_layer.copy_from_slice(&root[..RECORD_SIZE]);

        Self {
            layers: vec![root_layer, vec![0; WIDTH * RECORD_SIZE]],
            turns: vec![turn, turn.other()],
            child_nodes: BTreeMap::new(),
            creation_index: 0,
            deepen_index: 0,
            childless_boards: 0,
            split: None,
            complete: false,
        }
    }

    pub fn root_record(&self) -> &[u8] {
        slot(&self.layers[0], 0)
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Number of records in layer `layer`
    pub fn layer_len(&self, layer: usize) -> usize {
        record_count(&self.layers[layer])
    }

    pub fn record(&self, layer: usize, index: usize) -> &[u8] {
        slot(&self.layers[layer], index)
    }

    pub fn turns(&self) -> &[Player] {
        &self.turns
    }

    pub fn child_nodes(&self) -> &BTreeMap<usize, NodeId> {
        &self.child_nodes
    }

    pub fn creation_index(&self) -> usize {
        self.creation_index
    }

    pub fn deepen_index(&self) -> usize {
        self.deepen_index
    }

    pub fn split(&self) -> Option<bool> {
        self.split
    }

    /// Whether every live record of the last layer has been handed to a child node
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether the last layer is still waiting to be (fully) generated
    pub fn generation_pending(&self) -> bool {
        self.layers.len() >= 2 && self.creation_index < self.layer_len(self.layers.len() - 2)
    }

    /// Bytes held by every layer below the root
    pub fn allocated_bytes(&self) -> usize {
        self.layers.iter().skip(1).map(|layer| layer.len()).sum()
    }

    /// Expands the second to last layer into the last one
    ///
    /// Resumes from `creation_index` and stops once the budget runs out.
    /// Returns whether the whole layer has been generated.
    pub fn generate_boards(&mut self, budget: &mut WorkBudget) -> Result<bool> {
        let count = self.layers.len();
        if count < 2 || self.complete {
            return Ok(true);
        }
        let turn = self.turns[count - 1];
        let (head, tail) = self.layers.split_at_mut(count - 1);
        let old_layer = &head[count - 2];
        let latest_layer = &mut tail[0];
        let parents = record_count(old_layer);

        while self.creation_index < parents {
            let parent = slot(old_layer, self.creation_index);
            let first_child = self.creation_index * WIDTH;

            for column in 0..WIDTH {
                let child = slot_mut(latest_layer, first_child + column);
                if record::is_parent(parent) && record::height(parent, column) < HEIGHT {
                    child.copy_from_slice(parent);
                    record::apply_move(child, column, turn)?;
                    if record::check_win(child, column) {
                        self.childless_boards += 1;
                    }
                } else {
                    record::set_null(child);
                    self.childless_boards += 1;
                }
            }

            self.creation_index += 1;
            if budget.tick() {
                return Ok(self.creation_index >= parents);
            }
        }

        Ok(true)
    }

    /// Decides how to grow past the last layer, and performs as much of that as
    /// the budget allows
    fn deepen(&mut self, budget: &mut WorkBudget, config: &EngineConfig) -> Result<(bool, DeepenStep)> {
        let latest_len = self.layer_len(self.layers.len() - 1);

        if self.complete || (!self.child_nodes.is_empty() && self.deepen_index >= latest_len) {
            self.complete = true;
            return Ok((true, DeepenStep::Delegated(Vec::new())));
        }

        if self.generation_pending() {
            return Err(EngineError::invariant(
                "node deepened before its last layer finished generating",
            ));
        }

        let split = match self.split {
            Some(split) => split,
            None => {
                let split = self.childless_boards as f64 / latest_len as f64 > config.split_threshold;
                self.split = Some(split);
                split
            }
        };

        let next_len = self.layers[self.layers.len() - 1].len() * WIDTH;
        // child node keys index the last layer, so a started delegation must finish
        let delegating = self.deepen_index > 0 || !self.child_nodes.is_empty();
        let fits = budget.allocated_bytes().saturating_add(next_len) <= budget.max_bytes();

        let must_delegate = delegating || split || self.layers.len() >= config.max_depth;

        if must_delegate || !fits {
            if !must_delegate {
                debug!(
                    "next layer of {} bytes exceeds the memory budget, delegating",
                    next_len
                );
            }
            // hand the live records of the last layer over to new child nodes
            let latest_layer = &self.layers[self.layers.len() - 1];
            let mut spawned = Vec::new();

            while self.deepen_index < latest_len {
                let board = slot(latest_layer, self.deepen_index);
                if record::is_parent(board) {
                    let mut root = record::EMPTY;
                    root.copy_from_slice(board);
                    spawned.push((self.deepen_index, root));
                    budget.allocate(WIDTH * RECORD_SIZE);
                }
                self.deepen_index += 1;

                if budget.tick() || budget.memory_exhausted() {
                    break;
                }
            }

            let exhausted = self.deepen_index >= latest_len;
            if exhausted {
                self.complete = true;
            }
            Ok((exhausted, DeepenStep::Delegated(spawned)))
        } else {
            budget.allocate(next_len);
            self.layers.push(vec![0; next_len]);
            let turn = self.turns[self.turns.len() - 1].other();
            self.turns.push(turn);
            budget.tick();

            self.creation_index = 0;
            self.childless_boards = 0;
            self.split = None;

            Ok((true, DeepenStep::Densified))
        }
    }

    /// Static-or-searched value of the record at (`layer`, `index`)
    ///
    /// Positive values favour [`Player::One`]. Reaching the last layer
    /// continues into the delegated child node if there is one.
    fn alpha_beta_score(
        &self,
        arena: &NodeArena,
        layer: usize,
        index: usize,
        mut alpha: f64,
        mut beta: f64,
    ) -> Result<f64> {
        let board = self.record(layer, index);
        if record::is_null(board) {
            return Err(EngineError::invariant("alpha-beta reached a null record"));
        }
        if record::is_won(board) {
            return Ok(record::static_score(board));
        }

        if layer + 1 == self.layers.len() {
            return match self.child_nodes.get(&index) {
                Some(&child) => arena.alpha_beta_score(child, 0, 0, alpha, beta),
                None => Ok(record::static_score(board)),
            };
        }

        // children not generated yet
        if layer + 2 == self.layers.len() && index >= self.creation_index {
            return Ok(record::static_score(board));
        }

        let first_child = index * WIDTH;
        let minimizing = self.turns[layer] == Player::One;
        let mut valid_child = false;

        for &column in move_order().iter() {
            let child = first_child + column;
            if record::is_null(self.record(layer + 1, child)) {
                continue;
            }
            let result = self.alpha_beta_score(arena, layer + 1, child, alpha, beta)?;
            valid_child = true;

            if minimizing {
                if result < beta {
                    beta = result;
                }
                if beta <= alpha {
                    return Ok(beta);
                }
            } else {
                if result > alpha {
                    alpha = result;
                }
                if alpha >= beta {
                    return Ok(alpha);
                }
            }
        }

        if !valid_child {
            // no legal moves left, the game is drawn
            return Ok(0.0);
        }
        Ok(if minimizing { beta } else { alpha })
    }

    /// Drops layer 0 and narrows every remaining layer to the subtree of `column`
    ///
    /// Returns the child nodes that fell outside the kept range.
    fn slice_to_column(&mut self, column: usize) -> Vec<NodeId> {
        self.layers.remove(0);
        self.turns.remove(0);

        let mut start = column;
        let mut len = 1;
        let mut last_start = 0;
        let mut last_len = 1;
        for layer in self.layers.iter_mut() {
            *layer = layer[start * RECORD_SIZE..(start + len) * RECORD_SIZE].to_vec();
            last_start = start;
            last_len = len;
            start *= WIDTH;
            len *= WIDTH;
        }

        let mut discarded = Vec::new();
        let mut kept = BTreeMap::new();
        for (index, child) in mem::take(&mut self.child_nodes) {
            if index >= last_start && index < last_start + last_len {
                kept.insert(index - last_start, child);
            } else {
                discarded.push(child);
            }
        }
        self.child_nodes = kept;

        if self.layers.len() >= 2 {
            let parent_start = last_start / WIDTH;
            let parent_len = last_len / WIDTH;
            self.creation_index = self
                .creation_index
                .saturating_sub(parent_start)
                .min(parent_len);
            self.deepen_index = self.deepen_index.saturating_sub(last_start).min(last_len);

            let latest_layer = &self.layers[self.layers.len() - 1];
            self.childless_boards = (0..self.creation_index * WIDTH)
                .filter(|&i| record::is_childless(slot(latest_layer, i)))
                .count();
            if self.deepen_index == 0 {
                self.split = None;
            }
        } else if record::is_parent(self.root_record()) {
            // a lone live root grows a fresh layer for its children
            discarded.extend(mem::take(&mut self.child_nodes).into_values());
            self.layers.push(vec![0; WIDTH * RECORD_SIZE]);
            let turn = self.turns[0].other();
            self.turns.push(turn);
            self.creation_index = 0;
            self.deepen_index = 0;
            self.childless_boards = 0;
            self.split = None;
            self.complete = false;
        } else {
            discarded.extend(mem::take(&mut self.child_nodes).into_values());
            self.creation_index = 0;
            self.deepen_index = 0;
            self.complete = true;
        }

        discarded
    }
}

/// Owner of every [`TriangleNode`] in a tree
#[derive(Debug, Default)]
pub struct NodeArena {
    slots: Vec<Option<TriangleNode>>,
    free: Vec<usize>,
    live: usize,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: TriangleNode) -> NodeId {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(node);
                NodeId(index)
            }
            None => {
                self.slots.push(Some(node));
                NodeId(self.slots.len() - 1)
            }
        }
    }

    pub fn get(&self, id: NodeId) -> Result<&TriangleNode> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| EngineError::invariant(format!("node {} is not live", id.0)))
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut TriangleNode> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| EngineError::invariant(format!("node {} is not live", id.0)))
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn remove(&mut self, id: NodeId) -> Result<TriangleNode> {
        let node = self
            .slots
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| EngineError::invariant(format!("node {} is not live", id.0)))?;
        self.free.push(id.0);
        self.live -= 1;
        Ok(node)
    }

    /// Frees a node and everything below it
    pub fn release(&mut self, id: NodeId) -> Result<()> {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let node = self.remove(id)?;
            pending.extend(node.child_nodes.values());
        }
        Ok(())
    }

    /// Deepens one node, spawning its child nodes into the arena
    pub fn deepen_node(
        &mut self,
        id: NodeId,
        budget: &mut WorkBudget,
        config: &EngineConfig,
    ) -> Result<Deepened> {
        let node = self.get_mut(id)?;
        let (exhausted, step) = node.deepen(budget, config)?;
        let turn = node.turns[node.turns.len() - 1];

        let frontier = match step {
            DeepenStep::Densified => vec![id],
            DeepenStep::Delegated(spawned) => {
                let mut frontier = Vec::with_capacity(spawned.len());
                for (index, root) in spawned {
                    let child = self.insert(TriangleNode::new(&root, turn));
                    self.get_mut(id)?.child_nodes.insert(index, child);
                    frontier.push(child);
                }
                if !frontier.is_empty() {
                    debug!("node {} delegated {} children", id.0, frontier.len());
                }
                frontier
            }
        };

        Ok(Deepened { exhausted, frontier })
    }

    /// Alpha-beta value of a record in the node `id`, see [`TriangleNode`]
    pub fn alpha_beta_score(
        &self,
        id: NodeId,
        layer: usize,
        index: usize,
        alpha: f64,
        beta: f64,
    ) -> Result<f64> {
        self.get(id)?.alpha_beta_score(self, layer, index, alpha, beta)
    }

    /// Re-roots the tree at the child reached by playing `column` from `root`
    ///
    /// A two-layer root that already delegated the chosen child is replaced by
    /// that child outright. Otherwise the root's own layers are narrowed in
    /// place. Every discarded node is freed. Returns the new root.
    pub fn trim_root(&mut self, root: NodeId, column: usize) -> Result<NodeId> {
        if column >= WIDTH {
            return Err(EngineError::InvalidColumn { column });
        }

        let node = self.get_mut(root)?;
        if node.layers.len() < 2 {
            return Err(EngineError::invariant("trim attempted on a single-layer node"));
        }
        if node.layers.len() == 2 && node.creation_index < 1 {
            return Err(EngineError::invariant(
                "second layer is unfinished when trim attempted",
            ));
        }

        let chosen = node.record(1, column);
        if record::is_null(chosen) {
            return Err(EngineError::InvalidColumn { column });
        }
        let chosen_won = record::is_won(chosen);

        if node.layers.len() == 2 && !chosen_won {
            if let Some(next_root) = node.child_nodes.remove(&column) {
                let old_root = self.remove(root)?;
                for &sibling in old_root.child_nodes.values() {
                    self.release(sibling)?;
                }
                debug!("root handed over to node {}", next_root.0);
                return Ok(next_root);
            }
        }

        let discarded = node.slice_to_column(column);
        for child in discarded {
            self.release(child)?;
        }
        Ok(root)
    }

    /// Finds the deepest layer below `id` and the nodes that end on it or
    /// one layer above it
    ///
    /// `base` is the depth of the node's own root. Also totals the bytes held
    /// by every layer buffer in the subtree.
    pub fn two_deepest_layers(&self, id: NodeId, base: usize) -> Result<DeepestLayers> {
        let node = self.get(id)?;
        let last = base + node.layers.len() - 1;
        let allocated_bytes = node.allocated_bytes();

        if node.child_nodes.is_empty() {
            return Ok(DeepestLayers {
                depth: last,
                deepest: vec![id],
                almost_deepest: Vec::new(),
                allocated_bytes,
            });
        }

        let mut found = DeepestLayers::default();
        for &child in node.child_nodes.values() {
            found.merge(self.two_deepest_layers(child, last)?);
        }
        found.allocated_bytes += allocated_bytes;

        if last + 1 == found.depth {
            found.almost_deepest.push(id);
        }
        Ok(found)
    }

    /// Snapshot of the subtree below `id`
    pub fn dump(&self, id: NodeId) -> Result<NodeDump> {
        let node = self.get(id)?;
        let mut children = BTreeMap::new();
        for (&index, &child) in node.child_nodes.iter() {
            children.insert(index, self.dump(child)?);
        }

        Ok(NodeDump {
            id: id.0,
            root: record::render(node.root_record()),
            layers: (0..node.layers.len()).map(|layer| node.layer_len(layer)).collect(),
            turns: node.turns.iter().map(|turn| turn.index()).collect(),
            creation_index: node.creation_index,
            deepen_index: node.deepen_index,
            split: node.split,
            complete: node.complete,
            children,
        })
    }
}
