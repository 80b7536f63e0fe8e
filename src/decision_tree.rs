//! The incremental search tree and its cooperative scheduler
//!
//! A [`DecisionTree`] alternates two resumable phases over its frontier, the
//! set of nodes at the bottom of the tree:
//!
//! - generation fills the newest layer of every frontier node, then rescores
//!   the root's moves
//! - deepening makes every frontier node either grow another layer or hand its
//!   last layer over to child nodes, collecting the next frontier
//!
//! Each call to [`DecisionTree::step`] performs one bounded work slice. The
//! caller decides when slices run, so commands can be handled in between.

use log::{debug, error, info, warn};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use std::collections::BTreeMap;
use std::mem;

use crate::budget::WorkBudget;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::move_order;
use crate::record::{self, Player, Record, RECORD_SIZE};
use crate::triangle::{NodeArena, NodeDump, NodeId, TriangleNode};
use crate::{HEIGHT, WIDTH};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Generating,
    Deepening,
}

/// Why computation stopped
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Halt {
    /// Stopped on request, see [`DecisionTree::halt`]
    Requested,
    /// The layer buffers reached the memory budget, cleared by a trim that frees space
    Memory,
    GameOver,
    /// An invariant was violated, only a reset recovers
    Failed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GameStatus {
    Playing,
    Won(Player),
    Draw,
}

impl GameStatus {
    pub fn is_over(&self) -> bool {
        !matches!(self, GameStatus::Playing)
    }

    /// The winner as reported to clients: 0 or 1, and -1 for a draw
    pub fn winner_code(&self) -> Option<i8> {
        match self {
            GameStatus::Playing => None,
            GameStatus::Won(player) => Some(player.index() as i8),
            GameStatus::Draw => Some(-1),
        }
    }
}

impl Serialize for GameStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let winner = self.winner_code();
        let mut map = serializer.serialize_map(Some(if winner.is_some() { 2 } else { 1 }))?;
        map.serialize_entry("status", &self.is_over())?;
        if let Some(winner) = winner {
            map.serialize_entry("winner", &winner)?;
        }
        map.end()
    }
}

/// Scores of the legal first moves, higher is better for the player to move
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MoveScores(BTreeMap<usize, f64>);

impl MoveScores {
    pub fn get(&self, column: usize) -> Option<f64> {
        self.0.get(&column).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.0.iter().map(|(&column, &score)| (column, score))
    }
}

// JSON has no infinities, so they are written the way a JavaScript host prints them
struct Score(f64);

impl Serialize for Score {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.0.is_finite() {
            serializer.serialize_f64(self.0)
        } else if self.0 > 0.0 {
            serializer.serialize_str("Infinity")
        } else if self.0 < 0.0 {
            serializer.serialize_str("-Infinity")
        } else {
            serializer.serialize_str("NaN")
        }
    }
}

impl Serialize for MoveScores {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (column, &score) in self.0.iter() {
            map.serialize_entry(column, &Score(score))?;
        }
        map.end()
    }
}

/// Unsolicited notifications about background progress
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Progress {
    /// A deepening round finished, the frontier moved one ply down
    Depth { depth: usize },
    /// A generation round finished and the root's moves were rescored
    MoveScores {
        #[serde(rename = "moveScores")]
        move_scores: MoveScores,
    },
    Computing {
        #[serde(rename = "notComputing")]
        not_computing: bool,
    },
    /// The frontier ran empty, the tree cannot grow any further
    Complete {
        complete: bool,
        #[serde(rename = "notComputing")]
        not_computing: bool,
    },
}

/// Diagnostic snapshot of a [`DecisionTree`], not a stable format
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeDump {
    pub move_count: usize,
    pub depth: usize,
    pub turn: u8,
    pub phase: Phase,
    pub halt: Option<Halt>,
    pub complete: bool,
    pub allocated_bytes: usize,
    pub live_nodes: usize,
    pub frontier: usize,
    pub next_frontier: usize,
    pub frontier_index: usize,
    pub move_scores: MoveScores,
    pub root: NodeDump,
}

/// The search tree for one game
pub struct DecisionTree {
    config: EngineConfig,
    arena: NodeArena,
    root: NodeId,
    // the player who made the last move
    turn: Player,

    // nodes being generated or deepened in the current round
    deepest_layer: Vec<NodeId>,
    // nodes created by deepening, generated in the next round
    next_deepest_layer: Vec<NodeId>,
    deepest_layer_index: usize,
    phase: Phase,

    budget: WorkBudget,
    halt: Option<Halt>,
    complete: bool,

    depth: usize,
    move_count: usize,
    move_scores: MoveScores,
    progress: Vec<Progress>,
}

impl DecisionTree {
    /// Creates a tree for a new game on the empty board
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_position(config, &record::EMPTY, Player::Zero)
    }

    /// Creates a tree rooted at an arbitrary position
    ///
    /// `last_mover` is the player whose move produced `position`.
    pub fn with_position(config: EngineConfig, position: &[u8], last_mover: Player) -> Result<Self> {
        if position.len() != RECORD_SIZE || record::is_null(position) {
            return Err(EngineError::invariant("cannot search from a null position"));
        }

        let mut budget = WorkBudget::new(config.max_operations, config.max_memory);
        let mut arena = NodeArena::new();
        let root = arena.insert(TriangleNode::new(position, last_mover));
        budget.allocate(WIDTH * RECORD_SIZE);

        let move_count = if record::is_parent(position) {
            record::move_count(position)
        } else {
            0
        };

        let mut tree = Self {
            config,
            arena,
            root,
            turn: last_mover,
            deepest_layer: vec![root],
            next_deepest_layer: Vec::new(),
            deepest_layer_index: 0,
            phase: Phase::Deepening,
            budget,
            halt: None,
            complete: false,
            depth: 1,
            move_count,
            move_scores: MoveScores::default(),
            progress: Vec::new(),
        };

        tree.settle_root()?;
        if tree.game_over()?.is_over() {
            tree.stop(Halt::GameOver);
            tree.deepest_layer.clear();
        } else {
            tree.refresh_move_scores()?;
        }
        Ok(tree)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn move_scores(&self) -> &MoveScores {
        &self.move_scores
    }

    /// Number of moves committed since the empty board
    pub fn move_count(&self) -> usize {
        self.move_count
    }

    /// Ply depth of the current frontier below the root
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn halted(&self) -> Option<Halt> {
        self.halt
    }

    /// Whether the frontier ran empty
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether another call to [`step`](Self::step) would do any work
    pub fn is_computing(&self) -> bool {
        self.halt.is_none() && !self.complete
    }

    pub fn allocated_bytes(&self) -> usize {
        self.budget.allocated_bytes()
    }

    /// The player who made the last move
    pub fn turn(&self) -> Player {
        self.turn
    }

    pub fn frontier(&self) -> &[NodeId] {
        &self.deepest_layer
    }

    pub fn next_frontier(&self) -> &[NodeId] {
        &self.next_deepest_layer
    }

    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn root_record(&self) -> Result<Record> {
        let mut position = record::EMPTY;
        position.copy_from_slice(self.arena.get(self.root)?.root_record());
        Ok(position)
    }

    /// Takes the notifications queued since the last call
    pub fn drain_progress(&mut self) -> Vec<Progress> {
        mem::take(&mut self.progress)
    }

    /// Stops background computation until [`resume`](Self::resume) is called
    pub fn halt(&mut self) {
        if self.halt.is_none() {
            info!("computation halted on request");
            self.stop(Halt::Requested);
        }
    }

    /// Restarts whichever phase was active when computation halted
    ///
    /// Returns whether computation is running again. Finished games and
    /// failed trees cannot resume, and a memory halt only lifts once there
    /// is room in the budget.
    pub fn resume(&mut self) -> bool {
        let resumable = match self.halt {
            Some(Halt::Requested) => true,
            Some(Halt::Memory) => !self.budget.memory_exhausted(),
            _ => false,
        };
        if resumable {
            info!("computation resumed in the {:?} phase", self.phase);
            self.halt = None;
            self.progress.push(Progress::Computing { not_computing: false });
        }
        self.is_computing()
    }

    /// Runs one bounded work slice of the active phase
    ///
    /// Returns whether more work remains. A tree invariant violation halts
    /// the tree for good and is returned to the caller.
    pub fn step(&mut self) -> Result<bool> {
        if !self.is_computing() {
            return Ok(false);
        }
        self.budget.refill();
        let result = match self.phase {
            Phase::Generating => self.generation_slice(),
            Phase::Deepening => self.deepening_slice(),
        };
        self.check_fatal(result)?;
        Ok(self.is_computing())
    }

    fn generation_slice(&mut self) -> Result<()> {
        if self.deepest_layer.is_empty() {
            self.finish_search();
            return Ok(());
        }
        debug!(
            "generating depth {}, node {} of {}",
            self.depth,
            self.deepest_layer_index,
            self.deepest_layer.len()
        );

        while self.deepest_layer_index < self.deepest_layer.len() {
            let id = self.deepest_layer[self.deepest_layer_index];
            if !self.arena.get_mut(id)?.generate_boards(&mut self.budget)? {
                // out of operations part way through the node
                return Ok(());
            }
            self.deepest_layer_index += 1;
            if self.budget.operations_exhausted() {
                break;
            }
        }

        if self.deepest_layer_index >= self.deepest_layer.len() {
            self.deepest_layer_index = 0;
            self.refresh_move_scores()?;
            info!(
                "depth {} generated over {} nodes, {} bytes allocated",
                self.depth,
                self.deepest_layer.len(),
                self.budget.allocated_bytes()
            );
            self.progress.push(Progress::MoveScores {
                move_scores: self.move_scores.clone(),
            });
            self.phase = Phase::Deepening;
        }
        Ok(())
    }

    fn deepening_slice(&mut self) -> Result<()> {
        if self.deepest_layer.is_empty() {
            self.finish_search();
            return Ok(());
        }
        debug!(
            "deepening depth {}, node {} of {}, {} queued",
            self.depth,
            self.deepest_layer_index,
            self.deepest_layer.len(),
            self.next_deepest_layer.len()
        );

        while self.deepest_layer_index < self.deepest_layer.len() {
            if self.budget.memory_exhausted() {
                warn!(
                    "halting deepening, {} of {} bytes allocated",
                    self.budget.allocated_bytes(),
                    self.budget.max_bytes()
                );
                self.stop(Halt::Memory);
                return Ok(());
            }

            let id = self.deepest_layer[self.deepest_layer_index];
            let deepened = self.arena.deepen_node(id, &mut self.budget, &self.config)?;
            self.next_deepest_layer.extend(deepened.frontier);
            if !deepened.exhausted {
                return Ok(());
            }

            self.deepest_layer_index += 1;
            if self.budget.tick() {
                break;
            }
        }

        if self.deepest_layer_index >= self.deepest_layer.len() {
            self.deepest_layer = mem::take(&mut self.next_deepest_layer);
            self.deepest_layer_index = 0;
            self.depth += 1;
            info!(
                "deepened to depth {}, {} nodes in the frontier",
                self.depth,
                self.deepest_layer.len()
            );
            self.progress.push(Progress::Depth { depth: self.depth });
            self.phase = Phase::Generating;
        }
        Ok(())
    }

    fn finish_search(&mut self) {
        if !self.complete {
            info!("frontier is empty, the search is complete");
            self.complete = true;
            self.progress.push(Progress::Complete {
                complete: true,
                not_computing: true,
            });
        }
    }

    fn stop(&mut self, halt: Halt) {
        self.halt = Some(halt);
        self.progress.push(Progress::Computing { not_computing: true });
    }

    fn check_fatal<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                error!("{}", err);
                self.stop(Halt::Failed);
            }
        }
        result
    }

    // the root's own children must always be generated so moves can be validated
    fn settle_root(&mut self) -> Result<()> {
        let root = self.arena.get_mut(self.root)?;
        while root.layer_count() == 2 && root.generation_pending() {
            root.generate_boards(&mut self.budget)?;
        }
        Ok(())
    }

    /// Which columns can be played from the current position
    pub fn valid_moves(&self) -> Result<[bool; WIDTH]> {
        let root = self.arena.get(self.root)?;
        let mut moves = [false; WIDTH];

        let children_generated = root.layer_count() > 2
            || (root.layer_count() == 2 && !root.generation_pending());
        if children_generated {
            for (column, valid) in moves.iter_mut().enumerate() {
                *valid = !record::is_null(root.record(1, column));
            }
        } else {
            let position = root.root_record();
            if record::is_parent(position) {
                for (column, valid) in moves.iter_mut().enumerate() {
                    *valid = record::height(position, column) < HEIGHT;
                }
            }
        }
        Ok(moves)
    }

    /// Whether the game has ended, and how
    pub fn game_over(&self) -> Result<GameStatus> {
        let root = self.arena.get(self.root)?;
        if let Some(winner) = record::winner(root.root_record()) {
            return Ok(GameStatus::Won(winner));
        }
        if self.valid_moves()?.iter().all(|&valid| !valid) {
            return Ok(GameStatus::Draw);
        }
        Ok(GameStatus::Playing)
    }

    /// The legal column with the best move score, ties broken center-out
    pub fn best_move(&self) -> Result<Option<usize>> {
        let valid = self.valid_moves()?;
        let mut best: Option<(usize, f64)> = None;

        for &column in move_order().iter() {
            if !valid[column] {
                continue;
            }
            let score = self.move_scores.get(column).unwrap_or(f64::NEG_INFINITY);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((column, score)),
            }
        }
        Ok(best.map(|(column, _)| column))
    }

    /// Scores each legal first move with alpha-beta over the whole tree
    fn refresh_move_scores(&mut self) -> Result<()> {
        let root = self.arena.get(self.root)?;
        let mut scores = BTreeMap::new();

        if root.layer_count() >= 2 {
            // scores favour player one, flip them when player zero is to move
            let flip = root.turns()[0] == Player::One;
            for column in 0..WIDTH {
                let board = root.record(1, column);
                if record::is_null(board) {
                    continue;
                }
                let score = if record::is_won(board) {
                    record::static_score(board)
                } else {
                    self.arena.alpha_beta_score(
                        self.root,
                        1,
                        column,
                        f64::NEG_INFINITY,
                        f64::INFINITY,
                    )?
                };
                scores.insert(column, if flip { -score } else { score });
            }
        }

        self.move_scores = MoveScores(scores);
        Ok(())
    }

    /// Plays `column` for the player to move, keeping the searched subtree
    ///
    /// Fails with [`EngineError::InvalidColumn`] without changing anything
    /// when the column cannot be played or the game is over.
    pub fn commit_move(&mut self, column: usize) -> Result<GameStatus> {
        if self.halt == Some(Halt::Failed) {
            return Err(EngineError::invariant("the tree failed earlier, reset required"));
        }
        let result = self.commit_move_inner(column);
        self.check_fatal(result)
    }

    fn commit_move_inner(&mut self, column: usize) -> Result<GameStatus> {
        if column >= WIDTH || self.game_over()?.is_over() {
            return Err(EngineError::InvalidColumn { column });
        }
        self.settle_root()?;
        if !self.valid_moves()?[column] {
            return Err(EngineError::InvalidColumn { column });
        }

        self.root = self.arena.trim_root(self.root, column)?;
        self.turn = self.turn.other();
        self.move_count += 1;
        self.depth = self.depth.saturating_sub(1);
        self.settle_root()?;
        info!(
            "move {} played in column {}, {} live nodes",
            self.move_count,
            column,
            self.arena.len()
        );

        let status = self.game_over()?;
        if status.is_over() {
            info!("game over, winner: {:?}", status.winner_code());
            let found = self.arena.two_deepest_layers(self.root, 0)?;
            self.budget.set_allocated(found.allocated_bytes);
            self.move_scores = MoveScores::default();
            self.deepest_layer.clear();
            self.next_deepest_layer.clear();
            self.deepest_layer_index = 0;
            if self.halt != Some(Halt::GameOver) {
                self.stop(Halt::GameOver);
            }
            return Ok(status);
        }

        self.refresh_move_scores()?;
        self.restore_frontier()?;

        if self.halt == Some(Halt::Memory) && !self.budget.memory_exhausted() {
            info!(
                "trim freed memory, {} bytes allocated",
                self.budget.allocated_bytes()
            );
            self.resume();
        }
        Ok(status)
    }

    fn select(&self, ids: &[NodeId], keep: fn(&TriangleNode) -> bool) -> Result<Vec<NodeId>> {
        let mut selected = Vec::new();
        for &id in ids {
            if keep(self.arena.get(id)?) {
                selected.push(id);
            }
        }
        Ok(selected)
    }

    /// Re-anchors the frontier after a trim shifted every depth by one
    ///
    /// Also recounts the allocated bytes from the surviving buffers.
    fn restore_frontier(&mut self) -> Result<()> {
        let found = self.arena.two_deepest_layers(self.root, 0)?;
        self.budget.set_allocated(found.allocated_bytes);
        self.deepest_layer_index = 0;

        if self.complete {
            self.deepest_layer.clear();
            self.next_deepest_layer.clear();
            return Ok(());
        }

        fn awaiting_generation(node: &TriangleNode) -> bool {
            !node.is_complete() && node.generation_pending()
        }
        fn awaiting_deepening(node: &TriangleNode) -> bool {
            !node.is_complete() && !node.generation_pending()
        }
        fn unfinished(node: &TriangleNode) -> bool {
            !node.is_complete()
        }

        match self.phase {
            Phase::Generating => {
                self.deepest_layer = self.select(&found.deepest, unfinished)?;
                self.next_deepest_layer.clear();
                self.depth = found.depth;
            }
            Phase::Deepening => {
                let undeepened = self.select(&found.deepest, awaiting_deepening)?;
                if !undeepened.is_empty() {
                    // nothing in this round was deepened yet
                    self.deepest_layer = undeepened;
                    self.next_deepest_layer.clear();
                    self.depth = found.depth;
                } else {
                    self.deepest_layer = self.select(&found.almost_deepest, awaiting_deepening)?;
                    self.next_deepest_layer = self.select(&found.deepest, awaiting_generation)?;
                    self.depth = found.depth.saturating_sub(1);

                    if self.deepest_layer.is_empty() {
                        // the round had already finished deepening
                        self.deepest_layer = mem::take(&mut self.next_deepest_layer);
                        self.depth = found.depth;
                        self.phase = Phase::Generating;
                        self.progress.push(Progress::Depth { depth: self.depth });
                    }
                }
            }
        }

        debug!(
            "frontier restored: {:?} phase at depth {}, {} nodes, {} queued, {} bytes",
            self.phase,
            self.depth,
            self.deepest_layer.len(),
            self.next_deepest_layer.len(),
            self.budget.allocated_bytes()
        );
        Ok(())
    }

    /// Diagnostic snapshot of the whole tree
    pub fn dump(&self) -> Result<TreeDump> {
        Ok(TreeDump {
            move_count: self.move_count,
            depth: self.depth,
            turn: self.turn.index(),
            phase: self.phase,
            halt: self.halt,
            complete: self.complete,
            allocated_bytes: self.budget.allocated_bytes(),
            live_nodes: self.arena.len(),
            frontier: self.deepest_layer.len(),
            next_frontier: self.next_deepest_layer.len(),
            frontier_index: self.deepest_layer_index,
            move_scores: self.move_scores.clone(),
            root: self.arena.dump(self.root)?,
        })
    }
}
