#[cfg(test)]
pub mod test {
    use anyhow::{anyhow, Result};
    use std::time::Duration;

    use crate::budget::WorkBudget;
    use crate::config::EngineConfig;
    use crate::decision_tree::{DecisionTree, GameStatus, Halt, Phase, Progress};
    use crate::error::EngineError;
    use crate::record::{self, Direction, Player, Record};
    use crate::triangle::{NodeArena, TriangleNode};
    use crate::worker::{self, Message, Request, Worker};
    use crate::{move_order, HEIGHT, WIDTH};

    fn small_config() -> EngineConfig {
        EngineConfig {
            max_operations: 1000,
            operation_delay_ms: 1,
            max_memory: 8 * 1024 * 1024,
            max_depth: 4,
            split_threshold: 0.5,
        }
    }

    // columns listed bottom to top, 1 marks a piece of player one
    fn from_columns(columns: &[[u8; HEIGHT]; WIDTH], heights: [usize; WIDTH]) -> Record {
        let mut position = record::EMPTY;
        for (column, pieces) in columns.iter().enumerate() {
            position[column] = heights[column] as u8;
            for (row, &piece) in pieces.iter().take(heights[column]).enumerate() {
                position[column + WIDTH] |= piece << row;
            }
        }
        position
    }

    // a full board with no four in a row
    const DRAWN: [[u8; HEIGHT]; WIDTH] = [
        [1, 0, 1, 0, 1, 0],
        [0, 1, 1, 0, 0, 1],
        [1, 0, 0, 1, 1, 0],
        [1, 0, 1, 0, 0, 1],
        [1, 0, 0, 1, 1, 0],
        [0, 1, 0, 1, 0, 1],
        [1, 0, 0, 0, 1, 1],
    ];

    fn run_steps(tree: &mut DecisionTree, steps: usize) -> Result<()> {
        for _ in 0..steps {
            tree.step()?;
        }
        Ok(())
    }

    // the record a parent leads to by dropping a piece into `column`
    fn expected_child(parent: &[u8], column: usize, mover: Player) -> Record {
        let mut child = record::EMPTY;
        child.copy_from_slice(parent);
        match record::apply_move(&mut child, column, mover) {
            Ok(()) => {
                record::check_win(&mut child, column);
            }
            Err(_) => record::set_null(&mut child),
        }
        child
    }

    // every generated record follows from its parent, every child node is rooted
    // at its slot, and every node awaiting generation is scheduled
    fn check_tree(tree: &DecisionTree) -> Result<()> {
        let arena = tree.arena();
        let scheduled = !tree.is_complete() && !tree.game_over()?.is_over();
        let mut nodes = vec![tree.root()];

        while let Some(id) = nodes.pop() {
            let node = arena.get(id)?;
            let last = node.layer_count() - 1;

            for layer in 1..=last {
                let generated = if layer == last {
                    node.creation_index() * WIDTH
                } else {
                    node.layer_len(layer)
                };
                for index in 0..generated {
                    let expected = expected_child(
                        node.record(layer - 1, index / WIDTH),
                        index % WIDTH,
                        node.turns()[layer],
                    );
                    let actual = node.record(layer, index);
                    let matches = if record::is_null(&expected) {
                        record::is_null(actual)
                    } else {
                        actual == &expected[..]
                    };
                    if !matches {
                        return Err(anyhow!(
                            "node {} layer {} record {} does not follow from its parent",
                            id.index(),
                            layer,
                            index
                        ));
                    }
                }
            }

            for (&key, &child) in node.child_nodes().iter() {
                if key >= node.layer_len(last) {
                    return Err(anyhow!("node {} has a child outside its last layer", id.index()));
                }
                let child_node = arena.get(child)?;
                if child_node.root_record() != node.record(last, key)
                    || child_node.turns()[0] != node.turns()[last]
                {
                    return Err(anyhow!(
                        "child {} of node {} is not rooted at record {}",
                        child.index(),
                        id.index(),
                        key
                    ));
                }
                nodes.push(child);
            }

            if scheduled
                && node.generation_pending()
                && !node.is_complete()
                && !tree.frontier().contains(&id)
                && !tree.next_frontier().contains(&id)
            {
                return Err(anyhow!("node {} awaits generation but is not scheduled", id.index()));
            }
        }
        Ok(())
    }

    #[test]
    pub fn move_order_is_center_out() {
        assert_eq!(move_order(), [3, 4, 2, 5, 1, 6, 0]);
    }

    #[test]
    pub fn wins_in_every_direction() -> Result<()> {
        let vertical = record::from_moves(&[3, 4, 3, 4, 3, 4, 3])?;
        assert!(record::is_won(&vertical));
        assert_eq!(record::winner(&vertical), Some(Player::One));

        let horizontal = record::from_moves(&[0, 0, 1, 1, 2, 2, 3])?;
        assert_eq!(record::winner(&horizontal), Some(Player::One));

        let diagonal = record::from_moves(&[0, 1, 1, 2, 2, 3, 2, 3, 3, 6, 3])?;
        assert_eq!(record::winner(&diagonal), Some(Player::One));

        // three in a row is not a win
        let open = record::from_moves(&[3, 4, 3, 4, 3])?;
        assert!(record::is_parent(&open));
        assert_eq!(record::winner(&open), None);
        Ok(())
    }

    #[test]
    pub fn fourth_drop_in_a_column_wins() -> Result<()> {
        let mut position = record::EMPTY;
        for drop in 1..=4 {
            record::apply_move(&mut position, 3, Player::Zero)?;
            let won = record::check_win(&mut position, 3);
            assert_eq!(won, drop == 4);
        }
        assert_eq!(record::winner(&position), Some(Player::Zero));
        assert_eq!(position[1], Player::Zero.index());
        Ok(())
    }

    #[test]
    pub fn won_records_have_no_children() -> Result<()> {
        let mut won = record::from_moves(&[3, 4, 3, 4, 3, 4, 3])?;
        assert!(record::is_childless(&won));
        assert_eq!(
            record::apply_move(&mut won, 0, Player::Zero),
            Err(EngineError::InvalidColumn { column: 0 })
        );
        assert_eq!(record::static_score(&won), f64::INFINITY);

        let mut lost = record::EMPTY;
        record::set_won(&mut lost, Player::Zero);
        assert_eq!(record::static_score(&lost), f64::NEG_INFINITY);
        Ok(())
    }

    #[test]
    pub fn full_column_rejected() -> Result<()> {
        let mut position = record::from_moves(&[0, 0, 0, 0, 0, 0])?;
        assert!(record::is_parent(&position));
        assert_eq!(record::height(&position, 0), HEIGHT);
        assert_eq!(
            record::apply_move(&mut position, 0, Player::One),
            Err(EngineError::ColumnFull { column: 0 })
        );
        assert_eq!(
            record::apply_move(&mut position, WIDTH, Player::One),
            Err(EngineError::InvalidColumn { column: WIDTH })
        );
        Ok(())
    }

    #[test]
    pub fn cells_follow_move_history() -> Result<()> {
        let position = record::from_moves(&[3, 3, 4])?;
        assert_eq!(record::height(&position, 3), 2);
        assert_eq!(record::height(&position, 4), 1);
        assert_eq!(record::height(&position, 0), 0);
        assert_eq!(record::cell(&position, 3, 0), Some(Player::One));
        assert_eq!(record::cell(&position, 3, 1), Some(Player::Zero));
        assert_eq!(record::cell(&position, 4, 0), Some(Player::One));
        assert_eq!(record::cell(&position, 4, 1), None);
        assert_eq!(record::move_count(&position), 3);
        Ok(())
    }

    #[test]
    pub fn static_scores() -> Result<()> {
        let center = record::from_moves(&[3])?;
        assert_eq!(record::line_score(&center, Direction::Horizontal), 4.0);
        assert_eq!(record::line_score(&center, Direction::Vertical), 1.0);
        assert_eq!(record::static_score(&center), 7.0);

        assert_eq!(record::static_score(&record::from_moves(&[3, 3])?), -3.0);
        assert_eq!(record::static_score(&record::from_moves(&[0, 1, 2])?), 3.0);

        let threat = record::from_moves(&[3, 4, 3, 4, 3])?;
        assert_eq!(record::line_score(&threat, Direction::Horizontal), 6.0);
        assert_eq!(record::line_score(&threat, Direction::Vertical), 10000.0);
        assert_eq!(record::line_score(&threat, Direction::Diagonal), 5.0);
        assert_eq!(record::line_score(&threat, Direction::AntiDiagonal), 3.0);
        assert_eq!(record::static_score(&threat), 10014.0);

        // the total does not depend on the order the directions are summed in
        let reversed: f64 = Direction::ALL
            .iter()
            .rev()
            .map(|&direction| record::line_score(&threat, direction))
            .sum();
        assert_eq!(reversed, record::static_score(&threat));

        assert_eq!(record::static_score(&record::EMPTY), 0.0);
        Ok(())
    }

    #[test]
    pub fn budget_counts_down() {
        let mut budget = WorkBudget::new(2, 100);
        assert!(!budget.tick());
        assert!(budget.tick());
        assert!(budget.tick());
        assert!(budget.operations_exhausted());
        budget.refill();
        assert!(!budget.operations_exhausted());

        budget.allocate(60);
        assert!(!budget.memory_exhausted());
        budget.allocate(40);
        assert!(budget.memory_exhausted());
        budget.set_allocated(10);
        assert_eq!(budget.allocated_bytes(), 10);
    }

    #[test]
    pub fn config_validation() -> Result<()> {
        EngineConfig::default().validate()?;
        let config: EngineConfig = serde_json::from_str(r#"{"max_depth": 6}"#)?;
        assert_eq!(config.max_depth, 6);
        assert_eq!(config.max_operations, 100_000);
        assert_eq!(config.max_memory, 256 * 1024 * 1024);

        let broken = EngineConfig {
            split_threshold: 1.5,
            ..EngineConfig::default()
        };
        assert!(broken.validate().is_err());
        Ok(())
    }

    #[test]
    pub fn generation_resumes_across_slices() -> Result<()> {
        let config = small_config();
        let mut budget = WorkBudget::new(3, usize::MAX);
        let mut arena = NodeArena::new();
        let root = arena.insert(TriangleNode::new(&record::EMPTY, Player::Zero));

        assert!(arena.get_mut(root)?.generate_boards(&mut budget)?);
        budget.refill();
        let deepened = arena.deepen_node(root, &mut budget, &config)?;
        assert!(deepened.exhausted);
        assert_eq!(deepened.frontier, vec![root]);
        assert_eq!(arena.get(root)?.layer_count(), 3);
        assert!(arena.get(root)?.generation_pending());

        let mut slices = 0;
        loop {
            budget.refill();
            slices += 1;
            if arena.get_mut(root)?.generate_boards(&mut budget)? {
                break;
            }
            assert_eq!(arena.get(root)?.creation_index(), 3 * slices);
        }
        assert_eq!(slices, 3);

        let node = arena.get(root)?;
        assert!(!node.generation_pending());
        for a in 0..WIDTH {
            for b in 0..WIDTH {
                assert_eq!(node.record(2, a * WIDTH + b), &record::from_moves(&[a, b])?[..]);
            }
        }
        Ok(())
    }

    #[test]
    pub fn deepening_before_generation_fails() -> Result<()> {
        let config = small_config();
        let mut budget = WorkBudget::new(1000, usize::MAX);
        let mut arena = NodeArena::new();
        let root = arena.insert(TriangleNode::new(&record::EMPTY, Player::Zero));
        arena.get_mut(root)?.generate_boards(&mut budget)?;
        arena.deepen_node(root, &mut budget, &config)?;

        match arena.deepen_node(root, &mut budget, &config) {
            Err(err) => {
                assert!(err.is_fatal());
                assert!(matches!(err, EngineError::TreeInvariantViolation(_)));
            }
            Ok(_) => return Err(anyhow!("deepened an ungenerated layer")),
        }
        Ok(())
    }

    #[test]
    pub fn max_depth_delegates_to_children() -> Result<()> {
        let config = EngineConfig {
            max_depth: 2,
            ..small_config()
        };
        let mut budget = WorkBudget::new(1000, usize::MAX);
        let mut arena = NodeArena::new();
        let root = arena.insert(TriangleNode::new(&record::EMPTY, Player::Zero));
        arena.get_mut(root)?.generate_boards(&mut budget)?;

        let deepened = arena.deepen_node(root, &mut budget, &config)?;
        assert!(deepened.exhausted);
        assert_eq!(deepened.frontier.len(), WIDTH);
        assert_eq!(arena.len(), WIDTH + 1);
        assert_eq!(budget.allocated_bytes(), WIDTH * WIDTH * record::RECORD_SIZE);

        let node = arena.get(root)?;
        assert!(node.is_complete());
        assert_eq!(node.split(), Some(false));
        assert_eq!(node.layer_count(), 2);
        for (&index, &child) in node.child_nodes().iter() {
            let child = arena.get(child)?;
            assert_eq!(child.root_record(), &record::from_moves(&[index])?[..]);
            assert_eq!(child.turns()[0], Player::One);
            assert!(child.generation_pending());
        }

        // nothing left to do for a complete node
        let again = arena.deepen_node(root, &mut budget, &config)?;
        assert!(again.exhausted);
        assert!(again.frontier.is_empty());
        Ok(())
    }

    #[test]
    pub fn mostly_childless_layer_splits() -> Result<()> {
        let config = EngineConfig {
            max_depth: 10,
            ..small_config()
        };
        // four columns full, the other three one piece short
        let position = from_columns(&DRAWN, [6, 6, 6, 6, 5, 5, 5]);
        let mut budget = WorkBudget::new(1000, usize::MAX);
        let mut arena = NodeArena::new();
        let root = arena.insert(TriangleNode::new(&position, Player::Zero));
        arena.get_mut(root)?.generate_boards(&mut budget)?;

        let deepened = arena.deepen_node(root, &mut budget, &config)?;
        let node = arena.get(root)?;
        assert_eq!(node.split(), Some(true));
        assert_eq!(node.layer_count(), 2);
        assert_eq!(deepened.frontier.len(), 3);
        assert_eq!(
            node.child_nodes().keys().copied().collect::<Vec<_>>(),
            vec![4, 5, 6]
        );
        Ok(())
    }

    #[test]
    pub fn trim_narrows_layers_in_place() -> Result<()> {
        let config = small_config();
        let mut budget = WorkBudget::new(1000, usize::MAX);
        let mut arena = NodeArena::new();
        let root = arena.insert(TriangleNode::new(&record::EMPTY, Player::Zero));
        arena.get_mut(root)?.generate_boards(&mut budget)?;
        arena.deepen_node(root, &mut budget, &config)?;
        arena.get_mut(root)?.generate_boards(&mut budget)?;

        let new_root = arena.trim_root(root, 3)?;
        assert_eq!(new_root, root);

        let node = arena.get(root)?;
        assert_eq!(node.layer_count(), 2);
        assert_eq!(node.root_record(), &record::from_moves(&[3])?[..]);
        assert_eq!(node.turns(), &[Player::One, Player::Zero]);
        assert!(!node.generation_pending());
        for column in 0..WIDTH {
            assert_eq!(node.record(1, column), &record::from_moves(&[3, column])?[..]);
        }

        // out of range and null children are rejected
        assert_eq!(
            arena.trim_root(root, WIDTH),
            Err(EngineError::InvalidColumn { column: WIDTH })
        );
        Ok(())
    }

    #[test]
    pub fn trim_hands_root_to_child() -> Result<()> {
        let config = EngineConfig {
            max_depth: 2,
            ..small_config()
        };
        let mut budget = WorkBudget::new(1000, usize::MAX);
        let mut arena = NodeArena::new();
        let root = arena.insert(TriangleNode::new(&record::EMPTY, Player::Zero));
        arena.get_mut(root)?.generate_boards(&mut budget)?;
        arena.deepen_node(root, &mut budget, &config)?;
        let child = arena.get(root)?.child_nodes()[&3];

        let new_root = arena.trim_root(root, 3)?;
        assert_eq!(new_root, child);
        assert_eq!(arena.len(), 1);
        assert!(arena.get(root).is_err());
        assert_eq!(arena.get(new_root)?.root_record(), &record::from_moves(&[3])?[..]);
        Ok(())
    }

    #[test]
    pub fn new_tree_scores_every_column() -> Result<()> {
        let tree = DecisionTree::new(small_config())?;
        assert_eq!(tree.valid_moves()?, [true; WIDTH]);
        assert_eq!(tree.move_scores().len(), WIDTH);
        assert_eq!(tree.move_scores().get(3), Some(7.0));
        assert_eq!(tree.best_move()?, Some(3));
        assert_eq!(tree.move_count(), 0);
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.game_over()?, GameStatus::Playing);
        assert!(tree.is_computing());
        Ok(())
    }

    #[test]
    pub fn steps_alternate_phases() -> Result<()> {
        let mut tree = DecisionTree::new(small_config())?;
        assert_eq!(tree.phase(), Phase::Deepening);

        tree.step()?;
        assert_eq!(tree.phase(), Phase::Generating);
        assert_eq!(tree.depth(), 2);
        tree.step()?;
        assert_eq!(tree.phase(), Phase::Deepening);

        let progress = tree.drain_progress();
        assert!(progress.contains(&Progress::Depth { depth: 2 }));
        assert!(progress
            .iter()
            .any(|event| matches!(event, Progress::MoveScores { .. })));
        assert!(tree.drain_progress().is_empty());

        run_steps(&mut tree, 10)?;
        assert!(tree.depth() > 3);
        Ok(())
    }

    #[test]
    pub fn search_finds_immediate_win() -> Result<()> {
        // player one to move, three in a row on the bottom
        let position = record::from_moves(&[0, 6, 1, 6, 2, 5])?;
        let tree = DecisionTree::with_position(small_config(), &position, Player::Zero)?;
        assert_eq!(tree.move_scores().get(3), Some(f64::INFINITY));
        assert_eq!(tree.best_move()?, Some(3));

        let scores = serde_json::to_value(tree.move_scores())?;
        assert_eq!(scores["3"], "Infinity");

        // player zero to move, three stacked in the last column
        let position = record::from_moves(&[0, 6, 1, 6, 5, 6, 4])?;
        let tree = DecisionTree::with_position(small_config(), &position, Player::One)?;
        assert_eq!(tree.move_scores().get(6), Some(f64::INFINITY));
        assert_eq!(tree.best_move()?, Some(6));
        Ok(())
    }

    #[test]
    pub fn search_blocks_threat() -> Result<()> {
        let position = record::from_moves(&[0, 6, 2, 6, 4, 6])?;
        let mut tree = DecisionTree::with_position(small_config(), &position, Player::Zero)?;
        // grow and generate the reply layer
        run_steps(&mut tree, 2)?;

        for column in 0..WIDTH {
            let score = tree.move_scores().get(column);
            if column == 6 {
                assert!(score.map_or(false, f64::is_finite));
            } else {
                assert_eq!(score, Some(f64::NEG_INFINITY));
            }
        }
        assert_eq!(tree.best_move()?, Some(6));
        Ok(())
    }

    #[test]
    pub fn commit_keeps_searched_subtree() -> Result<()> {
        let mut tree = DecisionTree::new(small_config())?;
        // two densified layers, a delegation to 343 nodes and their generation
        run_steps(&mut tree, 6)?;
        assert_eq!(tree.arena().len(), 344);
        assert_eq!(tree.phase(), Phase::Deepening);

        assert_eq!(tree.commit_move(3)?, GameStatus::Playing);
        assert_eq!(tree.move_count(), 1);
        assert_eq!(tree.turn(), Player::One);
        assert_eq!(tree.root_record()?, record::from_moves(&[3])?);
        assert_eq!(tree.arena().len(), 50);
        assert_eq!(tree.frontier().len(), 49);
        assert_eq!(tree.depth(), 3);
        assert_eq!(tree.phase(), Phase::Deepening);

        tree.commit_move(3)?;
        assert_eq!(tree.arena().len(), 8);
        assert_eq!(tree.frontier().len(), 7);
        assert_eq!(tree.depth(), 2);

        // the root is now replaced by its delegated child
        tree.commit_move(3)?;
        assert_eq!(tree.arena().len(), 1);
        assert_eq!(tree.frontier(), &[tree.root()]);
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.root_record()?, record::from_moves(&[3, 3, 3])?);
        assert_eq!(tree.move_scores().len(), WIDTH);

        run_steps(&mut tree, 4)?;
        assert!(tree.depth() > 1);
        Ok(())
    }

    #[test]
    pub fn trim_mid_generation_rescales_cursors() -> Result<()> {
        let config = EngineConfig {
            max_operations: 5,
            ..small_config()
        };
        let mut tree = DecisionTree::new(config)?;
        // densify twice, the last slice generates 5 of 49 parents
        run_steps(&mut tree, 5)?;
        assert_eq!(tree.phase(), Phase::Generating);
        assert_eq!(tree.arena().get(tree.root())?.creation_index(), 5);

        tree.commit_move(0)?;
        let root = tree.arena().get(tree.root())?;
        assert_eq!(root.layer_count(), 3);
        assert_eq!(root.creation_index(), 5);
        assert!(root.generation_pending());
        assert_eq!(tree.phase(), Phase::Generating);
        assert_eq!(tree.frontier(), &[tree.root()]);
        check_tree(&tree)?;

        tree.step()?;
        assert!(!tree.arena().get(tree.root())?.generation_pending());
        assert_eq!(tree.phase(), Phase::Deepening);
        check_tree(&tree)?;
        Ok(())
    }

    #[test]
    pub fn trim_mid_generation_of_children() -> Result<()> {
        let config = EngineConfig {
            max_operations: 100,
            ..small_config()
        };
        let mut tree = DecisionTree::new(config)?;
        // the root delegates 343 children over four slices, then 100 are generated
        run_steps(&mut tree, 9)?;
        assert_eq!(tree.phase(), Phase::Generating);
        assert_eq!(tree.arena().len(), 344);

        tree.commit_move(2)?;
        assert_eq!(tree.phase(), Phase::Generating);
        assert_eq!(tree.frontier().len(), 49);
        assert_eq!(tree.depth(), 3);
        check_tree(&tree)?;

        tree.step()?;
        assert_eq!(tree.phase(), Phase::Deepening);
        assert!(tree.frontier().iter().all(|&id| tree
            .arena()
            .get(id)
            .map_or(false, |node| !node.generation_pending())));
        check_tree(&tree)?;
        Ok(())
    }

    #[test]
    pub fn trim_mid_delegation_keeps_delegating() -> Result<()> {
        let config = EngineConfig {
            max_operations: 100,
            ..small_config()
        };
        let mut tree = DecisionTree::new(config)?;
        // the root reaches max_depth and delegates 200 of its 343 records
        run_steps(&mut tree, 6)?;
        assert_eq!(tree.arena().get(tree.root())?.deepen_index(), 200);

        // only four delegated records lie under column 4
        tree.commit_move(4)?;
        let root = tree.arena().get(tree.root())?;
        assert_eq!(root.layer_count(), 3);
        assert_eq!(root.deepen_index(), 4);
        assert_eq!(root.child_nodes().len(), 4);
        assert_eq!(tree.phase(), Phase::Deepening);
        assert_eq!(tree.frontier(), &[tree.root()]);
        assert_eq!(tree.next_frontier().len(), 4);
        assert_eq!(tree.depth(), 2);
        check_tree(&tree)?;

        // the root finishes its layer below max_depth instead of growing
        tree.step()?;
        let root = tree.arena().get(tree.root())?;
        assert_eq!(root.layer_count(), 3);
        assert!(root.is_complete());
        assert_eq!(root.child_nodes().len(), 49);
        assert_eq!(tree.frontier().len(), 49);
        assert_eq!(tree.phase(), Phase::Generating);
        check_tree(&tree)?;
        Ok(())
    }

    #[test]
    pub fn trim_past_deepened_nodes_resumes_generation() -> Result<()> {
        let config = EngineConfig {
            max_operations: 100,
            ..small_config()
        };
        let mut tree = DecisionTree::new(config)?;
        // 343 children generated, then the first 50 of them densified
        run_steps(&mut tree, 13)?;
        assert_eq!(tree.phase(), Phase::Deepening);
        assert_eq!(tree.depth(), 4);
        tree.drain_progress();

        // every kept child was already densified this round
        tree.commit_move(0)?;
        assert_eq!(tree.phase(), Phase::Generating);
        assert_eq!(tree.frontier().len(), 49);
        assert_eq!(tree.depth(), 4);
        assert!(tree.drain_progress().contains(&Progress::Depth { depth: 4 }));
        check_tree(&tree)?;

        run_steps(&mut tree, 3)?;
        check_tree(&tree)?;
        Ok(())
    }

    #[test]
    pub fn trims_at_any_slice_boundary_keep_tree_consistent() -> Result<()> {
        let moves = [3, 2, 4, 3, 5, 2];
        for &max_depth in [2, 3, 4].iter() {
            for max_operations in 1..=5 {
                for steps in 0..12 {
                    let config = EngineConfig {
                        max_operations,
                        max_depth,
                        ..small_config()
                    };
                    let mut tree = DecisionTree::new(config)?;
                    for &column in moves.iter() {
                        for _ in 0..steps {
                            tree.step()?;
                            check_tree(&tree)?;
                        }
                        assert_eq!(tree.commit_move(column)?, GameStatus::Playing);
                        check_tree(&tree)?;
                    }
                    run_steps(&mut tree, 20)?;
                    check_tree(&tree)?;
                }
            }
        }
        Ok(())
    }

    #[test]
    pub fn densify_stays_within_memory_budget() -> Result<()> {
        let config = EngineConfig {
            max_memory: 1000,
            ..small_config()
        };
        let mut tree = DecisionTree::new(config)?;
        run_steps(&mut tree, 10)?;

        assert_eq!(tree.halted(), Some(Halt::Memory));
        // the layer that would not fit was delegated node by node instead
        assert!(tree.allocated_bytes() < 1000 + WIDTH * record::RECORD_SIZE);
        let root = tree.arena().get(tree.root())?;
        assert_eq!(root.layer_count(), 3);
        assert!(!root.child_nodes().is_empty());
        check_tree(&tree)?;
        Ok(())
    }

    #[test]
    pub fn invalid_commit_changes_nothing() -> Result<()> {
        let mut tree = DecisionTree::new(small_config())?;
        assert_eq!(
            tree.commit_move(WIDTH),
            Err(EngineError::InvalidColumn { column: WIDTH })
        );
        assert_eq!(tree.move_count(), 0);
        assert_eq!(tree.root_record()?, record::EMPTY);
        assert_eq!(tree.halted(), None);
        Ok(())
    }

    #[test]
    pub fn full_column_cannot_be_committed() -> Result<()> {
        let mut tree = DecisionTree::new(small_config())?;
        for _ in 0..HEIGHT {
            assert_eq!(tree.commit_move(3)?, GameStatus::Playing);
            tree.step()?;
        }
        assert!(!tree.valid_moves()?[3]);
        assert_eq!(
            tree.commit_move(3),
            Err(EngineError::InvalidColumn { column: 3 })
        );
        assert_eq!(tree.move_count(), HEIGHT);
        assert_eq!(tree.move_scores().get(3), None);
        assert_eq!(tree.move_scores().len(), WIDTH - 1);
        assert_ne!(tree.best_move()?, Some(3));
        Ok(())
    }

    #[test]
    pub fn full_board_is_a_draw() -> Result<()> {
        let position = from_columns(&DRAWN, [HEIGHT; WIDTH]);
        let mut tree = DecisionTree::with_position(small_config(), &position, Player::Zero)?;

        let status = tree.game_over()?;
        assert_eq!(status, GameStatus::Draw);
        assert_eq!(status.winner_code(), Some(-1));
        assert_eq!(
            serde_json::to_value(status)?,
            serde_json::json!({"status": true, "winner": -1})
        );
        assert_eq!(tree.halted(), Some(Halt::GameOver));
        assert_eq!(tree.best_move()?, None);
        assert!(tree.move_scores().is_empty());
        assert_eq!(
            tree.commit_move(0),
            Err(EngineError::InvalidColumn { column: 0 })
        );
        Ok(())
    }

    #[test]
    pub fn win_ends_the_game() -> Result<()> {
        let mut tree = DecisionTree::new(small_config())?;
        for &column in [3, 4, 3, 4, 3, 4].iter() {
            assert_eq!(tree.commit_move(column)?, GameStatus::Playing);
        }
        let status = tree.commit_move(3)?;
        assert_eq!(status, GameStatus::Won(Player::One));
        assert_eq!(
            serde_json::to_value(status)?,
            serde_json::json!({"status": true, "winner": 1})
        );

        assert_eq!(tree.halted(), Some(Halt::GameOver));
        assert!(!tree.is_computing());
        assert_eq!(tree.valid_moves()?, [false; WIDTH]);
        assert!(tree.move_scores().is_empty());
        assert_eq!(
            tree.commit_move(0),
            Err(EngineError::InvalidColumn { column: 0 })
        );
        assert!(!tree.resume());
        Ok(())
    }

    #[test]
    pub fn memory_halt_lifts_after_trim() -> Result<()> {
        let config = EngineConfig {
            max_memory: 2000,
            ..small_config()
        };
        let mut tree = DecisionTree::new(config)?;
        run_steps(&mut tree, 4)?;
        assert!(tree.allocated_bytes() >= 2000);
        assert!(!tree.step()?);
        assert_eq!(tree.halted(), Some(Halt::Memory));
        assert!(!tree.resume());

        // scores stay available while halted
        assert_eq!(tree.move_scores().len(), WIDTH);
        assert!(tree.best_move()?.is_some());

        tree.commit_move(3)?;
        assert!(tree.allocated_bytes() < 2000);
        assert_eq!(tree.halted(), None);
        assert!(tree.is_computing());
        Ok(())
    }

    #[test]
    pub fn halt_and_resume() -> Result<()> {
        let mut tree = DecisionTree::new(small_config())?;
        tree.halt();
        assert_eq!(tree.halted(), Some(Halt::Requested));
        assert!(!tree.step()?);
        assert_eq!(tree.depth(), 1);
        assert!(tree
            .drain_progress()
            .contains(&Progress::Computing { not_computing: true }));

        assert!(tree.resume());
        assert!(tree.step()?);
        assert_eq!(tree.depth(), 2);
        Ok(())
    }

    #[test]
    pub fn dump_describes_tree() -> Result<()> {
        let mut tree = DecisionTree::new(small_config())?;
        run_steps(&mut tree, 2)?;
        let dump = tree.dump()?;
        assert_eq!(dump.depth, 2);
        assert_eq!(dump.live_nodes, 1);
        assert_eq!(dump.root.layers, vec![1, 7, 49]);

        let json = serde_json::to_value(&dump)?;
        assert_eq!(json["root"]["creationIndex"], 7);
        Ok(())
    }

    #[test]
    pub fn worker_ignores_unknown_messages() -> Result<()> {
        let mut worker = Worker::new(small_config())?;
        assert_eq!(worker.handle_json(r#"{"type": "resign"}"#), None);
        assert_eq!(worker.handle_json("not json"), None);
        assert_eq!(worker.tree().move_count(), 0);

        assert_eq!(Request::from_json(r#"{"type": "makeMove"}"#), Some(Request::MakeMove));
        assert_eq!(
            Request::from_json(r#"{"type": "update", "column": 2}"#),
            Some(Request::Update { column: 2 })
        );
        Ok(())
    }

    #[test]
    pub fn worker_update_reply() -> Result<()> {
        let mut worker = Worker::new(small_config())?;
        let reply = worker
            .handle_json(r#"{"type": "update", "column": 3}"#)
            .ok_or_else(|| anyhow!("no reply to update"))?;
        let reply: serde_json::Value = serde_json::from_str(&reply)?;

        assert_eq!(reply["gameOver"], serde_json::json!({"status": false}));
        assert_eq!(reply["moveCount"], 1);
        assert_eq!(reply["validMoves"], serde_json::to_value([true; WIDTH])?);
        assert_eq!(reply["moveScores"].as_object().map(|scores| scores.len()), Some(WIDTH));
        assert!(reply.get("bestMove").is_none());

        match worker.handle(Request::Update { column: 9 }) {
            Some(Message::Error { error }) => assert!(error.contains('9')),
            other => return Err(anyhow!("expected an error, got {:?}", other)),
        }
        Ok(())
    }

    #[test]
    pub fn worker_plays_best_move() -> Result<()> {
        let mut worker = Worker::new(small_config())?;
        match worker.handle(Request::MakeMove) {
            Some(Message::Move(response)) => {
                assert_eq!(response.best_move, Some(3));
                assert_eq!(response.move_count, 1);
            }
            other => return Err(anyhow!("expected a move, got {:?}", other)),
        }
        assert_eq!(worker.tree().root_record()?, record::from_moves(&[3])?);
        Ok(())
    }

    #[test]
    pub fn worker_reports_game_over() -> Result<()> {
        let mut worker = Worker::new(small_config())?;
        let mut last = None;
        for &column in [3, 4, 3, 4, 3, 4, 3].iter() {
            last = worker.handle(Request::Update { column });
        }
        let text = match last {
            Some(Message::Move(response)) => {
                assert_eq!(response.game_over, GameStatus::Won(Player::One));
                assert_eq!(response.valid_moves, None);
                Message::Move(response).to_json()
            }
            other => return Err(anyhow!("expected a move, got {:?}", other)),
        };
        let reply: serde_json::Value =
            serde_json::from_str(&text.ok_or_else(|| anyhow!("reply did not encode"))?)?;
        assert_eq!(reply["gameOver"], serde_json::json!({"status": true, "winner": 1}));
        assert!(reply.get("validMoves").is_none());

        assert!(matches!(
            worker.handle(Request::MakeMove),
            Some(Message::Error { .. })
        ));

        assert!(worker.handle(Request::Reset).is_none());
        assert_eq!(worker.tree().move_count(), 0);
        assert!(worker.is_computing());
        Ok(())
    }

    #[test]
    pub fn worker_dumps_tree() -> Result<()> {
        let mut worker = Worker::new(small_config())?;
        worker.tick()?;
        let reply = worker
            .handle_json(r#"{"type": "dump"}"#)
            .ok_or_else(|| anyhow!("no dump"))?;
        let reply: serde_json::Value = serde_json::from_str(&reply)?;
        assert_eq!(reply["tree"]["depth"], 2);
        assert!(!worker.drain_progress().is_empty());
        Ok(())
    }

    #[test]
    pub fn spawned_worker_answers_between_slices() -> Result<()> {
        let handle = worker::spawn(small_config())?;
        handle
            .send(Request::Update { column: 3 })
            .map_err(|_| anyhow!("worker stopped"))?;

        let response = loop {
            match handle.messages().recv_timeout(Duration::from_secs(30))? {
                Message::Move(response) => break response,
                Message::Progress(_) => continue,
                other => return Err(anyhow!("unexpected message {:?}", other)),
            }
        };
        assert_eq!(response.move_count, 1);
        assert_eq!(response.game_over, GameStatus::Playing);

        handle.shutdown();
        Ok(())
    }
}
