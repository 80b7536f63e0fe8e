//! An incremental game tree engine for the board game 'Connect 4'
//!
//! The engine grows a lookahead tree in small, resumable work slices,
//! scores the first moves with alpha-beta search over that tree, and keeps
//! the searched subtree alive across real moves instead of starting over.
//!
//! # Basic Usage
//!
//! ```
//! use connect4_tree::{config::EngineConfig, decision_tree::DecisionTree};
//!
//!# use std::error::Error;
//!# fn main() -> Result<(), Box<dyn Error>> {
//! let mut tree = DecisionTree::new(EngineConfig::default())?;
//! // let the engine think for a few slices
//! for _ in 0..4 {
//!     tree.step()?;
//! }
//! let column = tree.best_move()?.expect("the empty board has legal moves");
//! tree.commit_move(column)?;
//!
//! assert_eq!(tree.move_count(), 1);
//!# Ok(())
//!# }
//! ```

use static_assertions::*;
pub use anyhow;

pub mod error;

pub mod config;

pub mod record;

pub mod budget;

pub mod triangle;

pub mod decision_tree;

pub mod worker;

mod test;

/// The width of the game board in tiles
pub const WIDTH: usize = 7;

/// The height of the game board in tiles
pub const HEIGHT: usize = 6;

// a column's pieces are packed into a single byte
const_assert!(HEIGHT < 8);
// heights must never collide with the NULL/WON sentinels
const_assert!(HEIGHT < record::WON as usize);
const_assert_eq!(record::RECORD_SIZE, 2 * WIDTH);

/// Returns the columns ordered from the middle outwards, as
/// the middle columns are often better moves
pub const fn move_order() -> [usize; WIDTH] {
    let mut move_order = [0; WIDTH];
    let mut i = 0;
    while i < WIDTH {
        move_order[i] = (WIDTH / 2) + (i % 2) * (i / 2 + 1) - (1 - i % 2) * (i / 2);
        i += 1;
    }
    move_order
}
