//! Packed position records
//!
//! A position is stored as a fixed-size record of [`RECORD_SIZE`] bytes:
//!
//! ```text
//! [ heights[0] .. heights[WIDTH-1] | column_bits[0] .. column_bits[WIDTH-1] ]
//! ```
//!
//! `heights[c]` is the number of pieces in column `c`. Bit `r` of
//! `column_bits[c]` is set when the piece on row `r` (0 is the bottom row)
//! belongs to [`Player::One`]; occupancy comes from the height alone.
//!
//! Two sentinel values overload the first height byte, which can never
//! legitimately exceed `HEIGHT`:
//! - [`NULL`]: the slot holds no position (illegal move or pruned parent)
//! - [`WON`]: the game is over, and the second byte holds the winner (0 or 1)
//!
//! Layers of the search tree are plain byte buffers of consecutive records, so
//! every function here works on `&[u8]` slices of exactly one record.

use crate::error::{EngineError, Result};
use crate::{HEIGHT, WIDTH};

/// Bytes per position record
pub const RECORD_SIZE: usize = 14;

/// Sentinel marking a slot with no valid position
pub const NULL: u8 = 0xff;

/// Sentinel marking a won position, the following byte holds the winner
pub const WON: u8 = 0xfe;

/// A single position record
pub type Record = [u8; RECORD_SIZE];

/// The empty board
pub const EMPTY: Record = [0; RECORD_SIZE];

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Player {
    Zero,
    One,
}

impl Player {
    pub fn other(self) -> Self {
        match self {
            Player::Zero => Player::One,
            Player::One => Player::Zero,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Player::Zero => 0,
            Player::One => 1,
        }
    }

    fn from_bit(bit: bool) -> Self {
        if bit {
            Player::One
        } else {
            Player::Zero
        }
    }
}

/// A line direction on the board as a (column, row) step
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Horizontal,
    Vertical,
    /// rising to the right
    Diagonal,
    /// falling to the right
    AntiDiagonal,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Horizontal,
        Direction::Vertical,
        Direction::Diagonal,
        Direction::AntiDiagonal,
    ];

    fn step(self) -> (isize, isize) {
        match self {
            Direction::Horizontal => (1, 0),
            Direction::Vertical => (0, 1),
            Direction::Diagonal => (1, 1),
            Direction::AntiDiagonal => (1, -1),
        }
    }
}

pub fn is_null(record: &[u8]) -> bool {
    record[0] == NULL
}

pub fn is_won(record: &[u8]) -> bool {
    record[0] == WON
}

/// NULL and WON records never have children
pub fn is_childless(record: &[u8]) -> bool {
    is_null(record) || is_won(record)
}

pub fn is_parent(record: &[u8]) -> bool {
    !is_childless(record)
}

pub fn set_null(record: &mut [u8]) {
    record[0] = NULL;
}

pub fn set_won(record: &mut [u8], winner: Player) {
    record[0] = WON;
    record[1] = winner.index();
}

/// The winner of a `WON` record
pub fn winner(record: &[u8]) -> Option<Player> {
    if is_won(record) {
        Some(Player::from_bit(record[1] > 0))
    } else {
        None
    }
}

/// Number of pieces in a column of a non-sentinel record
pub fn height(record: &[u8], column: usize) -> usize {
    record[column] as usize
}

/// The owner of the piece at `(column, row)`, or `None` if the cell is empty
pub fn cell(record: &[u8], column: usize, row: usize) -> Option<Player> {
    if height(record, column) > row {
        Some(Player::from_bit(record[column + WIDTH] & (1 << row) != 0))
    } else {
        None
    }
}

/// Total pieces on the board of a non-sentinel record
pub fn move_count(record: &[u8]) -> usize {
    record[..WIDTH].iter().map(|&h| h as usize).sum()
}

/// Drops a piece for `mover` into `column`
///
/// Callers must follow up with [`check_win`] on the same record.
pub fn apply_move(record: &mut [u8], column: usize, mover: Player) -> Result<()> {
    if column >= WIDTH || is_childless(record) {
        return Err(EngineError::InvalidColumn { column });
    }
    let row = height(record, column);
    if row >= HEIGHT {
        return Err(EngineError::ColumnFull { column });
    }
    if mover == Player::One {
        record[column + WIDTH] |= 1 << row;
    } else {
        record[column + WIDTH] &= !(1 << row);
    }
    record[column] += 1;
    Ok(())
}

/// Checks for four in a row through the piece just dropped into `column`
///
/// On a win the record is overwritten in place with the `WON` sentinel and
/// the winner byte.
pub fn check_win(record: &mut [u8], column: usize) -> bool {
    if is_childless(record) || height(record, column) == 0 {
        return false;
    }
    let row = height(record, column) - 1;
    let color = match cell(record, column, row) {
        Some(color) => color,
        None => return false,
    };

    for direction in Direction::ALL.iter() {
        let (dc, dr) = direction.step();
        let run = 1
            + run_length(record, column, row, dc, dr, color)
            + run_length(record, column, row, -dc, -dr, color);
        if run >= 4 {
            set_won(record, color);
            return true;
        }
    }
    false
}

// count matching pieces walking away from (column, row), not including it
fn run_length(
    record: &[u8],
    column: usize,
    row: usize,
    dc: isize,
    dr: isize,
    color: Player,
) -> usize {
    let mut run = 0;
    let mut x = column as isize + dc;
    let mut y = row as isize + dr;
    while x >= 0 && x < WIDTH as isize && y >= 0 && y < HEIGHT as isize {
        if cell(record, x as usize, y as usize) != Some(color) {
            break;
        }
        run += 1;
        x += dc;
        y += dr;
    }
    run
}

fn score_pieces(zero_count: i32, one_count: i32) -> f64 {
    // a set of four only counts while the other player has no piece in it
    if zero_count != 0 && one_count == 0 {
        -100f64.powi(zero_count - 1)
    } else if zero_count == 0 && one_count != 0 {
        100f64.powi(one_count - 1)
    } else {
        0.0
    }
}

/// Scores every set of four contiguous cells along one direction
pub fn line_score(record: &[u8], direction: Direction) -> f64 {
    let (dc, dr) = direction.step();
    let mut score = 0.0;

    for column in 0..WIDTH as isize {
        for row in 0..HEIGHT as isize {
            let end_column = column + 3 * dc;
            let end_row = row + 3 * dr;
            if end_column >= WIDTH as isize || end_row < 0 || end_row >= HEIGHT as isize {
                continue;
            }

            let mut zero_count = 0;
            let mut one_count = 0;
            for i in 0..4 {
                match cell(record, (column + i * dc) as usize, (row + i * dr) as usize) {
                    Some(Player::One) => one_count += 1,
                    Some(Player::Zero) => zero_count += 1,
                    None => {}
                }
            }
            score += score_pieces(zero_count, one_count);
        }
    }
    score
}

/// Heuristic value of a position, positive values favour [`Player::One`]
///
/// Won records score infinitely in favour of the winner.
pub fn static_score(record: &[u8]) -> f64 {
    match winner(record) {
        Some(Player::One) => return f64::INFINITY,
        Some(Player::Zero) => return f64::NEG_INFINITY,
        None => {}
    }

    Direction::ALL
        .iter()
        .map(|&direction| line_score(record, direction))
        .sum()
}

/// Builds a record by alternating moves from the empty board, [`Player::One`] first
pub fn from_moves(moves: &[usize]) -> Result<Record> {
    let mut record = EMPTY;
    let mut mover = Player::One;
    for &column in moves {
        apply_move(&mut record, column, mover)?;
        check_win(&mut record, column);
        mover = mover.other();
    }
    Ok(record)
}

/// Text diagram of a record, top row first
pub fn render(record: &[u8]) -> String {
    if is_null(record) {
        return String::from("<null>");
    }
    if let Some(player) = winner(record) {
        return format!("<won by {}>", player.index());
    }

    let mut out = String::new();
    for row in (0..HEIGHT).rev() {
        for column in 0..WIDTH {
            out.push('|');
            out.push(match cell(record, column, row) {
                Some(Player::One) => '1',
                Some(Player::Zero) => '0',
                None => ' ',
            });
        }
        out.push_str("|\n");
    }
    out
}
