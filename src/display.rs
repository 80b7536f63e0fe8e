use anyhow::{anyhow, Result};
use crossterm::{
    cursor::MoveTo,
    style::{style, Attribute, Color, PrintStyledContent},
    QueueableCommand,
};

use std::io::{stdout, Write};

use connect4_tree::record::{self, Player};
use connect4_tree::{HEIGHT, WIDTH};

/// Draws a position record at the cursor, column numbers on top
pub fn draw(position: &[u8]) -> Result<()> {
    if !record::is_parent(position) {
        return Err(anyhow!("cannot draw {}", record::render(position)));
    }
    let mut stdout = stdout();

    let cols: String = (1..=WIDTH).map(|x| x.to_string()).collect();
    stdout.queue(PrintStyledContent(style(cols + "\n")))?;
    for _ in 0..HEIGHT {
        stdout.queue(PrintStyledContent(style("\n")))?;
    }
    stdout.flush()?;

    // the cursor now sits one line below the bottom row
    let (origin_x, origin_y) = crossterm::cursor::position()?;

    for row in 0..HEIGHT {
        for column in 0..WIDTH {
            let (pos_x, pos_y) = (origin_x + column as u16, origin_y - 1 - row as u16);

            stdout
                .queue(MoveTo(pos_x, pos_y))?
                .queue(PrintStyledContent(
                    style("O")
                        .attribute(Attribute::Bold)
                        .on(Color::DarkBlue)
                        .with(match record::cell(position, column, row) {
                            Some(Player::One) => Color::Red,
                            Some(Player::Zero) => Color::Yellow,
                            None => Color::DarkBlue,
                        }),
                ))?;
        }
    }
    stdout
        .queue(MoveTo(origin_x, origin_y))?
        .queue(PrintStyledContent(style("\n")))?;
    stdout.flush()?;
    Ok(())
}

/// Human facing player number, the first player to move is player 1
pub fn player_number(player: Player) -> usize {
    match player {
        Player::One => 1,
        Player::Zero => 2,
    }
}
