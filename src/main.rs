use anyhow::{anyhow, Result};
use clap::Parser;
use indicatif::ProgressBar;
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

use std::io::{stdin, stdout, BufRead, Stdin, Write};
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::{Duration, Instant};

use connect4_tree::config::EngineConfig;
use connect4_tree::decision_tree::{GameStatus, Progress};
use connect4_tree::record::{self, Player};
use connect4_tree::worker::{self, Message, MoveResponse, Request, WorkerHandle};
use connect4_tree::WIDTH;

mod display;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(author, version, about = "Connect 4 against an incrementally grown game tree", long_about = None)]
struct Args {
    /// Speak the JSON message protocol on stdin/stdout instead of playing in the terminal
    #[arg(long)]
    json: bool,
    /// JSON file overriding the engine limits
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// How long the AI thinks before each move, in milliseconds
    #[arg(long, default_value_t = 3000)]
    think_ms: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    // logs go to stderr so they never mix with the board or the protocol
    SimpleLogger::new().with_level(LevelFilter::Warn).env().init()?;

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    info!("engine config: {:?}", config);

    if args.json {
        serve_json(config)
    } else {
        play(config, Duration::from_millis(args.think_ms))
    }
}

/// Forwards JSON requests from stdin to the worker and prints every message it sends
fn serve_json(config: EngineConfig) -> Result<()> {
    let mut handle = worker::spawn(config)?;
    let requests = handle.requester();

    let reader = thread::spawn(move || -> Result<()> {
        for line in stdin().lock().lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Some(request) = Request::from_json(&line) {
                if requests.send(request).is_err() {
                    break;
                }
            }
        }
        Ok(())
    });

    loop {
        match handle.messages().recv_timeout(POLL_INTERVAL) {
            Ok(message) => print_json(&message)?,
            Err(RecvTimeoutError::Timeout) => {
                if reader.is_finished() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // input is closed, answer whatever is still queued
    handle.close();
    for message in handle.messages().iter() {
        print_json(&message)?;
    }
    reader
        .join()
        .map_err(|_| anyhow!("stdin reader panicked"))??;
    handle.shutdown();
    Ok(())
}

fn print_json(message: &Message) -> Result<()> {
    if let Some(text) = message.to_json() {
        let mut stdout = stdout();
        writeln!(stdout, "{}", text)?;
        stdout.flush()?;
    }
    Ok(())
}

fn ask_ai_controlled(stdin: &Stdin, player: usize) -> Result<bool> {
    loop {
        let mut buffer = String::new();
        print!("Is player {} AI controlled? y/n: ", player);
        stdout().flush()?;
        stdin.read_line(&mut buffer)?;
        match buffer.to_lowercase().chars().next() {
            Some('y') => return Ok(true),
            Some('n') => return Ok(false),
            _ => println!("Unknown answer given"),
        }
    }
}

/// Lets the engine compute in the background for `think`, showing how deep it got
fn think_for(handle: &WorkerHandle, think: Duration) -> Result<()> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_message("AI is thinking...");
    spinner.enable_steady_tick(100);

    let deadline = Instant::now() + think;
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match handle.messages().recv_timeout(deadline - now) {
            Ok(Message::Progress(Progress::Depth { depth })) => {
                spinner.set_message(&format!("AI is thinking... {} moves ahead", depth));
            }
            Ok(Message::Progress(Progress::Complete { .. })) => break,
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => {
                spinner.finish_and_clear();
                return Err(anyhow!("engine thread stopped"));
            }
        }
    }
    spinner.finish_and_clear();
    Ok(())
}

/// Blocks until the reply to the last request, skipping progress notifications
fn wait_for_reply(handle: &WorkerHandle) -> Result<Message> {
    for message in handle.messages().iter() {
        if let Message::Progress(_) = message {
            continue;
        }
        return Ok(message);
    }
    Err(anyhow!("engine thread stopped"))
}

fn report_scores(response: &MoveResponse) {
    let scores: Vec<String> = response
        .move_scores
        .iter()
        .map(|(column, score)| format!("{}: {}", column + 1, score))
        .collect();
    println!(
        "Searched {} moves ahead, scores for the next player: {}",
        response.depth,
        scores.join(", ")
    );
}

fn play(config: EngineConfig, think: Duration) -> Result<()> {
    let handle = worker::spawn(config)?;
    let stdin = stdin();

    println!("Welcome to Connect 4\n");
    let ai_players = (ask_ai_controlled(&stdin, 1)?, ask_ai_controlled(&stdin, 2)?);

    // kept in step with the engine's root for drawing
    let mut board = record::EMPTY;
    let mut mover = Player::One;

    // game loop
    loop {
        display::draw(&board)?;
        let ai_controlled = match mover {
            Player::One => ai_players.0,
            Player::Zero => ai_players.1,
        };

        let (request, chosen) = if ai_controlled {
            think_for(&handle, think)?;
            (Request::MakeMove, None)
        } else {
            print!("Move input > ");
            stdout().flush()?;
            let mut input_str = String::new();
            stdin.read_line(&mut input_str)?;

            match input_str.trim().parse::<usize>() {
                Ok(column) if column >= 1 && column <= WIDTH => {
                    (Request::Update { column: column - 1 }, Some(column - 1))
                }
                _ => {
                    println!(
                        "Invalid move {}, columns must be between 1 and {}",
                        input_str.trim(),
                        WIDTH
                    );
                    continue;
                }
            }
        };

        handle
            .send(request)
            .map_err(|_| anyhow!("engine thread stopped"))?;
        let response = match wait_for_reply(&handle)? {
            Message::Move(response) => response,
            Message::Error { error } => {
                println!("{}", error);
                // try the move again
                continue;
            }
            other => return Err(anyhow!("unexpected reply {:?}", other)),
        };

        let column = match chosen.or(response.best_move) {
            Some(column) => column,
            None => return Err(anyhow!("engine played without naming a column")),
        };
        if ai_controlled {
            println!("Best move: {}", column + 1);
        }
        record::apply_move(&mut board, column, mover)?;

        match response.game_over {
            GameStatus::Playing => report_scores(&response),
            GameStatus::Won(winner) => {
                display::draw(&board)?;
                println!("Player {} wins!", display::player_number(winner));
                break;
            }
            GameStatus::Draw => {
                display::draw(&board)?;
                println!("Draw!");
                break;
            }
        }
        mover = mover.other();
    }

    handle.shutdown();
    Ok(())
}
