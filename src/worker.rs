//! The message boundary between the engine and a board UI
//!
//! Clients send [`Request`]s and receive [`Message`]s. A [`Worker`] handles
//! requests synchronously and runs work slices when asked; [`spawn`] puts a
//! worker on its own thread that computes in the background and answers
//! requests between slices. Both sides also speak JSON, one object per message.

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, SendError, Sender};
use std::thread::{self, JoinHandle};

use crate::config::EngineConfig;
use crate::decision_tree::{DecisionTree, GameStatus, MoveScores, Progress, TreeDump};
use crate::error::{EngineError, Result};
use crate::WIDTH;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    /// The opponent played `column`
    Update { column: usize },
    /// Pick the best column for the player to move and play it
    MakeMove,
    /// Start a new game
    Reset,
    /// Snapshot the tree for debugging
    Dump,
}

impl Request {
    /// Parses a JSON request, logging and dropping anything unrecognized
    pub fn from_json(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(request) => Some(request),
            Err(err) => {
                warn!("ignoring unrecognized message {}: {}", text.trim(), err);
                None
            }
        }
    }
}

/// The state of the game after a committed move
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveResponse {
    pub game_over: GameStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_move: Option<usize>,
    pub move_scores: MoveScores,
    pub move_count: usize,
    pub depth: usize,
    /// Omitted once the game is over
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_moves: Option<[bool; WIDTH]>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Message {
    Move(MoveResponse),
    Dump { tree: Box<TreeDump> },
    Progress(Progress),
    Error { error: String },
}

impl Message {
    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(text) => Some(text),
            Err(err) => {
                error!("failed to encode message: {}", err);
                None
            }
        }
    }

    fn error(err: &EngineError) -> Self {
        Message::Error {
            error: err.to_string(),
        }
    }
}

/// Owns the decision tree for one session
pub struct Worker {
    config: EngineConfig,
    tree: DecisionTree,
}

impl Worker {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let tree = DecisionTree::new(config.clone())?;
        Ok(Self { config, tree })
    }

    pub fn tree(&self) -> &DecisionTree {
        &self.tree
    }

    pub fn is_computing(&self) -> bool {
        self.tree.is_computing()
    }

    /// Answers a request, `reset` has no reply
    pub fn handle(&mut self, request: Request) -> Option<Message> {
        match request {
            Request::Update { column } => Some(match self.commit(column, None) {
                Ok(response) => Message::Move(response),
                Err(err) => Message::error(&err),
            }),
            Request::MakeMove => Some(match self.make_move() {
                Ok(response) => Message::Move(response),
                Err(err) => Message::error(&err),
            }),
            Request::Reset => {
                if let Err(err) = self.reset() {
                    error!("reset failed: {}", err);
                    return Some(Message::error(&err));
                }
                None
            }
            Request::Dump => Some(match self.tree.dump() {
                Ok(tree) => Message::Dump {
                    tree: Box::new(tree),
                },
                Err(err) => Message::error(&err),
            }),
        }
    }

    /// Answers a JSON request with a JSON reply, unknown messages are ignored
    pub fn handle_json(&mut self, text: &str) -> Option<String> {
        let request = Request::from_json(text)?;
        self.handle(request)?.to_json()
    }

    /// Runs one work slice, returning whether more work remains
    ///
    /// Errors are fatal: the tree stays halted until the next reset.
    pub fn tick(&mut self) -> Result<bool> {
        self.tree.step().map_err(|err| {
            error!("computation stopped: {}", err);
            err
        })
    }

    /// Progress notifications queued since the last call
    pub fn drain_progress(&mut self) -> Vec<Message> {
        self.tree
            .drain_progress()
            .into_iter()
            .map(Message::Progress)
            .collect()
    }

    fn reset(&mut self) -> Result<()> {
        info!("resetting to an empty board");
        self.tree = DecisionTree::new(self.config.clone())?;
        Ok(())
    }

    fn make_move(&mut self) -> Result<MoveResponse> {
        if self.tree.game_over()?.is_over() {
            return Err(EngineError::InvalidColumn { column: WIDTH });
        }
        let column = self
            .tree
            .best_move()?
            .ok_or(EngineError::InvalidColumn { column: WIDTH })?;
        info!("computer plays column {}", column);
        self.commit(column, Some(column))
    }

    fn commit(&mut self, column: usize, best_move: Option<usize>) -> Result<MoveResponse> {
        let game_over = self.tree.commit_move(column)?;
        let valid_moves = if game_over.is_over() {
            None
        } else {
            Some(self.tree.valid_moves()?)
        };

        Ok(MoveResponse {
            game_over,
            best_move,
            move_scores: self.tree.move_scores().clone(),
            move_count: self.tree.move_count(),
            depth: self.tree.depth(),
            valid_moves,
        })
    }
}

/// Client side of a worker running on its own thread
pub struct WorkerHandle {
    requests: Sender<Request>,
    messages: Receiver<Message>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn send(&self, request: Request) -> std::result::Result<(), SendError<Request>> {
        self.requests.send(request)
    }

    /// Replies and progress notifications, in the order they were produced
    pub fn messages(&self) -> &Receiver<Message> {
        &self.messages
    }

    /// Another sender for requests, e.g. for a thread reading input
    ///
    /// The worker keeps running until every requester is dropped.
    pub fn requester(&self) -> Sender<Request> {
        self.requests.clone()
    }

    /// Stops accepting requests from this handle
    ///
    /// Requests already queued are still answered, and [`messages`](Self::messages)
    /// disconnects once the worker thread has exited.
    pub fn close(&mut self) {
        let (closed, _) = channel();
        drop(std::mem::replace(&mut self.requests, closed));
    }

    /// Closes the request channel and waits for the worker thread to exit
    pub fn shutdown(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.join();
    }
}

/// Starts a worker thread computing in the background
///
/// Between work slices the thread waits up to `operation_delay` for a
/// request, so requests are always handled on a settled tree. The thread
/// exits once every sender is dropped.
pub fn spawn(config: EngineConfig) -> Result<WorkerHandle> {
    let mut worker = Worker::new(config.clone())?;
    let (request_tx, request_rx) = channel::<Request>();
    let (message_tx, message_rx) = channel::<Message>();
    let delay = config.operation_delay();

    let thread = thread::spawn(move || loop {
        let incoming = if worker.is_computing() {
            request_rx.recv_timeout(delay)
        } else {
            request_rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
        };

        match incoming {
            Ok(request) => {
                if let Some(reply) = worker.handle(request) {
                    if message_tx.send(reply).is_err() {
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Err(err) = worker.tick() {
                    if message_tx.send(Message::error(&err)).is_err() {
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }

        for progress in worker.drain_progress() {
            if message_tx.send(progress).is_err() {
                return;
            }
        }
    });

    Ok(WorkerHandle {
        requests: request_tx,
        messages: message_rx,
        thread: Some(thread),
    })
}
