// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MIN_PLAYERS: usize = 2;
pub const DEFAULT_MAX_MOVES: usize = 8;
pub const DEFAULT_MIN_MOVES_TO_END: usize = 2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameStatus {
    Running,
    Finished,
}

/// One player's caption plus the image generated from it.
///
/// `image_url` is `None` while generation is pending; `error` is set instead
/// of `image_url` when every provider failed for this move.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Move {
    pub id: String,
    pub player_name: String,
    pub caption: String,
    pub image_url: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRecord {
    pub game_id: String,
    pub player_names: Vec<String>,
    pub moves: Vec<Move>,
    pub status: GameStatus,
    pub max_moves: usize,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl GameRecord {
    /// Create a running game over an already-shuffled roster.
    ///
    /// The per-game move cap is `max(roster size, configured_max_moves)` so
    /// that every player gets at least one turn.
    pub fn new(player_names: Vec<String>, configured_max_moves: usize) -> Self {
        let max_moves = max_moves_for(player_names.len(), configured_max_moves);
        Self {
            game_id: Uuid::new_v4().to_string(),
            player_names,
            moves: Vec::new(),
            status: GameStatus::Running,
            max_moves,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn game_over(&self) -> bool {
        self.status == GameStatus::Finished
    }

    /// Round-robin turn index over the fixed roster.
    pub fn current_player_index(&self) -> usize {
        self.moves.len() % self.player_names.len()
    }

    pub fn current_player_name(&self) -> Option<&str> {
        if self.game_over() {
            return None;
        }
        self.player_names
            .get(self.current_player_index())
            .map(String::as_str)
    }

    /// The image the current player should be captioning, if any.
    ///
    /// The most recent move's image is shown even when generation failed for
    /// it; captioning never blocks on generation.
    pub fn prior_image_url(&self) -> Option<&str> {
        self.moves.last().and_then(|mv| mv.image_url.as_deref())
    }

    /// Append a move, finishing the game when the move cap is reached.
    pub fn with_move(&self, mv: Move) -> Self {
        let mut moves = self.moves.clone();
        moves.push(mv);
        let finished = moves.len() >= self.max_moves;
        Self {
            moves,
            status: if finished {
                GameStatus::Finished
            } else {
                self.status
            },
            finished_at: if finished && self.finished_at.is_none() {
                Some(Utc::now())
            } else {
                self.finished_at
            },
            ..self.clone()
        }
    }

    /// Record a generation result on the move with the given id.
    ///
    /// Updates are keyed by id, never by list position: the list may have
    /// grown between the request and its completion. An unknown id leaves the
    /// record unchanged.
    pub fn with_move_image(&self, move_id: &str, image_url: &str) -> Self {
        self.map_move(move_id, |mv| Move {
            image_url: Some(image_url.to_string()),
            error: None,
            ..mv
        })
    }

    pub fn with_move_error(&self, move_id: &str, message: &str) -> Self {
        self.map_move(move_id, |mv| Move {
            error: Some(message.to_string()),
            ..mv
        })
    }

    fn map_move(&self, move_id: &str, update: impl Fn(Move) -> Move) -> Self {
        let moves = self
            .moves
            .iter()
            .map(|mv| {
                if mv.id == move_id {
                    update(mv.clone())
                } else {
                    mv.clone()
                }
            })
            .collect();
        Self {
            moves,
            ..self.clone()
        }
    }

    /// Force the terminal state. A finished game never un-finishes.
    pub fn finished(&self) -> Self {
        if self.game_over() {
            return self.clone();
        }
        Self {
            status: GameStatus::Finished,
            finished_at: Some(Utc::now()),
            ..self.clone()
        }
    }

    /// "Play again with the same players": reshuffled roster, no moves.
    pub fn reshuffled(&self) -> Self {
        Self {
            player_names: shuffle_roster(self.player_names.clone()),
            moves: Vec::new(),
            status: GameStatus::Running,
            created_at: Utc::now(),
            finished_at: None,
            ..self.clone()
        }
    }

    pub fn snapshot(&self) -> GameSnapshotResponse {
        GameSnapshotResponse {
            game_id: self.game_id.clone(),
            status: self.status,
            player_names: self.player_names.clone(),
            moves: self.moves.clone(),
            current_player_index: self.current_player_index(),
            current_player_name: self.current_player_name().map(ToOwned::to_owned),
            prior_image_url: self.prior_image_url().map(ToOwned::to_owned),
            max_moves: self.max_moves,
            game_over: self.game_over(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

pub fn max_moves_for(player_count: usize, configured_max_moves: usize) -> usize {
    player_count.max(configured_max_moves)
}

pub fn shuffle_roster(mut player_names: Vec<String>) -> Vec<String> {
    player_names.shuffle(&mut rand::rng());
    player_names
}

/// Trim player names and drop empty entries, preserving order.
pub fn normalize_player_names(player_names: Vec<String>) -> Vec<String> {
    player_names
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Trimmed caption, or `None` when it is empty or whitespace.
pub fn normalize_caption(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn new_move_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGameRequest {
    pub player_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSnapshotResponse {
    pub game_id: String,
    pub status: GameStatus,
    pub player_names: Vec<String>,
    pub moves: Vec<Move>,
    pub current_player_index: usize,
    pub current_player_name: Option<String>,
    pub prior_image_url: Option<String>,
    pub max_moves: usize,
    pub game_over: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitCaptionRequest {
    pub caption: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitCaptionResponse {
    pub game_id: String,
    pub move_id: String,
    pub player_name: String,
    pub move_count: usize,
    pub status: GameStatus,
    pub current_player_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartGameRequest {
    pub same_players: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartGameResponse {
    pub game_id: String,
    /// `Some` when the game restarted with the same roster; `None` when the
    /// record was discarded and a fresh roster must be collected.
    pub snapshot: Option<GameSnapshotResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateImageRequest {
    pub caption: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateImageResponse {
    #[serde(rename = "imageUrl")]
    pub image_url: String,
}
