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

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::{Client as DynamoClient, types::AttributeValue};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use lambda_http::run as lambda_run;
use telefone_common::{
    CreateGameRequest, DEFAULT_MAX_MOVES, DEFAULT_MIN_MOVES_TO_END, GameRecord,
    GameSnapshotResponse, GenerateImageRequest, GenerateImageResponse, MIN_PLAYERS, Move,
    RestartGameRequest, RestartGameResponse, SubmitCaptionRequest, SubmitCaptionResponse,
    new_move_id, normalize_caption, normalize_player_names, shuffle_roster,
};
use tokio::sync::RwLock;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    store: Arc<RwLock<InMemoryStore>>,
    mirror: Option<Arc<dyn GameMirror>>,
    generator: Arc<dyn ImageGenerator>,
    settings: GameSettings,
}

#[derive(Default)]
struct InMemoryStore {
    games: HashMap<String, GameRecord>,
}

#[derive(Debug, Clone, Copy)]
struct GameSettings {
    max_moves: usize,
    min_moves_to_end: usize,
}

impl GameSettings {
    fn from_env() -> Self {
        Self {
            max_moves: parse_env_usize("TELEFONE_MAX_MOVES", DEFAULT_MAX_MOVES),
            min_moves_to_end: parse_env_usize(
                "TELEFONE_MIN_MOVES_TO_END",
                DEFAULT_MIN_MOVES_TO_END,
            ),
        }
    }
}

/// Client for the image-generation endpoint. One generation request is issued
/// per submitted caption; the result is written back onto the matching move.
#[async_trait]
trait ImageGenerator: Send + Sync {
    async fn generate(&self, caption: &str) -> anyhow::Result<String>;
}

#[derive(Clone)]
struct HttpImageGenerator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpImageGenerator {
    fn from_env() -> Self {
        let base_url = std::env::var("IMAGE_SERVICE_BASE_URL")
            .ok()
            .unwrap_or_else(|| "http://image-service:8083".to_string());

        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    async fn generate(&self, caption: &str) -> anyhow::Result<String> {
        let url = format!("{}/v1/images", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .json(&GenerateImageRequest {
                caption: caption.to_string(),
            })
            .send()
            .await
            .context("failed to call image-service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            anyhow::bail!("image-service returned {status}: {body}");
        }

        let generated = response
            .json::<GenerateImageResponse>()
            .await
            .context("invalid image-service response")?;
        Ok(generated.image_url)
    }
}

/// Best-effort durable mirror of game records, keyed by game id. Write
/// failures never fail the calling state transition.
#[async_trait]
trait GameMirror: Send + Sync {
    async fn save(&self, record: &GameRecord) -> anyhow::Result<()>;
    async fn load(&self, game_id: &str) -> anyhow::Result<Option<GameRecord>>;
    async fn delete(&self, game_id: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct DynamoGameMirror {
    client: DynamoClient,
    table_name: String,
}

#[async_trait]
impl GameMirror for DynamoGameMirror {
    async fn save(&self, record: &GameRecord) -> anyhow::Result<()> {
        let payload = serde_json::to_string(record).context("failed to encode game record")?;
        self.client
            .put_item()
            .table_name(&self.table_name)
            .item("game_id", AttributeValue::S(record.game_id.clone()))
            .item("record", AttributeValue::S(payload))
            .item("updated_at", AttributeValue::S(Utc::now().to_rfc3339()))
            .send()
            .await
            .context("failed to put item into games table")?;
        Ok(())
    }

    async fn load(&self, game_id: &str) -> anyhow::Result<Option<GameRecord>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("game_id", AttributeValue::S(game_id.to_string()))
            .send()
            .await
            .context("failed to get item from games table")?;

        let Some(item) = output.item() else {
            return Ok(None);
        };
        let Some(payload) = item.get("record").and_then(|value| value.as_s().ok()) else {
            warn!(game_id = %game_id, "mirrored game item has no record attribute");
            return Ok(None);
        };

        match serde_json::from_str::<GameRecord>(payload) {
            Ok(record) => Ok(Some(record)),
            Err(error) => {
                warn!(game_id = %game_id, error = %error, "failed to parse mirrored game record");
                Ok(None)
            }
        }
    }

    async fn delete(&self, game_id: &str) -> anyhow::Result<()> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key("game_id", AttributeValue::S(game_id.to_string()))
            .send()
            .await
            .context("failed to delete item from games table")?;
        Ok(())
    }
}

impl AppState {
    async fn from_env() -> Self {
        let mirror: Option<Arc<dyn GameMirror>> =
            if std::env::var("DYNAMODB_ENDPOINT").is_ok() || std::env::var("AWS_REGION").is_ok() {
                let mut loader = aws_config::defaults(BehaviorVersion::latest());
                if let Ok(endpoint) = std::env::var("DYNAMODB_ENDPOINT") {
                    loader = loader.endpoint_url(endpoint);
                }
                let config = loader.load().await;
                Some(Arc::new(DynamoGameMirror {
                    client: DynamoClient::new(&config),
                    table_name: std::env::var("GAMES_TABLE")
                        .ok()
                        .unwrap_or_else(|| "telefone_games".to_string()),
                }))
            } else {
                None
            };

        Self {
            store: Arc::new(RwLock::new(InMemoryStore::default())),
            mirror,
            generator: Arc::new(HttpImageGenerator::from_env()),
            settings: GameSettings::from_env(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "game_service=debug,tower_http=info".to_string()),
        )
        .init();

    let state = AppState::from_env().await;
    info!(
        max_moves = state.settings.max_moves,
        min_moves_to_end = state.settings.min_moves_to_end,
        mirror_enabled = state.mirror.is_some(),
        "game-service configured"
    );

    let app = build_router(state);

    if std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok() {
        info!("AWS Lambda runtime detected; running game-service in lambda mode");
        lambda_run(app)
            .await
            .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    let bind_addr = parse_bind_addr("GAME_SERVICE_BIND", "0.0.0.0:8081")?;
    info!(%bind_addr, "game-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/games", post(create_game_handler))
        .route("/v1/games/{game_id}", get(get_game_handler))
        .route("/v1/games/{game_id}/captions", post(submit_caption_handler))
        .route("/v1/games/{game_id}/end", post(end_game_handler))
        .route("/v1/games/{game_id}/restart", post(restart_game_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

fn parse_env_usize(var_name: &str, default: usize) -> usize {
    std::env::var(var_name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "game-service"}))
}

async fn create_game_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateGameRequest>,
) -> Result<Json<GameSnapshotResponse>, ApiError> {
    let player_names = normalize_player_names(request.player_names);
    if player_names.len() < MIN_PLAYERS {
        return Err(ApiError::bad_request(format!(
            "at least {MIN_PLAYERS} player names are required"
        )));
    }

    let record = GameRecord::new(shuffle_roster(player_names), state.settings.max_moves);
    info!(
        game_id = %record.game_id,
        players = record.player_names.len(),
        max_moves = record.max_moves,
        "game created"
    );
    store_and_mirror(&state, &record).await;

    Ok(Json(record.snapshot()))
}

async fn get_game_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<GameSnapshotResponse>, ApiError> {
    let record = fetch_game(&state, &game_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("game {game_id} not found")))?;
    Ok(Json(record.snapshot()))
}

async fn submit_caption_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Json(request): Json<SubmitCaptionRequest>,
) -> Result<Json<SubmitCaptionResponse>, ApiError> {
    // Rejected before any state mutation.
    let caption = normalize_caption(&request.caption)
        .ok_or_else(|| ApiError::bad_request("caption must not be empty"))?;

    if fetch_game(&state, &game_id).await.is_none() {
        return Err(ApiError::not_found(format!("game {game_id} not found")));
    }

    let (updated, move_id, player_name) = {
        let mut store = state.store.write().await;
        let record = store
            .games
            .get(&game_id)
            .ok_or_else(|| ApiError::not_found(format!("game {game_id} not found")))?;

        if record.game_over() {
            return Err(ApiError::conflict("GAME_FINISHED"));
        }

        let player_name = record
            .current_player_name()
            .map(ToOwned::to_owned)
            .ok_or_else(|| ApiError::internal("running game has no current player"))?;
        let mv = Move {
            id: new_move_id(),
            player_name: player_name.clone(),
            caption: caption.clone(),
            image_url: None,
            error: None,
        };
        let move_id = mv.id.clone();
        let updated = record.with_move(mv);
        store.games.insert(game_id.clone(), updated.clone());
        (updated, move_id, player_name)
    };

    info!(
        game_id = %game_id,
        move_id = %move_id,
        player_name = %player_name,
        move_count = updated.moves.len(),
        status = ?updated.status,
        "caption submitted"
    );
    mirror_record(&state, &updated).await;

    // The caption is recorded and the turn passes immediately; the image for
    // this move resolves in the background, targeted by move id.
    tokio::spawn(resolve_generation(
        state.clone(),
        game_id.clone(),
        move_id.clone(),
        caption,
    ));

    Ok(Json(SubmitCaptionResponse {
        game_id,
        move_id,
        player_name,
        move_count: updated.moves.len(),
        status: updated.status,
        current_player_name: updated.current_player_name().map(ToOwned::to_owned),
    }))
}

/// Resolve one move's pending generation. Runs detached from the submitting
/// request; a result that arrives after the game moved on (or ended) is still
/// written into the historical move record, since the id matches exactly one
/// move.
async fn resolve_generation(state: AppState, game_id: String, move_id: String, caption: String) {
    let outcome = state.generator.generate(&caption).await;

    let updated = {
        let mut store = state.store.write().await;
        let Some(record) = store.games.get(&game_id) else {
            warn!(
                game_id = %game_id,
                move_id = %move_id,
                "generation resolved for a discarded game; dropping result"
            );
            return;
        };
        let updated = match &outcome {
            Ok(image_url) => record.with_move_image(&move_id, image_url),
            Err(error) => record.with_move_error(&move_id, &format!("{error:#}")),
        };
        store.games.insert(game_id.clone(), updated.clone());
        updated
    };

    match &outcome {
        Ok(image_url) => info!(
            game_id = %game_id,
            move_id = %move_id,
            image_url = %image_url,
            "image generation resolved"
        ),
        Err(error) => warn!(
            game_id = %game_id,
            move_id = %move_id,
            error = %error,
            "image generation failed; recorded on move"
        ),
    }

    mirror_record(&state, &updated).await;
}

async fn end_game_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<GameSnapshotResponse>, ApiError> {
    if fetch_game(&state, &game_id).await.is_none() {
        return Err(ApiError::not_found(format!("game {game_id} not found")));
    }

    let updated = {
        let mut store = state.store.write().await;
        let record = store
            .games
            .get(&game_id)
            .ok_or_else(|| ApiError::not_found(format!("game {game_id} not found")))?;

        if record.game_over() {
            return Err(ApiError::conflict("GAME_ALREADY_FINISHED"));
        }
        if record.moves.len() < state.settings.min_moves_to_end {
            return Err(ApiError::conflict("NOT_ENOUGH_MOVES_TO_END"));
        }

        let updated = record.finished();
        store.games.insert(game_id.clone(), updated.clone());
        updated
    };

    info!(game_id = %game_id, move_count = updated.moves.len(), "game ended by player");
    mirror_record(&state, &updated).await;

    Ok(Json(updated.snapshot()))
}

async fn restart_game_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Json(request): Json<RestartGameRequest>,
) -> Result<Json<RestartGameResponse>, ApiError> {
    if fetch_game(&state, &game_id).await.is_none() {
        return Err(ApiError::not_found(format!("game {game_id} not found")));
    }

    if request.same_players {
        let updated = {
            let mut store = state.store.write().await;
            let record = store
                .games
                .get(&game_id)
                .ok_or_else(|| ApiError::not_found(format!("game {game_id} not found")))?;

            if !record.game_over() {
                return Err(ApiError::conflict("GAME_NOT_FINISHED"));
            }

            let updated = record.reshuffled();
            store.games.insert(game_id.clone(), updated.clone());
            updated
        };

        info!(game_id = %game_id, "game restarted with reshuffled roster");
        mirror_record(&state, &updated).await;

        return Ok(Json(RestartGameResponse {
            game_id,
            snapshot: Some(updated.snapshot()),
        }));
    }

    {
        let mut store = state.store.write().await;
        let record = store
            .games
            .get(&game_id)
            .ok_or_else(|| ApiError::not_found(format!("game {game_id} not found")))?;
        if !record.game_over() {
            return Err(ApiError::conflict("GAME_NOT_FINISHED"));
        }
        store.games.remove(&game_id);
    }

    info!(game_id = %game_id, "game discarded; a new roster must be collected");
    if let Some(mirror) = state.mirror.as_ref()
        && let Err(error) = mirror.delete(&game_id).await
    {
        warn!(game_id = %game_id, error = %error, "failed to delete mirrored game record");
    }

    Ok(Json(RestartGameResponse {
        game_id,
        snapshot: None,
    }))
}

/// Read a game from memory, falling back to the durable mirror so a client
/// can resume after a process restart. Mirror failures are treated as absent.
async fn fetch_game(state: &AppState, game_id: &str) -> Option<GameRecord> {
    {
        let store = state.store.read().await;
        if let Some(record) = store.games.get(game_id) {
            return Some(record.clone());
        }
    }

    let mirror = state.mirror.as_ref()?;
    match mirror.load(game_id).await {
        Ok(Some(record)) => {
            info!(game_id = %game_id, "resumed game from durable mirror");
            let mut store = state.store.write().await;
            store
                .games
                .entry(game_id.to_string())
                .or_insert_with(|| record.clone());
            Some(record)
        }
        Ok(None) => None,
        Err(error) => {
            warn!(game_id = %game_id, error = %error, "failed to read game mirror; treating as absent");
            None
        }
    }
}

async fn store_and_mirror(state: &AppState, record: &GameRecord) {
    {
        let mut store = state.store.write().await;
        store.games.insert(record.game_id.clone(), record.clone());
    }
    mirror_record(state, record).await;
}

async fn mirror_record(state: &AppState, record: &GameRecord) {
    if let Some(mirror) = state.mirror.as_ref()
        && let Err(error) = mirror.save(record).await
    {
        warn!(game_id = %record.game_id, error = %error, "failed to mirror game record");
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;
    use telefone_common::GameStatus;

    /// Keeps every submitted move pending so tests observe deterministic
    /// pre-resolution state.
    struct NeverImageGenerator;

    #[async_trait]
    impl ImageGenerator for NeverImageGenerator {
        async fn generate(&self, _caption: &str) -> anyhow::Result<String> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[derive(Default)]
    struct ScriptedImageGenerator {
        results: Mutex<VecDeque<Result<String, String>>>,
        captions: Mutex<Vec<String>>,
    }

    impl ScriptedImageGenerator {
        fn with_results(results: Vec<Result<String, String>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                captions: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ImageGenerator for ScriptedImageGenerator {
        async fn generate(&self, caption: &str) -> anyhow::Result<String> {
            self.captions.lock().unwrap().push(caption.to_string());
            match self.results.lock().unwrap().pop_front() {
                Some(Ok(url)) => Ok(url),
                Some(Err(message)) => Err(anyhow::anyhow!(message)),
                None => Err(anyhow::anyhow!("no scripted result left")),
            }
        }
    }

    #[derive(Default)]
    struct RecordingMirror {
        saved: Mutex<Vec<GameRecord>>,
        deleted: Mutex<Vec<String>>,
        load_result: Mutex<Option<GameRecord>>,
    }

    #[async_trait]
    impl GameMirror for RecordingMirror {
        async fn save(&self, record: &GameRecord) -> anyhow::Result<()> {
            self.saved.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn load(&self, _game_id: &str) -> anyhow::Result<Option<GameRecord>> {
            Ok(self.load_result.lock().unwrap().clone())
        }

        async fn delete(&self, game_id: &str) -> anyhow::Result<()> {
            self.deleted.lock().unwrap().push(game_id.to_string());
            Ok(())
        }
    }

    struct FailingMirror;

    #[async_trait]
    impl GameMirror for FailingMirror {
        async fn save(&self, _record: &GameRecord) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("dynamodb unavailable"))
        }

        async fn load(&self, _game_id: &str) -> anyhow::Result<Option<GameRecord>> {
            Err(anyhow::anyhow!("dynamodb unavailable"))
        }

        async fn delete(&self, _game_id: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("dynamodb unavailable"))
        }
    }

    fn app_state() -> AppState {
        app_state_with(Arc::new(NeverImageGenerator), None)
    }

    fn app_state_with(
        generator: Arc<dyn ImageGenerator>,
        mirror: Option<Arc<dyn GameMirror>>,
    ) -> AppState {
        AppState {
            store: Arc::new(RwLock::new(InMemoryStore::default())),
            mirror,
            generator,
            settings: GameSettings {
                max_moves: DEFAULT_MAX_MOVES,
                min_moves_to_end: DEFAULT_MIN_MOVES_TO_END,
            },
        }
    }

    fn roster(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    async fn create(state: &AppState, names: &[&str]) -> GameSnapshotResponse {
        create_game_handler(
            State(state.clone()),
            Json(CreateGameRequest {
                player_names: roster(names),
            }),
        )
        .await
        .unwrap()
        .0
    }

    async fn submit(
        state: &AppState,
        game_id: &str,
        caption: &str,
    ) -> Result<SubmitCaptionResponse, ApiError> {
        submit_caption_handler(
            State(state.clone()),
            Path(game_id.to_string()),
            Json(SubmitCaptionRequest {
                caption: caption.to_string(),
            }),
        )
        .await
        .map(|json| json.0)
    }

    async fn stored_game(state: &AppState, game_id: &str) -> GameRecord {
        state
            .store
            .read()
            .await
            .games
            .get(game_id)
            .cloned()
            .expect("game missing from store")
    }

    fn pending_move(id: &str, player: &str, caption: &str) -> Move {
        Move {
            id: id.to_string(),
            player_name: player.to_string(),
            caption: caption.to_string(),
            image_url: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn create_game_requires_two_players() {
        let state = app_state();
        let error = create_game_handler(
            State(state.clone()),
            Json(CreateGameRequest {
                player_names: roster(&["Ada", "  "]),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert!(state.store.read().await.games.is_empty());
    }

    #[tokio::test]
    async fn create_game_shuffles_the_roster_and_starts_running() {
        let state = app_state();
        let snapshot = create(&state, &["Ada", "Ben", "Cleo", "Dot"]).await;

        assert_eq!(snapshot.status, GameStatus::Running);
        assert_eq!(snapshot.current_player_index, 0);
        assert!(snapshot.moves.is_empty());
        assert!(!snapshot.game_over);
        assert_eq!(snapshot.max_moves, DEFAULT_MAX_MOVES);

        let expected: HashSet<String> = roster(&["Ada", "Ben", "Cleo", "Dot"])
            .into_iter()
            .collect();
        let actual: HashSet<String> = snapshot.player_names.iter().cloned().collect();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn empty_caption_is_rejected_without_appending_a_move() {
        let state = app_state();
        let snapshot = create(&state, &["Ada", "Ben"]).await;

        let error = submit(&state, &snapshot.game_id, "   ").await.unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);

        let record = stored_game(&state, &snapshot.game_id).await;
        assert!(record.moves.is_empty());
    }

    #[tokio::test]
    async fn submit_appends_a_pending_move_and_passes_the_turn() {
        let state = app_state();
        let snapshot = create(&state, &["Ada", "Ben"]).await;
        let first_player = snapshot.current_player_name.clone().unwrap();

        let response = submit(&state, &snapshot.game_id, "a ham in a hammock")
            .await
            .unwrap();
        assert_eq!(response.player_name, first_player);
        assert_eq!(response.move_count, 1);
        assert_ne!(
            response.current_player_name.as_deref(),
            Some(first_player.as_str())
        );

        let record = stored_game(&state, &snapshot.game_id).await;
        assert_eq!(record.moves.len(), 1);
        assert_eq!(record.moves[0].caption, "a ham in a hammock");
        assert_eq!(record.moves[0].image_url, None);
        assert_eq!(record.moves[0].error, None);
        assert_eq!(record.current_player_index(), 1);
    }

    #[tokio::test]
    async fn move_ids_never_collide_within_a_game() {
        let state = app_state();
        let snapshot = create(&state, &["Ada", "Ben"]).await;

        let mut ids = HashSet::new();
        for move_no in 0..6 {
            let response = submit(&state, &snapshot.game_id, &format!("caption {move_no}"))
                .await
                .unwrap();
            assert!(ids.insert(response.move_id));
        }
        assert_eq!(ids.len(), 6);
    }

    #[tokio::test]
    async fn game_auto_finishes_exactly_at_max_moves() {
        let state = app_state();
        let snapshot = create(&state, &["Ada", "Ben"]).await;
        assert_eq!(snapshot.max_moves, 8);

        for move_no in 0..7 {
            let response = submit(&state, &snapshot.game_id, &format!("caption {move_no}"))
                .await
                .unwrap();
            assert_eq!(response.status, GameStatus::Running);
        }

        let last = submit(&state, &snapshot.game_id, "caption 7").await.unwrap();
        assert_eq!(last.status, GameStatus::Finished);
        assert_eq!(last.current_player_name, None);

        let error = submit(&state, &snapshot.game_id, "one too many")
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn move_cap_grows_with_large_rosters() {
        let mut state = app_state();
        state.settings.max_moves = 2;
        let snapshot = create(&state, &["Ada", "Ben", "Cleo"]).await;
        assert_eq!(snapshot.max_moves, 3);

        for move_no in 0..2 {
            let response = submit(&state, &snapshot.game_id, &format!("caption {move_no}"))
                .await
                .unwrap();
            assert_eq!(response.status, GameStatus::Running);
        }
        let last = submit(&state, &snapshot.game_id, "caption 2").await.unwrap();
        assert_eq!(last.status, GameStatus::Finished);
    }

    #[tokio::test]
    async fn end_game_requires_the_minimum_move_count() {
        let state = app_state();
        let snapshot = create(&state, &["Ada", "Ben"]).await;

        let error = end_game_handler(State(state.clone()), Path(snapshot.game_id.clone()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::CONFLICT);

        submit(&state, &snapshot.game_id, "first").await.unwrap();
        let error = end_game_handler(State(state.clone()), Path(snapshot.game_id.clone()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::CONFLICT);

        submit(&state, &snapshot.game_id, "second").await.unwrap();
        let ended = end_game_handler(State(state.clone()), Path(snapshot.game_id.clone()))
            .await
            .unwrap()
            .0;
        assert_eq!(ended.status, GameStatus::Finished);
        assert!(ended.game_over);
    }

    #[tokio::test]
    async fn late_resolution_updates_the_move_in_place() {
        let generator = Arc::new(ScriptedImageGenerator::with_results(vec![Ok(
            "http://img/1.png".to_string(),
        )]));
        let state = app_state_with(generator, None);

        let record = GameRecord::new(roster(&["Ada", "Ben"]), DEFAULT_MAX_MOVES)
            .with_move(pending_move("x1", "Ada", "a ham in a hammock"))
            .with_move(pending_move("x2", "Ben", "describe the prior image"));
        let game_id = record.game_id.clone();
        state
            .store
            .write()
            .await
            .games
            .insert(game_id.clone(), record);

        resolve_generation(
            state.clone(),
            game_id.clone(),
            "x1".to_string(),
            "a ham in a hammock".to_string(),
        )
        .await;

        let record = stored_game(&state, &game_id).await;
        assert_eq!(
            record.moves[0].image_url.as_deref(),
            Some("http://img/1.png")
        );
        assert_eq!(record.moves[1].image_url, None);
        assert_eq!(record.moves[1].error, None);
    }

    #[tokio::test]
    async fn failed_generation_is_recorded_and_play_continues() {
        let generator = Arc::new(ScriptedImageGenerator::with_results(vec![Err(
            "all providers failed".to_string(),
        )]));
        let state = app_state_with(generator, None);

        let record = GameRecord::new(roster(&["Ada", "Ben"]), DEFAULT_MAX_MOVES)
            .with_move(pending_move("x1", "Ada", "caption"));
        let game_id = record.game_id.clone();
        state
            .store
            .write()
            .await
            .games
            .insert(game_id.clone(), record);

        resolve_generation(
            state.clone(),
            game_id.clone(),
            "x1".to_string(),
            "caption".to_string(),
        )
        .await;

        let record = stored_game(&state, &game_id).await;
        assert_eq!(record.moves[0].image_url, None);
        assert!(
            record.moves[0]
                .error
                .as_deref()
                .unwrap()
                .contains("all providers failed")
        );
        assert_eq!(record.status, GameStatus::Running);
    }

    #[tokio::test]
    async fn resolution_for_a_discarded_game_is_dropped() {
        let generator = Arc::new(ScriptedImageGenerator::with_results(vec![Ok(
            "http://img/1.png".to_string(),
        )]));
        let state = app_state_with(generator, None);

        resolve_generation(
            state.clone(),
            "gone".to_string(),
            "x1".to_string(),
            "caption".to_string(),
        )
        .await;

        assert!(state.store.read().await.games.is_empty());
    }

    #[tokio::test]
    async fn mirror_write_failure_does_not_fail_the_transition() {
        let state = app_state_with(Arc::new(NeverImageGenerator), Some(Arc::new(FailingMirror)));
        let snapshot = create(&state, &["Ada", "Ben"]).await;
        let response = submit(&state, &snapshot.game_id, "still works")
            .await
            .unwrap();
        assert_eq!(response.move_count, 1);
    }

    #[tokio::test]
    async fn unknown_game_resumes_from_the_mirror() {
        let mirror = Arc::new(RecordingMirror::default());
        let record = GameRecord::new(roster(&["Ada", "Ben"]), DEFAULT_MAX_MOVES);
        let game_id = record.game_id.clone();
        *mirror.load_result.lock().unwrap() = Some(record);

        let state = app_state_with(Arc::new(NeverImageGenerator), Some(mirror));
        let snapshot = get_game_handler(State(state.clone()), Path(game_id.clone()))
            .await
            .unwrap()
            .0;
        assert_eq!(snapshot.game_id, game_id);
        assert!(state.store.read().await.games.contains_key(&game_id));
    }

    #[tokio::test]
    async fn mirror_read_failure_falls_back_to_absent() {
        let state = app_state_with(Arc::new(NeverImageGenerator), Some(Arc::new(FailingMirror)));
        let error = get_game_handler(State(state), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn restart_with_same_players_reshuffles_and_clears_moves() {
        let mirror = Arc::new(RecordingMirror::default());
        let state = app_state_with(Arc::new(NeverImageGenerator), Some(mirror.clone()));
        let snapshot = create(&state, &["Ada", "Ben", "Cleo"]).await;

        submit(&state, &snapshot.game_id, "first").await.unwrap();
        submit(&state, &snapshot.game_id, "second").await.unwrap();
        end_game_handler(State(state.clone()), Path(snapshot.game_id.clone()))
            .await
            .unwrap();

        let response = restart_game_handler(
            State(state.clone()),
            Path(snapshot.game_id.clone()),
            Json(RestartGameRequest { same_players: true }),
        )
        .await
        .unwrap()
        .0;

        let fresh = response
            .snapshot
            .expect("snapshot expected for same-player restart");
        assert_eq!(fresh.status, GameStatus::Running);
        assert!(fresh.moves.is_empty());
        let expected: HashSet<String> = snapshot.player_names.iter().cloned().collect();
        let actual: HashSet<String> = fresh.player_names.iter().cloned().collect();
        assert_eq!(actual, expected);
        assert!(!mirror.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn restart_with_new_players_discards_the_record() {
        let mirror = Arc::new(RecordingMirror::default());
        let state = app_state_with(Arc::new(NeverImageGenerator), Some(mirror.clone()));
        let snapshot = create(&state, &["Ada", "Ben"]).await;

        submit(&state, &snapshot.game_id, "first").await.unwrap();
        submit(&state, &snapshot.game_id, "second").await.unwrap();
        end_game_handler(State(state.clone()), Path(snapshot.game_id.clone()))
            .await
            .unwrap();

        let response = restart_game_handler(
            State(state.clone()),
            Path(snapshot.game_id.clone()),
            Json(RestartGameRequest {
                same_players: false,
            }),
        )
        .await
        .unwrap()
        .0;

        assert!(response.snapshot.is_none());
        assert!(
            !state
                .store
                .read()
                .await
                .games
                .contains_key(&snapshot.game_id)
        );
        assert_eq!(
            mirror.deleted.lock().unwrap().as_slice(),
            &[snapshot.game_id.clone()]
        );
    }

    #[tokio::test]
    async fn restart_is_rejected_while_the_game_is_running() {
        let state = app_state();
        let snapshot = create(&state, &["Ada", "Ben"]).await;

        let error = restart_game_handler(
            State(state.clone()),
            Path(snapshot.game_id.clone()),
            Json(RestartGameRequest { same_players: true }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::CONFLICT);
    }
}
