//! RetroAchievements client

use crate::{
    AchievementsCatalog, BadgeProgress, GameProgress, HashLibrary, HttpClient, JsonArchive,
    LoginSession, ScraperError,
};
use chrono::NaiveDateTime;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const INVALID_API_KEY: &str = "Invalid API Key";

fn parse_json(body: &str) -> Result<Value, ScraperError> {
    serde_json::from_str(body).map_err(|e| ScraperError::BadResponse(e.to_string()))
}

/// Numbers arrive as JSON numbers or numeric strings depending on the endpoint
fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_i64(object: &Map<String, Value>, key: &str) -> Result<i64, ScraperError> {
    object
        .get(key)
        .and_then(as_i64)
        .ok_or_else(|| ScraperError::BadResponse(format!("missing or invalid \"{}\"", key)))
}

fn field_str(object: &Map<String, Value>, key: &str) -> String {
    object
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn field_date(object: &Map<String, Value>, key: &str) -> Option<NaiveDateTime> {
    object
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| NaiveDateTime::parse_from_str(s, DATE_FORMAT).ok())
}

fn check_success(root: &Value) -> Result<&Map<String, Value>, ScraperError> {
    let object = root
        .as_object()
        .ok_or_else(|| ScraperError::BadResponse("expected a JSON object".to_string()))?;
    match object.get("Success").and_then(Value::as_bool) {
        Some(true) => Ok(object),
        Some(false) => Err(ScraperError::BadStatus(
            object
                .get("Error")
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_string(),
        )),
        None => Err(ScraperError::BadResponse("missing \"Success\"".to_string())),
    }
}

/// Parse a `hashlibrary` response into game id → hashes
pub fn parse_hash_library(body: &str) -> Result<BTreeMap<i64, Vec<String>>, ScraperError> {
    let root = parse_json(body)?;
    let object = check_success(&root)?;
    let list = object
        .get("MD5List")
        .and_then(Value::as_object)
        .ok_or_else(|| ScraperError::BadResponse("missing \"MD5List\"".to_string()))?;

    let mut games: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    for (hash, game_id) in list {
        let Some(game_id) = as_i64(game_id) else {
            tracing::debug!("Skipping hash {} with invalid game id", hash);
            continue;
        };
        games.entry(game_id).or_default().push(hash.to_lowercase());
    }
    Ok(games)
}

/// Parse a `gameslist` response into game id → title
pub fn parse_games_list(body: &str) -> Result<BTreeMap<i64, String>, ScraperError> {
    let root = parse_json(body)?;
    let object = check_success(&root)?;

    let mut titles = BTreeMap::new();
    match object.get("Response") {
        Some(Value::Object(list)) => {
            for (id, title) in list {
                if let (Ok(id), Some(title)) = (id.parse::<i64>(), title.as_str()) {
                    titles.insert(id, title.trim().to_string());
                }
            }
        }
        Some(Value::Array(list)) if list.is_empty() => {}
        _ => return Err(ScraperError::BadResponse("missing \"Response\"".to_string())),
    }
    Ok(titles)
}

/// Parse a `login` response
pub fn parse_login(body: &str) -> Result<LoginSession, ScraperError> {
    let root = parse_json(body)?;
    let object = check_success(&root)?;
    let token = object
        .get("Token")
        .and_then(Value::as_str)
        .ok_or_else(|| ScraperError::BadResponse("token not in response".to_string()))?;

    Ok(LoginSession {
        token: token.to_string(),
        score: object.get("Score").and_then(as_i64).unwrap_or(0),
    })
}

/// Parse an `API_GetGameInfoAndUserProgress` response
pub fn parse_game_progress(body: &str) -> Result<GameProgress, ScraperError> {
    if body.trim() == INVALID_API_KEY {
        return Err(ScraperError::BadStatus(INVALID_API_KEY.to_string()));
    }

    let root = parse_json(body)?;
    let object = root
        .as_object()
        .ok_or_else(|| ScraperError::BadResponse("expected a JSON object".to_string()))?;

    let mut badges = Vec::new();
    if let Some(Value::Object(achievements)) = object.get("Achievements") {
        for (id, data) in achievements {
            let data = data.as_object().ok_or_else(|| {
                ScraperError::BadResponse(format!("achievement {} is not an object", id))
            })?;
            let id = id
                .parse::<i64>()
                .or_else(|_| field_i64(data, "ID"))
                .map_err(|_| ScraperError::BadResponse(format!("bad achievement id {}", id)))?;

            badges.push(BadgeProgress {
                id,
                badge_name: field_str(data, "BadgeName"),
                title: field_str(data, "Title"),
                description: field_str(data, "Description"),
                points: field_i64(data, "Points")?,
                display_order: field_i64(data, "DisplayOrder").unwrap_or(0),
                total_awarded: field_i64(data, "NumAwarded").unwrap_or(0),
                total_awarded_hardcore: field_i64(data, "NumAwardedHardcore").unwrap_or(0),
                earned: field_date(data, "DateEarned"),
                earned_hardcore: field_date(data, "DateEarnedHardcore"),
            });
        }
    }
    badges.sort_by_key(|b| (b.display_order, b.id));

    Ok(GameProgress {
        badges,
        players: field_i64(object, "NumDistinctPlayersCasual").unwrap_or(0),
        players_hardcore: field_i64(object, "NumDistinctPlayersHardcore").unwrap_or(0),
    })
}

/// Live RetroAchievements client
pub struct RetroAchievementsClient {
    http: Arc<HttpClient>,
    base_url: String,
    archive: Option<JsonArchive>,
}

impl RetroAchievementsClient {
    pub fn new(http: Arc<HttpClient>, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: JsonArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    fn do_request(&self, query: &[(&str, String)]) -> Result<String, ScraperError> {
        let url = format!("{}/dorequest.php", self.base_url);
        self.http.get_text(&url, query)
    }
}

impl AchievementsCatalog for RetroAchievementsClient {
    fn game_hashes(&self, console_id: i64) -> Result<HashLibrary, ScraperError> {
        let hashes = parse_hash_library(&self.do_request(&[
            ("r", "hashlibrary".to_string()),
            ("c", console_id.to_string()),
        ])?)?;
        let titles = parse_games_list(&self.do_request(&[
            ("r", "gameslist".to_string()),
            ("c", console_id.to_string()),
        ])?)?;

        let library: HashLibrary = hashes
            .into_iter()
            .map(|(id, hashes)| {
                let title = titles.get(&id).cloned();
                (id, crate::AchievementGameHashes { hashes, title })
            })
            .collect();

        tracing::info!(
            "RetroAchievements console {}: {} games with hashes",
            console_id,
            library.len()
        );

        if let Some(archive) = &self.archive {
            archive.keep(
                &archive.hashes_path(console_id),
                &serde_json::to_string(&library)?,
            );
        }
        Ok(library)
    }

    fn login(&self, user: &str, password: &str) -> Result<LoginSession, ScraperError> {
        let session = parse_login(&self.do_request(&[
            ("r", "login".to_string()),
            ("u", user.to_string()),
            ("p", password.to_string()),
        ])?)?;
        tracing::info!("Logged in to RetroAchievements as {} ({})", user, session.score);
        Ok(session)
    }

    fn game_progress(
        &self,
        user: &str,
        api_key: &str,
        game_id: i64,
    ) -> Result<GameProgress, ScraperError> {
        let url = format!(
            "{}/API/API_GetGameInfoAndUserProgress.php",
            self.base_url
        );
        let body = self.http.get_text(
            &url,
            &[
                ("z", user.to_string()),
                ("y", api_key.to_string()),
                ("u", user.to_string()),
                ("g", game_id.to_string()),
            ],
        )?;
        parse_game_progress(&body)
    }
}
