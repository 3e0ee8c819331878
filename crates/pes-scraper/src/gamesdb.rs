//! theGamesDB client

use crate::{
    CatalogGameRecord, CatalogPage, GameImages, GamesCatalog, HttpClient, ImageUrls, ImagesPage,
    JsonArchive, ScraperError,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Maximum number of game ids per images request
pub const IMAGE_BATCH_SIZE: usize = 400;

const SUCCESS: &str = "Success";

#[derive(Debug, Deserialize)]
struct GamesResponse {
    #[serde(default)]
    status: Option<String>,
    data: Option<GamesData>,
    #[serde(default)]
    include: Option<Include>,
    #[serde(default)]
    pages: Option<Pages>,
}

#[derive(Debug, Deserialize)]
struct GamesData {
    games: Vec<RawGame>,
}

#[derive(Debug, Deserialize)]
struct RawGame {
    id: i64,
    game_title: String,
    #[serde(default)]
    release_date: Option<String>,
    platform: i64,
    #[serde(default)]
    overview: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Include {
    #[serde(default)]
    boxart: Option<BoxArt>,
}

#[derive(Debug, Deserialize)]
struct BoxArt {
    base_url: BaseUrl,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct BaseUrl {
    original: String,
    large: String,
    medium: String,
}

impl BaseUrl {
    fn urls(&self, filename: &str) -> ImageUrls {
        ImageUrls {
            original: format!("{}{}", self.original, filename),
            large: format!("{}{}", self.large, filename),
            medium: format!("{}{}", self.medium, filename),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawImage {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    side: Option<String>,
    filename: String,
}

#[derive(Debug, Deserialize)]
struct Pages {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    status: Option<String>,
    data: Option<ImagesData>,
    #[serde(default)]
    pages: Option<Pages>,
}

#[derive(Debug, Deserialize)]
struct ImagesData {
    base_url: BaseUrl,
    #[serde(default)]
    images: Value,
}

fn check_status(status: Option<&str>) -> Result<(), ScraperError> {
    match status {
        Some(SUCCESS) => Ok(()),
        Some(other) => Err(ScraperError::BadStatus(other.to_string())),
        None => Err(ScraperError::BadResponse("missing status".to_string())),
    }
}

fn next_page(pages: Option<&Pages>, page: u32) -> Option<u32> {
    pages
        .and_then(|p| p.next.as_ref())
        .filter(|next| !next.is_empty())
        .map(|_| page + 1)
}

/// Per-game image lists keyed by game id.
///
/// The service sends `[]` instead of `{}` when nothing matched.
fn image_map(value: &Value) -> Result<Vec<(i64, Vec<RawImage>)>, ScraperError> {
    let object = match value {
        Value::Object(map) => map,
        Value::Array(items) if items.is_empty() => return Ok(Vec::new()),
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(ScraperError::BadResponse(format!(
                "unexpected image list: {}",
                other
            )));
        }
    };

    let mut games = Vec::with_capacity(object.len());
    for (id, images) in object {
        let id: i64 = id
            .parse()
            .map_err(|_| ScraperError::BadResponse(format!("bad game id \"{}\"", id)))?;
        let images: Vec<RawImage> = serde_json::from_value(images.clone())
            .map_err(|e| ScraperError::BadResponse(e.to_string()))?;
        games.push((id, images));
    }
    games.sort_by_key(|(id, _)| *id);
    Ok(games)
}

/// Parse a `Games/ByPlatformID` response
pub fn parse_games_page(json: &str, page: u32) -> Result<CatalogPage, ScraperError> {
    let response: GamesResponse =
        serde_json::from_str(json).map_err(|e| ScraperError::BadResponse(e.to_string()))?;
    check_status(response.status.as_deref())?;

    let data = response
        .data
        .ok_or_else(|| ScraperError::BadResponse("missing data.games".to_string()))?;

    let mut fronts = Vec::new();
    if let Some(boxart) = response.include.and_then(|i| i.boxart) {
        for (id, images) in image_map(&boxart.data)? {
            if let Some(front) = images
                .iter()
                .find(|image| image.side.as_deref() == Some("front"))
            {
                fronts.push((id, boxart.base_url.urls(&front.filename)));
            }
        }
    }

    let games = data
        .games
        .into_iter()
        .map(|game| {
            let front = fronts
                .iter()
                .find(|(id, _)| *id == game.id)
                .map(|(_, urls)| urls.clone());
            CatalogGameRecord {
                id: game.id,
                platform_id: game.platform,
                title: game.game_title.trim().to_string(),
                overview: game.overview.filter(|o| !o.is_empty()),
                release_date: game.release_date.filter(|d| !d.is_empty()),
                front,
            }
        })
        .collect();

    Ok(CatalogPage {
        games,
        next_page: next_page(response.pages.as_ref(), page),
    })
}

/// Parse a `Games/Images` response
pub fn parse_images_page(json: &str, page: u32) -> Result<ImagesPage, ScraperError> {
    let response: ImagesResponse =
        serde_json::from_str(json).map_err(|e| ScraperError::BadResponse(e.to_string()))?;
    check_status(response.status.as_deref())?;

    let data = response
        .data
        .ok_or_else(|| ScraperError::BadResponse("missing data.images".to_string()))?;

    let mut games = Vec::new();
    for (game_id, images) in image_map(&data.images)? {
        let mut entry = GameImages {
            game_id,
            ..GameImages::default()
        };
        for image in images {
            match (image.kind.as_deref(), image.side.as_deref()) {
                (Some("boxart"), Some("back")) => {
                    entry.back = Some(data.base_url.urls(&image.filename));
                }
                (Some("screenshot"), _) => {
                    entry.screenshots.push(data.base_url.urls(&image.filename));
                }
                _ => {}
            }
        }
        games.push(entry);
    }

    Ok(ImagesPage {
        games,
        next_page: next_page(response.pages.as_ref(), page),
    })
}

/// Live theGamesDB client
pub struct GamesDbClient {
    http: Arc<HttpClient>,
    base_url: String,
    api_key: String,
    archive: Option<JsonArchive>,
}

impl GamesDbClient {
    pub fn new(http: Arc<HttpClient>, base_url: &str, api_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            archive: None,
        }
    }

    /// Keep every successful response in `archive`
    pub fn with_archive(mut self, archive: JsonArchive) -> Self {
        self.archive = Some(archive);
        self
    }
}

impl GamesCatalog for GamesDbClient {
    fn fetch_games(&self, platform_id: i64, page: u32) -> Result<CatalogPage, ScraperError> {
        let url = format!("{}/Games/ByPlatformID", self.base_url);
        let body = self.http.get_text(
            &url,
            &[
                ("apikey", self.api_key.clone()),
                ("id", platform_id.to_string()),
                ("fields", "overview".to_string()),
                ("include", "boxart".to_string()),
                ("page", page.to_string()),
            ],
        )?;

        let parsed = parse_games_page(&body, page)?;
        if let Some(archive) = &self.archive {
            archive.keep(&archive.games_path(platform_id, page), &body);
        }

        tracing::debug!(
            "Platform {} page {}: {} games",
            platform_id,
            page,
            parsed.games.len()
        );
        Ok(parsed)
    }

    fn fetch_images(
        &self,
        platform_id: i64,
        game_ids: &[i64],
        batch: u32,
        page: u32,
    ) -> Result<ImagesPage, ScraperError> {
        let ids = game_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let url = format!("{}/Games/Images", self.base_url);
        let body = self.http.get_text(
            &url,
            &[
                ("apikey", self.api_key.clone()),
                ("games_id", ids),
                ("filter", "boxart,screenshot".to_string()),
                ("page", page.to_string()),
            ],
        )?;

        let parsed = parse_images_page(&body, page)?;
        if let Some(archive) = &self.archive {
            archive.keep(&archive.images_path(platform_id, batch, page), &body);
        }
        Ok(parsed)
    }
}
