//! Cinedex Movie Store
//!
//! Owns the JSON file that acts as the catalog database:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        MOVIE STORE                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌─────────┐   read (fresh parse)   ┌──────────────────┐     │
//! │  │ Queries │◄───────────────────────│                  │     │
//! │  └─────────┘                        │   movies.json    │     │
//! │                                     │  (full snapshot) │     │
//! │  ┌─────────┐   read-modify-write    │                  │     │
//! │  │Mutations│───────────────────────►│                  │     │
//! │  └─────────┘   (single writer)      └──────────────────┘     │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Properties
//!
//! - **Fresh snapshots**: every read re-parses the whole file and hands out
//!   owned values, so callers never alias store state.
//! - **Whole-file writes**: every mutation rewrites the full collection
//!   (atomically, via temp file + rename).
//! - **Single writer**: mutations through one `MovieStore` (and its clones)
//!   are serialized; separate stores on the same file still race.

pub mod persistence;
pub mod query;

mod source;


use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ============================================================================
// Core Types
// ============================================================================

/// A movie with its nested reviews.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movie {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub director: String,
    #[serde(default)]
    pub release_year: i32,
    #[serde(default)]
    pub genre: String,
    /// Running time in minutes
    #[serde(default)]
    pub duration: u32,
    #[serde(default)]
    pub rating: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// User id of the creator, when the movie was added by an authenticated caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default)]
    pub reviews: Vec<Review>,
    /// Defaults to "now" when absent on disk
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Fields we don't model are carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A review. Ids are only unique within the parent movie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: String,
    pub movie_id: String,
    pub rating: f64,
    #[serde(default)]
    pub comment: String,
    pub reviewer: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Payload for creating a movie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieDraft {
    pub title: String,
    #[serde(default)]
    pub director: String,
    #[serde(default)]
    pub release_year: i32,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub duration: u32,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub language: Option<String>,
    /// Any other payload fields, stored alongside the modelled ones.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Partial update for a movie; `None` leaves the field as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoviePatch {
    pub title: Option<String>,
    pub director: Option<String>,
    pub release_year: Option<i32>,
    pub genre: Option<String>,
    pub duration: Option<u32>,
    pub rating: Option<f64>,
    pub language: Option<String>,
    /// Unmodelled fields to set or overwrite.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Payload for creating a review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewDraft {
    pub movie_id: String,
    pub rating: f64,
    #[serde(default)]
    pub comment: Option<String>,
    pub reviewer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewPatch {
    pub rating: Option<f64>,
    pub comment: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("movie not found: {0}")]
    MovieNotFound(String),
    #[error("review not found: {0}")]
    ReviewNotFound(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt movie file {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::MovieNotFound(_) | Self::ReviewNotFound(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Store Configuration
// ============================================================================

/// Configuration for the movie store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the JSON array of movies
    pub data_path: PathBuf,
    /// Pretty-print the file on write (2-space indentation)
    pub pretty: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./movies.json"),
            pretty: true,
        }
    }
}

// ============================================================================
// Movie Store
// ============================================================================

/// Handle to the movie file. Cheap to clone; clones share the writer lock.
#[derive(Debug, Clone)]
pub struct MovieStore {
    config: Arc<StoreConfig>,
    writer: Arc<Mutex<()>>,
}

impl MovieStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config: Arc::new(config),
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn data_path(&self) -> &Path {
        &self.config.data_path
    }

    // ========================================================================
    // Read Operations
    // ========================================================================

    /// All movies, freshly parsed from disk.
    pub fn all(&self) -> StoreResult<Vec<Movie>> {
        tracing::debug!("loading all movies");
        persistence::load_movies(&self.config.data_path)
    }

    /// A single movie, or `None` when the id is unknown.
    pub fn get(&self, id: &str) -> StoreResult<Option<Movie>> {
        tracing::debug!(id, "getting movie by id");
        Ok(self.all()?.into_iter().find(|m| m.id == id))
    }

    /// First review with this id, scanning movies in file order.
    ///
    /// Review ids repeat across movies, so this is only as precise as the
    /// mutation paths that use the same lookup.
    pub fn find_review(&self, id: &str) -> StoreResult<Option<Review>> {
        Ok(self
            .all()?
            .into_iter()
            .find_map(|m| m.reviews.into_iter().find(|r| r.id == id)))
    }

    // ========================================================================
    // Write Operations
    // ========================================================================

    /// Append a movie. The id is `count + 1`; identical payloads are not
    /// deduplicated.
    pub fn add(&self, draft: MovieDraft, created_by: Option<String>) -> StoreResult<Movie> {
        validate_title(&draft.title)?;
        validate_rating(draft.rating)?;

        let movie = self.mutate(|movies| {
            let now = Utc::now();
            let mut movie = Movie {
                id: (movies.len() + 1).to_string(),
                title: draft.title,
                director: draft.director,
                release_year: draft.release_year,
                genre: draft.genre,
                duration: draft.duration,
                rating: draft.rating,
                language: draft.language.map(|l| l.to_uppercase()),
                created_by,
                reviews: Vec::new(),
                created_at: now,
                updated_at: now,
                extra: serde_json::Map::new(),
            };
            merge_extra(&mut movie.extra, draft.extra);
            movies.push(movie.clone());
            Ok(movie)
        })?;

        tracing::info!(id = %movie.id, title = %movie.title, "movie added");
        Ok(movie)
    }

    /// Merge `patch` over an existing movie and refresh `updated_at`.
    pub fn update(&self, id: &str, patch: MoviePatch) -> StoreResult<Movie> {
        if let Some(title) = patch.title.as_deref() {
            validate_title(title)?;
        }
        if let Some(rating) = patch.rating {
            validate_rating(rating)?;
        }

        let movie = self.mutate(|movies| {
            let movie = movies
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or_else(|| StoreError::MovieNotFound(id.to_string()))?;

            if let Some(title) = patch.title {
                movie.title = title;
            }
            if let Some(director) = patch.director {
                movie.director = director;
            }
            if let Some(year) = patch.release_year {
                movie.release_year = year;
            }
            if let Some(genre) = patch.genre {
                movie.genre = genre;
            }
            if let Some(duration) = patch.duration {
                movie.duration = duration;
            }
            if let Some(rating) = patch.rating {
                movie.rating = rating;
            }
            if let Some(language) = patch.language {
                movie.language = Some(language.to_uppercase());
            }
            merge_extra(&mut movie.extra, patch.extra);
            movie.updated_at = next_timestamp(movie.updated_at);
            Ok(movie.clone())
        })?;

        tracing::info!(id = %movie.id, title = %movie.title, "movie updated");
        Ok(movie)
    }

    /// Remove a movie and return it.
    pub fn delete(&self, id: &str) -> StoreResult<Movie> {
        let movie = self.mutate(|movies| {
            let idx = movies
                .iter()
                .position(|m| m.id == id)
                .ok_or_else(|| StoreError::MovieNotFound(id.to_string()))?;
            Ok(movies.remove(idx))
        })?;

        tracing::info!(id = %movie.id, title = %movie.title, "movie deleted");
        Ok(movie)
    }

    /// Append a review to its movie. The id is the movie's review count + 1.
    pub fn add_review(&self, draft: ReviewDraft) -> StoreResult<Review> {
        validate_rating(draft.rating)?;

        let review = self.mutate(|movies| {
            let movie = movies
                .iter_mut()
                .find(|m| m.id == draft.movie_id)
                .ok_or_else(|| StoreError::MovieNotFound(draft.movie_id.clone()))?;

            let review = Review {
                id: (movie.reviews.len() + 1).to_string(),
                movie_id: draft.movie_id.clone(),
                rating: draft.rating,
                comment: draft.comment.unwrap_or_default(),
                reviewer: draft.reviewer,
                created_at: Utc::now(),
            };
            movie.reviews.push(review.clone());
            Ok(review)
        })?;

        tracing::info!(movie_id = %review.movie_id, review_id = %review.id, "review added");
        Ok(review)
    }

    pub fn update_review(&self, id: &str, patch: ReviewPatch) -> StoreResult<Review> {
        if let Some(rating) = patch.rating {
            validate_rating(rating)?;
        }

        let review = self.mutate(|movies| {
            let review = owning_review(movies, id)?;
            if let Some(rating) = patch.rating {
                review.rating = rating;
            }
            if let Some(comment) = patch.comment {
                review.comment = comment;
            }
            Ok(review.clone())
        })?;

        tracing::info!(movie_id = %review.movie_id, review_id = %review.id, "review updated");
        Ok(review)
    }

    /// Remove a review from the first movie that carries its id.
    pub fn delete_review(&self, id: &str) -> StoreResult<Review> {
        let review = self.mutate(|movies| {
            let movie = movies
                .iter_mut()
                .find(|m| m.reviews.iter().any(|r| r.id == id))
                .ok_or_else(|| StoreError::ReviewNotFound(id.to_string()))?;
            let idx = movie
                .reviews
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| StoreError::ReviewNotFound(id.to_string()))?;
            Ok(movie.reviews.remove(idx))
        })?;

        tracing::info!(movie_id = %review.movie_id, review_id = %review.id, "review deleted");
        Ok(review)
    }

    /// Replace the whole collection.
    pub fn seed(&self, movies: &[Movie]) -> StoreResult<()> {
        let _guard = self.writer.lock();
        persistence::save_movies(&self.config.data_path, movies, self.config.pretty)?;
        tracing::info!(count = movies.len(), "movie file seeded");
        Ok(())
    }

    /// Read-modify-write under the writer lock. Nothing is written when `f`
    /// fails.
    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<Movie>) -> StoreResult<T>) -> StoreResult<T> {
        let _guard = self.writer.lock();
        let mut movies = persistence::load_movies(&self.config.data_path)?;
        let out = f(&mut movies)?;
        persistence::save_movies(&self.config.data_path, &movies, self.config.pretty)?;
        Ok(out)
    }
}

fn owning_review<'a>(movies: &'a mut [Movie], id: &str) -> StoreResult<&'a mut Review> {
    movies
        .iter_mut()
        .find(|m| m.reviews.iter().any(|r| r.id == id))
        .and_then(|m| m.reviews.iter_mut().find(|r| r.id == id))
        .ok_or_else(|| StoreError::ReviewNotFound(id.to_string()))
}

/// JSON names of the fields `Movie` models itself.
const MOVIE_FIELDS: &[&str] = &[
    "id",
    "title",
    "director",
    "releaseYear",
    "genre",
    "duration",
    "rating",
    "language",
    "createdBy",
    "reviews",
    "createdAt",
    "updatedAt",
];

/// Copy unmodelled payload fields onto a movie. Names the store assigns
/// itself (id, reviews, timestamps, creator) are never taken from a payload.
fn merge_extra(
    target: &mut serde_json::Map<String, serde_json::Value>,
    incoming: serde_json::Map<String, serde_json::Value>,
) {
    for (key, value) in incoming {
        if !MOVIE_FIELDS.contains(&key.as_str()) {
            target.insert(key, value);
        }
    }
}

/// `now`, nudged forward so it is strictly after `prior`.
fn next_timestamp(prior: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > prior {
        now
    } else {
        prior + Duration::microseconds(1)
    }
}

fn validate_title(title: &str) -> StoreResult<()> {
    if title.trim().is_empty() {
        return Err(StoreError::Invalid("title must not be empty".to_string()));
    }
    Ok(())
}

fn validate_rating(rating: f64) -> StoreResult<()> {
    if !rating.is_finite() || !(0.0..=10.0).contains(&rating) {
        return Err(StoreError::Invalid(format!(
            "rating must be between 0 and 10, got {rating}"
        )));
    }
    Ok(())
}

// ============================================================================
// Convenience Functions
// ============================================================================

/// Open a store over `path` with default settings.
pub fn open_store(path: impl Into<PathBuf>) -> MovieStore {
    MovieStore::new(StoreConfig {
        data_path: path.into(),
        ..Default::default()
    })
}
