//! Filters and rankings over a fresh snapshot.
//!
//! None of these fail on an empty result; they return an empty `Vec`.

use crate::{Movie, MovieStore, StoreResult};

pub const DEFAULT_LIMIT: usize = 10;

impl MovieStore {
    /// Case-insensitive genre match.
    pub fn by_genre(&self, genre: &str) -> StoreResult<Vec<Movie>> {
        tracing::debug!(genre, "filtering movies by genre");
        let genre = genre.to_lowercase();
        Ok(self
            .all()?
            .into_iter()
            .filter(|m| m.genre.to_lowercase() == genre)
            .collect())
    }

    pub fn by_year(&self, year: i32) -> StoreResult<Vec<Movie>> {
        tracing::debug!(year, "filtering movies by year");
        Ok(self
            .all()?
            .into_iter()
            .filter(|m| m.release_year == year)
            .collect())
    }

    /// Highest rating first.
    pub fn top_rated(&self, limit: Option<usize>) -> StoreResult<Vec<Movie>> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT);
        tracing::debug!(limit, "getting top rated movies");
        let mut movies = self.all()?;
        movies.sort_by(|a, b| b.rating.total_cmp(&a.rating));
        movies.truncate(limit);
        Ok(movies)
    }

    /// Most recently created first.
    pub fn recent(&self, limit: Option<usize>) -> StoreResult<Vec<Movie>> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT);
        tracing::debug!(limit, "getting recent movies");
        let mut movies = self.all()?;
        movies.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        movies.truncate(limit);
        Ok(movies)
    }

    /// Case-insensitive substring match on title, director or genre.
    pub fn search(&self, query: &str) -> StoreResult<Vec<Movie>> {
        tracing::debug!(query, "searching movies");
        let needle = query.to_lowercase();
        Ok(self
            .all()?
            .into_iter()
            .filter(|m| {
                m.title.to_lowercase().contains(&needle)
                    || m.director.to_lowercase().contains(&needle)
                    || m.genre.to_lowercase().contains(&needle)
            })
            .collect())
    }

    /// Languages are stored upper-case; the query is upper-cased to match.
    pub fn by_language(&self, language: &str) -> StoreResult<Vec<Movie>> {
        tracing::debug!(language, "getting movies by language");
        let language = language.to_uppercase();
        Ok(self
            .all()?
            .into_iter()
            .filter(|m| m.language.as_deref() == Some(language.as_str()))
            .collect())
    }
}
