//! Snapshot persistence for the movie file.
//!
//! The file is a JSON array of movies. It is read and parsed in full on every
//! call and written in full on every mutation; there is no log and no partial
//! write.

use crate::{Movie, StoreError, StoreResult};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Parse the whole file. A missing or blank file is an empty catalog.
pub fn load_movies(path: &Path) -> StoreResult<Vec<Movie>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "movie file missing, treating as empty");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }

    let movies: Vec<Movie> = serde_json::from_str(&contents).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), count = movies.len(), "loaded movies");
    Ok(movies)
}

/// Serialize the whole collection and swap it into place.
///
/// The bytes go to a sibling temp file first and are renamed over `path`, so
/// readers see either the old or the new snapshot, never a torn one.
pub fn save_movies(path: &Path, movies: &[Movie], pretty: bool) -> StoreResult<()> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let bytes = if pretty {
        serde_json::to_vec_pretty(movies)
    } else {
        serde_json::to_vec(movies)
    }
    .map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(io_err)?;

    // Unique per write: stores that do not share a writer lock may save at once.
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(&bytes).map_err(io_err)?;
    tmp.as_file().sync_data().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;

    tracing::debug!(path = %path.display(), count = movies.len(), "saved movies");
    Ok(())
}
