use async_trait::async_trait;
use cinedex_loader::{BatchSource, BoxError};

use crate::{Movie, MovieStore};

/// One bulk read per batch, then a lookup per requested id.
#[async_trait]
impl BatchSource for MovieStore {
    type Key = String;
    type Value = Movie;

    async fn load_batch(&self, ids: &[String]) -> Result<Vec<Option<Movie>>, BoxError> {
        let store = self.clone();
        let movies = tokio::task::spawn_blocking(move || store.all()).await??;

        Ok(ids
            .iter()
            .map(|id| {
                let found = movies.iter().find(|m| &m.id == id).cloned();
                if found.is_none() {
                    tracing::debug!(id = %id, "movie not found in batch");
                }
                found
            })
            .collect())
    }
}
