//! Starter catalog written by `cinedex seed`.

use chrono::{Duration, Utc};
use cinedex_storage::{Movie, Review};

struct Row {
    title: &'static str,
    director: &'static str,
    year: i32,
    genre: &'static str,
    duration: u32,
    rating: f64,
    language: &'static str,
}

const ROWS: &[Row] = &[
    Row {
        title: "The Shawshank Redemption",
        director: "Frank Darabont",
        year: 1994,
        genre: "Drama",
        duration: 142,
        rating: 9.3,
        language: "EN",
    },
    Row {
        title: "The Godfather",
        director: "Francis Ford Coppola",
        year: 1972,
        genre: "Crime",
        duration: 175,
        rating: 9.2,
        language: "EN",
    },
    Row {
        title: "Spirited Away",
        director: "Hayao Miyazaki",
        year: 2001,
        genre: "Animation",
        duration: 125,
        rating: 8.6,
        language: "JA",
    },
    Row {
        title: "Amélie",
        director: "Jean-Pierre Jeunet",
        year: 2001,
        genre: "Romance",
        duration: 122,
        rating: 8.3,
        language: "FR",
    },
    Row {
        title: "Parasite",
        director: "Bong Joon-ho",
        year: 2019,
        genre: "Thriller",
        duration: 132,
        rating: 8.5,
        language: "KO",
    },
];

pub fn sample_movies() -> Vec<Movie> {
    let base = Utc::now() - Duration::days(ROWS.len() as i64);

    ROWS.iter()
        .enumerate()
        .map(|(i, row)| {
            let id = (i + 1).to_string();
            let created_at = base + Duration::days(i as i64);
            let reviews = if i < 2 {
                vec![Review {
                    id: "1".to_string(),
                    movie_id: id.clone(),
                    rating: row.rating,
                    comment: "A classic.".to_string(),
                    reviewer: "seed".to_string(),
                    created_at,
                }]
            } else {
                Vec::new()
            };

            Movie {
                id,
                title: row.title.to_string(),
                director: row.director.to_string(),
                release_year: row.year,
                genre: row.genre.to_string(),
                duration: row.duration,
                rating: row.rating,
                language: Some(row.language.to_string()),
                created_by: None,
                reviews,
                created_at,
                updated_at: created_at,
                extra: Default::default(),
            }
        })
        .collect()
}
