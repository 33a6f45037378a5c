//! Integration tests across the Cinedex crates
//!
//! These tests drive the movie store through the batched loader and the
//! authorization policies the way the REST layer does:
//! - Store → Loader: one file read per tick, misses isolated
//! - Store mutations between ticks are visible (no caching)
//! - Identity → Policy → Store for ownership-gated mutations
//!
//! Run with: cargo test --test integration_tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::tempdir;

use cinedex_auth::{AuthError, Identity, Policy, Role, UserDirectory};
use cinedex_loader::{BatchSource, BoxError, Loader, LoaderConfig, LoaderState};
use cinedex_storage::{
    open_store, MovieDraft, MoviePatch, MovieStore, ReviewDraft, StoreError,
};

// ============================================================================
// Helpers
// ============================================================================

/// Store-backed source that counts bulk reads.
#[derive(Clone)]
struct CountingStore {
    store: MovieStore,
    reads: Arc<AtomicUsize>,
    batches: Arc<Mutex<Vec<Vec<String>>>>,
}

impl CountingStore {
    fn new(store: MovieStore) -> Self {
        Self {
            store,
            reads: Arc::new(AtomicUsize::new(0)),
            batches: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchSource for CountingStore {
    type Key = String;
    type Value = cinedex_storage::Movie;

    async fn load_batch(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<cinedex_storage::Movie>>, BoxError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().push(keys.to_vec());
        self.store.load_batch(keys).await
    }
}

fn draft(title: &str, rating: f64) -> MovieDraft {
    MovieDraft {
        title: title.to_string(),
        director: "Someone".to_string(),
        release_year: 2000,
        genre: "Drama".to_string(),
        duration: 100,
        rating,
        language: Some("en".to_string()),
        extra: Default::default(),
    }
}

fn seeded_store(dir: &tempfile::TempDir) -> MovieStore {
    let store = open_store(dir.path().join("movies.json"));
    store.add(draft("First", 7.0), Some("ana".to_string())).unwrap();
    store.add(draft("Second", 8.0), Some("ben".to_string())).unwrap();
    store
}

fn who(id: &str, role: Role) -> Identity {
    Identity {
        user_id: id.to_string(),
        role,
    }
}

// ============================================================================
// Store → Loader
// ============================================================================

#[tokio::test]
async fn test_same_tick_loads_hit_the_file_once() {
    let dir = tempdir().unwrap();
    let source = CountingStore::new(seeded_store(&dir));
    let loader = Loader::new(source.clone());

    let one = loader.load("1".to_string());
    let three = loader.load("3".to_string());
    let two = loader.load("2".to_string());
    let (one, three, two) = tokio::join!(one, three, two);

    assert_eq!(source.reads(), 1);
    assert_eq!(
        source.batches.lock().clone(),
        vec![vec!["1".to_string(), "3".to_string(), "2".to_string()]]
    );
    assert_eq!(one.unwrap().map(|m| m.title), Some("First".to_string()));
    assert_eq!(three.unwrap(), None);
    assert_eq!(two.unwrap().map(|m| m.title), Some("Second".to_string()));
    assert_eq!(loader.state(), LoaderState::Empty);
}

#[tokio::test]
async fn test_writes_between_ticks_are_visible() {
    let dir = tempdir().unwrap();
    let store = seeded_store(&dir);
    let source = CountingStore::new(store.clone());
    let loader = Loader::new(source.clone());

    let before = loader.load("1".to_string()).await.unwrap().unwrap();
    assert_eq!(before.rating, 7.0);

    store
        .update(
            "1",
            MoviePatch {
                rating: Some(9.5),
                ..Default::default()
            },
        )
        .unwrap();
    store.add(draft("Third", 6.0), None).unwrap();

    let results = loader
        .load_many(["1".to_string(), "3".to_string()])
        .await
        .unwrap();
    assert_eq!(results[0].as_ref().map(|m| m.rating), Some(9.5));
    assert_eq!(results[1].as_ref().map(|m| m.title.as_str()), Some("Third"));
    assert_eq!(source.reads(), 2);
}

#[tokio::test]
async fn test_unreadable_file_fails_the_whole_batch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("movies.json");
    std::fs::write(&path, "[{\"id\": ").unwrap();
    let loader = Loader::new(open_store(&path));

    let a = loader.load("1".to_string());
    let b = loader.load("2".to_string());
    let (a, b) = tokio::join!(a, b);

    assert!(a.is_err());
    assert_eq!(a, b);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_size_cap_on_real_store() {
    let dir = tempdir().unwrap();
    let store = seeded_store(&dir);
    for i in 0..3 {
        store.add(draft(&format!("Extra {i}"), 5.0), None).unwrap();
    }
    let source = CountingStore::new(store);
    let loader = Loader::with_config(
        source.clone(),
        LoaderConfig {
            max_batch_size: 2,
            ..Default::default()
        },
    );

    let ids: Vec<String> = (1..=5).map(|i| i.to_string()).collect();
    let movies = loader.load_many(ids).await.unwrap();

    assert!(movies.iter().all(Option::is_some));
    assert_eq!(source.reads(), 3);
    assert_eq!(loader.stats().keys, 5);
}

#[test]
fn test_sequential_loads_share_one_read_on_worker_pool() {
    let dir = tempdir().unwrap();
    let source = CountingStore::new(seeded_store(&dir));
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    for round in 0..50 {
        let loader = Loader::new(source.clone());
        let (one, two) = rt.block_on(async {
            let one = loader.load("1".to_string());
            // Idle workers must not flush the batch before the second load.
            std::thread::sleep(std::time::Duration::from_micros(200));
            let two = loader.load("2".to_string());
            tokio::join!(one, two)
        });
        assert_eq!(one.unwrap().map(|m| m.title), Some("First".to_string()));
        assert_eq!(two.unwrap().map(|m| m.title), Some("Second".to_string()));
        assert_eq!(source.reads(), round + 1, "round {round} split its batch");
    }
}

// ============================================================================
// Identity → Policy → Store
// ============================================================================

#[test]
fn test_creator_or_admin_gates_movie_mutation() {
    let dir = tempdir().unwrap();
    let store = seeded_store(&dir);
    let users = UserDirectory::new();
    let ana = users.register("ana@example.com", "pw", "Ana").unwrap();
    let ben = users.register("ben@example.com", "pw", "Ben").unwrap();

    let created = store
        .add(draft("Owned", 6.5), Some(ana.user.id.clone()))
        .unwrap();
    let policy = Policy::CreatorOrAdmin {
        creator: created.created_by.clone(),
    };

    let ben_identity = users.identify(&ben.token);
    assert!(matches!(
        policy.check(ben_identity.as_ref()),
        Err(AuthError::Unauthorized(_))
    ));
    assert_eq!(policy.check(None), Err(AuthError::AuthenticationRequired));

    let ana_identity = users.identify(&ana.token);
    policy.check(ana_identity.as_ref()).unwrap();
    let removed = store.delete(&created.id).unwrap();
    assert_eq!(removed.title, "Owned");
    assert!(store.get(&created.id).unwrap().is_none());

    // Seeded movie "2" belongs to "ben" by raw id; only admins get past that.
    let seeded = store.get("2").unwrap().unwrap();
    let seeded_policy = Policy::CreatorOrAdmin {
        creator: seeded.created_by,
    };
    assert!(seeded_policy.check(ana_identity.as_ref()).is_err());
    seeded_policy
        .check(Some(&who("root", Role::Admin)))
        .unwrap();
}

#[test]
fn test_reviewer_only_gates_review_mutation() {
    let dir = tempdir().unwrap();
    let store = seeded_store(&dir);

    let review = store
        .add_review(ReviewDraft {
            movie_id: "2".to_string(),
            rating: 8.0,
            comment: Some("Tense".to_string()),
            reviewer: "ana".to_string(),
        })
        .unwrap();
    let found = store.find_review(&review.id).unwrap().unwrap();
    let policy = Policy::ReviewerOnly {
        reviewer: found.reviewer,
    };

    assert!(policy.check(Some(&who("root", Role::Admin))).is_err());
    policy.check(Some(&who("ana", Role::User))).unwrap();

    let before_first = store.get("1").unwrap().unwrap().reviews.len();
    store.delete_review(&review.id).unwrap();
    assert_eq!(store.get("2").unwrap().unwrap().reviews.len(), 0);
    assert_eq!(store.get("1").unwrap().unwrap().reviews.len(), before_first);
}

#[test]
fn test_failed_update_leaves_file_untouched() {
    let dir = tempdir().unwrap();
    let store = seeded_store(&dir);
    let before = std::fs::read(store.data_path()).unwrap();

    let err = store
        .update(
            "missing-id",
            MoviePatch {
                rating: Some(1.0),
                ..Default::default()
            },
        )
        .unwrap_err();

    assert!(matches!(err, StoreError::MovieNotFound(_)));
    assert!(err.is_not_found());
    assert_eq!(std::fs::read(store.data_path()).unwrap(), before);
}
