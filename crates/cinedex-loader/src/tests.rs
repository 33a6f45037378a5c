use super::*;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;

/// In-memory source that records every bulk call.
struct CountingSource {
    rows: HashMap<String, String>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<String>>>,
    fail: bool,
    truncate: bool,
}

impl CountingSource {
    fn new(ids: &[&str]) -> Self {
        Self {
            rows: ids
                .iter()
                .map(|id| (id.to_string(), format!("movie {id}")))
                .collect(),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            fail: false,
            truncate: false,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchSource for CountingSource {
    type Key = String;
    type Value = String;

    async fn load_batch(&self, keys: &[String]) -> Result<Vec<Option<String>>, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(keys.to_vec());
        if self.fail {
            return Err("disk on fire".into());
        }
        let mut out: Vec<_> = keys.iter().map(|k| self.rows.get(k).cloned()).collect();
        if self.truncate {
            out.pop();
        }
        Ok(out)
    }
}

fn key(s: &str) -> String {
    s.to_string()
}

#[tokio::test]
async fn test_same_tick_loads_share_one_fetch() {
    let loader = Loader::new(CountingSource::new(&["1", "2"]));

    let a = loader.load(key("1"));
    let b = loader.load(key("3"));
    let c = loader.load(key("2"));
    assert_eq!(loader.state(), LoaderState::Accumulating);

    assert_eq!(a.await.unwrap().as_deref(), Some("movie 1"));
    assert_eq!(b.await.unwrap(), None);
    assert_eq!(c.await.unwrap().as_deref(), Some("movie 2"));

    assert_eq!(loader.source().calls(), 1);
    assert_eq!(
        loader.source().seen.lock().clone(),
        vec![vec![key("1"), key("3"), key("2")]]
    );
    assert_eq!(loader.state(), LoaderState::Empty);
}

#[tokio::test]
async fn test_join_of_loads_is_one_batch() {
    let loader = Loader::new(CountingSource::new(&["1", "2", "3"]));

    let (a, b, c) = tokio::join!(
        loader.load(key("3")),
        loader.load(key("1")),
        loader.load(key("2")),
    );

    assert_eq!(a.unwrap().as_deref(), Some("movie 3"));
    assert_eq!(b.unwrap().as_deref(), Some("movie 1"));
    assert_eq!(c.unwrap().as_deref(), Some("movie 2"));
    assert_eq!(loader.source().calls(), 1);
}

#[tokio::test]
async fn test_duplicate_keys_fetched_once() {
    let loader = Loader::new(CountingSource::new(&["1"]));

    let a = loader.load(key("1"));
    let b = loader.load(key("1"));
    let (a, b) = tokio::join!(a, b);

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(loader.source().seen.lock().clone(), vec![vec![key("1")]]);
    assert_eq!(
        loader.stats(),
        LoaderStats {
            loads: 2,
            batches: 1,
            keys: 1
        }
    );
}

#[tokio::test]
async fn test_no_cache_across_ticks() {
    let loader = Loader::new(CountingSource::new(&["1"]));

    assert!(loader.load(key("1")).await.unwrap().is_some());
    assert!(loader.load(key("1")).await.unwrap().is_some());

    assert_eq!(loader.source().calls(), 2);
}

#[tokio::test]
async fn test_source_failure_reaches_every_waiter() {
    let mut source = CountingSource::new(&["1"]);
    source.fail = true;
    let loader = Loader::new(source);

    let a = loader.load(key("1"));
    let b = loader.load(key("2"));

    let err = a.await.unwrap_err();
    assert!(matches!(err, LoadError::Source(ref msg) if msg.contains("disk on fire")));
    assert_eq!(b.await.unwrap_err(), err);

    // the next tick starts clean
    assert_eq!(loader.state(), LoaderState::Empty);
}

#[tokio::test]
async fn test_wrong_length_fails_batch() {
    let mut source = CountingSource::new(&["1", "2"]);
    source.truncate = true;
    let loader = Loader::new(source);

    let out = loader.load_many(vec![key("1"), key("2")]).await;
    assert_eq!(
        out,
        Err(LoadError::LengthMismatch {
            expected: 2,
            actual: 1
        })
    );
}

#[tokio::test]
async fn test_max_batch_size_splits() {
    let loader = Loader::with_config(
        CountingSource::new(&["1", "2", "3", "4", "5"]),
        LoaderConfig {
            max_batch_size: 2,
            ..Default::default()
        },
    );

    let out = loader
        .load_many(["1", "2", "3", "4", "5"].map(key))
        .await
        .unwrap();

    assert!(out.iter().all(Option::is_some));
    assert_eq!(
        loader.source().seen.lock().clone(),
        vec![
            vec![key("1"), key("2")],
            vec![key("3"), key("4")],
            vec![key("5")]
        ]
    );
}

#[tokio::test]
async fn test_explicit_dispatch() {
    let loader = Loader::new(CountingSource::new(&["1"]));

    // nothing pending
    loader.dispatch().await;
    assert_eq!(loader.source().calls(), 0);

    let a = loader.load(key("1"));
    loader.dispatch().await;
    assert_eq!(loader.source().calls(), 1);
    assert!(a.await.unwrap().is_some());

    // the batch closed before anyone polled, so no end-of-tick task exists
    assert_eq!(loader.state(), LoaderState::Empty);
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert_eq!(loader.source().calls(), 1);
}

#[tokio::test]
async fn test_dropped_future_does_not_poison_batch() {
    let loader = Loader::new(CountingSource::new(&["1", "2"]));

    drop(loader.load(key("1")));
    let b = loader.load(key("2"));

    assert_eq!(b.await.unwrap().as_deref(), Some("movie 2"));
    assert_eq!(loader.source().calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_load_many_is_one_batch_on_multi_thread_runtime() {
    let loader = Loader::new(CountingSource::new(&["1", "2"]));

    let out = loader
        .load_many(vec![key("2"), key("9"), key("1"), key("2")])
        .await
        .unwrap();

    assert_eq!(out[0].as_deref(), Some("movie 2"));
    assert_eq!(out[1], None);
    assert_eq!(out[2].as_deref(), Some("movie 1"));
    assert_eq!(out[3].as_deref(), Some("movie 2"));
    assert_eq!(loader.source().calls(), 1);
}

#[test]
fn test_sequential_loads_are_one_batch_on_multi_thread_runtime() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    for _ in 0..200 {
        let loader = Loader::new(CountingSource::new(&["1", "2"]));
        let (a, b, c) = rt.block_on(async {
            let a = loader.load(key("1"));
            // busy work between loads must not let a worker close the batch
            let spin = std::time::Instant::now();
            while spin.elapsed() < std::time::Duration::from_micros(200) {
                std::hint::spin_loop();
            }
            let b = loader.load(key("3"));
            let c = loader.load(key("2"));
            tokio::join!(a, b, c)
        });

        assert_eq!(a.unwrap().as_deref(), Some("movie 1"));
        assert_eq!(b.unwrap(), None);
        assert_eq!(c.unwrap().as_deref(), Some("movie 2"));
        assert_eq!(loader.source().calls(), 1);
        assert_eq!(
            loader.source().seen.lock().clone(),
            vec![vec![key("1"), key("3"), key("2")]]
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tasks_each_get_their_value() {
    let loader = Loader::new(CountingSource::new(&["1", "2", "3"]));

    let handles: Vec<_> = ["1", "2", "3", "4"]
        .into_iter()
        .map(|id| {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load(key(id)).await })
        })
        .collect();

    let mut found = Vec::new();
    for handle in handles {
        found.push(handle.await.unwrap().unwrap());
    }
    assert_eq!(found.iter().filter(|v| v.is_some()).count(), 3);
    assert!(found[3].is_none());
    assert!(loader.source().calls() >= 1);
}

mod property {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn any_number_of_keys_in_one_tick_is_one_fetch(
            present in proptest::collection::vec(0u8..20, 0..10),
            requested in proptest::collection::vec(0u8..30, 1..40),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let ids: Vec<String> = present.iter().map(|n| n.to_string()).collect();
                let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
                let loader = Loader::new(CountingSource::new(&id_refs));

                let futures: Vec<_> = requested
                    .iter()
                    .map(|n| loader.load(n.to_string()))
                    .collect();
                let mut results = Vec::new();
                for f in futures {
                    results.push(f.await.unwrap());
                }

                prop_assert_eq!(loader.source().calls(), 1);
                for (n, result) in requested.iter().zip(results) {
                    let expected = ids.contains(&n.to_string()).then(|| format!("movie {n}"));
                    prop_assert_eq!(result, expected);
                }
                Ok(())
            })?;
        }
    }
}
