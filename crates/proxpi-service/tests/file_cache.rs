use std::path::Path;
use std::time::Duration;

use proxpi_service::http::{create_client, ClientTimeouts};
use proxpi_service::{FetchError, FetchOutcome, FileCache, FileKey};
use proxpi_sources::ProjectName;
use proxpi_test::{setup, tempdir, FixtureFile, Server};

fn cache(max_size: u64, dir: Option<&Path>, timeout: Duration) -> FileCache {
    FileCache::new(
        max_size,
        dir.map(|p| p.to_path_buf()),
        timeout,
        create_client(ClientTimeouts::default(), false),
    )
    .unwrap()
}

fn key(index: usize, project: &str, filename: &str) -> FileKey {
    FileKey {
        index,
        project: project.parse::<ProjectName>().unwrap(),
        filename: filename.to_owned(),
    }
}

fn file_url(server: &Server, project: &str, filename: &str) -> String {
    server.url(&format!("/files/{project}/{filename}")).into()
}

#[tokio::test]
async fn downloads_once_and_serves_from_disk() {
    setup();
    let server = Server::new();
    server.set_project(
        "jinja2",
        vec![FixtureFile::new(
            "jinja2-3.1.0-py3-none-any.whl",
            b"wheel bytes",
        )],
    );
    let cache_dir = tempdir();
    let cache = cache(1 << 20, Some(cache_dir.path()), Duration::from_secs(5));

    let key = key(0, "jinja2", "jinja2-3.1.0-py3-none-any.whl");
    let url = file_url(&server, "jinja2", "jinja2-3.1.0-py3-none-any.whl");

    let outcome = cache.get_or_fetch(key.clone(), &url).await.unwrap();
    let FetchOutcome::Cached(cached) = outcome else {
        panic!("expected a cached outcome");
    };
    assert_eq!(
        cached.path(),
        cache_dir
            .path()
            .join("0/jinja2/jinja2-3.1.0-py3-none-any.whl")
    );
    assert_eq!(std::fs::read(cached.path()).unwrap(), b"wheel bytes");

    let outcome = cache.get_or_fetch(key, &url).await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Cached(_)));
    assert_eq!(
        server.hits("/files/jinja2/jinja2-3.1.0-py3-none-any.whl"),
        1,
        "second request must be served from disk",
    );
    assert_eq!(cache.total_cached_bytes(), b"wheel bytes".len() as u64);
}

#[tokio::test]
async fn concurrent_requests_share_one_download() {
    setup();
    let server = Server::new();
    server.set_project("lefty", vec![FixtureFile::new("lefty-0.1.tar.gz", b"lefty")]);
    server.set_file_delay(Some(Duration::from_millis(300)));
    let cache = cache(1 << 20, None, Duration::from_secs(10));

    let url = server
        .url("/delay/300ms/files/lefty/lefty-0.1.tar.gz")
        .to_string();
    let (a, b) = tokio::join!(
        cache.get_or_fetch(key(0, "lefty", "lefty-0.1.tar.gz"), &url),
        cache.get_or_fetch(key(0, "lefty", "lefty-0.1.tar.gz"), &url),
    );

    let FetchOutcome::Cached(a) = a.unwrap() else {
        panic!("expected a cached outcome");
    };
    let FetchOutcome::Cached(b) = b.unwrap() else {
        panic!("expected a cached outcome");
    };
    assert_eq!(std::fs::read(a.path()).unwrap(), b"lefty");
    assert_eq!(std::fs::read(b.path()).unwrap(), b"lefty");
    assert_eq!(
        server.hits("/delay/300ms/files/lefty/lefty-0.1.tar.gz"),
        1,
        "the upstream must be hit at most once",
    );
}

#[tokio::test]
async fn slow_download_falls_back_to_redirect_and_finishes_in_background() {
    setup();
    let server = Server::new();
    server.set_project("lefty", vec![FixtureFile::new("lefty-0.1.tar.gz", b"lefty")]);
    let cache = cache(1 << 20, None, Duration::from_millis(1));

    let url = server
        .url("/delay/300ms/files/lefty/lefty-0.1.tar.gz")
        .to_string();
    let outcome = cache
        .get_or_fetch(key(0, "lefty", "lefty-0.1.tar.gz"), &url)
        .await
        .unwrap();
    let FetchOutcome::Redirect(target) = outcome else {
        panic!("expected a redirect outcome");
    };
    assert_eq!(target, url);

    // The producer keeps running; once it finishes the cache serves hits
    // without touching the network again.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let outcome = cache
        .get_or_fetch(key(0, "lefty", "lefty-0.1.tar.gz"), &url)
        .await
        .unwrap();
    assert!(matches!(outcome, FetchOutcome::Cached(_)));
    assert_eq!(server.hits("/delay/300ms/files/lefty/lefty-0.1.tar.gz"), 1);
}

#[tokio::test]
async fn zero_budget_disables_caching() {
    setup();
    let server = Server::new();
    let cache_dir = tempdir();
    let cache = cache(0, Some(cache_dir.path()), Duration::from_secs(5));

    let url = file_url(&server, "lefty", "lefty-0.1.tar.gz");
    let outcome = cache
        .get_or_fetch(key(0, "lefty", "lefty-0.1.tar.gz"), &url)
        .await
        .unwrap();
    let FetchOutcome::Redirect(target) = outcome else {
        panic!("expected a redirect outcome");
    };
    assert_eq!(target, url);
    assert_eq!(server.accesses(), 0, "a disabled cache never downloads");
    assert_eq!(cache.cached_entry_count(), 0);
}

#[tokio::test]
async fn evicts_smallest_entries_first() {
    setup();
    let server = Server::new();
    server.set_project(
        "pkgs",
        vec![
            FixtureFile::new("small-1.0.tar.gz", &[b'a'; 40]),
            FixtureFile::new("large-1.0.tar.gz", &[b'b'; 70]),
        ],
    );
    let cache = cache(100, None, Duration::from_secs(5));

    let small = key(0, "pkgs", "small-1.0.tar.gz");
    let large = key(0, "pkgs", "large-1.0.tar.gz");
    cache
        .get_or_fetch(small.clone(), &file_url(&server, "pkgs", "small-1.0.tar.gz"))
        .await
        .unwrap();
    assert_eq!(cache.total_cached_bytes(), 40);

    cache
        .get_or_fetch(large, &file_url(&server, "pkgs", "large-1.0.tar.gz"))
        .await
        .unwrap();

    // 40 + 70 exceeds the budget; the smaller entry goes.
    assert_eq!(cache.total_cached_bytes(), 70);
    assert_eq!(cache.cached_entry_count(), 1);
    assert!(!cache.cache_dir().join("0/pkgs/small-1.0.tar.gz").exists());
    assert!(cache.cache_dir().join("0/pkgs/large-1.0.tar.gz").exists());

    // The evicted file re-downloads on the next request.
    cache
        .get_or_fetch(small, &file_url(&server, "pkgs", "small-1.0.tar.gz"))
        .await
        .unwrap();
    assert_eq!(server.hits("/files/pkgs/small-1.0.tar.gz"), 2);
}

#[tokio::test]
async fn oversized_artifact_is_served_then_dropped() {
    setup();
    let server = Server::new();
    server.set_project("big", vec![FixtureFile::new("big-1.0.tar.gz", &[b'x'; 50])]);
    let cache = cache(10, None, Duration::from_secs(5));

    let outcome = cache
        .get_or_fetch(
            key(0, "big", "big-1.0.tar.gz"),
            &file_url(&server, "big", "big-1.0.tar.gz"),
        )
        .await
        .unwrap();
    let FetchOutcome::Cached(cached) = outcome else {
        panic!("expected a cached outcome");
    };

    // The originating waiter reads the full artifact even though the entry
    // was evicted on publish.
    assert_eq!(std::fs::read(cached.path()).unwrap().len(), 50);
    assert_eq!(cache.cached_entry_count(), 0);
    assert_eq!(cache.total_cached_bytes(), 0);

    let path = cached.path().to_path_buf();
    drop(cached);
    assert!(!path.exists(), "the file goes away with its last reader");
}

#[tokio::test]
async fn failed_download_rolls_back_to_absent() {
    setup();
    let server = Server::new();
    let cache = cache(1 << 20, None, Duration::from_secs(5));

    let url = file_url(&server, "ghost", "ghost-1.0.tar.gz");
    let error = cache
        .get_or_fetch(key(0, "ghost", "ghost-1.0.tar.gz"), &url)
        .await
        .unwrap_err();
    assert_eq!(error, FetchError::NotFound);
    assert_eq!(cache.cached_entry_count(), 0);

    // A retry is a fresh attempt, not a cached failure.
    server.set_project("ghost", vec![FixtureFile::new("ghost-1.0.tar.gz", b"boo")]);
    let outcome = cache
        .get_or_fetch(key(0, "ghost", "ghost-1.0.tar.gz"), &url)
        .await
        .unwrap();
    assert!(matches!(outcome, FetchOutcome::Cached(_)));
}

#[tokio::test]
async fn invalidation_is_idempotent_and_scoped() {
    setup();
    let server = Server::new();
    server.set_project("jinja2", vec![FixtureFile::new("jinja2-3.1.0.tar.gz", b"j")]);
    server.set_project("lefty", vec![FixtureFile::new("lefty-0.1.tar.gz", b"l")]);
    let cache = cache(1 << 20, None, Duration::from_secs(5));

    cache
        .get_or_fetch(
            key(0, "jinja2", "jinja2-3.1.0.tar.gz"),
            &file_url(&server, "jinja2", "jinja2-3.1.0.tar.gz"),
        )
        .await
        .unwrap();
    cache
        .get_or_fetch(
            key(1, "lefty", "lefty-0.1.tar.gz"),
            &file_url(&server, "lefty", "lefty-0.1.tar.gz"),
        )
        .await
        .unwrap();
    assert_eq!(cache.cached_entry_count(), 2);

    cache.invalidate_project(&"jinja2".parse().unwrap());
    assert_eq!(cache.cached_entry_count(), 1);
    assert!(!cache.cache_dir().join("0/jinja2/jinja2-3.1.0.tar.gz").exists());
    assert!(cache.cache_dir().join("1/lefty/lefty-0.1.tar.gz").exists());

    cache.invalidate_all();
    cache.invalidate_all();
    assert_eq!(cache.cached_entry_count(), 0);
    assert_eq!(cache.total_cached_bytes(), 0);
    assert!(!cache.cache_dir().join("1/lefty/lefty-0.1.tar.gz").exists());
}

#[tokio::test]
async fn pre_existing_files_are_registered_on_startup() {
    setup();
    let server = Server::new();
    let cache_dir = tempdir();
    let file_dir = cache_dir.path().join("0/jinja2");
    std::fs::create_dir_all(&file_dir).unwrap();
    std::fs::write(file_dir.join("jinja2-3.1.0.tar.gz"), b"from last run").unwrap();

    let cache = cache(1 << 20, Some(cache_dir.path()), Duration::from_secs(5));
    assert_eq!(cache.cached_entry_count(), 1);
    assert_eq!(cache.total_cached_bytes(), b"from last run".len() as u64);

    let outcome = cache
        .get_or_fetch(
            key(0, "jinja2", "jinja2-3.1.0.tar.gz"),
            &file_url(&server, "jinja2", "jinja2-3.1.0.tar.gz"),
        )
        .await
        .unwrap();
    let FetchOutcome::Cached(cached) = outcome else {
        panic!("expected a cached outcome");
    };
    assert_eq!(std::fs::read(cached.path()).unwrap(), b"from last run");
    assert_eq!(server.accesses(), 0, "no network for a pre-populated entry");
}
