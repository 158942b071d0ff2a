//! End-to-end tests for the ingestion pipeline: registry, collection,
//! queue dispatch, worker pool and sequential enrichment.
//!
//! Each test opens its own in-memory SQLite database and, where HTTP is
//! involved, its own mock server.

use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedmill::config::{DispatchMode, EnrichConfig};
use feedmill::enrich::SequentialProcessor;
use feedmill::feed::{normalize_feed, parse_feed};
use feedmill::pipeline::{dispatch_to_queue, FeedCollector};
use feedmill::queue::{Backoff, JobQueue, RetryPolicy, WorkerPool, ARTICLE_QUEUE};
use feedmill::registry::{ingest_outline_document, prune_unreachable};
use feedmill::storage::{sentinel_published, Database, NewArticle, Publisher};

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

fn fast_settings() -> EnrichConfig {
    EnrichConfig {
        batch_size: 2,
        item_timeout_ms: 1000,
        max_description_chars: 5000,
        item_delay_ms: 0,
        batch_delay_ms: 0,
    }
}

fn queue(db: &Database) -> JobQueue {
    JobQueue::new(
        db.clone(),
        ARTICLE_QUEUE,
        RetryPolicy {
            attempts: 3,
            backoff: Backoff::Fixed(Duration::ZERO),
        },
    )
}

fn draft(base: &str, slug: &str, publisher_id: Option<i64>) -> NewArticle {
    NewArticle {
        publisher_id,
        title: slug.to_string(),
        description: Some(format!("About {slug}")),
        image_link: None,
        link: format!("{base}/posts/{slug}"),
        published_at: Utc::now(),
    }
}

fn rss(base: &str, count: usize) -> String {
    let items: String = (0..count)
        .map(|i| {
            format!(
                "<item><title>Post {i}</title><link>{base}/posts/{i}</link>\
                 <description>&lt;p&gt;Summary {i}&lt;/p&gt;</description>\
                 <pubDate>Tue, 10 Jun 2025 04:00:00 GMT</pubDate></item>"
            )
        })
        .collect();
    format!(r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Blog</title>{items}</channel></rss>"#)
}

async fn mount_page(server: &MockServer, route: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

// ============================================================================
// Collection and dedup
// ============================================================================

#[tokio::test]
async fn test_collect_twice_dispatches_nothing_new() {
    let server = MockServer::start().await;
    mount_page(&server, "/feed.xml", &rss(&server.uri(), 5)).await;

    let db = test_db().await;
    db.upsert_publisher("Blog", &format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let q = queue(&db);
    let processor = SequentialProcessor::new(db.clone(), client.clone(), fast_settings());
    let collector = FeedCollector::new(
        db.clone(),
        client,
        Duration::from_secs(5),
        q.clone(),
        processor,
        1000,
    );

    let first = collector.collect_all(DispatchMode::Queue).await.unwrap();
    assert_eq!(first.items_new, 5);
    assert_eq!(first.jobs_created, 1);

    let pool = WorkerPool::new(q.clone(), db.clone(), 5, Duration::from_millis(10));
    let report = pool.drain().await;
    assert_eq!(report.saved, 5);
    assert_eq!(db.count_articles().await.unwrap(), 5);

    let second = collector.collect_all(DispatchMode::Queue).await.unwrap();
    assert_eq!(second.items_seen, 5);
    assert_eq!(second.items_new, 0);
    assert_eq!(second.jobs_created, 0);
    assert_eq!(db.count_articles().await.unwrap(), 5);

    let stored = db
        .get_article_by_link(&format!("{}/posts/3", server.uri()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.description.as_deref(), Some("Summary 3"));
}

#[tokio::test]
async fn test_large_feed_chunks_into_distinct_jobs() {
    let db = test_db().await;
    let publisher_id = db
        .upsert_publisher("Big", "https://big.example.com/rss")
        .await
        .unwrap();
    let publisher = Publisher {
        id: publisher_id,
        title: "Big".into(),
        feed_url: "https://big.example.com/rss".into(),
    };
    let items: Vec<NewArticle> = (0..2500)
        .map(|i| draft("https://big.example.com", &i.to_string(), Some(publisher_id)))
        .collect();

    let q = queue(&db);
    let created = dispatch_to_queue(&q, &publisher, items.clone(), 1000)
        .await
        .unwrap();
    assert_eq!(created, 3);

    let mut sizes = Vec::new();
    for n in 1..=3 {
        let job = db
            .get_job(&format!("{publisher_id}-chunk-{n}"))
            .await
            .unwrap()
            .unwrap();
        let payload: serde_json::Value = serde_json::from_str(&job.payload).unwrap();
        sizes.push(payload["items"].as_array().unwrap().len());
    }
    assert_eq!(sizes, vec![1000, 1000, 500]);

    // Same logical chunks submitted again are ignored
    let again = dispatch_to_queue(&q, &publisher, items, 1000).await.unwrap();
    assert_eq!(again, 0);
    assert_eq!(q.status().await.unwrap().waiting, 3);

    let report = WorkerPool::new(q.clone(), db.clone(), 5, Duration::from_millis(10))
        .drain()
        .await;
    assert_eq!(report.jobs_completed, 3);
    assert_eq!(db.count_articles().await.unwrap(), 2500);
}

#[tokio::test]
async fn test_entry_without_date_gets_sentinel() {
    let xml = r#"<rss version="2.0"><channel><title>T</title>
<item><title>Undated</title><link>https://example.com/undated</link></item>
</channel></rss>"#;
    let feed = parse_feed(xml.as_bytes()).unwrap();
    let normalized = normalize_feed(&feed, None);

    assert_eq!(normalized.articles.len(), 1);
    assert_eq!(normalized.articles[0].published_at, sentinel_published());
    assert_eq!(
        normalized.articles[0].published_at.to_rfc3339(),
        "2010-01-01T00:00:00+00:00"
    );
}

#[tokio::test]
async fn test_unparsable_and_empty_dates_get_sentinel() {
    let xml = r#"<rss version="2.0"><channel><title>T</title>
<item><title>Garbled</title><link>https://example.com/garbled</link><pubDate>32 Smarch 2024</pubDate></item>
<item><title>Blank</title><link>https://example.com/blank</link><pubDate> </pubDate></item>
</channel></rss>"#;
    let feed = parse_feed(xml.as_bytes()).unwrap();
    let normalized = normalize_feed(&feed, None);

    assert_eq!(normalized.articles.len(), 2);
    for article in &normalized.articles {
        assert_eq!(article.published_at, sentinel_published());
    }
}

// ============================================================================
// Sequential enrichment
// ============================================================================

#[tokio::test]
async fn test_failed_batch_does_not_stop_the_run() {
    let server = MockServer::start().await;
    for slug in ["a", "b", "e", "f"] {
        mount_page(&server, &format!("/posts/{slug}"), "<article>Body</article>").await;
    }

    let db = test_db().await;
    let base = server.uri();
    // Batch 2 references a publisher that does not exist and cannot be stored
    let drafts = vec![
        draft(&base, "a", None),
        draft(&base, "b", None),
        draft(&base, "c", Some(404)),
        draft(&base, "d", Some(404)),
        draft(&base, "e", None),
        draft(&base, "f", None),
    ];

    let processor = SequentialProcessor::new(db.clone(), reqwest::Client::new(), fast_settings());
    let summary = processor.process_new(drafts).await.unwrap();

    assert_eq!(summary.batches, 3);
    assert_eq!(summary.failed_batches, 1);
    assert_eq!(summary.processed, 4);
    assert_eq!(db.count_articles().await.unwrap(), 4);
    assert!(db
        .get_article_by_link(&format!("{base}/posts/c"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_concurrent_callers_share_one_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<main>Slow body</main>")
                .set_delay(Duration::from_millis(300)),
        )
        .expect(2)
        .mount(&server)
        .await;

    let db = test_db().await;
    let processor = SequentialProcessor::new(db.clone(), reqwest::Client::new(), fast_settings());
    let drafts = vec![draft(&server.uri(), "x", None), draft(&server.uri(), "y", None)];

    let first = tokio::spawn({
        let processor = processor.clone();
        let drafts = drafts.clone();
        async move { processor.process_new(drafts).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(processor.is_processing());

    let second = processor.process_new(drafts).await.unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(first.run_id, second.run_id);
    assert_eq!(first, second);
    assert_eq!(first.processed, 2);
    assert!(!processor.is_processing());
}

#[tokio::test]
async fn test_attempted_flag_never_resets() {
    let server = MockServer::start().await;
    mount_page(&server, "/posts/once", "<main>First text</main>").await;

    let db = test_db().await;
    let processor = SequentialProcessor::new(db.clone(), reqwest::Client::new(), fast_settings());
    processor
        .process_new(vec![draft(&server.uri(), "once", None)])
        .await
        .unwrap();

    let link = format!("{}/posts/once", server.uri());
    let article = db.get_article_by_link(&link).await.unwrap().unwrap();
    assert!(article.enrichment_attempted);
    assert_eq!(article.description.as_deref(), Some("First text"));

    assert!(!db.record_enrichment(article.id, "overwrite").await.unwrap());
    let backlog = processor.process_backlog().await.unwrap();
    assert_eq!(backlog.processed, 0);

    let article = db.get_article_by_link(&link).await.unwrap().unwrap();
    assert!(article.enrichment_attempted);
    assert_eq!(article.description.as_deref(), Some("First text"));
}

#[tokio::test]
async fn test_slow_page_is_skipped_and_run_continues() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/posts/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<main>late</main>")
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;
    mount_page(&server, "/posts/fast", "<main>on time</main>").await;

    let db = test_db().await;
    let settings = EnrichConfig {
        item_timeout_ms: 200,
        ..fast_settings()
    };
    let processor = SequentialProcessor::new(db.clone(), reqwest::Client::new(), settings);
    let summary = processor
        .process_new(vec![
            draft(&server.uri(), "slow", None),
            draft(&server.uri(), "fast", None),
        ])
        .await
        .unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.processed, 1);

    let slow = db
        .get_article_by_link(&format!("{}/posts/slow", server.uri()))
        .await
        .unwrap()
        .unwrap();
    assert!(slow.enrichment_attempted);
    assert_eq!(slow.description.as_deref(), Some("skipped: timeout after 200ms"));
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn test_outline_then_prune_removes_dead_feeds() {
    let server = MockServer::start().await;
    mount_page(&server, "/live.xml", &rss(&server.uri(), 1)).await;
    Mock::given(method("GET"))
        .and(path("/dead.xml"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let opml = format!(
        r#"<?xml version="1.0"?><opml version="2.0"><body>
<outline text="Live" xmlUrl="{base}/live.xml"/>
<outline text="Dead" xmlUrl="{base}/dead.xml"/>
<outline text="No url"/>
</body></opml>"#,
        base = server.uri()
    );

    let db = test_db().await;
    let report = ingest_outline_document(&db, &opml, 100).await;
    assert_eq!(report.processed, 2);
    assert!(report.errors.is_empty());

    let pruned = prune_unreachable(&db, &reqwest::Client::new(), Duration::from_secs(5), 2)
        .await
        .unwrap();
    assert_eq!(pruned.checked, 2);
    assert_eq!(pruned.deleted, 1);

    let titles: Vec<String> = db
        .list_publishers()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.title)
        .collect();
    assert_eq!(titles, vec!["Live".to_string()]);
}
