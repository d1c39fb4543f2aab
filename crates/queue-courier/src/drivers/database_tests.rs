//! Tests for the SQLite queue driver.

use super::*;
use serde_json::json;
use std::collections::HashSet;

async fn memory_driver() -> DatabaseDriver {
    DatabaseDriver::connect(
        "sqlite::memory:",
        DatabaseOptions {
            max_connections: 1,
            ..Default::default()
        },
    )
    .await
    .expect("in-memory database should open")
}

fn message(data: &str) -> Message {
    Message::new(data).on_queue("q")
}

// ============================================================================
// Configuration
// ============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        assert!(validate_table_name("jobs").is_ok());
        assert!(validate_table_name("queue_jobs_2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("2jobs").is_err());
        assert!(validate_table_name("jobs; DROP TABLE x").is_err());
    }

    #[test]
    fn test_stale_cutoff_saturates() {
        assert_eq!(stale_before(10_000, None), i64::MIN);
        assert_eq!(stale_before(10_000, Some(3)), 7_000);
        assert_eq!(stale_before(10_000, Some(u64::MAX)), 10_000 - i64::MAX);
        assert_eq!(stale_before(i64::MIN + 5, Some(1)), i64::MIN);
    }

    #[tokio::test]
    async fn test_custom_table_name() {
        let driver = DatabaseDriver::connect(
            "sqlite::memory:",
            DatabaseOptions {
                table: "courier_jobs".to_string(),
                max_connections: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        driver.push(&message("hello"), 1).await.unwrap();
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM courier_jobs")
            .fetch_one(driver.pool())
            .await
            .unwrap();
        assert_eq!(total, 1);
    }
}

// ============================================================================
// Push / Reserve / Acknowledge
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_push_pop_acknowledge_counts() {
        let driver = memory_driver().await;
        assert_eq!(driver.count("q").await.unwrap(), Some(0));

        driver.push(&message("hello"), 1).await.unwrap();
        assert_eq!(driver.count("q").await.unwrap(), Some(1));

        let popped = driver.pop("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(popped.data(), &json!("hello"));
        assert!(matches!(popped.handle(), Some(ReceiptHandle::Database { .. })));

        driver.acknowledge(&popped).await.unwrap();
        assert_eq!(driver.count("q").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_reserved_row_is_not_handed_out_twice() {
        let driver = memory_driver().await;
        driver.push(&message("hello"), 1).await.unwrap();

        let first = driver.reserve(1, "q", Duration::ZERO).await.unwrap();
        let second = driver.reserve(1, "q", Duration::ZERO).await.unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_release_without_delay_redelivers() {
        let driver = memory_driver().await;
        driver.push(&message("hello"), 1).await.unwrap();

        let reserved = driver.reserve(1, "q", Duration::ZERO).await.unwrap();
        driver.release(&reserved[0]).await.unwrap();
        assert_eq!(driver.count("q").await.unwrap(), Some(1));

        let popped = driver.pop("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(popped.data(), &json!("hello"));
    }

    #[tokio::test]
    async fn test_release_with_delay_pushes_availability_forward() {
        let driver = memory_driver().await;
        driver.push(&message("hello"), 1).await.unwrap();

        let mut popped = driver.pop("q", Duration::ZERO).await.unwrap().unwrap();
        popped.set_delay(120);
        driver.release(&popped).await.unwrap();

        assert!(driver.pop("q", Duration::ZERO).await.unwrap().is_none());
        let stats = driver.stats().await.unwrap();
        let q = stats.queue("q").unwrap();
        assert_eq!(q.delayed, Some(1));
        assert_eq!(q.reserved, Some(0));
    }

    #[tokio::test]
    async fn test_reserve_orders_by_availability() {
        let driver = memory_driver().await;
        driver.push(&message("first"), 1).await.unwrap();
        driver.push(&message("second"), 1).await.unwrap();

        let reserved = driver.reserve(5, "q", Duration::ZERO).await.unwrap();
        let data: Vec<_> = reserved.iter().map(|m| m.data().clone()).collect();
        assert_eq!(data, vec![json!("first"), json!("second")]);
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let driver = memory_driver().await;
        driver.push(&message("hello"), 1).await.unwrap();

        assert!(driver.pop("other", Duration::ZERO).await.unwrap().is_none());
        assert_eq!(driver.count("other").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_attempts_round_trip_through_table() {
        let driver = memory_driver().await;
        driver.push(&message("hello"), 4).await.unwrap();

        let popped = driver.pop("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(popped.attempts(), 4);
    }

    #[tokio::test]
    async fn test_release_of_deleted_row_fails() {
        let driver = memory_driver().await;
        driver.push(&message("hello"), 1).await.unwrap();

        let popped = driver.pop("q", Duration::ZERO).await.unwrap().unwrap();
        driver.acknowledge(&popped).await.unwrap();

        let err = driver.release(&popped).await.unwrap_err();
        assert!(matches!(err, QueueError::MessageNotFound { .. }));
    }
}

// ============================================================================
// Delays and polling
// ============================================================================

mod delays {
    use super::*;

    #[tokio::test]
    async fn test_delayed_row_invisible_before_due() {
        let driver = memory_driver().await;
        driver.push(&message("later").with_delay(60), 1).await.unwrap();

        assert!(driver.pop("q", Duration::ZERO).await.unwrap().is_none());
        assert_eq!(driver.count("q").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_delayed_row_visible_after_due() {
        let driver = memory_driver().await;
        driver.push(&message("soon").with_delay(1), 1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let popped = driver.pop("q", Duration::ZERO).await.unwrap();
        assert_eq!(popped.unwrap().data(), &json!("soon"));
    }

    #[tokio::test]
    async fn test_empty_reserve_sleeps_for_duration() {
        let driver = memory_driver().await;
        let started = std::time::Instant::now();

        let popped = driver.pop("q", Duration::from_millis(200)).await.unwrap();

        assert!(popped.is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_stale_reservation_is_reclaimed() {
        let driver = DatabaseDriver::connect(
            "sqlite::memory:",
            DatabaseOptions {
                max_connections: 1,
                reservation_timeout: Some(60),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        driver.push(&message("hello"), 1).await.unwrap();
        let first = driver.pop("q", Duration::ZERO).await.unwrap().unwrap();

        // Simulate a worker that crashed two minutes ago.
        let two_minutes_ago = Timestamp::now().as_millis() - 120_000;
        sqlx::query("UPDATE jobs SET reserved_at = ?")
            .bind(two_minutes_ago)
            .execute(driver.pool())
            .await
            .unwrap();

        let second = driver.pop("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.handle(), first.handle());
    }
}

// ============================================================================
// Concurrency
// ============================================================================

mod concurrency {
    use super::*;

    /// Verify that concurrent reservers against a shared file never share a row.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reserve_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("queue.db").display());
        let driver = DatabaseDriver::connect(
            &url,
            DatabaseOptions {
                max_connections: 8,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        const ROWS: usize = 40;
        for i in 0..ROWS {
            driver.push(&message(&i.to_string()), 1).await.unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let driver = driver.clone();
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                loop {
                    let reserved = driver.reserve(1, "q", Duration::ZERO).await.unwrap();
                    if reserved.is_empty() {
                        break;
                    }
                    ids.extend(reserved.into_iter().map(|m| m.handle().unwrap().to_string()));
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().cloned().collect();

        assert_eq!(all.len(), ROWS);
        assert_eq!(unique.len(), ROWS);
    }

    /// Verify a reserve dropped mid-transaction releases the write lock
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_reserve_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("queue.db").display());
        let options = DatabaseOptions {
            max_connections: 1,
            ..Default::default()
        };
        let driver = DatabaseDriver::connect(&url, options.clone()).await.unwrap();
        driver.push(&message("held"), 1).await.unwrap();

        for _ in 0..50 {
            let _ = tokio::time::timeout(
                Duration::from_micros(200),
                driver.pop("q", Duration::ZERO),
            )
            .await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let other = DatabaseDriver::connect(&url, options).await.unwrap();
        other.push(&message("after"), 1).await.unwrap();
        driver.push(&message("again"), 1).await.unwrap();
    }
}

// ============================================================================
// Management
// ============================================================================

mod management {
    use super::*;

    #[tokio::test]
    async fn test_stats_groups_by_queue() {
        let driver = memory_driver().await;
        driver.push(&message("a"), 1).await.unwrap();
        driver.push(&message("b").with_delay(300), 1).await.unwrap();
        driver.push(&Message::new("c").on_queue("other"), 1).await.unwrap();
        driver.pop("q", Duration::ZERO).await.unwrap().unwrap();

        let stats = driver.stats().await.unwrap();
        assert_eq!(stats.driver, Some(DriverKind::Database));

        let q = stats.queue("q").unwrap();
        assert_eq!(q.ready, 0);
        assert_eq!(q.reserved, Some(1));
        assert_eq!(q.delayed, Some(1));
        assert_eq!(stats.queue("other").unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_delete_queue_removes_rows() {
        let driver = memory_driver().await;
        driver.push(&message("a"), 1).await.unwrap();
        driver.delete_queue("q").await.unwrap();
        assert_eq!(driver.count("q").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_topics_are_unsupported() {
        let driver = memory_driver().await;
        let err = driver.subscribe("orders", "billing").await.unwrap_err();
        assert!(matches!(err, QueueError::Unsupported { .. }));
    }
}
