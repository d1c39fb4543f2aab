//! Tests for the Redis queue driver.
//!
//! Tests against a live server read `REDIS_URL` and are ignored by default:
//! `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`

use super::*;
use serde_json::json;

mod keys {
    use super::*;

    #[test]
    fn test_queue_keys_layout() {
        let keys = QueueKeys::new("queues:", "emails");
        assert_eq!(keys.ready, "queues:emails");
        assert_eq!(keys.delayed, "queues:emails:delayed");
    }

    #[test]
    fn test_due_score_is_fractional_epoch_seconds() {
        let now = Timestamp::from_millis(1_700_000_000_500);
        assert_eq!(due_score(now, 0), 1_700_000_000.5);
        assert_eq!(due_score(now, 10), 1_700_000_010.5);
    }

    /// Verify identical delayed payloads get distinct members
    #[test]
    fn test_delayed_members_are_unique() {
        let raw = r#"{"data":"same","queue":"q"}"#;
        let first = delayed_member(raw);
        let second = delayed_member(raw);

        assert_ne!(first, second);
        assert_eq!(delayed_payload(&first), raw);
        assert_eq!(delayed_payload(&second), raw);
    }
}

mod errors {
    use super::*;
    use redis::ErrorKind;

    #[test]
    fn test_io_errors_become_connection_failures() {
        let err: QueueError = redis::RedisError::from((ErrorKind::IoError, "broken pipe")).into();
        assert!(matches!(err, QueueError::ConnectionFailed { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_other_errors_become_provider_errors() {
        let err: QueueError =
            redis::RedisError::from((ErrorKind::TypeError, "unexpected reply")).into();
        assert!(matches!(err, QueueError::ProviderError { .. }));
    }
}

mod live {
    use super::*;

    async fn driver() -> Option<RedisDriver> {
        let url = std::env::var("REDIS_URL").ok()?;
        let options = RedisOptions {
            prefix: format!("courier-test:{}:", uuid::Uuid::new_v4()),
            ..Default::default()
        };
        Some(RedisDriver::connect(&url, options).await.unwrap())
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn test_push_pop_count() {
        let Some(driver) = driver().await else { return };
        assert_eq!(driver.count("q").await.unwrap(), Some(0));

        driver.push(&Message::new("hello").on_queue("q"), 1).await.unwrap();
        assert_eq!(driver.count("q").await.unwrap(), Some(1));

        let popped = driver.pop("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(popped.data(), &json!("hello"));
        driver.acknowledge(&popped).await.unwrap();
        assert_eq!(driver.count("q").await.unwrap(), Some(0));

        driver.delete_queue("q").await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn test_delayed_message_migrates_when_due() {
        let Some(driver) = driver().await else { return };
        driver
            .push(&Message::new("later").on_queue("q").with_delay(1), 1)
            .await
            .unwrap();

        assert!(driver.pop("q", Duration::ZERO).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let popped = driver.pop("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(popped.data(), &json!("later"));

        driver.delete_queue("q").await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn test_identical_delayed_payloads_are_kept() {
        let Some(driver) = driver().await else { return };
        let raw = r#"{"id":"fixed","data":"twice","queue":"q","createdAt":"2024-01-01T00:00:00Z"}"#;
        driver.push_raw(raw, "q", 1).await.unwrap();
        driver.push_raw(raw, "q", 1).await.unwrap();
        assert_eq!(driver.count("q").await.unwrap(), Some(2));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let first = driver.pop("q", Duration::ZERO).await.unwrap().unwrap();
        let second = driver.pop("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.raw(), raw);
        assert_eq!(second.raw(), raw);

        driver.delete_queue("q").await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn test_release_pushes_new_delivery() {
        let Some(driver) = driver().await else { return };
        driver.push(&Message::new("hello").on_queue("q"), 1).await.unwrap();

        let popped = driver.pop("q", Duration::ZERO).await.unwrap().unwrap();
        driver.release(&popped).await.unwrap();
        assert_eq!(driver.count("q").await.unwrap(), Some(1));

        let again = driver.pop("q", Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(again.data(), &json!("hello"));

        driver.delete_queue("q").await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn test_blocking_pop_times_out() {
        let Some(driver) = driver().await else { return };
        let popped = driver.pop("q", Duration::from_millis(200)).await.unwrap();
        assert!(popped.is_none());
        assert_eq!(driver.stats().await.unwrap().queue("q").unwrap().ready, 0);
    }
}
