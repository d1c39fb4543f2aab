//! Tests for failed job snapshots and retrying.

use super::*;
use crate::drivers::MemoryDriver;
use std::sync::Arc;
use std::time::Duration;

fn queued(message: Message) -> QueuedMessage {
    QueuedMessage::new(message, 3, String::new())
}

mod snapshot {
    use super::*;

    /// Verify a first failure starts the failure bookkeeping
    #[test]
    fn test_first_failure() {
        let message = Message::job("send-email", "x")
            .on_queue("emails")
            .on_connection("main")
            .with_delay(30);
        let job = FailedJob::create(&queued(message), "boom");

        assert_eq!(job.name, "send-email");
        assert_eq!(job.connection, "main");
        assert_eq!(job.queue, "emails");
        assert_eq!(job.error, "boom");
        assert_eq!(job.attempts, 1);
        assert_eq!(job.first_failed_at, job.failed_at);
        assert_eq!(job.message.delay, 0);
        assert_eq!(job.message.header(FAILED_ATTEMPTS_HEADER), Some("1"));
    }

    /// Verify a re-failure keeps the first failure time and counts up
    #[test]
    fn test_refailure_keeps_history() {
        let first = Timestamp::from_millis(1_600_000_000_000);
        let message = Message::job("send-email", "x")
            .on_queue("emails")
            .with_header(FIRST_FAILED_AT_HEADER, first.as_millis().to_string())
            .with_header(FAILED_ATTEMPTS_HEADER, "2");
        let job = FailedJob::create(&queued(message), "again");

        assert_eq!(job.first_failed_at, first);
        assert_eq!(job.attempts, 3);
        assert!(job.failed_at > first);
    }

    #[test]
    fn test_anonymous_job_name() {
        let job = FailedJob::create(&queued(Message::new("x").on_queue("q")), "boom");
        assert_eq!(job.name, "unknown");
        assert_eq!(job.connection, "");
    }
}

mod retrying {
    use super::*;

    /// Verify matching jobs are re-sent to their queue and forgotten
    #[tokio::test]
    async fn test_retry_failed_resends_matching() {
        let store = MemoryFailedJobStore::new();
        let emails = FailedJob::create(&queued(Message::job("a", 1).on_queue("emails")), "e");
        let sms = FailedJob::create(&queued(Message::job("b", 2).on_queue("sms")), "e");
        store.store(emails.clone()).await.unwrap();
        store.store(sms.clone()).await.unwrap();

        let connection = Connection::new("main", Arc::new(MemoryDriver::new()));
        let retried = retry_failed(&store, &connection, &FailedJobCriteria::new().queue("emails"))
            .await
            .unwrap();

        assert_eq!(retried, 1);
        assert_eq!(store.all().await.unwrap(), vec![sms]);

        let envelope = connection
            .pop("emails", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.message().message().id, emails.message.id);
        assert_eq!(envelope.message().attempts(), 1);
        assert_eq!(
            envelope.message().message().header(FAILED_ATTEMPTS_HEADER),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_retry_failed_on_empty_store() {
        let store = MemoryFailedJobStore::new();
        let connection = Connection::new("main", Arc::new(MemoryDriver::new()));
        let retried = retry_failed(&store, &connection, &FailedJobCriteria::new())
            .await
            .unwrap();
        assert_eq!(retried, 0);
    }
}
