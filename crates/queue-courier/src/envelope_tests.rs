//! Tests for the delivery state machine.

use super::*;
use crate::test_support::{deliver, deliver_attempt, Call, RecordingDriver};
use serde_json::json;

fn message(data: &str) -> Message {
    Message::new(data).on_queue("q")
}

// ============================================================================
// Acknowledge
// ============================================================================

mod acknowledge {
    use super::*;

    /// Verify that a second acknowledge never reaches the driver.
    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let driver = RecordingDriver::new();
        let mut envelope = deliver(&driver, message("hello")).await;

        envelope.acknowledge().await.unwrap();
        envelope.acknowledge().await.unwrap();

        assert_eq!(driver.count_of(&Call::Acknowledge), 1);
        assert_eq!(envelope.state(), DeliveryState::Acknowledged);
        assert!(envelope.is_deleted());
        assert!(!envelope.is_rejected());
    }

    /// Verify the end-to-end count sequence 0, 1, 0 around an acknowledge.
    #[tokio::test]
    async fn test_acknowledge_removes_message() {
        let driver = RecordingDriver::new();
        assert_eq!(driver.count("q").await.unwrap(), Some(0));

        let mut envelope = deliver(&driver, message("hello")).await;
        assert_eq!(envelope.message().data(), &json!("hello"));
        assert_eq!(driver.count("q").await.unwrap(), Some(1));

        envelope.acknowledge().await.unwrap();
        assert_eq!(driver.count("q").await.unwrap(), Some(0));
    }
}

// ============================================================================
// Reject
// ============================================================================

mod reject {
    use super::*;

    #[tokio::test]
    async fn test_reject_with_requeue_releases() {
        let driver = RecordingDriver::new();
        let mut envelope = deliver(&driver, message("hello")).await;

        envelope.reject(true).await.unwrap();

        assert_eq!(driver.calls(), vec![Call::Release { delay: 0 }]);
        assert!(envelope.is_rejected());
        assert!(envelope.is_deleted());
        assert_eq!(driver.count("q").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_reject_without_requeue_consumes() {
        let driver = RecordingDriver::new();
        let mut envelope = deliver(&driver, message("hello")).await;

        envelope.reject(false).await.unwrap();

        assert_eq!(driver.calls(), vec![Call::Acknowledge]);
        assert_eq!(driver.count("q").await.unwrap(), Some(0));
    }

    /// Verify that rejecting after acknowledge only flips local state.
    #[tokio::test]
    async fn test_reject_after_acknowledge_is_local() {
        let driver = RecordingDriver::new();
        let mut envelope = deliver(&driver, message("hello")).await;

        envelope.acknowledge().await.unwrap();
        envelope.reject(true).await.unwrap();

        assert_eq!(driver.calls(), vec![Call::Acknowledge]);
        assert_eq!(envelope.state(), DeliveryState::Rejected);
    }

    #[tokio::test]
    async fn test_double_reject_releases_once() {
        let driver = RecordingDriver::new();
        let mut envelope = deliver(&driver, message("hello")).await;

        envelope.reject(true).await.unwrap();
        envelope.reject(true).await.unwrap();

        assert_eq!(driver.count_of(&Call::Release { delay: 0 }), 1);
    }

    #[tokio::test]
    async fn test_acknowledge_after_reject_is_noop() {
        let driver = RecordingDriver::new();
        let mut envelope = deliver(&driver, message("hello")).await;

        envelope.reject(false).await.unwrap();
        envelope.acknowledge().await.unwrap();

        assert_eq!(driver.count_of(&Call::Acknowledge), 1);
        assert!(envelope.is_rejected());
    }
}

// ============================================================================
// Retry
// ============================================================================

mod retry {
    use super::*;

    /// Verify that retry ends the delivery and pushes attempt 2 with the delay.
    #[tokio::test]
    async fn test_retry_pushes_next_attempt() {
        let driver = RecordingDriver::new();
        let mut envelope = deliver(&driver, message("hello")).await;

        envelope.retry(5).await.unwrap();

        assert_eq!(
            driver.calls(),
            vec![
                Call::Acknowledge,
                Call::Push {
                    queue: "q".to_string(),
                    attempts: 2,
                    delay: 5,
                },
            ]
        );
        assert!(envelope.is_rejected());
        assert_eq!(envelope.message().attempts(), 2);
    }

    #[tokio::test]
    async fn test_retried_delivery_carries_attempts() {
        let driver = RecordingDriver::new();
        let mut envelope = deliver_attempt(&driver, message("hello"), 3).await;

        envelope.retry(0).await.unwrap();

        let connection = crate::driver::Connection::new("test", driver.clone());
        let next = connection.pop("q", std::time::Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(next.message().attempts(), 4);
        assert_eq!(next.message().data(), &json!("hello"));
    }

    /// Verify that retrying an already finalized delivery does not finalize it twice.
    #[tokio::test]
    async fn test_retry_after_acknowledge_still_pushes_once() {
        let driver = RecordingDriver::new();
        let mut envelope = deliver(&driver, message("hello")).await;

        envelope.acknowledge().await.unwrap();
        envelope.retry(0).await.unwrap();

        assert_eq!(driver.count_of(&Call::Acknowledge), 1);
        assert_eq!(driver.pushes().len(), 1);
    }
}

// ============================================================================
// Reply
// ============================================================================

mod reply {
    use super::*;

    #[tokio::test]
    async fn test_reply_sends_response_and_acknowledges() {
        let driver = RecordingDriver::new();
        let request = message("ping")
            .with_header(CORRELATION_ID_HEADER, "abc")
            .with_header(REPLY_TO_HEADER, "replies");
        let mut envelope = deliver(&driver, request).await;

        envelope.reply("pong").await.unwrap();

        assert_eq!(envelope.state(), DeliveryState::Acknowledged);
        let connection = crate::driver::Connection::new("test", driver.clone());
        let response = connection
            .pop("replies", std::time::Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.message().data(), &json!("pong"));
        assert_eq!(
            response.message().message().header(CORRELATION_ID_HEADER),
            Some("abc")
        );
        assert_eq!(response.message().message().connection.as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn test_reply_without_headers_is_noop() {
        let driver = RecordingDriver::new();
        let mut envelope = deliver(&driver, message("ping")).await;

        envelope.reply("pong").await.unwrap();

        assert!(driver.calls().is_empty());
        assert_eq!(envelope.state(), DeliveryState::Active);
    }

    #[tokio::test]
    async fn test_reply_after_acknowledge_is_noop() {
        let driver = RecordingDriver::new();
        let request = message("ping")
            .with_header(CORRELATION_ID_HEADER, "abc")
            .with_header(REPLY_TO_HEADER, "replies");
        let mut envelope = deliver(&driver, request).await;

        envelope.acknowledge().await.unwrap();
        envelope.reply("pong").await.unwrap();

        assert!(driver.pushes().is_empty());
    }
}
