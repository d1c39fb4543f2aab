//! Tests for middleware parsing and chain assembly.

use super::*;
use crate::consumer::StopHandle;
use crate::failer::MemoryFailedJobStore;
use crate::handler::handler_fn;
use crate::message::Message;
use crate::receiver::{Chain, Next};
use crate::envelope::Envelope;
use crate::error::ProcessError;
use crate::test_support::{deliver, RecordingDriver};
use async_trait::async_trait;
use std::sync::Mutex;

mod parsing {
    use super::*;

    #[test]
    fn test_simple_names() {
        assert_eq!("store".parse::<Middleware>().unwrap(), Middleware::Store);
        assert_eq!("no-failure".parse::<Middleware>().unwrap(), Middleware::NoFailure);
        assert_eq!("stop_when_empty".parse::<Middleware>().unwrap(), Middleware::StopWhenEmpty);
        assert_eq!("LOG".parse::<Middleware>().unwrap(), Middleware::Log);
        assert_eq!("bench".parse::<Middleware>().unwrap(), Middleware::Bench);
    }

    #[test]
    fn test_retry_arguments() {
        assert_eq!(
            "retry".parse::<Middleware>().unwrap(),
            Middleware::Retry { max_tries: None, delay: None }
        );
        assert_eq!(
            "retry:3".parse::<Middleware>().unwrap(),
            Middleware::Retry { max_tries: Some(3), delay: None }
        );
        assert_eq!(
            "retry:3:10".parse::<Middleware>().unwrap(),
            Middleware::Retry { max_tries: Some(3), delay: Some(10) }
        );
    }

    #[test]
    fn test_limit_arguments() {
        assert_eq!("limit:100".parse::<Middleware>().unwrap(), Middleware::Limit(100));
        assert_eq!(
            "memory:128M".parse::<Middleware>().unwrap(),
            Middleware::Memory(128 * 1024 * 1024)
        );
        assert_eq!(
            "expire:3600".parse::<Middleware>().unwrap(),
            Middleware::Expire(Duration::from_secs(3600))
        );
        assert_eq!(
            "rate:10:0.5".parse::<Middleware>().unwrap(),
            Middleware::Rate { limit: 10, sleep: Duration::from_millis(500) }
        );
    }

    #[test]
    fn test_sizes() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("64k"), Some(64 * 1024));
        assert_eq!(parse_size("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size(""), None);
    }

    /// Verify configuration mistakes fail at parse time
    #[test]
    fn test_invalid_entries() {
        assert!(matches!(
            "teleport".parse::<Middleware>(),
            Err(ConfigurationError::UnknownMiddleware { .. })
        ));
        assert!("limit".parse::<Middleware>().is_err());
        assert!("limit:many".parse::<Middleware>().is_err());
        assert!("memory:huge".parse::<Middleware>().is_err());
        assert!("rate:10".parse::<Middleware>().is_err());
        assert!("store:now".parse::<Middleware>().is_err());
        assert!("retry:1:2:3".parse::<Middleware>().is_err());
    }

    /// Verify sleeps that do not fit a duration are errors, not panics
    #[test]
    fn test_rate_sleep_out_of_range() {
        for entry in ["rate:1:inf", "rate:1:1e30"] {
            assert!(
                matches!(entry.parse::<Middleware>(), Err(ConfigurationError::Invalid { .. })),
                "{} should be rejected",
                entry
            );
        }
    }
}

mod assembly {
    use super::*;

    /// Receiver appending its tag to a shared trace
    struct Tag {
        name: &'static str,
        trace: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Receiver for Tag {
        async fn receive(&self, envelope: &mut Envelope, next: &dyn Next) -> Result<(), ProcessError> {
            self.trace.lock().unwrap().push(self.name);
            next.receive(envelope).await
        }
    }

    fn handlers(trace: Arc<Mutex<Vec<&'static str>>>) -> HandlerRegistry {
        HandlerRegistry::single(handler_fn(move |_message| {
            let trace = trace.clone();
            async move {
                trace.lock().unwrap().push("handler");
                Ok(())
            }
        }))
    }

    fn builder(trace: &Arc<Mutex<Vec<&'static str>>>) -> ReceiverBuilder {
        ReceiverBuilder::new()
            .receiver(Arc::new(Tag { name: "outer", trace: trace.clone() }))
            .middleware(Middleware::Log)
            .receiver(Arc::new(Tag { name: "inner", trace: trace.clone() }))
    }

    #[test]
    fn test_store_requires_failer() {
        let result = ReceiverBuilder::new()
            .middleware(Middleware::Store)
            .build_pipeline(HandlerRegistry::new());
        assert!(matches!(result, Err(ConfigurationError::Missing { .. })));
    }

    #[test]
    fn test_parse_middlewares_fails_fast() {
        assert!(ReceiverBuilder::new()
            .parse_middlewares(["retry:3", "unknown"])
            .is_err());
    }

    #[test]
    fn test_processor_appended() {
        let pipeline = ReceiverBuilder::new()
            .with_failer(Arc::new(MemoryFailedJobStore::new()))
            .parse_middlewares(["no_failure", "store", "retry:3"])
            .unwrap()
            .build_pipeline(HandlerRegistry::new())
            .unwrap();
        assert_eq!(pipeline.len(), 4);

        let stack = ReceiverBuilder::new().build_stack(HandlerRegistry::new()).unwrap();
        assert_eq!(stack.depth(), 1);
    }

    /// Verify pipeline and stack run receivers in the order they were added
    #[tokio::test]
    async fn test_pipeline_and_stack_share_order() {
        let driver = RecordingDriver::new();
        let stop = StopHandle::new();

        let trace = Arc::new(Mutex::new(Vec::new()));
        let pipeline = builder(&trace).build_pipeline(handlers(trace.clone())).unwrap();
        let mut envelope = deliver(&driver, Message::new("x").on_queue("q")).await;
        pipeline.entry(&stop).receive(&mut envelope).await.unwrap();
        let pipeline_trace = trace.lock().unwrap().clone();

        let trace = Arc::new(Mutex::new(Vec::new()));
        let stack = builder(&trace).build_stack(handlers(trace.clone())).unwrap();
        let mut envelope = deliver(&driver, Message::new("x").on_queue("q")).await;
        stack.entry(&stop).receive(&mut envelope).await.unwrap();
        let stack_trace = trace.lock().unwrap().clone();

        assert_eq!(pipeline_trace, vec!["outer", "inner", "handler"]);
        assert_eq!(stack_trace, pipeline_trace);
        assert!(envelope.is_deleted());
    }
}
