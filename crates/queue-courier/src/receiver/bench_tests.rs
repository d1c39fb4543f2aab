//! Tests for the bench receiver.

use super::*;
use crate::consumer::StopHandle;
use crate::message::Message;
use crate::receiver::{Chain, Next, Pipeline};
use crate::test_support::{deliver, Outcome, RecordingDriver, ScriptedReceiver};
use std::sync::Arc;

/// Receiver taking a fixed time per delivery
struct Slow(Duration);

#[async_trait]
impl Receiver for Slow {
    async fn receive(&self, envelope: &mut Envelope, next: &dyn Next) -> Result<(), ProcessError> {
        tokio::time::sleep(self.0).await;
        next.receive(envelope).await
    }
}

#[test]
fn test_empty_report() {
    let report = BenchReport::default();
    assert_eq!(report.count, 0);
    assert_eq!(report.average(), Duration::ZERO);
}

/// Verify count, min, max and total aggregate successes and failures
#[tokio::test(start_paused = true)]
async fn test_aggregates_timings() {
    let bench = Arc::new(BenchReceiver::new());
    let pipeline = Pipeline::new(vec![
        bench.clone(),
        Arc::new(Slow(Duration::from_millis(100))),
        ScriptedReceiver::new([Outcome::Succeed, Outcome::Fail]),
    ]);
    let stop = StopHandle::new();
    let driver = RecordingDriver::new();

    for data in ["a", "b"] {
        let mut envelope = deliver(&driver, Message::new(data).on_queue("q")).await;
        let _ = pipeline.entry(&stop).receive(&mut envelope).await;
    }
    pipeline.entry(&stop).receive_stop().await.unwrap();

    let report = bench.report();
    assert_eq!(report.count, 2);
    assert!(report.min >= Duration::from_millis(100));
    assert!(report.max >= report.min);
    assert!(report.total >= Duration::from_millis(200));
    assert!(report.average() >= Duration::from_millis(100));
}
