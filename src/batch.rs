// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Batch Consumer
//!
//! Accumulates deliveries and hands them to a [`BatchHandler`] as one unit. A batch
//! is flushed when it reaches `batch_size` or when `batch_timeout` has elapsed since
//! its first message, whichever comes first. The timer only runs while a batch is
//! open, so a size flush is never followed by a timer flush of the same messages.
//!
//! A successful batch is acknowledged with a single `multiple` ack on its last
//! delivery tag. A failed batch is either rejected the same way, when retry is
//! disabled, or sent through the retry state machine one delivery at a time.
//!
//! The accumulation loop and each batch run as tracked work, so closing the
//! consumer waits for the final flush before the channel goes away.

use crate::{
    config::{ConsumerConfig, QosConfig},
    connection::ConnectionManager,
    consumer::{BaseConsumer, Consumer, Settler},
    delivery::Delivery,
    errors::AmqpError,
    handler::BatchHandler,
    otel,
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use opentelemetry::{
    global,
    trace::{Span, Status},
    KeyValue,
};
use std::{error::Error, sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, warn};

/// Consumer that processes deliveries in batches.
pub struct BatchConsumer {
    base: BaseConsumer,
    batcher: Batcher,
}

impl BatchConsumer {
    /// Sets up the channel and topology described by `config`.
    ///
    /// The prefetch count is raised to `batch_size` when it is lower, otherwise a
    /// batch could never fill up.
    pub async fn new(
        mut config: ConsumerConfig,
        manager: &ConnectionManager,
        handler: Arc<dyn BatchHandler>,
        batch_size: u16,
        batch_timeout: Duration,
    ) -> Result<BatchConsumer, AmqpError> {
        if batch_size == 0 {
            return Err(AmqpError::InvalidConfig(
                "batch size must be positive".to_owned(),
            ));
        }
        if batch_timeout.is_zero() {
            return Err(AmqpError::InvalidConfig(
                "batch timeout must be positive".to_owned(),
            ));
        }

        clamp_prefetch(&mut config.qos, batch_size);

        let base = BaseConsumer::new(config, manager).await?;
        let batcher = Batcher {
            settler: base.settler.clone(),
            handler,
            tracker: base.tracker.clone(),
            batch_size: usize::from(batch_size),
            batch_timeout,
            queue: base.queue.clone(),
        };

        Ok(BatchConsumer { base, batcher })
    }

    /// Name of the queue being consumed, as returned by the broker.
    pub fn queue(&self) -> &str {
        &self.base.queue
    }
}

#[async_trait]
impl Consumer for BatchConsumer {
    async fn start_consuming(&self, cancel: CancellationToken) -> Result<(), AmqpError> {
        let cancel = self.base.consumption_token(cancel);
        let deliveries = self.base.consume().await?.map(|r| r.map(Delivery::from));
        self.batcher.consume(deliveries, cancel).await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.base.close().await
    }
}

fn clamp_prefetch(qos: &mut QosConfig, batch_size: u16) {
    if qos.prefetch_count < batch_size {
        warn!(
            prefetch_count = qos.prefetch_count,
            batch_size, "prefetch count is lower than the batch size, raising it"
        );
        qos.prefetch_count = batch_size;
    }
}

pub(crate) struct Batcher {
    settler: Arc<Settler>,
    handler: Arc<dyn BatchHandler>,
    tracker: TaskTracker,
    batch_size: usize,
    batch_timeout: Duration,
    queue: String,
}

impl Batcher {
    /// Runs the accumulation loop as tracked work.
    pub(crate) async fn consume<S, E>(
        &self,
        deliveries: S,
        cancel: CancellationToken,
    ) -> Result<(), AmqpError>
    where
        S: Stream<Item = Result<Delivery, E>>,
        E: Error,
    {
        self.tracker.track_future(self.run(deliveries, cancel)).await
    }

    pub(crate) async fn run<S, E>(
        &self,
        deliveries: S,
        cancel: CancellationToken,
    ) -> Result<(), AmqpError>
    where
        S: Stream<Item = Result<Delivery, E>>,
        E: Error,
    {
        tokio::pin!(deliveries);

        let mut batch: Vec<Delivery> = Vec::with_capacity(self.batch_size);
        let timer = tokio::time::sleep(self.batch_timeout);
        tokio::pin!(timer);
        let mut armed = false;

        loop {
            if cancel.is_cancelled() {
                self.flush(&mut batch).await;
                return Ok(());
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(queue = self.queue, pending = batch.len(), "consumption cancelled");
                    self.flush(&mut batch).await;
                    return Ok(());
                }
                _ = &mut timer, if armed => {
                    armed = false;
                    debug!(queue = self.queue, size = batch.len(), "batch timeout reached");
                    self.flush(&mut batch).await;
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        if batch.is_empty() {
                            timer.as_mut().reset(Instant::now() + self.batch_timeout);
                            armed = true;
                        }
                        batch.push(delivery);

                        if batch.len() >= self.batch_size {
                            armed = false;
                            self.flush(&mut batch).await;
                        }
                    }
                    Some(Err(err)) => {
                        error!(error = err.to_string(), queue = self.queue, "errors consume msg");
                        self.flush(&mut batch).await;
                        return Err(AmqpError::ConsumerStreamClosed(err.to_string()));
                    }
                    None => {
                        error!(queue = self.queue, "delivery stream ended");
                        self.flush(&mut batch).await;
                        return Err(AmqpError::ConsumerStreamClosed(
                            "delivery stream ended".to_owned(),
                        ));
                    }
                },
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<Delivery>) {
        if batch.is_empty() {
            return;
        }

        let deliveries = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        let settler = self.settler.clone();
        let handler = self.handler.clone();
        let queue = self.queue.clone();

        let task = self.tracker.spawn(async move {
            process_batch(&settler, handler.as_ref(), &deliveries, &queue).await;
        });

        if let Err(err) = task.await {
            error!(error = err.to_string(), queue = self.queue, "batch task failed");
        }
    }
}

pub(crate) async fn process_batch(
    settler: &Settler,
    handler: &dyn BatchHandler,
    deliveries: &[Delivery],
    queue: &str,
) {
    let (Some(first), Some(last)) = (deliveries.first(), deliveries.last()) else {
        return;
    };

    let tracer = global::tracer("amqp consumer");
    let (ctx, mut span) = otel::new_span(&first.properties, &tracer, queue);
    span.set_attribute(KeyValue::new(
        "messaging.batch.message_count",
        deliveries.len() as i64,
    ));

    match handler.exec(&ctx, deliveries).await {
        Ok(()) => {
            span.set_status(Status::Ok);
            debug!(queue, size = deliveries.len(), "batch successfully processed");

            if let Err(err) = last.ack(true).await {
                error!(error = err.to_string(), queue, "error whiling ack batch");
                span.record_error(&err);
            }
        }
        Err(err) => {
            warn!(
                error = err.to_string(),
                queue,
                size = deliveries.len(),
                "error whiling handling batch"
            );
            span.record_error(err.as_ref());
            span.set_status(Status::error(err.to_string()));

            if !settler.retry_enabled() {
                if let Err(err) = last.nack(true, false).await {
                    error!(error = err.to_string(), queue, "error whiling nack batch");
                    span.record_error(&err);
                }
            } else {
                for delivery in deliveries {
                    if let Err(err) = settler.settle_failure(&ctx, delivery).await {
                        error!(
                            error = err.to_string(),
                            queue,
                            delivery_tag = delivery.delivery_tag,
                            "error settling msg of failed batch"
                        );
                        span.record_error(&err);
                    }
                }
            }
        }
    }

    span.end();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        delivery::testing::{x_death, Ledger, Settlement},
        errors::HandlerError,
        publisher::MockPublisher,
        retry::{FinalDeadLetter, RetryPolicy},
    };
    use futures_util::stream;
    use lapin::types::FieldTable;
    use opentelemetry::Context;
    use std::sync::Mutex;

    const QUEUE: &str = "processed_properties";
    const TIMEOUT: Duration = Duration::from_secs(1);

    #[derive(Default)]
    struct RecordingHandler {
        batches: Mutex<Vec<Vec<u64>>>,
        fail: bool,
    }

    impl RecordingHandler {
        fn batches(&self) -> Vec<Vec<u64>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchHandler for RecordingHandler {
        async fn exec(&self, _ctx: &Context, deliveries: &[Delivery]) -> Result<(), HandlerError> {
            self.batches
                .lock()
                .unwrap()
                .push(deliveries.iter().map(|d| d.delivery_tag).collect());

            if self.fail {
                return Err("bulk insert failed".into());
            }
            Ok(())
        }
    }

    fn batcher(handler: Arc<RecordingHandler>, settler: Settler, batch_size: usize) -> Batcher {
        Batcher {
            settler: Arc::new(settler),
            handler,
            tracker: TaskTracker::new(),
            batch_size,
            batch_timeout: TIMEOUT,
            queue: QUEUE.to_owned(),
        }
    }

    fn plain_settler() -> Settler {
        Settler::new(QUEUE, "saver", RetryPolicy::default(), None)
    }

    fn deliveries(ledger: &Ledger, tags: std::ops::RangeInclusive<u64>) -> Vec<Delivery> {
        tags.map(|tag| ledger.delivery(tag, FieldTable::default()))
            .collect()
    }

    /// Yields `deliveries` and then stays open until `cancel_after` elapses.
    async fn run_until(
        batcher: &Batcher,
        deliveries: Vec<Delivery>,
        cancel_after: Duration,
    ) -> Result<(), AmqpError> {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(cancel_after).await;
            canceller.cancel();
        });

        let stream = stream::iter(deliveries.into_iter().map(Ok::<_, std::io::Error>))
            .chain(stream::pending());
        batcher.run(stream, cancel).await
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_is_acked_once_with_multiple() {
        let ledger = Ledger::default();
        let handler = Arc::new(RecordingHandler::default());
        let batcher = batcher(handler.clone(), plain_settler(), 5);

        let result = run_until(&batcher, deliveries(&ledger, 1..=5), TIMEOUT * 5).await;

        assert_eq!(result, Ok(()));
        assert_eq!(handler.batches(), vec![vec![1, 2, 3, 4, 5]]);
        assert_eq!(
            ledger.entries(),
            vec![Settlement::Ack {
                tag: 5,
                multiple: true
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_is_flushed_by_the_timer() {
        let ledger = Ledger::default();
        let handler = Arc::new(RecordingHandler::default());
        let batcher = batcher(handler.clone(), plain_settler(), 10);

        let result = run_until(&batcher, deliveries(&ledger, 1..=3), TIMEOUT * 5).await;

        assert_eq!(result, Ok(()));
        // the timer flush leaves nothing for the cancellation flush
        assert_eq!(handler.batches(), vec![vec![1, 2, 3]]);
        assert_eq!(
            ledger.entries(),
            vec![Settlement::Ack {
                tag: 3,
                multiple: true
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn size_and_timer_never_flush_the_same_messages() {
        let ledger = Ledger::default();
        let handler = Arc::new(RecordingHandler::default());
        let batcher = batcher(handler.clone(), plain_settler(), 2);

        let result = run_until(&batcher, deliveries(&ledger, 1..=5), TIMEOUT * 5).await;

        assert_eq!(result, Ok(()));
        assert_eq!(handler.batches(), vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(ledger.entries().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_flushes_the_open_batch() {
        let ledger = Ledger::default();
        let handler = Arc::new(RecordingHandler::default());
        let batcher = batcher(handler.clone(), plain_settler(), 10);

        let result = run_until(&batcher, deliveries(&ledger, 1..=2), TIMEOUT / 10).await;

        assert_eq!(result, Ok(()));
        assert_eq!(handler.batches(), vec![vec![1, 2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn draining_after_cancel_waits_for_the_final_flush() {
        let ledger = Ledger::default();
        let handler = Arc::new(RecordingHandler::default());
        let batcher = Arc::new(batcher(handler.clone(), plain_settler(), 10));
        let tracker = batcher.tracker.clone();
        let cancel = CancellationToken::new();

        let stream = stream::iter(
            deliveries(&ledger, 1..=3)
                .into_iter()
                .map(Ok::<_, std::io::Error>),
        )
        .chain(stream::pending());
        let consuming = tokio::spawn({
            let batcher = batcher.clone();
            let cancel = cancel.clone();
            async move { batcher.consume(stream, cancel).await }
        });

        tokio::time::sleep(TIMEOUT / 10).await;
        cancel.cancel();
        tracker.close();
        tracker.wait().await;

        assert_eq!(
            ledger.entries(),
            vec![Settlement::Ack {
                tag: 3,
                multiple: true
            }]
        );
        assert_eq!(consuming.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn stream_end_flushes_and_reports_closure() {
        let ledger = Ledger::default();
        let handler = Arc::new(RecordingHandler::default());
        let batcher = batcher(handler.clone(), plain_settler(), 10);

        let stream = stream::iter(
            deliveries(&ledger, 1..=2)
                .into_iter()
                .map(Ok::<_, std::io::Error>),
        );
        let result = batcher.run(stream, CancellationToken::new()).await;

        assert!(matches!(result, Err(AmqpError::ConsumerStreamClosed(_))));
        assert_eq!(handler.batches(), vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn failed_batch_without_retry_is_rejected_in_bulk() {
        let ledger = Ledger::default();
        let handler = RecordingHandler {
            fail: true,
            ..Default::default()
        };

        process_batch(
            &plain_settler(),
            &handler,
            &deliveries(&ledger, 1..=4),
            QUEUE,
        )
        .await;

        assert_eq!(
            ledger.entries(),
            vec![Settlement::Nack {
                tag: 4,
                multiple: true,
                requeue: false
            }]
        );
    }

    #[tokio::test]
    async fn failed_batch_with_retry_settles_each_delivery() {
        let ledger = Ledger::default();
        let handler = RecordingHandler {
            fail: true,
            ..Default::default()
        };

        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let settler = Settler::new(
            QUEUE,
            "saver",
            RetryPolicy::for_queue(
                QUEUE,
                10_000,
                3,
                FinalDeadLetter::new("final_dlx", "final_dlq", "properties.dlq.key"),
            ),
            Some(Arc::new(publisher)),
        );

        let batch = vec![
            ledger.delivery(1, FieldTable::default()),
            ledger.delivery(2, x_death(&[(QUEUE, 3)])),
        ];
        process_batch(&settler, &handler, &batch, QUEUE).await;

        assert_eq!(
            ledger.entries(),
            vec![
                Settlement::Nack {
                    tag: 1,
                    multiple: false,
                    requeue: false
                },
                Settlement::Ack {
                    tag: 2,
                    multiple: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let handler = RecordingHandler::default();

        process_batch(&plain_settler(), &handler, &[], QUEUE).await;

        assert!(handler.batches().is_empty());
    }

    #[test]
    fn prefetch_is_raised_to_the_batch_size() {
        let mut qos = QosConfig {
            prefetch_count: 10,
            ..Default::default()
        };
        clamp_prefetch(&mut qos, 50);
        assert_eq!(qos.prefetch_count, 50);

        clamp_prefetch(&mut qos, 20);
        assert_eq!(qos.prefetch_count, 50);
    }
}
