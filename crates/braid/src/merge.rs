//! Concurrent flattening: drain up to N inner sources at once.
//!
//! Three parts cooperate:
//! - a driver task reads the outer stream, admitting one inner source per
//!   gate permit and scheduler tick;
//! - one drain task per inner source pushes its values onto a shared queue,
//!   waiting for each to be taken before reading the next, and returns its
//!   permit when the source ends;
//! - the output stream's source only pulls from that queue.
//!
//! The done marker is pushed after the outer stream is exhausted and every
//! drain task has been joined. The first error, from the outer stream or any
//! inner one, is queued as the output's terminal error and tears down all
//! remaining upstream work. Cancelling the output does the same and waits for
//! the driver, so every upstream reader has been cancelled or released by the
//! time `cancel` returns.

use std::sync::{Arc, OnceLock};

use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{Concurrency, MergeConfig};
use crate::error::{Result, StreamError};
use crate::gate::{Gate, GatePermit};
use crate::inner::Inner;
use crate::queue::{BlockingQueue, TryPull};
use crate::scheduler::Scheduler;
use crate::stream::{Controller, PullSource, PullStream, Reader};

/// Flattens `outer`, draining up to `config.concurrency` inner sources at once.
///
/// Inner streams are locked only when admitted, so at most that many inner
/// readers are held by the merge. [`Inner::Reader`] elements arrive locked and
/// are exempt: the limit still bounds how many of them are pulled.
///
/// Fails immediately with a configuration error for a concurrency of zero.
pub fn merge<T: Send + 'static>(
    outer: PullStream<Inner<T>>,
    config: MergeConfig,
) -> Result<PullStream<T>> {
    let gate = match config.concurrency.limit()? {
        Some(permits) => Gate::new(permits),
        None => Gate::unbounded(),
    };
    let source = MergeSource {
        outer: Some(outer),
        gate: Arc::new(gate),
        scheduler: Arc::clone(&config.scheduler),
        queue: Arc::new(BlockingQueue::new()),
        teardown: Arc::new(Teardown::default()),
        driver: None,
        concurrency: config.concurrency,
    };
    Ok(PullStream::with_config(source, config.stream))
}

/// Merges a fixed list of streams.
pub fn merge_streams<T: Send + 'static>(
    streams: Vec<PullStream<T>>,
    concurrency: impl Into<Concurrency>,
) -> Result<PullStream<T>> {
    let outer = PullStream::iter(streams.into_iter().map(Inner::Stream).collect::<Vec<_>>());
    merge(outer, MergeConfig::new(concurrency))
}

enum Event<T> {
    Value(T),
    Error(StreamError),
}

/// Shared stop signal carrying the reason handed to upstream cancels.
#[derive(Default)]
struct Teardown {
    token: CancellationToken,
    reason: OnceLock<Option<String>>,
}

impl Teardown {
    fn fire(&self, reason: Option<String>) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    fn reason(&self) -> Option<String> {
        self.reason.get().cloned().flatten()
    }

    fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct MergeSource<T: Send + 'static> {
    outer: Option<PullStream<Inner<T>>>,
    gate: Arc<Gate>,
    scheduler: Arc<dyn Scheduler>,
    queue: Arc<BlockingQueue<Event<T>>>,
    teardown: Arc<Teardown>,
    driver: Option<JoinHandle<()>>,
    concurrency: Concurrency,
}

impl<T: Send + 'static> MergeSource<T> {
    fn deliver(&self, event: Event<T>, controller: &Controller<T>) -> Result<()> {
        match event {
            Event::Value(item) => controller.enqueue(item),
            Event::Error(e) => {
                self.teardown.fire(Some(format!("merge aborted: {e}")));
                Err(e)
            }
        }
    }
}

#[async_trait::async_trait]
impl<T: Send + 'static> PullSource<T> for MergeSource<T> {
    async fn start(&mut self, _controller: &Controller<T>) -> Result<()> {
        let Some(outer) = self.outer.take() else {
            return Ok(());
        };
        let outer = outer.into_reader()?;
        tracing::debug!(concurrency = %self.concurrency, "Starting merge");

        let driver = MergeDriver {
            outer,
            gate: Arc::clone(&self.gate),
            scheduler: Arc::clone(&self.scheduler),
            queue: Arc::clone(&self.queue),
            teardown: Arc::clone(&self.teardown),
            drains: JoinSet::new(),
            admitted: 0,
        };
        self.driver = Some(tokio::spawn(driver.run()));
        Ok(())
    }

    async fn pull(&mut self, controller: &Controller<T>) -> Result<()> {
        match self.queue.pull().await {
            Some(event) => self.deliver(event, controller)?,
            None => return controller.close(),
        }
        // Hand over whatever else is already queued, within demand.
        while controller.has_demand() {
            match self.queue.try_pull() {
                TryPull::Item(event) => self.deliver(event, controller)?,
                TryPull::Empty => break,
                TryPull::Done => return controller.close(),
            }
        }
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<String>) -> Result<()> {
        self.teardown.fire(reason);
        if let Some(driver) = self.driver.take()
            && let Err(e) = driver.await
        {
            tracing::debug!(error = %e, "Merge driver ended abnormally during cancel");
        }
        Ok(())
    }
}

impl<T: Send + 'static> Drop for MergeSource<T> {
    fn drop(&mut self) {
        // Stops upstream work when the output is dropped without cancelling.
        if !self.teardown.is_fired() {
            self.teardown.fire(Some("merge dropped".to_string()));
        }
    }
}

struct MergeDriver<T: Send + 'static> {
    outer: Reader<Inner<T>>,
    gate: Arc<Gate>,
    scheduler: Arc<dyn Scheduler>,
    queue: Arc<BlockingQueue<Event<T>>>,
    teardown: Arc<Teardown>,
    drains: JoinSet<()>,
    admitted: usize,
}

impl<T: Send + 'static> MergeDriver<T> {
    async fn run(mut self) {
        self.admit_all().await;

        if self.teardown.is_fired()
            && let Err(e) = self.outer.cancel(self.teardown.reason()).await
        {
            tracing::debug!(error = %e, "Failed to cancel merge outer source");
        }

        while let Some(joined) = self.drains.join_next().await {
            self.check_join(joined);
        }
        tracing::debug!(admitted = self.admitted, "Merge drained");
        self.queue.finish();
    }

    /// Admits inner sources until the outer stream ends, fails, or teardown fires.
    async fn admit_all(&mut self) {
        let token = self.teardown.token.clone();
        loop {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                permit = self.gate.acquire() => permit,
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(e) => return self.fail(e),
            };

            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = self.scheduler.next_tick() => {}
            }

            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                next = self.outer.read() => next,
            };
            match next {
                Ok(Some(inner)) => {
                    let kind = inner.kind();
                    match inner.into_reader() {
                        Ok(reader) => self.spawn_drain(reader, permit, kind),
                        Err(e) => return self.fail(e),
                    }
                }
                Ok(None) => {
                    tracing::trace!(admitted = self.admitted, "Merge outer exhausted");
                    return;
                }
                Err(e) => return self.fail(e),
            }

            while let Some(joined) = self.drains.try_join_next() {
                self.check_join(joined);
            }
        }
    }

    fn spawn_drain(&mut self, reader: Reader<T>, permit: GatePermit, kind: &'static str) {
        self.admitted += 1;
        tracing::trace!(inner = self.admitted, kind, "Admitted inner source");
        self.drains.spawn(drain(
            reader,
            permit,
            Arc::clone(&self.queue),
            Arc::clone(&self.teardown),
        ));
    }

    fn check_join(&self, joined: std::result::Result<(), JoinError>) {
        if let Err(e) = joined
            && e.is_panic()
        {
            self.fail(StreamError::TaskFailed(e.to_string()));
        }
    }

    fn fail(&self, error: StreamError) {
        tracing::debug!(error = %error, "Merge failed");
        let reason = format!("merge aborted: {error}");
        let _ = self.queue.push(Event::Error(error));
        self.teardown.fire(Some(reason));
    }
}

/// Drains one inner source into the queue, then releases its reader and
/// only afterwards its permit.
async fn drain<T: Send + 'static>(
    mut reader: Reader<T>,
    permit: GatePermit,
    queue: Arc<BlockingQueue<Event<T>>>,
    teardown: Arc<Teardown>,
) {
    pump(&mut reader, &queue, &teardown).await;
    drop(reader);
    drop(permit);
}

async fn pump<T: Send + 'static>(
    reader: &mut Reader<T>,
    queue: &BlockingQueue<Event<T>>,
    teardown: &Teardown,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = teardown.token.cancelled() => None,
            next = reader.read() => Some(next),
        };
        let Some(next) = next else {
            return abandon(reader, teardown).await;
        };

        match next {
            Ok(Some(item)) => {
                let Ok(dequeued) = queue.push(Event::Value(item)) else {
                    return;
                };
                // One value in flight per source: read again only once the
                // output has taken this one.
                tokio::select! {
                    biased;
                    _ = teardown.token.cancelled() => return abandon(reader, teardown).await,
                    _ = dequeued => {}
                }
            }
            Ok(None) => return,
            Err(e) => {
                let reason = format!("merge aborted: {e}");
                let _ = queue.push(Event::Error(e));
                teardown.fire(Some(reason));
                return;
            }
        }
    }
}

async fn abandon<T: Send + 'static>(reader: &mut Reader<T>, teardown: &Teardown) {
    if let Err(e) = reader.cancel(teardown.reason()).await {
        tracing::debug!(error = %e, "Failed to cancel merge inner source");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::StreamExt;

    use crate::concat::concat;
    use crate::scheduler::IdleScheduler;

    /// Tracks how many probe sources are live at once.
    #[derive(Default)]
    struct Census {
        live: AtomicUsize,
        peak: AtomicUsize,
        cancels: AtomicUsize,
    }

    impl Census {
        fn enter(&self) {
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(live, Ordering::SeqCst);
        }

        fn leave(&self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Emits its values with a delay between each, reporting lifecycle to a census.
    struct Probe {
        values: VecDeque<u32>,
        delay: Duration,
        census: Arc<Census>,
        fail_cancel: bool,
        live: bool,
    }

    impl Probe {
        fn new(values: Vec<u32>, delay_ms: u64, census: &Arc<Census>) -> Self {
            Self {
                values: values.into(),
                delay: Duration::from_millis(delay_ms),
                census: Arc::clone(census),
                fail_cancel: false,
                live: false,
            }
        }

        fn finish(&mut self) {
            if std::mem::take(&mut self.live) {
                self.census.leave();
            }
        }
    }

    fn probe(values: Vec<u32>, delay_ms: u64, census: &Arc<Census>) -> PullStream<u32> {
        PullStream::new(Probe::new(values, delay_ms, census))
    }

    #[async_trait::async_trait]
    impl PullSource<u32> for Probe {
        async fn start(&mut self, _controller: &Controller<u32>) -> Result<()> {
            self.live = true;
            self.census.enter();
            Ok(())
        }

        async fn pull(&mut self, controller: &Controller<u32>) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            match self.values.pop_front() {
                Some(v) => controller.enqueue(v),
                None => {
                    self.finish();
                    controller.close()
                }
            }
        }

        async fn cancel(&mut self, _reason: Option<String>) -> Result<()> {
            self.census.cancels.fetch_add(1, Ordering::SeqCst);
            self.finish();
            if self.fail_cancel {
                return Err(StreamError::message("probe cancel failed"));
            }
            Ok(())
        }
    }

    async fn collect<T: Send + 'static>(stream: PullStream<T>) -> Vec<Result<T>> {
        stream.into_reader().unwrap().into_stream().collect().await
    }

    fn values<T>(results: Vec<Result<T>>) -> Vec<T> {
        results.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let outer = PullStream::<Inner<u32>>::empty();
        let err = merge(outer, MergeConfig::new(0)).unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn empty_outer_completes() {
        let merged = merge(PullStream::<Inner<u32>>::empty(), MergeConfig::new(2)).unwrap();
        assert!(collect(merged).await.is_empty());
    }

    #[tokio::test]
    async fn merges_every_value() {
        let census = Arc::new(Census::default());
        let merged = merge_streams(
            vec![
                probe(vec![1, 2, 3], 3, &census),
                probe(vec![10, 20], 1, &census),
                probe(vec![], 1, &census),
                probe(vec![100], 2, &census),
            ],
            Concurrency::Unbounded,
        )
        .unwrap();

        let mut out = values(collect(merged).await);
        out.sort_unstable();
        assert_eq!(out, vec![1, 2, 3, 10, 20, 100]);
        assert_eq!(census.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn limit_one_matches_concat() {
        let census = Arc::new(Census::default());
        let build = |census: &Arc<Census>| {
            vec![
                probe(vec![1, 2], 5, census),
                probe(vec![], 1, census),
                probe(vec![3, 4], 1, census),
                probe(vec![5], 2, census),
            ]
        };

        let merged = values(collect(merge_streams(build(&census), 1).unwrap()).await);
        let concatenated = values(collect(concat(build(&census)).unwrap()).await);
        assert_eq!(merged, vec![1, 2, 3, 4, 5]);
        assert_eq!(merged, concatenated);
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_limit() {
        for limit in [1usize, 2, 3] {
            let census = Arc::new(Census::default());
            let inners: Vec<_> = (0..8u32)
                .map(|i| probe(vec![i, i + 100], u64::from(i % 3) + 1, &census))
                .collect();

            let out = values(collect(merge_streams(inners, limit).unwrap()).await);
            assert_eq!(out.len(), 16);
            let peak = census.peak.load(Ordering::SeqCst);
            assert!(peak <= limit, "peak {peak} exceeded limit {limit}");
            assert_eq!(peak, limit);
        }
    }

    #[tokio::test]
    async fn preserves_order_within_each_source() {
        let census = Arc::new(Census::default());
        // B is admitted after A but emits faster.
        let merged = merge_streams(
            vec![probe(vec![1, 2], 20, &census), probe(vec![3, 4], 1, &census)],
            2,
        )
        .unwrap();

        let out = values(collect(merged).await);
        let pos = |v: u32| out.iter().position(|x| *x == v).unwrap();
        assert!(pos(1) < pos(2));
        assert!(pos(3) < pos(4));
        assert!(pos(4) < pos(1), "faster source should interleave first: {out:?}");
    }

    #[tokio::test]
    async fn inner_error_terminates_once() {
        let census = Arc::new(Census::default());
        let merged = merge_streams(
            vec![
                probe(vec![1, 2, 3, 4, 5], 10, &census),
                PullStream::failed(StreamError::message("inner exploded")),
            ],
            2,
        )
        .unwrap();

        let results = collect(merged).await;
        let errors = results.iter().filter(|r| r.is_err()).count();
        assert_eq!(errors, 1);
        assert!(results.last().unwrap().is_err());

        // The slow sibling was cancelled rather than left running.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(census.live.load(Ordering::SeqCst), 0);
        assert_eq!(census.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn outer_error_terminates_once() {
        let census = Arc::new(Census::default());
        let first = probe(vec![1], 1, &census);
        let outer = PullStream::from_stream(futures::stream::iter(vec![
            Ok(Inner::Stream(first)),
            Err(StreamError::message("outer exploded")),
        ]));
        let merged = merge(outer, MergeConfig::new(4)).unwrap();

        let results = collect(merged).await;
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
        match results.last() {
            Some(Err(StreamError::Message(m))) => assert_eq!(m, "outer exploded"),
            other => panic!("expected outer error, got {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[tokio::test]
    async fn deferred_values_become_single_element_sources() {
        let outer = PullStream::iter(vec![
            Inner::deferred(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(1)
            }),
            Inner::Value(2),
            Inner::Collection(vec![3, 4]),
            Inner::Collection(Vec::new()),
        ]);
        let merged = merge(outer, MergeConfig::new(Concurrency::Unbounded)).unwrap();
        let mut out = values(collect(merged).await);
        out.sort_unstable();
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn cancel_releases_every_reader_once() {
        let census = Arc::new(Census::default());
        let mut failing = Probe::new((0..100).collect(), 5, &census);
        failing.fail_cancel = true;
        let inners = vec![
            PullStream::new(failing),
            probe((0..100).collect(), 5, &census),
            probe((0..100).collect(), 5, &census),
        ];
        let merged = merge_streams(inners, 3).unwrap();

        let mut reader = merged.into_reader().unwrap();
        assert!(reader.read().await.unwrap().is_some());
        assert_eq!(census.live.load(Ordering::SeqCst), 3);

        reader.cancel(Some("consumer gone".into())).await.unwrap();
        assert_eq!(census.cancels.load(Ordering::SeqCst), 3);
        assert_eq!(census.live.load(Ordering::SeqCst), 0);

        // Second cancel is a no-op.
        reader.cancel(None).await.unwrap();
        assert_eq!(census.cancels.load(Ordering::SeqCst), 3);
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancel_propagates_reason_upstream() {
        let reasons = Arc::new(StdMutex::new(Vec::new()));

        struct Recorder {
            sent: bool,
            reasons: Arc<StdMutex<Vec<Option<String>>>>,
        }

        #[async_trait::async_trait]
        impl PullSource<u32> for Recorder {
            async fn pull(&mut self, controller: &Controller<u32>) -> Result<()> {
                if !std::mem::replace(&mut self.sent, true) {
                    return controller.enqueue(1);
                }
                std::future::pending().await
            }

            async fn cancel(&mut self, reason: Option<String>) -> Result<()> {
                self.reasons.lock().unwrap().push(reason);
                Ok(())
            }
        }

        let merged = merge_streams(
            vec![PullStream::new(Recorder {
                sent: false,
                reasons: Arc::clone(&reasons),
            })],
            1,
        )
        .unwrap();
        let mut reader = merged.into_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(1));
        reader.cancel(Some("shutdown".into())).await.unwrap();

        assert_eq!(*reasons.lock().unwrap(), vec![Some("shutdown".to_string())]);
    }

    #[tokio::test]
    async fn reader_elements_are_pulled_within_limit() {
        let census = Arc::new(Census::default());
        let readers: Vec<_> = (0..6u32)
            .map(|i| Inner::Reader(probe(vec![i], 3, &census).into_reader().unwrap()))
            .collect();
        // Every reader is locked before the merge starts.
        let outer = PullStream::iter(readers);

        let mut out = values(collect(merge(outer, MergeConfig::new(2)).unwrap()).await);
        out.sort_unstable();
        assert_eq!(out, (0..6).collect::<Vec<_>>());
        assert_eq!(census.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn scheduler_paces_admission() {
        let census = Arc::new(Census::default());
        let inners: Vec<_> = (0..4u32).map(|i| probe(vec![i], 1, &census)).collect();
        let outer = PullStream::iter(inners.into_iter().map(Inner::Stream).collect::<Vec<_>>());
        let config = MergeConfig::new(2).with_scheduler(IdleScheduler::new(2).unwrap());

        let mut out = values(collect(merge(outer, config).unwrap()).await);
        out.sort_unstable();
        assert_eq!(out, vec![0, 1, 2, 3]);
    }

    /// Never ends; counts how often it is pulled.
    struct Endless {
        pulls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl PullSource<u64> for Endless {
        async fn pull(&mut self, controller: &Controller<u64>) -> Result<()> {
            let n = self.pulls.fetch_add(1, Ordering::SeqCst);
            controller.enqueue(n as u64)
        }
    }

    fn endless(pulls: &Arc<AtomicUsize>) -> PullStream<u64> {
        PullStream::new(Endless {
            pulls: Arc::clone(pulls),
        })
    }

    #[tokio::test]
    async fn inner_sources_follow_output_demand() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let merged = merge_streams(vec![endless(&pulls)], 1).unwrap();

        let mut reader = merged.into_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The value read plus at most one waiting to be taken.
        let idle = pulls.load(Ordering::SeqCst);
        assert!(idle <= 2, "inner pulled {idle} times for one consumed value");

        for expected in 1..=5 {
            assert_eq!(reader.read().await.unwrap(), Some(expected));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let idle = pulls.load(Ordering::SeqCst);
        assert!(idle <= 7, "inner pulled {idle} times for six consumed values");

        reader.cancel(None).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_sources_stay_within_demand() {
        let counters: Vec<_> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let merged = merge_streams(counters.iter().map(endless).collect(), 3).unwrap();

        let mut reader = merged.into_reader().unwrap();
        for _ in 0..4 {
            assert!(reader.read().await.unwrap().is_some());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let total: usize = counters.iter().map(|c| c.load(Ordering::SeqCst)).sum();
        // Four taken plus at most one waiting per source.
        assert!(total <= 4 + 3, "inner sources pulled {total} times");

        reader.cancel(None).await.unwrap();
    }

    #[tokio::test]
    async fn dropping_output_stops_upstream() {
        let census = Arc::new(Census::default());
        let merged = merge_streams(vec![probe((0..1000).collect(), 2, &census)], 1).unwrap();

        let mut reader = merged.into_reader().unwrap();
        assert!(reader.read().await.unwrap().is_some());
        drop(reader);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(census.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(census.live.load(Ordering::SeqCst), 0);
    }
}
