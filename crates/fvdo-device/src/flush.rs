//! Flush handling.
//!
//! The flush contract: a request with a preflush marker must not be
//! acknowledged until every previously acknowledged write is durable.
//! When the engine owns flush semantics, flushes queue here and the
//! engine acknowledges the whole waiting list once its flush work
//! retires. When flushes are delegated, the instance never sees them
//! past accounting; the host remaps them to the backing device.

use crate::stats::RequestStats;
use fvdo_engine::{BackingDevice, EngineFacade, PermitBundle};
use fvdo_error::{Result, VdoError};
use fvdo_types::{DispatchOutcome, Request};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error};

/// Serializes engine-owned flushes and provides the synchronous flush
/// primitive used around suspension.
#[derive(Debug)]
pub struct FlushPipeline {
    engine: Arc<dyn EngineFacade>,
    backing: Arc<dyn BackingDevice>,
    stats: Arc<RequestStats>,
    /// The flush serialization lock and the waiters it guards, in
    /// admission order.
    waiting: Mutex<VecDeque<Request>>,
}

impl FlushPipeline {
    #[must_use]
    pub fn new(
        engine: Arc<dyn EngineFacade>,
        backing: Arc<dyn BackingDevice>,
        stats: Arc<RequestStats>,
    ) -> Self {
        Self {
            engine,
            backing,
            stats,
            waiting: Mutex::new(VecDeque::new()),
        }
    }

    /// Hand an engine-owned flush to the engine and park it on the
    /// waiting list until [`complete_flushes`](Self::complete_flushes).
    ///
    /// The engine must not complete the request directly; acknowledgment
    /// flows through the waiting list so that every flush admitted
    /// before the durability point is acknowledged with it.
    pub fn launch(&self, request: Request) -> Result<DispatchOutcome> {
        self.waiting.lock().push_back(request.clone());
        self.engine.submit(request, PermitBundle::empty())?;
        Ok(DispatchOutcome::Submitted)
    }

    /// Acknowledge every flush admitted before this durability point.
    /// Returns how many were acknowledged.
    pub fn complete_flushes(&self, status: i32) -> usize {
        let drained: Vec<Request> = {
            let mut waiting = self.waiting.lock();
            waiting.drain(..).collect()
        };
        for request in &drained {
            self.stats.acknowledged.count(request);
            request.completion.complete(status);
        }
        if !drained.is_empty() {
            debug!(
                target: "fvdo::flush",
                event = "flushes_acknowledged",
                count = drained.len(),
                status
            );
        }
        drained.len()
    }

    /// Flushes admitted but not yet acknowledged.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.waiting.lock().len()
    }

    /// Issue one write-preflush against the backing device and block
    /// until it completes. Any failure surfaces as an I/O error; the
    /// caller decides whether to latch read-only.
    pub fn synchronous_flush(&self) -> Result<()> {
        let result = self.backing.flush();
        self.stats.count_flush_out();
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(
                    target: "fvdo::flush",
                    event = "synchronous_flush_failed",
                    error = %err
                );
                Err(VdoError::Io(std::io::Error::other(
                    "synchronous flush failed",
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fvdo_error::Result;
    use fvdo_types::{BlockCount, BlockNumber, RequestId, Ticks};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct FlushCountingDevice {
        flushes: AtomicUsize,
        fail: AtomicBool,
    }

    impl BackingDevice for FlushCountingDevice {
        fn read_block(&self, _block: BlockNumber, _buf: &mut [u8]) -> Result<()> {
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(VdoError::Io(std::io::Error::other("flush failed")));
            }
            Ok(())
        }

        fn identity(&self) -> String {
            "flush-counting".to_owned()
        }
    }

    #[derive(Debug, Default)]
    struct SwallowingEngine {
        submitted: AtomicUsize,
    }

    impl EngineFacade for SwallowingEngine {
        fn submit(&self, _request: Request, _permits: PermitBundle) -> Result<()> {
            self.submitted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn set_compressing(&self, _enable: bool) -> bool {
            false
        }

        fn suspend(&self, _save: bool) -> Result<()> {
            Ok(())
        }

        fn resume(&self) -> Result<()> {
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            Ok(())
        }

        fn destroy(&self) {}

        fn set_read_only(&self, _error: i32) {}

        fn prepare_grow_logical(&self, _blocks: BlockCount) -> Result<()> {
            Ok(())
        }

        fn grow_logical(&self, _blocks: BlockCount) -> Result<()> {
            Ok(())
        }

        fn prepare_grow_physical(&self, _blocks: BlockCount) -> Result<()> {
            Ok(())
        }

        fn grow_physical(&self, _blocks: BlockCount) -> Result<()> {
            Ok(())
        }

        fn worker_pool_contains_current(&self) -> bool {
            false
        }
    }

    fn pipeline() -> (FlushPipeline, Arc<FlushCountingDevice>, Arc<RequestStats>) {
        let backing = Arc::new(FlushCountingDevice::default());
        let stats = Arc::new(RequestStats::default());
        let pipeline = FlushPipeline::new(
            Arc::new(SwallowingEngine::default()),
            Arc::clone(&backing) as Arc<dyn BackingDevice>,
            Arc::clone(&stats),
        );
        (pipeline, backing, stats)
    }

    #[test]
    fn launched_flushes_wait_for_the_durability_point() {
        let (pipeline, _backing, stats) = pipeline();
        let flush_a = Request::flush(RequestId(1), Ticks(0));
        let flush_b = Request::flush(RequestId(2), Ticks(1));

        assert_eq!(
            pipeline.launch(flush_a.clone()).unwrap(),
            DispatchOutcome::Submitted
        );
        assert_eq!(
            pipeline.launch(flush_b.clone()).unwrap(),
            DispatchOutcome::Submitted
        );
        assert_eq!(pipeline.pending(), 2);
        assert!(!flush_a.completion.is_complete());

        assert_eq!(pipeline.complete_flushes(0), 2);
        assert_eq!(pipeline.pending(), 0);
        assert_eq!(flush_a.completion.status(), Some(0));
        assert_eq!(flush_b.completion.status(), Some(0));
        assert_eq!(stats.acknowledged.snapshot().flush, 2);
    }

    #[test]
    fn synchronous_flush_counts_even_on_failure() {
        let (pipeline, backing, stats) = pipeline();
        pipeline.synchronous_flush().unwrap();
        assert_eq!(stats.flush_out_count(), 1);

        backing.fail.store(true, Ordering::SeqCst);
        let err = pipeline.synchronous_flush().unwrap_err();
        assert!(matches!(err, VdoError::Io(_)));
        assert_eq!(stats.flush_out_count(), 2);
        assert_eq!(backing.flushes.load(Ordering::SeqCst), 2);
    }
}
