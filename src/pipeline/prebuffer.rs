//! The pre-buffer: the in-memory inbox for incoming points.
//!
//! A single producer appends points and receives a strictly
//! increasing transaction id per write. A drain task empties the
//! buffer into the first-stage writer, either on a timed interval or
//! eagerly once the rollover point count is reached; the producer
//! itself only blocks when the buffer hits its hard capacity.

use std::{mem, sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};

use crate::encoding::{TreeKey, TreeValue};
use crate::tree::VecStream;

use super::{
    first_stage::{FirstStageWriter, PreBufferRolloverArgs},
    scheduler::{RunReason, ScheduledTask},
    BuildError, PipelineError,
};

/// Pre-buffer configuration.
#[derive(Debug, Clone)]
pub struct PreBufferConfig {
    /// Hard capacity; the producer blocks at this size.
    pub max_points: usize,
    /// Buffered point count that triggers an eager drain.
    pub rollover_point_count: usize,
    /// Timed drain interval.
    pub rollover_interval: Duration,
}

/// Builder for [`PreBufferConfig`].
#[derive(Debug, Clone)]
pub struct PreBufferConfigBuilder {
    max_points: usize,
    rollover_point_count: usize,
    rollover_interval: Duration,
}

impl Default for PreBufferConfigBuilder {
    fn default() -> Self {
        Self {
            max_points: 10_000,
            rollover_point_count: 2_000,
            rollover_interval: Duration::from_millis(100),
        }
    }
}

impl PreBufferConfigBuilder {
    /// Sets the hard capacity. Valid range: 1,000 through 100,000.
    pub fn max_points(mut self, max_points: usize) -> Self {
        self.max_points = max_points;
        self
    }

    /// Sets the eager-drain threshold.
    pub fn rollover_point_count(mut self, count: usize) -> Self {
        self.rollover_point_count = count;
        self
    }

    /// Sets the timed drain interval. Valid range: 1ms through 1000ms.
    pub fn rollover_interval(mut self, interval: Duration) -> Self {
        self.rollover_interval = interval;
        self
    }

    pub fn build(self) -> Result<PreBufferConfig, BuildError> {
        if !(1_000..=100_000).contains(&self.max_points) {
            return Err(BuildError::InvalidParameter {
                param_name: "max_points",
                reason: "must be between 1,000 and 100,000".to_string(),
            });
        }
        let millis = self.rollover_interval.as_millis();
        if !(1..=1_000).contains(&millis) {
            return Err(BuildError::InvalidParameter {
                param_name: "rollover_interval",
                reason: "must be between 1ms and 1000ms".to_string(),
            });
        }
        if self.rollover_point_count == 0 || self.rollover_point_count > self.max_points {
            return Err(BuildError::InvalidParameter {
                param_name: "rollover_point_count",
                reason: "must be between 1 and max_points".to_string(),
            });
        }
        Ok(PreBufferConfig {
            max_points: self.max_points,
            rollover_point_count: self.rollover_point_count,
            rollover_interval: self.rollover_interval,
        })
    }
}

struct PreBufferState<K, V> {
    points: Vec<(K, V)>,
    next_transaction: i64,
    stopped: bool,
}

struct PreBufferShared<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    config: PreBufferConfig,
    state: Mutex<PreBufferState<K, V>>,
    drained: Condvar,
    first_stage: Arc<FirstStageWriter<K, V>>,
}

impl<K, V> PreBufferShared<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    fn drain(&self, reason: RunReason) {
        let (points, transaction_id) = {
            let mut state = self.state.lock();
            if state.points.is_empty() {
                return;
            }
            (mem::take(&mut state.points), state.next_transaction)
        };
        // Capacity-blocked producers can make progress immediately;
        // the hand-off below provides the real backpressure.
        self.drained.notify_all();

        let count = points.len();
        let args = PreBufferRolloverArgs {
            points: VecStream::from_unsorted(points),
            transaction_id,
        };
        match self.first_stage.append_rollover(args) {
            Ok(()) => trace!(count, transaction_id, "Drained pre-buffer."),
            Err(error) => {
                // The batch is lost; transaction ids above the soft
                // watermark tell the caller exactly which writes never
                // committed.
                error!(%error, count, "Failed to hand pre-buffer batch to first stage.");
            }
        }
        if reason == RunReason::Disposing {
            debug!("Pre-buffer drain task disposed.");
        }
    }
}

/// The single-producer write handle.
pub struct PreBufferWriter<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    shared: Arc<PreBufferShared<K, V>>,
    drain_task: ScheduledTask,
}

impl<K, V> PreBufferWriter<K, V>
where
    K: TreeKey,
    V: TreeValue,
{
    pub fn new(config: PreBufferConfig, first_stage: Arc<FirstStageWriter<K, V>>) -> Self {
        let interval = config.rollover_interval;
        let shared = Arc::new(PreBufferShared {
            config,
            state: Mutex::new(PreBufferState {
                points: Vec::new(),
                next_transaction: 0,
                stopped: false,
            }),
            drained: Condvar::new(),
            first_stage,
        });

        let for_task = Arc::clone(&shared);
        let drain_task = ScheduledTask::spawn("pre-buffer-drain", Some(interval), move |reason| {
            for_task.drain(reason);
        });

        Self { shared, drain_task }
    }

    /// Appends one point, returning its transaction id.
    ///
    /// Transaction ids are strictly increasing for the producer. The
    /// call blocks while the buffer is at hard capacity and returns
    /// `ShuttingDown` after [`stop`] was called.
    ///
    /// [`stop`]: PreBufferWriter::stop
    pub fn write(&mut self, key: K, value: V) -> Result<i64, PipelineError> {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(PipelineError::ShuttingDown);
        }

        state.next_transaction += 1;
        let transaction_id = state.next_transaction;
        state.points.push((key, value));

        if state.points.len() >= self.shared.config.rollover_point_count {
            self.drain_task.start();
        }
        while state.points.len() >= self.shared.config.max_points && !state.stopped {
            self.shared.drained.wait(&mut state);
        }
        Ok(transaction_id)
    }

    /// The id of the most recently accepted transaction.
    pub fn last_transaction(&self) -> i64 {
        self.shared.state.lock().next_transaction
    }

    /// Rejects further writes; buffered points remain drainable.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.stopped = true;
        self.shared.drained.notify_all();
    }

    /// Nudges an eager drain.
    pub fn request_drain(&self) {
        self.drain_task.start();
    }

    /// Stops intake and drains everything buffered, consuming the
    /// writer.
    pub fn shutdown(self) {
        self.stop();
        // Disposing the task delivers one final drain run.
        self.drain_task.dispose();
    }
}
