/*!
Progress reporting for long-running encode, decode and backup operations.
*/

use std::sync::atomic::{AtomicU32, Ordering};

/// A single progress notification
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// Completion percentage in `0.0..=100.0`
    pub percent: f32,
    /// Human-readable label for the current stage
    pub stage: String,
    /// Current unit of work (batch, asset, frame), when the stage is countable
    pub current: Option<usize>,
    /// Total units of work for the stage
    pub total: Option<usize>,
}

impl Progress {
    pub fn new(percent: f32, stage: impl Into<String>) -> Self {
        Self {
            percent,
            stage: stage.into(),
            current: None,
            total: None,
        }
    }

    pub fn with_counts(mut self, current: usize, total: usize) -> Self {
        self.current = Some(current);
        self.total = Some(total);
        self
    }
}

/// Receiver of progress notifications
///
/// Implementations must return quickly; they are invoked from inside the
/// operation between units of work. Any `Fn(Progress) + Send + Sync` closure
/// is a reporter.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, progress: Progress);
}

impl<F> ProgressReporter for F
where
    F: Fn(Progress) + Send + Sync,
{
    fn report(&self, progress: Progress) {
        self(progress)
    }
}

/// Reporter that discards every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _progress: Progress) {}
}

/// Wraps a reporter so percentages never go backwards and map into a sub-range
///
/// An operation reports `0..=100` locally; the tracker rescales that into
/// `[start, end]` of its parent and clamps against the highest value already
/// delivered.
pub(crate) struct ProgressTracker<'a> {
    sink: &'a dyn ProgressReporter,
    start: f32,
    end: f32,
    high_water: AtomicU32,
}

impl<'a> ProgressTracker<'a> {
    pub(crate) fn new(sink: &'a dyn ProgressReporter) -> Self {
        Self::scaled(sink, 0.0, 100.0)
    }

    pub(crate) fn scaled(sink: &'a dyn ProgressReporter, start: f32, end: f32) -> Self {
        Self {
            sink,
            start,
            end,
            high_water: AtomicU32::new(0f32.to_bits()),
        }
    }

    pub(crate) fn update(&self, percent: f32, stage: &str) {
        self.deliver(Progress::new(percent, stage));
    }

    pub(crate) fn update_counts(&self, percent: f32, stage: &str, current: usize, total: usize) {
        self.deliver(Progress::new(percent, stage).with_counts(current, total));
    }

    fn deliver(&self, mut progress: Progress) {
        let local = progress.percent.clamp(0.0, 100.0);
        let mapped = self.start + (self.end - self.start) * local / 100.0;

        let previous = f32::from_bits(self.high_water.load(Ordering::Relaxed));
        let percent = mapped.max(previous);
        self.high_water.store(percent.to_bits(), Ordering::Relaxed);

        progress.percent = percent;
        self.sink.report(progress);
    }
}

impl ProgressReporter for ProgressTracker<'_> {
    fn report(&self, progress: Progress) {
        self.deliver(progress);
    }
}
