//! The task / `ImgTask` base contract (C2): every node in the dependency
//! graph is a `Task`, executed at most once, gated on its predecessors'
//! completion. `TaskBase` holds the bookkeeping every concrete task shares
//! (state, run-once guard, dependency list, valid area); concrete tasks
//! embed one and implement `execute` for their own body.
//!
//! Task outputs are heterogeneous (a loaded colour image, a wavelet buffer,
//! a depth accumulator, a reassignment map, ...). Rather than reach for
//! `dyn Any`, every producing task exposes its result as one variant of
//! `Artifact` — a tagged union, per the "do not use dynamic inheritance for
//! the result shape" note in the design notes.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{EngineError, Result};
use crate::geometry::Rect;
use crate::image::{ColorImage, DepthLabelImage, GrayF32Image, GrayImage, WaveletImage};
use crate::logger::Logger;
use crate::tasks::align::Transform;
use crate::tasks::depth::{DepthMap, GuoState};
use crate::tasks::reassign::ReassignMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Pending = 0,
    Running = 1,
    Done = 2,
    /// Reserved for tasks cancelled before ever running (e.g. orphaned by a
    /// failed orchestrator build). Ordinary task execution never leaves a
    /// task in this state even when its body fails — see `run()` below.
    Failed = 3,
}

impl From<u8> for TaskState {
    fn from(v: u8) -> Self {
        match v {
            0 => TaskState::Pending,
            1 => TaskState::Running,
            2 => TaskState::Done,
            _ => TaskState::Failed,
        }
    }
}

/// One task's output, tagged by kind. Stages that don't produce a
/// meaningful artifact of their own (e.g. Save, whose real effect is
/// writing to the sink) use `Unit`.
#[derive(Clone)]
pub enum Artifact {
    Gray(Arc<GrayImage>),
    Color(Arc<ColorImage>),
    GrayF32(Arc<GrayF32Image>),
    Wavelet(Arc<WaveletImage>),
    Guo(Arc<GuoState>),
    Depth(Arc<DepthMap>),
    Transform(Arc<Transform>),
    ReassignMap(Arc<ReassignMap>),
    /// Alignment's output: the warped colour image plus the affine that
    /// produced it — a neighbour's Align chains off the transform half
    /// (`stacked_transform`/initial guess) while Grayscale(aligned) and
    /// Save consume the image half.
    Align(Arc<ColorImage>, Arc<Transform>),
    /// Merge's output: the fused wavelet coefficients plus the per-pixel
    /// source-image label the consistency passes and the reassignment map
    /// both need.
    Merge(Arc<WaveletImage>, Arc<DepthLabelImage>),
    Unit,
}

impl Artifact {
    pub fn as_gray(&self) -> Option<&Arc<GrayImage>> {
        match self {
            Artifact::Gray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_color(&self) -> Option<&Arc<ColorImage>> {
        match self {
            Artifact::Color(v) => Some(v),
            Artifact::Align(v, _) => Some(v),
            _ => None,
        }
    }

    pub fn as_align_transform(&self) -> Option<&Arc<Transform>> {
        match self {
            Artifact::Align(_, t) => Some(t),
            _ => None,
        }
    }

    pub fn as_gray_f32(&self) -> Option<&Arc<GrayF32Image>> {
        match self {
            Artifact::GrayF32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_wavelet(&self) -> Option<&Arc<WaveletImage>> {
        match self {
            Artifact::Wavelet(v) => Some(v),
            Artifact::Merge(v, _) => Some(v),
            _ => None,
        }
    }

    pub fn as_depth_label(&self) -> Option<&Arc<DepthLabelImage>> {
        match self {
            Artifact::Merge(_, l) => Some(l),
            _ => None,
        }
    }

    pub fn as_guo(&self) -> Option<&Arc<GuoState>> {
        match self {
            Artifact::Guo(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_depth(&self) -> Option<&Arc<DepthMap>> {
        match self {
            Artifact::Depth(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_transform(&self) -> Option<&Arc<Transform>> {
        match self {
            Artifact::Transform(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_reassign_map(&self) -> Option<&Arc<ReassignMap>> {
        match self {
            Artifact::ReassignMap(v) => Some(v),
            _ => None,
        }
    }
}

/// Shared bookkeeping embedded in every concrete task.
pub struct TaskBase {
    name: String,
    filename: String,
    index: usize,
    uses_gpu: bool,
    state: AtomicU8,
    run_guard: Mutex<()>,
    depends_on: Mutex<Vec<Arc<dyn Task>>>,
    valid_area: Mutex<Rect>,
    result: Mutex<Option<Artifact>>,
    failure: Mutex<Option<String>>,
}

impl TaskBase {
    pub fn new(name: impl Into<String>, filename: impl Into<String>, index: usize, uses_gpu: bool) -> Self {
        Self {
            name: name.into(),
            filename: filename.into(),
            index,
            uses_gpu,
            state: AtomicU8::new(TaskState::Pending as u8),
            run_guard: Mutex::new(()),
            depends_on: Mutex::new(Vec::new()),
            valid_area: Mutex::new(Rect::from_size(0, 0)),
            result: Mutex::new(None),
            failure: Mutex::new(None),
        }
    }

    pub fn with_depends_on(self, deps: Vec<Arc<dyn Task>>) -> Self {
        *self.depends_on.lock().unwrap() = deps;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn basename(&self) -> &str {
        self.filename
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.filename)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn uses_gpu(&self) -> bool {
        self.uses_gpu
    }

    pub fn state(&self) -> TaskState {
        TaskState::from(self.state.load(Ordering::Acquire))
    }

    pub fn depends_on(&self) -> Vec<Arc<dyn Task>> {
        self.depends_on.lock().unwrap().clone()
    }

    pub fn ready_to_run(&self) -> bool {
        self.depends_on
            .lock()
            .unwrap()
            .iter()
            .all(|d| d.state() == TaskState::Done)
    }

    pub fn valid_area(&self) -> Rect {
        *self.valid_area.lock().unwrap()
    }

    pub fn set_valid_area(&self, area: Rect) {
        *self.valid_area.lock().unwrap() = area;
    }

    /// Narrows the stored valid area by intersection; every stage calls
    /// this on its own output once computed (I8: valid area never grows).
    pub fn limit_valid_area(&self, other: Rect) {
        let mut guard = self.valid_area.lock().unwrap();
        *guard = guard.intersect(&other);
    }

    pub fn result(&self) -> Artifact {
        self.result
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(Artifact::Unit)
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().unwrap().clone()
    }
}

/// Every node of the dependency graph. `execute` is the only method a
/// concrete task provides; `run` (below, via the blanket default) supplies
/// the run-once guard, state transitions, and dependency release.
pub trait Task: Send + Sync {
    fn base(&self) -> &TaskBase;

    /// The task body. Called at most once, with every dependency already
    /// `Done` (I1). Returns the artifact this task produces.
    fn execute(&self, logger: &Logger) -> Result<Artifact>;

    fn name(&self) -> &str {
        self.base().name()
    }

    fn basename(&self) -> &str {
        self.base().basename()
    }

    fn index(&self) -> usize {
        self.base().index()
    }

    fn uses_gpu(&self) -> bool {
        self.base().uses_gpu()
    }

    fn state(&self) -> TaskState {
        self.base().state()
    }

    fn depends_on(&self) -> Vec<Arc<dyn Task>> {
        self.base().depends_on()
    }

    /// Default readiness test: every predecessor is `Done`. Overridable —
    /// a streaming Load task gates on file presence instead.
    fn ready_to_run(&self) -> bool {
        self.base().ready_to_run()
    }

    fn valid_area(&self) -> Rect {
        self.base().valid_area()
    }

    fn limit_valid_area(&self, other: Rect) {
        self.base().limit_valid_area(other)
    }

    fn result(&self) -> Artifact {
        self.base().result()
    }

    fn failure(&self) -> Option<String> {
        self.base().failure()
    }

    /// Idempotent-at-most-once execution, guarded so concurrent callers
    /// (there are none in the scheduler's own dispatch, but the contract
    /// holds regardless) observe the same outcome (I2). On success the
    /// dependency list is cleared, dropping this task's strong references
    /// to its predecessors so their buffers can free once every consumer
    /// is `Done`. On failure the state still becomes `Done` — dependents
    /// gate on `Done`, not success, so a single task failure cannot stall
    /// the rest of the graph; the scheduler is the one that stops
    /// dispatching new work once it observes the failure.
    fn run(&self, logger: &Logger) -> std::result::Result<(), String> {
        let base = self.base();
        let _guard = base.run_guard.lock().unwrap();
        if base.state() != TaskState::Pending {
            // Already run by a previous call; idempotent no-op.
            return match base.failure() {
                Some(msg) => Err(msg),
                None => Ok(()),
            };
        }
        base.state.store(TaskState::Running as u8, Ordering::Release);

        match self.execute(logger) {
            Ok(artifact) => {
                *base.result.lock().unwrap() = Some(artifact);
                base.depends_on.lock().unwrap().clear();
                base.state.store(TaskState::Done as u8, Ordering::Release);
                Ok(())
            }
            Err(err) => {
                let message = format_task_error(self.name(), &err);
                *base.failure.lock().unwrap() = Some(message.clone());
                base.state.store(TaskState::Done as u8, Ordering::Release);
                Err(message)
            }
        }
    }
}

fn format_task_error(task_name: &str, err: &EngineError) -> String {
    format!("Task '{task_name}' failed: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Immediate {
        base: TaskBase,
        fail: bool,
    }

    impl Task for Immediate {
        fn base(&self) -> &TaskBase {
            &self.base
        }

        fn execute(&self, _logger: &Logger) -> Result<Artifact> {
            if self.fail {
                Err(EngineError::ConfigError("boom".to_string()))
            } else {
                Ok(Artifact::Unit)
            }
        }
    }

    #[test]
    fn run_transitions_pending_to_done_on_success() {
        let t = Immediate { base: TaskBase::new("t", "t.jpg", 0, false), fail: false };
        assert_eq!(t.state(), TaskState::Pending);
        t.run(&Logger::new()).unwrap();
        assert_eq!(t.state(), TaskState::Done);
    }

    #[test]
    fn run_marks_done_even_on_failure() {
        let t = Immediate { base: TaskBase::new("t", "t.jpg", 0, false), fail: true };
        let err = t.run(&Logger::new()).unwrap_err();
        assert!(err.contains("boom"));
        assert_eq!(t.state(), TaskState::Done);
        assert!(t.failure().is_some());
    }

    #[test]
    fn run_is_idempotent() {
        let t = Immediate { base: TaskBase::new("t", "t.jpg", 0, false), fail: false };
        t.run(&Logger::new()).unwrap();
        // second call must not panic and must observe the same outcome
        t.run(&Logger::new()).unwrap();
    }

    #[test]
    fn ready_to_run_requires_all_dependencies_done() {
        let dep = Arc::new(Immediate { base: TaskBase::new("dep", "dep.jpg", 0, false), fail: false });
        let t = Immediate {
            base: TaskBase::new("t", "t.jpg", 1, false).with_depends_on(vec![dep.clone() as Arc<dyn Task>]),
            fail: false,
        };
        assert!(!t.ready_to_run());
        dep.run(&Logger::new()).unwrap();
        assert!(t.ready_to_run());
    }

    #[test]
    fn basename_strips_directory() {
        let t = Immediate { base: TaskBase::new("t", "/a/b/img_003.jpg", 0, false), fail: false };
        assert_eq!(t.basename(), "img_003.jpg");
    }
}
