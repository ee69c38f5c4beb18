//! Scheduling of the elementary block multiplications.
//!
//! A contraction is expanded into a list of [`GemmTask`]s, each computing
//! `out += f · op(A) · X · op(B)ᵀ` on one pair of blocks. How the tasks are run
//! is chosen once per operator through [`SeqMode`]:
//!
//! - `None`: tasks are executed as soon as the contractor produces them.
//! - `Simple`: tasks of one application are collected and run as a batch.
//! - `Auto` and `Tasked`: a dry run in `precompute` records the task list and
//!   sizes the scratch buffer; later applications replay the recording. The
//!   two names select the same schedule here, since the replay runs on the
//!   calling thread.
//!
//! All modes execute the same tasks in the same order through
//! [`Sequencer::execute`], so their results are bit-identical.

use faer::{Accum, Mat, MatMut, MatRef, Par, linalg::matmul::matmul};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeqMode {
    #[default]
    None,
    Simple,
    Auto,
    Tasked,
}

impl SeqMode {
    /// Whether `precompute` records a task list for replay.
    pub fn records(self) -> bool {
        matches!(self, SeqMode::Auto | SeqMode::Tasked)
    }
}

/// Location of a dense block inside a flat vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub offset: usize,
    pub rows: usize,
    pub cols: usize,
}

impl BlockSpan {
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same block shifted by `base`, for vectors stored inside a group.
    pub fn shifted(self, base: usize) -> Self {
        Self {
            offset: self.offset + base,
            ..self
        }
    }
}

/// One elementary block multiplication. A missing operand is the identity.
#[derive(Debug, Clone)]
pub struct GemmTask {
    pub left: Option<Arc<Mat<f64>>>,
    pub left_trans: bool,
    pub right: Option<Arc<Mat<f64>>>,
    pub right_trans: bool,
    pub input: BlockSpan,
    pub output: BlockSpan,
    pub factor: f64,
}

impl GemmTask {
    fn op_left(&self) -> Option<MatRef<'_, f64>> {
        self.left.as_ref().map(|a| {
            if self.left_trans {
                Mat::as_ref(a).transpose()
            } else {
                Mat::as_ref(a)
            }
        })
    }

    /// `op(B)ᵀ`, the factor applied from the right.
    fn op_right_t(&self) -> Option<MatRef<'_, f64>> {
        self.right.as_ref().map(|b| {
            if self.right_trans {
                Mat::as_ref(b)
            } else {
                Mat::as_ref(b).transpose()
            }
        })
    }

    /// Entries of the intermediate `op(A) · X` when both operands are present.
    pub fn scratch_len(&self) -> usize {
        match (&self.left, &self.right) {
            (Some(_), Some(_)) => self.output.rows * self.input.cols,
            _ => 0,
        }
    }

    pub fn nflop(&self) -> u64 {
        let (i, o) = (self.input, self.output);
        let flops = match (&self.left, &self.right) {
            (None, None) => o.len(),
            (Some(_), None) => 2 * o.rows * i.rows * i.cols,
            (None, Some(_)) => 2 * o.rows * o.cols * i.cols,
            (Some(_), Some(_)) => 2 * o.rows * i.rows * i.cols + 2 * o.rows * o.cols * i.cols,
        };
        flops as u64
    }
}

/// Recorded task list of one contraction.
#[derive(Debug, Clone, Default)]
pub struct TaskPlan {
    tasks: Vec<GemmTask>,
    nflop: u64,
    max_scratch: usize,
}

impl TaskPlan {
    pub fn push(&mut self, task: GemmTask) {
        self.nflop += task.nflop();
        self.max_scratch = self.max_scratch.max(task.scratch_len());
        self.tasks.push(task);
    }

    pub fn tasks(&self) -> &[GemmTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn nflop(&self) -> u64 {
        self.nflop
    }

    pub fn max_scratch(&self) -> usize {
        self.max_scratch
    }
}

/// Executes block tasks and counts floating-point operations.
#[derive(Debug, Default)]
pub struct Sequencer {
    mode: SeqMode,
    cumulative_nflop: u64,
    scratch: Vec<f64>,
}

impl Sequencer {
    pub fn new(mode: SeqMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn mode(&self) -> SeqMode {
        self.mode
    }

    pub fn cumulative_nflop(&self) -> u64 {
        self.cumulative_nflop
    }

    pub fn reset_nflop(&mut self) {
        self.cumulative_nflop = 0;
    }

    /// Sizes the batch scratch for replaying `plan`.
    pub fn prepare(&mut self, plan: &TaskPlan) {
        if self.mode.records() {
            self.scratch = vec![0.0; plan.max_scratch()];
        }
    }

    pub fn deallocate(&mut self) {
        self.scratch = Vec::new();
    }

    /// Runs every task of `plan` in recorded order, with the runtime `factor`
    /// multiplying each task's own factor.
    pub fn perform(&mut self, plan: &TaskPlan, input: &[f64], output: &mut [f64], factor: f64) {
        for task in plan.tasks() {
            self.execute(task, input, output, factor);
        }
    }

    /// `output[out] += factor · task.factor · op(A) · input[in] · op(B)ᵀ`
    pub fn execute(&mut self, task: &GemmTask, input: &[f64], output: &mut [f64], factor: f64) {
        let (i, o) = (task.input, task.output);
        let alpha = factor * task.factor;
        if task.left.is_none() && task.right.is_none() {
            assert_eq!((i.rows, i.cols), (o.rows, o.cols), "identity task changes block shape");
            let src = &input[i.offset..i.offset + i.len()];
            let dst = &mut output[o.offset..o.offset + o.len()];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += alpha * s;
            }
            self.cumulative_nflop += task.nflop();
            return;
        }
        let x = MatRef::from_column_major_slice(&input[i.offset..i.offset + i.len()], i.rows, i.cols);
        let out = MatMut::from_column_major_slice_mut(
            &mut output[o.offset..o.offset + o.len()],
            o.rows,
            o.cols,
        );
        match (task.op_left(), task.op_right_t()) {
            (None, None) => unreachable!("identity tasks are handled above"),
            (Some(a), None) => matmul(out, Accum::Add, a, x, alpha, Par::Seq),
            (None, Some(bt)) => matmul(out, Accum::Add, x, bt, alpha, Par::Seq),
            (Some(a), Some(bt)) => {
                let need = o.rows * i.cols;
                if self.scratch.len() < need {
                    self.scratch.resize(need, 0.0);
                }
                let mut tmp = MatMut::from_column_major_slice_mut(&mut self.scratch[..need], o.rows, i.cols);
                matmul(tmp.as_mut(), Accum::Replace, a, x, 1.0, Par::Seq);
                matmul(out, Accum::Add, tmp.as_ref(), bt, alpha, Par::Seq);
            }
        }
        self.cumulative_nflop += task.nflop();
    }
}

/// Application strategy, fixed when the operator is built.
///
/// Direct strategies expand the expression on every application; replaying
/// strategies record the expansion once in `precompute` and reuse it.
pub trait Applicable: Send + std::fmt::Debug {
    fn mode(&self) -> SeqMode;

    /// Whether a task list should be recorded during `precompute`.
    fn records(&self) -> bool;

    fn store(&mut self, plan: TaskPlan);

    fn recorded(&self) -> Option<&TaskPlan>;

    fn clear(&mut self);
}

#[derive(Debug)]
pub struct DirectApply {
    mode: SeqMode,
}

impl Applicable for DirectApply {
    fn mode(&self) -> SeqMode {
        self.mode
    }

    fn records(&self) -> bool {
        false
    }

    fn store(&mut self, _plan: TaskPlan) {}

    fn recorded(&self) -> Option<&TaskPlan> {
        None
    }

    fn clear(&mut self) {}
}

#[derive(Debug)]
pub struct ReplayApply {
    mode: SeqMode,
    plan: Option<TaskPlan>,
}

impl Applicable for ReplayApply {
    fn mode(&self) -> SeqMode {
        self.mode
    }

    fn records(&self) -> bool {
        true
    }

    fn store(&mut self, plan: TaskPlan) {
        self.plan = Some(plan);
    }

    fn recorded(&self) -> Option<&TaskPlan> {
        self.plan.as_ref()
    }

    fn clear(&mut self) {
        self.plan = None;
    }
}

/// The application strategy matching `mode`.
pub fn applicable_for(mode: SeqMode) -> Box<dyn Applicable> {
    if mode.records() {
        Box::new(ReplayApply { mode, plan: None })
    } else {
        Box::new(DirectApply { mode })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    fn span(offset: usize, rows: usize, cols: usize) -> BlockSpan {
        BlockSpan { offset, rows, cols }
    }

    #[test]
    fn test_two_sided_task_matches_dense_product() {
        // X = [[1, 2], [3, 4]] stored column major.
        let input = [1.0, 3.0, 2.0, 4.0];
        let a = mat![[0.0, 1.0], [1.0, 0.0]];
        let b = mat![[2.0, 0.0], [0.0, -1.0]];
        let task = GemmTask {
            left: Some(Arc::new(a)),
            left_trans: false,
            right: Some(Arc::new(b)),
            right_trans: false,
            input: span(0, 2, 2),
            output: span(1, 2, 2),
            factor: 0.5,
        };
        let mut output = [9.0, 0.0, 0.0, 0.0, 0.0];
        let mut seq = Sequencer::new(SeqMode::None);
        seq.execute(&task, &input, &mut output, 2.0);
        // A X Bᵀ = [[3, 4], [1, 2]] · diag(2, -1) = [[6, -4], [2, -2]]
        assert_eq!(output, [9.0, 6.0, 2.0, -4.0, -2.0]);
        assert_eq!(seq.cumulative_nflop(), task.nflop());
        assert_eq!(task.nflop(), 32);
    }

    #[test]
    fn test_transposed_left_operand() {
        let input = [1.0, 1.0];
        let a = mat![[1.0, 2.0], [0.0, 1.0]];
        let task = GemmTask {
            left: Some(Arc::new(a)),
            left_trans: true,
            right: None,
            right_trans: false,
            input: span(0, 2, 1),
            output: span(0, 2, 1),
            factor: 1.0,
        };
        let mut output = [0.0; 2];
        Sequencer::default().execute(&task, &input, &mut output, 1.0);
        assert_eq!(output, [1.0, 3.0]);
    }

    #[test]
    fn test_plan_tracks_flops_and_scratch() {
        let mut plan = TaskPlan::default();
        plan.push(GemmTask {
            left: Some(Arc::new(Mat::zeros(3, 2))),
            left_trans: false,
            right: Some(Arc::new(Mat::zeros(4, 5))),
            right_trans: false,
            input: span(0, 2, 5),
            output: span(0, 3, 4),
            factor: 1.0,
        });
        plan.push(GemmTask {
            left: None,
            left_trans: false,
            right: None,
            right_trans: false,
            input: span(0, 2, 2),
            output: span(0, 2, 2),
            factor: 1.0,
        });
        assert_eq!(plan.max_scratch(), 15);
        assert_eq!(plan.nflop(), 2 * 3 * 2 * 5 + 2 * 3 * 4 * 5 + 4);
        assert!(applicable_for(SeqMode::Tasked).records());
        assert!(!applicable_for(SeqMode::Simple).records());
    }

    #[test]
    fn test_recording_modes_size_scratch_up_front() {
        let mut plan = TaskPlan::default();
        plan.push(GemmTask {
            left: Some(Arc::new(Mat::zeros(3, 2))),
            left_trans: false,
            right: Some(Arc::new(Mat::zeros(4, 5))),
            right_trans: false,
            input: span(0, 2, 5),
            output: span(0, 3, 4),
            factor: 1.0,
        });
        assert_eq!(plan.max_scratch(), 15);
        for mode in [SeqMode::Auto, SeqMode::Tasked] {
            let mut seq = Sequencer::new(mode);
            seq.prepare(&plan);
            assert_eq!(seq.scratch.len(), plan.max_scratch(), "{mode:?}");
        }
        let mut simple = Sequencer::new(SeqMode::Simple);
        simple.prepare(&plan);
        assert!(simple.scratch.is_empty());
    }
}
