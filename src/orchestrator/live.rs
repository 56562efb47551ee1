//! One live experiment: its machine behind a mutex plus a cancel flag

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError, TryLockError};

use chrono::{DateTime, Utc};
use tracing::Span;

use crate::error::{ToleranceWarning, WarningKind};
use crate::evaluation::Verdict;
use crate::experiment::{ExperimentId, ExperimentStatus, TerminalUpdate, TestResult};
use crate::machine::{Finalized, Phase, Snapshot, TestMachine};

/// Terminal transition produced under the lock, persisted after it is released.
#[derive(Debug)]
pub(super) struct Closing {
    pub update: TerminalUpdate,
    pub verdict: Verdict,
    pub snapshot: Snapshot,
}

/// Mutable side of a live experiment.
#[derive(Debug)]
pub(super) struct LiveState {
    pub machine: TestMachine,
    warnings: Vec<ToleranceWarning>,
    dropped: usize,
    closed: bool,
}

impl LiveState {
    /// Count `count` samples that arrived after the terminal state.
    pub fn drop_late(&mut self, count: usize, at: DateTime<Utc>) -> ToleranceWarning {
        self.dropped += count;
        let warning = ToleranceWarning::new(
            WarningKind::LateSampleDropped,
            format!(
                "{count} sample(s) dropped after terminal state {}",
                self.machine.phase()
            ),
            Some(at),
        );
        self.warnings.push(warning.clone());
        warning
    }

    /// Hand out the terminal transition the first time the machine is terminal.
    fn close(&mut self, now: DateTime<Utc>) -> Option<Closing> {
        if self.closed {
            return None;
        }
        let Finalized::Verdict(verdict) = self.machine.finalize() else {
            return None;
        };
        self.closed = true;

        let status = if self.machine.phase() == Phase::Cancelled {
            ExperimentStatus::Cancelled
        } else {
            ExperimentStatus::Completed
        };
        let records = self.machine.phase_records();
        let end_time = records.last().map(|r| r.entered_at);
        Some(Closing {
            update: TerminalUpdate {
                status,
                result: TestResult::from_pass(verdict.pass),
                notes: self.notes(&verdict),
                end_time: end_time.unwrap_or(now),
            },
            snapshot: self.machine.snapshot(),
            verdict,
        })
    }

    /// Verdict, visited phases and every warning folded into the record notes.
    fn notes(&self, verdict: &Verdict) -> String {
        let mut notes = format!("verdict: {verdict}");
        let path: Vec<String> = self
            .machine
            .phase_records()
            .iter()
            .map(|r| match &r.label {
                Some(label) => format!("{}[{label}]", r.phase),
                None => r.phase.to_string(),
            })
            .collect();
        let _ = write!(notes, "\nphases: {}", path.join(" -> "));

        let warnings = self.machine.warnings().iter().chain(&self.warnings);
        for warning in warnings {
            let _ = write!(notes, "\nwarning: {warning}");
        }
        if self.dropped > 0 {
            let _ = write!(notes, "\ndropped samples: {}", self.dropped);
        }
        notes
    }
}

/// Shared handle kept in the live map.
#[derive(Debug)]
pub(super) struct LiveEntry {
    span: Span,
    cancel_requested: AtomicBool,
    cancel_reason: OnceLock<String>,
    state: Mutex<LiveState>,
}

impl LiveEntry {
    pub fn new(id: &ExperimentId, machine: TestMachine) -> Self {
        let span = tracing::info_span!(
            "experiment",
            id = %id,
            test_type = %machine.test_type(),
            standard = machine.standard().code()
        );
        Self {
            span,
            cancel_requested: AtomicBool::new(false),
            cancel_reason: OnceLock::new(),
            state: Mutex::new(LiveState {
                machine,
                warnings: Vec::new(),
                dropped: 0,
                closed: false,
            }),
        }
    }

    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// Raise the cancel flag; the first reason wins.
    pub fn request_cancel(&self, reason: &str) {
        let _ = self.cancel_reason.set(reason.to_owned());
        self.cancel_requested.store(true, Ordering::Release);
    }

    /// Apply a pending cancel request. Returns `true` if this call cancelled the machine.
    pub fn observe_cancel(&self, state: &mut LiveState, now: DateTime<Utc>) -> bool {
        if !self.cancel_requested.load(Ordering::Acquire) {
            return false;
        }
        let reason = self
            .cancel_reason
            .get()
            .map_or("cancel requested", String::as_str);
        state.machine.cancel(now, reason)
    }

    /// Run `op` under the experiment lock, then collect the terminal
    /// transition if this call produced it.
    pub fn drive<R>(
        &self,
        now: DateTime<Utc>,
        op: impl FnOnce(&Self, &mut LiveState) -> R,
    ) -> (R, Option<Closing>) {
        let _entered = self.span.enter();
        let mut state = self.lock();
        self.observe_cancel(&mut *state, now);
        let out = op(self, &mut *state);
        let closing = state.close(now);
        (out, closing)
    }

    /// Like [`Self::drive`] with only the cancel check, but gives up when
    /// another caller holds the lock; that caller observes the flag instead.
    pub fn try_settle_cancel(&self, now: DateTime<Utc>) -> Option<Closing> {
        let _entered = self.span.enter();
        let mut state = match self.state.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        self.observe_cancel(&mut *state, now);
        state.close(now)
    }

    /// Read-only access to the state.
    pub fn inspect<R>(&self, f: impl FnOnce(&LiveState) -> R) -> R {
        f(&*self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, LiveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
