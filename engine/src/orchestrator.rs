// engine/src/orchestrator.rs
//!
//! Pipeline Orchestrator: the stage state machine.
//!
//! One run at a time. Stage calls block the calling thread without holding the
//! run lock, so `cancel`, `snapshot` and progress delivery stay responsive
//! while the backend works. Every terminal write goes through
//! `StageRecord::finish`, which only succeeds while the stage is still
//! processing: whichever of the response, a cancel or a backend cancellation
//! event lands first wins, and the rest are discarded.

use crate::api::{PipelineBackend, StageRequest};
use crate::history::{HistoryEntry, HistoryStore};
use crate::pipeline::{PipelineRun, RunStatus, Stage, StageProgress, StageRecord, StageStatus};
use crate::progress::{ChannelError, ProgressChannel, ProgressEvent, Subscription};
use crate::registry::ModelRegistry;
use crate::settings::Settings;
use crate::{Error, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

struct Inner {
    backend: Arc<dyn PipelineBackend>,
    history: Option<Arc<HistoryStore>>,
    run: Mutex<PipelineRun>,
    progress_degraded: AtomicBool,
}

pub struct Orchestrator {
    inner: Arc<Inner>,
    subscription: Mutex<Option<Subscription>>,
}

fn elapsed_since(record: &StageRecord) -> u64 {
    record
        .started_at
        .map(|started| (Utc::now() - started).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}

impl Inner {
    fn run(&self) -> std::sync::MutexGuard<'_, PipelineRun> {
        self.run.lock().expect("pipeline run poisoned")
    }

    /// Cancel the processing stage of the current run, if any.
    fn cancel(&self) -> Option<PipelineRun> {
        let snapshot = {
            let mut run = self.run();
            let stage = run.processing_stage()?;
            let record = run.stage_mut(stage);
            let elapsed = elapsed_since(record);
            if !record.finish(StageStatus::Cancelled, None, None, elapsed) {
                return None;
            }
            run.settle(stage);
            info!(run_id = %run.run_id, %stage, "stage cancelled");
            run.clone()
        };

        if let Err(err) = self.backend.cancel(&snapshot.run_id) {
            debug!(run_id = %snapshot.run_id, error = %err, "backend cancel request failed");
        }
        self.record_history(&snapshot);
        Some(snapshot)
    }

    /// Merge a pushed event into the run identified by `run_id`.
    fn apply_progress(&self, run_id: &str, event: &ProgressEvent) -> bool {
        match event {
            ProgressEvent::Keepalive => false,
            ProgressEvent::Cancelled => {
                if self.run().run_id != run_id {
                    return false;
                }
                self.cancel().is_some()
            }
            ProgressEvent::Progress {
                stage,
                percent,
                label,
            } => {
                let mut run = self.run();
                if run.run_id != run_id {
                    return false;
                }
                let record = run.stage_mut(*stage);
                if record.status != StageStatus::Processing {
                    debug!(%stage, "ignoring progress for a stage that is not processing");
                    return false;
                }
                record.progress = Some(StageProgress {
                    percent: *percent,
                    label: label.clone(),
                });
                true
            }
        }
    }

    /// Append a terminal run to history. A history failure never fails the run.
    fn record_history(&self, run: &PipelineRun) -> Option<HistoryEntry> {
        let history = self.history.as_ref()?;
        match history.append(run) {
            Ok(saved) => {
                for warning in &saved.warnings {
                    warn!(operation = %warning.operation, message = %warning.message, "history not mirrored");
                }
                Some(saved.value)
            }
            Err(err) => {
                warn!(run_id = %run.run_id, error = %err, "could not record history entry");
                None
            }
        }
    }
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn PipelineBackend>, history: Option<Arc<HistoryStore>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                history,
                run: Mutex::new(PipelineRun::default()),
                progress_degraded: AtomicBool::new(false),
            }),
            subscription: Mutex::new(None),
        }
    }

    /// Copy of the current run.
    pub fn snapshot(&self) -> PipelineRun {
        self.inner.run().clone()
    }

    /// Start a fresh run for `input` and return its id.
    pub fn prepare(&self, input: &str) -> Result<String> {
        if input.trim().is_empty() {
            return Err(Error::validation("input text must not be empty"));
        }
        if let Some(stage) = self.inner.run().processing_stage() {
            return Err(Error::InvalidTransition {
                stage,
                reason: "cannot replace a run while a stage is processing".into(),
            });
        }
        self.stop_watching();
        let mut run = self.inner.run();
        *run = PipelineRun::new(input.to_string());
        self.inner.progress_degraded.store(false, Ordering::SeqCst);
        debug!(run_id = %run.run_id, "pipeline prepared");
        Ok(run.run_id.clone())
    }

    /// Run one stage against the backend. Blocks until the backend answers.
    ///
    /// Returns the completed record, `StageFailure` when the backend or the
    /// transport failed, or `Cancelled` when the stage was cancelled (or the
    /// run replaced) before the answer arrived.
    pub fn start_stage(&self, stage: Stage, model_id: &str, temperature: f64) -> Result<StageRecord> {
        if model_id.trim().is_empty() {
            return Err(Error::validation("model id must not be empty"));
        }
        if !temperature.is_finite() || !(0.0..=2.0).contains(&temperature) {
            return Err(Error::validation("temperature must be between 0.0 and 2.0"));
        }

        let (run_id, payload) = {
            let mut run = self.inner.run();
            if run.input.trim().is_empty() {
                return Err(Error::validation("no input prepared for this run"));
            }
            run.check_can_start(stage)
                .map_err(|reason| Error::InvalidTransition { stage, reason })?;
            let payload = run.stage_input(stage).ok_or_else(|| Error::InvalidTransition {
                stage,
                reason: "previous stage produced no result".into(),
            })?;

            run.stage_mut(stage).begin(model_id, temperature);
            run.status = RunStatus::Running;
            run.ended_at = None;
            if run.started_at.is_none() {
                run.started_at = Some(Utc::now());
            }
            (run.run_id.clone(), payload)
        };

        info!(%run_id, %stage, model = %model_id, temperature, "stage started");
        let request = StageRequest {
            session_id: run_id.clone(),
            payload,
            model: model_id.to_string(),
            temperature,
        };
        let response = self.inner.backend.run_stage(stage, &request);

        let (record, snapshot) = {
            let mut run = self.inner.run();
            if run.run_id != run_id {
                debug!(%run_id, %stage, "run replaced while stage was in flight; discarding response");
                return Err(Error::Cancelled { stage });
            }
            let record = run.stage_mut(stage);
            let elapsed = elapsed_since(record);
            let applied = match &response {
                Ok(result) => record.finish(StageStatus::Completed, Some(result.clone()), None, elapsed),
                Err(err) => record.finish(StageStatus::Error, None, Some(err.to_string()), elapsed),
            };
            if !applied {
                debug!(%run_id, %stage, status = ?record.status, "stage already terminal; discarding late response");
                return Err(Error::Cancelled { stage });
            }
            run.settle(stage);
            let record = run.stage(stage).clone();
            let snapshot = run.status.is_terminal().then(|| run.clone());
            (record, snapshot)
        };

        if let Some(snapshot) = &snapshot {
            self.inner.record_history(snapshot);
            if snapshot.status == RunStatus::Completed {
                self.stop_watching();
            }
        }

        match response {
            Ok(_) => {
                info!(%run_id, %stage, elapsed_ms = record.elapsed_ms, "stage completed");
                Ok(record)
            }
            Err(err) => {
                warn!(%run_id, %stage, error = %err, "stage failed");
                Err(Error::StageFailure {
                    stage,
                    message: err.to_string(),
                })
            }
        }
    }

    /// Cancel the processing stage. Returns false, changing nothing, when no
    /// stage is processing.
    pub fn cancel(&self) -> bool {
        match self.inner.cancel() {
            Some(_) => {
                self.stop_watching();
                true
            }
            None => false,
        }
    }

    /// Back to an empty idle run. Any in-flight response will be discarded.
    pub fn reset(&self) {
        self.stop_watching();
        *self.inner.run() = PipelineRun::default();
        self.inner.progress_degraded.store(false, Ordering::SeqCst);
        debug!("orchestrator reset");
    }

    /// Seed a new run from a history entry. Completed stages are restored
    /// only as a contiguous prefix whose results were retained; everything
    /// after that starts over.
    pub fn resume_from(&self, entry: &HistoryEntry) -> Result<String> {
        let run_id = self.prepare(&entry.input_text)?;
        let mut run = self.inner.run();

        let mut restored = 0;
        for stage in Stage::ALL {
            if !entry.completed_stages.contains(&stage) {
                break;
            }
            match entry.retained_result(stage) {
                Some(kept) => {
                    *run.stage_mut(stage) = StageRecord::restored(kept.result.clone(), kept.elapsed_ms);
                    restored += 1;
                }
                None => break,
            }
        }

        if restored == Stage::ALL.len() {
            run.status = RunStatus::Completed;
            run.ended_at = Some(Utc::now());
        }
        info!(%run_id, from = entry.id, restored, "run resumed from history");
        Ok(run_id)
    }

    /// Merge a progress event into the current run. Returns whether it
    /// changed anything.
    pub fn apply_progress(&self, event: &ProgressEvent) -> bool {
        let run_id = self.inner.run().run_id.clone();
        self.inner.apply_progress(&run_id, event)
    }

    /// Subscribe to live progress for the current run. A channel that gives
    /// up only marks progress as degraded; stage results still arrive through
    /// the stage calls.
    pub fn watch_progress(&self, channel: &ProgressChannel) -> Result<()> {
        let run_id = {
            let run = self.inner.run();
            if run.input.trim().is_empty() {
                return Err(Error::validation("no input prepared for this run"));
            }
            run.run_id.clone()
        };
        self.stop_watching();
        self.inner.progress_degraded.store(false, Ordering::SeqCst);

        let on_event = {
            let inner: Weak<Inner> = Arc::downgrade(&self.inner);
            let run_id = run_id.clone();
            move |event: ProgressEvent| {
                if let Some(inner) = inner.upgrade() {
                    inner.apply_progress(&run_id, &event);
                }
            }
        };
        let on_disconnect = {
            let inner: Weak<Inner> = Arc::downgrade(&self.inner);
            let run_id = run_id.clone();
            move |err: ChannelError| {
                warn!(%run_id, error = %err, "live progress unavailable; continuing without it");
                if let Some(inner) = inner.upgrade() {
                    inner.progress_degraded.store(true, Ordering::SeqCst);
                }
            }
        };

        let subscription = channel.subscribe(&run_id, on_event, on_disconnect)?;
        *self.subscription.lock().expect("subscription slot poisoned") = Some(subscription);
        Ok(())
    }

    pub fn stop_watching(&self) {
        let subscription = self
            .subscription
            .lock()
            .expect("subscription slot poisoned")
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
    }

    /// True once the progress channel gave up for the current run.
    pub fn progress_degraded(&self) -> bool {
        self.inner.progress_degraded.load(Ordering::SeqCst)
    }

    /// Run every stage that has not completed yet, in order, resolving model
    /// and temperature per stage at the point of use. Stops at the first
    /// failure or cancellation.
    pub fn run_remaining(&self, settings: &Settings, registry: &ModelRegistry) -> Result<PipelineRun> {
        while let Some(stage) = self.snapshot().next_stage() {
            let model = settings.model_for(stage, registry).ok_or_else(|| {
                Error::validation(format!("no model available for {stage}"))
            })?;
            let temperature = settings.temperature_for(stage, &model);
            self.start_stage(stage, &model.id, temperature)?;
        }
        Ok(self.snapshot())
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::history::{RetainedResult, DEFAULT_MAX_ENTRIES};
    use crate::keychain;
    use crate::model_catalog::ProviderCatalogEntry;
    use crate::progress::{ProgressSource, ProgressStream, ReconnectPolicy};
    use crate::store;
    use crate::sync::SyncMode;
    use anyhow::Result;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::thread;
    use std::time::{Duration, Instant};

    const POLICY_TEXT: &str = "Users may read the document but not distribute it.";

    /// Answers stage calls from a script; optionally parks each call until the
    /// test releases it.
    #[derive(Default)]
    struct ScriptedBackend {
        responses: Mutex<VecDeque<std::result::Result<Value, ApiError>>>,
        requests: Mutex<Vec<(Stage, StageRequest)>>,
        cancels: Mutex<Vec<String>>,
        gate: Mutex<Option<Receiver<()>>>,
    }

    impl ScriptedBackend {
        fn answering(responses: Vec<std::result::Result<Value, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                ..Self::default()
            })
        }

        fn gated(self: &Arc<Self>) -> Sender<()> {
            let (tx, rx) = mpsc::channel();
            *self.gate.lock().unwrap() = Some(rx);
            tx
        }
    }

    impl PipelineBackend for ScriptedBackend {
        fn run_stage(&self, stage: Stage, request: &StageRequest) -> std::result::Result<Value, ApiError> {
            self.requests.lock().unwrap().push((stage, request.clone()));
            if let Some(gate) = self.gate.lock().unwrap().as_ref() {
                let _ = gate.recv_timeout(Duration::from_secs(5));
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"stage": stage, "ok": true})))
        }

        fn list_providers(&self) -> std::result::Result<Vec<ProviderCatalogEntry>, ApiError> {
            Ok(serde_json::from_str(
                r#"[{"id": "ollama", "name": "Ollama", "models": [
                    {"id": "model-a", "label": "Model A", "providerType": "ollama",
                     "baseUrl": "http://localhost:11434", "modelIdentifier": "llama3.1:8b"}]}]"#,
            )
            .unwrap())
        }

        fn cancel(&self, session_id: &str) -> std::result::Result<(), ApiError> {
            self.cancels.lock().unwrap().push(session_id.to_string());
            Ok(())
        }
    }

    fn history() -> Result<Arc<HistoryStore>> {
        Ok(Arc::new(HistoryStore::open(
            store::open_memory_pool()?,
            None,
            SyncMode::LocalOnly,
            DEFAULT_MAX_ENTRIES,
        )?))
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn reasoner_unlocks_only_after_parser_completes() -> Result<()> {
        let backend = ScriptedBackend::answering(vec![
            Ok(json!({"rules": [{"action": "read"}, {"action": "distribute", "type": "prohibition"}]})),
            Ok(json!({"contradictions": []})),
        ]);
        let orchestrator = Orchestrator::new(backend.clone(), None);
        orchestrator.prepare(POLICY_TEXT)?;

        assert!(matches!(
            orchestrator.start_stage(Stage::Reasoner, "model-a", 0.3),
            Err(Error::InvalidTransition { stage: Stage::Reasoner, .. })
        ));

        let parsed = orchestrator.start_stage(Stage::Parser, "model-a", 0.3)?;
        assert_eq!(parsed.status, StageStatus::Completed);
        assert!(parsed.result.is_some());
        assert!(parsed.elapsed_ms.is_some());
        assert_eq!(orchestrator.snapshot().status, RunStatus::Running);

        // generator before reasoner completes
        assert!(matches!(
            orchestrator.start_stage(Stage::Generator, "model-a", 0.3),
            Err(Error::InvalidTransition { stage: Stage::Generator, .. })
        ));

        orchestrator.start_stage(Stage::Reasoner, "model-a", 0.3)?;
        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[0].1.payload, json!(POLICY_TEXT));
        assert_eq!(requests[1].1.payload, parsed.result.unwrap(), "reasoner gets parser output");
        assert_eq!(requests[1].1.session_id, orchestrator.snapshot().run_id);
        Ok(())
    }

    #[test]
    fn full_run_completes_and_is_recorded_once() -> Result<()> {
        let backend = ScriptedBackend::answering(Vec::new());
        let history = history()?;
        let orchestrator = Orchestrator::new(backend, Some(history.clone()));
        orchestrator.prepare(POLICY_TEXT)?;

        for stage in Stage::ALL {
            orchestrator.start_stage(stage, "model-a", 0.3)?;
        }

        let run = orchestrator.snapshot();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.ended_at.is_some());
        assert!(matches!(
            orchestrator.start_stage(Stage::Validator, "model-a", 0.3),
            Err(Error::InvalidTransition { .. })
        ));

        let entries = history.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, RunStatus::Completed);
        assert_eq!(entries[0].completed_stages, Stage::ALL.to_vec());
        assert_eq!(entries[0].input_text, POLICY_TEXT);
        Ok(())
    }

    #[test]
    fn backend_failure_fails_run_and_retry_reenters_only_that_stage() -> Result<()> {
        let backend = ScriptedBackend::answering(vec![
            Ok(json!({"parsed": true})),
            Err(ApiError::Backend {
                status: 502,
                message: "model offline".into(),
            }),
            Ok(json!({"reasoned": true})),
        ]);
        let history = history()?;
        let orchestrator = Orchestrator::new(backend, Some(history.clone()));
        orchestrator.prepare(POLICY_TEXT)?;
        orchestrator.start_stage(Stage::Parser, "model-a", 0.3)?;

        let err = orchestrator
            .start_stage(Stage::Reasoner, "model-a", 0.3)
            .unwrap_err();
        assert!(matches!(err, Error::StageFailure { stage: Stage::Reasoner, .. }));

        let run = orchestrator.snapshot();
        assert_eq!(run.status, RunStatus::Failed);
        let reasoner = run.stage(Stage::Reasoner);
        assert_eq!(reasoner.status, StageStatus::Error);
        assert!(reasoner.error.as_deref().unwrap().contains("model offline"));
        assert!(reasoner.elapsed_ms.is_some());
        assert_eq!(run.stage(Stage::Parser).result, Some(json!({"parsed": true})));
        assert_eq!(history.list()[0].status, RunStatus::Failed);

        let retried = orchestrator.start_stage(Stage::Reasoner, "model-a", 0.3)?;
        assert_eq!(retried.status, StageStatus::Completed);
        assert_eq!(retried.error, None);
        assert_eq!(orchestrator.snapshot().status, RunStatus::Running);
        Ok(())
    }

    #[test]
    fn transport_failure_is_a_stage_failure() -> Result<()> {
        let backend = ScriptedBackend::answering(vec![Err(ApiError::Transport(
            "connection refused".into(),
        ))]);
        let orchestrator = Orchestrator::new(backend, None);
        orchestrator.prepare(POLICY_TEXT)?;

        match orchestrator.start_stage(Stage::Parser, "model-a", 0.3) {
            Err(Error::StageFailure { stage, message }) => {
                assert_eq!(stage, Stage::Parser);
                assert!(message.contains("connection refused"));
            }
            other => panic!("expected StageFailure, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn cancel_without_processing_stage_changes_nothing() -> Result<()> {
        let orchestrator = Orchestrator::new(ScriptedBackend::answering(Vec::new()), None);
        assert!(!orchestrator.cancel());

        orchestrator.prepare(POLICY_TEXT)?;
        orchestrator.start_stage(Stage::Parser, "model-a", 0.3)?;
        let before = orchestrator.snapshot();
        assert!(!orchestrator.cancel());
        assert!(!orchestrator.cancel());
        assert_eq!(orchestrator.snapshot(), before);
        Ok(())
    }

    #[test]
    fn cancel_wins_over_late_response() -> Result<()> {
        let backend = ScriptedBackend::answering(vec![Ok(json!({"late": true}))]);
        let release = backend.gated();
        let history = history()?;
        let orchestrator = Arc::new(Orchestrator::new(backend.clone(), Some(history.clone())));
        let run_id = orchestrator.prepare(POLICY_TEXT)?;

        let worker = {
            let orchestrator = Arc::clone(&orchestrator);
            thread::spawn(move || orchestrator.start_stage(Stage::Parser, "model-a", 0.3))
        };
        assert!(wait_until(|| orchestrator.snapshot().processing_stage().is_some()));

        assert!(orchestrator.cancel());
        release.send(()).unwrap();
        let outcome = worker.join().unwrap();
        assert!(matches!(outcome, Err(Error::Cancelled { stage: Stage::Parser })));

        let run = orchestrator.snapshot();
        assert_eq!(run.status, RunStatus::Cancelled);
        let parser = run.stage(Stage::Parser);
        assert_eq!(parser.status, StageStatus::Cancelled);
        assert_eq!(parser.result, None);
        assert!(parser.elapsed_ms.is_some());
        assert_eq!(*backend.cancels.lock().unwrap(), vec![run_id]);
        assert_eq!(history.list().len(), 1);
        assert_eq!(history.list()[0].status, RunStatus::Cancelled);
        Ok(())
    }

    #[test]
    fn reset_discards_in_flight_response() -> Result<()> {
        let backend = ScriptedBackend::answering(Vec::new());
        let release = backend.gated();
        let orchestrator = Arc::new(Orchestrator::new(backend, None));
        orchestrator.prepare(POLICY_TEXT)?;

        let worker = {
            let orchestrator = Arc::clone(&orchestrator);
            thread::spawn(move || orchestrator.start_stage(Stage::Parser, "model-a", 0.3))
        };
        assert!(wait_until(|| orchestrator.snapshot().processing_stage().is_some()));
        orchestrator.reset();
        release.send(()).unwrap();

        assert!(worker.join().unwrap().is_err());
        let run = orchestrator.snapshot();
        assert_eq!(run.status, RunStatus::Idle);
        assert_eq!(run.stage(Stage::Parser).status, StageStatus::Idle);
        Ok(())
    }

    #[test]
    fn progress_is_merged_only_while_processing() -> Result<()> {
        let backend = ScriptedBackend::answering(Vec::new());
        let release = backend.gated();
        let orchestrator = Arc::new(Orchestrator::new(backend, None));
        orchestrator.prepare(POLICY_TEXT)?;

        let event = ProgressEvent::Progress {
            stage: Stage::Parser,
            percent: 40.0,
            label: "Tokenizing".into(),
        };
        assert!(!orchestrator.apply_progress(&event), "parser not started yet");

        let worker = {
            let orchestrator = Arc::clone(&orchestrator);
            thread::spawn(move || orchestrator.start_stage(Stage::Parser, "model-a", 0.3))
        };
        assert!(wait_until(|| orchestrator.snapshot().processing_stage().is_some()));
        assert!(orchestrator.apply_progress(&event));
        assert_eq!(
            orchestrator.snapshot().stage(Stage::Parser).progress.as_ref().unwrap().percent,
            40.0
        );

        release.send(()).unwrap();
        worker.join().unwrap()?;
        let trailing = ProgressEvent::Progress {
            stage: Stage::Parser,
            percent: 90.0,
            label: "late".into(),
        };
        assert!(!orchestrator.apply_progress(&trailing));
        assert_eq!(
            orchestrator.snapshot().stage(Stage::Parser).status,
            StageStatus::Completed
        );
        Ok(())
    }

    struct OneShotSource {
        events: Mutex<Option<Vec<ProgressEvent>>>,
        hold: Mutex<Vec<Sender<()>>>,
        sessions: Mutex<Vec<String>>,
    }

    struct OneShotStream {
        events: VecDeque<ProgressEvent>,
        hold: Option<Receiver<()>>,
    }

    impl ProgressStream for OneShotStream {
        fn next_event(&mut self) -> std::result::Result<Option<ProgressEvent>, String> {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            if let Some(hold) = self.hold.take() {
                let _ = hold.recv();
            }
            Ok(None)
        }
    }

    impl ProgressSource for OneShotSource {
        fn connect(&self, session_id: &str) -> std::result::Result<Box<dyn ProgressStream>, String> {
            self.sessions.lock().unwrap().push(session_id.to_string());
            let (tx, rx) = mpsc::channel();
            self.hold.lock().unwrap().push(tx);
            Ok(Box::new(OneShotStream {
                events: self.events.lock().unwrap().take().unwrap_or_default().into(),
                hold: Some(rx),
            }))
        }
    }

    #[test]
    fn backend_cancel_event_cancels_the_processing_stage() -> Result<()> {
        let backend = ScriptedBackend::answering(Vec::new());
        let release = backend.gated();
        let orchestrator = Arc::new(Orchestrator::new(backend, None));
        let run_id = orchestrator.prepare(POLICY_TEXT)?;

        let worker = {
            let orchestrator = Arc::clone(&orchestrator);
            thread::spawn(move || orchestrator.start_stage(Stage::Parser, "model-a", 0.3))
        };
        assert!(wait_until(|| orchestrator.snapshot().processing_stage().is_some()));

        let source = Arc::new(OneShotSource {
            events: Mutex::new(Some(vec![
                ProgressEvent::Keepalive,
                ProgressEvent::Progress {
                    stage: Stage::Parser,
                    percent: 30.0,
                    label: "Parsing".into(),
                },
                ProgressEvent::Cancelled,
            ])),
            hold: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        });
        let channel = ProgressChannel::new(source.clone(), ReconnectPolicy {
            max_attempts: 1,
            delay: Duration::from_millis(10),
            keepalive_timeout: Duration::from_secs(5),
        });
        orchestrator.watch_progress(&channel)?;

        assert!(wait_until(|| orchestrator.snapshot().status == RunStatus::Cancelled));
        release.send(()).unwrap();
        assert!(matches!(worker.join().unwrap(), Err(Error::Cancelled { .. })));

        let run = orchestrator.snapshot();
        let parser = run.stage(Stage::Parser);
        assert_eq!(parser.status, StageStatus::Cancelled);
        assert_eq!(parser.progress.as_ref().unwrap().label, "Parsing");
        assert_eq!(*source.sessions.lock().unwrap(), vec![run_id]);
        assert!(!orchestrator.progress_degraded());
        Ok(())
    }

    #[test]
    fn resume_restores_retained_prefix() -> Result<()> {
        let backend = ScriptedBackend::answering(Vec::new());
        let orchestrator = Orchestrator::new(backend.clone(), None);
        let entry = HistoryEntry {
            id: 7,
            timestamp: Utc::now(),
            input_text: POLICY_TEXT.into(),
            status: RunStatus::Failed,
            model: Some("model-a".into()),
            completed_stages: vec![Stage::Parser, Stage::Reasoner],
            stage_results: vec![
                RetainedResult {
                    stage: Stage::Parser,
                    result: json!({"parsed": 1}),
                    elapsed_ms: 10,
                },
                RetainedResult {
                    stage: Stage::Reasoner,
                    result: json!({"reasoned": 2}),
                    elapsed_ms: 20,
                },
            ],
        };

        orchestrator.resume_from(&entry)?;
        let run = orchestrator.snapshot();
        assert_eq!(run.input, POLICY_TEXT);
        assert_eq!(run.status, RunStatus::Idle);
        assert_eq!(run.next_stage(), Some(Stage::Generator));
        assert_eq!(run.stage(Stage::Reasoner).elapsed_ms, Some(20));

        orchestrator.start_stage(Stage::Generator, "model-a", 0.3)?;
        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[0].0, Stage::Generator);
        assert_eq!(requests[0].1.payload, json!({"reasoned": 2}));
        Ok(())
    }

    #[test]
    fn resume_without_retained_results_starts_over() -> Result<()> {
        let orchestrator = Orchestrator::new(ScriptedBackend::answering(Vec::new()), None);
        let entry = HistoryEntry {
            id: 8,
            timestamp: Utc::now(),
            input_text: "Only the parser finished.".into(),
            status: RunStatus::Cancelled,
            model: None,
            completed_stages: vec![Stage::Parser],
            stage_results: Vec::new(),
        };

        orchestrator.resume_from(&entry)?;
        let run = orchestrator.snapshot();
        assert_eq!(run.next_stage(), Some(Stage::Parser));
        assert!(run.stages.iter().all(|record| record.status == StageStatus::Idle));
        Ok(())
    }

    #[test]
    fn run_remaining_uses_settings_and_registry() -> Result<()> {
        keychain::force_in_memory_keyring();
        let backend = ScriptedBackend::answering(Vec::new());
        let registry = ModelRegistry::open(
            store::open_memory_pool()?,
            backend.clone(),
            None,
            SyncMode::LocalOnly,
        )?;
        registry.list_available()?;
        let history = history()?;
        let orchestrator = Orchestrator::new(backend.clone(), Some(history.clone()));
        orchestrator.prepare(POLICY_TEXT)?;

        let mut settings = Settings::default();
        settings.default_model = Some("removed-model".into());
        let run = orchestrator.run_remaining(&settings, &registry)?;

        assert_eq!(run.status, RunStatus::Completed);
        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests.len(), 4);
        assert!(requests.iter().all(|(_, req)| req.model == "model-a"));
        assert!(requests.iter().all(|(_, req)| (req.temperature - 0.3).abs() < 1e-9));
        assert_eq!(history.list()[0].model.as_deref(), Some("model-a"));
        Ok(())
    }

    #[test]
    fn prepare_validates_input_and_replaces_the_run() -> Result<()> {
        let orchestrator = Orchestrator::new(ScriptedBackend::answering(Vec::new()), None);
        assert!(matches!(orchestrator.prepare("   "), Err(Error::Validation(_))));
        assert!(matches!(
            orchestrator.start_stage(Stage::Parser, "model-a", 0.3),
            Err(Error::Validation(_))
        ));

        let first = orchestrator.prepare("first")?;
        let second = orchestrator.prepare("second")?;
        assert_ne!(first, second);
        assert_eq!(orchestrator.snapshot().input, "second");
        assert!(matches!(
            orchestrator.start_stage(Stage::Parser, "model-a", 5.0),
            Err(Error::Validation(_))
        ));
        Ok(())
    }
}
