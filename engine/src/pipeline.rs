// engine/src/pipeline.rs
//!
//! Pipeline data model: the four ordered stages, per-stage records and the
//! aggregate run. All status changes go through the guarded transition
//! helpers here so that a stage can only leave `processing` once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Parser,
    Reasoner,
    Generator,
    Validator,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Parser,
        Stage::Reasoner,
        Stage::Generator,
        Stage::Validator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parser => "parser",
            Stage::Reasoner => "reasoner",
            Stage::Generator => "generator",
            Stage::Validator => "validator",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Stage::Parser => 0,
            Stage::Reasoner => 1,
            Stage::Generator => 2,
            Stage::Validator => 3,
        }
    }

    pub fn previous(&self) -> Option<Stage> {
        match self {
            Stage::Parser => None,
            Stage::Reasoner => Some(Stage::Parser),
            Stage::Generator => Some(Stage::Reasoner),
            Stage::Validator => Some(Stage::Generator),
        }
    }
}

/// Stage names are case-insensitive and accept the endpoint verb too.
impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "parser" | "parse" => Ok(Stage::Parser),
            "reasoner" | "reason" => Ok(Stage::Reasoner),
            "generator" | "generate" => Ok(Stage::Generator),
            "validator" | "validate" => Ok(Stage::Validator),
            _ => Err(format!("unknown stage '{s}'")),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Idle,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Error | StageStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Latest live progress reported for a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub percent: f64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub status: StageStatus,
    pub result: Option<Value>,
    /// Only set once `status` is terminal.
    pub elapsed_ms: Option<u64>,
    /// Only set when `status == Error`.
    pub error: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub progress: Option<StageProgress>,
}

impl Default for StageRecord {
    fn default() -> Self {
        Self {
            status: StageStatus::Idle,
            result: None,
            elapsed_ms: None,
            error: None,
            model: None,
            temperature: None,
            started_at: None,
            progress: None,
        }
    }
}

impl StageRecord {
    /// Seed a record that completed in an earlier run.
    pub fn restored(result: Value, elapsed_ms: u64) -> Self {
        Self {
            status: StageStatus::Completed,
            result: Some(result),
            elapsed_ms: Some(elapsed_ms),
            ..Self::default()
        }
    }

    pub(crate) fn begin(&mut self, model: &str, temperature: f64) {
        *self = StageRecord {
            status: StageStatus::Processing,
            model: Some(model.to_string()),
            temperature: Some(temperature),
            started_at: Some(Utc::now()),
            ..StageRecord::default()
        };
    }

    /// Move a processing stage to a terminal status. Returns false (and leaves
    /// the record untouched) when the stage is no longer processing.
    pub(crate) fn finish(
        &mut self,
        status: StageStatus,
        result: Option<Value>,
        error: Option<String>,
        elapsed_ms: u64,
    ) -> bool {
        if self.status != StageStatus::Processing || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.result = result;
        self.error = error;
        self.elapsed_ms = Some(elapsed_ms);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub run_id: String,
    pub input: String,
    pub stages: [StageRecord; 4],
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl PipelineRun {
    pub fn new(input: String) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            input,
            stages: Default::default(),
            status: RunStatus::Idle,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn stage(&self, stage: Stage) -> &StageRecord {
        &self.stages[stage.index()]
    }

    pub(crate) fn stage_mut(&mut self, stage: Stage) -> &mut StageRecord {
        &mut self.stages[stage.index()]
    }

    /// The stage currently processing, if any. At most one exists.
    pub fn processing_stage(&self) -> Option<Stage> {
        Stage::ALL
            .into_iter()
            .find(|stage| self.stage(*stage).status == StageStatus::Processing)
    }

    /// The first stage that has not completed, i.e. the only stage allowed to
    /// start next. `None` once every stage completed.
    pub fn next_stage(&self) -> Option<Stage> {
        Stage::ALL
            .into_iter()
            .find(|stage| self.stage(*stage).status != StageStatus::Completed)
    }

    pub fn completed_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| self.stage(*stage).status == StageStatus::Completed)
            .collect()
    }

    /// Check whether `stage` may enter `processing` now.
    pub fn check_can_start(&self, stage: Stage) -> Result<(), String> {
        if let Some(active) = self.processing_stage() {
            return Err(format!("{active} is still processing"));
        }
        if self.status == RunStatus::Completed {
            return Err("run already completed".to_string());
        }
        if let Some(previous) = stage.previous() {
            let status = self.stage(previous).status;
            if status != StageStatus::Completed {
                return Err(format!(
                    "{previous} must be completed first (currently {status:?})"
                ));
            }
        }
        if self.stage(stage).status == StageStatus::Completed {
            return Err(format!("{stage} already completed"));
        }
        Ok(())
    }

    /// Payload handed to the backend operation for `stage`.
    pub fn stage_input(&self, stage: Stage) -> Option<Value> {
        match stage.previous() {
            None => Some(Value::String(self.input.clone())),
            Some(previous) => self.stage(previous).result.clone(),
        }
    }

    /// Recompute the run status after a stage reached a terminal status.
    pub(crate) fn settle(&mut self, stage: Stage) {
        let status = match self.stage(stage).status {
            StageStatus::Error => RunStatus::Failed,
            StageStatus::Cancelled => RunStatus::Cancelled,
            StageStatus::Completed if stage == Stage::Validator => RunStatus::Completed,
            StageStatus::Completed => RunStatus::Running,
            StageStatus::Idle | StageStatus::Processing => return,
        };
        self.status = status;
        if status.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
    }

    /// Model recorded on the most advanced stage that was attempted.
    pub fn last_model(&self) -> Option<&str> {
        Stage::ALL
            .iter()
            .rev()
            .find_map(|stage| self.stage(*stage).model.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn complete(run: &mut PipelineRun, stage: Stage) {
        run.stage_mut(stage).begin("model-a", 0.3);
        assert!(run
            .stage_mut(stage)
            .finish(StageStatus::Completed, Some(json!({"stage": stage})), None, 5));
        run.settle(stage);
    }

    #[test]
    fn only_parser_can_start_on_a_fresh_run() {
        let run = PipelineRun::new("text".into());
        assert_eq!(run.next_stage(), Some(Stage::Parser));
        assert!(run.check_can_start(Stage::Parser).is_ok());
        assert!(run.check_can_start(Stage::Reasoner).is_err());
        assert!(run.check_can_start(Stage::Validator).is_err());
    }

    #[test]
    fn stages_unlock_in_order() {
        let mut run = PipelineRun::new("text".into());
        complete(&mut run, Stage::Parser);
        assert!(run.check_can_start(Stage::Reasoner).is_ok());
        assert!(run.check_can_start(Stage::Generator).is_err());
        assert!(run.check_can_start(Stage::Parser).is_err());
        assert_eq!(run.status, RunStatus::Running);

        complete(&mut run, Stage::Reasoner);
        complete(&mut run, Stage::Generator);
        complete(&mut run, Stage::Validator);
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.ended_at.is_some());
        assert_eq!(run.next_stage(), None);
        assert_eq!(run.completed_stages(), Stage::ALL.to_vec());
    }

    #[test]
    fn finish_is_first_terminal_write_wins() {
        let mut record = StageRecord::default();
        record.begin("m", 0.1);
        assert!(record.finish(StageStatus::Cancelled, None, None, 3));
        assert!(!record.finish(StageStatus::Completed, Some(json!(1)), None, 9));
        assert_eq!(record.status, StageStatus::Cancelled);
        assert_eq!(record.result, None);
        assert_eq!(record.elapsed_ms, Some(3));
    }

    #[test]
    fn elapsed_is_unset_until_terminal() {
        let mut record = StageRecord::default();
        record.begin("m", 0.1);
        assert_eq!(record.elapsed_ms, None);
        assert!(!record.finish(StageStatus::Processing, None, None, 1));
        assert_eq!(record.elapsed_ms, None);
    }

    #[test]
    fn busy_stage_blocks_every_start() {
        let mut run = PipelineRun::new("text".into());
        run.stage_mut(Stage::Parser).begin("m", 0.3);
        assert!(run.check_can_start(Stage::Parser).is_err());
        assert_eq!(run.processing_stage(), Some(Stage::Parser));
    }

    #[test]
    fn stage_names_parse_case_insensitively() {
        assert_eq!("Parser".parse::<Stage>(), Ok(Stage::Parser));
        assert_eq!("VALIDATE".parse::<Stage>(), Ok(Stage::Validator));
        assert!("render".parse::<Stage>().is_err());
    }
}
