use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::{
    case::CaseSet,
    evaluator::{EvaluationResult, Evaluator, FaultAttributor},
    orchestrator::Orchestrator,
    trajectory::{TerminalStatus, Turn},
};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("record writer stopped unexpectedly")]
    WriterGone,
}

/// One line of the output JSONL: the full trajectory plus its evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub case_id: String,
    pub turns: Vec<Turn>,
    pub status: Option<TerminalStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationResult>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub attempted: usize,
    pub skipped: usize,
    pub completed: usize,
    pub max_turns_exceeded: usize,
    pub agent_errors: usize,
    pub user_errors: usize,
    pub tool_errors: usize,
    pub mean_score: Option<f64>,
}

impl BatchSummary {
    fn absorb(&mut self, record: &RunRecord, score_sum: &mut f64, scored: &mut usize) {
        self.attempted += 1;
        match record.status {
            Some(TerminalStatus::Completed) => self.completed += 1,
            Some(TerminalStatus::MaxTurnsExceeded) => self.max_turns_exceeded += 1,
            Some(TerminalStatus::AgentError) => self.agent_errors += 1,
            Some(TerminalStatus::UserError) => self.user_errors += 1,
            Some(TerminalStatus::ToolError) | None => self.tool_errors += 1,
        }
        if let Some(evaluation) = &record.evaluation {
            *score_sum += evaluation.total;
            *scored += 1;
        }
    }

    pub fn failures(&self) -> usize {
        self.max_turns_exceeded + self.agent_errors + self.user_errors + self.tool_errors
    }
}

/// Fan-out over a case set with a bounded number of trajectories in flight.
///
/// Faults stay per-case: a failing trajectory becomes a record with its
/// terminal status, never an aborted batch. Records stream to an append-only
/// JSONL file flushed record by record, so an interrupted run keeps
/// everything except the trajectories still in flight, and `resume` skips
/// the case ids already on disk.
pub struct BatchRunner {
    orchestrator: Arc<Orchestrator>,
    evaluator: Arc<Evaluator>,
    attributor: Option<Arc<FaultAttributor>>,
    attribution_threshold: f64,
}

impl BatchRunner {
    pub fn new(orchestrator: Arc<Orchestrator>, evaluator: Arc<Evaluator>) -> Self {
        Self {
            orchestrator,
            evaluator,
            attributor: None,
            attribution_threshold: 1.0,
        }
    }

    /// Attributes fault on every non-completed trajectory and on completed
    /// ones scoring below the threshold. Advisory: the record is written the
    /// same way when attribution fails.
    pub fn with_fault_attributor(mut self, attributor: Arc<FaultAttributor>) -> Self {
        self.attributor = Some(attributor);
        self
    }

    pub fn with_attribution_threshold(mut self, threshold: f64) -> Self {
        self.attribution_threshold = threshold;
        self
    }

    pub async fn run(
        &self,
        case_set: Arc<CaseSet>,
        out_path: &Path,
        resume: bool,
    ) -> Result<BatchSummary, BatchError> {
        let already_recorded = if resume {
            recorded_case_ids(out_path).await?
        } else {
            HashSet::new()
        };

        let pending: Vec<_> = case_set
            .cases
            .iter()
            .filter(|case| !already_recorded.contains(&case.id))
            .cloned()
            .collect();
        let skipped = case_set.cases.len() - pending.len();
        if skipped > 0 {
            tracing::info!(skipped, "resuming, skipping already-recorded cases");
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(out_path)
            .await
            .map_err(|source| BatchError::Io {
                path: out_path.to_path_buf(),
                source,
            })?;

        let concurrency = self.orchestrator.config().concurrency.max(1);
        let (tx, rx) = mpsc::channel::<RunRecord>(concurrency);
        let writer = tokio::spawn(write_records(file, out_path.to_path_buf(), rx));

        let mut runs = stream::iter(pending.into_iter().map(|case| {
            let orchestrator = Arc::clone(&self.orchestrator);
            let evaluator = Arc::clone(&self.evaluator);
            let attributor = self.attributor.clone();
            let threshold = self.attribution_threshold;
            let case_set = Arc::clone(&case_set);
            async move {
                let case_id = case.id.clone();
                let run = tokio::spawn(async move {
                    let trajectory = orchestrator.run(&case, &case_set.registry).await;
                    let mut evaluation = evaluator.score(&trajectory, &case);
                    let needs_attribution = trajectory.status
                        != Some(TerminalStatus::Completed)
                        || evaluation.total < threshold;
                    if needs_attribution {
                        if let Some(attributor) = &attributor {
                            evaluation.fault = attributor.attribute(&trajectory, &case).await;
                        }
                    }
                    RunRecord {
                        case_id: trajectory.case_id,
                        turns: trajectory.turns,
                        status: trajectory.status,
                        evaluation: Some(evaluation),
                    }
                });

                match run.await {
                    Ok(record) => record,
                    Err(error) => {
                        tracing::error!(case = %case_id, %error, "trajectory task aborted");
                        RunRecord {
                            case_id,
                            turns: Vec::new(),
                            status: Some(TerminalStatus::ToolError),
                            evaluation: None,
                        }
                    }
                }
            }
        }))
        .buffer_unordered(concurrency);

        while let Some(record) = runs.next().await {
            tracing::info!(
                case = %record.case_id,
                status = ?record.status,
                score = record.evaluation.as_ref().map(|e| e.total),
                "case finished"
            );
            if tx.send(record).await.is_err() {
                return Err(BatchError::WriterGone);
            }
        }
        drop(tx);

        let mut summary = writer.await.map_err(|_| BatchError::WriterGone)??;
        summary.skipped = skipped;
        Ok(summary)
    }
}

async fn write_records(
    mut file: tokio::fs::File,
    path: PathBuf,
    mut rx: mpsc::Receiver<RunRecord>,
) -> Result<BatchSummary, BatchError> {
    let mut summary = BatchSummary::default();
    let mut score_sum = 0.0;
    let mut scored = 0usize;

    while let Some(record) = rx.recv().await {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        file.write_all(&line)
            .await
            .map_err(|source| BatchError::Io {
                path: path.clone(),
                source,
            })?;
        // One record per flush: a crash loses only in-flight trajectories.
        file.flush().await.map_err(|source| BatchError::Io {
            path: path.clone(),
            source,
        })?;
        summary.absorb(&record, &mut score_sum, &mut scored);
    }

    if scored > 0 {
        summary.mean_score = Some(score_sum / scored as f64);
    }
    Ok(summary)
}

#[derive(Deserialize)]
struct RecordedId {
    case_id: String,
}

/// Case ids already present in the output file. Unparseable lines are
/// skipped with a warning so a truncated final line does not block a resume.
pub async fn recorded_case_ids(path: &Path) -> Result<HashSet<String>, BatchError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let mut ids = HashSet::new();
            for (number, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RecordedId>(line) {
                    Ok(record) => {
                        ids.insert(record.case_id);
                    }
                    Err(error) => {
                        tracing::warn!(line = number + 1, %error, "skipping unparseable record");
                    }
                }
            }
            Ok(ids)
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(source) => Err(BatchError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Parses a full results file back into records, for the status summary.
pub fn read_records(contents: &str) -> Result<Vec<RunRecord>, serde_json::Error> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}
