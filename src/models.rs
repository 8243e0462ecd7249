use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Maximum number of run records kept in history.
pub const HISTORY_CAP: usize = 20;

/// One (identifier, quantity) transfer request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(alias = "reference")]
    pub identifier: String,
    pub quantity: u32,
}

impl Operation {
    pub fn new(identifier: impl Into<String>, quantity: u32) -> Self {
        Self {
            identifier: identifier.into(),
            quantity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OperationOutcome {
    Success { operation: Operation },
    Failure { operation: Operation, reason: String },
}

impl OperationOutcome {
    pub fn operation(&self) -> &Operation {
        match self {
            Self::Success { operation } | Self::Failure { operation, .. } => operation,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { reason, .. } => Some(reason),
        }
    }
}

/// Immutable summary of one finished (or cancelled) batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub recipient_id: String,
    pub total: usize,
    /// Operations actually dispatched to the remote API.
    pub operations_attempted: usize,
    pub successes: Vec<OperationOutcome>,
    pub failures: Vec<OperationOutcome>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn summary(&self) -> String {
        format!(
            "Completed: {} success, {} failed",
            self.successes.len(),
            self.failures.len()
        )
    }
}

/// Run records, most recent first, never longer than [`HISTORY_CAP`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct History(Vec<RunRecord>);

impl<'de> Deserialize<'de> for History {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut records = Vec::<RunRecord>::deserialize(deserializer)?;
        records.truncate(HISTORY_CAP);
        Ok(Self(records))
    }
}

impl History {
    pub fn push(&mut self, record: RunRecord) {
        self.0.insert(0, record);
        self.0.truncate(HISTORY_CAP);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn records(&self) -> &[RunRecord] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildPhase {
    Info,
    Success,
    Error,
}

/// Notification published to the event sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobEvent {
    Status {
        message: String,
        severity: Severity,
    },
    Progress {
        current: usize,
        total: usize,
    },
    JobComplete {
        success: bool,
        summary: String,
        #[serde(rename = "runRecord")]
        run_record: Option<RunRecord>,
    },
    BuildStatus {
        phase: BuildPhase,
        message: String,
    },
}

impl JobEvent {
    pub fn status(message: impl Into<String>, severity: Severity) -> Self {
        Self::Status {
            message: message.into(),
            severity,
        }
    }

    pub fn build(phase: BuildPhase, message: impl Into<String>) -> Self {
        Self::BuildStatus {
            phase,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

static OPERATION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\s+(.+)$").expect("operation line pattern"));

/// Parses the `"<quantity> <identifier>"` list format.
///
/// Blank and malformed lines are dropped without error, as are zero or
/// out-of-range quantities.
pub fn parse_operation_list(text: &str) -> Vec<Operation> {
    text.lines()
        .filter_map(|line| {
            let captures = OPERATION_LINE.captures(line.trim())?;
            let quantity = captures[1].parse::<u32>().ok().filter(|q| *q > 0)?;
            let identifier = captures[2].trim();
            Some(Operation::new(identifier, quantity))
        })
        .collect()
}
