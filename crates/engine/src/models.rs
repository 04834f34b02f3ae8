//! Core domain models for the automation engine.
//!
//! These types are the source of truth for what an automation looks like in
//! memory. They can be serialised to/from the JSONB `definition` column of
//! the `automations` table and the run ledger tables.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::condition::Condition;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// How an automation is started. Exactly one per automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Trigger {
    /// `GET {path}`: either a verification handshake or an event carried in
    /// the query string.
    HttpGet {
        path: String,
        /// Token expected in `hub.verify_token` during a subscribe handshake.
        #[serde(default)]
        verify_token: Option<String>,
    },
    /// `POST {path}` event delivery.
    HttpPost {
        path: String,
        /// Answer 200 as soon as the run is admitted instead of after it
        /// completes.
        #[serde(default)]
        respond_immediately: bool,
        #[serde(default)]
        body_shape: Option<BodyShape>,
        /// HMAC-SHA256 secret; when set, deliveries must be signed.
        #[serde(default)]
        secret: Option<String>,
        /// Header carrying the signature, `x-signature` by default.
        #[serde(default)]
        signature_header: Option<String>,
        /// Header carrying a provider delivery id used as idempotency key.
        #[serde(default)]
        delivery_id_header: Option<String>,
    },
    /// Standard 5-field cron expression evaluated in an IANA timezone.
    Cron {
        expression: String,
        #[serde(default = "default_timezone")]
        timezone: String,
    },
    /// One run per record inserted into `table`.
    DatabaseRecordCreated { table: String },
    /// Third-party webhook whose handshake and signature scheme come from
    /// the named provider strategy.
    Webhook {
        provider: String,
        path: String,
        #[serde(default)]
        params: ProviderParams,
        #[serde(default)]
        respond_immediately: bool,
    },
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Trigger {
    /// Short type tag, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::HttpGet { .. } => "http-get",
            Trigger::HttpPost { .. } => "http-post",
            Trigger::Cron { .. } => "cron",
            Trigger::DatabaseRecordCreated { .. } => "database-record-created",
            Trigger::Webhook { .. } => "webhook",
        }
    }

    pub fn respond_immediately(&self) -> bool {
        match self {
            Trigger::HttpPost { respond_immediately, .. }
            | Trigger::Webhook { respond_immediately, .. } => *respond_immediately,
            _ => false,
        }
    }
}

/// How a POST body is decoded into the event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BodyShape {
    #[default]
    Json,
    Form,
    Text,
}

/// Provider-specific webhook parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderParams {
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
    /// Signing secret for deliveries and computed challenges.
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default)]
    pub verify_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// One step of an automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionNode {
    /// Output name; later actions read the output as `steps.<name>`.
    #[serde(default)]
    pub name: Option<String>,
    /// A failure is recorded but does not halt the path.
    #[serde(default)]
    pub tolerant: bool,
    /// Overrides the engine-wide per-action timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(flatten)]
    pub kind: ActionKind,
}

impl ActionNode {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            name: None,
            tolerant: false,
            timeout_ms: None,
            kind,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn tolerant(mut self) -> Self {
        self.tolerant = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ActionKind {
    HttpRequest {
        #[serde(default = "default_method")]
        method: String,
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        query: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<Value>,
    },
    CreateRecord {
        table: String,
        fields: Value,
    },
    UpdateRecord {
        table: String,
        record_id: String,
        fields: Value,
    },
    DeleteRecord {
        table: String,
        record_id: String,
    },
    /// The only branching construct; paths may nest further splits.
    SplitIntoPaths { paths: Vec<BranchPath> },
    /// A named third-party action such as `calendly.get-event-type`.
    Connector {
        connector: String,
        #[serde(default)]
        connection_id: Option<String>,
        #[serde(default)]
        params: Value,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

impl ActionKind {
    /// Type tag recorded on each step.
    pub fn type_name(&self) -> String {
        match self {
            ActionKind::HttpRequest { .. } => "http-request".into(),
            ActionKind::CreateRecord { .. } => "create-record".into(),
            ActionKind::UpdateRecord { .. } => "update-record".into(),
            ActionKind::DeleteRecord { .. } => "delete-record".into(),
            ActionKind::SplitIntoPaths { .. } => "split-into-paths".into(),
            ActionKind::Connector { connector, .. } => connector.clone(),
        }
    }
}

/// A named sub-path of a `split-into-paths` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchPath {
    pub name: String,
    pub condition: Condition,
    pub actions: Vec<ActionNode>,
}

// ---------------------------------------------------------------------------
// Automation
// ---------------------------------------------------------------------------

/// A complete automation definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger: Trigger,
    pub actions: Vec<ActionNode>,
}

impl Automation {
    /// Convenience constructor for testing.
    pub fn new(id: impl Into<String>, trigger: Trigger, actions: Vec<ActionNode>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            trigger,
            actions,
        }
    }
}

// ---------------------------------------------------------------------------
// TriggerEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerSource {
    Http,
    Cron,
    Db,
    Webhook,
}

/// What the registry is searched by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EventTarget {
    Http { method: String, path: String },
    /// Cron events are produced per automation by the scheduler.
    Cron {
        automation_id: String,
        scheduled_for: DateTime<Utc>,
    },
    Record { table: String, record_id: String },
}

/// Transport metadata needed for trigger-specific validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Transport {
    /// Lower-cased header names.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// Raw request body, kept in memory for signature checks only.
    #[serde(skip)]
    pub raw_body: Vec<u8>,
}

impl Transport {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Headers never persisted to the ledger.
const REDACTED_HEADERS: &[&str] = &["authorization", "cookie", "proxy-authorization"];

/// Canonical normalised input to the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub id: Uuid,
    pub source: TriggerSource,
    pub target: EventTarget,
    pub received_at: DateTime<Utc>,
    pub payload: Value,
    #[serde(default)]
    pub transport: Transport,
    /// Provider-supplied delivery id, set once the matcher knows the trigger.
    #[serde(default)]
    pub delivery_id: Option<String>,
}

impl TriggerEvent {
    pub fn http(
        method: impl Into<String>,
        path: impl Into<String>,
        payload: Value,
        transport: Transport,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: TriggerSource::Http,
            target: EventTarget::Http {
                method: method.into().to_uppercase(),
                path: path.into(),
            },
            received_at: Utc::now(),
            payload,
            transport,
            delivery_id: None,
        }
    }

    pub fn cron(automation_id: impl Into<String>, scheduled_for: DateTime<Utc>) -> Self {
        let automation_id = automation_id.into();
        Self {
            id: Uuid::new_v4(),
            source: TriggerSource::Cron,
            payload: serde_json::json!({ "scheduled_for": scheduled_for }),
            target: EventTarget::Cron {
                automation_id,
                scheduled_for,
            },
            received_at: Utc::now(),
            transport: Transport::default(),
            delivery_id: None,
        }
    }

    pub fn record(record: &nodes::Record) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: TriggerSource::Db,
            target: EventTarget::Record {
                table: record.table.clone(),
                record_id: record.id.clone(),
            },
            received_at: Utc::now(),
            payload: serde_json::to_value(record).unwrap_or(Value::Null),
            transport: Transport::default(),
            delivery_id: None,
        }
    }

    /// Copy safe to persist: credentials-bearing headers are masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for name in REDACTED_HEADERS {
            if let Some(value) = copy.transport.headers.get_mut(*name) {
                *value = "<redacted>".to_string();
            }
        }
        copy
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle of an execution run. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    PartiallyFailed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::PartiallyFailed)
    }

    /// Statuses a run may be in before moving to `self`.
    pub fn predecessors(self) -> &'static [RunStatus] {
        match self {
            Self::Pending => &[],
            Self::Running => &[Self::Pending],
            // A run can fail before it starts (cancelled while queued).
            Self::Failed => &[Self::Pending, Self::Running],
            Self::Succeeded | Self::PartiallyFailed => &[Self::Running],
        }
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        next.predecessors().contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::PartiallyFailed => "partially-failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "partially-failed" => Ok(Self::PartiallyFailed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Outcome of one logical step (or of a whole path).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Only split steps: some matched paths failed, some succeeded.
    PartiallyFailed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::PartiallyFailed => "partially-failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "partially-failed" => Ok(Self::PartiallyFailed),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

impl From<StepStatus> for RunStatus {
    fn from(status: StepStatus) -> Self {
        match status {
            StepStatus::Succeeded => RunStatus::Succeeded,
            StepStatus::Failed => RunStatus::Failed,
            StepStatus::PartiallyFailed => RunStatus::PartiallyFailed,
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger entries
// ---------------------------------------------------------------------------

/// Path-qualified position in the action tree: `0`, `2.A.0`, `2.A.1.B.3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ActionPath(String);

impl ActionPath {
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Position `index` within the sequence this path points at.
    pub fn index(&self, index: usize) -> Self {
        self.push(&index.to_string())
    }

    /// Sub-path `name` of the split action this path points at.
    pub fn branch(&self, name: &str) -> Self {
        self.push(name)
    }

    fn push(&self, segment: &str) -> Self {
        if self.0.is_empty() {
            Self(segment.to_string())
        } else {
            Self(format!("{}.{}", self.0, segment))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `self` lies inside the subtree rooted at `ancestor`.
    pub fn starts_with(&self, ancestor: &ActionPath) -> bool {
        ancestor.0.is_empty()
            || self.0 == ancestor.0
            || self
                .0
                .strip_prefix(&ancestor.0)
                .is_some_and(|rest| rest.starts_with('.'))
    }
}

impl fmt::Display for ActionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionPath {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Final outcome of one logical action. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStepResult {
    /// Append position within the run, assigned by the ledger.
    pub sequence: u64,
    pub action_path: ActionPath,
    pub action_type: String,
    pub status: StepStatus,
    /// Parameters after variable substitution.
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// One invocation of one automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub run_id: Uuid,
    pub automation_id: String,
    pub trigger_event: TriggerEvent,
    pub idempotency_key: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<ActionStepResult>,
}

impl ExecutionRun {
    pub fn pending(automation_id: &str, event: &TriggerEvent, idempotency_key: String) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            automation_id: automation_id.to_string(),
            trigger_event: event.redacted(),
            idempotency_key,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            steps: Vec::new(),
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            automation_id: self.automation_id.clone(),
            status: self.status,
        }
    }
}

/// What trigger callers may see about a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub automation_id: String,
    pub status: RunStatus,
}

/// Deduplication entry for a trigger delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub run_id: Uuid,
    pub automation_id: String,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}
