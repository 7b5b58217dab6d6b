use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "ImageBuild")]
    Build,
    #[serde(rename = "ImageExport")]
    Export,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::Build, JobKind::Export];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Build => "ImageBuild",
            JobKind::Export => "ImageExport",
        }
    }

    /// State a job enters when it is admitted.
    pub fn first_active_state(&self) -> JobState {
        match self {
            JobKind::Build => JobState::Building,
            JobKind::Export => JobState::Processing,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for the job. System jobs may use the reserved admission slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOrigin {
    #[default]
    User,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Building,
    Pushing,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub const ACTIVE: [JobState; 3] = [JobState::Building, JobState::Pushing, JobState::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "Pending",
            JobState::Building => "Building",
            JobState::Pushing => "Pushing",
            JobState::Processing => "Processing",
            JobState::Completed => "Completed",
            JobState::Failed => "Failed",
            JobState::Canceled => "Canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Canceled)
    }

    /// Holds an admission slot.
    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Pending" => JobState::Pending,
            "Building" => JobState::Building,
            "Pushing" => JobState::Pushing,
            "Processing" => JobState::Processing,
            "Completed" => JobState::Completed,
            "Failed" => JobState::Failed,
            "Canceled" => JobState::Canceled,
            other => return Err(format!("unknown job state {other:?}")),
        })
    }
}

// ---- Spec ----

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageTarget {
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub image_name: String,
    #[serde(default)]
    pub image_tag: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingType {
    Early,
    #[default]
    Late,
}

impl BindingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingType::Early => "early",
            BindingType::Late => "late",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfiguration {
    #[serde(default)]
    pub username: String,
    #[serde(default, alias = "publickey")]
    pub ssh_public_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    #[serde(default)]
    pub source: ImageTarget,
    #[serde(default)]
    pub destination: ImageTarget,
    #[serde(default)]
    pub binding_type: BindingType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_config: Option<UserConfiguration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Qcow2,
    Vmdk,
    Iso,
    Raw,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Qcow2 => "qcow2",
            ExportFormat::Vmdk => "vmdk",
            ExportFormat::Iso => "iso",
            ExportFormat::Raw => "raw",
        }
    }

    /// Converter output path, relative to its output directory.
    pub fn output_path(&self) -> String {
        match self {
            ExportFormat::Iso => "bootiso/install.iso".to_string(),
            other => format!("{0}/disk.{0}", other.as_str()),
        }
    }

    /// Name of the converter's image type argument.
    pub fn converter_type(&self) -> &'static str {
        match self {
            ExportFormat::Iso => "anaconda-iso",
            other => other.as_str(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSpec {
    #[serde(default)]
    pub source_build_name: String,
    #[serde(default)]
    pub format: Option<ExportFormat>,
}

/// Immutable description of the work, one variant per job kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum JobSpec {
    #[serde(rename = "ImageBuild")]
    Build(BuildSpec),
    #[serde(rename = "ImageExport")]
    Export(ExportSpec),
}

impl JobSpec {
    pub fn kind(&self) -> JobKind {
        match self {
            JobSpec::Build(_) => JobKind::Build,
            JobSpec::Export(_) => JobKind::Export,
        }
    }
}

// ---- Status ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactInfo {
    pub file_name: String,
    pub size: u64,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub state: JobState,
    pub condition: Condition,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub uid: Uuid,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub origin: JobOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
    pub status: JobStatus,
}

/// Something that happened to a job. Applying an event that does not fit the
/// current state is refused and leaves the record untouched.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Admitted,
    Pushing,
    Heartbeat,
    CancelRequested { message: String },
    BuildCompleted { image_reference: String, manifest_digest: String },
    ExportCompleted { artifact: ArtifactInfo },
    Failed { message: String },
    /// `None` keeps the message recorded by the cancel request, if any.
    Canceled { message: Option<String> },
}

pub const MSG_PENDING: &str = "Waiting for an admission slot";
pub const MSG_CANCELED: &str = "Canceled by user";
pub const MSG_CANCEL_REQUESTED: &str = "Cancellation requested";

impl JobRecord {
    pub fn new(
        name: String,
        labels: BTreeMap<String, String>,
        origin: JobOrigin,
        spec: JobSpec,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            metadata: ObjectMeta {
                name,
                uid: Uuid::new_v4(),
                labels,
                creation_timestamp: now,
                origin,
            },
            spec,
            status: JobStatus {
                state: JobState::Pending,
                condition: Condition {
                    reason: JobState::Pending.as_str().to_string(),
                    message: MSG_PENDING.to_string(),
                    last_transition_time: now,
                },
                cancel_requested: false,
                last_seen: None,
                image_reference: None,
                manifest_digest: None,
                artifact: None,
            },
        }
    }

    pub fn kind(&self) -> JobKind {
        self.spec.kind()
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn state(&self) -> JobState {
        self.status.state
    }

    fn set_state(&mut self, next: JobState, message: String, now: DateTime<Utc>) {
        self.status.state = next;
        self.status.condition = Condition {
            reason: next.as_str().to_string(),
            message,
            last_transition_time: now,
        };
    }

    /// Returns whether the record changed. Terminal records never change.
    pub fn apply(&mut self, ev: &JobEvent, now: DateTime<Utc>) -> bool {
        let current = self.status.state;
        if current.is_terminal() {
            return false;
        }

        match ev {
            JobEvent::Admitted => {
                if current != JobState::Pending {
                    return false;
                }
                let next = self.kind().first_active_state();
                let message = match &self.spec {
                    JobSpec::Build(_) => "Pulling source image".to_string(),
                    JobSpec::Export(spec) => match spec.format {
                        Some(f) => format!("Converting image to {}", f.as_str()),
                        None => "Converting image".to_string(),
                    },
                };
                self.set_state(next, message, now);
                self.status.last_seen = Some(now);
            }

            JobEvent::Pushing => {
                if current != JobState::Building {
                    return false;
                }
                self.set_state(JobState::Pushing, "Pushing image to destination".to_string(), now);
            }

            JobEvent::Heartbeat => {
                if !current.is_active() {
                    return false;
                }
                self.status.last_seen = Some(now);
            }

            JobEvent::CancelRequested { message } => {
                if !current.is_active() || self.status.cancel_requested {
                    return false;
                }
                self.status.cancel_requested = true;
                self.status.condition.message = message.clone();
            }

            JobEvent::BuildCompleted { image_reference, manifest_digest } => {
                if current != JobState::Pushing {
                    return false;
                }
                self.status.image_reference = Some(image_reference.clone());
                self.status.manifest_digest = Some(manifest_digest.clone());
                self.set_state(JobState::Completed, format!("Image pushed to {image_reference}"), now);
            }

            JobEvent::ExportCompleted { artifact } => {
                if current != JobState::Processing {
                    return false;
                }
                self.status.artifact = Some(artifact.clone());
                self.set_state(
                    JobState::Completed,
                    format!("Artifact {} is ready ({} bytes)", artifact.file_name, artifact.size),
                    now,
                );
            }

            JobEvent::Failed { message } => {
                self.set_state(JobState::Failed, message.clone(), now);
            }

            JobEvent::Canceled { message } => {
                let message = match message {
                    Some(m) => m.clone(),
                    None if self.status.cancel_requested => self.status.condition.message.clone(),
                    None => MSG_CANCELED.to_string(),
                };
                self.set_state(JobState::Canceled, message, now);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_record() -> JobRecord {
        JobRecord::new(
            "b1".into(),
            BTreeMap::new(),
            JobOrigin::User,
            JobSpec::Build(BuildSpec::default()),
            Utc::now(),
        )
    }

    fn export_record() -> JobRecord {
        JobRecord::new(
            "e1".into(),
            BTreeMap::new(),
            JobOrigin::User,
            JobSpec::Export(ExportSpec {
                source_build_name: "b1".into(),
                format: Some(ExportFormat::Qcow2),
            }),
            Utc::now(),
        )
    }

    #[test]
    fn build_happy_path() {
        let mut r = build_record();
        let now = Utc::now();
        assert!(r.apply(&JobEvent::Admitted, now));
        assert_eq!(r.state(), JobState::Building);
        assert!(r.status.last_seen.is_some());
        assert!(r.apply(&JobEvent::Pushing, now));
        assert!(r.apply(
            &JobEvent::BuildCompleted {
                image_reference: "quay.io/org/os:v1".into(),
                manifest_digest: "sha256:00".into(),
            },
            now
        ));
        assert_eq!(r.state(), JobState::Completed);
        assert_eq!(r.status.condition.reason, "Completed");
        assert_eq!(r.status.image_reference.as_deref(), Some("quay.io/org/os:v1"));
    }

    #[test]
    fn build_cannot_skip_pushing() {
        let mut r = build_record();
        r.apply(&JobEvent::Admitted, Utc::now());
        let done = JobEvent::BuildCompleted {
            image_reference: "x".into(),
            manifest_digest: "y".into(),
        };
        assert!(!r.apply(&done, Utc::now()));
        assert_eq!(r.state(), JobState::Building);
    }

    #[test]
    fn export_enters_processing() {
        let mut r = export_record();
        assert!(r.apply(&JobEvent::Admitted, Utc::now()));
        assert_eq!(r.state(), JobState::Processing);
        assert!(r.status.condition.message.contains("qcow2"));
        assert!(!r.apply(&JobEvent::Pushing, Utc::now()));
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [
            JobEvent::Failed { message: "boom".into() },
            JobEvent::Canceled { message: None },
        ] {
            let mut r = build_record();
            r.apply(&JobEvent::Admitted, Utc::now());
            assert!(r.apply(&terminal, Utc::now()));
            let frozen = r.clone();
            for ev in [
                JobEvent::Admitted,
                JobEvent::Pushing,
                JobEvent::Heartbeat,
                JobEvent::CancelRequested { message: "x".into() },
                JobEvent::Failed { message: "again".into() },
                JobEvent::Canceled { message: Some("again".into()) },
            ] {
                assert!(!r.apply(&ev, Utc::now()));
            }
            assert_eq!(r, frozen);
        }
    }

    #[test]
    fn cancel_request_keeps_state_and_message_survives() {
        let mut r = build_record();
        r.apply(&JobEvent::Admitted, Utc::now());
        assert!(r.apply(
            &JobEvent::CancelRequested { message: "Operation timed out: last seen more than 1h ago".into() },
            Utc::now()
        ));
        assert_eq!(r.state(), JobState::Building);
        assert_eq!(r.status.condition.reason, "Building");
        assert!(!r.apply(&JobEvent::CancelRequested { message: "second".into() }, Utc::now()));

        assert!(r.apply(&JobEvent::Canceled { message: None }, Utc::now()));
        assert_eq!(r.state(), JobState::Canceled);
        assert_eq!(r.status.condition.message, "Operation timed out: last seen more than 1h ago");
    }

    #[test]
    fn pending_job_cannot_be_cancel_requested() {
        let mut r = build_record();
        assert!(!r.apply(&JobEvent::CancelRequested { message: "x".into() }, Utc::now()));
        assert!(!r.apply(&JobEvent::Heartbeat, Utc::now()));
        assert!(r.apply(&JobEvent::Canceled { message: None }, Utc::now()));
        assert_eq!(r.status.condition.message, MSG_CANCELED);
    }

    #[test]
    fn export_formats_map_to_converter_output() {
        assert_eq!(ExportFormat::Qcow2.output_path(), "qcow2/disk.qcow2");
        assert_eq!(ExportFormat::Vmdk.output_path(), "vmdk/disk.vmdk");
        assert_eq!(ExportFormat::Iso.output_path(), "bootiso/install.iso");
    }

    #[test]
    fn spec_serializes_with_kind_tag() {
        let spec = JobSpec::Export(ExportSpec {
            source_build_name: "b1".into(),
            format: Some(ExportFormat::Iso),
        });
        let v = serde_json::to_value(&spec).unwrap();
        assert_eq!(v["kind"], "ImageExport");
        assert_eq!(v["sourceBuildName"], "b1");
        assert_eq!(v["format"], "iso");
        let back: JobSpec = serde_json::from_value(v).unwrap();
        assert_eq!(back, spec);
    }
}
