//! Job status values and the lifecycle transition table.

use serde::{Deserialize, Serialize};

/// Major status of a job.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum JobStatus {
    Submitting,
    Received,
    Checking,
    Staging,
    Waiting,
    Matched,
    Running,
    Stalled,
    Completing,
    Done,
    Completed,
    Failed,
    Deleted,
    Killed,
    Rescheduled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitting => "Submitting",
            Self::Received => "Received",
            Self::Checking => "Checking",
            Self::Staging => "Staging",
            Self::Waiting => "Waiting",
            Self::Matched => "Matched",
            Self::Running => "Running",
            Self::Stalled => "Stalled",
            Self::Completing => "Completing",
            Self::Done => "Done",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Deleted => "Deleted",
            Self::Killed => "Killed",
            Self::Rescheduled => "Rescheduled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// The job has stopped executing, successfully or not.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Done | Self::Completed | Self::Failed | Self::Killed)
    }

    /// The job should leave the task queues and get a "Kill" command.
    pub fn is_kill_or_delete(&self) -> bool {
        matches!(self, Self::Killed | Self::Deleted)
    }

    /// Whether a job in this state may be placed in a task queue.
    pub fn is_queueable(&self) -> bool {
        !self.is_final() && !self.is_kill_or_delete()
    }

    /// States reachable in one step. Staying in the same state is always allowed.
    pub fn allowed_transitions(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Submitting => &[Received, Checking, Deleted, Killed],
            Received => &[Checking, Waiting, Failed, Deleted, Killed],
            Checking => &[Staging, Waiting, Rescheduled, Failed, Deleted, Killed],
            Staging => &[Checking, Waiting, Failed, Killed],
            Waiting => &[Matched, Rescheduled, Deleted, Killed],
            Matched => &[Running, Failed, Rescheduled, Killed],
            Running => &[
                Stalled,
                Completing,
                Done,
                Failed,
                Rescheduled,
                Killed,
                Received,
            ],
            Stalled => &[Running, Failed, Killed],
            Completing => &[Done, Completed, Failed, Stalled, Killed],
            Completed => &[Done, Failed],
            Done => &[Deleted],
            Failed => &[Rescheduled, Deleted],
            Killed => &[Deleted],
            Rescheduled => &[Waiting, Received, Deleted, Failed, Killed],
            Deleted => &[],
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        *self == next || self.allowed_transitions().contains(&next)
    }
}

/// Minor status strings written by the lifecycle orchestrator.
pub mod minor {
    pub const JOB_ACCEPTED: &str = "Job accepted";
    pub const BULK_CONFIRMATION: &str = "Bulk transaction confirmation";
    pub const JDL_SYNTAX_ERROR: &str = "Error in JDL syntax";
    pub const RESCHEDULED: &str = "Job Rescheduled";
    pub const MAX_RESCHEDULING: &str = "Maximum of reschedulings reached";
    pub const MARKED_FOR_TERMINATION: &str = "Marked for termination";
    pub const CHECKING_ACCOUNTING: &str = "Checking accounting";
}

/// Default value of MinorStatus / ApplicationStatus.
pub const UNKNOWN: &str = "Unknown";

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use strum::IntoEnumIterator;

    #[test]
    fn test_as_str_matches_display_and_parse() {
        for status in JobStatus::iter() {
            assert_eq!(status.as_str(), status.to_string());
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("running"), None);
    }

    #[test]
    fn test_deleted_is_absorbing() {
        for status in JobStatus::iter() {
            assert_eq!(
                JobStatus::Deleted.can_transition_to(status),
                status == JobStatus::Deleted
            );
        }
    }

    #[rstest]
    #[case(JobStatus::Received, JobStatus::Checking, true)]
    #[case(JobStatus::Running, JobStatus::Stalled, true)]
    #[case(JobStatus::Stalled, JobStatus::Running, true)]
    #[case(JobStatus::Running, JobStatus::Waiting, false)]
    #[case(JobStatus::Done, JobStatus::Running, false)]
    #[case(JobStatus::Failed, JobStatus::Rescheduled, true)]
    #[case(JobStatus::Waiting, JobStatus::Killed, true)]
    #[case(JobStatus::Matched, JobStatus::Matched, true)]
    fn test_transitions(#[case] from: JobStatus, #[case] to: JobStatus, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_final_states() {
        assert!(JobStatus::Done.is_final());
        assert!(JobStatus::Killed.is_final());
        assert!(!JobStatus::Deleted.is_final());
        assert!(!JobStatus::Stalled.is_final());
    }

    #[rstest]
    #[case(JobStatus::Received, true)]
    #[case(JobStatus::Waiting, true)]
    #[case(JobStatus::Rescheduled, true)]
    #[case(JobStatus::Done, false)]
    #[case(JobStatus::Failed, false)]
    #[case(JobStatus::Killed, false)]
    #[case(JobStatus::Deleted, false)]
    fn test_queueable(#[case] status: JobStatus, #[case] queueable: bool) {
        assert_eq!(status.is_queueable(), queueable);
    }
}
