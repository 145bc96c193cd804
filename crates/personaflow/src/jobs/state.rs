use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Pipeline stage a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    DataGeneration,
    FineTuning,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::DataGeneration => "DATA_GENERATION",
            Stage::FineTuning => "FINE_TUNING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "DATA_GENERATION" => Some(Stage::DataGeneration),
            "FINE_TUNING" => Some(Stage::FineTuning),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataGenerationStatus {
    Pending,
    Submitted,
    /// Provider reports the batch as running. Observed, never driven locally.
    ExternalProcessing,
    /// Provider reports the batch as finished. Observed, never driven locally.
    ExternalComplete,
    ResultProcessing,
    Complete,
    Failed,
}

impl DataGenerationStatus {
    pub const ALL: [DataGenerationStatus; 7] = [
        Self::Pending,
        Self::Submitted,
        Self::ExternalProcessing,
        Self::ExternalComplete,
        Self::ResultProcessing,
        Self::Complete,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::ExternalProcessing => "EXTERNAL_PROCESSING",
            Self::ExternalComplete => "EXTERNAL_COMPLETE",
            Self::ResultProcessing => "RESULT_PROCESSING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    fn transition(self, to: Self) -> Transition {
        use DataGenerationStatus::*;

        if self == to {
            return Transition::Unchanged;
        }

        match (self, to) {
            (Complete | Failed, _) => Transition::Invalid,
            (_, Failed) => Transition::Advance,
            (Pending, Submitted) => Transition::Advance,
            // The provider may finish between two observations, so the
            // processing step can be skipped.
            (Submitted, ExternalProcessing | ExternalComplete) => Transition::Advance,
            (ExternalProcessing, ExternalComplete) => Transition::Advance,
            (ExternalComplete, ResultProcessing) => Transition::Advance,
            (ResultProcessing, Complete) => Transition::Advance,
            (
                Pending | Submitted | ExternalProcessing | ExternalComplete | ResultProcessing,
                Pending | Submitted | ExternalProcessing | ExternalComplete | ResultProcessing
                | Complete,
            ) => Transition::Invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FineTuningStatus {
    Pending,
    PreparingData,
    Training,
    Publishing,
    Complete,
    Failed,
}

impl FineTuningStatus {
    pub const ALL: [FineTuningStatus; 6] = [
        Self::Pending,
        Self::PreparingData,
        Self::Training,
        Self::Publishing,
        Self::Complete,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::PreparingData => "PREPARING_DATA",
            Self::Training => "TRAINING",
            Self::Publishing => "PUBLISHING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    fn transition(self, to: Self) -> Transition {
        use FineTuningStatus::*;

        if self == to {
            return Transition::Unchanged;
        }

        match (self, to) {
            (Complete | Failed, _) => Transition::Invalid,
            (_, Failed) => Transition::Advance,
            (Pending, PreparingData) => Transition::Advance,
            (PreparingData, Training) => Transition::Advance,
            (Training, Publishing) => Transition::Advance,
            (Publishing, Complete) => Transition::Advance,
            (
                Pending | PreparingData | Training | Publishing,
                Pending | PreparingData | Training | Publishing | Complete,
            ) => Transition::Invalid,
        }
    }
}

/// Outcome of asking the state machine to move from one status to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advance,
    /// Re-asserting the current status. Idempotent no-op.
    Unchanged,
    Invalid,
}

/// A job status, tagged with the stage whose state machine it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    DataGeneration(DataGenerationStatus),
    FineTuning(FineTuningStatus),
}

impl JobStatus {
    pub fn pending(stage: Stage) -> Self {
        match stage {
            Stage::DataGeneration => Self::DataGeneration(DataGenerationStatus::Pending),
            Stage::FineTuning => Self::FineTuning(FineTuningStatus::Pending),
        }
    }

    pub fn failed(stage: Stage) -> Self {
        match stage {
            Stage::DataGeneration => Self::DataGeneration(DataGenerationStatus::Failed),
            Stage::FineTuning => Self::FineTuning(FineTuningStatus::Failed),
        }
    }

    pub fn complete(stage: Stage) -> Self {
        match stage {
            Stage::DataGeneration => Self::DataGeneration(DataGenerationStatus::Complete),
            Stage::FineTuning => Self::FineTuning(FineTuningStatus::Complete),
        }
    }

    pub fn parse(stage: Stage, s: &str) -> Option<Self> {
        match stage {
            Stage::DataGeneration => DataGenerationStatus::parse(s).map(Self::DataGeneration),
            Stage::FineTuning => FineTuningStatus::parse(s).map(Self::FineTuning),
        }
    }

    /// Every status of both stages that can still move.
    pub fn non_terminal() -> Vec<JobStatus> {
        DataGenerationStatus::ALL
            .into_iter()
            .map(Self::DataGeneration)
            .chain(FineTuningStatus::ALL.into_iter().map(Self::FineTuning))
            .filter(|st| !st.is_terminal())
            .collect()
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::DataGeneration(_) => Stage::DataGeneration,
            Self::FineTuning(_) => Stage::FineTuning,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataGeneration(st) => st.as_str(),
            Self::FineTuning(st) => st.as_str(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::DataGeneration(st) => st.is_terminal(),
            Self::FineTuning(st) => st.is_terminal(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::DataGeneration(DataGenerationStatus::Failed)
                | Self::FineTuning(FineTuningStatus::Failed)
        )
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            Self::DataGeneration(DataGenerationStatus::Complete)
                | Self::FineTuning(FineTuningStatus::Complete)
        )
    }

    /// Statuses of different stages never transition into each other.
    pub fn transition(&self, to: JobStatus) -> Transition {
        match (*self, to) {
            (Self::DataGeneration(from), Self::DataGeneration(to)) => from.transition(to),
            (Self::FineTuning(from), Self::FineTuning(to)) => from.transition(to),
            (Self::DataGeneration(_), Self::FineTuning(_))
            | (Self::FineTuning(_), Self::DataGeneration(_)) => Transition::Invalid,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for JobStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use DataGenerationStatus as Dg;
    use FineTuningStatus as Ft;

    fn dg(st: Dg) -> JobStatus {
        JobStatus::DataGeneration(st)
    }

    fn ft(st: Ft) -> JobStatus {
        JobStatus::FineTuning(st)
    }

    #[test]
    fn data_generation_happy_path_advances() {
        let path = [
            Dg::Pending,
            Dg::Submitted,
            Dg::ExternalProcessing,
            Dg::ExternalComplete,
            Dg::ResultProcessing,
            Dg::Complete,
        ];
        for pair in path.windows(2) {
            assert_eq!(dg(pair[0]).transition(dg(pair[1])), Transition::Advance);
        }
    }

    #[test]
    fn provider_completion_may_skip_processing() {
        assert_eq!(
            dg(Dg::Submitted).transition(dg(Dg::ExternalComplete)),
            Transition::Advance
        );
    }

    #[test]
    fn no_backward_moves() {
        assert_eq!(
            dg(Dg::ExternalComplete).transition(dg(Dg::ExternalProcessing)),
            Transition::Invalid
        );
        assert_eq!(
            dg(Dg::Submitted).transition(dg(Dg::Pending)),
            Transition::Invalid
        );
        assert_eq!(
            ft(Ft::Publishing).transition(ft(Ft::Training)),
            Transition::Invalid
        );
    }

    #[test]
    fn failed_reachable_from_every_non_terminal_state() {
        for st in Dg::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert_eq!(dg(st).transition(dg(Dg::Failed)), Transition::Advance);
        }
        for st in Ft::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert_eq!(ft(st).transition(ft(Ft::Failed)), Transition::Advance);
        }
    }

    #[test]
    fn terminal_states_are_final() {
        assert_eq!(dg(Dg::Complete).transition(dg(Dg::Failed)), Transition::Invalid);
        assert_eq!(dg(Dg::Failed).transition(dg(Dg::Complete)), Transition::Invalid);
        assert_eq!(ft(Ft::Complete).transition(ft(Ft::Failed)), Transition::Invalid);
    }

    #[test]
    fn same_status_is_unchanged() {
        assert_eq!(
            dg(Dg::ExternalProcessing).transition(dg(Dg::ExternalProcessing)),
            Transition::Unchanged
        );
        assert_eq!(dg(Dg::Complete).transition(dg(Dg::Complete)), Transition::Unchanged);
    }

    #[test]
    fn stages_do_not_mix() {
        assert_eq!(dg(Dg::Pending).transition(ft(Ft::PreparingData)), Transition::Invalid);
    }

    #[test]
    fn parse_round_trips_names() {
        assert_eq!(
            JobStatus::parse(Stage::FineTuning, "PREPARING_DATA"),
            Some(ft(Ft::PreparingData))
        );
        assert_eq!(JobStatus::parse(Stage::DataGeneration, "PREPARING_DATA"), None);
        assert_eq!(Stage::parse("fine_tuning"), Some(Stage::FineTuning));
    }

    #[test]
    fn non_terminal_excludes_complete_and_failed() {
        let all = JobStatus::non_terminal();
        assert_eq!(all.len(), 5 + 4);
        assert!(all.iter().all(|s| !s.is_terminal()));
    }
}
