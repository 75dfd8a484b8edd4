//! Task model: one media item bound to one stage invocation.

use std::path::PathBuf;

use uuid::Uuid;

use crate::engine::EngineError;
use crate::media::MediaItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

/// Terminal result of one task after the retry layer settles it.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Succeeded { artifact: PathBuf, attempts: u32 },
    Failed { error: EngineError, attempts: u32 },
    Aborted,
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Succeeded { .. } => TaskStatus::Succeeded,
            TaskOutcome::Failed { .. } => TaskStatus::Failed,
            TaskOutcome::Aborted => TaskStatus::Aborted,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            TaskOutcome::Succeeded { attempts, .. } | TaskOutcome::Failed { attempts, .. } => {
                *attempts
            }
            TaskOutcome::Aborted => 0,
        }
    }
}

/// One unit of work: a media item bound to a stage. Created at admission,
/// discarded once it settles.
#[derive(Debug)]
pub struct Task {
    pub id: Uuid,
    pub item: MediaItem,
    pub stage: String,
    pub attempts: u32,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(item: MediaItem, stage: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            item,
            stage: stage.into(),
            attempts: 0,
            status: TaskStatus::Pending,
        }
    }

    pub fn start(&mut self) {
        debug_assert_eq!(self.status, TaskStatus::Pending);
        self.status = TaskStatus::Running;
    }

    pub fn settle(&mut self, outcome: &TaskOutcome) {
        self.attempts = outcome.attempts();
        self.status = outcome.status();
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Aborted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let mut task = Task::new(MediaItem::new("/in/a.mp4"), "transcode");
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(!task.is_settled());

        task.start();
        assert_eq!(task.status, TaskStatus::Running);

        task.settle(&TaskOutcome::Succeeded {
            artifact: PathBuf::from("/out/a.mp4"),
            attempts: 2,
        });
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempts, 2);
        assert!(task.is_settled());
    }

    #[test]
    fn outcome_status_mapping() {
        assert_eq!(TaskOutcome::Aborted.status(), TaskStatus::Aborted);
        assert_eq!(TaskOutcome::Aborted.attempts(), 0);
        let failed = TaskOutcome::Failed {
            error: EngineError::Cancelled,
            attempts: 5,
        };
        assert_eq!(failed.status(), TaskStatus::Failed);
        assert_eq!(failed.attempts(), 5);
    }
}
