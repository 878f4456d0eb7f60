use porter_types::{TaskId, TaskKind};

use crate::transport::NetworkTask;

/// Task behind requests handed out after shutdown. Never runs.
#[derive(Debug, Default)]
pub struct NoopTask;

impl NetworkTask for NoopTask {
    fn id(&self) -> TaskId {
        TaskId(0)
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Data
    }

    fn description(&self) -> Option<String> {
        None
    }

    fn set_description(&self, _description: Option<String>) {}

    fn resume(&self) {}

    fn cancel(&self) {}

    fn is_completed(&self) -> bool {
        true
    }
}
