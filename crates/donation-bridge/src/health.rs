//! Worker liveness as seen by the supervisor.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerHealth {
    /// Sent a frame within the quiet period.
    #[default]
    Alive,
    /// Silent for longer than the quiet period.
    Unresponsive,
    /// Channel closed or process exited.
    Crashed,
}

impl WorkerHealth {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => WorkerHealth::Unresponsive,
            2 => WorkerHealth::Crashed,
            _ => WorkerHealth::Alive,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerHealth::Alive => 0,
            WorkerHealth::Unresponsive => 1,
            WorkerHealth::Crashed => 2,
        }
    }
}

/// Health shared between a worker's reader task, its watchdog and the handle.
///
/// `Crashed` is sticky: once recorded nothing moves the worker back to alive.
#[derive(Debug, Default)]
pub(crate) struct HealthCell(AtomicU8);

impl HealthCell {
    pub(crate) fn get(&self) -> WorkerHealth {
        WorkerHealth::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, health: WorkerHealth) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == WorkerHealth::Crashed.as_u8() {
                    None
                } else {
                    Some(health.as_u8())
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(
            [WorkerHealth::Alive, WorkerHealth::Unresponsive, WorkerHealth::Crashed],
            @r#"
        [
          "ALIVE",
          "UNRESPONSIVE",
          "CRASHED"
        ]
        "#
        );
    }

    #[test]
    fn crashed_is_sticky() {
        let cell = HealthCell::default();
        assert_eq!(cell.get(), WorkerHealth::Alive);

        cell.set(WorkerHealth::Unresponsive);
        assert_eq!(cell.get(), WorkerHealth::Unresponsive);

        cell.set(WorkerHealth::Crashed);
        cell.set(WorkerHealth::Alive);
        assert_eq!(cell.get(), WorkerHealth::Crashed);
    }
}
