// THEORY:
// The `task` module is the policy layer of the orchestrator. It answers a single
// question, synchronously and without side effects: "may this task run against
// this kind of media?"
//
// Key architectural principles:
// 1.  **One Table, One Entry Point**: Every legality check goes through
//     `CompatibilityTable::is_compatible`. There are no per-media special cases
//     scattered through the submission path.
// 2.  **Policy as Data**: The table is a value, not a hard-coded `match`. The
//     default policy excludes `Track` for still images (tracking needs temporal
//     continuity), but a deployment may install a different table.
// 3.  **Unknown Is Never Legal**: `MediaKind::Unknown` maps to the empty set in
//     every table, whatever the caller inserts.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// The resolved kind of a media source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Live,
    Unknown,
}

impl MediaKind {
    pub const ALL: [MediaKind; 4] = [MediaKind::Image, MediaKind::Video, MediaKind::Live, MediaKind::Unknown];

    /// Static media has a finite, known list of units; live media does not.
    pub fn is_static(self) -> bool {
        matches!(self, MediaKind::Image | MediaKind::Video)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Live => "live",
            MediaKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// The computer-vision task a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Detect,
    Segment,
    Classify,
    Track,
    Pose,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        TaskKind::Detect,
        TaskKind::Segment,
        TaskKind::Classify,
        TaskKind::Track,
        TaskKind::Pose,
    ];
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Detect => "detect",
            TaskKind::Segment => "segment",
            TaskKind::Classify => "classify",
            TaskKind::Track => "track",
            TaskKind::Pose => "pose",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|task| task.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown task '{s}'"))
    }
}

/// Maps each media kind to the set of tasks that may run against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityTable {
    allowed: HashMap<MediaKind, HashSet<TaskKind>>,
}

impl CompatibilityTable {
    /// A table that permits nothing.
    pub fn empty() -> Self {
        Self {
            allowed: HashMap::new(),
        }
    }

    /// Permits `tasks` for `media`. Ignored for `MediaKind::Unknown`.
    pub fn allow(mut self, media: MediaKind, tasks: impl IntoIterator<Item = TaskKind>) -> Self {
        if media != MediaKind::Unknown {
            self.allowed.entry(media).or_default().extend(tasks);
        }
        self
    }

    /// Removes a single pair from the table.
    pub fn deny(mut self, media: MediaKind, task: TaskKind) -> Self {
        if let Some(tasks) = self.allowed.get_mut(&media) {
            tasks.remove(&task);
        }
        self
    }

    pub fn is_compatible(&self, media: MediaKind, task: TaskKind) -> bool {
        self.allowed
            .get(&media)
            .is_some_and(|tasks| tasks.contains(&task))
    }

    /// The tasks permitted for `media`, in declaration order.
    pub fn tasks_for(&self, media: MediaKind) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|task| self.is_compatible(media, *task))
            .collect()
    }
}

impl Default for CompatibilityTable {
    fn default() -> Self {
        Self::empty()
            .allow(
                MediaKind::Image,
                [TaskKind::Detect, TaskKind::Segment, TaskKind::Classify, TaskKind::Pose],
            )
            .allow(MediaKind::Video, TaskKind::ALL)
            .allow(MediaKind::Live, TaskKind::ALL)
    }
}

/// Checks a pair against the default policy.
pub fn is_compatible(media: MediaKind, task: TaskKind) -> bool {
    CompatibilityTable::default().is_compatible(media, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_every_pair() {
        let table = CompatibilityTable::default();
        for media in MediaKind::ALL {
            for task in TaskKind::ALL {
                let expected = match media {
                    MediaKind::Image => task != TaskKind::Track,
                    MediaKind::Video | MediaKind::Live => true,
                    MediaKind::Unknown => false,
                };
                assert_eq!(table.is_compatible(media, task), expected, "{media} / {task}");
            }
        }
    }

    #[test]
    fn unknown_media_cannot_be_allowed() {
        let table = CompatibilityTable::empty().allow(MediaKind::Unknown, TaskKind::ALL);
        assert!(table.tasks_for(MediaKind::Unknown).is_empty());
    }

    #[test]
    fn policy_can_be_reconfigured() {
        let table = CompatibilityTable::default()
            .allow(MediaKind::Image, [TaskKind::Track])
            .deny(MediaKind::Live, TaskKind::Segment);
        assert!(table.is_compatible(MediaKind::Image, TaskKind::Track));
        assert!(!table.is_compatible(MediaKind::Live, TaskKind::Segment));
        assert_eq!(table.tasks_for(MediaKind::Image).len(), 5);
    }

    #[test]
    fn task_names_parse_case_insensitively() {
        assert_eq!("Pose".parse::<TaskKind>(), Ok(TaskKind::Pose));
        assert!("tracking".parse::<TaskKind>().is_err());
    }
}
