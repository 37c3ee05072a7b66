//! Stage identifiers and the static stage dependency graph.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

/// Identifies one stage of the media pipeline.
///
/// Declaration order is canonical execution order, so `Ord` and
/// `BTreeSet<StageId>` iterate stages the way the pipeline runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Acquire the source episode (feed lookup, download).
    Fetch,
    /// Normalize audio for recognition.
    Normalize,
    /// Speech-to-text.
    Transcribe,
    /// Word-level timestamp alignment.
    Align,
    /// Speaker labeling.
    Diarize,
    /// Transcript cleanup and restoration.
    Restore,
    /// Language-model analysis of the transcript.
    Analyze,
    /// File-format export (srt, vtt, markdown, ...).
    Export,
    /// Third-party publishing.
    Publish,
}

impl StageId {
    /// Number of stages.
    pub const COUNT: usize = 9;

    /// All stages in canonical order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Fetch,
        Self::Normalize,
        Self::Transcribe,
        Self::Align,
        Self::Diarize,
        Self::Restore,
        Self::Analyze,
        Self::Export,
        Self::Publish,
    ];

    /// Position of the stage in canonical order.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The snake_case name used on disk, in events, and in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Normalize => "normalize",
            Self::Transcribe => "transcribe",
            Self::Align => "align",
            Self::Diarize => "diarize",
            Self::Restore => "restore",
            Self::Analyze => "analyze",
            Self::Export => "export",
            Self::Publish => "publish",
        }
    }

    /// Static metadata for this stage.
    #[must_use]
    pub fn definition(self) -> &'static StageDefinition {
        &STAGE_DEFINITIONS[self.index()]
    }

    /// Stages that must complete before this one.
    #[must_use]
    pub fn depends_on(self) -> &'static [Self] {
        self.definition().depends_on
    }

    /// Whether this stage may run alongside siblings it does not depend on.
    #[must_use]
    pub fn is_concurrent(self) -> bool {
        self.definition().concurrent
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == needle)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

/// Static metadata for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDefinition {
    /// The stage identifier.
    pub id: StageId,
    /// Stages that must have completed first.
    pub depends_on: &'static [StageId],
    /// Whether the stage may run concurrently with independent siblings.
    pub concurrent: bool,
}

/// The fixed stage graph, indexed by `StageId::index`.
pub static STAGE_DEFINITIONS: [StageDefinition; StageId::COUNT] = [
    StageDefinition {
        id: StageId::Fetch,
        depends_on: &[],
        concurrent: false,
    },
    StageDefinition {
        id: StageId::Normalize,
        depends_on: &[StageId::Fetch],
        concurrent: false,
    },
    StageDefinition {
        id: StageId::Transcribe,
        depends_on: &[StageId::Normalize],
        concurrent: false,
    },
    StageDefinition {
        id: StageId::Align,
        depends_on: &[StageId::Transcribe],
        concurrent: false,
    },
    // Diarization consumes align's word timestamps.
    StageDefinition {
        id: StageId::Diarize,
        depends_on: &[StageId::Align],
        concurrent: false,
    },
    StageDefinition {
        id: StageId::Restore,
        depends_on: &[StageId::Diarize],
        concurrent: false,
    },
    StageDefinition {
        id: StageId::Analyze,
        depends_on: &[StageId::Restore],
        concurrent: true,
    },
    StageDefinition {
        id: StageId::Export,
        depends_on: &[StageId::Restore],
        concurrent: true,
    },
    StageDefinition {
        id: StageId::Publish,
        depends_on: &[StageId::Analyze, StageId::Export],
        concurrent: false,
    },
];

/// Queries over the static stage graph restricted to a requested subset.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageGraph;

impl StageGraph {
    /// Dependencies of `stage` among the `requested` stages.
    ///
    /// A dependency that is not requested is replaced by its own
    /// dependencies, transitively, so ordering survives gaps in the request.
    #[must_use]
    pub fn effective_dependencies(
        stage: StageId,
        requested: &BTreeSet<StageId>,
    ) -> BTreeSet<StageId> {
        let mut result = BTreeSet::new();
        let mut frontier: Vec<StageId> = stage.depends_on().to_vec();
        let mut seen = BTreeSet::new();

        while let Some(dep) = frontier.pop() {
            if !seen.insert(dep) {
                continue;
            }
            if requested.contains(&dep) {
                result.insert(dep);
            } else {
                frontier.extend_from_slice(dep.depends_on());
            }
        }

        result
    }

    /// Every stage that depends on `stage`, directly or transitively.
    #[must_use]
    pub fn dependents(stage: StageId) -> BTreeSet<StageId> {
        let mut result = BTreeSet::new();
        for candidate in StageId::ALL {
            if candidate > stage && Self::reaches(candidate, stage) {
                result.insert(candidate);
            }
        }
        result
    }

    fn reaches(from: StageId, target: StageId) -> bool {
        from.depends_on()
            .iter()
            .any(|&dep| dep == target || Self::reaches(dep, target))
    }

    /// Orders `stages` so every stage follows its dependencies.
    #[must_use]
    pub fn topological_order(stages: &BTreeSet<StageId>) -> Vec<StageId> {
        let mut result = Vec::with_capacity(stages.len());
        let mut visited = BTreeSet::new();

        fn visit(
            node: StageId,
            stages: &BTreeSet<StageId>,
            visited: &mut BTreeSet<StageId>,
            result: &mut Vec<StageId>,
        ) {
            if !visited.insert(node) {
                return;
            }
            for dep in StageGraph::effective_dependencies(node, stages) {
                visit(dep, stages, visited, result);
            }
            result.push(node);
        }

        for &stage in stages {
            visit(stage, stages, &mut visited, &mut result);
        }

        result
    }
}

/// A fixed-size map with one slot per stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageMap<T> {
    slots: [T; StageId::COUNT],
}

impl<T> StageMap<T> {
    /// Builds a map by evaluating `f` for every stage.
    pub fn from_fn(mut f: impl FnMut(StageId) -> T) -> Self {
        Self {
            slots: std::array::from_fn(|i| f(StageId::ALL[i])),
        }
    }

    /// Iterates `(stage, value)` pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (StageId, &T)> {
        StageId::ALL.into_iter().zip(self.slots.iter())
    }
}

impl<T: Default> Default for StageMap<T> {
    fn default() -> Self {
        Self::from_fn(|_| T::default())
    }
}

impl<T> Index<StageId> for StageMap<T> {
    type Output = T;

    fn index(&self, stage: StageId) -> &T {
        &self.slots[stage.index()]
    }
}

impl<T> IndexMut<StageId> for StageMap<T> {
    fn index_mut(&mut self, stage: StageId) -> &mut T {
        &mut self.slots[stage.index()]
    }
}
