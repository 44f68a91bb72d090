//! # Feed Reader
//!
//! Turns a feed document into an ordered list of [`Step`]s. Element names are
//! looked up in a [`Registry`] that maps names and aliases to factories, and
//! each factory builds its step or condition from the element's attributes.

mod xml;

pub use xml::XmlFeedReader;

use std::collections::HashMap;

use crate::attributes::Attributes;
use crate::conditions::{
    FileChecksumCondition, FileDateCondition, FileExistsCondition, FileSizeCondition,
    FileVersionCondition, LeafCondition, OsCondition,
};
use crate::error::Result;
use crate::steps::{FileDeleteStep, FileUpdateStep, Step, StepKind};

/// Builds a step from element attributes
pub type StepFactory = fn(&Attributes) -> StepKind;

/// Builds a leaf condition from element attributes
pub type ConditionFactory = fn(&Attributes) -> LeafCondition;

/// Parsed feed
#[derive(Debug, Clone, Default)]
pub struct FeedDocument {
    /// Overrides the source's base URL when present
    pub base_url: Option<String>,
    pub steps: Vec<Step>,
}

/// Parses feed text into steps
pub trait FeedReader: Send + Sync {
    fn read(&self, text: &str) -> Result<FeedDocument>;
}

/// Name/alias lookup table for step and condition factories
#[derive(Clone, Default)]
pub struct Registry {
    steps: HashMap<String, StepFactory>,
    conditions: HashMap<String, ConditionFactory>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("conditions", &self.conditions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in step and condition
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register_step(&["FileUpdateTask", "fileUpdate"], |a| {
            StepKind::FileUpdate(FileUpdateStep::from_attributes(a))
        });
        registry.register_step(&["FileDeleteTask", "fileDelete"], |a| {
            StepKind::FileDelete(FileDeleteStep::from_attributes(a))
        });

        registry.register_condition(&["FileExistsCondition", "exists"], |a| {
            LeafCondition::FileExists(FileExistsCondition::from_attributes(a))
        });
        registry.register_condition(&["FileChecksumCondition", "checksum"], |a| {
            LeafCondition::FileChecksum(FileChecksumCondition::from_attributes(a))
        });
        registry.register_condition(&["FileSizeCondition", "size"], |a| {
            LeafCondition::FileSize(FileSizeCondition::from_attributes(a))
        });
        registry.register_condition(&["FileVersionCondition", "version"], |a| {
            LeafCondition::FileVersion(FileVersionCondition::from_attributes(a))
        });
        registry.register_condition(&["FileDateCondition", "date"], |a| {
            LeafCondition::FileDate(FileDateCondition::from_attributes(a))
        });
        registry.register_condition(&["OSCondition", "os"], |a| {
            LeafCondition::Os(OsCondition::from_attributes(a))
        });

        registry
    }

    /// Register a step factory under a name and its aliases.
    pub fn register_step(&mut self, names: &[&str], factory: StepFactory) {
        for name in names {
            self.steps.insert(name.to_ascii_lowercase(), factory);
        }
    }

    /// Register a condition factory under a name and its aliases.
    pub fn register_condition(&mut self, names: &[&str], factory: ConditionFactory) {
        for name in names {
            self.conditions.insert(name.to_ascii_lowercase(), factory);
        }
    }

    pub fn step(&self, name: &str) -> Option<StepFactory> {
        self.steps.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn condition(&self, name: &str) -> Option<ConditionFactory> {
        self.conditions.get(&name.to_ascii_lowercase()).copied()
    }
}
