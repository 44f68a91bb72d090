//! # Condition Evaluator
//!
//! Decides whether an update step is needed. Conditions form a tree of
//! boolean combinators over leaf predicates that inspect a local file or the
//! operating system.
//!
//! ## Feed form
//!
//! A `Conditions` element holds a flat list of children, each tagged with a
//! `type` of `and` (default), `or`, `not`/`and-not` or `or-not`. The list is
//! read left to right with AND binding tighter than OR, so
//! `a, or b, c, or d` means `a || (b && c) || d`. [`ConditionGroup`] collects
//! that list and [`ConditionGroup::degrade`] normalizes it into a
//! [`Condition`] tree.

mod file;
mod os;

pub use file::{
    ComparisonType, FileChecksumCondition, FileDateCondition, FileExistsCondition,
    FileSizeCondition, FileVersionCondition,
};
pub use os::OsCondition;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Context a predicate is evaluated in
#[derive(Debug, Clone, Copy)]
pub struct ConditionScope<'a> {
    /// Folder containing the application
    pub app_dir: &'a Path,
    /// Target path of the owning step, used when a leaf has none of its own
    pub step_path: Option<&'a str>,
}

impl<'a> ConditionScope<'a> {
    pub fn new(app_dir: &'a Path, step_path: Option<&'a str>) -> Self {
        Self { app_dir, step_path }
    }

    /// Resolve the target of a leaf. `None` when neither the leaf nor the
    /// step names a path.
    pub fn target(&self, own: Option<&str>) -> Option<PathBuf> {
        let path = own.or(self.step_path).filter(|p| !p.trim().is_empty())?;
        Some(self.app_dir.join(path))
    }
}

/// A leaf predicate
pub trait Predicate {
    fn is_met(&self, scope: &ConditionScope<'_>) -> bool;
}

/// Leaf predicates known to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LeafCondition {
    FileExists(FileExistsCondition),
    FileChecksum(FileChecksumCondition),
    FileSize(FileSizeCondition),
    FileVersion(FileVersionCondition),
    FileDate(FileDateCondition),
    Os(OsCondition),
}

impl Predicate for LeafCondition {
    fn is_met(&self, scope: &ConditionScope<'_>) -> bool {
        match self {
            LeafCondition::FileExists(c) => c.is_met(scope),
            LeafCondition::FileChecksum(c) => c.is_met(scope),
            LeafCondition::FileSize(c) => c.is_met(scope),
            LeafCondition::FileVersion(c) => c.is_met(scope),
            LeafCondition::FileDate(c) => c.is_met(scope),
            LeafCondition::Os(c) => c.is_met(scope),
        }
    }
}

/// Boolean condition tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Leaf(LeafCondition),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    /// Short-circuit evaluation. Empty `And` is true, empty `Or` is false.
    pub fn is_met(&self, scope: &ConditionScope<'_>) -> bool {
        match self {
            Condition::Leaf(leaf) => leaf.is_met(scope),
            Condition::And(children) => children.iter().all(|c| c.is_met(scope)),
            Condition::Or(children) => children.iter().any(|c| c.is_met(scope)),
            Condition::Not(child) => !child.is_met(scope),
        }
    }
}

impl From<LeafCondition> for Condition {
    fn from(leaf: LeafCondition) -> Self {
        Condition::Leaf(leaf)
    }
}

/// How a child joins the children before it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Combinator {
    #[default]
    And,
    Or,
    AndNot,
    OrNot,
}

impl Combinator {
    /// Parse a `type` attribute; anything unrecognized is `And`.
    pub fn from_type(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("or") => Combinator::Or,
            Some("not") | Some("and-not") => Combinator::AndNot,
            Some("or-not") => Combinator::OrNot,
            _ => Combinator::And,
        }
    }

    pub fn is_or(self) -> bool {
        matches!(self, Combinator::Or | Combinator::OrNot)
    }

    pub fn is_not(self) -> bool {
        matches!(self, Combinator::AndNot | Combinator::OrNot)
    }
}

/// Flat list of children as written in the feed
#[derive(Debug, Clone, Default)]
pub struct ConditionGroup {
    children: Vec<(Condition, Combinator)>,
}

impl ConditionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, condition: Condition, combinator: Combinator) {
        self.children.push((condition, combinator));
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Normalize into a tree. A single plain child is returned as is; an
    /// empty group yields `None`.
    pub fn degrade(self) -> Option<Condition> {
        let mut terms: Vec<Vec<Condition>> = Vec::new();

        for (index, (condition, combinator)) in self.children.into_iter().enumerate() {
            let condition = if combinator.is_not() {
                Condition::Not(Box::new(condition))
            } else {
                condition
            };

            // the first child's OR flag has nothing to its left to join
            if index == 0 || combinator.is_or() {
                terms.push(vec![condition]);
            } else if let Some(term) = terms.last_mut() {
                term.push(condition);
            }
        }

        let mut terms: Vec<Condition> = terms
            .into_iter()
            .map(|mut term| {
                if term.len() == 1 {
                    term.remove(0)
                } else {
                    Condition::And(term)
                }
            })
            .collect();

        match terms.len() {
            0 => None,
            1 => terms.pop(),
            _ => Some(Condition::Or(terms)),
        }
    }
}
