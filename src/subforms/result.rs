//! Aggregated outcome of a management pass.

use serde::Serialize;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// The structured failure surfaced to callers. Only one survives aggregation;
/// the rest are in the logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionError {
    /// A save-form directive names a form id with no registered template.
    MissingFormTemplate { form_id: String },
    /// A save-instance target path resolves to nothing in the child.
    MissingXPath { xpath: String },
}

impl ActionError {
    /// Lower wins when two results are combined.
    pub fn priority(&self) -> u8 {
        match self {
            Self::MissingFormTemplate { .. } => 1,
            Self::MissingXPath { .. } => 2,
        }
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingFormTemplate { form_id } => write!(f, "save-form id not found: {}", form_id),
            Self::MissingXPath { xpath } => write!(f, "save-instance XPath not found: {}", xpath),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubformActionResult {
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    /// The managed instance deleted itself; callers should drop any open session on it.
    pub self_destruct: bool,
    pub error: Option<ActionError>,
}

impl SubformActionResult {
    pub fn created(n: u32) -> Self {
        Self {
            created: n,
            ..Self::default()
        }
    }

    pub fn updated(n: u32) -> Self {
        Self {
            updated: n,
            ..Self::default()
        }
    }

    pub fn deleted(n: u32) -> Self {
        Self {
            deleted: n,
            ..Self::default()
        }
    }

    pub fn self_destructed(deleted: u32) -> Self {
        Self {
            deleted,
            self_destruct: true,
            ..Self::default()
        }
    }

    pub fn failed(error: ActionError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn has_changes(&self) -> bool {
        self.created + self.updated + self.deleted > 0 || self.self_destruct
    }

    pub fn counts(&self) -> (u32, u32, u32, bool) {
        (self.created, self.updated, self.deleted, self.self_destruct)
    }
}

impl Add for SubformActionResult {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        let error = match (self.error, other.error) {
            (Some(a), Some(b)) => Some(if b.priority() < a.priority() { b } else { a }),
            (a, b) => a.or(b),
        };
        Self {
            created: self.created + other.created,
            updated: self.updated + other.updated,
            deleted: self.deleted + other.deleted,
            self_destruct: self.self_destruct || other.self_destruct,
            error,
        }
    }
}

impl AddAssign for SubformActionResult {
    fn add_assign(&mut self, other: Self) {
        *self = std::mem::take(self) + other;
    }
}

impl Sum for SubformActionResult {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}
