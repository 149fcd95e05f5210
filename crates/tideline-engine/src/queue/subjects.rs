//! Subject naming and matching
//!
//! Subjects are dot-separated tokens. In patterns `*` matches exactly one
//! token and a trailing `>` matches one or more remaining tokens.

use tideline_types::{ObjectType, Operation};

/// Subjects for one resource type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    type_name: String,
}

impl Subjects {
    pub fn new(object_type: &ObjectType) -> Self {
        Self {
            type_name: object_type.name.clone(),
        }
    }

    pub fn create(&self) -> String {
        format!("{}.create", self.type_name)
    }

    pub fn update(&self) -> String {
        format!("{}.update", self.type_name)
    }

    pub fn delete(&self) -> String {
        format!("{}.delete", self.type_name)
    }

    /// Wildcard covering every operation on the type
    pub fn all(&self) -> String {
        format!("{}.*", self.type_name)
    }

    pub fn for_operation(&self, operation: &Operation) -> Option<String> {
        operation
            .subject_suffix()
            .map(|suffix| format!("{}.{}", self.type_name, suffix))
    }
}

/// Whether `subject` matches `pattern`
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(s)) if !s.is_empty() => continue,
            (Some(p), Some(s)) if p == s && !s.is_empty() => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
