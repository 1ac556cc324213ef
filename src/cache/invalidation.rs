//! Invalidation events
//!
//! The store itself only knows tags. The facade records why a set of tags was
//! invalidated so callers can inspect recent activity.

use crate::cache::types::DependencyTag;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Reason for cache invalidation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// A write command changed these tables
    TableWrite { tables: BTreeSet<String> },

    /// Caller invalidated tags directly
    Manual,

    /// Whole cache dropped
    Cleared,

    /// Expired entries reaped by an explicit purge
    Expired,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::TableWrite { tables } => {
                let names: Vec<&str> = tables.iter().map(String::as_str).collect();
                write!(f, "write to {}", names.join(", "))
            }
            InvalidationReason::Manual => write!(f, "manual invalidation"),
            InvalidationReason::Cleared => write!(f, "cache cleared"),
            InvalidationReason::Expired => write!(f, "TTL expired"),
        }
    }
}

/// Record of one invalidation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub reason: InvalidationReason,

    pub timestamp: DateTime<Utc>,

    /// Tags that were invalidated
    pub tags: BTreeSet<DependencyTag>,

    /// Entries removed
    pub removed: usize,

    /// Additional context, e.g. the owner context of the write
    pub context: Option<String>,
}

impl InvalidationEvent {
    pub fn new(reason: InvalidationReason, tags: BTreeSet<DependencyTag>, removed: usize) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
            tags,
            removed,
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}
