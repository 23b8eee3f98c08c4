//! Cross-source link model.

use crate::model::item::Side;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable id of one link row.
pub type LinkId = String;

/// Correlation between one side-A item and one side-B item believed to be
/// the same real-world entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub link_id: LinkId,
    pub a_item_id: String,
    pub b_item_id: String,
    /// Match quality in `[0.0, 1.0]`, kept for observability.
    pub confidence: f64,
    pub linked_at: i64,
}

impl Link {
    /// Creates a link with a generated id.
    pub fn new(
        a_item_id: impl Into<String>,
        b_item_id: impl Into<String>,
        confidence: f64,
        linked_at: i64,
    ) -> Self {
        Self {
            link_id: Uuid::new_v4().to_string(),
            a_item_id: a_item_id.into(),
            b_item_id: b_item_id.into(),
            confidence: confidence.clamp(0.0, 1.0),
            linked_at,
        }
    }

    /// Returns the id of this link's item on `side`.
    pub fn item_id(&self, side: Side) -> &str {
        match side {
            Side::A => &self.a_item_id,
            Side::B => &self.b_item_id,
        }
    }
}
