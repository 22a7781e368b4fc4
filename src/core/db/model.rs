use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// The three classes the classifier knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Rock,
    Paper,
    Scissors,
}

impl Label {
    pub const ALL: [Label; 3] = [Label::Rock, Label::Paper, Label::Scissors];

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Rock => "rock",
            Label::Paper => "paper",
            Label::Scissors => "scissors",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "rock" => Ok(Label::Rock),
            "paper" => Ok(Label::Paper),
            "scissors" => Ok(Label::Scissors),
            other => Err(anyhow::anyhow!("Invalid label: {}", other)),
        }
    }
}

/// The two tables sharing the image row shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    /// Append-only record of every served prediction.
    History,
    /// Staging rows drained once per retraining batch.
    Pending,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::History => "image_data",
            Table::Pending => "temp_image_data",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: i64,
    pub image: Vec<u8>,
    /// Stored as served; may not parse as a [`Label`].
    pub label: String,
    pub captured_at: OffsetDateTime,
    pub(super) _guard: (),
}

impl ImageRecord {
    pub fn known_label(&self) -> Option<Label> {
        self.label.parse().ok()
    }
}

/// Records read from a table together with the highest id among them.
#[derive(Debug, Clone)]
pub struct PendingSnapshot {
    pub records: Vec<ImageRecord>,
    pub fence: Option<i64>,
}

impl PendingSnapshot {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
