#![allow(dead_code)]

mod fixtures;
pub use fixtures::*;

// Re-export commonly used types from rpsloop for tests
pub use rpsloop::{
    Config, Error, Outcome, SkipReason,
    core::{
        db::{ImageRecord, ImageRepository, ImageStore, Label, Table},
        tracking::{RunStatus, Tracking},
    },
};
