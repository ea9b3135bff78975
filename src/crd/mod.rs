//! Custom Resource Definitions for the kwok controller

mod stage;

pub use stage::{
    SelectorOperator, SelectorRequirement, Stage, StageDelay, StageEvent, StageFinalizers,
    StageNext, StageResourceRef, StageSelector, StageSpec,
};
