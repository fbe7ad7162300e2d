//! Forwarding model: flows, groups and the pipeline tables they live in.

pub mod builder;
mod entity;

pub use entity::{
    Action, Bucket, FlowEntity, FlowKey, GroupEntity, GroupKey, GroupType, Instruction,
    MatchField,
};
