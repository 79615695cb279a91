//! Deployment update machinery

pub mod backup;
pub mod command;
pub mod deps;
pub mod fsm;
pub mod git;
pub mod report;
pub mod sequencer;
pub mod service;
