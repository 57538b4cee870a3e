//! Command handlers

pub mod flush;
pub mod remove;
pub mod scan;
