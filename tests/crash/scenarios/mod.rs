//! Crash scenarios, one module per pipeline stage

mod apply;
