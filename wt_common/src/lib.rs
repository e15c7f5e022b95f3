//! WT-RTU Common Library
//!
//! This crate provides the shared vocabulary for all wt-rtu workspace
//! crates: the sensor/actuator data model, the canonical error taxonomy,
//! pure calibration math, the calculated-sensor expression evaluator, the
//! INI configuration layer with its precedence resolver, and the logging
//! facade.
//!
//! # Module Structure
//!
//! - [`consts`] - Slot ranges, fieldbus identity, default timeouts
//! - [`error`] - Canonical error kinds and the crate error type
//! - [`model`] - Sensor module, actuator, alarm rule and instance records
//! - [`calibration`] - Pure raw → engineering-value transforms
//! - [`filter`] - Exponential moving average signal filter
//! - [`eval`] - Expression evaluator for calculated sensors
//! - [`config`] - INI configuration, precedence resolver, bootstrap fetch
//! - [`log`] - Event facade with sequence numbers and rate limiting

pub mod calibration;
pub mod config;
pub mod consts;
pub mod error;
pub mod eval;
pub mod filter;
pub mod log;
pub mod model;
