//! Shared primitive types used across the entire pipeline.

/// A stable, unique identifier for a customer.
pub type EntityId = String;

/// The canonical run identifier.
pub type RunId = String;

/// Pins a feature set's definitions. Scoring must match the version
/// used for training.
pub type SchemaVersion = String;

/// A calendar date. As-of dates, run dates and label dates are all days.
pub type Date = chrono::NaiveDate;

/// A point in time carried by a source record.
pub type Timestamp = chrono::NaiveDateTime;
