//! Low-level building blocks shared by the log.

/// Positioned file I/O.
///
/// A device trait with a file-backed and an in-memory implementation.
pub mod io;
