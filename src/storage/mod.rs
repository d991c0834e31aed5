//! File-backed storage: the append-only row file and the engine
//! directory lock.

pub mod lock;
pub mod rows;
