//! Public engine surface.

pub mod database;

pub use database::RowboatDB;
