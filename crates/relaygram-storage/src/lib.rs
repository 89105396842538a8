//! Token persistence for relaygram.

pub mod db;
