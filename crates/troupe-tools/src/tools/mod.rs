//! Individual tool set implementations.

pub mod shell;
