pub mod check;
pub mod merge;
pub mod probe;
