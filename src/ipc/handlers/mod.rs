pub mod balances;
pub mod classes;
pub mod core;
pub mod movements;
pub mod periods;
pub mod rollover;
pub mod students;
pub mod teachers;
