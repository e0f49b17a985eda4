pub mod attendance;
pub mod backup_exchange;
pub mod classes;
pub mod core;
pub mod derived;
pub mod scores;
pub mod students;
pub mod terms;
