pub mod accounts;
pub mod analytics;
pub mod attendance;
pub mod backup_exchange;
pub mod classes;
pub mod core;
pub mod evaluations;
pub mod grades;
pub mod remote_sync;
pub mod reports;
pub mod students;
pub mod subjects;
