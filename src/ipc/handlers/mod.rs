pub mod core;
pub mod dashboard;
pub mod grades;
pub mod reports;
pub mod setup;
pub mod transfer;
