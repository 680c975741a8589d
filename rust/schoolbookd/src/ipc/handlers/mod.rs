pub mod assignments;
pub mod backup;
pub mod calendar;
pub mod core;
pub mod evaluations;
pub mod grades;
pub mod reports;
pub mod representatives;
pub mod sections;
pub mod setup;
pub mod students;
pub mod subjects;
pub mod teachers;
