pub mod attendance;
pub mod core;
pub mod courses;
pub mod grades;
pub mod students;
