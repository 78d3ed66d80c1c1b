pub mod client;
pub mod pipes;
pub mod supervisor;
