pub mod cart;
pub mod decode;
pub mod queue;
pub mod recover;

pub type CommandResult = Result<(), Box<dyn std::error::Error>>;
