pub mod discussion;
pub mod evolution;
pub mod gateway;
pub mod prompts;
pub mod synthesis;
pub mod types;

#[cfg(feature = "gemini")]
pub mod client;

#[cfg(test)]
pub(crate) mod testing;

pub use discussion::*;
pub use evolution::*;
pub use gateway::*;
pub use synthesis::*;
pub use types::*;

#[cfg(feature = "gemini")]
pub use client::*;
