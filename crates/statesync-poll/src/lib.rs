pub mod fetcher;
pub mod scheduler;

pub use fetcher::*;
pub use scheduler::*;
