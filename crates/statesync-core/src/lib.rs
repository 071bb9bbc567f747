pub mod config;
pub mod health;
pub mod pipeline;
pub mod reconnect;
pub mod router;
pub mod store;
pub mod types;

pub use config::*;
pub use health::*;
pub use pipeline::*;
pub use reconnect::*;
pub use router::*;
pub use store::*;
pub use types::*;
