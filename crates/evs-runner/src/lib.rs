pub mod batch;
pub mod config;
pub mod controller;
pub mod error;
pub mod exit;
pub mod lease;
pub mod runner;

pub use batch::*;
pub use config::*;
pub use controller::*;
pub use error::*;
pub use exit::*;
pub use lease::*;
pub use runner::*;
