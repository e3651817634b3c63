pub mod backoff;
pub mod checksum;
pub mod ids;
pub mod model;
pub mod state;
pub mod types;
pub mod window;

pub use backoff::*;
pub use checksum::*;
pub use ids::*;
pub use model::*;
pub use state::*;
pub use types::*;
pub use window::*;
