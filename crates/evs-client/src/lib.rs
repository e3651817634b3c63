pub mod api;
pub mod cancel;
pub mod client;
pub mod http;
pub mod retry;
pub mod transport;

pub use api::*;
pub use cancel::CancelSignal;
pub use client::{ClientError, SubmissionClient, SubmitReceipt};
pub use http::HttpTransport;
pub use retry::*;
pub use transport::{PlatformTransport, TransportFailure};
