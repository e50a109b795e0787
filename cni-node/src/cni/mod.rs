pub mod handler;
pub mod request;
mod server;

pub use handler::{ChainedHandler, CniHandler, PodContext};
pub use request::{Command, PodRequest, Request, RequestError};
pub use server::Server;
