pub mod error;
pub mod handlers;
pub mod init;
pub mod models;
pub mod storage;
pub mod stream;

pub use crate::init::{AppState, Config};
pub use crate::stream::{CancellationToken, RequestManager, StreamService};
