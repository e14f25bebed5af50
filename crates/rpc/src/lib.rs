//! HTTP surface for the PinLedger registry.
//!
//! Routes are assembled by [`build_router`]; [`start_server`] binds and serves
//! them until Ctrl-C.

pub mod files;
pub mod server;


pub use files::{
    ExistsResponse, PinRequest, PinResponse, StoreFileRequest, StoreFileResponse,
    UploaderFilesResponse,
};
pub use server::{build_router, start_server, ApiError, AppState, CALLER_HEADER};
