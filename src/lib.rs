pub mod emitter;
pub mod error;
pub mod io_struct;
pub mod muxer;
pub mod pipeline;
pub mod retry;
pub mod server;
pub mod sse;
pub mod stage_client;
pub mod state;
pub mod stats;
pub mod translator;
