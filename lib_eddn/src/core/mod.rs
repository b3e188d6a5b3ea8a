pub mod client;
pub mod emitter;
pub mod event;
pub mod frame_clock;
pub mod render_queue;
pub mod router;
pub mod transport;
