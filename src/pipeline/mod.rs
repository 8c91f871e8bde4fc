pub mod broadcaster;
pub mod frame_buffer;

pub use broadcaster::{BroadcastReport, StreamBroadcaster};
pub use frame_buffer::{Cursor, FrameBuffer, Next};
