//! Streaming search: frame decoding and the session that drives a query.

pub mod frame;
pub mod session;

pub use frame::{DONE_SENTINEL, Frame, FrameDecoder, RawFrame, parse_frame};
pub use session::{
    CANCELLED_MESSAGE, FailureKind, SEARCH_PATH, SearchSession, SessionSnapshot, StreamState,
};
