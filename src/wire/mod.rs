pub mod auth;
pub mod frame;
pub mod rate_limit;

pub use auth::{compute_hmac, verify_message, AuthError};
pub use frame::{encode_frame, read_frame, write_frame, FrameError, MAX_FRAME_BYTES};
pub use rate_limit::{is_exempt, RateLimiter};
