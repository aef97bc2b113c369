//! Per-request output delivery and cancellation

pub mod cancel;
pub mod channel;

pub use cancel::{CancelFlag, CancelHandle};
pub use channel::{
    continuation, ContinuationSender, PushOutcome, RequestHandle, StreamEvent, StreamOutput,
    TokenStream,
};
