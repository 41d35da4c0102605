pub mod chain;
pub mod event;
pub mod frames;
pub mod raised;
pub mod scrubber;
pub mod snapshot;

// Errors as handed to us
pub use raised::ErrorRef;
pub use raised::RaisedError;
pub use snapshot::FrameSnapshot;
pub use snapshot::StackSnapshot;
pub use snapshot::Variable;

// What we report
pub use chain::extract_exception_chain;
pub use chain::ChainType;
pub use chain::ExceptionRecord;
pub use event::build_payload;
pub use event::EventPayload;
pub use event::Request;
pub use event::User;
pub use frames::extract_frames;
pub use frames::Frame;
