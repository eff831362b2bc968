pub mod backoff;
pub mod dispatcher;
pub mod lessons;
pub mod loop_detector;

pub use backoff::Backoff;
pub use dispatcher::{parse_action, AgentAction, DispatchReport, Dispatcher};
pub use lessons::LessonsProvider;
pub use loop_detector::LoopDetector;
