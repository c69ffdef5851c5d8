pub mod chunking;
pub mod frame;
pub mod telemetry;

pub use chunking::ChunkPlan;
pub use frame::{Frame, FrameError, FrameType, RESULT_OK};
pub use telemetry::Reading;
