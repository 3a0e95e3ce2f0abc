pub mod delta;
pub mod emit;
pub mod events;
pub mod request;
pub mod responses;
pub mod toolcall;

pub use delta::DeltaTracker;
pub use request::{
    CanonicalRequest, ContextEntry, LocationHint, M365Extensions, ResponseFormat, ToolChoiceMode,
    ToolDef, Tooling,
};
pub use responses::ResponsesRequest;
pub use toolcall::{AssistantResponse, FinishReason, ToolCallOut};
