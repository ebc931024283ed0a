pub mod gateway;
pub mod labels;
pub mod summary;

pub use gateway::{HttpInferenceGateway, InferenceGateway, InferenceOutput, InferenceResult};
pub use labels::{ParseError, parse_labels};
pub use summary::{ClassCount, NO_OBJECTS_MESSAGE, summarize};
