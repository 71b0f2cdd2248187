pub mod events;
pub mod http;

pub use events::{NdjsonParser, parse_line, to_build_event};
pub use http::{HttpBuildService, HttpMutationService};
