pub mod headers;
pub mod request;
pub mod response;

pub use headers::{
    compose_upstream_headers, filter_downstream_headers, snapshot_headers,
    synthesize_response_headers, DEFAULT_CLIENT_UA, SENSITIVE_HEADERS,
};
pub use request::{is_genuine_claude_code, RequestShaper, CLAUDE_CODE_PRELUDE};
pub use response::ResponseShaper;
