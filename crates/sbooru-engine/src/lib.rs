pub mod fetch;
pub mod host;
mod http;
pub mod plugin;
pub mod search;
pub mod styler;
pub mod tag_index;
pub mod validate;

pub use fetch::{normalize_image, EncodedImage};
pub use host::{Host, InboundMessage};
pub use plugin::{HandlerOutcome, SafebooruPlugin, TOOL_NAME};
pub use search::{ImageBoard, SafebooruClient, SearchRequest};
pub use styler::{PassthroughStyler, ReplyIntent, ReplyStyler, RewritingStyler};
pub use tag_index::{SafebooruTagIndex, TagIndex};
pub use validate::validate_tags;
