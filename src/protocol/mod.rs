mod error;
pub use error::ParseError;

mod form;
pub use form::FormData;
pub(crate) use form::hex_val;

mod head;
pub use head::RequestHead;

/// Where [`RequestParser::param`](crate::RequestParser::param) looks a key up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
    /// The raw request header lines.
    Header,
    /// The query string portion of the request URI.
    Query,
    /// A url-encoded form in the request body.
    Body,
}
