pub mod group;
pub mod parser;
pub mod protocol;
pub mod reader;

pub use group::{ParserGroup, ParserHooks, MAX_POOL};
pub use parser::RequestParser;
pub use protocol::{ParamLocation, ParseError};

pub(crate) use help::ensure;

mod help {

    macro_rules! ensure {
        ($predicate:expr, $error:expr) => {
            if !$predicate {
                return Err($error);
            }
        };
    }
    pub(crate) use ensure;
}
