//! Wire protocol spoken with the llama.cpp TCP server.

pub mod frame;
pub mod response;

pub use frame::{Frame, GenerationOptions, OptionValue, PROMPT_KEY};
pub use response::{ResponseDecoder, ResponseParseState, ResponseParser, Separator, BANNER_MARKER};
