//! Incremental decoding of the backend's reply stream.
//!
//! The server prints a status banner ending in a `sampling parameters:`
//! line, echoes the submitted prompt, and only then streams generated
//! text. [`ResponseParseState`] strips exactly that prefix regardless of
//! where chunk boundaries fall. [`ResponseDecoder`] adapts it to a
//! byte-oriented [`Decoder`] for use with `FramedRead`.

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::trace;

/// Marker contained in the last banner line before the prompt echo.
pub const BANNER_MARKER: &str = "sampling parameters:";

/// Where the parser is within one connection's reply.
///
/// Transitions only move forward and never reset for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseParseState {
    AwaitingBanner,
    AwaitingPromptEcho { remaining: usize, separator: Separator },
    StreamingTokens,
}

/// Progress through the separator written between the banner and the
/// echoed prompt.
///
/// The server writes a single leading space before the echo; builds
/// running in interactive mode write `"> "` instead. Either may be split
/// across chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    Pending,
    /// Saw `>`, a following space still belongs to the separator
    Angle,
    Consumed,
}

impl Default for ResponseParseState {
    fn default() -> Self {
        ResponseParseState::AwaitingBanner
    }
}

impl ResponseParseState {
    /// Apply one inbound chunk.
    ///
    /// Returns the next state and the generated text contained in the
    /// chunk, if any. `prompt_len` is the prompt length in characters.
    pub fn advance(self, chunk: &str, prompt_len: usize) -> (Self, Option<&str>) {
        match self {
            ResponseParseState::AwaitingBanner => {
                if chunk.is_empty() || !chunk.contains(BANNER_MARKER) {
                    return (self, None);
                }
                let after = chunk.rsplit('\n').next().unwrap_or("");
                consume_echo(prompt_len, Separator::Pending, after)
            }
            ResponseParseState::AwaitingPromptEcho { remaining, separator } => {
                consume_echo(remaining, separator, chunk)
            }
            ResponseParseState::StreamingTokens => (self, non_empty(chunk)),
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, ResponseParseState::StreamingTokens)
    }

    fn echo(remaining: usize, separator: Separator) -> Self {
        if remaining == 0 && separator == Separator::Consumed {
            ResponseParseState::StreamingTokens
        } else {
            ResponseParseState::AwaitingPromptEcho { remaining, separator }
        }
    }
}

/// Skip the separator and `remaining` echoed prompt characters of `text`,
/// returning whatever follows them as generated text.
fn consume_echo(mut remaining: usize, mut separator: Separator, mut text: &str) -> (ResponseParseState, Option<&str>) {
    loop {
        match separator {
            Separator::Pending => {
                let mut chars = text.chars();
                match chars.next() {
                    Some('>') => separator = Separator::Angle,
                    Some(_) => separator = Separator::Consumed,
                    None => break,
                }
                text = chars.as_str();
            }
            Separator::Angle => {
                if text.is_empty() {
                    break;
                }
                text = text.strip_prefix(' ').unwrap_or(text);
                separator = Separator::Consumed;
            }
            Separator::Consumed => {
                let len = text.chars().count();
                if len <= remaining {
                    remaining -= len;
                    break;
                }
                let generated = skip_chars(text, remaining);
                return (ResponseParseState::StreamingTokens, non_empty(generated));
            }
        }
    }
    (ResponseParseState::echo(remaining, separator), None)
}

fn skip_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[idx..],
        None => "",
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Stateful parser for one connection's reply.
#[derive(Debug, Clone)]
pub struct ResponseParser {
    state: ResponseParseState,
    prompt_len: usize,
}

impl ResponseParser {
    pub fn new(prompt: &str) -> Self {
        Self {
            state: ResponseParseState::default(),
            prompt_len: prompt.chars().count(),
        }
    }

    pub fn state(&self) -> ResponseParseState {
        self.state
    }

    /// Feed one chunk, returning the generated text it carries.
    pub fn feed<'a>(&mut self, chunk: &'a str) -> Option<&'a str> {
        let (next, out) = self.state.advance(chunk, self.prompt_len);
        if next != self.state {
            trace!(from = ?self.state, to = ?next, "response parser transition");
        }
        self.state = next;
        out
    }
}

/// Byte-level decoder yielding generated text.
///
/// Each call consumes everything buffered, so one TCP read maps to one
/// parser chunk. A UTF-8 sequence split across reads is held back until
/// it completes; invalid bytes are replaced rather than rejected.
#[derive(Debug)]
pub struct ResponseDecoder {
    parser: ResponseParser,
}

impl ResponseDecoder {
    pub fn new(prompt: &str) -> Self {
        Self {
            parser: ResponseParser::new(prompt),
        }
    }

    pub fn state(&self) -> ResponseParseState {
        self.parser.state()
    }

    fn take_text(src: &mut BytesMut, at_eof: bool) -> String {
        let take = match std::str::from_utf8(src) {
            Ok(_) => src.len(),
            Err(e) => match e.error_len() {
                Some(bad) => e.valid_up_to() + bad,
                None if at_eof => src.len(),
                None => e.valid_up_to(),
            },
        };
        let bytes = src.split_to(take);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn decode_chunk(&mut self, src: &mut BytesMut, at_eof: bool) -> Option<String> {
        let mut out = String::new();
        // Keep going while invalid bytes split the buffer into several pieces.
        while !src.is_empty() {
            let before = src.len();
            let chunk = Self::take_text(src, at_eof);
            if chunk.is_empty() && src.len() == before {
                break;
            }
            trace!(chunk = %chunk, "received tcp packet");
            if let Some(text) = self.parser.feed(&chunk) {
                out.push_str(text);
            }
        }
        non_empty(&out).map(str::to_string)
    }
}

impl Decoder for ResponseDecoder {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.decode_chunk(src, false))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.decode_chunk(src, true))
    }
}
