//! Request framing for the llama.cpp TCP server.
//!
//! A frame is the decimal argument count, a newline, then every argument
//! terminated by a NUL byte. Arguments are `key` or `key value` pairs taken
//! from [`GenerationOptions`], followed by the prompt under [`PROMPT_KEY`].

use std::collections::BTreeMap;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reserved option key carrying the prompt text.
pub const PROMPT_KEY: &str = "-p";

/// Terminator written after every argument.
pub const ARG_TERMINATOR: u8 = 0;

/// A single generation option value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl OptionValue {
    /// Whether the key is written to the frame at all.
    pub fn is_present(&self) -> bool {
        !matches!(self, OptionValue::Flag(false))
    }

    /// The value argument written after the key, if any.
    ///
    /// Flags and empty strings contribute only their key.
    pub fn wire_value(&self) -> Option<String> {
        match self {
            OptionValue::Flag(_) => None,
            OptionValue::Number(n) => Some(n.to_string()),
            OptionValue::Text(s) if s.is_empty() => None,
            OptionValue::Text(s) => Some(s.clone()),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Flag(value)
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        OptionValue::Number(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Number(value as f64)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Text(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Text(value)
    }
}

/// Backend flags (`--temp`, `--n_predict`, ...) mapped to their values.
///
/// Keys are unique. The core does not interpret them; they go to the
/// backend as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationOptions(BTreeMap<String, OptionValue>);

impl GenerationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an option, returning `self` for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Option<OptionValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Parse a `KEY=VALUE` pair as given on the command line.
    ///
    /// `true`/`false` become flags. Anything else is kept as text exactly
    /// as typed, so `--seed=007` reaches the backend unchanged.
    pub fn parse_assignment(raw: &str) -> Result<(String, OptionValue)> {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| Error::InvalidOption(format!("expected KEY=VALUE, got '{}'", raw)))?;
        if key.is_empty() {
            return Err(Error::InvalidOption(format!("empty key in '{}'", raw)));
        }
        let value = match value {
            "true" => OptionValue::Flag(true),
            "false" => OptionValue::Flag(false),
            v => OptionValue::Text(v.to_string()),
        };
        Ok((key.to_string(), value))
    }
}

impl FromIterator<(String, OptionValue)> for GenerationOptions {
    fn from_iter<T: IntoIterator<Item = (String, OptionValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One encoded request: the argument list sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    args: Vec<String>,
}

impl Frame {
    /// Build the argument list for `prompt` with `options`.
    ///
    /// The prompt is written last under [`PROMPT_KEY`]; a `-p` entry in
    /// `options` is replaced by it.
    pub fn request(prompt: &str, options: &GenerationOptions) -> Self {
        let mut args = Vec::with_capacity(options.len() * 2 + 2);

        let prompt_value = OptionValue::Text(prompt.to_string());
        let entries = options
            .iter()
            .filter(|(key, _)| *key != PROMPT_KEY)
            .chain(std::iter::once((PROMPT_KEY, &prompt_value)));

        for (key, value) in entries {
            if !value.is_present() {
                continue;
            }
            args.push(key.to_string());
            if let Some(v) = value.wire_value() {
                args.push(v);
            }
        }

        Self { args }
    }

    /// Number of NUL-terminated arguments in the frame.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Bytes {
        let header = format!("{}\n", self.args.len());
        let body_len: usize = self.args.iter().map(|a| a.len() + 1).sum();

        let mut buf = BytesMut::with_capacity(header.len() + body_len);
        buf.put_slice(header.as_bytes());
        for arg in &self.args {
            buf.put_slice(arg.as_bytes());
            buf.put_u8(ARG_TERMINATOR);
        }
        buf.freeze()
    }

    /// Parse wire bytes back into a frame, checking the argument count.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let newline = buf
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| Error::InvalidOption("frame has no count line".into()))?;
        let count: usize = std::str::from_utf8(&buf[..newline])
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| Error::InvalidOption("frame count is not a number".into()))?;

        let body = &buf[newline + 1..];
        if body.last().map_or(false, |b| *b != ARG_TERMINATOR) {
            return Err(Error::InvalidOption("frame does not end with a terminator".into()));
        }

        let args = body
            .split(|b| *b == ARG_TERMINATOR)
            .take(body.iter().filter(|b| **b == ARG_TERMINATOR).count())
            .map(|a| {
                String::from_utf8(a.to_vec())
                    .map_err(|_| Error::InvalidOption("argument is not valid UTF-8".into()))
            })
            .collect::<Result<Vec<_>>>()?;

        if args.len() != count {
            return Err(Error::InvalidOption(format!(
                "frame declares {} arguments but carries {}",
                count,
                args.len()
            )));
        }
        Ok(Self { args })
    }

    /// Group the arguments into `(key, value)` pairs.
    ///
    /// An argument following a key is taken as its value unless it looks
    /// like a flag itself (leading `-` not followed by a digit). The
    /// argument after [`PROMPT_KEY`] is always its value.
    pub fn pairs(&self) -> Vec<(String, Option<String>)> {
        let mut pairs = Vec::new();
        let mut iter = self.args.iter().peekable();

        while let Some(key) = iter.next() {
            let takes_value = match iter.peek() {
                Some(_) if key == PROMPT_KEY => true,
                Some(next) => !looks_like_flag(next),
                None => false,
            };
            let value = if takes_value { iter.next().cloned() } else { None };
            pairs.push((key.clone(), value));
        }
        pairs
    }

    /// The prompt carried by the frame, if any.
    pub fn prompt(&self) -> Option<String> {
        self.pairs()
            .into_iter()
            .find(|(k, _)| k == PROMPT_KEY)
            .map(|(_, v)| v.unwrap_or_default())
    }
}

impl fmt::Display for Frame {
    /// Human-readable rendering with NULs shown as `\x00`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\\n", self.args.len())?;
        for arg in &self.args {
            write!(f, "{}\\x00", arg)?;
        }
        Ok(())
    }
}

fn looks_like_flag(arg: &str) -> bool {
    let mut chars = arg.chars();
    match (chars.next(), chars.next()) {
        (Some('-'), Some(c)) => !(c.is_ascii_digit() || c == '.'),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_options() -> GenerationOptions {
        GenerationOptions::new()
            .with("--n_predict", 128i64)
            .with("--temp", 0.7)
            .with("--seed", "-1")
            .with("--memory_f16", true)
            .with("--ignore-eos", false)
    }

    #[test]
    fn test_encode_layout() {
        let frame = Frame::request("Q: hi", &GenerationOptions::new().with("--threads", 4i64));
        assert_eq!(&frame.encode()[..], b"4\n--threads\x004\x00-p\x00Q: hi\x00");
    }

    #[test]
    fn test_count_matches_terminators() {
        let frame = Frame::request("hello", &sample_options());
        let bytes = frame.encode();
        let terminators = bytes.iter().filter(|b| **b == ARG_TERMINATOR).count();
        assert_eq!(frame.arg_count(), terminators);
        assert!(bytes.starts_with(format!("{}\n", terminators).as_bytes()));
    }

    #[test]
    fn test_false_flags_are_absent() {
        let frame = Frame::request("hello", &sample_options());
        assert!(!frame.args().iter().any(|a| a == "--ignore-eos"));
    }

    #[test]
    fn test_true_flag_has_no_value() {
        let frame = Frame::request("hello", &GenerationOptions::new().with("--memory_f16", true));
        assert_eq!(frame.args(), &["--memory_f16", "-p", "hello"]);
    }

    #[test]
    fn test_empty_string_contributes_key_only() {
        let frame = Frame::request("x", &GenerationOptions::new().with("--lora", ""));
        assert_eq!(frame.args(), &["--lora", "-p", "x"]);
    }

    #[test]
    fn test_numbers_are_stringified() {
        let frame = Frame::request("x", &GenerationOptions::new().with("--top_p", 0.9).with("--top_k", 40i64));
        assert_eq!(frame.args(), &["--top_k", "40", "--top_p", "0.9", "-p", "x"]);
    }

    #[test]
    fn test_prompt_replaces_reserved_key() {
        let frame = Frame::request("real", &GenerationOptions::new().with(PROMPT_KEY, "stale"));
        assert_eq!(frame.args(), &["-p", "real"]);
    }

    #[test]
    fn test_decoded_pairs_match_options() {
        let options = sample_options();
        let frame = Frame::request("- a prompt starting with a dash", &options);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);

        let mut expected: Vec<(String, Option<String>)> = options
            .iter()
            .filter(|(_, v)| v.is_present())
            .map(|(k, v)| (k.to_string(), v.wire_value()))
            .collect();
        expected.push((PROMPT_KEY.to_string(), Some("- a prompt starting with a dash".into())));

        assert_eq!(decoded.pairs(), expected);
        assert_eq!(decoded.prompt().as_deref(), Some("- a prompt starting with a dash"));
    }

    #[test]
    fn test_decode_rejects_count_mismatch() {
        assert!(Frame::decode(b"3\n-p\x00hi\x00").is_err());
        assert!(Frame::decode(b"no count").is_err());
        assert!(Frame::decode(b"2\n-p\x00hi").is_err());
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            GenerationOptions::parse_assignment("--temp=0.8").unwrap(),
            ("--temp".to_string(), OptionValue::Text("0.8".into()))
        );
        assert_eq!(
            GenerationOptions::parse_assignment("--ignore-eos=true").unwrap(),
            ("--ignore-eos".to_string(), OptionValue::Flag(true))
        );
        assert_eq!(
            GenerationOptions::parse_assignment("--seed=abc").unwrap(),
            ("--seed".to_string(), OptionValue::Text("abc".into()))
        );
        assert!(GenerationOptions::parse_assignment("--temp").is_err());
    }

    #[test]
    fn test_assigned_values_reach_the_wire_verbatim() {
        let options: GenerationOptions = ["--seed=12345678901234567890", "--top_p=0.90", "--keep=007"]
            .iter()
            .map(|raw| GenerationOptions::parse_assignment(raw).unwrap())
            .collect();
        let frame = Frame::request("hi", &options);
        assert_eq!(
            frame.args(),
            ["--keep", "007", "--seed", "12345678901234567890", "--top_p", "0.90", "-p", "hi"]
        );
    }

    #[test]
    fn test_options_deserialize_from_json() {
        let options: GenerationOptions =
            serde_json::from_str(r#"{"--temp": 0.8, "--seed": "42", "--memory_f16": true}"#).unwrap();
        assert_eq!(options.get("--temp"), Some(&OptionValue::Number(0.8)));
        assert_eq!(options.get("--seed"), Some(&OptionValue::Text("42".into())));
        assert_eq!(options.get("--memory_f16"), Some(&OptionValue::Flag(true)));
    }

    #[test]
    fn test_display_escapes_terminators() {
        let frame = Frame::request("hi", &GenerationOptions::new());
        assert_eq!(frame.to_string(), "2\\n-p\\x00hi\\x00");
    }
}
