use nom::bytes::complete::{is_not, take_while};
use nom::multi::many0;
use nom::sequence::{preceded, terminated};
use nom::IResult;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

/// Bytes that separate words. Nothing else splits a token, not even other
/// ASCII whitespace such as vertical tab or form feed.
pub const DELIMITERS: &[u8] = b" \t\r\n\x07";

fn is_delimiter(c: u8) -> bool {
    DELIMITERS.contains(&c)
}

fn delimiters(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while(is_delimiter)(input)
}

fn word(input: &[u8]) -> IResult<&[u8], &[u8]> {
    preceded(delimiters, is_not(DELIMITERS))(input)
}

fn words(input: &[u8]) -> IResult<&[u8], Vec<&[u8]>> {
    terminated(many0(word), delimiters)(input)
}

/// Splits `line` into owned, non-empty tokens. Runs of delimiters collapse
/// into a single split point. Tokens keep their bytes as read, whether or
/// not they are valid UTF-8.
pub fn tokenize(line: &[u8]) -> Vec<OsString> {
    match words(line) {
        Ok((remaining, tokens)) => {
            debug_assert!(remaining.is_empty());
            tokens
                .into_iter()
                .map(|token| OsStr::from_bytes(token).to_os_string())
                .collect()
        }
        Err(e) => {
            // every byte is either a delimiter or part of a word
            warn!("tokenizer rejected input: {:?}", e);
            Vec::new()
        }
    }
}
