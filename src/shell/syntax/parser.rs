use super::ast::*;
use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;

pub const REDIRECT_OPERATOR: &[u8] = b">";
pub const INPUT_OPERATOR: &[u8] = b"<";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("syntax error: expected output file")]
    MissingOutputFile,
    #[error("syntax error: expected input file")]
    MissingInputFile,
    #[error("syntax error: expected command")]
    MissingCommand,
}

fn classify(tokens: &[OsString]) -> Result<Vec<Argument>, Error> {
    let mut arguments: Vec<Argument> = Vec::with_capacity(tokens.len());
    let mut iter = tokens.iter().map(OsString::as_os_str);
    while let Some(token) = iter.next() {
        match token.as_bytes() {
            REDIRECT_OPERATOR => match iter.next() {
                Some(target) => arguments.push(Argument::Redirect(target)),
                None => return Err(Error::MissingOutputFile),
            },
            INPUT_OPERATOR => match iter.next() {
                Some(target) => arguments.push(Argument::Input(target)),
                None => return Err(Error::MissingInputFile),
            },
            _ => arguments.push(Argument::Literal(token)),
        }
    }
    Ok(arguments)
}

/// Classifies a token sequence in one left-to-right pass. The token after
/// `>` or `<` is always taken as the file name, whatever it looks like.
pub fn parse(tokens: &[OsString]) -> Result<Command, Error> {
    let mut arguments = classify(tokens)?;
    let (position, binary) = arguments
        .iter()
        .enumerate()
        .find_map(|(i, arg)| match *arg {
            Argument::Literal(s) => Some((i, s)),
            _ => None,
        })
        .ok_or(Error::MissingCommand)?;
    arguments.remove(position);
    Ok(Command { binary, arguments })
}
