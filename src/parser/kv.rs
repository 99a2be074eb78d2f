//! Tokenizer for whitespace-delimited `key=value` record lines, the common
//! shape of scanner measurement lines and vote lines.

use nom::bytes::complete::take_till1;
use nom::character::complete::{char, multispace0};
use nom::multi::many0;
use nom::sequence::{preceded, separated_pair};
use nom::Finish;
use nom::IResult;

use super::ParseError;

fn kv_pair(i: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(
        take_till1(|c: char| c == '=' || c.is_whitespace()),
        char('='),
        take_till1(char::is_whitespace),
    )(i)
}

/// Split a record line into its `key=value` pairs, in order of appearance.
/// The caller decides which keys it cares about; unknown keys are simply
/// carried through, so formats can grow fields without breaking old readers.
pub fn parse_kv_line(line: &str) -> Result<Vec<(&str, &str)>, ParseError> {
    let (rest, pairs) = many0(preceded(multispace0, kv_pair))(line)
        .finish()
        .map_err(|_: nom::error::Error<&str>| ParseError::MalformedRecord {
            raw: line.to_string(),
        })?;

    if !rest.trim().is_empty() {
        return Err(ParseError::MalformedRecord {
            raw: line.to_string(),
        });
    }
    Ok(pairs)
}
