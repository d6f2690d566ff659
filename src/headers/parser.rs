//! Parsers for `baggage` header members.
//!
//! Baggage members are `key=value` pairs with optional semicolon-delimited
//! properties, separated by commas, as defined by the
//! [W3C Baggage](https://www.w3.org/TR/baggage/) specification.

use bytes::Bytes;
use nom::bytes::complete::{take_while, take_while1};
use nom::character::complete::space0;
use nom::combinator::map;
use nom::sequence::delimited;
use nom::{Finish, IResult, InputLength};

macro_rules! byte_table {
    ($($c:expr),+ $(,)?) => {
        {
            let mut table = [false; 256];
            $(table[$c as usize] = true;)+
            table
        }

    };
}

const RFC_7230_TOKEN_SPECIAL: [bool; 256] = byte_table![
    b'!', b'#', b'$', b'%', b'&', b'\'', b'*', b'+', b'-', b'.', b'^', b'_', b'`', b'|', b'~'
];

pub(crate) const fn is_token(c: u8) -> bool {
    c.is_ascii_alphanumeric() || RFC_7230_TOKEN_SPECIAL[c as usize]
}

/// Printable ASCII except space, double quote, comma, semicolon and backslash.
pub(crate) const fn is_baggage_octet(c: u8) -> bool {
    matches!(c, 0x21 | 0x23..=0x2B | 0x2D..=0x3A | 0x3C..=0x5B | 0x5D..=0x7E)
}

pub(crate) fn key<'v>() -> impl FnMut(&'v [u8]) -> IResult<&'v [u8], Bytes> {
    map(take_while1(is_token), Bytes::copy_from_slice)
}

pub(crate) fn octets<'v>() -> impl FnMut(&'v [u8]) -> IResult<&'v [u8], Bytes> {
    map(take_while(is_baggage_octet), Bytes::copy_from_slice)
}

pub(crate) fn strip_whitespace<'v, F, O>(parser: F) -> impl FnMut(&'v [u8]) -> IResult<&'v [u8], O>
where
    F: FnMut(&'v [u8]) -> IResult<&'v [u8], O>,
{
    delimited(space0, parser, space0)
}

pub(crate) trait NoTail<O, E> {
    fn no_tail(self) -> Result<O, E>;
}

impl<I, O> NoTail<O, nom::error::Error<I>> for IResult<I, O>
where
    I: InputLength,
{
    fn no_tail(self) -> Result<O, nom::error::Error<I>> {
        match self.finish() {
            Ok((i, o)) if i.input_len() == 0 => Ok(o),
            Ok((i, _)) => Err(nom::error::Error::new(i, nom::error::ErrorKind::Eof)),
            Err(e) => Err(e),
        }
    }
}
