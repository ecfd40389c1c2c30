use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use nom::{
    IResult,
    branch::alt,
    bytes::complete::tag,
    character::complete::{space1, u32 as decimal_u32, u64 as decimal_u64},
    combinator::{map, opt, rest, value},
    sequence::{pair, preceded, separated_pair},
};
use tokio_util::codec::{Decoder, Encoder};

use crate::transport::CodecError;

const TERMINATOR: &[u8] = b"\r\n.\r\n";

/// What the next reply is going to look like. POP3 replies carry no marker of
/// their own, so the caller announces it before sending a command.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Shape {
    #[default]
    Line,
    MultiLine,
}

#[derive(Debug, PartialEq)]
pub enum Reply {
    Ok { text: String, body: Option<Bytes> },
    Err(String),
}

#[derive(Debug, Default)]
pub struct Pop3Codec {
    expect: Shape,
    scanned: usize,
}

impl Pop3Codec {
    pub fn expect(&mut self, shape: Shape) {
        self.expect = shape;
        self.scanned = 0;
    }
}

impl Decoder for Pop3Codec {
    type Item = Reply;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(line_end) = find(src, b"\r\n", 0) else {
            return Ok(None);
        };
        let line = String::from_utf8_lossy(&src[..line_end]).into_owned();
        let (is_ok, text) = match status_line(&line) {
            Ok((_, (is_ok, text))) => (is_ok, text.to_string()),
            Err(_) => return Err(CodecError::Malformed(line)),
        };

        if !is_ok {
            src.advance(line_end + 2);
            self.expect(Shape::Line);
            return Ok(Some(Reply::Err(text)));
        }

        match self.expect {
            Shape::Line => {
                src.advance(line_end + 2);
                Ok(Some(Reply::Ok { text, body: None }))
            }
            Shape::MultiLine => {
                let search_from = self.scanned.max(line_end);
                let Some(end) = find(src, TERMINATOR, search_from) else {
                    self.scanned = src.len().saturating_sub(TERMINATOR.len()).max(line_end);
                    return Ok(None);
                };
                let frame = src.split_to(end + TERMINATOR.len());
                let body = unstuff(&frame[line_end + 2..end + 2]);
                self.expect(Shape::Line);
                Ok(Some(Reply::Ok {
                    text,
                    body: Some(body),
                }))
            }
        }
    }
}

impl Encoder<&str> for Pop3Codec {
    type Error = CodecError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 2);
        dst.put_slice(item.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|position| position + from)
}

// lines starting with '.' were sent with an extra '.' in front
fn unstuff(body: &[u8]) -> Bytes {
    let mut unstuffed = BytesMut::with_capacity(body.len());
    for line in body.split_inclusive(|byte| *byte == b'\n') {
        if line.starts_with(b".") {
            unstuffed.put_slice(&line[1..]);
        } else {
            unstuffed.put_slice(line);
        }
    }
    unstuffed.freeze()
}

fn status_line(input: &str) -> IResult<&str, (bool, &str)> {
    pair(
        alt((value(true, tag("+OK")), value(false, tag("-ERR")))),
        map(opt(preceded(space1, rest)), Option::unwrap_or_default),
    )(input)
}

/// Parses the text of a `STAT` reply into message count and mailbox size.
pub fn parse_stat(text: &str) -> Option<(u32, u64)> {
    let parsed: IResult<&str, (u32, u64)> =
        separated_pair(decimal_u32, space1, decimal_u64)(text.trim());
    parsed.ok().map(|(_, stat)| stat)
}
