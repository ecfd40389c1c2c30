use std::borrow::Cow;

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use imap_proto::{AttributeValue, MailboxDatum, Response};
use tokio_util::codec::{Decoder, Encoder};

use crate::transport::CodecError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

/// Owned subset of the server responses a cleanup session cares about.
#[derive(Debug, PartialEq)]
pub enum ImapResponse {
    Tagged {
        tag: String,
        status: Status,
        text: String,
    },
    Exists(u32),
    Expunge(u32),
    Body {
        sequence: u32,
        data: Bytes,
    },
    Info(String),
    Bye(String),
    Continue,
    Ignored,
}

#[derive(Debug, Default)]
pub struct ImapCodec {}

impl Decoder for ImapCodec {
    type Item = ImapResponse;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let (consumed, response) = match imap_proto::parser::parse_response(src) {
            Ok((remaining, response)) => (src.len() - remaining.len(), to_owned(response)),
            Err(nom::Err::Incomplete(_)) => return Ok(None),
            Err(_) => {
                let line_end = src
                    .iter()
                    .position(|byte| *byte == b'\n')
                    .unwrap_or(src.len());
                return Err(CodecError::Malformed(
                    String::from_utf8_lossy(&src[..line_end]).trim_end().to_string(),
                ));
            }
        };
        src.advance(consumed);

        Ok(Some(response))
    }
}

impl Encoder<String> for ImapCodec {
    type Error = CodecError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 2);
        dst.put_slice(item.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

fn text(information: Option<Cow<'_, str>>) -> String {
    information.map(Cow::into_owned).unwrap_or_default()
}

fn to_owned(response: Response<'_>) -> ImapResponse {
    match response {
        Response::Done {
            tag,
            status,
            information,
            ..
        } => ImapResponse::Tagged {
            tag: tag.0,
            status: match status {
                imap_proto::Status::Ok => Status::Ok,
                imap_proto::Status::No => Status::No,
                _ => Status::Bad,
            },
            text: text(information),
        },
        Response::Data {
            status: imap_proto::Status::Bye,
            information,
            ..
        } => ImapResponse::Bye(text(information)),
        Response::Data { information, .. } => ImapResponse::Info(text(information)),
        Response::MailboxData(MailboxDatum::Exists(exists)) => ImapResponse::Exists(exists),
        Response::Expunge(sequence) => ImapResponse::Expunge(sequence),
        Response::Fetch(sequence, attributes) => attributes
            .into_iter()
            .find_map(|attribute| match attribute {
                AttributeValue::BodySection { data: Some(data), .. }
                | AttributeValue::Rfc822(Some(data)) => Some(Bytes::from(data.into_owned())),
                _ => None,
            })
            .map_or(ImapResponse::Ignored, |data| ImapResponse::Body { sequence, data }),
        Response::Continue { .. } => ImapResponse::Continue,
        _ => ImapResponse::Ignored,
    }
}
