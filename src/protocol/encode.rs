//! Protocol message encoding

use super::constants::SSL_REQUEST_CODE;
use super::message::FrontendMessage;
use bytes::{BufMut, BytesMut};
use std::io;

/// Encode a frontend message into bytes
///
/// Fails with `InvalidInput` if a string field contains a NUL byte, since the
/// protocol terminates strings with NUL and the value would be truncated.
pub fn encode_message(msg: &FrontendMessage) -> io::Result<BytesMut> {
    let mut buf = BytesMut::new();

    match msg {
        FrontendMessage::Startup { version, params } => {
            framed(&mut buf, None, |buf| {
                buf.put_i32(*version);
                for (key, value) in params {
                    put_cstr(buf, key)?;
                    put_cstr(buf, value)?;
                }
                buf.put_u8(0);
                Ok(())
            })?;
        }
        FrontendMessage::Password(password) => {
            framed(&mut buf, Some(b'p'), |buf| put_cstr(buf, password))?;
        }
        FrontendMessage::Query(query) => {
            framed(&mut buf, Some(b'Q'), |buf| put_cstr(buf, query))?;
        }
        FrontendMessage::Terminate => {
            framed(&mut buf, Some(b'X'), |_| Ok(()))?;
        }
        FrontendMessage::SaslInitialResponse { mechanism, data } => {
            framed(&mut buf, Some(b'p'), |buf| {
                put_cstr(buf, mechanism)?;
                buf.put_i32(data.len() as i32);
                buf.put_slice(data);
                Ok(())
            })?;
        }
        FrontendMessage::SaslResponse { data } => {
            framed(&mut buf, Some(b'p'), |buf| {
                buf.put_slice(data);
                Ok(())
            })?;
        }
        FrontendMessage::SslRequest => {
            framed(&mut buf, None, |buf| {
                buf.put_i32(SSL_REQUEST_CODE);
                Ok(())
            })?;
        }
    }

    Ok(buf)
}

/// Write an optional type byte, a length placeholder, the body, then patch the
/// length (which counts itself but not the type byte).
fn framed<F>(buf: &mut BytesMut, tag: Option<u8>, body: F) -> io::Result<()>
where
    F: FnOnce(&mut BytesMut) -> io::Result<()>,
{
    if let Some(tag) = tag {
        buf.put_u8(tag);
    }
    let len_pos = buf.len();
    buf.put_i32(0);

    body(buf)?;

    let len = buf.len() - len_pos;
    let len = i32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
    buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

fn put_cstr(buf: &mut BytesMut, s: &str) -> io::Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "string contains NUL byte",
        ));
    }
    buf.put(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}
