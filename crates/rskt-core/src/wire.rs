//! Control-message records exchanged between the library and the daemon.
//!
//! # Record format
//!
//! Each record travels as one datagram on the control channel:
//!
//! ```text
//! ┌─────────┬───────────┬──────┬──────────┬──────────┐
//! │ version │ direction │ kind │ reserved │ seq (LE) │   8 bytes
//! ├─────────┴───────────┴──────┴──────────┴──────────┤
//! │ status (LE u32)                  responses only  │
//! ├──────────────────────────────────────────────────┤
//! │ request fields (echoed in responses)             │
//! ├──────────────────────────────────────────────────┤
//! │ reply fields                   status == Ok only │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Integers are little-endian `u32`; strings are a `u16` length followed by
//! UTF-8 bytes.

use crate::{SocketAddr, Status};

/// Version byte carried in every record.
pub const WIRE_VERSION: u8 = 1;

/// Largest record either side will send or accept.
pub const MAX_RECORD: usize = 1024;

const HEADER_LEN: usize = 8;
const DIR_REQUEST: u8 = 0;
const DIR_RESPONSE: u8 = 1;

/// Request kind, shared by a request and its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Hello = 1,
    Bind = 2,
    Listen = 3,
    Accept = 4,
    Connect = 5,
    Close = 6,
    ForcedClose = 7,
}

impl Kind {
    fn from_u8(b: u8) -> Result<Self, WireError> {
        Ok(match b {
            1 => Kind::Hello,
            2 => Kind::Bind,
            3 => Kind::Listen,
            4 => Kind::Accept,
            5 => Kind::Connect,
            6 => Kind::Close,
            7 => Kind::ForcedClose,
            other => return Err(WireError::UnknownKind(other)),
        })
    }
}

/// A request. All but `ForcedClose` flow from library to daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Hello { pid: u32 },
    Bind { sn: u32 },
    Listen { sn: u32, backlog: u32 },
    Accept { sn: u32 },
    Connect { local_sn: u32, peer: SocketAddr },
    Close { sn: u32, flushed: bool },
    /// Daemon to library: tear down `sn` now.
    ForcedClose { sn: u32 },
}

impl Request {
    pub fn kind(&self) -> Kind {
        match self {
            Request::Hello { .. } => Kind::Hello,
            Request::Bind { .. } => Kind::Bind,
            Request::Listen { .. } => Kind::Listen,
            Request::Accept { .. } => Kind::Accept,
            Request::Connect { .. } => Kind::Connect,
            Request::Close { .. } => Kind::Close,
            Request::ForcedClose { .. } => Kind::ForcedClose,
        }
    }
}

/// Names and size of the two memory objects backing a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnSetup {
    /// Object this side maps and reads from.
    pub local_window: String,
    /// Object the peer maps; this side pushes into it.
    pub remote_window: String,
    /// Ring buffer size in bytes (power of two).
    pub buffer_size: u32,
}

/// Kind-specific payload of a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Hello { component_tag: u32, client_id: u32 },
    Bind { sn: u32 },
    Listen,
    Accept { new_sn: u32, peer: SocketAddr, setup: ConnSetup },
    Connect { local_sn: u32, peer: SocketAddr, setup: ConnSetup },
    Close,
    ForcedClose,
}

impl Reply {
    pub fn kind(&self) -> Kind {
        match self {
            Reply::Hello { .. } => Kind::Hello,
            Reply::Bind { .. } => Kind::Bind,
            Reply::Listen => Kind::Listen,
            Reply::Accept { .. } => Kind::Accept,
            Reply::Connect { .. } => Kind::Connect,
            Reply::Close => Kind::Close,
            Reply::ForcedClose => Kind::ForcedClose,
        }
    }
}

/// A response: status, an echo of the request, and a payload on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub request: Request,
    pub reply: Option<Reply>,
}

impl Response {
    pub fn ok(request: Request, reply: Reply) -> Self {
        Self {
            status: Status::Ok,
            request,
            reply: Some(reply),
        }
    }

    pub fn error(request: Request, status: Status) -> Self {
        debug_assert!(!status.is_ok());
        Self {
            status,
            request,
            reply: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Request(Request),
    Response(Response),
}

/// One control record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub seq: u32,
    pub body: Body,
}

impl Message {
    pub fn request(seq: u32, request: Request) -> Self {
        Self {
            seq,
            body: Body::Request(request),
        }
    }

    pub fn response(seq: u32, response: Response) -> Self {
        Self {
            seq,
            body: Body::Response(response),
        }
    }

    pub fn kind(&self) -> Kind {
        match &self.body {
            Body::Request(r) => r.kind(),
            Body::Response(r) => r.request.kind(),
        }
    }

    /// Serialize to a single record.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = Writer::default();
        w.put_u8(WIRE_VERSION);
        match &self.body {
            Body::Request(req) => {
                w.put_u8(DIR_REQUEST);
                w.put_u8(req.kind() as u8);
                w.put_u8(0);
                w.put_u32(self.seq);
                encode_request(&mut w, req);
            }
            Body::Response(resp) => {
                w.put_u8(DIR_RESPONSE);
                w.put_u8(resp.request.kind() as u8);
                w.put_u8(0);
                w.put_u32(self.seq);
                w.put_u32(resp.status as u32);
                encode_request(&mut w, &resp.request);
                match (&resp.reply, resp.status.is_ok()) {
                    (Some(reply), true) => {
                        if reply.kind() != resp.request.kind() {
                            return Err(WireError::ReplyMismatch {
                                request: resp.request.kind(),
                                reply: reply.kind(),
                            });
                        }
                        encode_reply(&mut w, reply)?;
                    }
                    (None, false) => {}
                    (Some(_), false) => return Err(WireError::UnexpectedReply),
                    (None, true) => return Err(WireError::MissingReply(resp.request.kind())),
                }
            }
        }
        if w.buf.len() > MAX_RECORD {
            return Err(WireError::TooLarge(w.buf.len()));
        }
        Ok(w.buf)
    }

    /// Parse a single record.
    pub fn decode(record: &[u8]) -> Result<Self, WireError> {
        if record.len() > MAX_RECORD {
            return Err(WireError::TooLarge(record.len()));
        }
        let mut r = Reader::new(record);
        let version = r.u8()?;
        if version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let direction = r.u8()?;
        let kind = Kind::from_u8(r.u8()?)?;
        let _reserved = r.u8()?;
        let seq = r.u32()?;

        let body = match direction {
            DIR_REQUEST => Body::Request(decode_request(&mut r, kind)?),
            DIR_RESPONSE => {
                let code = r.u32()?;
                let status = Status::from_u32(code).ok_or(WireError::UnknownStatus(code))?;
                let request = decode_request(&mut r, kind)?;
                let reply = if status.is_ok() {
                    Some(decode_reply(&mut r, kind)?)
                } else {
                    None
                };
                Body::Response(Response {
                    status,
                    request,
                    reply,
                })
            }
            other => return Err(WireError::UnknownDirection(other)),
        };
        r.finish()?;
        Ok(Message { seq, body })
    }
}

fn encode_request(w: &mut Writer, req: &Request) {
    match req {
        Request::Hello { pid } => w.put_u32(*pid),
        Request::Bind { sn } | Request::Accept { sn } | Request::ForcedClose { sn } => {
            w.put_u32(*sn)
        }
        Request::Listen { sn, backlog } => {
            w.put_u32(*sn);
            w.put_u32(*backlog);
        }
        Request::Connect { local_sn, peer } => {
            w.put_u32(*local_sn);
            w.put_addr(peer);
        }
        Request::Close { sn, flushed } => {
            w.put_u32(*sn);
            w.put_u32(u32::from(*flushed));
        }
    }
}

fn decode_request(r: &mut Reader<'_>, kind: Kind) -> Result<Request, WireError> {
    Ok(match kind {
        Kind::Hello => Request::Hello { pid: r.u32()? },
        Kind::Bind => Request::Bind { sn: r.u32()? },
        Kind::Listen => Request::Listen {
            sn: r.u32()?,
            backlog: r.u32()?,
        },
        Kind::Accept => Request::Accept { sn: r.u32()? },
        Kind::Connect => Request::Connect {
            local_sn: r.u32()?,
            peer: r.addr()?,
        },
        Kind::Close => Request::Close {
            sn: r.u32()?,
            flushed: r.u32()? != 0,
        },
        Kind::ForcedClose => Request::ForcedClose { sn: r.u32()? },
    })
}

fn encode_reply(w: &mut Writer, reply: &Reply) -> Result<(), WireError> {
    match reply {
        Reply::Hello {
            component_tag,
            client_id,
        } => {
            w.put_u32(*component_tag);
            w.put_u32(*client_id);
        }
        Reply::Bind { sn } => w.put_u32(*sn),
        Reply::Accept {
            new_sn: sn,
            peer,
            setup,
        }
        | Reply::Connect {
            local_sn: sn,
            peer,
            setup,
        } => {
            w.put_u32(*sn);
            w.put_addr(peer);
            w.put_str(&setup.local_window)?;
            w.put_str(&setup.remote_window)?;
            w.put_u32(setup.buffer_size);
        }
        Reply::Listen | Reply::Close | Reply::ForcedClose => {}
    }
    Ok(())
}

fn decode_reply(r: &mut Reader<'_>, kind: Kind) -> Result<Reply, WireError> {
    Ok(match kind {
        Kind::Hello => Reply::Hello {
            component_tag: r.u32()?,
            client_id: r.u32()?,
        },
        Kind::Bind => Reply::Bind { sn: r.u32()? },
        Kind::Listen => Reply::Listen,
        Kind::Accept | Kind::Connect => {
            let sn = r.u32()?;
            let peer = r.addr()?;
            let setup = ConnSetup {
                local_window: r.string()?,
                remote_window: r.string()?,
                buffer_size: r.u32()?,
            };
            if kind == Kind::Accept {
                Reply::Accept {
                    new_sn: sn,
                    peer,
                    setup,
                }
            } else {
                Reply::Connect {
                    local_sn: sn,
                    peer,
                    setup,
                }
            }
        }
        Kind::Close => Reply::Close,
        Kind::ForcedClose => Reply::ForcedClose,
    })
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_addr(&mut self, addr: &SocketAddr) {
        self.put_u32(addr.component_tag);
        self.put_u32(addr.socket_number);
    }

    fn put_str(&mut self, s: &str) -> Result<(), WireError> {
        let len = u16::try_from(s.len()).map_err(|_| WireError::TooLarge(s.len()))?;
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::Truncated)?;
        let bytes = self.data.get(self.pos..end).ok_or(WireError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn addr(&mut self) -> Result<SocketAddr, WireError> {
        Ok(SocketAddr::new(self.u32()?, self.u32()?))
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = self.take(2)?;
        let len = u16::from_le_bytes([len[0], len[1]]) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    fn finish(&self) -> Result<(), WireError> {
        match self.data.len() - self.pos {
            0 => Ok(()),
            extra => Err(WireError::TrailingBytes(extra)),
        }
    }
}

/// Errors encoding or decoding a control record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("record truncated")]
    Truncated,
    #[error("record has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("unknown direction {0}")]
    UnknownDirection(u8),
    #[error("unknown status code {0}")]
    UnknownStatus(u32),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("record of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error("{reply:?} reply attached to {request:?} request")]
    ReplyMismatch { request: Kind, reply: Kind },
    #[error("successful {0:?} response without a reply payload")]
    MissingReply(Kind),
    #[error("error response carries a reply payload")]
    UnexpectedReply,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> ConnSetup {
        ConnSetup {
            local_window: "rskt.5.1.a".into(),
            remote_window: "rskt.5.1.c".into(),
            buffer_size: 4096,
        }
    }

    #[test]
    fn test_accept_response_carries_setup() {
        let msg = Message::response(
            42,
            Response::ok(
                Request::Accept { sn: 100 },
                Reply::Accept {
                    new_sn: 4097,
                    peer: SocketAddr::new(5, 4096),
                    setup: setup(),
                },
            ),
        );
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);
        assert_eq!(bytes[1], DIR_RESPONSE);
        assert_eq!(bytes[2], Kind::Accept as u8);
        assert_eq!(&bytes[4..8], &42u32.to_le_bytes());
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_error_response_has_no_payload() {
        let msg = Message::response(
            7,
            Response::error(
                Request::Connect {
                    local_sn: 0,
                    peer: SocketAddr::new(9, 1),
                },
                Status::NoRoute,
            ),
        );
        let bytes = msg.encode().unwrap();
        // header + status + local_sn + peer
        assert_eq!(bytes.len(), HEADER_LEN + 4 + 4 + 8);
        let decoded = Message::decode(&bytes).unwrap();
        match decoded.body {
            Body::Response(resp) => {
                assert_eq!(resp.status, Status::NoRoute);
                assert!(resp.reply.is_none());
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_close_flag_and_forced_close() {
        for msg in [
            Message::request(1, Request::Close { sn: 9, flushed: true }),
            Message::request(2, Request::Close { sn: 9, flushed: false }),
            Message::request(3, Request::ForcedClose { sn: 9 }),
        ] {
            assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
        }
    }

    #[test]
    fn test_rejects_malformed_records() {
        let good = Message::request(1, Request::Bind { sn: 100 }).encode().unwrap();

        assert_eq!(Message::decode(&good[..6]), Err(WireError::Truncated));

        let mut extra = good.clone();
        extra.push(0);
        assert_eq!(Message::decode(&extra), Err(WireError::TrailingBytes(1)));

        let mut version = good.clone();
        version[0] = 9;
        assert_eq!(Message::decode(&version), Err(WireError::UnsupportedVersion(9)));

        let mut kind = good.clone();
        kind[2] = 0xee;
        assert_eq!(Message::decode(&kind), Err(WireError::UnknownKind(0xee)));

        let mut dir = good;
        dir[1] = 3;
        assert_eq!(Message::decode(&dir), Err(WireError::UnknownDirection(3)));
    }

    #[test]
    fn test_reply_must_match_request() {
        let msg = Message::response(
            1,
            Response {
                status: Status::Ok,
                request: Request::Bind { sn: 1 },
                reply: Some(Reply::Listen),
            },
        );
        assert!(matches!(msg.encode(), Err(WireError::ReplyMismatch { .. })));

        let missing = Message::response(
            1,
            Response {
                status: Status::Ok,
                request: Request::Bind { sn: 1 },
                reply: None,
            },
        );
        assert_eq!(missing.encode(), Err(WireError::MissingReply(Kind::Bind)));
    }
}
