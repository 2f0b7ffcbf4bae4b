//! Wire format of result frames.
//!
//! Every frame is one ring message: a single tag byte followed by a
//! tag-specific payload. Multi-byte integers are big-endian.

use crate::error::{TaskError, TaskResult};

use super::decode_text;

pub const TAG_SCHEMA: u8 = b'T';
pub const TAG_ROW: u8 = b'D';
pub const TAG_COMMAND_DONE: u8 = b'C';
pub const TAG_ERROR: u8 = b'E';
pub const TAG_NOTICE: u8 = b'N';
pub const TAG_ASYNC_EVENT: u8 = b'A';
pub const TAG_READY: u8 = b'Z';

/// Tags of the COPY subprotocol, which the result channel does not carry.
pub(crate) const COPY_TAGS: [u8; 3] = [b'G', b'H', b'W'];

/// Diagnostic severity carried by Error/Notice frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Notice = 0,
    Warning = 1,
    Error = 2,
    Fatal = 3,
    Panic = 4,
}

impl Severity {
    fn from_wire(b: u8) -> Self {
        match b {
            0 => Self::Notice,
            1 => Self::Warning,
            2 => Self::Error,
            3 => Self::Fatal,
            _ => Self::Panic,
        }
    }

    /// Severity as observed by the decoding side: never above `Error`, so a
    /// worker diagnostic can terminate its own task but nothing else.
    pub fn capped(self) -> Self {
        if self > Self::Error {
            Self::Error
        } else {
            self
        }
    }

    /// Whether the capped severity aborts the result stream.
    pub fn is_error(self) -> bool {
        self.capped() == Self::Error
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Notice => "NOTICE",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::Panic => "PANIC",
        };
        f.write_str(s)
    }
}

/// Structured diagnostic payload of an Error or Notice frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError {
    pub severity: Severity,
    /// Five-character error code, e.g. "57014".
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl WireError {
    pub fn new(severity: Severity, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.into(),
            message: message.into(),
            detail: None,
            hint: None,
        }
    }
}

/// One column of a Schema frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    pub name: String,
    /// Producer-declared type code.
    pub type_code: u32,
}

/// A decoded result frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Ordered column shape governing subsequent Row frames.
    Schema(Vec<ColumnDesc>),
    /// One tuple; `None` marks an explicit null column.
    Row(Vec<Option<Vec<u8>>>),
    /// Completion tag for one command.
    CommandDone(String),
    Error(WireError),
    Notice(WireError),
    /// Opaque out-of-band notification, forwarded verbatim.
    AsyncEvent(Vec<u8>),
    /// Terminal marker; no more frames follow.
    Ready,
}

impl Frame {
    /// Encode this frame into one ring message.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Frame::Schema(cols) => {
                out.push(TAG_SCHEMA);
                out.extend_from_slice(&(cols.len() as u16).to_be_bytes());
                for col in cols {
                    let name = col.name.as_bytes();
                    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
                    out.extend_from_slice(name);
                    out.extend_from_slice(&col.type_code.to_be_bytes());
                }
            }
            Frame::Row(cols) => {
                out.push(TAG_ROW);
                out.extend_from_slice(&(cols.len() as u16).to_be_bytes());
                for col in cols {
                    match col {
                        None => out.extend_from_slice(&(-1i32).to_be_bytes()),
                        Some(bytes) => {
                            out.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                            out.extend_from_slice(bytes);
                        }
                    }
                }
            }
            Frame::CommandDone(tag) => {
                out.push(TAG_COMMAND_DONE);
                out.extend_from_slice(tag.as_bytes());
            }
            Frame::Error(e) | Frame::Notice(e) => {
                out.push(if matches!(self, Frame::Error(_)) {
                    TAG_ERROR
                } else {
                    TAG_NOTICE
                });
                out.push(e.severity as u8);
                for field in [
                    Some(e.code.as_str()),
                    Some(e.message.as_str()),
                    e.detail.as_deref(),
                    e.hint.as_deref(),
                ] {
                    let bytes = field.unwrap_or("").as_bytes();
                    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                    out.extend_from_slice(bytes);
                }
            }
            Frame::AsyncEvent(payload) => {
                out.push(TAG_ASYNC_EVENT);
                out.extend_from_slice(payload);
            }
            Frame::Ready => out.push(TAG_READY),
        }
        out
    }

    /// Decode one ring message into a frame. The caller is expected to have
    /// routed COPY and unknown tags already; they are malformed here.
    pub fn decode(buf: &[u8]) -> TaskResult<Frame> {
        let mut r = Reader::new(buf);
        let tag = r.u8()?;
        match tag {
            TAG_SCHEMA => {
                let natts = r.u16()? as usize;
                let mut cols = Vec::with_capacity(natts);
                for _ in 0..natts {
                    let name_len = r.u16()? as usize;
                    let name = decode_text(r.bytes(name_len)?);
                    let type_code = r.u32()?;
                    cols.push(ColumnDesc { name, type_code });
                }
                r.end()?;
                Ok(Frame::Schema(cols))
            }
            TAG_ROW => {
                let natts = r.u16()? as usize;
                let mut cols = Vec::with_capacity(natts);
                for _ in 0..natts {
                    let len = r.i32()?;
                    if len < 0 {
                        cols.push(None);
                    } else {
                        cols.push(Some(r.bytes(len as usize)?.to_vec()));
                    }
                }
                r.end()?;
                Ok(Frame::Row(cols))
            }
            TAG_COMMAND_DONE => Ok(Frame::CommandDone(decode_text(r.remainder()))),
            TAG_ERROR | TAG_NOTICE => {
                let severity = Severity::from_wire(r.u8()?);
                let mut fields = [const { String::new() }; 4];
                for field in fields.iter_mut() {
                    let len = r.u32()? as usize;
                    *field = decode_text(r.bytes(len)?);
                }
                let [code, message, detail, hint] = fields;
                let e = WireError {
                    severity,
                    code,
                    message,
                    detail: (!detail.is_empty()).then_some(detail),
                    hint: (!hint.is_empty()).then_some(hint),
                };
                r.end()?;
                Ok(if tag == TAG_ERROR {
                    Frame::Error(e)
                } else {
                    Frame::Notice(e)
                })
            }
            TAG_ASYNC_EVENT => Ok(Frame::AsyncEvent(r.remainder().to_vec())),
            TAG_READY => {
                r.end()?;
                Ok(Frame::Ready)
            }
            other => Err(TaskError::Protocol(format!(
                "unexpected frame tag {:?}",
                other as char
            ))),
        }
    }
}

/// Cursor over a frame payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> TaskResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(TaskError::Protocol("truncated frame".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> TaskResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> TaskResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> TaskResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> TaskResult<i32> {
        Ok(self.u32()? as i32)
    }

    fn remainder(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn end(&self) -> TaskResult<()> {
        if self.pos != self.buf.len() {
            return Err(TaskError::Protocol("trailing bytes in frame".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_frame_encodes_and_decodes() {
        let frame = Frame::Schema(vec![
            ColumnDesc {
                name: "id".into(),
                type_code: 20,
            },
            ColumnDesc {
                name: "label".into(),
                type_code: 25,
            },
        ]);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_row_frame_preserves_nulls() {
        let frame = Frame::Row(vec![Some(vec![0, 0, 0, 7]), None]);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_error_frame_drops_empty_optional_fields() {
        let frame = Frame::Error(WireError::new(Severity::Error, "57014", "canceled"));
        match Frame::decode(&frame.encode()).unwrap() {
            Frame::Error(e) => {
                assert_eq!(e.code, "57014");
                assert_eq!(e.detail, None);
                assert_eq!(e.hint, None);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        let mut bytes = Frame::Schema(vec![ColumnDesc {
            name: "id".into(),
            type_code: 23,
        }])
        .encode();
        bytes.truncate(bytes.len() - 2);
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn test_severity_cap() {
        assert_eq!(Severity::Fatal.capped(), Severity::Error);
        assert_eq!(Severity::Panic.capped(), Severity::Error);
        assert_eq!(Severity::Notice.capped(), Severity::Notice);
        assert!(!Severity::Warning.is_error());
        assert!(Severity::Fatal.is_error());
    }
}
