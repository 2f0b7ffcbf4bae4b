//! Decode-side state machine for one result stream.
//!
//! The decoder consumes raw ring messages until the controller observes a
//! terminal `Ready` frame or the peer goes away. It enforces the schema
//! agreement rules: at most one Schema frame, every Row matches the
//! announced shape, and the announced shape matches what the caller asked
//! for (with a text fallback for producer types that have no binary
//! decoder on this side).

use tracing::warn;

use crate::error::{TaskError, TaskResult};

use super::frame::{ColumnDesc, Frame, WireError, COPY_TAGS};
use super::types::{decode_value, has_binary_decoder, ColumnType, Value};
use super::{TAG_ASYNC_EVENT, TAG_COMMAND_DONE, TAG_ERROR, TAG_NOTICE, TAG_READY, TAG_ROW, TAG_SCHEMA};

/// One item surfaced to the controller while draining a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// A decoded data row.
    Row(Vec<Value>),
    /// A sub-error diagnostic (notice or warning) from the worker.
    Notice(WireError),
    /// An out-of-band notification, forwarded verbatim.
    AsyncEvent(Vec<u8>),
}

/// Per-retrieval decode state. Created at the first retrieval call for a
/// task, destroyed when retrieval completes or errors.
#[derive(Debug)]
pub struct ResultDecoder {
    pid: u32,
    expected: Vec<ColumnType>,
    saw_schema: bool,
    complete: bool,
    command_tags: Vec<String>,
}

impl ResultDecoder {
    pub fn new(pid: u32, expected: Vec<ColumnType>) -> Self {
        Self {
            pid,
            expected,
            saw_schema: false,
            complete: false,
            command_tags: Vec::new(),
        }
    }

    /// Whether the terminal `Ready` frame has been seen.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Completion tags accumulated so far.
    pub fn command_tags(&self) -> &[String] {
        &self.command_tags
    }

    /// Feed one raw ring message. Returns an item to surface, or `None`
    /// for bookkeeping frames. A worker error aborts the stream with
    /// `TaskError::Remote`.
    pub fn on_message(&mut self, buf: &[u8]) -> TaskResult<Option<StreamItem>> {
        let Some(&tag) = buf.first() else {
            return Err(TaskError::Protocol("empty frame".into()));
        };
        match tag {
            TAG_ERROR | TAG_NOTICE => {
                let (e, severity) = match Frame::decode(buf)? {
                    Frame::Error(e) | Frame::Notice(e) => {
                        let capped = e.severity.capped();
                        (e, capped)
                    }
                    _ => unreachable!("tag routed to error arm"),
                };
                if severity.is_error() {
                    Err(TaskError::Remote {
                        pid: self.pid,
                        code: e.code,
                        message: e.message,
                        detail: e.detail,
                        hint: e.hint,
                    })
                } else {
                    Ok(Some(StreamItem::Notice(e)))
                }
            }
            TAG_SCHEMA => {
                let Frame::Schema(cols) = Frame::decode(buf)? else {
                    unreachable!("tag routed to schema arm");
                };
                self.on_schema(&cols)?;
                Ok(None)
            }
            TAG_ROW => {
                let Frame::Row(cols) = Frame::decode(buf)? else {
                    unreachable!("tag routed to row arm");
                };
                Ok(Some(StreamItem::Row(self.on_row(cols)?)))
            }
            TAG_COMMAND_DONE => {
                let Frame::CommandDone(tag) = Frame::decode(buf)? else {
                    unreachable!("tag routed to command arm");
                };
                self.command_tags.push(tag);
                Ok(None)
            }
            TAG_ASYNC_EVENT => {
                let Frame::AsyncEvent(payload) = Frame::decode(buf)? else {
                    unreachable!("tag routed to async arm");
                };
                Ok(Some(StreamItem::AsyncEvent(payload)))
            }
            TAG_READY => {
                self.complete = true;
                Ok(None)
            }
            t if COPY_TAGS.contains(&t) => Err(TaskError::Protocol(
                "COPY subprotocol not allowed on the result channel".into(),
            )),
            other => {
                warn!(pid = self.pid, tag = %(other as char), len = buf.len(), "unknown frame tag, skipping");
                Ok(None)
            }
        }
    }

    fn on_schema(&mut self, cols: &[ColumnDesc]) -> TaskResult<()> {
        if self.saw_schema {
            return Err(TaskError::Protocol("multiple schema frames".into()));
        }
        self.saw_schema = true;

        if cols.len() != self.expected.len() {
            return Err(TaskError::Protocol(format!(
                "result schema has {} columns but the caller expected {}",
                cols.len(),
                self.expected.len()
            )));
        }
        for (i, (col, want)) in cols.iter().zip(&self.expected).enumerate() {
            if has_binary_decoder(col.type_code) {
                if col.type_code != want.code() {
                    return Err(TaskError::Protocol(format!(
                        "column {i} ({}) has type code {} but the caller expected {}",
                        col.name,
                        col.type_code,
                        want.code()
                    )));
                }
            } else if *want != ColumnType::Text {
                // No decoder for the producer's type; only a declared text
                // column can receive it.
                return Err(TaskError::Protocol(format!(
                    "column {i} ({}) has no binary decoder for type code {}; declare it as text",
                    col.name, col.type_code
                )));
            }
        }
        Ok(())
    }

    fn on_row(&mut self, cols: Vec<Option<Vec<u8>>>) -> TaskResult<Vec<Value>> {
        if !self.saw_schema {
            return Err(TaskError::Protocol(
                "row frame not preceded by a schema frame".into(),
            ));
        }
        if cols.len() != self.expected.len() {
            return Err(TaskError::Protocol(format!(
                "malformed row: {} columns, schema announced {}",
                cols.len(),
                self.expected.len()
            )));
        }
        cols.into_iter()
            .zip(&self.expected)
            .map(|(col, ty)| match col {
                None => Ok(Value::Null),
                Some(bytes) => decode_value(*ty, &bytes),
            })
            .collect()
    }

    /// Finish the stream after the channel is exhausted.
    ///
    /// Fails with `ConnectionLost` if no `Ready` frame was observed. When
    /// the worker produced no result set at all, synthesizes exactly one
    /// row carrying the last completion tag, provided the caller asked for
    /// a single text column. A stream with neither a result set nor any
    /// completion tag yields no row at all: the task ran and did nothing
    /// reportable.
    pub fn finish(self) -> TaskResult<Option<Vec<Value>>> {
        if !self.complete {
            return Err(TaskError::ConnectionLost { pid: self.pid });
        }
        if self.saw_schema {
            return Ok(None);
        }
        if self.expected != [ColumnType::Text] {
            return Err(TaskError::Protocol(
                "worker did not return a result set, but the expected shape is not a single text column"
                    .into(),
            ));
        }
        Ok(self
            .command_tags
            .last()
            .map(|tag| vec![Value::Text(tag.clone())]))
    }
}
