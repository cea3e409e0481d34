//! Wire vocabulary shared by the requester and responder.
//!
//! Request frames:  `{rid, method, path?, ...}`
//! Response frames: `{rid, stream: "open"|"closed", updates?, columns?, meta?, error?}`
//! Subscription delivery rides on `rid 0`.

use crate::error::{DsError, ProtocolError, Result};

use super::value::Value;

pub const STREAM_OPEN: &str = "open";
pub const STREAM_CLOSED: &str = "closed";

/// RID reserved for unsolicited subscription updates.
pub const SUBSCRIPTION_RID: u32 = 0;

pub fn rid_of(frame: &Value) -> Result<u32> {
    frame
        .get("rid")
        .ok_or(ProtocolError::MissingField("rid"))?
        .as_u32()
        .ok_or_else(|| ProtocolError::InvalidField("rid").into())
}

/// `true` if the frame carries `stream: "closed"`.
pub fn is_closed(frame: &Value) -> bool {
    frame.get("stream").and_then(Value::as_str) == Some(STREAM_CLOSED)
}

pub fn response(rid: u32, stream: &str) -> Value {
    Value::map().with("rid", rid).with("stream", stream)
}

pub fn closed_response(rid: u32) -> Value {
    response(rid, STREAM_CLOSED)
}

pub fn error_response(rid: u32, error: &DsError) -> Value {
    closed_response(rid).with("error", error.to_value())
}

pub fn request(rid: u32, method: &str) -> Value {
    Value::map().with("rid", rid).with("method", method)
}

pub fn close_request(rid: u32) -> Value {
    request(rid, "close")
}

// ── Invoke updates ───────────────────────────────────────────

/// How an invoke update applies to the requester's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeMode {
    Append,
    Refresh,
    Stream,
    /// Insert rows before the given index.
    Insert(usize),
    /// Replace rows `start..=end`.
    Replace(usize, usize),
}

impl InvokeMode {
    /// Everything but a plain append starts a new frame.
    pub fn is_mode_change(self) -> bool {
        self != Self::Append
    }

    /// The `meta` object announcing this mode, if any.
    pub fn to_meta(self) -> Option<Value> {
        match self {
            Self::Append => None,
            Self::Refresh => Some(Value::map().with("mode", "refresh")),
            Self::Stream => Some(Value::map().with("mode", "stream")),
            Self::Insert(at) => Some(Value::map().with("modify", format!("insert {at}"))),
            Self::Replace(a, b) => Some(Value::map().with("modify", format!("replace {a}-{b}"))),
        }
    }

    /// Parse a response `meta` object. Unknown or absent means append.
    pub fn from_meta(meta: Option<&Value>) -> Self {
        let Some(meta) = meta else {
            return Self::Append;
        };
        if let Some(modify) = meta.get("modify").and_then(Value::as_str) {
            if let Some(at) = modify.strip_prefix("insert ") {
                if let Ok(at) = at.trim().parse() {
                    return Self::Insert(at);
                }
            } else if let Some(range) = modify.strip_prefix("replace ") {
                if let Some((a, b)) = range.trim().split_once('-') {
                    if let (Ok(a), Ok(b)) = (a.parse(), b.parse()) {
                        return Self::Replace(a, b);
                    }
                }
            }
        }
        match meta.get("mode").and_then(Value::as_str) {
            Some("refresh") => Self::Refresh,
            Some("stream") => Self::Stream,
            _ => Self::Append,
        }
    }
}

/// One batch of invoke rows. Each row is a `Value::List`.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeUpdate {
    pub mode: InvokeMode,
    pub rows: Vec<Value>,
}

impl InvokeUpdate {
    pub fn new(mode: InvokeMode, rows: Vec<Vec<Value>>) -> Self {
        Self {
            mode,
            rows: rows.into_iter().map(Value::List).collect(),
        }
    }

    pub fn size_hint(&self) -> usize {
        self.rows.iter().map(|r| r.size_hint() + 1).sum()
    }
}

// ── List updates ─────────────────────────────────────────────

/// One row of a list response.
#[derive(Debug, Clone, PartialEq)]
pub enum ListUpdate {
    /// `$`/`@` metadata of the listed node: `[name, value]`.
    Attribute { name: String, value: Value },
    /// A child and its summary: `[name, {summary}]`.
    Child { name: String, summary: Value },
    /// `{"name": name, "change": "remove"}`.
    Removed { name: String },
}

impl ListUpdate {
    pub fn to_row(&self) -> Value {
        match self {
            Self::Attribute { name, value } => Value::list().push(name.as_str()).push(value.clone()),
            Self::Child { name, summary } => Value::list().push(name.as_str()).push(summary.clone()),
            Self::Removed { name } => Value::map()
                .with("name", name.as_str())
                .with("change", "remove"),
        }
    }

    pub fn from_row(row: &Value) -> Result<Self> {
        if let Some(items) = row.as_list() {
            let name = items
                .first()
                .and_then(Value::as_str)
                .ok_or(ProtocolError::MissingField("name"))?
                .to_string();
            let value = items.get(1).cloned().unwrap_or_default();
            return Ok(if name.starts_with('$') || name.starts_with('@') {
                Self::Attribute { name, value }
            } else {
                Self::Child {
                    name,
                    summary: value,
                }
            });
        }
        let name = row
            .get("name")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("name"))?;
        match row.get("change").and_then(Value::as_str) {
            Some("remove") => Ok(Self::Removed {
                name: name.to_string(),
            }),
            _ => Err(ProtocolError::InvalidField("change").into()),
        }
    }
}

// ── Subscription values ──────────────────────────────────────

/// A value delivered for a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueUpdate {
    pub value: Value,
    pub ts: Option<String>,
    pub status: Option<String>,
}

impl ValueUpdate {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            ts: None,
            status: None,
        }
    }

    pub fn at(mut self, ts: impl Into<String>) -> Self {
        self.ts = Some(ts.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Encode as a `rid 0` update row. The compact list form is used when
    /// there is no status.
    pub fn to_row(&self, sid: u32) -> Value {
        match &self.status {
            None => Value::list()
                .push(sid)
                .push(self.value.clone())
                .push(self.ts.clone()),
            Some(status) => Value::map()
                .with("sid", sid)
                .with("value", self.value.clone())
                .with("ts", self.ts.clone())
                .with("status", status.as_str()),
        }
    }

    /// Decode a `rid 0` update row: `[sid, value, ts]` or
    /// `{sid, value, ts, status}`.
    pub fn from_row(row: &Value) -> Result<(u32, Self)> {
        if let Some(items) = row.as_list() {
            let sid = items
                .first()
                .and_then(Value::as_u32)
                .ok_or(ProtocolError::MissingField("sid"))?;
            let value = items.get(1).cloned().unwrap_or_default();
            let ts = items.get(2).and_then(Value::as_str).map(str::to_string);
            return Ok((sid, Self { value, ts, status: None }));
        }
        if row.as_map().is_some() {
            let sid = row
                .get("sid")
                .and_then(Value::as_u32)
                .ok_or(ProtocolError::MissingField("sid"))?;
            return Ok((
                sid,
                Self {
                    value: row.get("value").cloned().unwrap_or_default(),
                    ts: row.get("ts").and_then(Value::as_str).map(str::to_string),
                    status: row.get("status").and_then(Value::as_str).map(str::to_string),
                },
            ));
        }
        Err(ProtocolError::InvalidField("updates").into())
    }
}
