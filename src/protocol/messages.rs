use bytes::Buf;

use crate::error::{Result, StreamerError};

/// Fields of an ErrorResponse / NoticeResponse that are worth keeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ErrorFields {
    pub fn parse(payload: &[u8]) -> ErrorFields {
        // fields: (code_byte, cstring) ... 0
        let mut out = ErrorFields::default();
        let mut b = payload;
        while let Some((&code, rest)) = b.split_first() {
            if code == 0 {
                break;
            }
            let Some(pos) = rest.iter().position(|&x| x == 0) else {
                break;
            };
            let s = String::from_utf8_lossy(&rest[..pos]).into_owned();
            match code {
                b'S' => out.severity = Some(s),
                b'C' => out.code = Some(s),
                b'M' => out.message = Some(s),
                b'D' => out.detail = Some(s),
                b'H' => out.hint = Some(s),
                _ => {}
            }
            b = &rest[pos + 1..];
        }
        out
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.message, &self.code) {
            (Some(m), Some(c)) => write!(f, "{m} (SQLSTATE {c})"),
            (Some(m), None) => f.write_str(m),
            _ => f.write_str("unknown server error"),
        }
    }
}

pub fn parse_error_response(payload: &[u8]) -> String {
    ErrorFields::parse(payload).to_string()
}

pub fn parse_auth_request(payload: &[u8]) -> Result<(i32, &[u8])> {
    if payload.len() < 4 {
        return Err(StreamerError::Protocol("auth request too short".into()));
    }
    let mut b = payload;
    let code = b.get_i32();
    Ok((code, b))
}

/// Column names from a RowDescription ('T').
pub fn parse_row_description(payload: &[u8]) -> Result<Vec<String>> {
    let mut b = payload;
    if b.remaining() < 2 {
        return Err(StreamerError::Protocol("RowDescription too short".into()));
    }
    let count = b.get_i16().max(0) as usize;
    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        let pos = b
            .iter()
            .position(|&x| x == 0)
            .ok_or_else(|| StreamerError::Protocol("RowDescription name unterminated".into()))?;
        names.push(String::from_utf8_lossy(&b[..pos]).into_owned());
        b = &b[pos + 1..];
        // table oid(4) attnum(2) type oid(4) typlen(2) typmod(4) format(2)
        if b.remaining() < 18 {
            return Err(StreamerError::Protocol("RowDescription field truncated".into()));
        }
        b.advance(18);
    }
    Ok(names)
}

/// Text values from a DataRow ('D').
pub fn parse_data_row(payload: &[u8]) -> Result<Vec<Option<String>>> {
    let mut b = payload;
    if b.remaining() < 2 {
        return Err(StreamerError::Protocol("DataRow too short".into()));
    }
    let count = b.get_i16().max(0) as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        if b.remaining() < 4 {
            return Err(StreamerError::Protocol("DataRow column truncated".into()));
        }
        let len = b.get_i32();
        if len < 0 {
            values.push(None);
            continue;
        }
        let len = len as usize;
        if b.remaining() < len {
            return Err(StreamerError::Protocol("DataRow value truncated".into()));
        }
        values.push(Some(String::from_utf8_lossy(&b[..len]).into_owned()));
        b.advance(len);
    }
    Ok(values)
}
