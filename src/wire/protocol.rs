//! Wire types and the resultset body encoder shared by the worker path
//! (real query results) and the control-verb path (synthetic Name/Value
//! stats resultsets). See `squalejob.c`'s
//! `squale_job_resultset_from_hash_foreach` / `squale_job_complete_from_hashtable`
//! for the layout this mirrors.

use bytes::{BufMut, Bytes, BytesMut};

/// One request: a pool name followed by a query string, each framed as
/// `int32 LE length + bytes` on the wire. A connection sends exactly one
/// of these before the server starts processing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub pool: String,
    pub query: String,
}

/// The reply to a completed job, carrying the assignation/processing
/// timings that only become known once the job finishes, behind a reserved
/// 9-byte header: two `int32 LE` timings plus a one-byte kind tag.
#[derive(Clone, Debug)]
pub enum Reply {
    Rows { assign_ms: i32, process_ms: i32, warning: bool, body: Bytes },
    Affected { assign_ms: i32, process_ms: i32, rows: u64 },
    Error { assign_ms: i32, process_ms: i32, message: String },
}

const KIND_ROWS: u8 = b'R';
const KIND_ROWS_WARNING: u8 = b'W';
const KIND_AFFECTED: u8 = b'A';
const KIND_ERROR: u8 = b'E';

/// Packs a resultset body: `int32 LE` field count, then for each field an
/// `int32 LE` length + name bytes, then a `u64 LE` row count, then for
/// each row and each cell an `int32 LE` length (`-1` for SQL NULL) + cell
/// bytes. If `warning` is given its length and bytes are appended after
/// the last row, mirroring the original's practice of growing the same
/// buffer rather than framing the warning separately.
pub fn encode_rows(fields: &[String], rows: &[Vec<Option<Vec<u8>>>], warning: Option<&str>) -> Bytes {
    let mut buf = BytesMut::new();

    buf.put_i32_le(fields.len() as i32);
    for field in fields {
        buf.put_i32_le(field.len() as i32);
        buf.put_slice(field.as_bytes());
    }

    buf.put_u64_le(rows.len() as u64);
    for row in rows {
        for cell in row {
            match cell {
                Some(bytes) => {
                    buf.put_i32_le(bytes.len() as i32);
                    buf.put_slice(bytes);
                },
                None => buf.put_i32_le(-1),
            }
        }
    }

    if let Some(warning) = warning {
        buf.put_i32_le(warning.len() as i32);
        buf.put_slice(warning.as_bytes());
    }

    buf.freeze()
}

impl Reply {
    /// Serializes the full reply, including the 9-byte timing/kind header,
    /// into `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        match self {
            Reply::Rows { assign_ms, process_ms, warning, body } => {
                dst.reserve(9 + body.len());
                dst.put_i32_le(*assign_ms);
                dst.put_i32_le(*process_ms);
                dst.put_u8(if *warning { KIND_ROWS_WARNING } else { KIND_ROWS });
                dst.put_slice(body);
            },
            Reply::Affected { assign_ms, process_ms, rows } => {
                dst.reserve(9 + 4);
                dst.put_i32_le(*assign_ms);
                dst.put_i32_le(*process_ms);
                dst.put_u8(KIND_AFFECTED);
                dst.put_i32_le(*rows as i32);
            },
            Reply::Error { assign_ms, process_ms, message } => {
                dst.reserve(9 + 4 + message.len());
                dst.put_i32_le(*assign_ms);
                dst.put_i32_le(*process_ms);
                dst.put_u8(KIND_ERROR);
                dst.put_i32_le(message.len() as i32);
                dst.put_slice(message.as_bytes());
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    #[test]
    fn encode_rows_round_trips_field_count_and_row_count() {
        let fields = vec!["Name".to_string(), "Value".to_string()];
        let rows = vec![vec![Some(b"a".to_vec()), Some(b"1".to_vec())]];
        let body = encode_rows(&fields, &rows, None);
        let mut buf = body.clone();
        assert_eq!(buf.get_i32_le(), 2);
        let len = buf.get_i32_le() as usize;
        assert_eq!(&buf.copy_to_bytes(len)[..], b"Name");
    }

    #[test]
    fn encode_rows_marks_null_cells_with_negative_length() {
        let fields = vec!["c".to_string()];
        let rows = vec![vec![None]];
        let body = encode_rows(&fields, &rows, None);
        let mut buf = body.clone();
        let _field_count = buf.get_i32_le();
        let _field_len = buf.get_i32_le();
        buf.advance(1); // "c"
        let _row_count = buf.get_u64_le();
        assert_eq!(buf.get_i32_le(), -1);
    }

    #[test]
    fn reply_affected_header_matches_kind_byte() {
        let reply = Reply::Affected { assign_ms: 5, process_ms: 7, rows: 3 };
        let mut dst = BytesMut::new();
        reply.write_to(&mut dst);
        assert_eq!(dst[8], b'A');
        let mut buf = dst.freeze();
        assert_eq!(buf.get_i32_le(), 5);
        assert_eq!(buf.get_i32_le(), 7);
        assert_eq!(buf.get_u8(), b'A');
        assert_eq!(buf.get_i32_le(), 3);
    }
}
