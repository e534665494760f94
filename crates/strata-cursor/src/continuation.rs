use bson::RawBson;
use bson::raw::{RawBsonRef, RawDocumentBuf};

use strata_bson::{ArrayWriter, DocumentWriter};

use crate::error::CursorError;

/// Opaque continuation carried by the client between getMore calls on a
/// streamable cursor.
///
/// Shape: `{primaryKey: <id>, tableContinuations: [{table, cursorState}],
/// params: {...}}`. Clients must echo it untouched; the decode path
/// validates structure, not meaning.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationToken {
    /// `_id` of the last row the client received.
    pub primary_key: Option<RawBson>,
    pub tables: Vec<TableContinuation>,
    /// Free-form parameters the planner stashed (parameterized-query
    /// bindings).
    pub params: Option<RawDocumentBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableContinuation {
    pub table: String,
    /// Substrate-specific resume position, opaque at this layer.
    pub cursor_state: Vec<u8>,
}

impl ContinuationToken {
    pub fn encode(&self) -> RawDocumentBuf {
        let mut w = DocumentWriter::new();
        if let Some(pk) = &self.primary_key {
            w.append("primaryKey", pk.clone());
        }
        let mut tables = ArrayWriter::new();
        for t in &self.tables {
            let mut entry = DocumentWriter::new();
            entry.append("table", t.table.as_str());
            entry.append(
                "cursorState",
                RawBson::Binary(bson::Binary {
                    subtype: bson::spec::BinarySubtype::Generic,
                    bytes: t.cursor_state.clone(),
                }),
            );
            tables.push_document(entry);
        }
        w.append_array("tableContinuations", tables);
        if let Some(params) = &self.params {
            w.append_raw_document("params", params);
        }
        w.into_buf()
    }

    pub fn decode(doc: &bson::RawDocument) -> Result<Self, CursorError> {
        let mut primary_key = None;
        let mut tables = Vec::new();
        let mut params = None;

        for entry in doc.iter() {
            let (key, value) = entry?;
            match key {
                "primaryKey" => primary_key = Some(value.to_raw_bson()),
                "tableContinuations" => {
                    let RawBsonRef::Array(arr) = value else {
                        return Err(CursorError::BadContinuation(
                            "tableContinuations must be an array".into(),
                        ));
                    };
                    for elem in arr {
                        let RawBsonRef::Document(t) = elem? else {
                            return Err(CursorError::BadContinuation(
                                "table continuation must be a document".into(),
                            ));
                        };
                        tables.push(decode_table(t)?);
                    }
                }
                "params" => {
                    let RawBsonRef::Document(p) = value else {
                        return Err(CursorError::BadContinuation(
                            "params must be a document".into(),
                        ));
                    };
                    params = Some(p.to_raw_document_buf());
                }
                other => {
                    return Err(CursorError::BadContinuation(format!(
                        "unknown continuation field '{other}'"
                    )));
                }
            }
        }
        Ok(Self {
            primary_key,
            tables,
            params,
        })
    }
}

fn decode_table(doc: &bson::RawDocument) -> Result<TableContinuation, CursorError> {
    let mut table = None;
    let mut cursor_state = None;
    for entry in doc.iter() {
        let (key, value) = entry?;
        match (key, value) {
            ("table", RawBsonRef::String(name)) => table = Some(name.to_string()),
            ("cursorState", RawBsonRef::Binary(bin)) => {
                cursor_state = Some(bin.bytes.to_vec());
            }
            (other, _) => {
                return Err(CursorError::BadContinuation(format!(
                    "unknown or badly typed table-continuation field '{other}'"
                )));
            }
        }
    }
    match (table, cursor_state) {
        (Some(table), Some(cursor_state)) => Ok(TableContinuation {
            table,
            cursor_state,
        }),
        _ => Err(CursorError::BadContinuation(
            "table continuation needs 'table' and 'cursorState'".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let token = ContinuationToken {
            primary_key: Some(RawBson::Int64(42)),
            tables: vec![TableContinuation {
                table: "db.items".into(),
                cursor_state: vec![1, 2, 3, 0, 255],
            }],
            params: Some(bson::rawdoc! { "p1": 7 }),
        };
        let encoded = token.encode();
        let decoded = ContinuationToken::decode(&encoded).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn empty_token_round_trips() {
        let token = ContinuationToken {
            primary_key: None,
            tables: Vec::new(),
            params: None,
        };
        let decoded = ContinuationToken::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn unknown_fields_rejected() {
        let doc = bson::rawdoc! { "surprise": 1 };
        assert!(matches!(
            ContinuationToken::decode(&doc),
            Err(CursorError::BadContinuation(_))
        ));
    }

    #[test]
    fn table_entry_must_be_complete() {
        let doc = bson::rawdoc! {
            "tableContinuations": [ { "table": "t" } ]
        };
        assert!(ContinuationToken::decode(&doc).is_err());
    }
}
