//! Wire payloads to and from tables: CSV, Matrix Market, multipart transform
//! responses, server-sent chat events and raw unstructured bodies.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use uuid::Uuid;

use crate::error::AdapterError;
use crate::error::Result;
use crate::table::Table;

pub const X_FORMAT_KEY: &str = "X.format";
pub const X_TRANSFORM_KEY: &str = "X.transformed";
pub const Y_FORMAT_KEY: &str = "y.format";
pub const Y_TRANSFORM_KEY: &str = "y.transformed";
pub const SPARSE_COLNAMES: &str = "X.colnames";

pub mod mimetypes {
    pub const APPLICATION_JSON: &str = "application/json";
    pub const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const TEXT_MTX: &str = "text/mtx";
    pub const TEXT_CSV: &str = "text/csv";
    pub const TEXT_EVENT_STREAM: &str = "text/event-stream";
}

const DEFAULT_CHARSET: &str = "utf8";
/// Upper bound on the dense cells a sparse payload may expand to.
const MTX_MAX_CELLS: usize = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    Csv,
    Mtx,
}

impl PayloadFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Mtx => "mtx",
        }
    }

    /// Payload format a request mimetype maps to, if any.
    pub fn from_mimetype(mimetype: &str) -> Option<Self> {
        match mimetype {
            ""
            | mimetypes::TEXT_CSV
            | mimetypes::TEXT_PLAIN
            | mimetypes::APPLICATION_OCTET_STREAM => Some(Self::Csv),
            mimetypes::TEXT_MTX => Some(Self::Mtx),
            _ => None,
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload formats a model accepts, each with an optional format version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupportedPayloadFormats {
    formats: BTreeMap<PayloadFormat, Option<String>>,
}

impl SupportedPayloadFormats {
    pub fn add(&mut self, format: PayloadFormat) {
        self.formats.insert(format, None);
    }

    pub fn add_versioned(&mut self, format: PayloadFormat, version: impl Into<String>) {
        self.formats.insert(format, Some(version.into()));
    }

    pub fn contains(&self, format: PayloadFormat) -> bool {
        self.formats.contains_key(&format)
    }

    pub fn is_mimetype_supported(&self, mimetype: &str) -> bool {
        PayloadFormat::from_mimetype(mimetype).is_some_and(|format| self.contains(format))
    }

    pub fn iter(&self) -> impl Iterator<Item = (PayloadFormat, Option<&str>)> {
        self.formats
            .iter()
            .map(|(format, version)| (*format, version.as_deref()))
    }

    /// `{"csv": null, "mtx": null}` style map for capability responses.
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .iter()
            .map(|(format, version)| (format.to_string(), json!(version)))
            .collect();
        Value::Object(map)
    }
}

/// Mimetype implied by an uploaded file's name.
pub fn resolve_mimetype_by_filename(filename: Option<&str>) -> &'static str {
    match filename {
        Some(name) if name.to_ascii_lowercase().ends_with(".mtx") => mimetypes::TEXT_MTX,
        _ => mimetypes::TEXT_CSV,
    }
}

/// Split a `Content-Type` header into its mimetype and charset.
pub fn parse_content_type(header: Option<&str>) -> (String, Option<String>) {
    let Some(header) = header else {
        return (String::new(), None);
    };
    let mut parts = header.split(';');
    let mimetype = parts
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let charset = parts
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty());
    (mimetype, charset)
}

/// Decode a structured request body into a table.
pub fn decode_structured(
    bytes: &[u8],
    mimetype: &str,
    sparse_colnames: Option<&[String]>,
) -> Result<Table> {
    match PayloadFormat::from_mimetype(mimetype) {
        Some(PayloadFormat::Csv) => decode_csv(bytes),
        Some(PayloadFormat::Mtx) => {
            let colnames = sparse_colnames.ok_or_else(|| {
                AdapterError::payload(format!(
                    "Sparse (mtx) payloads require column names under `{SPARSE_COLNAMES}`"
                ))
            })?;
            decode_mtx(bytes, colnames)
        }
        None => Err(AdapterError::payload(format!(
            "Unsupported payload format `{mimetype}`"
        ))),
    }
}

fn decode_csv(bytes: &[u8]) -> Result<Table> {
    let invalid =
        |err: csv::Error| AdapterError::payload(format!("failed to read CSV payload: {err}"));
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(bytes);
    let names: Vec<String> = reader
        .headers()
        .map_err(invalid)?
        .iter()
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        return Ok(Table::empty());
    }

    let mut rows: Vec<Vec<Value>> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(invalid)?;
        rows.push(record.iter().map(parse_cell).collect());
    }
    Table::from_rows(names, rows).map_err(|err| AdapterError::payload(err.to_string()))
}

fn parse_cell(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(integer) = cell.parse::<i64>() {
        return Value::from(integer);
    }
    match cell.parse::<f64>() {
        Ok(float) if float.is_finite() => Value::from(float),
        _ => Value::String(cell.to_string()),
    }
}

/// Matrix Market coordinate payload; `colnames` names the columns.
fn decode_mtx(bytes: &[u8], colnames: &[String]) -> Result<Table> {
    let text = std::str::from_utf8(bytes)
        .map_err(|err| AdapterError::payload(format!("mtx payload is not valid UTF-8: {err}")))?;
    let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());

    let banner = lines
        .next()
        .ok_or_else(|| AdapterError::payload("empty mtx payload"))?;
    let banner_lower = banner.to_ascii_lowercase();
    if !banner_lower.starts_with("%%matrixmarket") || !banner_lower.contains("coordinate") {
        return Err(AdapterError::payload(
            "mtx payload must be a Matrix Market coordinate matrix",
        ));
    }
    let pattern = banner_lower.contains("pattern");

    let mut lines = lines.filter(|line| !line.starts_with('%'));
    let size = lines
        .next()
        .ok_or_else(|| AdapterError::payload("mtx payload is missing its size line"))?;
    let dims = parse_usizes(size)?;
    let &[rows, cols, nnz] = dims.as_slice() else {
        return Err(AdapterError::payload(format!("invalid mtx size line '{size}'")));
    };

    if cols != colnames.len() {
        return Err(AdapterError::payload(format!(
            "mtx payload has {cols} columns but {} column names were provided",
            colnames.len()
        )));
    }

    match rows.checked_mul(cols) {
        Some(cells) if cells <= MTX_MAX_CELLS => {}
        _ => {
            return Err(AdapterError::payload(format!(
                "mtx payload of {rows} x {cols} exceeds the limit of {MTX_MAX_CELLS} cells"
            )));
        }
    }

    let mut columns = vec![vec![0.0_f64; rows]; cols];
    let mut seen = 0;
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (row, col, value) = match fields.as_slice() {
            [row, col] if pattern => (*row, *col, "1"),
            [row, col, value, ..] => (*row, *col, *value),
            _ => return Err(AdapterError::payload(format!("invalid mtx entry '{line}'"))),
        };
        let row: usize = parse_index(row, rows)?;
        let col: usize = parse_index(col, cols)?;
        let value: f64 = value
            .parse()
            .map_err(|_| AdapterError::payload(format!("invalid mtx value '{value}'")))?;
        columns[col][row] = value;
        seen += 1;
    }
    if seen != nnz {
        return Err(AdapterError::payload(format!(
            "mtx payload declares {nnz} entries but contains {seen}"
        )));
    }

    let columns = columns
        .into_iter()
        .map(|values| values.into_iter().map(Value::from).collect::<Vec<Value>>());
    let table = Table::from_columns(colnames.iter().cloned().zip(columns))?;
    Ok(table.with_sparse(true))
}

fn parse_usizes(line: &str) -> Result<Vec<usize>> {
    line.split_whitespace()
        .map(|field| {
            field
                .parse::<usize>()
                .map_err(|_| AdapterError::payload(format!("invalid mtx size line '{line}'")))
        })
        .collect()
}

fn parse_index(field: &str, bound: usize) -> Result<usize> {
    match field.parse::<usize>() {
        Ok(index) if index >= 1 && index <= bound => Ok(index - 1),
        _ => Err(AdapterError::payload(format!(
            "mtx index '{field}' is out of range 1..={bound}"
        ))),
    }
}

/// Newline separated column names sent alongside sparse payloads.
pub fn read_sparse_column_names(bytes: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(bytes).map_err(|err| {
        AdapterError::payload(format!("{SPARSE_COLNAMES} is not valid UTF-8: {err}"))
    })?;
    Ok(text.lines().map(|line| line.trim().to_string()).collect())
}

/// Make column names safe to round-trip through CSV and column-name files.
pub fn sanitize_column_names(table: &Table) -> Result<Table> {
    let mut sanitized = table.clone();
    let names: Vec<String> = table.column_names().into_iter().map(str::to_string).collect();
    let cleaned: Vec<String> = names
        .iter()
        .map(|name| name.trim().replace('\n', "\\n"))
        .collect();
    let kept = cleaned.iter().filter(|name| !name.is_empty()).count();
    if kept != names.len() {
        return Err(AdapterError::serialization(format!(
            "Column name serialization check failed, deserializing column names resulted in \
             {kept}, expected {}. Ensure there are no column names made up entirely of whitespace",
            names.len()
        )));
    }
    for (old, new) in names.iter().zip(cleaned) {
        if *old != new {
            sanitized.rename_column(old, new)?;
        }
    }
    Ok(sanitized)
}

/// JSON body of a structured prediction response.
pub fn encode_predictions_json(predictions: &Table, extra: Option<&Table>) -> Value {
    let rows = match predictions.columns() {
        [single] => Value::Array(single.values.clone()),
        _ => Value::Array(
            predictions
                .records()
                .into_iter()
                .map(Value::Object)
                .collect(),
        ),
    };
    let mut body = Map::new();
    body.insert("predictions".to_string(), rows);
    if let Some(extra) = extra {
        body.insert("extraModelOutput".to_string(), split_orientation(extra));
    }
    Value::Object(body)
}

fn split_orientation(table: &Table) -> Value {
    json!({
        "columns": table.column_names(),
        "index": (0..table.num_rows()).collect::<Vec<_>>(),
        "data": table.rows(),
    })
}

/// CSV with CRLF row separators and no trailing terminator.
pub fn make_csv_payload(table: &Table) -> Result<Vec<u8>> {
    let table = sanitize_column_names(table)?;
    let failed =
        |err: csv::Error| AdapterError::serialization(format!("failed to write CSV: {err}"));
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new());
    writer.write_record(table.column_names()).map_err(failed)?;
    for row in table.rows() {
        writer
            .write_record(row.iter().map(render_cell))
            .map_err(failed)?;
    }
    let mut bytes = writer
        .into_inner()
        .map_err(|err| AdapterError::serialization(format!("failed to flush CSV: {err}")))?;
    if bytes.ends_with(b"\r\n") {
        bytes.truncate(bytes.len() - 2);
    }
    Ok(bytes)
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        other => other.to_string(),
    }
}

/// Coordinate matrix body plus the newline-joined column names.
pub fn make_mtx_payload(table: &Table) -> Result<(Vec<u8>, String)> {
    let table = sanitize_column_names(table)?;
    let mut entries = Vec::new();
    for (col, column) in table.columns().iter().enumerate() {
        for (row, cell) in column.values.iter().enumerate() {
            let value = match cell {
                Value::Null => 0.0,
                other => other.as_f64().ok_or_else(|| {
                    AdapterError::serialization(format!(
                        "sparse output column '{}' holds a non-numeric value",
                        column.name
                    ))
                })?,
            };
            if value != 0.0 {
                entries.push((row + 1, col + 1, value));
            }
        }
    }
    entries.sort_by_key(|(row, col, _)| (*col, *row));

    let mut body = String::from("%%MatrixMarket matrix coordinate real general\n%\n");
    body.push_str(&format!(
        "{} {} {}\n",
        table.num_rows(),
        table.num_columns(),
        entries.len()
    ));
    for (row, col, value) in entries {
        body.push_str(&format!("{row} {col} {value}\n"));
    }
    Ok((body.into_bytes(), table.column_names().join("\n")))
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultipartPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// A `multipart/form-data` body.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartBody {
    boundary: String,
    parts: Vec<MultipartPart>,
}

impl Default for MultipartBody {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartBody {
    pub fn new() -> Self {
        Self {
            boundary: Uuid::new_v4().simple().to_string(),
            parts: Vec::new(),
        }
    }

    pub fn text(&mut self, name: &str, value: &str) {
        self.parts.push(MultipartPart {
            name: name.to_string(),
            filename: None,
            content_type: None,
            data: value.as_bytes().to_vec(),
        });
    }

    pub fn file(&mut self, name: &str, data: Vec<u8>, content_type: &str) {
        self.parts.push(MultipartPart {
            name: name.to_string(),
            filename: Some(name.to_string()),
            content_type: Some(content_type.to_string()),
            data,
        });
    }

    pub fn parts(&self) -> &[MultipartPart] {
        &self.parts
    }

    pub fn part(&self, name: &str) -> Option<&MultipartPart> {
        self.parts.iter().find(|part| part.name == name)
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for part in &self.parts {
            out.extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
            let mut disposition = format!("Content-Disposition: form-data; name=\"{}\"", part.name);
            if let Some(filename) = &part.filename {
                disposition.push_str(&format!("; filename=\"{filename}\""));
            }
            out.extend_from_slice(disposition.as_bytes());
            out.extend_from_slice(b"\r\n");
            if let Some(content_type) = &part.content_type {
                out.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&part.data);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        out
    }
}

/// Multipart body of a transform response. Sparse features travel as a
/// coordinate matrix plus a column-name part; the target is always CSV.
pub fn encode_transform_response(
    features: &Table,
    target: Option<&Table>,
) -> Result<MultipartBody> {
    let mut body = MultipartBody::new();
    if features.is_sparse() {
        let (payload, colnames) = make_mtx_payload(features)?;
        body.text(X_FORMAT_KEY, "sparse");
        body.file(X_TRANSFORM_KEY, payload, mimetypes::APPLICATION_OCTET_STREAM);
        body.file(
            SPARSE_COLNAMES,
            colnames.into_bytes(),
            mimetypes::APPLICATION_OCTET_STREAM,
        );
    } else {
        body.text(X_FORMAT_KEY, "csv");
        body.file(
            X_TRANSFORM_KEY,
            make_csv_payload(features)?,
            mimetypes::APPLICATION_OCTET_STREAM,
        );
    }
    if let Some(target) = target {
        body.text(Y_FORMAT_KEY, "csv");
        body.file(
            Y_TRANSFORM_KEY,
            make_csv_payload(target)?,
            mimetypes::APPLICATION_OCTET_STREAM,
        );
    }
    Ok(body)
}

/// Server-sent event framing for a chunk stream.
pub struct SseEvents<I> {
    inner: I,
    finished: bool,
}

/// Frame each chunk as `data: <json>` and close with `data: [DONE]`. An
/// error ends the event stream without the terminal marker.
pub fn sse_events<I>(stream: I) -> SseEvents<I>
where
    I: Iterator<Item = Result<Value>>,
{
    SseEvents {
        inner: stream,
        finished: false,
    }
}

impl<I> Iterator for SseEvents<I>
where
    I: Iterator<Item = Result<Value>>,
{
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.inner.next() {
            Some(Ok(chunk)) => Some(
                serde_json::to_string(&chunk)
                    .map(|line| format!("data: {line}\n\n"))
                    .map_err(|err| AdapterError::serialization(err.to_string())),
            ),
            Some(Err(err)) => {
                self.finished = true;
                Some(Err(err))
            }
            None => {
                self.finished = true;
                Some(Ok("data: [DONE]\n\n".to_string()))
            }
        }
    }
}

/// Body handed to (or returned from) an unstructured score hook.
#[derive(Debug, Clone, PartialEq)]
pub enum UnstructuredData {
    Text(String),
    Bytes(Vec<u8>),
}

/// Everything an unstructured hook sees about the request.
#[derive(Debug, Clone, PartialEq)]
pub struct UnstructuredInput {
    pub data: UnstructuredData,
    pub mimetype: String,
    pub charset: Option<String>,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
}

/// What an unstructured hook returns: optional data plus response options
/// (`mimetype`, `charset`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnstructuredOutput {
    pub data: Option<UnstructuredData>,
    pub kwargs: Option<Map<String, Value>>,
}

impl UnstructuredOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: Some(UnstructuredData::Text(text.into())),
            kwargs: None,
        }
    }

    pub fn bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: Some(UnstructuredData::Bytes(bytes)),
            kwargs: None,
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.kwargs
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }

    fn option(&self, key: &str) -> Option<&str> {
        self.kwargs.as_ref()?.get(key)?.as_str()
    }
}

pub fn is_mimetype_textual(mimetype: &str) -> bool {
    mimetype.starts_with("text/")
        || mimetype == mimetypes::APPLICATION_JSON
        || mimetype.ends_with("+json")
}

/// Decode an incoming unstructured body. Textual mimetypes become text using
/// the request charset (utf8 by default); everything else stays bytes.
pub fn resolve_incoming_unstructured(
    data: Vec<u8>,
    mimetype: &str,
    charset: Option<&str>,
) -> Result<(UnstructuredData, String, Option<String>)> {
    let mimetype = if mimetype.is_empty() {
        mimetypes::TEXT_PLAIN.to_string()
    } else {
        mimetype.to_string()
    };
    if !is_mimetype_textual(&mimetype) {
        return Ok((UnstructuredData::Bytes(data), mimetype, charset.map(str::to_string)));
    }
    let charset = charset.unwrap_or(DEFAULT_CHARSET).to_string();
    let text = decode_text(data, &charset)?;
    Ok((UnstructuredData::Text(text), mimetype, Some(charset)))
}

/// Encode a hook's unstructured reply, returning body, mimetype and charset.
pub fn resolve_outgoing_unstructured(
    output: &UnstructuredOutput,
) -> Result<(Vec<u8>, Option<String>, Option<String>)> {
    let mimetype = output.option("mimetype").map(str::to_string);
    let charset = output.option("charset").map(str::to_string);
    match &output.data {
        Some(UnstructuredData::Text(text)) => {
            let charset = charset.unwrap_or_else(|| DEFAULT_CHARSET.to_string());
            let bytes = encode_text(text, &charset)?;
            Ok((
                bytes,
                Some(mimetype.unwrap_or_else(|| mimetypes::TEXT_PLAIN.to_string())),
                Some(charset),
            ))
        }
        Some(UnstructuredData::Bytes(bytes)) => Ok((
            bytes.clone(),
            Some(mimetype.unwrap_or_else(|| mimetypes::APPLICATION_OCTET_STREAM.to_string())),
            charset,
        )),
        None => Ok((Vec::new(), mimetype, charset)),
    }
}

fn normalize_charset(charset: &str) -> String {
    charset.trim().to_ascii_lowercase().replace(['-', '_'], "")
}

fn decode_text(data: Vec<u8>, charset: &str) -> Result<String> {
    match normalize_charset(charset).as_str() {
        "utf8" | "ascii" | "usascii" => String::from_utf8(data)
            .map_err(|err| AdapterError::payload(format!("payload is not valid {charset}: {err}"))),
        "latin1" | "iso88591" => Ok(data.into_iter().map(char::from).collect()),
        _ => Err(AdapterError::payload(format!("unsupported charset '{charset}'"))),
    }
}

fn encode_text(text: &str, charset: &str) -> Result<Vec<u8>> {
    match normalize_charset(charset).as_str() {
        "utf8" => Ok(text.as_bytes().to_vec()),
        "ascii" | "usascii" if text.is_ascii() => Ok(text.as_bytes().to_vec()),
        "latin1" | "iso88591" => text
            .chars()
            .map(|ch| u8::try_from(u32::from(ch)).ok())
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| {
                AdapterError::serialization(format!("response cannot be encoded as {charset}"))
            }),
        _ => Err(AdapterError::serialization(format!(
            "response cannot be encoded as {charset}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_parsing() {
        assert_eq!(
            parse_content_type(Some("Text/CSV; charset=\"latin-1\"")),
            ("text/csv".to_string(), Some("latin-1".to_string()))
        );
        assert_eq!(parse_content_type(None), (String::new(), None));
        assert_eq!(resolve_mimetype_by_filename(Some("X.MTX")), mimetypes::TEXT_MTX);
        assert_eq!(resolve_mimetype_by_filename(Some("data.csv")), mimetypes::TEXT_CSV);
    }

    #[test]
    fn supported_formats_check_mimetypes() {
        let mut formats = SupportedPayloadFormats::default();
        formats.add(PayloadFormat::Csv);
        assert!(formats.is_mimetype_supported("text/csv"));
        assert!(formats.is_mimetype_supported(""));
        assert!(!formats.is_mimetype_supported("text/mtx"));
        assert!(!formats.is_mimetype_supported("application/x-parquet"));
        formats.add_versioned(PayloadFormat::Mtx, "1");
        assert_eq!(formats.to_json(), json!({"csv": null, "mtx": "1"}));
    }

    #[test]
    fn csv_cells_are_typed() {
        let table = decode_structured(b"a,b,c\n1,x,\n2.5,y,3\n", "text/csv", None).unwrap();
        assert_eq!(table.column_names(), vec!["a", "b", "c"]);
        assert_eq!(table.column("a").unwrap(), &[json!(1), json!(2.5)]);
        assert_eq!(table.column("b").unwrap(), &[json!("x"), json!("y")]);
        assert_eq!(table.column("c").unwrap(), &[Value::Null, json!(3)]);
    }

    #[test]
    fn mtx_requires_column_names() {
        let payload = b"%%MatrixMarket matrix coordinate real general\n%\n2 2 1\n2 1 4.5\n";
        let err = decode_structured(payload, "text/mtx", None).unwrap_err();
        assert!(err.to_string().contains(SPARSE_COLNAMES));

        let names = read_sparse_column_names(b"f1\nf2\n").unwrap();
        let table = decode_structured(payload, "text/mtx", Some(names.as_slice())).unwrap();
        assert!(table.is_sparse());
        assert_eq!(table.column_as_f64("f1"), Some(vec![0.0, 4.5]));
        assert_eq!(table.column_as_f64("f2"), Some(vec![0.0, 0.0]));

        let short = read_sparse_column_names(b"f1").unwrap();
        assert!(decode_structured(payload, "text/mtx", Some(short.as_slice())).is_err());
    }

    #[test]
    fn oversized_mtx_dimensions_are_rejected() {
        let names = vec!["a".to_string()];
        let payload = b"%%MatrixMarket matrix coordinate real general\n18446744073709551615 1 0\n";
        let err = decode_structured(payload, "text/mtx", Some(names.as_slice())).unwrap_err();
        assert!(matches!(err, AdapterError::PayloadFormat { .. }));
        assert!(err.to_string().contains("exceeds the limit"));
    }

    #[test]
    fn unknown_mimetype_is_a_payload_error() {
        let err = decode_structured(b"{}", "application/json", None).unwrap_err();
        assert!(matches!(err, AdapterError::PayloadFormat { .. }));
    }

    #[test]
    fn column_names_are_sanitized() {
        let table = Table::from_columns([(" a\nb ", vec![json!(1)])]).unwrap();
        assert_eq!(sanitize_column_names(&table).unwrap().column_names(), vec!["a\\nb"]);

        let blank = Table::from_columns([("  ", vec![json!(1)])]).unwrap();
        let err = sanitize_column_names(&blank).unwrap_err();
        assert!(matches!(err, AdapterError::Serialization { .. }));
    }

    #[test]
    fn csv_payload_uses_crlf_without_trailing_terminator() {
        let table = Table::from_columns([
            ("a", vec![json!(1), json!(2)]),
            ("b", vec![json!("x"), Value::Null]),
        ])
        .unwrap();
        let payload = make_csv_payload(&table).unwrap();
        assert_eq!(payload, b"a,b\r\n1,x\r\n2,");
    }

    #[test]
    fn mtx_payload_lists_nonzero_entries() {
        let table = Table::from_columns([
            ("f1", vec![json!(0), json!(2.5)]),
            ("f2", vec![json!(1), json!(0)]),
        ])
        .unwrap()
        .with_sparse(true);
        let (payload, colnames) = make_mtx_payload(&table).unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert!(text.starts_with("%%MatrixMarket matrix coordinate real general"));
        assert!(text.contains("2 2 2\n2 1 2.5\n1 2 1\n"));
        assert_eq!(colnames, "f1\nf2");

        let names: Vec<String> = colnames.lines().map(str::to_string).collect();
        let decoded =
            decode_structured(text.as_bytes(), "text/mtx", Some(names.as_slice())).unwrap();
        assert_eq!(decoded.column_as_f64("f1"), Some(vec![0.0, 2.5]));
    }

    #[test]
    fn predictions_json_shapes() {
        let single = Table::single("Predictions", vec![json!(1.5), json!(2.5)]);
        assert_eq!(
            encode_predictions_json(&single, None),
            json!({"predictions": [1.5, 2.5]})
        );

        let multi = Table::from_columns([("no", vec![json!(0.2)]), ("yes", vec![json!(0.8)])])
            .unwrap();
        let extra = Table::single("reason", vec![json!("fraud")]);
        assert_eq!(
            encode_predictions_json(&multi, Some(&extra)),
            json!({
                "predictions": [{"no": 0.2, "yes": 0.8}],
                "extraModelOutput": {"columns": ["reason"], "index": [0], "data": [["fraud"]]}
            })
        );
    }

    #[test]
    fn transform_response_parts() {
        let features = Table::single("f1", vec![json!(1)]);
        let target = Table::single("y", vec![json!(0)]);
        let body = encode_transform_response(&features, Some(&target)).unwrap();
        let names: Vec<&str> = body.parts().iter().map(|part| part.name.as_str()).collect();
        assert_eq!(names, vec![X_FORMAT_KEY, X_TRANSFORM_KEY, Y_FORMAT_KEY, Y_TRANSFORM_KEY]);
        assert_eq!(body.part(X_FORMAT_KEY).unwrap().data, b"csv");

        let sparse = features.with_sparse(true);
        let body = encode_transform_response(&sparse, None).unwrap();
        assert_eq!(body.part(X_FORMAT_KEY).unwrap().data, b"sparse");
        assert_eq!(body.part(SPARSE_COLNAMES).unwrap().data, b"f1");

        let bytes = String::from_utf8(body.to_bytes()).unwrap();
        assert!(body.content_type().starts_with("multipart/form-data; boundary="));
        assert!(bytes.contains("name=\"X.transformed\"; filename=\"X.transformed\""));
        assert!(bytes.trim_end().ends_with("--"));
    }

    #[test]
    fn sse_framing_ends_with_done() {
        let chunks: Vec<Result<Value>> = vec![Ok(json!({"id": 1})), Ok(json!({"id": 2}))];
        let events: Vec<String> = sse_events(chunks.into_iter())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            events,
            vec![
                "data: {\"id\":1}\n\n".to_string(),
                "data: {\"id\":2}\n\n".to_string(),
                "data: [DONE]\n\n".to_string(),
            ]
        );
    }

    #[test]
    fn sse_stops_on_error() {
        let chunks: Vec<Result<Value>> =
            vec![Ok(json!({})), Err(AdapterError::chat_protocol("boom"))];
        let events: Vec<Result<String>> = sse_events(chunks.into_iter()).collect();
        assert_eq!(events.len(), 2);
        assert!(events[1].is_err());
    }

    #[test]
    fn incoming_unstructured_bodies() {
        let (data, mimetype, charset) =
            resolve_incoming_unstructured(b"hello".to_vec(), "", None).unwrap();
        assert_eq!(data, UnstructuredData::Text("hello".into()));
        assert_eq!(mimetype, "text/plain");
        assert_eq!(charset.as_deref(), Some("utf8"));

        let (data, _, charset) =
            resolve_incoming_unstructured(vec![0xe9], "text/plain", Some("latin-1")).unwrap();
        assert_eq!(data, UnstructuredData::Text("é".into()));
        assert_eq!(charset.as_deref(), Some("latin-1"));

        let (data, mimetype, _) =
            resolve_incoming_unstructured(vec![0, 1], "image/png", None).unwrap();
        assert_eq!(data, UnstructuredData::Bytes(vec![0, 1]));
        assert_eq!(mimetype, "image/png");
    }

    #[test]
    fn outgoing_unstructured_defaults() {
        let (body, mimetype, charset) =
            resolve_outgoing_unstructured(&UnstructuredOutput::text("ok")).unwrap();
        assert_eq!(body, b"ok");
        assert_eq!(mimetype.as_deref(), Some("text/plain"));
        assert_eq!(charset.as_deref(), Some("utf8"));

        let (_, mimetype, charset) =
            resolve_outgoing_unstructured(&UnstructuredOutput::bytes(vec![1])).unwrap();
        assert_eq!(mimetype.as_deref(), Some("application/octet-stream"));
        assert!(charset.is_none());

        let output = UnstructuredOutput::text("{}").with_option("mimetype", "application/json");
        let (_, mimetype, _) = resolve_outgoing_unstructured(&output).unwrap();
        assert_eq!(mimetype.as_deref(), Some("application/json"));
    }
}
