use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value as JsonValue};
use std::env;
use std::io::{self, BufRead, BufReader, Read, Write};
use todcat::{
    AtTime, FileIndex, Filter, ObsPredicate, PropertyQuery, PropertyStore, ResolvedFile,
    ResultTable, Scalar,
};

const MAX_MESSAGE_BYTES: usize = 1_048_576; // 1 MiB
const MAX_NAME_BYTES: usize = 512;
const MAX_LIST_LEN: usize = 100_000;

struct AppState {
    files: FileIndex,
    props: PropertyStore,
}

impl AppState {
    fn open() -> Result<Self> {
        let index_path = env::var("TODCAT_FILE_INDEX_PATH")
            .unwrap_or_else(|_| "./obsfiledb.redb".to_string());
        let store_path = env::var("TODCAT_PROPERTY_STORE_PATH")
            .unwrap_or_else(|_| "./detdb.redb".to_string());

        let mut files = FileIndex::open_existing(&index_path)
            .with_context(|| format!("failed to open file index at {index_path}"))?;
        if let Ok(root) = env::var("TODCAT_DATA_ROOT") {
            files = files.with_root(root);
        }
        let props = PropertyStore::open_existing(&store_path)
            .with_context(|| format!("failed to open property store at {store_path}"))?;
        tracing::info!(
            file_index = %index_path,
            property_store = %store_path,
            root = %files.root().display(),
            "catalogs opened"
        );
        Ok(Self { files, props })
    }
}

fn main() -> Result<()> {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let state = AppState::open()?;
    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    loop {
        let maybe = match read_message(&mut reader) {
            Ok(m) => m,
            Err(e) => {
                // Bad framing gets a parse error; the server keeps reading.
                tracing::warn!(error = %e, "malformed frame");
                let err_resp = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": format!("Parse error: {e}") }
                });
                write_message(&mut writer, &err_resp)?;
                continue;
            }
        };
        let Some(request) = maybe else {
            break;
        };
        if let Some(response) = handle_request(&state, &request) {
            write_message(&mut writer, &response)?;
        }
    }

    tracing::info!("stdin closed, shutting down");
    Ok(())
}

fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<JsonValue>> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .context("invalid Content-Length")?,
                );
            }
        }
    }

    let len = content_length.context("missing Content-Length header")?;
    if len > MAX_MESSAGE_BYTES {
        // Skip the body so the next read starts at a frame header.
        io::copy(&mut reader.by_ref().take(len as u64), &mut io::sink())?;
        anyhow::bail!(
            "Content-Length {} exceeds max allowed {} bytes",
            len,
            MAX_MESSAGE_BYTES
        );
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    let value: JsonValue = serde_json::from_slice(&payload).context("invalid JSON payload")?;
    Ok(Some(value))
}

fn write_message<W: Write>(writer: &mut W, value: &JsonValue) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

fn handle_request(state: &AppState, req: &JsonValue) -> Option<JsonValue> {
    let id = req.get("id").cloned();
    let method = req.get("method").and_then(JsonValue::as_str)?;

    match method {
        "initialize" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "todcat-mcp", "version": env!("CARGO_PKG_VERSION") }
                }
            })
        }),
        "notifications/initialized" => None,
        "tools/list" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "tools": tools_schema()
                }
            })
        }),
        "tools/call" => id.map(|id_val| {
            let result = call_tool(state, req.get("params"));
            match result {
                Ok(tool_result) => json!({
                    "jsonrpc": "2.0",
                    "id": id_val,
                    "result": tool_result
                }),
                Err(err) => {
                    tracing::debug!(error = %err, "tool call failed");
                    json!({
                        "jsonrpc": "2.0",
                        "id": id_val,
                        "result": {
                            "content": [{ "type": "text", "text": format!("tool error: {err:#}") }],
                            "isError": true
                        }
                    })
                }
            }
        }),
        "ping" => id.map(|id_val| json!({ "jsonrpc": "2.0", "id": id_val, "result": {} })),
        _ => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "error": {
                    "code": -32601,
                    "message": format!("method not found: {method}")
                }
            })
        }),
    }
}

fn tools_schema() -> Vec<JsonValue> {
    let at = json!({
        "description": "Unix seconds or an RFC3339 timestamp; omitted means no time filtering.",
        "type": ["integer", "string"]
    });
    let filter = json!({
        "description": "One {property: value} mapping, or a list of them (any may match).",
        "type": ["object", "array"]
    });
    vec![
        json!({
            "name": "list_observations",
            "description": "List observation ids, optionally filtered on observation tags.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "equals": {"type": "object"},
                    "ranges": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {"tag": {"type": "string"}, "lo": {}, "hi": {}},
                            "required": ["tag"]
                        }
                    }
                }
            }
        }),
        json!({
            "name": "list_detsets",
            "description": "List detsets with data in an observation.",
            "inputSchema": {
                "type": "object",
                "properties": { "obs_id": {"type": "string"} },
                "required": ["obs_id"]
            }
        }),
        json!({
            "name": "detset_members",
            "description": "List the detectors of a detset.",
            "inputSchema": {
                "type": "object",
                "properties": { "detset": {"type": "string"} },
                "required": ["detset"]
            }
        }),
        json!({
            "name": "resolve_files",
            "description": "Files of an observation per detset, ordered by first sample.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "obs_id": {"type": "string"},
                    "detsets": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["obs_id"]
            }
        }),
        json!({
            "name": "check_files",
            "description": "Report overlapping or missing sample ranges between files.",
            "inputSchema": {
                "type": "object",
                "properties": { "obs_id": {"type": "string"} }
            }
        }),
        json!({
            "name": "list_detectors",
            "description": "List detector names whose properties match a filter.",
            "inputSchema": {
                "type": "object",
                "properties": { "filter": filter.clone(), "at": at.clone() }
            }
        }),
        json!({
            "name": "get_properties",
            "description": "Resolve detector properties at a time.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "detectors": {"type": "array", "items": {"type": "string"}},
                    "properties": {"type": "array", "items": {"type": "string"}},
                    "filter": filter,
                    "at": at
                }
            }
        }),
        json!({
            "name": "validate_properties",
            "description": "Check every property table for overlapping validity intervals.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
    ]
}

fn call_tool(state: &AppState, params: Option<&JsonValue>) -> Result<JsonValue> {
    let name = params
        .and_then(|v| v.get("name"))
        .and_then(JsonValue::as_str)
        .context("missing tool name")?;
    let args = params
        .and_then(|v| v.get("arguments"))
        .cloned()
        .unwrap_or_else(|| json!({}));

    match name {
        "list_observations" => {
            let predicates = parse_obs_predicates(&args)?;
            let obs = state.files.list_observations(&predicates)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{} observation(s)", obs.len()) }],
                "structuredContent": { "observations": obs }
            }))
        }
        "list_detsets" => {
            let obs_id = required_str(&args, "obs_id")?;
            let detsets = state.files.list_detsets(obs_id)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{} detset(s) in {obs_id}", detsets.len()) }],
                "structuredContent": { "detsets": detsets }
            }))
        }
        "detset_members" => {
            let detset = required_str(&args, "detset")?;
            let dets = state.files.list_detectors(detset)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{} detector(s) in {detset}", dets.len()) }],
                "structuredContent": { "detectors": dets }
            }))
        }
        "resolve_files" => {
            let obs_id = required_str(&args, "obs_id")?;
            let detsets = optional_str_list(&args, "detsets")?;
            let wanted: Option<Vec<&str>> = detsets
                .as_ref()
                .map(|d| d.iter().map(String::as_str).collect());
            let resolved = state.files.resolve_files(obs_id, wanted.as_deref())?;
            let total: usize = resolved.values().map(Vec::len).sum();
            let by_detset: Map<String, JsonValue> = resolved
                .into_iter()
                .map(|(detset, files)| (detset, files_to_json(&files)))
                .collect();
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{total} file(s) for {obs_id}") }],
                "structuredContent": { "files": by_detset }
            }))
        }
        "check_files" => {
            let obs_id = optional_str(&args, "obs_id")?;
            let conflicts = state.files.check_consistency(obs_id)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{} conflict(s)", conflicts.len()) }],
                "structuredContent": { "conflicts": conflicts }
            }))
        }
        "list_detectors" => {
            let filter = parse_filter(args.get("filter"))?;
            let at = parse_at(args.get("at"))?;
            let table = state.props.list_detectors(filter.as_ref(), at)?;
            Ok(table_result(&table, "detector(s)"))
        }
        "get_properties" => {
            let mut query = PropertyQuery::new().at(parse_at(args.get("at"))?);
            if let Some(dets) = optional_str_list(&args, "detectors")? {
                query = query.detectors(dets);
            }
            if let Some(props) = optional_str_list(&args, "properties")? {
                query = query.properties(props);
            }
            if let Some(filter) = parse_filter(args.get("filter"))? {
                query = query.filter(filter);
            }
            let table = state.props.get_properties(&query)?;
            Ok(table_result(&table, "row(s)"))
        }
        "validate_properties" => {
            state.props.validate()?;
            let schema = state.props.schema()?;
            let tables: Vec<&str> = schema.table_names().collect();
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{} table(s) valid", tables.len()) }],
                "structuredContent": { "tables": tables }
            }))
        }
        _ => anyhow::bail!("unknown tool: {name}"),
    }
}

fn required_str<'a>(args: &'a JsonValue, key: &str) -> Result<&'a str> {
    optional_str(args, key)?.with_context(|| format!("{key} is required"))
}

fn optional_str<'a>(args: &'a JsonValue, key: &str) -> Result<Option<&'a str>> {
    match args.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .with_context(|| format!("{key} must be a string"))?;
            if s.len() > MAX_NAME_BYTES {
                anyhow::bail!("{key} exceeds max allowed size ({MAX_NAME_BYTES} bytes)");
            }
            Ok(Some(s))
        }
    }
}

fn optional_str_list(args: &JsonValue, key: &str) -> Result<Option<Vec<String>>> {
    let Some(v) = args.get(key).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let items = v
        .as_array()
        .with_context(|| format!("{key} must be an array of strings"))?;
    if items.len() > MAX_LIST_LEN {
        anyhow::bail!("{key} exceeds max allowed length ({MAX_LIST_LEN})");
    }
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .with_context(|| format!("{key} must be an array of strings"))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn parse_at(v: Option<&JsonValue>) -> Result<AtTime> {
    match v {
        None | Some(JsonValue::Null) => Ok(AtTime::Current),
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .map(AtTime::At)
            .context("at must be an integer number of unix seconds"),
        Some(JsonValue::String(s)) => Ok(s
            .parse::<DateTime<Utc>>()
            .context("at must be RFC3339")?
            .into()),
        Some(_) => anyhow::bail!("at must be unix seconds or an RFC3339 string"),
    }
}

fn parse_filter(v: Option<&JsonValue>) -> Result<Option<Filter>> {
    match v {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Object(m)) => Ok(Some(Filter::exact(mapping(m)?))),
        Some(JsonValue::Array(items)) => {
            let maps = items
                .iter()
                .map(|item| {
                    item.as_object()
                        .context("filter list entries must be objects")
                        .and_then(mapping)
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(Filter::any_of(maps)))
        }
        Some(_) => anyhow::bail!("filter must be an object or a list of objects"),
    }
}

fn mapping(m: &Map<String, JsonValue>) -> Result<Vec<(String, Scalar)>> {
    m.iter()
        .map(|(k, v)| Ok((k.clone(), json_to_scalar(v)?)))
        .collect()
}

fn parse_obs_predicates(args: &JsonValue) -> Result<Vec<ObsPredicate>> {
    let mut out = Vec::new();
    if let Some(equals) = args.get("equals").filter(|v| !v.is_null()) {
        let equals = equals.as_object().context("equals must be an object")?;
        for (tag, value) in mapping(equals)? {
            out.push(ObsPredicate::eq(tag, value));
        }
    }
    if let Some(ranges) = args.get("ranges").filter(|v| !v.is_null()) {
        let ranges = ranges.as_array().context("ranges must be an array")?;
        for r in ranges {
            let tag = required_str(r, "tag")?;
            let bound = |key: &str| -> Result<Option<Scalar>> {
                match r.get(key) {
                    None | Some(JsonValue::Null) => Ok(None),
                    Some(v) => json_to_scalar(v).map(Some),
                }
            };
            out.push(ObsPredicate::Range {
                tag: tag.to_string(),
                lo: bound("lo")?,
                hi: bound("hi")?,
            });
        }
    }
    Ok(out)
}

fn json_to_scalar(v: &JsonValue) -> Result<Scalar> {
    match v {
        JsonValue::Null => Ok(Scalar::Null),
        JsonValue::String(s) => Ok(Scalar::Str(s.clone())),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Ok(Scalar::Int(i)),
            None => n
                .as_f64()
                .map(Scalar::Float)
                .with_context(|| format!("unsupported number {n}")),
        },
        _ => anyhow::bail!("property values must be strings, numbers or null, got {v}"),
    }
}

fn scalar_to_json(s: &Scalar) -> JsonValue {
    match s {
        Scalar::Str(s) => JsonValue::String(s.clone()),
        Scalar::Int(i) => json!(i),
        // Non-finite floats have no JSON form and serialize as null.
        Scalar::Float(f) => json!(f),
        Scalar::Null => JsonValue::Null,
    }
}

fn table_to_json(table: &ResultTable) -> JsonValue {
    let rows: Vec<JsonValue> = table
        .iter()
        .map(|row| JsonValue::Array(row.iter().map(scalar_to_json).collect()))
        .collect();
    json!({ "keys": table.keys(), "rows": rows })
}

fn table_result(table: &ResultTable, noun: &str) -> JsonValue {
    json!({
        "content": [{ "type": "text", "text": format!("{} {noun}", table.len()) }],
        "structuredContent": table_to_json(table)
    })
}

fn files_to_json(files: &[ResolvedFile]) -> JsonValue {
    files
        .iter()
        .map(|f| {
            json!({
                "path": f.path.to_string_lossy(),
                "sample_start": f.sample_start,
                "sample_stop": f.sample_stop,
            })
        })
        .collect()
}
