use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use todcat::{ColumnDescriptor, ColumnType, FileIndex, PropertyStore};

fn write_mcp_message(stdin: &mut impl Write, payload: &Value) {
    let body = serde_json::to_vec(payload).unwrap();
    write!(stdin, "Content-Length: {}\r\n\r\n", body.len()).unwrap();
    stdin.write_all(&body).unwrap();
    stdin.flush().unwrap();
}

fn read_mcp_message(stdout: &mut impl BufRead) -> Value {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let n = stdout.read_line(&mut line).unwrap();
        assert!(n > 0, "unexpected EOF");
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(value.trim().parse::<usize>().unwrap());
            }
        }
    }
    let len = content_length.expect("missing Content-Length");
    let mut buf = vec![0_u8; len];
    stdout.read_exact(&mut buf).unwrap();
    serde_json::from_slice(&buf).unwrap()
}

fn populate(dir: &Path) {
    let files = FileIndex::for_dir(dir).unwrap();
    let mut load = files.begin_load().unwrap();
    load.add_detset("waf0", ["d1", "d2"]).unwrap();
    load.add_file("obs0_waf0_01000", "obs0", "waf0", 1000, None)
        .unwrap();
    load.add_file("obs0_waf0_00000", "obs0", "waf0", 0, Some(1000))
        .unwrap();
    load.commit().unwrap();
    files.close();

    let props = PropertyStore::open(dir.join("detdb.redb")).unwrap();
    props
        .create_table("base", vec![ColumnDescriptor::new("freq", ColumnType::Str)])
        .unwrap();
    props
        .add_props("base", "d1", Some((0, 100)), [("freq", "f090")])
        .unwrap();
    props
        .add_props("base", "d1", Some((100, 200)), [("freq", "f150")])
        .unwrap();
    props.close();
}

#[test]
fn stdio_server_resolves_files_and_properties() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path());

    let bin = env!("CARGO_BIN_EXE_todcat-mcp");
    let mut child = Command::new(bin)
        .env("TODCAT_FILE_INDEX_PATH", dir.path().join("obsfiledb.redb"))
        .env("TODCAT_PROPERTY_STORE_PATH", dir.path().join("detdb.redb"))
        .env("TODCAT_DATA_ROOT", "/archive")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());

    write_mcp_message(
        &mut stdin,
        &serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {}
        }),
    );
    let init = read_mcp_message(&mut stdout);
    assert_eq!(init["id"], 1);
    assert_eq!(init["result"]["serverInfo"]["name"], "todcat-mcp");

    write_mcp_message(
        &mut stdin,
        &serde_json::json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {
                "name": "resolve_files",
                "arguments": { "obs_id": "obs0", "detsets": ["waf0"] }
            }
        }),
    );
    let resolved = read_mcp_message(&mut stdout);
    assert_eq!(resolved["id"], 2);
    let files = resolved["result"]["structuredContent"]["files"]["waf0"]
        .as_array()
        .unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0]["path"], "/archive/obs0_waf0_00000");
    assert_eq!(files[0]["sample_stop"], 1000);
    assert_eq!(files[1]["path"], "/archive/obs0_waf0_01000");
    assert!(files[1]["sample_stop"].is_null());

    write_mcp_message(
        &mut stdin,
        &serde_json::json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {
                "name": "get_properties",
                "arguments": { "detectors": ["d1"], "properties": ["freq"], "at": 100 }
            }
        }),
    );
    let props = read_mcp_message(&mut stdout);
    assert_eq!(props["id"], 3);
    assert_eq!(
        props["result"]["structuredContent"]["rows"],
        serde_json::json!([["f150"]])
    );

    // A broken frame is answered with a parse error and the server keeps going.
    write!(stdin, "Content-Length: 3\r\n\r\n{{x}}").unwrap();
    stdin.flush().unwrap();
    let parse_err = read_mcp_message(&mut stdout);
    assert_eq!(parse_err["error"]["code"], -32700);

    write_mcp_message(
        &mut stdin,
        &serde_json::json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "tools/call",
            "params": {
                "name": "list_detsets",
                "arguments": { "obs_id": "obs9" }
            }
        }),
    );
    let missing = read_mcp_message(&mut stdout);
    assert_eq!(missing["id"], 4);
    assert_eq!(missing["result"]["isError"], true);

    // Stop child cleanly.
    drop(stdin);
    let _ = child.wait();
}

#[test]
fn stdio_server_refuses_missing_stores() {
    let dir = tempfile::tempdir().unwrap();
    let index_path = dir.path().join("obsfiledb.redb");

    let bin = env!("CARGO_BIN_EXE_todcat-mcp");
    let status = Command::new(bin)
        .env("TODCAT_FILE_INDEX_PATH", &index_path)
        .env("TODCAT_PROPERTY_STORE_PATH", dir.path().join("detdb.redb"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();

    assert!(!status.success());
    assert!(!index_path.exists(), "a read-only server must not create stores");
}
