use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use fleetcore_llmcli::{CliAdapter, NormalizedEvent, TurnRequest};

fn fake_cli_script(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    writeln!(file, "{body}").unwrap();
    file.flush().unwrap();
    let mut perms = file.as_file().metadata().unwrap().permissions();
    perms.set_mode(0o755);
    file.as_file().set_permissions(perms).unwrap();
    file
}

#[tokio::test]
async fn streams_normalized_events_in_order() {
    let script = fake_cli_script(
        r#"
printf '{"type":"thinking","text":"pondering"}\n'
printf '{"type":"text","text":"hello"}\n'
printf '{"type":"result","text":"done"}\n'
"#,
    );

    let adapter = CliAdapter::new(script.path());
    let req = TurnRequest::new("do the thing", Duration::from_secs(5));

    let mut kinds = Vec::new();
    let outcome = adapter
        .run_streaming(&req, |event| kinds.push(event.kind().to_string()))
        .await
        .unwrap();

    assert_eq!(kinds, vec!["thinking", "text", "result"]);
    assert_eq!(outcome.markdown, "hello");
}

#[tokio::test]
async fn unparseable_line_becomes_text_event() {
    let script = fake_cli_script(r#"printf 'not json at all\n'"#);

    let adapter = CliAdapter::new(script.path());
    let req = TurnRequest::new("anything", Duration::from_secs(5));

    let mut events = Vec::new();
    adapter
        .run_streaming(&req, |event| events.push(event))
        .await
        .unwrap();

    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], NormalizedEvent::Text(_)));
}

#[tokio::test]
async fn nonzero_exit_surfaces_as_error() {
    let script = fake_cli_script("exit 7");

    let adapter = CliAdapter::new(script.path());
    let req = TurnRequest::new("anything", Duration::from_secs(5));

    let result = adapter.run_streaming(&req, |_| {}).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn slow_child_times_out() {
    let script = fake_cli_script("sleep 5");

    let adapter = CliAdapter::new(script.path());
    let req = TurnRequest::new("anything", Duration::from_millis(200));

    let result = adapter.run_streaming(&req, |_| {}).await;
    assert!(matches!(
        result,
        Err(fleetcore_llmcli::AdapterError::Timeout { .. })
    ));
}
