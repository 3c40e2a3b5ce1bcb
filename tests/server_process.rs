//! End-to-end tests for the isolated server process: handshake, path
//! rewriting, CGI execution and shutdown all run against the real
//! `rig_server` child binary.

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use browser_rig::server::{spawn_web_server, ServerError, READY_BANNER, SERVER_BINARY};
use tempfile::TempDir;

struct ServedTree {
    _dir: TempDir,
    build_root: PathBuf,
    test_root: PathBuf,
}

fn served_tree() -> Result<ServedTree> {
    let dir = tempfile::tempdir()?;
    let build_root = dir.path().join("build");
    let test_root = dir.path().join("test");
    fs::create_dir_all(&build_root)?;
    fs::create_dir_all(&test_root)?;

    fs::write(build_root.join("test.html"), "<html>entry page</html>\n")?;
    fs::write(build_root.join("module.wasm"), [0x00, 0x61, 0x73, 0x6d])?;
    fs::write(test_root.join("data.txt"), "fixture data\n")?;
    write_cgi_script(&test_root.join("data.cgi"))?;

    Ok(ServedTree {
        _dir: dir,
        build_root,
        test_root,
    })
}

fn write_cgi_script(path: &Path) -> Result<()> {
    let script = "#!/bin/sh\nprintf 'Content-Type: text/plain\\n\\nHELLO\\n'\n";
    fs::write(path, script)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

fn get(url: &str) -> Result<reqwest::blocking::Response> {
    reqwest::blocking::get(url).with_context(|| format!("GET {url}"))
}

#[test]
fn serves_static_files_and_reports_an_ephemeral_port() -> Result<()> {
    let tree = served_tree()?;
    let mut server = spawn_web_server(&tree.build_root, &tree.test_root)?;

    assert!(server.port() >= 1024, "port {} not ephemeral", server.port());

    let response = get(&format!("{}/test.html", server.base_url()))?;
    assert!(response.status().is_success());
    assert_eq!(response.text()?, "<html>entry page</html>\n");

    server.stop()?;
    Ok(())
}

#[test]
fn nonexistent_root_fails_with_missing_artifact() {
    let err = spawn_web_server(Path::new("/no/such/build"), Path::new("/tmp"))
        .expect_err("missing build root must fail");
    assert!(matches!(err, ServerError::MissingArtifact(_)));
}

#[test]
fn test_prefix_resolves_against_the_test_root() -> Result<()> {
    let tree = served_tree()?;
    let mut server = spawn_web_server(&tree.build_root, &tree.test_root)?;

    // data.txt only exists in the test root, not the build root.
    let response = get(&format!("{}/test/data.txt", server.base_url()))?;
    assert!(response.status().is_success());
    assert_eq!(response.text()?, "fixture data\n");

    let missing = get(&format!("{}/data.txt", server.base_url()))?;
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    server.stop()?;
    Ok(())
}

#[cfg(unix)]
#[test]
fn cgi_scripts_run_and_their_output_becomes_the_body() -> Result<()> {
    let tree = served_tree()?;
    let mut server = spawn_web_server(&tree.build_root, &tree.test_root)?;

    let response = get(&format!("{}/test/data.cgi", server.base_url()))?;
    assert!(response.status().is_success());
    assert_eq!(
        response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/plain")
    );
    assert_eq!(response.text()?, "HELLO\n");

    server.stop()?;
    Ok(())
}

#[test]
fn wasm_modules_are_served_with_their_registered_mime_type() -> Result<()> {
    let tree = served_tree()?;
    let mut server = spawn_web_server(&tree.build_root, &tree.test_root)?;

    let response = get(&format!("{}/module.wasm", server.base_url()))?;
    assert!(response.status().is_success());
    assert_eq!(
        response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/wasm")
    );

    server.stop()?;
    Ok(())
}

#[test]
fn traversal_paths_are_rejected() -> Result<()> {
    let tree = served_tree()?;
    fs::write(tree.build_root.parent().unwrap().join("secret.txt"), "nope")?;
    let mut server = spawn_web_server(&tree.build_root, &tree.test_root)?;

    // Clients normalize "..", so speak raw HTTP to exercise the guard.
    let mut stream = TcpStream::connect((server.hostname(), server.port()))?;
    write!(
        stream,
        "GET /../secret.txt HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        server.hostname()
    )?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    assert!(
        !response.contains("nope"),
        "traversal response leaked file contents: {response}"
    );

    server.stop()?;
    Ok(())
}

/// Same lookup the launcher falls back to: the server binary sits next to the
/// test executable's build output.
fn server_binary() -> Result<PathBuf> {
    let mut path = std::env::current_exe()?;
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push(format!("{SERVER_BINARY}{}", std::env::consts::EXE_SUFFIX));
    Ok(path)
}

#[test]
fn stdin_eof_does_not_stop_a_standalone_server() -> Result<()> {
    let tree = served_tree()?;
    let mut child = Command::new(server_binary()?)
        .env("RIG_ROOT", &tree.build_root)
        .env("RIG_TEST_ROOT", &tree.test_root)
        .env("RIG_BIND", "0.0.0.0:0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("spawn standalone server")?;

    let stdout = child.stdout.take().context("server stdout")?;
    let mut banner = String::new();
    BufReader::new(stdout).read_line(&mut banner)?;
    assert!(banner.starts_with(READY_BANNER), "unexpected banner: {banner}");

    // Stdin was closed from the start; the server must keep serving anyway.
    std::thread::sleep(Duration::from_secs(2));
    let status = child.try_wait()?;
    if let Some(status) = status {
        panic!("standalone server exited on stdin EOF with {status}");
    }

    child.kill()?;
    child.wait()?;
    Ok(())
}

#[test]
fn handshake_is_exactly_once_across_repeated_starts() -> Result<()> {
    let tree = served_tree()?;
    for _ in 0..3 {
        let mut server = spawn_web_server(&tree.build_root, &tree.test_root)?;
        let port = server.port();
        assert!((1024..=65535).contains(&port));

        // One port message came out; one terminate token goes in, and the
        // child must actually exit on it (stop joins the process).
        let response = get(&format!("{}/test.html", server.base_url()))?;
        assert!(response.status().is_success());
        server.stop()?;

        // A second stop is a no-op, not a second token.
        server.stop()?;
    }
    Ok(())
}

#[test]
fn log_file_records_requests_with_client_addresses() -> Result<()> {
    let tree = served_tree()?;
    let mut server = spawn_web_server(&tree.build_root, &tree.test_root)?;

    get(&format!("{}/test.html", server.base_url()))?;
    server.stop()?;

    // The temp dir outlives stop, so the log is readable after the join.
    let log = fs::read_to_string(server.log_path())?;
    assert!(log.contains("test.html"), "missing request line in: {log}");
    assert!(log.contains("127.0.0.1"), "missing client address in: {log}");
    Ok(())
}

#[test]
fn concurrent_instances_get_distinct_logs() -> Result<()> {
    let tree = served_tree()?;
    let mut main = spawn_web_server(&tree.build_root, &tree.test_root)?;
    let mut secondary = spawn_web_server(&tree.build_root, &tree.test_root)?;

    assert_ne!(main.port(), secondary.port());
    assert_ne!(main.log_path(), secondary.log_path());

    get(&format!("{}/test.html", main.base_url()))?;
    get(&format!("{}/test/data.txt", secondary.base_url()))?;

    main.stop()?;
    secondary.stop()?;

    let main_log = fs::read_to_string(main.log_path())?;
    let secondary_log = fs::read_to_string(secondary.log_path())?;
    assert!(main_log.contains("test.html"));
    assert!(secondary_log.contains("data.txt"));
    Ok(())
}
