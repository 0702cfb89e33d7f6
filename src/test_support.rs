/// True when the sandbox refuses localhost listeners, so mock-server tests
/// should return early.
pub fn should_skip_httpmock() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping mock server test: cannot bind localhost");
            true
        }
        Err(err) => panic!("failed to probe localhost for mock server tests: {err}"),
    }
}
