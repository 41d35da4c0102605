use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use httpmock::prelude::*;
use serde_json::json;
use utils::{assert_or_retry, client_for};

mod utils;

// Panic hooks are process wide, so this binary holds a single test.
#[test]
fn test_panic_hook_reports_panics_and_chains_to_previous_hook() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/ingest/").json_body_partial(
            json!({
                "message": "kaboom",
                "exception_type": "Panic",
                "stacktrace": [{"filename": file!(), "function": "<unknown>"}],
                "exceptions": [{"type": "Panic", "value": "kaboom", "chain_type": null}],
            })
            .to_string(),
        );
        then.status(200);
    });

    let previous_calls = Arc::new(AtomicUsize::new(0));
    {
        let previous_calls = previous_calls.clone();
        panic::set_hook(Box::new(move |_| {
            previous_calls.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let client = Arc::new(client_for(server.url("/ingest/")));
    client.install_panic_hook();

    let result = panic::catch_unwind(|| panic!("kaboom"));

    assert!(result.is_err());
    assert_eq!(previous_calls.load(Ordering::SeqCst), 1);
    assert_or_retry(|| mock.hits() == 1);
    assert!(client.shutdown());

    // Once the client is gone the hook only forwards.
    drop(client);
    let result = panic::catch_unwind(|| panic!("after the client"));

    assert!(result.is_err());
    assert_eq!(previous_calls.load(Ordering::SeqCst), 2);
    mock.assert_hits(1);

    drop(panic::take_hook());
}
