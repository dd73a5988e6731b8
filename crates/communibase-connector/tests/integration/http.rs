use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use serde_json::json;

use communibase_connector::config::parse_service_url;
use communibase_connector::{ConnectorError, Params};

use crate::{HENK, PIET, setup_connector};

#[tokio::test]
async fn test_request_headers_and_body() {
    let (connector, api) = setup_connector(|_| {});
    api.respond(
        "POST",
        "Person.json/search",
        200,
        json!([{"_id": HENK, "firstName": "Henk"}]),
    );

    let params = Params::new().with("sort", "lastName").with("limit", 10);
    let documents = connector
        .search("Person", &json!({"firstName": "Henk"}), Some(&params))
        .await
        .unwrap();
    assert_eq!(documents, [json!({"_id": HENK, "firstName": "Henk"})]);

    let requests = api.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "Person.json/search");
    assert_eq!(request.query.as_deref(), Some("limit=10&sort=lastName"));
    assert_eq!(request.body, Some(json!({"firstName": "Henk"})));
    assert_eq!(request.header("x-api-key"), Some("secret"));
    assert_eq!(request.header("accept"), Some("application/json"));
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert_eq!(request.header("x-access-token"), None);
}

#[tokio::test]
async fn test_envelope_metadata() {
    let (connector, api) = setup_connector(|_| {});
    api.respond(
        "POST",
        "Person.json/search",
        200,
        json!({
            "metadata": {"total": 31, "page": 2},
            "records": [{"_id": HENK}],
        }),
    );

    let page = connector
        .search_page("Person", &json!({"city": "Utrecht"}), None)
        .await
        .unwrap();
    assert_eq!(page.records, [json!({"_id": HENK})]);
    assert_eq!(page.metadata, Some(json!({"total": 31, "page": 2})));

    // regular searches see the records only
    let documents = connector
        .search("Person", &json!({"city": "Utrecht"}), None)
        .await
        .unwrap();
    assert_eq!(documents, [json!({"_id": HENK})]);
}

#[tokio::test]
async fn test_remote_error_body() {
    let (connector, api) = setup_connector(|_| {});
    api.respond(
        "PUT",
        &format!("Person.json/crud/{HENK}"),
        400,
        json!({
            "code": 400,
            "message": "Validation failed",
            "errors": {"firstName": "required"},
        }),
    );

    let result = connector
        .update("Person", json!({"_id": HENK, "firstName": ""}))
        .await;

    assert_eq!(
        result,
        Err(ConnectorError::Remote {
            code: 400,
            message: "Validation failed".into(),
            errors: json!({"firstName": "required"}),
        })
    );
}

#[tokio::test]
async fn test_remote_error_defaults() {
    let (connector, _api) = setup_connector(|_| {});

    // the mock answers unknown routes with a 404 body without `errors`
    let result = connector.get_all("Person", None).await;

    match result {
        Err(ConnectorError::Remote {
            code,
            message,
            errors,
        }) => {
            assert_eq!(code, 404);
            assert!(message.contains("Person.json/crud"));
            assert_eq!(errors, json!({}));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_access_token_and_host() {
    let (connector, api) = setup_connector(|config| {
        config.api_key = None;
        config.host = Some("api.communibase.nl".into());
    });
    api.respond("POST", "Invoice.json/finalize/52259f95dafd757b06004444", 200, json!({}));

    connector.set_access_token(Some("token".into()));
    connector
        .finalize_invoice("52259f95dafd757b06004444")
        .await
        .unwrap();

    let request = &api.requests()[0];
    assert_eq!(request.header("x-access-token"), Some("token"));
    assert_eq!(request.header("x-api-key"), None);
    assert_eq!(request.header("host"), Some("api.communibase.nl"));
}

#[tokio::test]
async fn test_coalesced_lookups() {
    let (connector, api) = setup_connector(|_| {});
    api.respond(
        "POST",
        "Person.json/search",
        200,
        json!([{"_id": HENK, "firstName": "Henk"}]),
    );

    let (henk, again, piet) = futures::join!(
        connector.get_by_id("Person", HENK, None, None),
        connector.get_by_id("Person", HENK, None, None),
        connector.get_by_id("Person", PIET, None, None),
    );

    assert_eq!(henk.unwrap()["firstName"], "Henk");
    assert!(again.is_ok());
    assert_eq!(
        piet,
        Err(ConnectorError::NotFound {
            entity_type: "Person".into(),
            object_id: PIET.into(),
        })
    );

    let requests = api.requests();
    assert_eq!(requests.len(), 1);
    let mut ids: Vec<_> = requests[0].body.as_ref().unwrap()["_id"]["$in"]
        .as_array()
        .unwrap()
        .iter()
        .map(|id| id.as_str().unwrap().to_owned())
        .collect();
    ids.sort();
    assert_eq!(ids, [HENK, PIET]);
}

#[tokio::test]
async fn test_read_file() {
    let (connector, api) = setup_connector(|_| {});
    api.respond_bytes(
        "File.json/binary/52259f95dafd757b06005555",
        200,
        Bytes::from_static(b"%PDF-1.4"),
    );

    let chunks: Vec<Bytes> = connector
        .read_file("52259f95dafd757b06005555")
        .try_collect()
        .await
        .unwrap();
    assert_eq!(chunks.concat(), b"%PDF-1.4");
    assert_eq!(api.requests()[0].query.as_deref(), Some("api_key=secret"));

    let mut missing = connector.read_file("52259f95dafd757b06009999");
    let error = missing.next().await.unwrap().unwrap_err();
    assert_eq!(
        error,
        ConnectorError::Remote {
            code: 404,
            message: "Not Found".into(),
            errors: json!({}),
        }
    );
    assert!(missing.next().await.is_none());
}

#[tokio::test]
async fn test_connection_refused() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let (connector, _api) = setup_connector(|config| {
        config.service_url = parse_service_url(&format!("http://127.0.0.1:{port}/0.1")).unwrap();
    });

    let result = connector.get_by_id("Person", HENK, None, None).await;

    assert!(matches!(result, Err(ConnectorError::Transport(_))));
}
