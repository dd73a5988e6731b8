use std::time::Duration;

use serde_json::json;

use communibase_connector::{ConnectionState, LocalDirtyFeed};

use crate::{HENK, PIET, setup_connector};

#[tokio::test]
async fn test_cached_search_and_invalidation() {
    let (connector, api) = setup_connector(|_| {});
    api.respond(
        "POST",
        "Person.json/search",
        200,
        json!([
            {"_id": HENK, "firstName": "Henk", "city": "Utrecht"},
            {"_id": PIET, "firstName": "Piet", "city": "Utrecht"},
        ]),
    );

    let feed = LocalDirtyFeed::new();
    connector.enable_cache("5241cc5a0b6c5a1a2b000001", &feed).unwrap();
    let mut state = connector.connection_state().unwrap();
    state
        .wait_for(|state| *state == ConnectionState::Connected)
        .await
        .unwrap();

    let selector = json!({"city": "Utrecht"});
    for _ in 0..3 {
        let documents = connector.search("Person", &selector, None).await.unwrap();
        assert_eq!(documents.len(), 2);
    }
    // one request for the ids, one batched lookup of both objects
    assert_eq!(api.accesses(), 2);
    let requests = api.requests();
    assert_eq!(requests[0].query.as_deref(), Some("fields=_id"));
    assert_eq!(requests[1].query, None);

    assert_eq!(
        feed.publish("5241cc5a0b6c5a1a2b000001_dirty", format!("Person|{HENK}")),
        1
    );

    let mut accesses = api.accesses();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        connector.search("Person", &selector, None).await.unwrap();
        accesses = api.accesses();
        if accesses > 2 {
            break;
        }
    }
    // the ids are fetched again, as well as the dirty object, but not its sibling
    assert_eq!(accesses, 4);
    let last = api.requests().pop().unwrap();
    assert_eq!(last.body, Some(json!({"_id": {"$in": [HENK]}})));
}

#[tokio::test]
async fn test_cached_aggregate() {
    let (connector, api) = setup_connector(|_| {});
    api.respond(
        "POST",
        "Event.json/aggregate",
        200,
        json!([{"_id": null, "participantCount": 12}]),
    );
    let feed = LocalDirtyFeed::new();
    connector.enable_cache("admin", &feed).unwrap();

    let pipeline = json!([
        {"$unwind": "$participants"},
        {"$group": {"_id": null, "participantCount": {"$sum": 1}}},
    ]);
    let first = connector.aggregate("Event", &pipeline).await.unwrap();
    let second = connector.aggregate("Event", &pipeline).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first[0]["participantCount"], 12);
    assert_eq!(api.accesses(), 1);
    assert_eq!(api.requests()[0].body, Some(pipeline));
}
