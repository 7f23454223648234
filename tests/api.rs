//! HTTP API tests against an in-process router.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use bugnest::signature::{NONCE_HEADER, SIGNATURE_HEADER};
use common::{TestApp, signer};
use serde_json::json;

#[tokio::test]
async fn test_token_authentication() {
    let app = TestApp::new();
    let (_, token) = app.user("u1");

    let missing = app.get("/api/v1/me", None).await;
    assert_eq!(missing.status, StatusCode::UNAUTHORIZED);
    assert_eq!(missing.body["error"], "Authentication required");

    let bad = app
        .get("/api/v1/me", Some("bugnest_00000000_000000000000000000000000"))
        .await;
    assert_eq!(bad.status, StatusCode::UNAUTHORIZED);

    let me = app.get("/api/v1/me", Some(&token)).await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["data"]["username"], "u1");

    let health = app.get("/health", None).await;
    assert_eq!(health.status, StatusCode::OK);
}

#[tokio::test]
async fn test_submit_with_mention_reaches_inboxes() {
    let app = TestApp::new();
    let (_, t1) = app.user("u1");
    let (_, t2) = app.user("u2");
    let tracker = app.tracker(&t1, "projA", "PUBLIC").await;

    let submitted = app
        .json(
            "POST",
            &format!("/api/v1/trackers/{tracker}/tickets"),
            &t1,
            json!({ "subject": "crash on start", "body": "hi ~u2 please look" }),
        )
        .await;
    assert_eq!(submitted.status, StatusCode::CREATED, "{}", submitted.body);
    assert_eq!(submitted.body["data"]["scoped_id"], 1);

    let inbox = app.get("/api/v1/inbox", Some(&t2)).await;
    assert_eq!(inbox.status, StatusCode::OK);
    assert_eq!(inbox.body["data"]["results"].as_array().unwrap().len(), 1);
    let inbox = app.get("/api/v1/inbox", Some(&t1)).await;
    assert_eq!(inbox.body["data"]["results"].as_array().unwrap().len(), 1);

    // Anonymous readers see public tickets.
    let ticket = app
        .get(&format!("/api/v1/trackers/{tracker}/tickets/1"), None)
        .await;
    assert_eq!(ticket.status, StatusCode::OK);
    assert_eq!(ticket.body["data"]["ref"], "~u1/projA#1");
    assert_eq!(ticket.body["data"]["submitter"]["type"], "user");
    assert_eq!(ticket.body["data"]["authenticity"], "AUTHENTIC");

    let events = app
        .get(&format!("/api/v1/trackers/{tracker}/tickets/1/events"), None)
        .await;
    assert_eq!(events.body["data"]["results"].as_array().unwrap().len(), 2);

    let tracker = app.get(&format!("/api/v1/trackers/{tracker}"), None).await;
    assert_eq!(tracker.body["data"]["next_ticket_id"], 2);
}

#[tokio::test]
async fn test_private_tracker_is_hidden() {
    let app = TestApp::new();
    let (_, owner) = app.user("u9");
    let (_, guest) = app.user("u2");
    let tracker = app.tracker(&owner, "secret", "PRIVATE").await;
    let path = format!("/api/v1/trackers/{tracker}");

    assert_eq!(app.get(&path, None).await.status, StatusCode::NOT_FOUND);
    assert_eq!(app.get(&path, Some(&guest)).await.status, StatusCode::NOT_FOUND);
    let listed = app.get("/api/v1/trackers", None).await;
    assert!(listed.body["data"]["results"].as_array().unwrap().is_empty());
    assert_eq!(
        app.get("/api/v1/users/u9/trackers/secret", None).await.status,
        StatusCode::NOT_FOUND
    );

    let own = app.get(&path, Some(&owner)).await;
    assert_eq!(own.status, StatusCode::OK);
    assert_eq!(own.body["data"]["access"], 31);

    let granted = app
        .json(
            "PUT",
            &format!("{path}/acls"),
            &owner,
            json!({ "username": "u2", "permissions": ["browse", "comment"] }),
        )
        .await;
    assert_eq!(granted.status, StatusCode::OK, "{}", granted.body);
    let seen = app.get(&path, Some(&guest)).await;
    assert_eq!(seen.status, StatusCode::OK);
    assert_eq!(seen.body["data"]["access"], 5);

    // A guest cannot edit the tracker.
    let denied = app
        .json("PATCH", &path, &guest, json!({ "description": "mine now" }))
        .await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_status_change_requires_triage() {
    let app = TestApp::new();
    let (_, owner) = app.user("u1");
    let (_, other) = app.user("u2");
    let tracker = app.tracker(&owner, "projA", "PUBLIC").await;
    app.json(
        "POST",
        &format!("/api/v1/trackers/{tracker}/tickets"),
        &other,
        json!({ "subject": "typo in docs" }),
    )
    .await;
    let ticket = format!("/api/v1/trackers/{tracker}/tickets/1");

    let commented = app
        .json("POST", &format!("{ticket}/comments"), &other, json!({ "text": "still there" }))
        .await;
    assert_eq!(commented.status, StatusCode::CREATED);

    let status = json!({ "status": "RESOLVED", "resolution": "FIXED" });
    let denied = app.json("PUT", &format!("{ticket}/status"), &other, status.clone()).await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);

    let resolved = app.json("PUT", &format!("{ticket}/status"), &owner, status.clone()).await;
    assert_eq!(resolved.status, StatusCode::OK);
    assert_eq!(resolved.body["data"]["event"]["new_status"], "RESOLVED");
    let unchanged = app.json("PUT", &format!("{ticket}/status"), &owner, status).await;
    assert!(unchanged.body["data"]["event"].is_null());

    let invalid = app
        .json("PUT", &format!("{ticket}/status"), &owner, json!({ "status": "RESOLVED" }))
        .await;
    assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_export_import_round_trip() {
    let app = TestApp::new();
    let (_, owner) = app.user("u1");
    let source = app.tracker(&owner, "source", "PUBLIC").await;
    for subject in ["first", "second"] {
        app.json(
            "POST",
            &format!("/api/v1/trackers/{source}/tickets"),
            &owner,
            json!({ "subject": subject, "body": format!("{subject} body") }),
        )
        .await;
    }
    app.json(
        "POST",
        &format!("/api/v1/trackers/{source}/tickets/2/comments"),
        &owner,
        json!({ "text": "a comment" }),
    )
    .await;
    app.json(
        "POST",
        &format!("/api/v1/trackers/{source}/labels"),
        &owner,
        json!({ "name": "bug", "background_color": "#ff0000", "foreground_color": "#ffffff" }),
    )
    .await;

    let export = app
        .get(&format!("/api/v1/trackers/{source}/export"), Some(&owner))
        .await;
    assert_eq!(export.status, StatusCode::OK);
    assert_eq!(&export.bytes[..2], &[0x1f_u8, 0x8b]);

    let target = app.tracker(&owner, "target", "PUBLIC").await;
    let request = |tracker: i64| {
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/trackers/{tracker}/import"))
            .header(header::AUTHORIZATION, format!("Bearer {owner}"))
            .header(header::CONTENT_TYPE, "application/gzip")
            .body(Body::from(export.bytes.clone()))
            .unwrap()
    };

    // The source is not empty.
    let conflict = app.send(request(source)).await;
    assert_eq!(conflict.status, StatusCode::CONFLICT);

    let accepted = app.send(request(target)).await;
    assert_eq!(accepted.status, StatusCode::ACCEPTED, "{}", accepted.body);
    assert_eq!(accepted.body["data"]["tickets"], 2);

    let path = format!("/api/v1/trackers/{target}");
    let mut imported = None;
    for _ in 0..100 {
        let tracker = app.get(&path, Some(&owner)).await;
        if tracker.body["data"]["import_in_progress"] == false {
            imported = Some(tracker);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let imported = imported.expect("import finished");
    assert_eq!(imported.body["data"]["next_ticket_id"], 3);

    let tickets = app.get(&format!("{path}/tickets"), Some(&owner)).await;
    assert_eq!(tickets.body["data"]["results"].as_array().unwrap().len(), 2);
    let second = app.get(&format!("{path}/tickets/2"), Some(&owner)).await;
    assert_eq!(second.body["data"]["subject"], "second");
    assert_eq!(second.body["data"]["authenticity"], "AUTHENTIC");
    let labels = app.get(&format!("{path}/labels"), Some(&owner)).await;
    assert_eq!(labels.body["data"]["results"][0]["name"], "bug");
    assert_eq!(
        app.count("SELECT COUNT(*) FROM ticket_comment WHERE text = 'a comment'"),
        2
    );
    // authenticity 0 is AUTHENTIC
    assert_eq!(
        app.count(&format!(
            "SELECT COUNT(*) FROM ticket_comment c JOIN ticket tk ON tk.id = c.ticket_id
             WHERE tk.tracker_id = {target} AND c.authenticity = 0"
        )),
        1
    );
}

#[tokio::test]
async fn test_webhook_delivery_is_queued() {
    let app = TestApp::new();
    let (_, owner) = app.user("u1");
    let tracker = app.tracker(&owner, "projA", "PUBLIC").await;

    let created = app
        .json(
            "POST",
            "/api/v1/webhooks/legacy_tracker",
            &owner,
            json!({
                "url": "https://hooks.example.org/in",
                "events": ["ticket:create"],
                "tracker_id": tracker,
            }),
        )
        .await;
    assert_eq!(created.status, StatusCode::CREATED, "{}", created.body);
    let id = created.body["data"]["id"].as_i64().unwrap();

    app.json(
        "POST",
        &format!("/api/v1/trackers/{tracker}/tickets"),
        &owner,
        json!({ "subject": "crash" }),
    )
    .await;

    let deliveries = app
        .get(
            &format!("/api/v1/webhooks/legacy_tracker/{id}/deliveries"),
            Some(&owner),
        )
        .await;
    let results = deliveries.body["data"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["event"], "ticket:create");

    let unknown = app.get("/api/v1/webhooks/nonsense", Some(&owner)).await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_profile_update_requires_signature() {
    let app = TestApp::new();
    app.user("u1");
    let body = json!({ "name": "u1", "email": "renamed@example.org" }).to_string();
    let request = |nonce: &str, signature: &str| {
        Request::builder()
            .method("POST")
            .uri("/webhook/profile-update")
            .header(header::CONTENT_TYPE, "application/json")
            .header(NONCE_HEADER, nonce)
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body.clone()))
            .unwrap()
    };

    let forged = app.send(request("00", "AAAA")).await;
    assert_eq!(forged.status, StatusCode::UNAUTHORIZED);

    let signed = signer().sign(body.as_bytes());
    let accepted = app.send(request(&signed.nonce, &signed.signature)).await;
    assert_eq!(accepted.status, StatusCode::OK);
    assert_eq!(accepted.body["data"]["email"], "renamed@example.org");
}
