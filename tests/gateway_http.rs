//! HTTP-level tests for the Gmail and Outlook gateways.
//!
//! Each test starts a small stateful axum server that mimics the provider
//! endpoints the gateway uses, then drives the real reqwest client at it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::prelude::*;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use mail_triage::error::GatewayError;
use mail_triage::gateway::{GmailGateway, MailboxGateway, OutlookGateway};
use mail_triage::pipeline::types::{AccessToken, TriageLabel};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const GOOD_TOKEN: &str = "good-token";
const GMAIL_PREFIX: &str = "/gmail/v1/users/me";

fn token() -> AccessToken {
    AccessToken::new(GOOD_TOKEN)
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {GOOD_TOKEN}"))
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid_token"}))).into_response()
}

async fn start_server(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

// ── Fake Gmail ──────────────────────────────────────────────────────

#[derive(Clone)]
struct GmailMessage {
    thread_id: String,
    label_ids: Vec<String>,
    snippet: String,
    headers: Vec<(String, String)>,
}

#[derive(Default)]
struct GmailState {
    /// (id, name)
    labels: Vec<(String, String)>,
    messages: Vec<(String, GmailMessage)>,
    label_creates: usize,
    sent: Vec<Value>,
    /// Ids still listed but gone by the time they are fetched.
    vanished: Vec<String>,
}

type Gmail = Arc<Mutex<GmailState>>;

impl GmailState {
    fn seeded() -> Self {
        Self {
            labels: vec![
                ("INBOX".into(), "INBOX".into()),
                ("UNREAD".into(), "UNREAD".into()),
                ("Label_7".into(), "Interested".into()),
            ],
            ..Default::default()
        }
    }

    fn add(&mut self, id: &str, label_ids: &[&str], headers: &[(&str, &str)], snippet: &str) {
        self.messages.push((
            id.to_string(),
            GmailMessage {
                thread_id: format!("thread-{id}"),
                label_ids: label_ids.iter().map(|s| s.to_string()).collect(),
                snippet: snippet.to_string(),
                headers: headers
                    .iter()
                    .map(|(n, v)| (n.to_string(), v.to_string()))
                    .collect(),
            },
        ));
    }

    fn message(&self, id: &str) -> Option<&GmailMessage> {
        self.messages.iter().find(|(m, _)| m == id).map(|(_, m)| m)
    }
}

async fn gmail_list_labels(State(state): State<Gmail>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let state = state.lock().unwrap();
    let labels: Vec<Value> = state
        .labels
        .iter()
        .map(|(id, name)| json!({"id": id, "name": name}))
        .collect();
    Json(json!({ "labels": labels })).into_response()
}

async fn gmail_create_label(
    State(state): State<Gmail>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut state = state.lock().unwrap();
    let name = body["name"].as_str().unwrap_or_default().to_string();
    if state.labels.iter().any(|(_, n)| *n == name) {
        return (StatusCode::CONFLICT, "Label name exists or conflicts").into_response();
    }
    state.label_creates += 1;
    let id = format!("Label_{}", 100 + state.label_creates);
    state.labels.push((id.clone(), name.clone()));
    Json(json!({"id": id, "name": name})).into_response()
}

async fn gmail_list_messages(
    State(state): State<Gmail>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let state = state.lock().unwrap();
    let label = query.get("labelIds").cloned().unwrap_or_default();
    let unread_only = query.get("q").is_some_and(|q| q == "is:unread");
    let messages: Vec<Value> = state
        .messages
        .iter()
        .filter(|(_, m)| m.label_ids.contains(&label))
        .filter(|(_, m)| !unread_only || m.label_ids.iter().any(|l| l == "UNREAD"))
        .map(|(id, m)| json!({"id": id, "threadId": m.thread_id}))
        .collect();
    if messages.is_empty() {
        return Json(json!({"resultSizeEstimate": 0})).into_response();
    }
    Json(json!({ "messages": messages })).into_response()
}

async fn gmail_get_message(
    State(state): State<Gmail>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let state = state.lock().unwrap();
    if state.vanished.contains(&id) {
        return (StatusCode::NOT_FOUND, "Requested entity was not found.").into_response();
    }
    let Some(m) = state.message(&id) else {
        return (StatusCode::NOT_FOUND, "Requested entity was not found.").into_response();
    };
    let headers: Vec<Value> = m
        .headers
        .iter()
        .map(|(n, v)| json!({"name": n, "value": v}))
        .collect();
    Json(json!({
        "id": id,
        "threadId": m.thread_id,
        "labelIds": m.label_ids,
        "snippet": m.snippet,
        "payload": { "headers": headers },
    }))
    .into_response()
}

async fn gmail_modify(
    State(state): State<Gmail>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut state = state.lock().unwrap();
    let Some((_, m)) = state.messages.iter_mut().find(|(m, _)| *m == id) else {
        return (StatusCode::NOT_FOUND, "Requested entity was not found.").into_response();
    };
    let ids = |key: &str| -> Vec<String> {
        body[key]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    };
    let remove = ids("removeLabelIds");
    m.label_ids.retain(|l| !remove.contains(l));
    for add in ids("addLabelIds") {
        if !m.label_ids.contains(&add) {
            m.label_ids.push(add);
        }
    }
    Json(json!({"id": id, "labelIds": m.label_ids})).into_response()
}

async fn gmail_send(
    State(state): State<Gmail>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    state.lock().unwrap().sent.push(body);
    Json(json!({"id": "sent-1", "labelIds": ["SENT"]})).into_response()
}

async fn start_gmail(state: GmailState) -> (GmailGateway, Gmail) {
    let state = Arc::new(Mutex::new(state));
    let app = Router::new()
        .route(
            &format!("{GMAIL_PREFIX}/labels"),
            get(gmail_list_labels).post(gmail_create_label),
        )
        .route(&format!("{GMAIL_PREFIX}/messages"), get(gmail_list_messages))
        .route(&format!("{GMAIL_PREFIX}/messages/send"), post(gmail_send))
        .route(&format!("{GMAIL_PREFIX}/messages/{{id}}"), get(gmail_get_message))
        .route(
            &format!("{GMAIL_PREFIX}/messages/{{id}}/modify"),
            post(gmail_modify),
        )
        .with_state(Arc::clone(&state));
    let addr = start_server(app).await;
    let gateway =
        GmailGateway::with_base_url(&format!("http://{addr}{GMAIL_PREFIX}"), TEST_TIMEOUT, 50)
            .unwrap();
    (gateway, state)
}

// ── Fake Graph ──────────────────────────────────────────────────────

#[derive(Default)]
struct GraphState {
    master_categories: Vec<String>,
    category_creates: usize,
    /// (folder, message json)
    messages: Vec<(String, Value)>,
    patches: Vec<(String, Value)>,
    replies: Vec<(String, Value)>,
}

type Graph = Arc<Mutex<GraphState>>;

impl GraphState {
    fn message_mut(&mut self, id: &str) -> Option<&mut Value> {
        self.messages
            .iter_mut()
            .map(|(_, m)| m)
            .find(|m| m["id"] == id)
    }
}

async fn graph_list_categories(State(state): State<Graph>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let state = state.lock().unwrap();
    let value: Vec<Value> = state
        .master_categories
        .iter()
        .map(|name| json!({"id": format!("cat-{name}"), "displayName": name, "color": "preset0"}))
        .collect();
    Json(json!({ "value": value })).into_response()
}

async fn graph_create_category(
    State(state): State<Graph>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut state = state.lock().unwrap();
    let name = body["displayName"].as_str().unwrap_or_default().to_string();
    if state.master_categories.contains(&name) {
        return (StatusCode::CONFLICT, Json(json!({"error": {"code": "ErrorAlreadyExists"}})))
            .into_response();
    }
    state.category_creates += 1;
    state.master_categories.push(name.clone());
    (StatusCode::CREATED, Json(json!({"displayName": name, "color": body["color"]})))
        .into_response()
}

async fn graph_list_folder(
    State(state): State<Graph>,
    headers: HeaderMap,
    Path(folder): Path<String>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let state = state.lock().unwrap();
    let value: Vec<Value> = state
        .messages
        .iter()
        .filter(|(f, _)| *f == folder)
        .map(|(_, m)| m.clone())
        .collect();
    Json(json!({ "value": value })).into_response()
}

async fn graph_get_message(
    State(state): State<Graph>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut state = state.lock().unwrap();
    match state.message_mut(&id) {
        Some(m) => Json(json!({"id": id, "categories": m["categories"].clone()})).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": {"code": "ErrorItemNotFound"}})))
            .into_response(),
    }
}

async fn graph_patch_message(
    State(state): State<Graph>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut state = state.lock().unwrap();
    let Some(m) = state.message_mut(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    m["categories"] = body["categories"].clone();
    m["isRead"] = body["isRead"].clone();
    let updated = m.clone();
    state.patches.push((id, body));
    Json(updated).into_response()
}

async fn graph_reply(
    State(state): State<Graph>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    state.lock().unwrap().replies.push((id, body));
    StatusCode::ACCEPTED.into_response()
}

async fn start_graph(state: GraphState) -> (OutlookGateway, Graph) {
    let state = Arc::new(Mutex::new(state));
    let app = Router::new()
        .route(
            "/me/outlook/masterCategories",
            get(graph_list_categories).post(graph_create_category),
        )
        .route("/me/mailFolders/{folder}/messages", get(graph_list_folder))
        .route(
            "/me/messages/{id}",
            get(graph_get_message).patch(graph_patch_message),
        )
        .route("/me/messages/{id}/reply", post(graph_reply))
        .with_state(Arc::clone(&state));
    let addr = start_server(app).await;
    let gateway = OutlookGateway::with_base_url(&format!("http://{addr}"), TEST_TIMEOUT, 50).unwrap();
    (gateway, state)
}

fn graph_message(id: &str, is_read: bool, categories: &[&str]) -> Value {
    json!({
        "id": id,
        "subject": format!("Subject {id}"),
        "bodyPreview": format!("Preview {id}"),
        "isRead": is_read,
        "sender": {"emailAddress": {"name": "Lead", "address": "lead@example.com"}},
        "toRecipients": [{"emailAddress": {"address": "sales@example.com"}}],
        "categories": categories,
        "conversationId": format!("conv-{id}"),
    })
}

// ── Gmail tests ─────────────────────────────────────────────────────

#[tokio::test]
async fn gmail_lists_unread_inbox_messages_with_label_names() {
    let mut state = GmailState::seeded();
    state.add(
        "m1",
        &["INBOX", "UNREAD", "Label_7"],
        &[
            ("Subject", "Pricing?"),
            ("From", "Lead <lead@example.com>"),
            ("To", "sales@example.com"),
        ],
        "Can you send pricing and a demo?",
    );
    state.add("m2", &["INBOX", "UNREAD"], &[], "");
    state.add("m3", &["INBOX"], &[("Subject", "Already read")], "old");
    state.add("m4", &["SPAM", "UNREAD"], &[("Subject", "Spam")], "spam");
    let (gateway, _state) = start_gmail(state).await;

    let messages = gateway.list_unread(&token(), "INBOX").await.unwrap();
    assert_eq!(messages.len(), 2);

    let first = &messages[0];
    assert_eq!(first.id, "m1");
    assert_eq!(first.subject, "Pricing?");
    assert_eq!(first.sender, "Lead <lead@example.com>");
    assert_eq!(first.recipient, "sales@example.com");
    assert_eq!(first.body, "Can you send pricing and a demo?");
    assert_eq!(first.thread_id.as_deref(), Some("thread-m1"));
    assert!(!first.is_read);
    assert!(first.labels.contains(&"Interested".to_string()));
    assert!(first.has_triage_label());

    let second = &messages[1];
    assert_eq!(second.subject, "No Subject");
    assert_eq!(second.sender, "Unknown Sender");
    assert_eq!(second.recipient, "Unknown Recipient");
}

#[tokio::test]
async fn gmail_listing_skips_message_deleted_after_list() {
    let mut state = GmailState::seeded();
    state.add("m1", &["INBOX", "UNREAD"], &[("Subject", "First")], "one");
    state.add("gone", &["INBOX", "UNREAD"], &[("Subject", "Deleted")], "two");
    state.add("m3", &["INBOX", "UNREAD"], &[("Subject", "Third")], "three");
    let (gateway, state) = start_gmail(state).await;
    state.lock().unwrap().vanished.push("gone".into());

    let messages = gateway.list_unread(&token(), "INBOX").await.unwrap();
    let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m3"]);
}

#[tokio::test]
async fn gmail_empty_mailbox_lists_nothing() {
    let (gateway, _state) = start_gmail(GmailState::seeded()).await;
    let messages = gateway.list_unread(&token(), "INBOX").await.unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn gmail_apply_label_creates_label_once() {
    let mut state = GmailState::seeded();
    state.add("m1", &["INBOX", "UNREAD"], &[], "");
    let (gateway, state) = start_gmail(state).await;

    let label = TriageLabel::MoreInformation;
    gateway.apply_label(&token(), "m1", &label).await.unwrap();
    gateway.apply_label(&token(), "m1", &label).await.unwrap();

    let state = state.lock().unwrap();
    assert_eq!(state.label_creates, 1);
    let named: Vec<_> = state
        .labels
        .iter()
        .filter(|(_, n)| n == "More Information")
        .collect();
    assert_eq!(named.len(), 1);

    let m = state.message("m1").unwrap();
    assert_eq!(m.label_ids, vec![named[0].0.clone()]);
}

#[tokio::test]
async fn gmail_apply_label_reuses_existing_label() {
    let mut state = GmailState::seeded();
    state.add("m1", &["INBOX", "UNREAD"], &[], "");
    let (gateway, state) = start_gmail(state).await;

    gateway
        .apply_label(&token(), "m1", &TriageLabel::Interested)
        .await
        .unwrap();

    let state = state.lock().unwrap();
    assert_eq!(state.label_creates, 0);
    assert_eq!(state.message("m1").unwrap().label_ids, vec!["Label_7"]);
}

#[tokio::test]
async fn gmail_apply_label_to_missing_message_is_not_found() {
    let (gateway, _state) = start_gmail(GmailState::seeded()).await;
    let err = gateway
        .apply_label(&token(), "nope", &TriageLabel::Interested)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NotFound { .. }), "{err:?}");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn gmail_reply_is_threaded_and_addressed_to_sender() {
    let mut state = GmailState::seeded();
    state.add(
        "m1",
        &["INBOX", "UNREAD"],
        &[
            ("Subject", "Pricing?"),
            ("From", "Lead <lead@example.com>"),
            ("To", "sales@example.com, other@example.com"),
            ("Message-ID", "<abc123@mail.example.com>"),
        ],
        "Can you send pricing and a demo?",
    );
    let (gateway, state) = start_gmail(state).await;

    gateway
        .send_reply(&token(), "m1", "Re: Pricing?", "Thanks!")
        .await
        .unwrap();

    let state = state.lock().unwrap();
    assert_eq!(state.sent.len(), 1);
    let sent = &state.sent[0];
    assert_eq!(sent["threadId"], "thread-m1");

    let raw = BASE64_URL_SAFE_NO_PAD
        .decode(sent["raw"].as_str().unwrap())
        .unwrap();
    let raw = String::from_utf8(raw).unwrap();
    assert!(raw.contains("Subject: Re: Pricing?"), "{raw}");
    assert!(raw.contains("From: sales@example.com"), "{raw}");
    assert!(raw.contains("lead@example.com"), "{raw}");
    assert!(!raw.contains("other@example.com"), "{raw}");
    assert!(raw.contains("In-Reply-To: <abc123@mail.example.com>"), "{raw}");
    assert!(raw.contains("Thanks!"), "{raw}");
}

#[tokio::test]
async fn gmail_bad_token_maps_to_auth() {
    let mut state = GmailState::seeded();
    state.add("m1", &["INBOX", "UNREAD"], &[], "");
    let (gateway, _state) = start_gmail(state).await;

    let err = gateway
        .list_unread(&AccessToken::new("expired"), "INBOX")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Auth { .. }), "{err:?}");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn unreachable_server_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let gateway = GmailGateway::with_base_url(&format!("http://{addr}"), TEST_TIMEOUT, 50).unwrap();
    let err = gateway.list_unread(&token(), "INBOX").await.unwrap_err();
    assert!(matches!(err, GatewayError::Transport { .. }), "{err:?}");
    assert!(err.is_retryable());
}

// ── Outlook tests ───────────────────────────────────────────────────

#[tokio::test]
async fn outlook_lists_folder_messages_including_read() {
    let state = GraphState {
        messages: vec![
            ("inbox".into(), graph_message("a1", false, &[])),
            ("inbox".into(), graph_message("a2", true, &["Interested"])),
            ("archive".into(), graph_message("a3", false, &[])),
        ],
        ..Default::default()
    };
    let (gateway, _state) = start_graph(state).await;

    let messages = gateway.list_unread(&token(), "inbox").await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, "a1");
    assert_eq!(messages[0].subject, "Subject a1");
    assert_eq!(messages[0].body, "Preview a1");
    assert_eq!(messages[0].sender, "lead@example.com");
    assert_eq!(messages[0].recipient, "sales@example.com");
    assert_eq!(messages[0].thread_id.as_deref(), Some("conv-a1"));
    assert!(!messages[0].is_read);
    assert!(messages[1].is_read);
    assert!(messages[1].has_triage_label());
}

#[tokio::test]
async fn outlook_apply_label_is_idempotent_and_keeps_other_categories() {
    let state = GraphState {
        master_categories: vec!["Blue category".into()],
        messages: vec![("inbox".into(), graph_message("a1", false, &["Blue category"]))],
        ..Default::default()
    };
    let (gateway, state) = start_graph(state).await;

    let label = TriageLabel::NotInterested;
    gateway.apply_label(&token(), "a1", &label).await.unwrap();
    gateway.apply_label(&token(), "a1", &label).await.unwrap();

    let mut state = state.lock().unwrap();
    assert_eq!(state.category_creates, 1);
    assert_eq!(
        state.master_categories,
        vec!["Blue category".to_string(), "Not Interested".to_string()]
    );
    assert_eq!(state.patches.len(), 2);
    let m = state.message_mut("a1").unwrap();
    assert_eq!(m["categories"], json!(["Blue category", "Not Interested"]));
    assert_eq!(m["isRead"], json!(true));
}

#[tokio::test]
async fn outlook_reply_posts_subject_and_comment() {
    let state = GraphState {
        messages: vec![("inbox".into(), graph_message("a/1+=", false, &[]))],
        ..Default::default()
    };
    let (gateway, state) = start_graph(state).await;

    gateway
        .send_reply(&token(), "a/1+=", "Schedule a Demo Call", "When are you free?")
        .await
        .unwrap();

    let state = state.lock().unwrap();
    assert_eq!(state.replies.len(), 1);
    let (id, body) = &state.replies[0];
    assert_eq!(id, "a/1+=");
    assert_eq!(body["message"]["subject"], "Schedule a Demo Call");
    assert_eq!(body["comment"], "When are you free?");
}

#[tokio::test]
async fn outlook_missing_message_is_not_found() {
    let (gateway, _state) = start_graph(GraphState::default()).await;
    let err = gateway
        .apply_label(&token(), "gone", &TriageLabel::Interested)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NotFound { .. }), "{err:?}");
}

#[tokio::test]
async fn outlook_bad_token_maps_to_auth() {
    let (gateway, _state) = start_graph(GraphState::default()).await;
    let err = gateway
        .send_reply(&AccessToken::new("expired"), "a1", "s", "b")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Auth { .. }), "{err:?}");
}
