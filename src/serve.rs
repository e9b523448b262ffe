//! HTTP API for the lead engine
//!
//! `leadflow serve` → JSON API on tiny_http plus a server-sent-event stream.
//! The acting user comes from the `X-User-Id` header.

use crate::activities::ActivityInput;
use crate::edits::LeadEdit;
use crate::error::LeadError;
use crate::lifecycle::{LeadEngine, LeadFields};
use crate::notify::{user_topic, BroadcastHub, LEADS_TOPIC};
use crate::scheduler::{self, SweepKind};
use crate::state::LeadStatus;
use crate::types::{Cents, Role};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::Read;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;

/// Largest attachment accepted in one request
const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
const SSE_KEEPALIVE: Duration = Duration::from_secs(15);
/// How often an idle forwarder checks whether its stream is gone
const FORWARD_POLL: Duration = Duration::from_millis(100);

#[derive(Serialize)]
struct ApiResponse<T> {
    ok: bool,
    data: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            kind: None,
        }
    }
}

impl ApiResponse<()> {
    fn failure(err: &LeadError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(err.user_message()),
            kind: Some(err.kind()),
        }
    }
}

/// Lead-level actions posted to `/api/leads/{id}/{action}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeadAction {
    Accept,
    Reject,
    Revert,
    Resubmit,
    AssignBd,
    Stage,
    DealAmount,
    Activities,
    Attachment,
    Reassign,
    Edit,
    Restore,
}

impl LeadAction {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "accept" => LeadAction::Accept,
            "reject" => LeadAction::Reject,
            "revert" => LeadAction::Revert,
            "resubmit" => LeadAction::Resubmit,
            "assign-bd" => LeadAction::AssignBd,
            "stage" => LeadAction::Stage,
            "deal-amount" => LeadAction::DealAmount,
            "activities" => LeadAction::Activities,
            "attachment" => LeadAction::Attachment,
            "reassign" => LeadAction::Reassign,
            "edit" => LeadAction::Edit,
            "restore" => LeadAction::Restore,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    SubmitLead,
    ListLeads,
    GetLead(i32),
    Timeline(i32),
    SocialProfiles(i32),
    ListActivities(i32),
    Act(i32, LeadAction),
    ToggleActivity(i32, i32),
    DeleteActivity(i32, i32),
    DeleteLead(i32),
    SuggestedBd,
    Notifications,
    MarkRead,
    Events,
    Sweep(SweepKind),
    Stages,
    Users,
}

fn route(method: &Method, path: &str) -> Option<Route> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let id = |s: &str| s.parse::<i32>().ok();

    Some(match (method, segments.as_slice()) {
        (Method::Post, ["api", "leads"]) => Route::SubmitLead,
        (Method::Get, ["api", "leads"]) => Route::ListLeads,
        (Method::Get, ["api", "leads", lead]) => Route::GetLead(id(lead)?),
        (Method::Delete, ["api", "leads", lead]) => Route::DeleteLead(id(lead)?),
        (Method::Get, ["api", "leads", lead, "timeline"]) => Route::Timeline(id(lead)?),
        (Method::Get, ["api", "leads", lead, "profiles"]) => Route::SocialProfiles(id(lead)?),
        (Method::Get, ["api", "leads", lead, "activities"]) => Route::ListActivities(id(lead)?),
        (Method::Post, ["api", "leads", lead, "activities", activity, "toggle"]) => {
            Route::ToggleActivity(id(lead)?, id(activity)?)
        }
        (Method::Delete, ["api", "leads", lead, "activities", activity]) => {
            Route::DeleteActivity(id(lead)?, id(activity)?)
        }
        (Method::Post, ["api", "leads", lead, action]) => Route::Act(id(lead)?, LeadAction::parse(action)?),
        (Method::Get, ["api", "bd", "suggested"]) => Route::SuggestedBd,
        (Method::Get, ["api", "notifications"]) => Route::Notifications,
        (Method::Post, ["api", "notifications", "read"]) => Route::MarkRead,
        (Method::Get, ["api", "events"]) => Route::Events,
        (Method::Post, ["api", "sweeps", "deadlines"]) => Route::Sweep(SweepKind::Deadlines),
        (Method::Post, ["api", "sweeps", "reminders"]) => Route::Sweep(SweepKind::Reminders),
        (Method::Get, ["api", "stages"]) => Route::Stages,
        (Method::Get, ["api", "users"]) => Route::Users,
        _ => return None,
    })
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Deserialize)]
struct CommentBody {
    comment: String,
}

#[derive(Deserialize)]
struct AssignBdBody {
    #[serde(default)]
    bd_user_id: Option<i32>,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Deserialize)]
struct StageBody {
    stage_id: i32,
}

/// `amount` may be a JSON string or number; either way it is read as decimal text
#[derive(Deserialize)]
struct DealAmountBody {
    amount: Value,
}

impl DealAmountBody {
    fn cents(&self) -> Result<Cents, LeadError> {
        match &self.amount {
            Value::String(text) => text.parse(),
            Value::Number(n) => n.to_string().parse(),
            _ => Err(LeadError::Validation("amount must be a number".into())),
        }
    }
}

#[derive(Deserialize)]
struct ReassignBody {
    manager_id: i32,
    reason: String,
}

#[derive(Deserialize, Default)]
struct MarkReadBody {
    #[serde(default)]
    id: Option<i32>,
}

#[derive(Deserialize, Default)]
struct ListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    unread: Option<bool>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    user_id: Option<i32>,
    #[serde(default)]
    role: Option<Role>,
}

type Handled = Result<(u16, Value), LeadError>;

fn ok<T: Serialize>(data: T) -> Handled {
    Ok((200, serde_json::to_value(data).unwrap_or(Value::Null)))
}

// ============================================================================
// Server
// ============================================================================

/// Serve the API until `cancel` fires
pub fn start_server(
    engine: Arc<LeadEngine>,
    hub: Arc<BroadcastHub>,
    port: u16,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr = format!("127.0.0.1:{}", port);
    let server = Server::http(&addr).map_err(|e| std::io::Error::other(e.to_string()))?;
    tracing::info!(%addr, "leadflow API listening");

    while !cancel.is_cancelled() {
        let request = match server.recv_timeout(Duration::from_millis(500)) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "failed to receive request");
                continue;
            }
        };
        if let Err(e) = handle_request(&engine, &hub, &cancel, request) {
            tracing::warn!(error = %e, "failed to write response");
        }
    }
    tracing::info!("leadflow API stopped");
    Ok(())
}

fn handle_request(
    engine: &Arc<LeadEngine>,
    hub: &Arc<BroadcastHub>,
    cancel: &CancellationToken,
    mut request: Request,
) -> std::io::Result<()> {
    let url = request.url().to_string();
    let (path, query) = url.split_once('?').unwrap_or((url.as_str(), ""));
    let method = request.method().clone();
    let query: ListQuery = serde_urlencoded::from_str(query).unwrap_or_default();

    let Some(route) = route(&method, path) else {
        let err = LeadError::not_found(format!("route {} {}", method, path));
        return respond(request, err.status_code(), &ApiResponse::failure(&err));
    };
    tracing::debug!(%method, path, ?route, "request");

    if route == Route::Events {
        return match actor_id(&request).ok().or(query.user_id) {
            Some(user_id) => {
                open_event_stream(hub, cancel, user_id, request);
                Ok(())
            }
            None => {
                let err = LeadError::Validation("X-User-Id header or user_id parameter is required".into());
                respond(request, err.status_code(), &ApiResponse::failure(&err))
            }
        };
    }

    let result = dispatch(engine, cancel, route, &query, &mut request);
    match result {
        Ok((status, data)) => respond(request, status, &ApiResponse::success(data)),
        Err(err) => {
            if err.status_code() >= 500 {
                tracing::error!(%method, path, error = %err, "request failed");
            }
            respond(request, err.status_code(), &ApiResponse::failure(&err))
        }
    }
}

fn dispatch(
    engine: &LeadEngine,
    cancel: &CancellationToken,
    route: Route,
    query: &ListQuery,
    request: &mut Request,
) -> Handled {
    let actor = actor_id(request);
    match route {
        Route::SubmitLead => {
            let fields: LeadFields = read_json(request)?;
            let id = engine.submit_lead(actor?, &fields)?;
            Ok((201, json!({ "lead_id": id })))
        }
        Route::ListLeads => {
            let status = match query.status.as_deref() {
                Some(s) => Some(
                    LeadStatus::parse(s)
                        .ok_or_else(|| LeadError::Validation(format!("unknown status '{}'", s)))?,
                ),
                None => None,
            };
            ok(engine.list_leads(status, query.limit.unwrap_or(100))?)
        }
        Route::GetLead(id) => ok(engine.get_lead(id)?),
        Route::DeleteLead(id) => ok(engine.soft_delete_lead(id, actor?)?),
        Route::Timeline(id) => ok(engine.timeline(id)?),
        Route::SocialProfiles(id) => ok(engine.social_profiles(id)?),
        Route::ListActivities(id) => ok(engine.activities(id)?),
        Route::ToggleActivity(lead, activity) => {
            let completed = engine.toggle_activity(lead, activity, actor?)?;
            ok(json!({ "completed": completed }))
        }
        Route::DeleteActivity(lead, activity) => ok(engine.delete_activity(lead, activity, actor?)?),
        Route::Act(lead, action) => act(engine, lead, actor?, action, query, request),
        Route::SuggestedBd => {
            let suggested = match engine.peek_suggested_bd()? {
                Some(id) => Some(engine.get_user(id)?),
                None => None,
            };
            ok(suggested)
        }
        Route::Notifications => {
            let user = actor?;
            if query.unread.unwrap_or(false) {
                ok(engine.unread_notifications(user)?)
            } else {
                ok(engine.notifications(user, query.limit.unwrap_or(50))?)
            }
        }
        Route::MarkRead => {
            let user = actor?;
            let body: MarkReadBody = read_json_or_default(request)?;
            match body.id {
                Some(id) => ok(engine.mark_read(user, id)?),
                None => ok(json!({ "marked": engine.mark_all_read(user)? })),
            }
        }
        Route::Sweep(kind) => {
            let user = engine.get_user(actor?)?;
            if user.role != Role::Admin.as_str() {
                return Err(LeadError::Forbidden("only admins can run sweeps".into()));
            }
            ok(scheduler::run_once(engine, kind, cancel)?)
        }
        Route::Stages => ok(engine.list_stages()?),
        Route::Users => ok(engine.list_users(query.role)?),
        Route::Events => Err(LeadError::not_found("event stream")),
    }
}

fn act(engine: &LeadEngine, lead: i32, actor: i32, action: LeadAction, query: &ListQuery, request: &mut Request) -> Handled {
    match action {
        LeadAction::Accept => ok(engine.accept_lead(lead, actor)?),
        LeadAction::Reject => {
            let body: CommentBody = read_json(request)?;
            ok(engine.reject_lead(lead, actor, &body.comment)?)
        }
        LeadAction::Revert => {
            let body: CommentBody = read_json(request)?;
            ok(engine.revert_lead(lead, actor, &body.comment)?)
        }
        LeadAction::Resubmit => {
            let body: CommentBody = read_json(request)?;
            ok(engine.resubmit_lead(lead, actor, &body.comment)?)
        }
        LeadAction::AssignBd => {
            let body: AssignBdBody = read_json(request)?;
            let bd_user = match body.bd_user_id {
                Some(id) => id,
                None => engine
                    .peek_suggested_bd()?
                    .ok_or_else(|| LeadError::Validation("there are no BD sales users to assign".into()))?,
            };
            engine.assign_bd(lead, actor, bd_user, body.note.as_deref())?;
            ok(json!({ "assigned_bd_id": bd_user }))
        }
        LeadAction::Stage => {
            let body: StageBody = read_json(request)?;
            ok(engine.move_stage(lead, actor, body.stage_id)?)
        }
        LeadAction::DealAmount => {
            let body: DealAmountBody = read_json(request)?;
            ok(engine.update_deal_amount(lead, actor, body.cents()?)?)
        }
        LeadAction::Activities => {
            let input: ActivityInput = read_json(request)?;
            let id = engine.add_activity(lead, actor, &input)?;
            Ok((201, json!({ "activity_id": id })))
        }
        LeadAction::Attachment => {
            let name = query
                .name
                .clone()
                .ok_or_else(|| LeadError::Validation("the name parameter is required".into()))?;
            let bytes = read_bytes(request)?;
            let path = engine.attach_file(lead, actor, &bytes, &name)?;
            Ok((201, json!({ "path": path })))
        }
        LeadAction::Reassign => {
            let body: ReassignBody = read_json(request)?;
            ok(engine.reassign_manager(lead, actor, body.manager_id, &body.reason)?)
        }
        LeadAction::Edit => {
            let edit: LeadEdit = read_json(request)?;
            ok(json!({ "changed": engine.edit_lead(lead, actor, &edit)? }))
        }
        LeadAction::Restore => ok(engine.restore_lead(lead, actor)?),
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn actor_id(request: &Request) -> Result<i32, LeadError> {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv("X-User-Id"))
        .and_then(|h| h.value.as_str().trim().parse::<i32>().ok())
        .ok_or_else(|| LeadError::Validation("X-User-Id header is required".into()))
}

fn read_body(request: &mut Request) -> Result<String, LeadError> {
    let mut body = String::new();
    request
        .as_reader()
        .take(MAX_UPLOAD_BYTES)
        .read_to_string(&mut body)
        .map_err(|e| LeadError::Validation(format!("failed to read body: {}", e)))?;
    Ok(body)
}

fn read_json<T: serde::de::DeserializeOwned>(request: &mut Request) -> Result<T, LeadError> {
    let body = read_body(request)?;
    serde_json::from_str(&body).map_err(|e| LeadError::Validation(format!("invalid JSON: {}", e)))
}

fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(request: &mut Request) -> Result<T, LeadError> {
    let body = read_body(request)?;
    if body.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&body).map_err(|e| LeadError::Validation(format!("invalid JSON: {}", e)))
}

fn read_bytes(request: &mut Request) -> Result<Vec<u8>, LeadError> {
    let mut bytes = Vec::new();
    request
        .as_reader()
        .take(MAX_UPLOAD_BYTES + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| LeadError::Validation(format!("failed to read upload: {}", e)))?;
    if bytes.len() as u64 > MAX_UPLOAD_BYTES {
        return Err(LeadError::Validation("attachment is larger than 10 MB".into()));
    }
    Ok(bytes)
}

fn content_type<R: Read>(response: Response<R>, value: &str) -> Response<R> {
    match Header::from_bytes(&b"Content-Type"[..], value.as_bytes()) {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}

fn respond<T: Serialize>(request: Request, status: u16, body: &ApiResponse<T>) -> std::io::Result<()> {
    let json = serde_json::to_string(body)?;
    let response = content_type(Response::from_string(json).with_status_code(status), "application/json");
    request.respond(response)
}

// ============================================================================
// Server-sent events
// ============================================================================

/// Readable body that yields SSE frames as pushes arrive
///
/// Owns a child of the server token. Dropping the stream cancels it, which
/// stops the topic forwarders and releases their subscriptions.
struct EventStream {
    rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
    pending: Vec<u8>,
    pos: usize,
}

impl EventStream {
    fn open(hub: &BroadcastHub, server_cancel: &CancellationToken, user_id: i32) -> Self {
        let cancel = server_cancel.child_token();
        let rx = forward_topics(hub, &[LEADS_TOPIC.to_string(), user_topic(user_id)], &cancel);
        Self {
            rx,
            cancel,
            pending: b": connected\n\n".to_vec(),
            pos: 0,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Read for EventStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.pos >= self.pending.len() {
            if self.cancel.is_cancelled() {
                return Ok(0);
            }
            let frame = match self.rx.recv_timeout(SSE_KEEPALIVE) {
                Ok(payload) => format!("data: {}\n\n", payload),
                Err(mpsc::RecvTimeoutError::Timeout) => ": keepalive\n\n".to_string(),
                Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
            };
            self.pending = frame.into_bytes();
            self.pos = 0;
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// One thread per topic copies broadcasts into a single channel until `cancel` fires
fn forward_topics(hub: &BroadcastHub, topics: &[String], cancel: &CancellationToken) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel::<String>();
    for topic in topics {
        let topic = topic.clone();
        let mut sub = hub.subscribe(&topic);
        let tx = tx.clone();
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            while !cancel.is_cancelled() {
                match sub.try_recv() {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(TryRecvError::Empty) => std::thread::sleep(FORWARD_POLL),
                    Err(TryRecvError::Lagged(n)) => {
                        tracing::debug!(topic = %topic, skipped = n, "event stream lagged");
                    }
                    Err(TryRecvError::Closed) => break,
                }
            }
            tracing::trace!(topic = %topic, "event forwarder stopped");
        });
    }
    rx
}

fn open_event_stream(hub: &BroadcastHub, cancel: &CancellationToken, user_id: i32, request: Request) {
    let stream = EventStream::open(hub, cancel, user_id);
    std::thread::spawn(move || {
        let mut headers = Vec::new();
        for (name, value) in [("Content-Type", "text/event-stream"), ("Cache-Control", "no-cache")] {
            if let Ok(h) = Header::from_bytes(name.as_bytes(), value.as_bytes()) {
                headers.push(h);
            }
        }
        let response = Response::new(StatusCode(200), headers, stream, None, None);
        tracing::debug!(user_id, "event stream opened");
        if let Err(e) = request.respond(response) {
            tracing::debug!(user_id, error = %e, "event stream closed");
        }
    });
}
