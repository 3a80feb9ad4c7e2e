//! Per-user Server-Sent-Events fan-out.
//!
//! Connections register with the [`EventHub`]; `emit_event` pushes a frame to
//! every connection of the target user that subscribed to the event
//! type. Connections whose receiver is gone are evicted on the next emit.
//! The registry is process-local, so running several instances needs an
//! external pub/sub in front of it.

use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures_util::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::{
    auth::authenticate,
    permissions::{can_access_organisation, Role},
    types::{parse_admin_user_row, AdminUser, AppState},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseFrame {
    fn into_event(self) -> Event {
        Event::default().event(self.event).data(self.data)
    }
}

struct SseClient {
    user_id: String,
    event_types: HashSet<String>,
    sender: mpsc::UnboundedSender<SseFrame>,
}

impl SseClient {
    fn wants(&self, user_id: &str, event_type: &str) -> bool {
        self.user_id == user_id
            && (self.event_types.is_empty() || self.event_types.contains(event_type))
    }
}

#[derive(Default)]
pub struct EventHub {
    clients: Mutex<HashMap<u64, SseClient>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection. An empty `event_types` set receives every event type.
    pub fn add_client(
        &self,
        user_id: &str,
        event_types: HashSet<String>,
    ) -> (u64, mpsc::UnboundedReceiver<SseFrame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.clients.lock().insert(
            id,
            SseClient {
                user_id: user_id.to_string(),
                event_types,
                sender,
            },
        );
        debug!(client_id = id, user_id, "sse client connected");
        (id, receiver)
    }

    pub fn remove_client(&self, id: u64) -> bool {
        let removed = self.clients.lock().remove(&id).is_some();
        if removed {
            debug!(client_id = id, "sse client removed");
        }
        removed
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Returns how many connections received the event.
    pub fn emit_event<T: Serialize>(&self, user_id: &str, event_type: &str, data: &T) -> usize {
        let Ok(data) = serde_json::to_string(data) else {
            return 0;
        };
        let frame = SseFrame {
            event: event_type.to_string(),
            data,
        };

        let mut clients = self.clients.lock();
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, client) in clients.iter() {
            if !client.wants(user_id, event_type) {
                continue;
            }
            if client.sender.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }
        for id in dead {
            clients.remove(&id);
            debug!(client_id = id, "evicted closed sse client");
        }
        delivered
    }
}

/// Removes the connection when the response stream is dropped.
struct ClientGuard {
    state: Arc<AppState>,
    id: u64,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.state.events.remove_client(self.id);
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub types: Option<String>,
}

pub fn parse_event_types(raw: Option<&str>) -> HashSet<String> {
    raw.unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn client_stream(
    state: Arc<AppState>,
    user_id: &str,
    event_types: HashSet<String>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let (id, receiver) = state.events.add_client(user_id, event_types);
    let guard = ClientGuard { state, id };
    let hello = Event::default()
        .event("connected")
        .data(json!({ "clientId": id }).to_string());

    stream::once(async move { Ok(hello) }).chain(UnboundedReceiverStream::new(receiver).map(
        move |frame| {
            let _keep = &guard;
            Ok(frame.into_event())
        },
    ))
}

pub async fn events_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Response {
    let user = match authenticate(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let event_types = parse_event_types(query.types.as_deref());
    let stream = client_stream(state, &user.id, event_types);
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

/// Active admins whose scope covers the organisation.
pub fn organisation_audience<'a>(
    admins: &'a [AdminUser],
    organisation_id: &str,
    org_partner_id: Option<&str>,
) -> Vec<&'a str> {
    admins
        .iter()
        .filter(|user| user.active && can_access_organisation(user, organisation_id, org_partner_id))
        .map(|user| user.id.as_str())
        .collect()
}

async fn load_audience(
    state: &Arc<AppState>,
    organisation_id: &str,
) -> Result<(Vec<AdminUser>, Option<String>), sqlx::Error> {
    let org_partner_id = sqlx::query_scalar::<_, Option<String>>(
        "SELECT partner_id FROM organisations WHERE id = $1",
    )
    .bind(organisation_id)
    .fetch_optional(&state.db)
    .await?
    .flatten();
    let rows = sqlx::query(
        "SELECT * FROM admin_users \
         WHERE active = true AND (role = $1 OR organisation_id = $2 OR partner_id = $3)",
    )
    .bind(Role::SuperAdmin.as_str())
    .bind(organisation_id)
    .bind(&org_partner_id)
    .fetch_all(&state.db)
    .await?;
    Ok((rows.iter().map(parse_admin_user_row).collect(), org_partner_id))
}

/// Fans an event out to every admin whose scope covers the organisation.
/// Runs after the change is committed, so a failed lookup is logged and the
/// caller's request still succeeds.
pub async fn emit_to_organisation_admins(
    state: &Arc<AppState>,
    organisation_id: &str,
    event_type: &str,
    data: &Value,
) -> usize {
    let (admins, org_partner_id) = match load_audience(state, organisation_id).await {
        Ok(audience) => audience,
        Err(err) => {
            warn!(organisation_id, event_type, error = %err, "unable to resolve event audience");
            return 0;
        }
    };
    organisation_audience(&admins, organisation_id, org_partner_id.as_deref())
        .into_iter()
        .map(|user_id| state.events.emit_event(user_id, event_type, data))
        .sum()
}
