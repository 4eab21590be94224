use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::jid;
use crate::state::room::Room;
use crate::xml::{escape, Element};

/// Stream error condition sent to a session displaced by a newer login.
pub const CONDITION_CONFLICT: &str = "<conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>";

/// Stream error condition sent to a session kicked by the admin plane.
pub const CONDITION_NOT_AUTHORIZED: &str =
    "<not-authorized xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>";

/// An item queued for a session's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized stanza (or raw stream fragment) to write as-is.
    Stanza(String),
    /// Close the stream with the given `<stream:error>` condition.
    CloseError(String),
}

/// Handle to a live session, shared between its connection task, the
/// registry, room membership lists and the admin plane.
///
/// Writes go through an unbounded FIFO channel drained by the owning
/// connection task, so enqueuing under the registry lock never blocks and
/// within-session write order is preserved.
pub struct ClientHandle {
    id: u64,
    jid: Mutex<String>,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ClientHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The session's full JID; empty until authentication.
    pub fn jid(&self) -> String {
        self.jid.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Set the full JID at authentication time.
    pub fn set_jid(&self, jid: impl Into<String>) {
        *self.jid.lock().unwrap_or_else(PoisonError::into_inner) = jid.into();
    }

    /// Queue a serialized stanza. A send to a session that is tearing down
    /// is silently dropped.
    pub fn send_stanza(&self, stanza: impl Into<String>) {
        let _ = self.tx.send(Outbound::Stanza(stanza.into()));
    }

    /// Queue a forced close with the given stream error condition.
    pub fn close_error(&self, condition: &str) {
        let _ = self.tx.send(Outbound::CloseError(condition.to_string()));
    }
}

/// A room's introspection snapshot, taken under the registry lock.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub jid: String,
    pub member_jids: Vec<String>,
}

#[derive(Default)]
struct Inner {
    clients: Vec<Arc<ClientHandle>>,
    rooms: Vec<Room>,
}

/// The process-wide registry of live sessions and rooms.
///
/// A single mutex serializes every mutation and scan of both lists,
/// including membership changes inside any room. Invariants held under the
/// lock: at most one authenticated session per bare JID (enforced by
/// eviction at authentication), every room member is also in the client
/// list, and removal strips a session from all rooms before the list.
pub struct Registry {
    domain: String,
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The XMPP domain this server answers for.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Allocate a session handle and the receiving end of its write queue.
    pub fn new_handle(&self) -> (Arc<ClientHandle>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ClientHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            jid: Mutex::new(String::new()),
            tx,
        });
        (handle, rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a session into the client list. Idempotent.
    pub fn add_client(&self, client: &Arc<ClientHandle>) {
        let mut inner = self.lock();
        if inner.clients.iter().any(|c| c.id == client.id) {
            return;
        }
        inner.clients.push(Arc::clone(client));
    }

    /// Remove a session: first from every room's membership (emitting the
    /// leave wave), then from the client list.
    pub fn remove_client(&self, client: &Arc<ClientHandle>) {
        let mut inner = self.lock();
        for room in &mut inner.rooms {
            room.remove_member(client);
        }
        inner.clients.retain(|c| c.id != client.id);
    }

    /// Send a `<conflict/>` stream error to every session whose bare JID
    /// matches the newly authenticated one. One resource per bare JID.
    pub fn evict_conflicting(&self, new_jid: &str) {
        let inner = self.lock();
        for client in &inner.clients {
            if jid::bare_jid_match(&client.jid(), new_jid) {
                info!(jid = %client.jid(), "kicking client because of JID conflict");
                client.close_error(CONDITION_CONFLICT);
            }
        }
    }

    /// Admin kick: close every session whose bare JID equals `bare_jid`.
    pub fn kick_user(&self, bare_jid: &str) {
        let inner = self.lock();
        for client in &inner.clients {
            if jid::bare(&client.jid()) == bare_jid {
                info!(jid = %client.jid(), "kicking client via admin api");
                client.close_error(CONDITION_NOT_AUTHORIZED);
            }
        }
    }

    /// Groupchat 1.0 join: look the room up case-insensitively, create it
    /// if absent, add the client (duplicate-suppressed) and emit the join
    /// presence waves.
    pub fn join_room(&self, client: &Arc<ClientHandle>, to_bare: &str) {
        let mut inner = self.lock();
        let idx = match inner.rooms.iter().position(|r| jid::eq_fold(&r.jid, to_bare)) {
            Some(i) => {
                debug!(room = %to_bare, "adding client to room");
                inner.rooms[i].add_member(client);
                i
            }
            None => {
                debug!(room = %to_bare, "creating room");
                inner.rooms.push(Room::new(to_bare, client));
                inner.rooms.len() - 1
            }
        };
        let room = &inner.rooms[idx];
        let joiner_jid = client.jid();

        // The joiner sees one presence per current member; its own slot
        // carries the self-presence marker.
        for member in room.members() {
            let member_nick = format!("{}/{}", to_bare, jid::node(&member.jid()));
            let mut presence = format!(
                "<presence from='{}' to='{}'>\
                 <x xmlns='http://jabber.org/protocol/muc#user'>\
                 <item affiliation='member' role='participant'/>",
                escape(&member_nick),
                escape(&joiner_jid),
            );
            if member.id == client.id {
                presence.push_str("<status code='110'/>");
            }
            presence.push_str("</x></presence>");
            client.send_stanza(presence);
        }

        // Everyone else sees the joiner arrive.
        let announce_from = format!("{}/{}", to_bare, jid::node(&joiner_jid));
        for member in room.members() {
            if member.id == client.id {
                continue;
            }
            let presence = format!(
                "<presence from='{}' to='{}'>\
                 <x xmlns='http://jabber.org/protocol/muc#user'>\
                 <item affiliation='member' role='participant'/></x></presence>",
                escape(&announce_from),
                escape(&member.jid()),
            );
            member.send_stanza(presence);
        }
    }

    /// Groupchat 1.0 leave. The room match here is case-sensitive.
    pub fn leave_room(&self, client: &Arc<ClientHandle>, to_bare: &str) {
        let mut inner = self.lock();
        if let Some(room) = inner.rooms.iter_mut().find(|r| r.jid == to_bare) {
            room.remove_member(client);
            debug!(room = %to_bare, "removed client from room");
        }
    }

    /// Route a message stanza: groupchat goes to the matching room (which
    /// rewrites `from` and fans out per member), and regardless of type the
    /// first client matching the original `to` also receives the stanza in
    /// its current form.
    pub fn route_message(&self, mut el: Element) {
        debug!("routing message");
        let to = el.attr("to").unwrap_or("").to_string();
        if el.attr("type") == Some("groupchat") {
            let inner = self.lock();
            if let Some(room) = inner.rooms.iter().find(|r| jid::eq_fold(&r.jid, &to)) {
                debug!(room = %to, "routing to room");
                room.route_message(&mut el);
            }
        }
        let inner = self.lock();
        if let Some(client) = inner.clients.iter().find(|c| jid::jid_matches(&to, &c.jid())) {
            debug!(to = %to, "routing to client");
            client.send_stanza(el.to_string());
        }
    }

    /// Node parts of every published session, for the admin plane.
    pub fn sessions(&self) -> Vec<String> {
        self.lock()
            .clients
            .iter()
            .map(|c| jid::node(&c.jid()).to_string())
            .collect()
    }

    /// Snapshot of every room and its members' full JIDs.
    pub fn room_snapshots(&self) -> Vec<RoomSnapshot> {
        self.lock()
            .rooms
            .iter()
            .map(|room| RoomSnapshot {
                jid: room.jid.clone(),
                member_jids: room.members().iter().map(|m| m.jid()).collect(),
            })
            .collect()
    }
}
