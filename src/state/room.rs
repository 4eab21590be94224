use std::sync::Arc;

use crate::jid;
use crate::state::registry::ClientHandle;
use crate::xml::{escape, Element};

/// A multi-user chat room: a bare JID plus an ordered membership list.
///
/// Rooms hold back-references only and never outlive the registry that owns
/// them; a room is created on the first join and persists empty for the
/// server's lifetime. All mutation happens under the registry lock.
pub struct Room {
    pub jid: String,
    members: Vec<Arc<ClientHandle>>,
}

impl Room {
    pub(crate) fn new(jid: impl Into<String>, first: &Arc<ClientHandle>) -> Self {
        Self {
            jid: jid.into(),
            members: vec![Arc::clone(first)],
        }
    }

    pub(crate) fn members(&self) -> &[Arc<ClientHandle>] {
        &self.members
    }

    /// Add a member, suppressing duplicates.
    pub(crate) fn add_member(&mut self, client: &Arc<ClientHandle>) {
        if self.members.iter().any(|m| m.id() == client.id()) {
            return;
        }
        self.members.push(Arc::clone(client));
    }

    /// Emit the unavailable-presence wave for `client` to every current
    /// member (the departing member's own slot carries `110`), then drop
    /// the client from the membership list.
    pub(crate) fn remove_member(&mut self, client: &Arc<ClientHandle>) {
        let from = format!("{}/{}", self.jid, jid::node(&client.jid()));
        for member in &self.members {
            let mut presence = format!(
                "<presence from='{}' to='{}' type='unavailable'>\
                 <x xmlns='http://jabber.org/protocol/muc#user'>\
                 <item affiliation='member' role='none'/>",
                escape(&from),
                escape(&member.jid()),
            );
            if member.id() == client.id() {
                presence.push_str("<status code='110'/>");
            }
            presence.push_str("</x></presence>");
            member.send_stanza(presence);
        }
        if let Some(i) = self.members.iter().position(|m| m.id() == client.id()) {
            self.members.swap_remove(i);
        }
    }

    /// Deliver a groupchat stanza: rewrite `from` to `room/<sender nick>`
    /// and write one copy per member with `to` rebound.
    pub(crate) fn route_message(&self, el: &mut Element) {
        let nick = jid::node(el.attr("from").unwrap_or("")).to_string();
        el.set_attr("from", format!("{}/{}", self.jid, nick));
        for member in &self.members {
            el.set_attr("to", member.jid());
            member.send_stanza(el.to_string());
        }
    }
}
