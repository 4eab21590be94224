//! sbrwxmpp - XMPP server variant for the SBRW game chat client.
//!
//! Accepts TCP connections, negotiates mandatory STARTTLS, performs the
//! legacy `jabber:iq:auth` handshake and routes one-to-one and groupchat
//! message stanzas between live sessions. An HTTP side-plane exposes
//! session/room introspection, message injection, credential provisioning
//! and forced disconnects.

pub mod api;
pub mod certgen;
pub mod chatlog;
pub mod cmdhook;
pub mod config;
pub mod db;
pub mod jid;
pub mod network;
pub mod state;
pub mod token;
pub mod xml;
