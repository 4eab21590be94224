//! Connection - handles an individual client connection.
//!
//! Each connection runs in its own tokio task and walks the stream
//! lifecycle: stream open → mandatory STARTTLS → stream reopen → legacy
//! iq-auth → stanza loop → close. The task is the single writer for its
//! socket: its own protocol replies are written inline, and stanzas queued
//! by the router or the admin plane arrive over the session's control
//! channel and are drained between reads.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, instrument, warn, Span};

use crate::chatlog;
use crate::cmdhook::CmdHook;
use crate::db::Db;
use crate::jid;
use crate::network::transport::Transport;
use crate::state::{ClientHandle, Outbound, Registry};
use crate::token;
use crate::xml::{Element, ElementStream, StreamError};

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";
const STREAM_END: &str = "</stream:stream>";

/// How long a locally initiated close waits for the peer's closing tag
/// before the socket is forced shut.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Why a session ended. Sessions never propagate errors to their peers;
/// these are logged and the connection is dropped.
#[derive(Debug, Error)]
enum SessionError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("write failed: {0}")]
    Write(io::Error),
    #[error("tls handshake failed: {0}")]
    Tls(io::Error),
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Closed,
}

/// A client connection handler.
pub struct Connection {
    addr: SocketAddr,
    transport: Transport,
    acceptor: TlsAcceptor,
    registry: Arc<Registry>,
    db: Db,
    webhook: Arc<CmdHook>,
    handle: Arc<ClientHandle>,
    control: mpsc::UnboundedReceiver<Outbound>,
    authenticated: bool,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        acceptor: TlsAcceptor,
        registry: Arc<Registry>,
        db: Db,
        webhook: Arc<CmdHook>,
    ) -> Self {
        let (handle, control) = registry.new_handle();
        Self {
            addr,
            transport: Transport::Plain(stream),
            acceptor,
            registry,
            db,
            webhook,
            handle,
            control,
            authenticated: false,
        }
    }

    /// Run the connection lifecycle. Teardown always removes the session
    /// from every room and from the client list before the socket closes.
    #[instrument(skip(self), name = "connection", fields(addr = %self.addr, stream = tracing::field::Empty))]
    pub async fn run(mut self) {
        if let Err(e) = self.serve().await {
            debug!(error = %e, "session error");
        }
        self.registry.remove_client(&self.handle);
        let _ = self.transport.shutdown().await;
        info!("connection closed");
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        let mut stream = self.open_stream().await?;
        loop {
            tokio::select! {
                biased;
                Some(out) = self.control.recv() => {
                    if self.apply(out, &mut stream).await? == Flow::Closed {
                        return Ok(());
                    }
                }
                child = stream.next_child(&mut self.transport) => match child {
                    Ok(el) => {
                        if el.name.local == "starttls" && !self.transport.is_tls() {
                            stream = self.start_tls().await?;
                            continue;
                        }
                        self.handle_element(el).await?;
                        // Anything the handler queued for this session goes
                        // out before the next stanza is read.
                        if self.flush_control(&mut stream).await? == Flow::Closed {
                            return Ok(());
                        }
                    }
                    Err(StreamError::NoMoreChildren) => {
                        debug!("xml stream ended by peer");
                        let _ = self.write_raw(STREAM_END).await;
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    async fn apply(
        &mut self,
        out: Outbound,
        stream: &mut ElementStream,
    ) -> Result<Flow, SessionError> {
        match out {
            Outbound::Stanza(stanza) => {
                self.write_raw(&stanza).await?;
                Ok(Flow::Continue)
            }
            Outbound::CloseError(condition) => {
                self.close_with_error(&condition, stream).await;
                Ok(Flow::Closed)
            }
        }
    }

    async fn flush_control(&mut self, stream: &mut ElementStream) -> Result<Flow, SessionError> {
        while let Ok(out) = self.control.try_recv() {
            if self.apply(out, stream).await? == Flow::Closed {
                return Ok(Flow::Closed);
            }
        }
        Ok(Flow::Continue)
    }

    /// Read the peer's stream opening and answer with the server header
    /// and the feature set for the current transport.
    async fn open_stream(&mut self) -> Result<ElementStream, SessionError> {
        let stream = ElementStream::open(&mut self.transport).await?;
        let client_from = stream.attr("from").unwrap_or("").to_string();
        debug!(from = %client_from, "received stream start");

        let id = token::secure(token::STREAM_ID_LEN);
        Span::current().record("stream", id.as_str());
        let header = format!(
            "{XML_DECLARATION}<stream:stream \
             from='{}' \
             id='{id}' \
             version='1.0' \
             xml:lang='en' \
             xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams'>",
            self.registry.domain(),
        );
        self.write_raw(&header).await?;
        if self.transport.is_tls() {
            self.write_raw(
                "<stream:features><auth xmlns='http://jabber.org/features/iq-auth'/></stream:features>",
            )
            .await?;
        } else {
            self.write_raw(
                "<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></stream:features>",
            )
            .await?;
        }
        Ok(stream)
    }

    /// `<proceed/>`, TLS handshake, then a fresh stream over the encrypted
    /// transport.
    async fn start_tls(&mut self) -> Result<ElementStream, SessionError> {
        self.write_raw("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await?;
        self.transport
            .upgrade_to_tls(&self.acceptor)
            .await
            .map_err(SessionError::Tls)?;
        debug!("starttls upgrade successful");
        self.open_stream().await
    }

    async fn handle_element(&mut self, el: Element) -> Result<(), SessionError> {
        match el.name.local.as_str() {
            // The plaintext case restarts the stream and is handled by the
            // caller; a repeated starttls on an encrypted stream is ignored.
            "starttls" => {}
            // Before the TLS upgrade only starttls means anything.
            "iq" if self.transport.is_tls() => self.handle_iq(&el).await?,
            "iq" => {}
            "presence" if self.authenticated => self.handle_presence(&el),
            "message" if self.authenticated => self.handle_message(el).await?,
            "presence" | "message" => {}
            _ => debug!(element = %el, "ignoring unknown element"),
        }
        Ok(())
    }

    async fn handle_iq(&mut self, el: &Element) -> Result<(), SessionError> {
        let id = el.attr("id").unwrap_or("").to_string();
        let typ = el.attr("type").unwrap_or("");
        if id.is_empty() || (typ != "get" && typ != "set") {
            warn!("iq with invalid id or type");
            return Ok(());
        }
        let is_get = typ == "get";
        for child in &el.children {
            if child.name.local == "query" && child.name.space == "jabber:iq:auth" {
                debug!("received authentication iq");
                if is_get {
                    self.write_raw(&format!(
                        "<iq type='result' id='{id}'><query xmlns='jabber:iq:auth'>\
                         <username/><password/><resource/></query></iq>"
                    ))
                    .await?;
                } else {
                    self.authenticate(&id, child).await?;
                }
            } else {
                debug!("received unknown iq");
                self.write_raw(&format!(
                    "<iq type='error' id='{id}' from='{}'><error type='cancel'>\
                     <service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
                     </error></iq>",
                    self.registry.domain(),
                ))
                .await?;
            }
        }
        Ok(())
    }

    async fn authenticate(&mut self, id: &str, query: &Element) -> Result<(), SessionError> {
        let username = query.child("username").map(|c| c.text.as_str()).unwrap_or("");
        let password = query.child("password").map(|c| c.text.as_str()).unwrap_or("");
        let resource = query.child("resource").map(|c| c.text.as_str()).unwrap_or("");

        let user = match self.db.get_user(username) {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, "credential lookup failed");
                self.write_raw(&format!(
                    "<iq type='error' id='{id}'><error type='cancel'>\
                     <internal-server-error xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
                     </error></iq>"
                ))
                .await?;
                return Ok(());
            }
        };
        if user.password != password.as_bytes() {
            self.write_raw(&format!(
                "<iq type='error' id='{id}'><error code='401' type='auth'>\
                 <not-authorized xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
                 </error></iq>"
            ))
            .await?;
            return Ok(());
        }

        let full_jid = format!("{username}@{}/{resource}", self.registry.domain());
        self.handle.set_jid(full_jid.clone());
        info!(jid = %full_jid, "jid set");
        // At most one resource per bare JID: displace any earlier login.
        self.registry.evict_conflicting(&full_jid);
        self.write_raw(&format!("<iq type='result' id='{id}'/>")).await?;
        self.authenticated = true;
        Ok(())
    }

    fn handle_presence(&mut self, el: &Element) {
        let to = el.attr("to").unwrap_or("");
        let typ = el.attr("type").unwrap_or("");
        if to.is_empty() {
            debug!("adding client to available clients");
            self.registry.add_client(&self.handle);
            return;
        }
        let to_bare = jid::bare(to);
        if typ.is_empty() {
            debug!("handling presence as groupchat 1.0 join");
            self.registry.join_room(&self.handle, to_bare);
        } else if typ == "unavailable" {
            debug!("handling presence as groupchat 1.0 leave");
            self.registry.leave_room(&self.handle, to_bare);
        }
    }

    async fn handle_message(&mut self, mut el: Element) -> Result<(), SessionError> {
        debug!(stanza = %el, "handling message");
        if let Some(body) = el.child("body") {
            let text = body.text.clone();
            chatlog::process_message(&text);
            if self.webhook.process_message(&self.handle.jid(), &text).await {
                return Ok(());
            }
        }
        el.set_attr("from", self.handle.jid());
        self.registry.route_message(el);
        Ok(())
    }

    /// Locally initiated close: stream error, closing tag, then a bounded
    /// wait for the peer to close its side.
    async fn close_with_error(&mut self, condition: &str, stream: &mut ElementStream) {
        let _ = self
            .write_raw(&format!("<stream:error>{condition}</stream:error>"))
            .await;
        let _ = self.write_raw(STREAM_END).await;
        let _ = tokio::time::timeout(CLOSE_GRACE, async {
            loop {
                if stream.next_child(&mut self.transport).await.is_err() {
                    break;
                }
            }
        })
        .await;
    }

    async fn write_raw(&mut self, payload: &str) -> Result<(), SessionError> {
        debug!(payload = %payload, "send");
        // One write per stanza: the game client cannot reassemble a stanza
        // split across TLS records.
        self.transport
            .write_all(payload.as_bytes())
            .await
            .map_err(SessionError::Write)?;
        self.transport.flush().await.map_err(SessionError::Write)
    }
}
