use bytes::{Buf, BytesMut};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::element::{parse_scoped, read_tag, Element, NsScope, XmlError};
use super::Attr;

/// Upper bound on a single buffered stanza. Anything larger is not a stanza
/// this protocol produces and ends the connection.
const MAX_STANZA_LEN: usize = 256 * 1024;

const READ_CHUNK: usize = 4 * 1024;

/// Stream reading errors.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The enclosing element's end tag was reached; there are no further
    /// children on this stream.
    #[error("no more children")]
    NoMoreChildren,
    #[error("stanza exceeds {MAX_STANZA_LEN} bytes")]
    StanzaTooLarge,
    #[error(transparent)]
    Xml(#[from] XmlError),
    #[error("stream i/o: {0}")]
    Io(#[from] std::io::Error),
    /// The byte source ended before the stream's closing tag.
    #[error("unexpected end of stream")]
    UnexpectedEof,
}

/// Incremental reader of one top-level element's children.
///
/// `open` consumes the opening tag of the root element (skipping the XML
/// declaration and other prolog events) and exposes its attributes;
/// `next_child` then yields one fully materialized child element at a time,
/// reading more bytes from the source whenever the buffered input stops
/// short of a complete child.
pub struct ElementStream {
    buf: BytesMut,
    attrs: Vec<Attr>,
    scope: NsScope,
    ended: bool,
}

enum RootScan {
    Found { element: Element, scope: NsScope, consumed: usize, ended: bool },
    Skip(usize),
    NeedMore,
}

enum ChildScan {
    Child { start: usize, end: usize },
    Skip(usize),
    End(usize),
    NeedMore,
}

impl ElementStream {
    /// Read from `io` until the root element's start tag is complete.
    pub async fn open<R: AsyncRead + Unpin>(io: &mut R) -> Result<Self, StreamError> {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            match scan_root(&buf)? {
                RootScan::Found { element, scope, consumed, ended } => {
                    buf.advance(consumed);
                    return Ok(Self {
                        buf,
                        attrs: element.attrs,
                        scope,
                        ended,
                    });
                }
                RootScan::Skip(consumed) => {
                    buf.advance(consumed);
                }
                RootScan::NeedMore => {
                    read_more(io, &mut buf).await?;
                }
            }
        }
    }

    /// First root attribute whose local name matches.
    pub fn attr(&self, local: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name.local == local)
            .map(|a| a.value.as_str())
    }

    /// Next complete child element, or [`StreamError::NoMoreChildren`] once
    /// the root's end tag has been read.
    pub async fn next_child<R: AsyncRead + Unpin>(
        &mut self,
        io: &mut R,
    ) -> Result<Element, StreamError> {
        if self.ended {
            return Err(StreamError::NoMoreChildren);
        }
        loop {
            match scan_child(&self.buf)? {
                ChildScan::Child { start, end } => {
                    let element = parse_scoped(&self.buf[start..end], &self.scope)?;
                    self.buf.advance(end);
                    return Ok(element);
                }
                ChildScan::Skip(consumed) => {
                    self.buf.advance(consumed);
                }
                ChildScan::End(consumed) => {
                    self.buf.advance(consumed);
                    self.ended = true;
                    return Err(StreamError::NoMoreChildren);
                }
                ChildScan::NeedMore => {
                    read_more(io, &mut self.buf).await?;
                }
            }
        }
    }
}

async fn read_more<R: AsyncRead + Unpin>(
    io: &mut R,
    buf: &mut BytesMut,
) -> Result<(), StreamError> {
    if buf.len() >= MAX_STANZA_LEN {
        return Err(StreamError::StanzaTooLarge);
    }
    buf.reserve(READ_CHUNK);
    let n = io.read_buf(buf).await?;
    if n == 0 {
        return Err(StreamError::UnexpectedEof);
    }
    Ok(())
}

fn incremental_reader(buf: &[u8]) -> Reader<&[u8]> {
    let mut reader = Reader::from_reader(buf);
    // End-tag checking is off: incomplete buffers are expected here, and
    // children are re-parsed strictly once complete.
    reader.config_mut().check_end_names = false;
    reader
}

/// Locate the root element's start tag in the buffered prolog.
fn scan_root(buf: &[u8]) -> Result<RootScan, StreamError> {
    let mut reader = incremental_reader(buf);
    match reader.read_event() {
        Ok(Event::Start(ref start)) => {
            let (element, scope) = read_tag(start, &NsScope::default())?;
            Ok(RootScan::Found {
                element,
                scope,
                consumed: reader.buffer_position() as usize,
                ended: false,
            })
        }
        Ok(Event::Empty(ref start)) => {
            let (element, scope) = read_tag(start, &NsScope::default())?;
            Ok(RootScan::Found {
                element,
                scope,
                consumed: reader.buffer_position() as usize,
                ended: true,
            })
        }
        Ok(Event::Eof) => Ok(RootScan::NeedMore),
        Ok(_) => Ok(RootScan::Skip(reader.buffer_position() as usize)),
        // "Unclosed" syntax conditions mean the buffer cut an event short.
        Err(quick_xml::Error::Syntax(_)) => Ok(RootScan::NeedMore),
        Err(e) => Err(XmlError::Malformed(e.to_string()).into()),
    }
}

/// Advance through buffered events looking for one complete child element
/// or the root's end tag.
fn scan_child(buf: &[u8]) -> Result<ChildScan, StreamError> {
    let mut reader = incremental_reader(buf);
    let mut depth = 0usize;
    let mut start = 0usize;
    loop {
        let before = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Start(_)) => {
                if depth == 0 {
                    start = before;
                }
                depth += 1;
            }
            Ok(Event::Empty(_)) => {
                if depth == 0 {
                    return Ok(ChildScan::Child {
                        start: before,
                        end: reader.buffer_position() as usize,
                    });
                }
            }
            Ok(Event::End(_)) => {
                let after = reader.buffer_position() as usize;
                if depth == 0 {
                    return Ok(ChildScan::End(after));
                }
                depth -= 1;
                if depth == 0 {
                    return Ok(ChildScan::Child { start, end: after });
                }
            }
            Ok(Event::Eof) => return Ok(ChildScan::NeedMore),
            Ok(_) => {
                // Character data, comments and processing instructions at
                // the stream level are skipped; inside a child they stay in
                // the slice handed to the strict parser.
                if depth == 0 {
                    return Ok(ChildScan::Skip(reader.buffer_position() as usize));
                }
            }
            Err(quick_xml::Error::Syntax(_)) => return Ok(ChildScan::NeedMore),
            Err(e) => return Err(XmlError::Malformed(e.to_string()).into()),
        }
    }
}
