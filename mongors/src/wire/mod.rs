//! OP_MSG framing, request/reply identifiers, and compression negotiation
//! hooks (`spec.md` §4.2). No topology or selection awareness lives here;
//! this module only knows how to put a command document on a socket and
//! take a reply document back off it.

mod compression;
mod message;

pub use compression::{negotiate_compressor, Compressor};
pub use message::{MessageFlags, OpCode};

use std::sync::atomic::{AtomicI32, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bson::{self, Document};
use crate::error::{Error, Result};
use crate::selection::ReadPreference;
use crate::sdam::ServerKind;

/// Process-wide monotonically increasing requestId, one per [`crate::Client`]
/// (`spec.md` §5 "Shared resources"). `fetch_add` wraps on overflow; ids
/// must be unique-per-call and strictly increasing, so a plain atomic
/// counter is the correct primitive rather than a randomly generated id.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicI32,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        RequestIdGenerator {
            next: AtomicI32::new(1),
        }
    }

    pub fn next(&self) -> i32 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends `command` as an OP_MSG and returns the decoded reply document.
/// Appends `$readPreference` only when `server_kind` is Mongos and the
/// preference's mode is not `primary`, matching `spec.md` §4.2 exactly: a
/// replica-set member is steered purely by which socket the selector
/// chose, not by a wire-level hint.
pub async fn send_command<S: AsyncRead + AsyncWrite + Unpin + Send>(
    stream: &mut S,
    request_id: i32,
    db: &str,
    mut command: Document,
    read_pref: Option<&ReadPreference>,
    server_kind: ServerKind,
    compressor: Option<Compressor>,
) -> Result<Document> {
    command.insert("$db", db.to_string());
    if let Some(pref) = read_pref {
        if server_kind == ServerKind::Mongos && !pref.is_primary() {
            command.insert("$readPreference", pref.to_document());
        }
    }

    let body = bson::encode_document(&command);
    write_op_msg(stream, request_id, &body, compressor).await?;
    let (_response_to, reply_body) = read_op_msg(stream).await?;
    bson::decode_document(&reply_body).map_err(Error::from)
}

async fn write_op_msg<S: AsyncWrite + Unpin>(
    stream: &mut S,
    request_id: i32,
    body: &[u8],
    compressor: Option<Compressor>,
) -> Result<()> {
    // message body: flagBits:u32 | section kind 0x00 | document
    let mut message_body = Vec::with_capacity(5 + body.len());
    message_body.extend_from_slice(&MessageFlags::empty().bits().to_le_bytes());
    message_body.push(0x00); // section kind 0: a single BSON document
    message_body.extend_from_slice(body);

    let (op_code, payload) = match compressor {
        Some(c) => (OpCode::Compressed, c.wrap(&message_body, OpCode::Message as i32)?),
        None => (OpCode::Message, message_body),
    };

    let total_len = 16 + payload.len();
    let mut header = Vec::with_capacity(total_len);
    header.extend_from_slice(&(total_len as i32).to_le_bytes());
    header.extend_from_slice(&request_id.to_le_bytes());
    header.extend_from_slice(&0i32.to_le_bytes()); // responseTo
    header.extend_from_slice(&(op_code as i32).to_le_bytes());
    header.extend_from_slice(&payload);

    stream.write_all(&header).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_op_msg<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(i32, Vec<u8>)> {
    let mut header = [0u8; 16];
    stream.read_exact(&mut header).await?;
    let total_len = i32::from_le_bytes(header[0..4].try_into().unwrap());
    let response_to = i32::from_le_bytes(header[8..12].try_into().unwrap());
    let op_code = i32::from_le_bytes(header[12..16].try_into().unwrap());

    let mut payload = vec![0u8; (total_len as usize).saturating_sub(16)];
    stream.read_exact(&mut payload).await?;

    let message_body = if op_code == OpCode::Compressed as i32 {
        compression::unwrap(&payload)?
    } else {
        payload
    };

    // flagBits:u32 | one or more sections; core operations use exactly one
    // kind-0 section carrying the reply document.
    if message_body.len() < 5 {
        return Err(Error::Network(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "OP_MSG body shorter than flagBits+section header",
        )));
    }
    let kind = message_body[4];
    if kind != 0x00 {
        return Err(Error::Network(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported OP_MSG section kind {kind} in reply"),
        )));
    }
    Ok((response_to, message_body[5..].to_vec()))
}

/// Glues a split read-half/write-half back into a single `AsyncRead +
/// AsyncWrite` so [`send_command`] (which wants one duplex stream) can be
/// reused by both the monitor's heartbeat socket and the pool's handshake.
pub(crate) struct Duplex<'a, R, W> {
    pub reader: &'a mut R,
    pub writer: &'a mut W,
}

impl<'a, R: AsyncRead + Unpin, W> AsyncRead for Duplex<'a, R, W> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut *this.reader).poll_read(cx, buf)
    }
}

impl<'a, R, W: AsyncWrite + Unpin> AsyncWrite for Duplex<'a, R, W> {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut *this.writer).poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut *this.writer).poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut *this.writer).poll_shutdown(cx)
    }
}

/// Extracts the handful of fields Session/Topology need from a reply without
/// a second full decode, using the zero-copy [`crate::bson::RawDocument`]
/// view.
pub struct ReplyMetadata {
    pub cluster_time: Option<Document>,
    pub operation_time: Option<bson::Timestamp>,
    pub error_labels: Vec<String>,
    pub ok: bool,
}

/// The handful of `hello` reply fields a freshly established [`crate::pool`]
/// connection needs before it can be handed to a caller (`spec.md` §4.6
/// "Handshake performed on new connections and must complete before
/// availability").
pub struct HandshakeResult {
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub compressor: Option<Compressor>,
}

/// Sends the initial `hello` on a brand-new connection and negotiates
/// compression, mirroring the monitor's own heartbeat handshake
/// (`crate::sdam::monitor`) but without the `topologyVersion`/
/// `maxAwaitTimeMS` awaitable-hello fields, which only apply to the
/// long-lived monitoring socket.
pub async fn handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    options: &crate::options::ClientOptions,
) -> Result<HandshakeResult>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut command = Document::new();
    command.insert("hello", 1i32);
    command.insert("helloOk", true);
    if !options.compressors.is_empty() {
        let compressors: Vec<bson::Bson> = options
            .compressors
            .iter()
            .map(|c| bson::Bson::String(c.clone()))
            .collect();
        command.insert("compression", compressors);
    }
    command.insert("client", crate::options::client_metadata(options));

    let mut duplex = Duplex { reader, writer };
    let reply = send_command(&mut duplex, 0, "admin", command, None, crate::sdam::ServerKind::Unknown, None).await?;

    let server_compressors: Vec<String> = reply
        .get_array("compression")
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let compressor = negotiate_compressor(&options.compressors, &server_compressors);

    Ok(HandshakeResult {
        min_wire_version: reply.get_i32("minWireVersion").unwrap_or(0),
        max_wire_version: reply.get_i32("maxWireVersion").unwrap_or(0),
        compressor,
    })
}

pub fn extract_reply_metadata(reply: &Document) -> ReplyMetadata {
    let ok = reply.get_f64("ok").map(|v| v != 0.0).unwrap_or(false);
    let cluster_time = reply.get_document("$clusterTime").cloned();
    let operation_time = reply.get_timestamp("operationTime");
    let error_labels = reply
        .get_array("errorLabels")
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    ReplyMetadata {
        cluster_time,
        operation_time,
        error_labels,
        ok,
    }
}
