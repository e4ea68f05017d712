//! In-process fake node speaking the server side of the native protocol.
//!
//! Every request frame is handed to a user supplied reactor, which decides
//! whether to answer it (possibly late), drop it or close the connection.
//! Requests the reactor does not care about get a sensible default answer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::RemoteHandle;
use futures::FutureExt;
use quorum_cql::errors::DbError;
use quorum_cql::frame::request::{options, Request, RequestDeserializationError, RequestOpcode};
use quorum_cql::frame::response::ResponseOpcode;
use quorum_cql::frame::{self, types, Compression, FrameParams, HEADER_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

const FLAG_COMPRESSION: u8 = 0x01;

/// A request as received by a [`MockNode`], already decompressed.
#[derive(Clone, Debug)]
pub(crate) struct RequestFrame {
    pub(crate) params: FrameParams,
    pub(crate) opcode: RequestOpcode,
    pub(crate) body: Bytes,
    /// Index of the connection, in accept order.
    pub(crate) connection: usize,
}

impl RequestFrame {
    pub(crate) fn deserialize(&self) -> Result<Request<'_>, RequestDeserializationError> {
        Request::deserialize(&mut &self.body[..], self.opcode)
    }

    /// Text of a QUERY or PREPARE request.
    pub(crate) fn statement_text(&self) -> Option<String> {
        match self.deserialize().ok()? {
            Request::Query(query) => Some(query.contents.into_owned()),
            Request::Prepare(prepare) => Some(prepare.query.into_owned()),
            _ => None,
        }
    }

    /// Raw paging state of a QUERY or EXECUTE request.
    pub(crate) fn paging_state(&self) -> Option<Bytes> {
        match self.deserialize().ok()? {
            Request::Query(query) => query.parameters.paging_state,
            Request::Execute(execute) => execute.parameters.paging_state,
            _ => None,
        }
    }
}

/// A response the node will write, on the stream of the request it answers.
#[derive(Clone, Debug)]
pub(crate) struct ResponseFrame {
    pub(crate) opcode: ResponseOpcode,
    pub(crate) body: Bytes,
    /// Overrides the protocol version echoed from the request.
    pub(crate) version: Option<u8>,
}

impl ResponseFrame {
    fn new(opcode: ResponseOpcode, body: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            body: body.into(),
            version: None,
        }
    }

    pub(crate) fn with_version(mut self, version: u8) -> Self {
        self.version = Some(version);
        self
    }

    pub(crate) fn forged_error(error: DbError, msg: &str) -> Self {
        let mut buf = BytesMut::new();
        types::write_int(error.code(), &mut buf);
        types::write_string(msg, &mut buf).unwrap();

        match error {
            DbError::Unavailable {
                consistency,
                required,
                alive,
            } => {
                types::write_consistency(consistency, &mut buf);
                types::write_int(required, &mut buf);
                types::write_int(alive, &mut buf);
            }
            DbError::WriteTimeout {
                consistency,
                received,
                required,
                write_type,
            } => {
                types::write_consistency(consistency, &mut buf);
                types::write_int(received, &mut buf);
                types::write_int(required, &mut buf);
                types::write_string(write_type.as_str(), &mut buf).unwrap();
            }
            DbError::ReadTimeout {
                consistency,
                received,
                required,
                data_present,
            } => {
                types::write_consistency(consistency, &mut buf);
                types::write_int(received, &mut buf);
                types::write_int(required, &mut buf);
                buf.put_u8(u8::from(data_present));
            }
            DbError::AlreadyExists { keyspace, table } => {
                types::write_string(&keyspace, &mut buf).unwrap();
                types::write_string(&table, &mut buf).unwrap();
            }
            DbError::Unprepared { statement_id } => {
                types::write_short_bytes(&statement_id, &mut buf).unwrap();
            }
            _ => (),
        }

        Self::new(ResponseOpcode::Error, buf.freeze())
    }

    pub(crate) fn forged_supported(options: &[(&str, &[&str])]) -> Self {
        let options: HashMap<String, Vec<String>> = options
            .iter()
            .map(|(key, values)| {
                (
                    key.to_string(),
                    values.iter().map(|v| v.to_string()).collect(),
                )
            })
            .collect();
        let mut buf = BytesMut::new();
        types::write_string_multimap(&options, &mut buf).unwrap();
        Self::new(ResponseOpcode::Supported, buf.freeze())
    }

    pub(crate) fn forged_ready() -> Self {
        Self::new(ResponseOpcode::Ready, Bytes::new())
    }

    pub(crate) fn forged_void() -> Self {
        let mut buf = BytesMut::new();
        types::write_int(0x0001, &mut buf);
        Self::new(ResponseOpcode::Result, buf.freeze())
    }

    /// Rows without column metadata. `None` cells are nulls.
    pub(crate) fn forged_rows(
        col_count: usize,
        rows: &[Vec<Option<&[u8]>>],
        paging_state: Option<&[u8]>,
    ) -> Self {
        const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
        const FLAG_NO_METADATA: i32 = 0x0004;

        let mut buf = BytesMut::new();
        types::write_int(0x0002, &mut buf);
        let mut flags = FLAG_NO_METADATA;
        if paging_state.is_some() {
            flags |= FLAG_HAS_MORE_PAGES;
        }
        types::write_int(flags, &mut buf);
        types::write_int(col_count as i32, &mut buf);
        if let Some(state) = paging_state {
            types::write_bytes(state, &mut buf).unwrap();
        }
        types::write_int(rows.len() as i32, &mut buf);
        for row in rows {
            for cell in row {
                types::write_bytes_opt(*cell, &mut buf).unwrap();
            }
        }
        Self::new(ResponseOpcode::Result, buf.freeze())
    }

    pub(crate) fn forged_set_keyspace(keyspace: &str) -> Self {
        let mut buf = BytesMut::new();
        types::write_int(0x0003, &mut buf);
        types::write_string(keyspace, &mut buf).unwrap();
        Self::new(ResponseOpcode::Result, buf.freeze())
    }

    pub(crate) fn forged_prepared(id: &[u8]) -> Self {
        let mut buf = BytesMut::new();
        types::write_int(0x0004, &mut buf);
        types::write_short_bytes(id, &mut buf).unwrap();
        // prepared metadata and result metadata, both empty
        for _ in 0..2 {
            types::write_int(0x0004, &mut buf);
            types::write_int(0, &mut buf);
        }
        Self::new(ResponseOpcode::Result, buf.freeze())
    }

    pub(crate) fn forged_schema_change(keyspace: &str) -> Self {
        let mut buf = BytesMut::new();
        types::write_int(0x0005, &mut buf);
        types::write_string("CREATED", &mut buf).unwrap();
        types::write_string("KEYSPACE", &mut buf).unwrap();
        types::write_string(keyspace, &mut buf).unwrap();
        Self::new(ResponseOpcode::Result, buf.freeze())
    }

    pub(crate) fn forged_authenticate(authenticator: &str) -> Self {
        let mut buf = BytesMut::new();
        types::write_string(authenticator, &mut buf).unwrap();
        Self::new(ResponseOpcode::Authenticate, buf.freeze())
    }

    pub(crate) fn forged_auth_challenge(token: &[u8]) -> Self {
        let mut buf = BytesMut::new();
        types::write_bytes(token, &mut buf).unwrap();
        Self::new(ResponseOpcode::AuthChallenge, buf.freeze())
    }

    pub(crate) fn forged_auth_success() -> Self {
        let mut buf = BytesMut::new();
        types::write_bytes_opt(None::<&[u8]>, &mut buf).unwrap();
        Self::new(ResponseOpcode::AuthSuccess, buf.freeze())
    }

    pub(crate) fn forged_status_up_event(addr: SocketAddr) -> Self {
        let mut buf = BytesMut::new();
        types::write_string("STATUS_CHANGE", &mut buf).unwrap();
        types::write_string("UP", &mut buf).unwrap();
        types::write_inet(addr, &mut buf);
        Self::new(ResponseOpcode::Event, buf.freeze())
    }

    /// What a healthy node answers to `request`.
    fn default_for(request: &RequestFrame) -> Self {
        match request.opcode {
            RequestOpcode::Options => Self::forged_supported(&[
                (options::COMPRESSION, &["lz4", "snappy"]),
                (options::CQL_VERSION, &["3.0.0"]),
            ]),
            RequestOpcode::Startup | RequestOpcode::Register => Self::forged_ready(),
            RequestOpcode::Query => match request.statement_text() {
                Some(text) if text.starts_with("USE ") => {
                    let keyspace = text["USE ".len()..].trim_matches('"').to_owned();
                    Self::forged_set_keyspace(&keyspace)
                }
                _ => Self::forged_void(),
            },
            RequestOpcode::Execute | RequestOpcode::Batch => Self::forged_void(),
            RequestOpcode::Prepare => {
                let text = request.statement_text().unwrap_or_default();
                Self::forged_prepared(&prepared_id_for(&text))
            }
            RequestOpcode::AuthResponse => Self::forged_auth_success(),
        }
    }

    fn encode(&self, request_params: FrameParams) -> Vec<u8> {
        let version = self.version.unwrap_or(request_params.version & 0x7F);
        let mut data = Vec::with_capacity(HEADER_SIZE + self.body.len());
        data.put_u8(0x80 | version);
        data.put_u8(0);
        data.put_i16(request_params.stream);
        data.put_u8(self.opcode as u8);
        data.put_u32(self.body.len() as u32);
        data.extend_from_slice(&self.body);
        data
    }
}

/// Id a [`MockNode`] assigns when preparing `text` by default.
pub(crate) fn prepared_id_for(text: &str) -> Vec<u8> {
    let mut id = text.as_bytes().to_vec();
    id.truncate(16);
    id
}

/// What a [`MockNode`] does with one request.
#[derive(Clone, Debug)]
pub(crate) enum Reaction {
    /// Answer as a healthy node would.
    Default,
    Respond(ResponseFrame),
    /// Perform the inner reaction after a delay, without blocking other requests.
    Delay(Duration, Box<Reaction>),
    /// Never answer.
    Drop,
    /// Close the connection the request came on.
    Close,
}

impl Reaction {
    pub(crate) fn delayed(delay: Duration, reaction: Reaction) -> Self {
        Reaction::Delay(delay, Box::new(reaction))
    }
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

type Reactor = dyn Fn(&RequestFrame) -> Reaction + Send + Sync;

#[derive(Default)]
struct MockNodeState {
    accepted: AtomicUsize,
    received: Mutex<Vec<RequestFrame>>,
    writers: Mutex<Vec<mpsc::UnboundedSender<Outgoing>>>,
}

/// A fake node listening on an ephemeral localhost port.
///
/// Stops listening and drops its connections when dropped.
pub(crate) struct MockNode {
    address: SocketAddr,
    state: Arc<MockNodeState>,
    _server: RemoteHandle<()>,
}

impl MockNode {
    /// A node that answers everything the default way.
    pub(crate) async fn start() -> Self {
        Self::with_reactor(|_| Reaction::Default).await
    }

    pub(crate) async fn with_reactor(
        reactor: impl Fn(&RequestFrame) -> Reaction + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let state = Arc::new(MockNodeState::default());
        let reactor: Arc<Reactor> = Arc::new(reactor);

        let (server, handle) = Self::accept_loop(listener, state.clone(), reactor).remote_handle();
        tokio::spawn(server);

        MockNode {
            address,
            state,
            _server: handle,
        }
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    /// Number of connections accepted so far.
    pub(crate) fn accepted_connections(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Number of requests of the given kind received so far.
    pub(crate) fn received(&self, opcode: RequestOpcode) -> usize {
        self.received_frames()
            .iter()
            .filter(|frame| frame.opcode == opcode)
            .count()
    }

    pub(crate) fn received_frames(&self) -> Vec<RequestFrame> {
        self.state
            .received
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Pushes an EVENT frame on stream -1 of every open connection.
    pub(crate) fn push_event(&self, event: ResponseFrame) {
        let params = FrameParams {
            version: 0x04,
            flags: 0,
            stream: frame::EVENT_STREAM_ID,
        };
        let data = event.encode(params);
        for writer in self.state.writers.lock().unwrap().iter() {
            let _ = writer.send(Outgoing::Frame(data.clone()));
        }
    }

    async fn accept_loop(listener: TcpListener, state: Arc<MockNodeState>, reactor: Arc<Reactor>) {
        let mut connections = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            let connection = state.accepted.fetch_add(1, Ordering::SeqCst);
            let (serve, handle) =
                Self::serve_connection(socket, connection, state.clone(), reactor.clone())
                    .remote_handle();
            tokio::spawn(serve);
            connections.push(handle);
        }
    }

    async fn serve_connection(
        socket: TcpStream,
        connection: usize,
        state: Arc<MockNodeState>,
        reactor: Arc<Reactor>,
    ) {
        let (mut read_half, mut write_half) = socket.into_split();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        state.writers.lock().unwrap().push(sender.clone());

        let writer = async move {
            while let Some(outgoing) = receiver.recv().await {
                match outgoing {
                    Outgoing::Frame(data) => {
                        if write_half.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = write_half.shutdown().await;
                        break;
                    }
                }
            }
        };
        let (writer, _writer_handle) = writer.remote_handle();
        tokio::spawn(writer);

        let mut compression = None;
        loop {
            let mut header = [0u8; HEADER_SIZE];
            if read_half.read_exact(&mut header).await.is_err() {
                break;
            }
            let mut buf = &header[..];
            let params = FrameParams {
                version: buf.get_u8(),
                flags: buf.get_u8(),
                stream: buf.get_i16(),
            };
            let Ok(opcode) = RequestOpcode::try_from(buf.get_u8()) else {
                break;
            };
            let mut body = vec![0u8; buf.get_u32() as usize];
            if read_half.read_exact(&mut body).await.is_err() {
                break;
            }
            if params.flags & FLAG_COMPRESSION != 0 {
                match compression.map(|c| frame::decompress(&body, c)) {
                    Some(Ok(decompressed)) => body = decompressed,
                    _ => break,
                }
            }

            let request = RequestFrame {
                params,
                opcode,
                body: body.into(),
                connection,
            };

            if let Ok(Request::Startup(startup)) = request.deserialize() {
                compression = match startup.options.get(options::COMPRESSION).map(|c| c.as_ref()) {
                    Some("lz4") => Some(Compression::Lz4),
                    Some("snappy") => Some(Compression::Snappy),
                    _ => None,
                };
            }

            state.received.lock().unwrap().push(request.clone());
            let reaction = reactor(&request);
            Self::react(reaction, &request, sender.clone());
        }
    }

    fn react(reaction: Reaction, request: &RequestFrame, sender: mpsc::UnboundedSender<Outgoing>) {
        match reaction {
            Reaction::Default => {
                let response = ResponseFrame::default_for(request);
                let _ = sender.send(Outgoing::Frame(response.encode(request.params)));
            }
            Reaction::Respond(response) => {
                let _ = sender.send(Outgoing::Frame(response.encode(request.params)));
            }
            Reaction::Delay(delay, inner) => {
                let request = request.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    Self::react(*inner, &request, sender);
                });
            }
            Reaction::Drop => {}
            Reaction::Close => {
                let _ = sender.send(Outgoing::Close);
            }
        }
    }
}

/// An address nothing listens on.
pub(crate) async fn unused_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
