use crate::prelude::*;
use crate::sermatec::decoder::{FieldDecoder, Fields};
use crate::sermatec::frame::{self, FrameCheck, FrameFactory, KnownCommand};
use crate::sermatec::frame_decoder::FrameDecoder;
use crate::sermatec::parameter;
use crate::sermatec::schema::{SchemaRegistry, Translations};

use {
    async_trait::async_trait,
    bytes::{Bytes, BytesMut},
    std::sync::Arc,
    std::time::Duration,
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    tokio_util::codec::Decoder,
};

const VERSION_FIELD_TAG: &str = "protocol_version_number";

// Connector {{{
/// Opens the byte stream to an inverter.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    async fn connect(&self) -> std::io::Result<Self::Stream>;

    fn describe(&self) -> String {
        "inverter".to_string()
    }
}

#[derive(Clone, Debug)]
pub struct TcpConnector {
    host: String,
    port: u16,
    nodelay: bool,
    keepalive: Option<Duration>,
}

impl TcpConnector {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            nodelay: true,
            keepalive: None,
        }
    }

    pub fn from_config(inverter: &config::Inverter) -> Self {
        Self {
            host: inverter.host().to_string(),
            port: inverter.port(),
            nodelay: inverter.use_tcp_nodelay(),
            keepalive: inverter.keepalive(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = tokio::net::TcpStream;

    async fn connect(&self) -> std::io::Result<Self::Stream> {
        use net2::TcpStreamExt;

        let stream = tokio::net::TcpStream::connect((self.host.as_str(), self.port)).await?;

        let stream = match self.keepalive {
            Some(interval) => {
                let std_stream = stream.into_std()?;
                if let Err(e) = std_stream.set_keepalive(Some(interval)) {
                    warn!("Failed to set TCP keepalive: {}", e);
                }
                tokio::net::TcpStream::from_std(std_stream)?
            }
            None => stream,
        };

        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {}", e);
            }
        }

        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
} // }}}

// RetryPolicy {{{
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
    pub response_timeout: Duration,
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            drain_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(20),
            attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(inverter: &config::Inverter) -> Self {
        Self {
            connect_timeout: Duration::from_secs(inverter.connect_timeout()),
            drain_timeout: Duration::from_secs(inverter.drain_timeout()),
            response_timeout: Duration::from_secs(inverter.response_timeout()),
            attempts: inverter.attempts(),
        }
    }
} // }}}

// Link {{{
struct Link<S> {
    stream: S,
    buf: BytesMut,
    decoder: FrameDecoder,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Link<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(512),
            decoder: FrameDecoder::new(),
        }
    }

    /// One bounded write followed by one bounded read of `replies` frames.
    async fn exchange(&mut self, request: &[u8], replies: usize, policy: &RetryPolicy) -> Result<Vec<Bytes>> {
        if !self.buf.is_empty() {
            debug!("dropping {} stale bytes: {}", self.buf.len(), frame::hex(&self.buf));
            self.buf.clear();
        }

        debug!("TX {}", frame::hex(request));
        tokio::time::timeout(policy.drain_timeout, async {
            self.stream.write_all(request).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| Error::Timeout("writing request"))??;

        if replies == 0 {
            return Ok(Vec::new());
        }

        tokio::time::timeout(policy.response_timeout, self.read_frames(replies))
            .await
            .map_err(|_| Error::Timeout("waiting for reply"))?
    }

    async fn read_frames(&mut self, count: usize) -> Result<Vec<Bytes>> {
        let mut frames = Vec::with_capacity(count);

        while frames.len() < count {
            if let Some(frame) = self.decoder.decode(&mut self.buf)? {
                frames.push(frame);
                continue;
            }

            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }

        Ok(frames)
    }
} // }}}

enum State<S> {
    Disconnected,
    Connected(Link<S>),
}

/// Client for one inverter. Requests are strictly sequential; a second
/// caller needs its own instance or external locking.
pub struct Inverter<C: Connector = TcpConnector> {
    connector: C,
    policy: RetryPolicy,
    registry: Arc<SchemaRegistry>,
    translations: Arc<Translations>,
    state: State<C::Stream>,
    version: u32,
}

impl Inverter<TcpConnector> {
    /// Loads the protocol descriptor and translations named by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = SchemaRegistry::from_file(config.protocol_file())?;
        let translations = match config.translation_file() {
            Some(path) => Translations::from_file(path)?,
            None => Translations::new(),
        };

        Ok(Self::new(
            TcpConnector::from_config(&config.inverter),
            Arc::new(registry),
            Arc::new(translations),
        )
        .with_policy(RetryPolicy::from_config(&config.inverter)))
    }
}

impl<C: Connector> Inverter<C> {
    pub fn new(connector: C, registry: Arc<SchemaRegistry>, translations: Arc<Translations>) -> Self {
        Self {
            connector,
            policy: RetryPolicy::default(),
            registry,
            translations,
            state: State::Disconnected,
            version: 0,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, State::Connected(_))
    }

    /// Negotiated protocol version; 0 until discovered.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Opens the link and discovers the protocol version. Already being
    /// connected is a no-op. A failed version discovery leaves the client
    /// connected at version 0, unless the peer closed the link while
    /// answering it: then the error is returned even though the dial worked.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            debug!("{}: already connected", self.connector.describe());
            return Ok(());
        }
        self.version = 0;

        info!("connecting to {}", self.connector.describe());
        let stream = match tokio::time::timeout(self.policy.connect_timeout, self.connector.connect()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("failed to connect to {}: {}", self.connector.describe(), e);
                return Err(Error::Io(e));
            }
            Err(_) => {
                error!(
                    "connection to {} timed out after {:?}",
                    self.connector.describe(),
                    self.policy.connect_timeout
                );
                return Err(Error::Timeout("connecting"));
            }
        };

        self.state = State::Connected(Link::new(stream));
        info!("{}: connected!", self.connector.describe());

        match self.discover_version().await {
            Ok(version) => {
                info!("protocol version {}", crate::sermatec::decoder::render_version(version));
                self.version = version;
            }
            // the link itself died, there is nothing left to degrade to
            Err(e) if !self.is_connected() => return Err(e),
            Err(e) => warn!("could not read protocol version, using version 0: {}", e),
        }

        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let State::Connected(mut link) = std::mem::replace(&mut self.state, State::Disconnected) {
            if let Err(e) = link.stream.shutdown().await {
                debug!("error closing stream: {}", e);
            }
            info!("{}: disconnected", self.connector.describe());
        }
    }

    /// Queries a dataset by short name, e.g. `batteryStatus`.
    pub async fn query(&mut self, name: &str) -> Result<Fields> {
        self.ensure_connected()?;
        let code = self.registry.code_from_short_name(name)?;
        self.query_code(code).await
    }

    /// Queries by command code; only codes valid for the negotiated version
    /// are sent.
    pub async fn query_custom(&mut self, code: u8) -> Result<Fields> {
        self.ensure_connected()?;

        if !self.registry.query_commands(self.version).contains(&code) {
            error!("command 0x{:02x} is not queryable at version {}", code, self.version);
            return Err(Error::command_code(code));
        }

        self.query_code(code).await
    }

    /// Validated reply frames of `code` without any decoding.
    pub async fn query_raw(&mut self, code: u8) -> Result<Vec<Bytes>> {
        self.ensure_connected()?;
        self.exchange(code, &[]).await
    }

    /// Fields `code` reports at the negotiated version, without values.
    pub fn list_fields(&self, code: u8) -> Result<Fields> {
        let schema = self.registry.resolve_command(code, self.version)?;
        Ok(self.field_decoder().decode(schema, &[], true))
    }

    pub async fn set_parameter(&mut self, name: &str, friendly: &FieldValue) -> Result<()> {
        let param = parameter::parameter_info(name)?;
        let value = param.encode(friendly)?;
        let layout = param.layout()?;

        self.ensure_connected()?;

        let mut tagged = match layout.current_state_from {
            Some(source) => {
                let frames = self.exchange(source, &[]).await?;
                let reply = frames
                    .first()
                    .ok_or_else(|| Error::ResponseMalformed(format!("no reply to 0x{:02x}", source)))?;
                self.field_decoder().parse_parameter_reply(source, self.version, reply)?
            }
            None => Default::default(),
        };
        tagged.insert(param.name.to_string(), value);

        let payload = parameter::build_set_payload(layout.command, &tagged)?;
        self.exchange(layout.command, &payload).await?;

        info!("set {} to {}", name, friendly);
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn field_decoder(&self) -> FieldDecoder<'_> {
        FieldDecoder::new(&self.registry, &self.translations)
    }

    async fn query_code(&mut self, code: u8) -> Result<Fields> {
        // fail before touching the wire when there is no layout to decode with
        self.registry.resolve_command(code, self.version)?;

        let frames = self.exchange(code, &[]).await?;
        let decoder = self.field_decoder();
        let mut r = Fields::new();

        for (idx, (reply, reply_code)) in frames.iter().zip(frame::reply_commands(code)).enumerate() {
            match self.registry.resolve_command(reply_code, self.version) {
                Ok(schema) => r.extend(decoder.decode(schema, reply, false)),
                Err(e) if idx == 0 => return Err(e),
                Err(_) => debug!("no layout for reply 0x{:02x}, skipping", reply_code),
            }
        }

        Ok(r)
    }

    async fn discover_version(&mut self) -> Result<u32> {
        let code = u8::from(KnownCommand::SystemInformation);
        let frames = self.exchange(code, &[]).await?;
        let reply = frames
            .first()
            .ok_or_else(|| Error::ResponseMalformed("no system information reply".to_string()))?;

        // the version field sits at the same place in every layout
        let fields = self.field_decoder().parse_reply(code, 0, reply, false)?;
        let version = fields
            .get(VERSION_FIELD_TAG)
            .and_then(|f| f.value.as_ref())
            .and_then(FieldValue::as_i64)
            .ok_or_else(|| Error::ResponseMalformed(format!("'{}' missing", VERSION_FIELD_TAG)))?;

        u32::try_from(version).map_err(|_| Error::ResponseMalformed(format!("version {} out of range", version)))
    }

    /// Sends `code` and collects its validated replies, retrying timeouts and
    /// integrity failures within the attempt budget.
    async fn exchange(&mut self, code: u8, payload: &[u8]) -> Result<Vec<Bytes>> {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.attempt(code, payload).await {
                Ok(frames) => return Ok(frames),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!("0x{:02x}: attempt {}/{} failed: {}, retrying", code, attempt, attempts, e);
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        error!("0x{:02x}: giving up after {} attempts: {}", code, attempts, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(&mut self, code: u8, payload: &[u8]) -> Result<Vec<Bytes>> {
        let request = FrameFactory::build(code, payload)?;
        let expected = frame::reply_commands(code).len();
        let policy = self.policy;

        let link = match &mut self.state {
            State::Connected(link) => link,
            State::Disconnected => return Err(Error::NotConnected),
        };

        let frames = match link.exchange(&request, expected, &policy).await {
            Ok(frames) => frames,
            Err(e @ (Error::ConnectionClosed | Error::Io(_))) => {
                warn!("{}: connection lost: {}", self.connector.describe(), e);
                self.state = State::Disconnected;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if !FrameCheck::validate_replies(&frames, code) {
            return Err(Error::IntegrityCheckFailed(code));
        }

        Ok(frames)
    }
}
