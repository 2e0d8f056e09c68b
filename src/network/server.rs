//! Line-oriented TCP front end for uploading, running and inspecting programs.
//!
//! Every connection gets its own session task. A session shows the menu, reads one
//! choice per line and dispatches to upload, execute or info. Invalid input answers
//! `Err` and closes the session.
//!
//! # Execution
//!
//! Programs run on a blocking worker so a busy guest never stalls the runtime. While
//! the worker runs, bytes arriving on the connection are forwarded to guest stdin and
//! guest output is streamed back as it is produced. The VM enforces its own deadline;
//! an outer [`timeout`] of budget plus grace guards the worker as well.

use crate::network::channel_io::ChannelOutput;
use crate::storage::program_store::{ProgramStore, StoreError, Token, check_upload_size};
use crate::virtual_machine::errors::{HostLimitExceeded, LoadError};
use crate::virtual_machine::program::ProgramImage;
use crate::virtual_machine::sandbox::SandboxConfig;
use crate::virtual_machine::vm::context::{ChannelInput, Deadline, Host, RunLimits};
use crate::virtual_machine::vm::{EXIT_LOAD_REJECTED, RunReport, run_image_until};
use crate::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::timeout;

pub const MENU: &str = "================================\n\
                        \x20XVM COMPUTE SERVICES PVT LTD   \n\
                        ================================\n\
                        \x20 Secure virtual code execution \n\
                        \n\
                        [1] Upload xvm file.\n\
                        [2] Execute xvm file.\n\
                        [3] Info about xvm file.\n\
                        [4] Exit\n\
                        > ";

pub const SIZE_PROMPT: &str = "Enter file size (max 4KB): ";
pub const BINARY_PROMPT: &str = "Feed binary: ";
pub const TOKEN_PROMPT: &str = "Enter token: ";

/// Reply for every rejected request.
pub const ERR_REPLY: &str = "Err\n";

/// Longest accepted menu, size or token line.
const MAX_LINE: u64 = 256;

const STDIN_CHUNK: usize = 1024;

/// Service-wide settings.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Limits applied to every execution.
    pub limits: RunLimits,
    pub sandbox: SandboxConfig,
    /// Extra time the outer watchdog grants the worker beyond `limits.timeout`.
    pub grace: Duration,
    /// How long a session may wait for a menu choice, size, token or upload payload.
    pub idle_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            limits: RunLimits::default(),
            sandbox: SandboxConfig::default(),
            grace: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl ServiceConfig {
    /// Defaults with `XVM_TIMEOUT_MS`, `XVM_ALLOWED_PATHS` and `XVM_ALLOW_NETWORK` applied.
    pub fn from_env() -> Self {
        Self {
            limits: RunLimits::from_env(),
            sandbox: SandboxConfig::from_env(),
            ..Self::default()
        }
    }
}

/// Why a session ended early or an execution could not report normally.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid menu choice {0:?}")]
    InvalidChoice(String),
    #[error("invalid upload size {0:?}")]
    InvalidSize(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Limit(#[from] HostLimitExceeded),
    #[error("image rejected: {0}")]
    Load(#[from] LoadError),
    #[error("execution worker failed: {0}")]
    Worker(String),
    #[error("client idle for too long")]
    Idle,
    #[error("line longer than {limit} bytes")]
    LineTooLong { limit: u64 },
    #[error("client disconnected")]
    Disconnected,
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

/// The upload/execute/info service.
pub struct Service {
    store: Arc<dyn ProgramStore>,
    config: ServiceConfig,
}

impl Service {
    pub fn new(store: Arc<dyn ProgramStore>, config: ServiceConfig) -> Arc<Self> {
        Arc::new(Self { store, config })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Accepts connections forever, one task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!("listening on {}", listener.local_addr()?);
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let service = self.clone();
                    tokio::spawn(async move {
                        service.handle_connection(stream, peer).await;
                    });
                }
                Err(e) => warn!("accept failed: {e}"),
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        info!("session opened: {peer}");
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        match self.session(&mut reader, &mut writer).await {
            Ok(()) => info!("session closed: {peer}"),
            Err(e) => warn!("session {peer} ended: {e}"),
        }
    }

    /// Runs the menu loop until the client exits, disconnects or sends invalid input.
    pub async fn session<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<(), RunError>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        loop {
            send(writer, MENU).await?;
            let line = match self.read_line(reader, writer).await {
                Ok(line) => line,
                Err(RunError::Disconnected) => return Ok(()),
                Err(e) => return Err(e),
            };
            match line.trim().parse::<u32>() {
                Ok(1) => self.upload(reader, writer).await?,
                Ok(2) => self.execute(reader, writer).await?,
                Ok(3) => self.info(reader, writer).await?,
                Ok(4) => return Ok(()),
                _ => return reject(writer, RunError::InvalidChoice(line.trim().to_string())).await,
            }
        }
    }

    async fn upload<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<(), RunError>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        send(writer, SIZE_PROMPT).await?;
        let line = self.read_line(reader, writer).await?;
        let size = match line.trim().parse::<usize>() {
            Ok(size) => size,
            Err(_) => return reject(writer, RunError::InvalidSize(line.trim().to_string())).await,
        };
        if let Err(limit) = check_upload_size(size) {
            return reject(writer, limit.into()).await;
        }

        send(writer, BINARY_PROMPT).await?;
        let mut bytes = vec![0u8; size];
        match timeout(self.config.idle_timeout, reader.read_exact(&mut bytes)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(RunError::Disconnected);
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(RunError::Idle),
        }

        match self.store.upload(&bytes) {
            Ok(token) => {
                info!("uploaded {token} ({size} bytes)");
                send(writer, &format!("Your Token: {token}\n")).await
            }
            Err(e) => reject(writer, e.into()).await,
        }
    }

    async fn execute<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<(), RunError>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let bytes = match self.fetch(reader, writer).await? {
            Some((_, bytes)) => bytes,
            None => return Ok(()),
        };
        match self.run_streaming(bytes, reader, writer).await {
            Ok(report) => {
                info!(
                    "run finished: {:?} after {} steps in {:?}",
                    report.outcome, report.steps, report.elapsed
                );
                send(writer, &format!("{}\n", report.exit_code())).await
            }
            Err(RunError::Load(e)) => {
                debug!("image rejected: {e}");
                send(writer, &format!("Load error: {e}\n{EXIT_LOAD_REJECTED}\n")).await
            }
            Err(RunError::Limit(e @ HostLimitExceeded::Timeout { .. })) => {
                warn!("worker abandoned: {e}");
                send(writer, "2\n").await
            }
            Err(e) => Err(e),
        }
    }

    async fn info<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<(), RunError>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let bytes = match self.fetch(reader, writer).await? {
            Some((_, bytes)) => bytes,
            None => return Ok(()),
        };
        match ProgramImage::from_bytes(&bytes) {
            Ok(image) => send(writer, &image.describe()).await,
            Err(e) => send(writer, &format!("Load error: {e}\n")).await,
        }
    }

    /// Prompts for a token and loads its bytes. Replies `Err` and ends the session for
    /// malformed or unknown tokens.
    async fn fetch<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<Option<(Token, Vec<u8>)>, RunError>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        send(writer, TOKEN_PROMPT).await?;
        let line = self.read_line(reader, writer).await?;
        let fetched = line
            .parse::<Token>()
            .and_then(|token| Ok((token, self.store.get(&token)?)));
        match fetched {
            Ok(found) => Ok(Some(found)),
            Err(e) => reject(writer, e.into()).await,
        }
    }

    /// Runs `bytes` on a blocking worker, relaying console traffic until it finishes.
    async fn run_streaming<R, W>(
        &self,
        bytes: Vec<u8>,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<RunReport, RunError>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let limits = &self.config.limits;
        let deadline = Deadline::after(limits.timeout);
        let (input_tx, input_rx) = mpsc::channel();
        let (output_tx, mut output_rx) = unbounded_channel();
        let host = Host::new(
            ChannelInput::new(input_rx, deadline),
            ChannelOutput::new(output_tx),
            self.config.sandbox.clone(),
        );
        let max_steps = limits.max_steps;
        let mut worker =
            tokio::task::spawn_blocking(move || run_image_until(&bytes, host, deadline, max_steps));

        let mut input_tx = Some(input_tx);
        let mut chunk = [0u8; STDIN_CHUNK];
        let watchdog = limits.timeout.saturating_add(self.config.grace);
        let relayed = timeout(watchdog, async {
            let joined = loop {
                tokio::select! {
                    joined = &mut worker => break joined,
                    Some(out) = output_rx.recv() => {
                        writer.write_all(&out).await?;
                        writer.flush().await?;
                    }
                    read = reader.read(&mut chunk), if input_tx.is_some() => match read {
                        Ok(n) if n > 0 => {
                            let delivered = input_tx
                                .as_ref()
                                .is_some_and(|tx| tx.send(chunk[..n].to_vec()).is_ok());
                            if !delivered {
                                input_tx = None;
                            }
                        }
                        _ => input_tx = None,
                    },
                }
            };
            Ok::<_, RunError>(joined)
        })
        .await;
        drop(input_tx);

        let result = match relayed {
            Err(_) => Err(HostLimitExceeded::Timeout {
                budget_ms: watchdog.as_millis(),
            }
            .into()),
            Ok(Err(e)) => Err(e),
            Ok(Ok(Err(join))) => Err(RunError::Worker(join.to_string())),
            Ok(Ok(Ok(run))) => run.map_err(RunError::from),
        };
        while let Ok(out) = output_rx.try_recv() {
            writer.write_all(&out).await?;
        }
        writer.flush().await?;
        result
    }

    /// Reads one answer line. A line that reaches [`MAX_LINE`] without a newline is
    /// answered `Err` and ends the session.
    async fn read_line<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<String, RunError>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut line = String::new();
        let mut limited = AsyncReadExt::take(&mut *reader, MAX_LINE);
        match timeout(self.config.idle_timeout, limited.read_line(&mut line)).await {
            Ok(Ok(0)) => Err(RunError::Disconnected),
            Ok(Ok(n)) if n as u64 >= MAX_LINE && !line.ends_with('\n') => {
                reject(writer, RunError::LineTooLong { limit: MAX_LINE }).await
            }
            Ok(Ok(_)) => Ok(line),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(RunError::Idle),
        }
    }
}

async fn send<W>(writer: &mut W, text: &str) -> Result<(), RunError>
where
    W: AsyncWrite + Unpin + Send,
{
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Answers `Err` and ends the session with `err`.
async fn reject<W, T>(writer: &mut W, err: RunError) -> Result<T, RunError>
where
    W: AsyncWrite + Unpin + Send,
{
    debug!("rejecting request: {err}");
    send(writer, ERR_REPLY).await?;
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::program_store::MemoryProgramStore;
    use crate::virtual_machine::assembler::{AsmOptions, assemble};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    const ECHO: &str = "_start:\n\
         mov $r0, #0\n\
         mov $r1, #0\n\
         mov $r2, buf\n\
         mov $r5, #64\n\
         syscall\n\
         mov $r5, $r0\n\
         mov $r0, #1\n\
         mov $r1, #1\n\
         mov $r2, buf\n\
         syscall\n\
         hlt\n\
         .data\n\
         buf: .zero 64\n";

    const SPIN: &str = "_start:\n\
         spin:\n\
         jmp spin\n";

    fn program(source: &str, debug: bool) -> Vec<u8> {
        assemble(source, &AsmOptions { debug })
            .expect("assembly failed")
            .to_bytes()
    }

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Client {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (reader, writer) = stream.into_split();
            Client {
                reader: BufReader::new(reader),
                writer,
            }
        }

        /// Reads until the received text ends with `marker`, returning everything read.
        async fn until(&mut self, marker: &str) -> String {
            let mut received = Vec::new();
            let read = async {
                while !received.ends_with(marker.as_bytes()) {
                    let mut byte = [0u8; 1];
                    if self.reader.read(&mut byte).await.unwrap() == 0 {
                        break;
                    }
                    received.push(byte[0]);
                }
            };
            timeout(Duration::from_secs(10), read).await.unwrap();
            String::from_utf8_lossy(&received).into_owned()
        }

        async fn send(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
        }

        async fn rest(&mut self) -> String {
            let mut out = String::new();
            timeout(Duration::from_secs(10), self.reader.read_to_string(&mut out))
                .await
                .unwrap()
                .unwrap();
            out
        }

        async fn upload(&mut self, bytes: &[u8]) -> String {
            self.until("> ").await;
            self.send(b"1\n").await;
            self.until(SIZE_PROMPT).await;
            self.send(format!("{}\n", bytes.len()).as_bytes()).await;
            self.until(BINARY_PROMPT).await;
            self.send(bytes).await;
            let line = self.until("\n").await;
            line.trim()
                .strip_prefix("Your Token: ")
                .expect("token line")
                .to_string()
        }
    }

    async fn start(config: ServiceConfig) -> (SocketAddr, Arc<MemoryProgramStore>) {
        let store = Arc::new(MemoryProgramStore::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = Service::new(store.clone(), config);
        tokio::spawn(service.serve(listener));
        (addr, store)
    }

    fn quick() -> ServiceConfig {
        ServiceConfig {
            limits: RunLimits::with_timeout(Duration::from_secs(5)),
            sandbox: SandboxConfig::deny_all(),
            ..ServiceConfig::default()
        }
    }

    #[tokio::test]
    async fn menu_and_exit() {
        let (addr, _) = start(quick()).await;
        let mut client = Client::connect(addr).await;
        assert_eq!(client.until("> ").await, MENU);
        client.send(b"4\n").await;
        assert_eq!(client.rest().await, "");
    }

    #[tokio::test]
    async fn invalid_choice_closes_session() {
        let (addr, _) = start(quick()).await;
        let mut client = Client::connect(addr).await;
        client.until("> ").await;
        client.send(b"seven\n").await;
        assert_eq!(client.rest().await, ERR_REPLY);
    }

    #[tokio::test]
    async fn overlong_line_closes_session() {
        let (addr, _) = start(quick()).await;
        let mut client = Client::connect(addr).await;
        client.until("> ").await;
        client.send(&[b'1'; MAX_LINE as usize]).await;
        assert_eq!(client.rest().await, ERR_REPLY);
    }

    #[tokio::test]
    async fn upload_then_info() {
        let (addr, store) = start(quick()).await;
        let mut client = Client::connect(addr).await;
        let bytes = program(ECHO, true);
        let token = client.upload(&bytes).await;
        assert_eq!(token, Token::for_bytes(&bytes).to_string());
        assert_eq!(store.len(), 1);

        client.until("> ").await;
        client.send(b"3\n").await;
        client.until(TOKEN_PROMPT).await;
        client.send(format!("{token}\n").as_bytes()).await;
        let dump = client.until("> ").await;
        assert!(dump.starts_with("Dumping Section Info\n"));
        assert!(dump.contains("Dumping SymTab"));
        assert!(dump.contains("_start"));
        assert!(dump.ends_with(MENU));
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let (addr, store) = start(quick()).await;
        let mut client = Client::connect(addr).await;
        client.until("> ").await;
        client.send(b"1\n").await;
        client.until(SIZE_PROMPT).await;
        client.send(b"4096\n").await;
        assert_eq!(client.rest().await, ERR_REPLY);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn execute_streams_console() {
        let (addr, _) = start(quick()).await;
        let mut client = Client::connect(addr).await;
        let token = client.upload(&program(ECHO, false)).await;

        client.until("> ").await;
        client.send(b"2\n").await;
        client.until(TOKEN_PROMPT).await;
        client.send(format!("{token}\n").as_bytes()).await;
        client.send(b"ping").await;
        assert_eq!(client.until("ping").await, "ping");
        assert_eq!(client.until("\n").await, "0\n");
        client.until("> ").await;
        client.send(b"4\n").await;
        assert_eq!(client.rest().await, "");
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let (addr, _) = start(quick()).await;
        let mut client = Client::connect(addr).await;
        client.until("> ").await;
        client.send(b"2\n").await;
        client.until(TOKEN_PROMPT).await;
        let token = Token::for_bytes(b"never uploaded");
        client.send(format!("{token}\n").as_bytes()).await;
        assert_eq!(client.rest().await, ERR_REPLY);
    }

    #[tokio::test]
    async fn runaway_program_times_out() {
        let config = ServiceConfig {
            limits: RunLimits::with_timeout(Duration::from_millis(100)),
            ..quick()
        };
        let (addr, _) = start(config).await;
        let mut client = Client::connect(addr).await;
        let token = client.upload(&program(SPIN, false)).await;
        client.until("> ").await;
        client.send(b"2\n").await;
        client.until(TOKEN_PROMPT).await;
        client.send(format!("{token}\n").as_bytes()).await;
        assert_eq!(client.until("\n").await, "2\n");
    }

    #[tokio::test]
    async fn malformed_image_reports_load_error() {
        let (addr, _) = start(quick()).await;
        let mut client = Client::connect(addr).await;
        let token = client.upload(b"not an image").await;
        client.until("> ").await;
        client.send(b"2\n").await;
        client.until(TOKEN_PROMPT).await;
        client.send(format!("{token}\n").as_bytes()).await;
        let reply = client.until("> ").await;
        assert!(reply.starts_with("Load error: "));
        assert!(reply.contains(&format!("\n{EXIT_LOAD_REJECTED}\n")));
    }
}
