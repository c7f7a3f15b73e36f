//! In-memory oldstyle NBD server for tests.
//!
//! [`MemoryServer`] implements [`Connect`]: every connect spawns a server task
//! on one end of a `tokio::io::duplex` pipe and hands the other end to the
//! client. All connections share one sparse [`MemoryDevice`], so data survives
//! reconnects. [`Faults`] makes the server misbehave in specific ways.

use std::collections::HashMap;
use std::future::pending;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::command_request::{CommandRequest, CommandType};
use crate::connect::{Connect, RetryPolicy, TcpConnector};
use crate::errors::ReplyError;
use crate::flags::TransmissionFlags;
use crate::io::command_reply::SimpleReplyRaw;
use crate::io::command_request::CommandRequestRaw;
use crate::io::handshake;
use crate::session::SessionConfig;

pub(crate) const SIX_GIB: u64 = 6 << 30;

const PAGE_SIZE: u64 = 4096;

/// Session settings for tests: default timeout, at most a few connect attempts.
pub(crate) fn test_config() -> SessionConfig {
    SessionConfig {
        read_timeout: Duration::from_secs(5),
        verbose: false,
        retry: RetryPolicy {
            max_attempts: Some(3),
            ..RetryPolicy::default()
        },
    }
}

/// Sparse byte-addressed storage; unwritten pages read as zeroes.
#[derive(Debug, Default)]
pub(crate) struct MemoryDevice {
    pages: HashMap<u64, Box<[u8]>>,
}

impl MemoryDevice {
    pub(crate) fn read(&self, offset: u64, buf: &mut [u8]) {
        let mut done = 0;
        while done < buf.len() {
            let position = offset + done as u64;
            let (page, within) = (position / PAGE_SIZE, (position % PAGE_SIZE) as usize);
            let count = (PAGE_SIZE as usize - within).min(buf.len() - done);
            let target = &mut buf[done..done + count];
            match self.pages.get(&page) {
                Some(data) => target.copy_from_slice(&data[within..within + count]),
                None => target.fill(0),
            }
            done += count;
        }
    }

    pub(crate) fn write(&mut self, offset: u64, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let position = offset + done as u64;
            let (page, within) = (position / PAGE_SIZE, (position % PAGE_SIZE) as usize);
            let count = (PAGE_SIZE as usize - within).min(data.len() - done);
            let stored = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            stored[within..within + count].copy_from_slice(&data[done..done + count]);
            done += count;
        }
    }

    /// Drops whole pages and zeroes the partial ones at either end.
    pub(crate) fn trim(&mut self, offset: u64, length: u64) {
        let end = offset + length;
        let first_full = offset.div_ceil(PAGE_SIZE);
        let last_full = end / PAGE_SIZE;

        if first_full >= last_full {
            self.zero(offset, end);
            return;
        }
        self.zero(offset, first_full * PAGE_SIZE);
        self.zero(last_full * PAGE_SIZE, end);
        self.pages
            .retain(|&page, _| page < first_full || page >= last_full);
    }

    fn zero(&mut self, from: u64, to: u64) {
        if to > from {
            self.write(from, &vec![0u8; (to - from) as usize]);
        }
    }

    pub(crate) fn allocated_pages(&self) -> usize {
        self.pages.len()
    }
}

/// Ways the server can misbehave.
#[derive(Debug, Clone, Default)]
pub(crate) struct Faults {
    /// Sent instead of the real greeting. A greeting shorter than 152 bytes is
    /// followed by a hang-up.
    pub(crate) greeting: Option<Vec<u8>>,
    /// Send this many greeting bytes, then go silent.
    pub(crate) stall_after_greeting_bytes: Option<usize>,
    /// Read commands but never answer them.
    pub(crate) stall_replies: bool,
    pub(crate) bad_reply_magic: bool,
    /// Echo the handle with its first byte flipped.
    pub(crate) wrong_handle: bool,
    /// Close the connection as soon as a command header arrives.
    pub(crate) hang_up_on_command: bool,
    /// Flip the device byte at this offset in every read that covers it.
    pub(crate) flip_byte_at: Option<u64>,
    /// Accept out-of-range requests instead of answering EINVAL.
    pub(crate) skip_bounds_check: bool,
    /// Accept requests that start inside the device but run past its end.
    pub(crate) accept_past_end: bool,
    /// Store writes of exactly this payload with their first byte flipped.
    pub(crate) corrupt_writes_of: Option<Vec<u8>>,
    /// Acknowledge trims without touching the data.
    pub(crate) ignore_trim: bool,
    /// The page holding this offset survives every trim.
    pub(crate) keep_on_trim: Option<u64>,
    /// From the n-th connection (1-based) on, advertise this size.
    pub(crate) resize_from_connection: Option<(usize, u64)>,
}

#[derive(Debug)]
struct ServerState {
    size: u64,
    flags: u32,
    device: MemoryDevice,
    faults: Faults,
    connections: usize,
    commands: Vec<CommandRequest>,
    handles: Vec<[u8; 8]>,
    written: Vec<Vec<u8>>,
}

/// Shared handle to the in-memory server.
#[derive(Debug, Clone)]
pub(crate) struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
    disconnected: Arc<Notify>,
}

impl MemoryServer {
    pub(crate) fn new(size: u64, flags: u32) -> Self {
        Self::with_faults(size, flags, Faults::default())
    }

    pub(crate) fn with_faults(size: u64, flags: u32, faults: Faults) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                size,
                flags,
                device: MemoryDevice::default(),
                faults,
                connections: 0,
                commands: Vec::new(),
                handles: Vec::new(),
                written: Vec::new(),
            })),
            disconnected: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    /// Changes what later handshakes advertise.
    pub(crate) fn set_advertised(&self, size: u64, flags: u32) {
        let mut state = self.lock();
        state.size = size;
        state.flags = flags;
    }

    pub(crate) fn update_faults(&self, update: impl FnOnce(&mut Faults)) {
        update(&mut self.lock().faults);
    }

    /// Every command received so far, in order.
    pub(crate) fn commands(&self) -> Vec<CommandRequest> {
        self.lock().commands.clone()
    }

    /// Handles of every command received so far.
    pub(crate) fn handles(&self) -> Vec<[u8; 8]> {
        self.lock().handles.clone()
    }

    /// Payloads of every write received so far.
    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    pub(crate) fn connections(&self) -> usize {
        self.lock().connections
    }

    pub(crate) fn read_device(&self, offset: u64, buf: &mut [u8]) {
        self.lock().device.read(offset, buf);
    }

    pub(crate) fn write_device(&self, offset: u64, data: &[u8]) {
        self.lock().device.write(offset, data);
    }

    pub(crate) fn allocated_pages(&self) -> usize {
        self.lock().device.allocated_pages()
    }

    /// Waits until some connection received a disconnect command.
    pub(crate) async fn wait_for_disconnect(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.disconnected.notified())
            .await
            .expect("no disconnect received");
    }

    /// Serves the same device over TCP on an ephemeral localhost port.
    pub(crate) async fn listen_tcp(&self) -> (TcpConnector, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = self.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(server.clone(), stream));
            }
        });
        (TcpConnector::new("127.0.0.1", port), task)
    }

    fn accept(&self) -> (Vec<u8>, Faults) {
        let mut state = self.lock();
        state.connections += 1;

        let size = match state.faults.resize_from_connection {
            Some((from, size)) if state.connections >= from => size,
            _ => state.size,
        };
        let greeting = state
            .faults
            .greeting
            .clone()
            .unwrap_or_else(|| handshake::encode(size, state.flags));
        (greeting, state.faults.clone())
    }

    /// Runs one command against the device; returns `(status, read data)`.
    fn execute(&self, command: CommandRequest, payload: &[u8]) -> (u32, Vec<u8>) {
        let mut state = self.lock();
        let flags = TransmissionFlags::from_bits_truncate(state.flags);

        let size = state.size;
        let skip_bounds_check = state.faults.skip_bounds_check;
        let accept_past_end = state.faults.accept_past_end;
        let fits = move |offset: u64, length: u32| {
            offset
                .checked_add(length as u64)
                .is_some_and(|end| end <= size)
        };
        let in_bounds = move |offset: u64, length: u32| {
            skip_bounds_check || fits(offset, length) || (accept_past_end && offset < size)
        };

        let result: Result<Vec<u8>, ReplyError> = match command {
            CommandRequest::Read(offset, length) => {
                if !in_bounds(offset, length) {
                    Err(ReplyError::InvalidArgument)
                } else {
                    let mut data = vec![0u8; length as usize];
                    if fits(offset, length) {
                        state.device.read(offset, &mut data);
                    }
                    if let Some(flip) = state.faults.flip_byte_at {
                        if flip >= offset && flip - offset < length as u64 {
                            data[(flip - offset) as usize] ^= 0xff;
                        }
                    }
                    Ok(data)
                }
            }
            CommandRequest::Write(offset, length) => {
                if flags.contains(TransmissionFlags::READ_ONLY) {
                    Err(ReplyError::CommandNotPermitted)
                } else if !in_bounds(offset, length) {
                    Err(ReplyError::InvalidArgument)
                } else {
                    if fits(offset, length) {
                        let corrupt = !payload.is_empty()
                            && state.faults.corrupt_writes_of.as_deref() == Some(payload);
                        if corrupt {
                            let mut stored = payload.to_vec();
                            stored[0] ^= 0xff;
                            state.device.write(offset, &stored);
                        } else {
                            state.device.write(offset, payload);
                        }
                    }
                    state.written.push(payload.to_vec());
                    Ok(vec![])
                }
            }
            CommandRequest::Flush => Ok(vec![]),
            CommandRequest::Trim(offset, length) => {
                if !flags.contains(TransmissionFlags::SEND_TRIM) {
                    Err(ReplyError::CommandNotSupported)
                } else if !in_bounds(offset, length) {
                    Err(ReplyError::InvalidArgument)
                } else {
                    let keep_on_trim = state.faults.keep_on_trim;
                    if fits(offset, length) && !state.faults.ignore_trim {
                        let kept = keep_on_trim.map(|keep| {
                            let page = keep / PAGE_SIZE * PAGE_SIZE;
                            let mut data = vec![0u8; PAGE_SIZE as usize];
                            state.device.read(page, &mut data);
                            (page, data)
                        });
                        state.device.trim(offset, length as u64);
                        if let Some((page, data)) = kept {
                            state.device.write(page, &data);
                        }
                    }
                    Ok(vec![])
                }
            }
            CommandRequest::Disconnect => Ok(vec![]),
        };

        match result {
            Ok(data) => (0, data),
            Err(e) => (e.into(), vec![]),
        }
    }

    fn record(&self, command: CommandRequest, handle: [u8; 8]) {
        let mut state = self.lock();
        state.commands.push(command);
        state.handles.push(handle);
    }
}

impl Connect for MemoryServer {
    type Stream = DuplexStream;

    async fn connect(&self) -> io::Result<DuplexStream> {
        let (client, server) = duplex(1 << 20);
        tokio::spawn(serve(self.clone(), server));
        Ok(client)
    }

    fn peer(&self) -> String {
        "memory".to_string()
    }
}

/// Server side of one connection: greeting, then commands until disconnect.
async fn serve<S>(server: MemoryServer, mut stream: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (greeting, faults) = server.accept();

    if let Some(count) = faults.stall_after_greeting_bytes {
        stream.write_all(&greeting[..count]).await?;
        stream.flush().await?;
        pending::<()>().await;
    }
    stream.write_all(&greeting).await?;
    stream.flush().await?;
    if greeting.len() < 152 {
        return Ok(());
    }

    loop {
        let mut header = [0u8; CommandRequestRaw::LEN];
        stream.read_exact(&mut header).await?;
        let command_raw = CommandRequestRaw::decode(&header);

        // Faults may change between commands
        let faults = server.lock().faults.clone();
        if faults.hang_up_on_command {
            return Ok(());
        }

        let mut payload = Vec::new();
        if command_raw.command_type == CommandType::Write as u32 {
            payload = vec![0u8; command_raw.length as usize];
            stream.read_exact(&mut payload).await?;
        }

        let (status, data) = match CommandRequest::try_from(&command_raw) {
            Ok(CommandRequest::Disconnect) => {
                server.record(CommandRequest::Disconnect, command_raw.handle);
                server.disconnected.notify_one();
                return Ok(());
            }
            Ok(command) => {
                server.record(command, command_raw.handle);
                server.execute(command, &payload)
            }
            Err(e) => (e.into(), vec![]),
        };

        if faults.stall_replies {
            pending::<()>().await;
        }

        let mut handle = command_raw.handle;
        if faults.wrong_handle {
            handle[0] ^= 0xff;
        }
        let mut reply = SimpleReplyRaw::new(status, handle);
        if faults.bad_reply_magic {
            reply.magic = 0xdead_beef;
        }

        stream.write_all(&reply.encode()).await?;
        if status == 0 {
            stream.write_all(&data).await?;
        }
        stream.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_device_sparse_read_write() {
        let mut device = MemoryDevice::default();
        let mut buf = [0xffu8; 16];
        device.read(1 << 40, &mut buf);
        assert_eq!(buf, [0u8; 16]);

        // Straddles a page boundary
        device.write(4090, &[1u8; 12]);
        let mut back = [0u8; 14];
        device.read(4089, &mut back);
        assert_eq!(back[0], 0);
        assert_eq!(&back[1..13], &[1u8; 12]);
        assert_eq!(back[13], 0);
        assert_eq!(device.allocated_pages(), 2);
    }

    #[test]
    fn test_memory_device_trim() {
        let mut device = MemoryDevice::default();
        device.write(0, &[7u8; 4096 * 4]);

        device.trim(100, 4096 * 2);
        assert_eq!(device.allocated_pages(), 3);

        let mut back = vec![0u8; 4096 * 4];
        device.read(0, &mut back);
        assert!(back[..100].iter().all(|&b| b == 7));
        assert!(back[100..100 + 8192].iter().all(|&b| b == 0));
        assert!(back[100 + 8192..].iter().all(|&b| b == 7));

        device.trim(0, SIX_GIB);
        assert_eq!(device.allocated_pages(), 0);
    }
}
