//! Chat session orchestration.
//!
//! A session runs two procedures against one [`Mailbox`]: the sender writes
//! the greeting and then every input line to our subkey, the receiver polls
//! the peer's subkey and shows what arrives. Whichever finishes first ends
//! the session; the other is dropped and the record is torn down.

use std::fmt;
use std::future::Future;
use std::io::{self, BufRead, Write};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dht::{DhtClient, RecordKey, ValueSubkey};
use crate::mailbox::{Mailbox, ReadCursor};
use crate::types::{Result, GREETING, QUIT};

/// Default pause between empty polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Prompt shown before each line of input.
pub const PROMPT: &str = "SEND> ";

/// Which end of the chat we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created the record; writes subkey 0, reads subkey 1.
    Initiator,
    /// Opened an existing record; writes subkey 1, reads subkey 0.
    Responder,
}

impl Role {
    /// Subkey this side writes.
    pub fn write_subkey(self) -> ValueSubkey {
        match self {
            Role::Initiator => 0,
            Role::Responder => 1,
        }
    }

    /// Subkey this side reads.
    pub fn read_subkey(self) -> ValueSubkey {
        match self {
            Role::Initiator => 1,
            Role::Responder => 0,
        }
    }
}

/// Tunables for a chat session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// First line written by the sender.
    pub greeting: String,
    /// Pause after a poll that found nothing new. Zero only yields.
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            greeting: GREETING.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Our input ended and we sent the sentinel.
    LocalClosed,
    /// The peer sent the sentinel.
    PeerClosed,
    /// Shut down from outside (e.g. Ctrl-C).
    Interrupted,
}

/// Where a session reports what happens.
pub trait ChatView: Send + Sync {
    /// A new record was created; its key must reach the friend out-of-band.
    fn chat_key(&self, key: &RecordKey);

    /// The session is waiting for the next local line.
    fn prompt(&self) {}

    /// A line arrived from the peer.
    fn incoming(&self, from: &str, line: &str);

    /// The peer ended the chat.
    fn peer_closed(&self);

    /// Our input ended.
    fn local_closed(&self);
}

/// Prints to a terminal-like sink, stdout by default.
pub struct ConsoleView<W = io::Stdout> {
    out: Mutex<W>,
}

impl ConsoleView {
    /// View on the process's stdout.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> ConsoleView<W> {
    /// View writing to `out`.
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Give back the sink.
    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, text: fmt::Arguments<'_>) {
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = out.write_fmt(text).and_then(|()| out.flush()) {
            warn!(error = %e, "console write failed");
        }
    }
}

impl<W: Write + Send> ChatView for ConsoleView<W> {
    fn chat_key(&self, key: &RecordKey) {
        self.emit(format_args!("New chat key: {}\nGive that to your friend!\n", key));
    }

    fn prompt(&self) {
        self.emit(format_args!("{}", PROMPT));
    }

    fn incoming(&self, from: &str, line: &str) {
        self.emit(format_args!("\n{}> {}\n", from, line));
    }

    fn peer_closed(&self) {
        self.emit(format_args!("Other end closed the chat.\n"));
    }

    fn local_closed(&self) {
        self.emit(format_args!("Closing the chat.\n"));
    }
}

/// Read stdin on a dedicated thread so waiting for the operator never stalls
/// the poll loop. The channel closes at end of input.
pub fn spawn_console_reader() -> Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel(16);

    std::thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            loop {
                let mut line = String::new();
                match stdin.lock().read_line(&mut line) {
                    Ok(0) => {
                        debug!("console input reached EOF");
                        break;
                    }
                    Ok(_) => {
                        let line = line.trim_end_matches(['\r', '\n']).to_string();
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "console read failed");
                        break;
                    }
                }
            }
        })?;

    Ok(rx)
}

/// One side of a running chat.
pub struct ChatSession<'a, D: DhtClient + ?Sized> {
    mailbox: Mailbox<'a, D>,
    role: Role,
    friend: String,
    config: SessionConfig,
}

impl<'a, D: DhtClient + ?Sized> ChatSession<'a, D> {
    /// Bind an open mailbox to a role and the friend's display name.
    pub fn new(
        mailbox: Mailbox<'a, D>,
        role: Role,
        friend: impl Into<String>,
        config: SessionConfig,
    ) -> Self {
        Self {
            mailbox,
            role,
            friend: friend.into(),
            config,
        }
    }

    /// Run until either side closes the chat.
    pub async fn run(
        &self,
        lines: &mut mpsc::Receiver<String>,
        view: &dyn ChatView,
    ) -> Result<SessionEnd> {
        self.run_until(lines, view, std::future::pending()).await
    }

    /// Run until either side closes the chat or `shutdown` completes.
    ///
    /// The record is closed and deleted on every exit path, including when a
    /// procedure fails; that failure is returned after teardown.
    pub async fn run_until<F>(
        &self,
        lines: &mut mpsc::Receiver<String>,
        view: &dyn ChatView,
        shutdown: F,
    ) -> Result<SessionEnd>
    where
        F: Future<Output = ()>,
    {
        info!(key = %self.mailbox.key(), role = ?self.role, friend = %self.friend, "starting chat");

        let outcome = tokio::select! {
            res = self.sender(lines, view) => res.map(|()| SessionEnd::LocalClosed),
            res = self.receiver(view) => res.map(|()| SessionEnd::PeerClosed),
            () = shutdown => Ok(SessionEnd::Interrupted),
        };
        debug!(?outcome, "chat procedures finished");

        let cleanup = self.mailbox.teardown().await;
        match (outcome, cleanup) {
            (Err(e), Err(cleanup_err)) => {
                warn!(error = %cleanup_err, "teardown failed after session error");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(cleanup_err)) => Err(cleanup_err),
            (Ok(end), Ok(())) => {
                info!(?end, "chat ended");
                Ok(end)
            }
        }
    }

    async fn sender(&self, lines: &mut mpsc::Receiver<String>, view: &dyn ChatView) -> Result<()> {
        let subkey = self.role.write_subkey();

        // Writing right away makes the record propagate before anyone types.
        self.mailbox.write(subkey, &self.config.greeting).await?;

        loop {
            view.prompt();
            match lines.recv().await {
                Some(line) if line == QUIT => break,
                Some(line) => self.mailbox.write(subkey, &line).await?,
                None => break,
            }
        }

        view.local_closed();
        self.mailbox.write(subkey, QUIT).await
    }

    async fn receiver(&self, view: &dyn ChatView) -> Result<()> {
        let mut cursor = ReadCursor::new(self.role.read_subkey());

        loop {
            match self.mailbox.poll(&mut cursor).await? {
                Some(line) if line == QUIT => {
                    debug!("received the quit signal from the other end");
                    view.peer_closed();
                    return Ok(());
                }
                Some(line) => view.incoming(&self.friend, &line),
                None => self.pause().await,
            }
        }
    }

    async fn pause(&self) {
        if self.config.poll_interval.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
