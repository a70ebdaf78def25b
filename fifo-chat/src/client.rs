//! Terminal chat participant: stdin goes to the broker, the private FIFO goes to stdout.

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::unix::pipe,
    select,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    frame::{Frame, FrameKind, SenderId},
    transport::{FifoInbox, Inbox, is_reader_missing},
};

const CONNECT_RETRY: Duration = Duration::from_millis(100);

pub async fn run(args: ClientArgs) -> Result<()> {
    let sender_id = SenderId::try_from(std::process::id()).context("process id out of range")?;
    let private_path = args.fifo_dir.join(format!("client_fifo_{sender_id}"));
    let reply_address = private_path
        .to_str()
        .context("private inbox path is not valid UTF-8")?
        .to_string();

    let mut private = FifoInbox::create(&private_path)
        .with_context(|| format!("failed to create private inbox {reply_address}"))?;

    let outcome = run_session(&args.inbox, sender_id, &reply_address, &mut private).await;

    if let Err(error) = private.close() {
        warn!(?error, "failed to remove private inbox");
    }
    outcome
}

async fn run_session(
    shared_path: &Path,
    sender_id: SenderId,
    reply_address: &str,
    private: &mut FifoInbox,
) -> Result<()> {
    let mut shared = connect_to_broker(shared_path).await?;
    send_frame(&mut shared, &Frame::connect(sender_id, reply_address))
        .await
        .context("failed to send connect")?;
    info!(sender_id, "connected to broker");
    write_stdout(&format!("*** connected as {sender_id}")).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let outcome = run_client_loop(
        &mut shared,
        private,
        &mut stdin,
        &mut input,
        sender_id,
        reply_address,
    )
    .await;

    if let Err(error) = send_frame(&mut shared, &Frame::disconnect(sender_id, reply_address)).await
    {
        warn!(?error, "failed to send disconnect");
    }
    outcome
}

/// Opens the shared inbox for writing, waiting until a broker is reading it.
pub async fn connect_to_broker(path: &Path) -> Result<pipe::Sender> {
    let mut announced = false;
    loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => return Ok(sender),
            Err(err) if is_reader_missing(&err) => {
                if !announced {
                    info!(inbox = %path.display(), "waiting for broker");
                    announced = true;
                }
                sleep(CONNECT_RETRY).await;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to open shared inbox {}", path.display()));
            }
        }
    }
}

/// Writes one frame in a single write, which the FIFO keeps atomic.
pub async fn send_frame(shared: &mut pipe::Sender, frame: &Frame) -> io::Result<()> {
    shared.write_all(&frame.encode()).await
}

async fn run_client_loop(
    shared: &mut pipe::Sender,
    private: &mut FifoInbox,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    sender_id: SenderId,
    reply_address: &str,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            received = private.recv() => {
                handle_private_message(received, private).await?;
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, shared, sender_id, reply_address).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_private_message(
    received: io::Result<Option<bytes::BytesMut>>,
    private: &mut FifoInbox,
) -> Result<()> {
    let bytes = match received {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            private.reopen().context("failed to reopen private inbox")?;
            return Ok(());
        }
        Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
        Err(err) => return Err(err).context("failed to read private inbox"),
    };

    match Frame::decode(&bytes) {
        Ok(frame) if frame.kind() == FrameKind::Chat => {
            write_stdout(&format!("[chat {}] {}", frame.sender_id(), frame.text())).await?;
        }
        Ok(frame) => debug!(kind = ?frame.kind(), "ignoring non-chat frame"),
        Err(error) => debug!(%error, "ignoring malformed frame"),
    }
    Ok(())
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    shared: &mut pipe::Sender,
    sender_id: SenderId,
    reply_address: &str,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let text = input.trim_end_matches(['\r', '\n']);
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    send_frame(shared, &Frame::chat(sender_id, reply_address, text))
        .await
        .context("failed to send chat")?;
    Ok(true)
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
