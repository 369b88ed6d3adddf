use std::io;

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite},
    select,
    sync::mpsc,
};
use tracing::debug;

use crate::{
    command::{write_reply, Command, Reply},
    registry::Notice,
    store::Store,
};

/// Longest line a client may send, not counting the newline.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Why a connection's command loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The client closed its side of the stream.
    Disconnected,
    /// The client sent `exit`.
    Exited,
    /// The server asked the connection to close.
    Closed,
}

/// Runs the command loop for one client until it disconnects, exits, or the
/// server closes it.
///
/// Lines are handled one at a time: the reply is written before the next
/// line is read. Notices from the server are interleaved between lines.
/// Bytes that are not UTF-8 are decoded lossily and end up as unknown
/// commands. A line longer than [`MAX_LINE_LEN`] gets one unknown reply and
/// the rest of it is skipped.
pub async fn process<R, W>(
    mut reader: R,
    writer: &mut W,
    store: &Store,
    notices: &mut mpsc::UnboundedReceiver<Notice>,
) -> io::Result<Outcome>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Partially read bytes stay in `buf` when a notice wins the race, so
    // the next read picks the line up where it stopped.
    let mut buf = Vec::new();
    let mut skipping = false;
    let mut notices_open = true;

    loop {
        select! {
            read = read_line_bounded(&mut reader, &mut buf) => {
                let read = read?;
                let complete = buf.last() == Some(&b'\n');
                let too_long = !complete && buf.len() > MAX_LINE_LEN;

                if skipping {
                    skipping = !complete;
                    buf.clear();
                } else if too_long {
                    debug!(len = buf.len(), "skipping over-long line");
                    buf.clear();
                    skipping = true;
                    let message = format!("--- UNKNOWN: line longer than {MAX_LINE_LEN} bytes");
                    write_reply(writer, &message).await?;
                } else if !buf.is_empty() {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    buf.clear();
                    let command = Command::parse(&line);
                    debug!(?command, "received command");
                    match command.apply(store) {
                        Reply::Line(message) => write_reply(writer, &message).await?,
                        Reply::Close => return Ok(Outcome::Exited),
                    }
                }

                if read == 0 && !too_long {
                    return Ok(Outcome::Disconnected);
                }
            }
            notice = notices.recv(), if notices_open => {
                match notice {
                    Some(Notice::Warn(message)) => write_reply(writer, &message).await?,
                    Some(Notice::Close) => return Ok(Outcome::Closed),
                    None => notices_open = false,
                }
            }
        }
    }
}

/// Appends bytes up to and including the next newline, reading at most one
/// byte past [`MAX_LINE_LEN`] in total. Returns 0 at end of stream.
async fn read_line_bounded<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let limit = (MAX_LINE_LEN + 1).saturating_sub(buf.len()) as u64;
    let mut limited = AsyncReadExt::take(&mut *reader, limit);
    limited.read_until(b'\n', buf).await
}
