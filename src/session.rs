//! Per-command session protocol
//!
//! One session = one `exec` on one SSH session channel. The hub opens the
//! channel, sends the payload, then drains stdout/stderr and the exit
//! status into the command's response channel. Every failure mode ends in
//! exactly one terminal response; nothing here propagates errors to the
//! caller of `send`, which has already returned.

use russh::client;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::response::Response;

/// Splits a byte stream into lines, carrying partial lines across reads.
/// Trailing `\r` is stripped so CRLF output reads the same as LF.
#[derive(Default)]
pub(crate) struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    /// Feed bytes in; get every newly-completed line out.
    pub(crate) fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(data));
        let mut lines = Vec::new();
        while let Some(idx) = self.pending.find('\n') {
            let line = self.pending[..idx].trim_end_matches('\r').to_string();
            self.pending.drain(..=idx);
            lines.push(line);
        }
        lines
    }

    /// The unterminated remainder, if any. Emitted once the stream ends,
    /// so output without a trailing newline is still delivered.
    pub(crate) fn take(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }
}

/// Outcome of the drain loop, resolved into the terminal response.
enum Verdict {
    Exited(i32),
    Failed(String),
}

/// Execute one command over an already-opened session channel.
///
/// Sends `exec` with the payload, closes the write side (the fabric never
/// forwards stdin), then drains until the channel closes or the reaper
/// fires. Output lines are delivered before the terminal response; stdout
/// and stderr each preserve their own order.
pub(crate) async fn run(
    mut channel: Channel<client::Msg>,
    payload: Vec<u8>,
    responses: mpsc::Sender<Response>,
    reaper: CancellationToken,
) {
    if let Err(e) = channel.exec(true, payload).await {
        respond(&responses, Response::Error(format!("exec request failed: {e}"))).await;
        let _ = channel.close().await;
        return;
    }
    let _ = channel.eof().await;

    let mut stdout = LineBuffer::default();
    let mut stderr = LineBuffer::default();
    let mut code: Option<i32> = None;
    let mut failure: Option<String> = None;

    loop {
        tokio::select! {
            _ = reaper.cancelled() => {
                // Only an error if the transport died before the agent
                // reported its exit.
                if code.is_none() {
                    failure.get_or_insert_with(|| "agent disconnected prematurely".to_string());
                }
                break;
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    for line in stdout.push(&data) {
                        respond(&responses, Response::Stdout(line)).await;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    for line in stderr.push(&data) {
                        respond(&responses, Response::Stderr(line)).await;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    trace!(exit_status, "session exit status received");
                    code = Some(exit_status as i32);
                }
                Some(ChannelMsg::ExitSignal { signal_name, error_message, .. }) => {
                    failure = Some(format!(
                        "remote error ({:?}): {}",
                        signal_name, error_message
                    ));
                }
                Some(ChannelMsg::Failure) => {
                    failure = Some("exec request refused".to_string());
                    break;
                }
                Some(ChannelMsg::Success) | Some(ChannelMsg::Eof) => {}
                Some(ChannelMsg::Close) | None => break,
                Some(other) => {
                    trace!(?other, "ignoring session channel message");
                }
            }
        }
    }

    // Flush unterminated output before the terminal response.
    if let Some(line) = stdout.take() {
        respond(&responses, Response::Stdout(line)).await;
    }
    if let Some(line) = stderr.take() {
        respond(&responses, Response::Stderr(line)).await;
    }

    let verdict = match (failure, code) {
        (Some(reason), _) => Verdict::Failed(reason),
        (None, Some(code)) => Verdict::Exited(code),
        (None, None) => Verdict::Failed("session closed without exit status".to_string()),
    };

    let _ = channel.close().await;

    match verdict {
        Verdict::Exited(code) => {
            debug!(code, "session finished");
            respond(&responses, Response::Exit(code)).await;
        }
        Verdict::Failed(reason) => {
            debug!(%reason, "session failed");
            respond(&responses, Response::Error(reason)).await;
        }
    }
    // `responses` drops here, closing the stream after the terminal.
}

/// Deliver one response; a dropped receiver just means the caller stopped
/// listening, which must not stall the drain.
async fn respond(responses: &mpsc::Sender<Response>, response: Response) {
    let _ = responses.send(response).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_splits_complete_lines() {
        let mut buf = LineBuffer::default();
        let lines = buf.push(b"this\nwas all printed\ntogether\n");
        assert_eq!(lines, vec!["this", "was all printed", "together"]);
        assert_eq!(buf.take(), None);
    }

    #[test]
    fn test_line_buffer_carries_partial_lines_across_reads() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"hel").is_empty());
        assert_eq!(buf.push(b"lo\nwor"), vec!["hello"]);
        assert_eq!(buf.push(b"ld\n"), vec!["world"]);
    }

    #[test]
    fn test_line_buffer_flushes_unterminated_tail() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"no newline here").is_empty());
        assert_eq!(buf.take(), Some("no newline here".to_string()));
        assert_eq!(buf.take(), None);
    }

    #[test]
    fn test_line_buffer_strips_carriage_returns() {
        let mut buf = LineBuffer::default();
        assert_eq!(buf.push(b"dos style\r\nunix style\n"), vec!["dos style", "unix style"]);
    }
}
