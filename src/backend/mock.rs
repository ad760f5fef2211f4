//! Scripted in-memory backend for tests.

use std::collections::VecDeque;
use std::io;

use super::{Backend, TransferError};

/// Outcome of one scripted receive attempt.
#[derive(Clone, Debug)]
pub(crate) enum Reply {
    Data(Vec<u8>),
    /// Attempt timed out after delivering the given (possibly empty) bytes.
    Timeout(Vec<u8>),
    Fault,
}

#[derive(Debug, Default)]
pub(crate) struct MockBackend {
    replies: VecDeque<Reply>,
    sent: Vec<Vec<u8>>,
    receive_calls: usize,
    stalled_sends: usize,
    partial_send_timeout: Option<usize>,
    max_send: Option<usize>,
    fail_shutdown: bool,
}

impl MockBackend {
    pub(crate) fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: replies.into(),
            ..Default::default()
        }
    }

    /// Serves `data` in receives of at most `chunk` bytes.
    pub(crate) fn chunked(data: &[u8], chunk: usize) -> Self {
        Self::new(data.chunks(chunk).map(|c| Reply::Data(c.to_vec())).collect())
    }

    /// Limits how many bytes a single send accepts.
    pub(crate) fn with_max_send(mut self, max: usize) -> Self {
        self.max_send = Some(max);
        self
    }

    /// Makes the next `n` sends time out without moving data.
    pub(crate) fn stall_sends(&mut self, n: usize) {
        self.stalled_sends = n;
    }

    /// Makes the next send that isn't stalled move at most `n` bytes and then time out.
    pub(crate) fn time_out_send_after(&mut self, n: usize) {
        self.partial_send_timeout = Some(n);
    }

    pub(crate) fn fail_shutdown(&mut self) {
        self.fail_shutdown = true;
    }

    pub(crate) fn push(&mut self, reply: Reply) {
        self.replies.push_back(reply);
    }

    /// Every physical send, in order.
    pub(crate) fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    pub(crate) fn sent_bytes(&self) -> Vec<u8> {
        self.sent.concat()
    }

    pub(crate) fn receive_calls(&self) -> usize {
        self.receive_calls
    }
}

impl Backend for MockBackend {
    fn send_once(&mut self, data: &[u8]) -> Result<usize, TransferError> {
        if self.stalled_sends > 0 {
            self.stalled_sends -= 1;
            return Err(TransferError::TimedOut { transferred: 0 });
        }

        if let Some(n) = self.partial_send_timeout.take() {
            let n = n.min(data.len());
            self.sent.push(data[..n].to_vec());
            return Err(TransferError::TimedOut { transferred: n });
        }

        let n = self.max_send.map_or(data.len(), |max| max.min(data.len()));
        self.sent.push(data[..n].to_vec());
        Ok(n)
    }

    fn receive_once(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        self.receive_calls += 1;

        match self.replies.pop_front() {
            Some(Reply::Data(data)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Some(Reply::Timeout(data)) => {
                buf[..data.len()].copy_from_slice(&data);
                Err(TransferError::TimedOut {
                    transferred: data.len(),
                })
            }
            Some(Reply::Fault) => Err(TransferError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "device disconnected",
            ))),
            None => Err(TransferError::TimedOut { transferred: 0 }),
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        if self.fail_shutdown {
            return Err(io::Error::new(io::ErrorKind::Other, "release failed"));
        }
        Ok(())
    }
}
