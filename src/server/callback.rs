use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

use crate::parq::{CallbackOutcome, CallbackRequest, CallbackTransport};

/// A finished callback attempt. Delivered attempts carry the open stream so
/// the peer can go on and request over it.
#[derive(Debug)]
pub struct CallbackCompletion {
    pub outcome: CallbackOutcome,
    pub stream: Option<TcpStream>,
}

/// Delivers QUEUE lines over TCP, one short-lived thread per attempt.
pub struct TcpCallbackTransport {
    connect_timeout: Duration,
    in_flight: usize,
    completions_tx: Sender<CallbackCompletion>,
    completions_rx: Receiver<CallbackCompletion>,
}

impl TcpCallbackTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        let (completions_tx, completions_rx) = mpsc::channel();
        Self {
            connect_timeout,
            in_flight: 0,
            completions_tx,
            completions_rx,
        }
    }

    /// Completions gathered since the last call.
    pub fn drain(&mut self) -> Vec<CallbackCompletion> {
        let mut completed = Vec::new();
        loop {
            match self.completions_rx.try_recv() {
                Ok(completion) => {
                    self.in_flight = self.in_flight.saturating_sub(1);
                    completed.push(completion);
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        completed
    }
}

fn deliver(request: &CallbackRequest, connect_timeout: Duration) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect_timeout(&request.target, connect_timeout)?;
    stream.set_write_timeout(Some(connect_timeout))?;
    stream.write_all(request.line.as_bytes())?;
    stream.flush()?;
    Ok(stream)
}

impl CallbackTransport for TcpCallbackTransport {
    fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn start(&mut self, request: CallbackRequest) -> io::Result<()> {
        let tx = self.completions_tx.clone();
        let connect_timeout = self.connect_timeout;

        thread::Builder::new()
            .name(format!("parq-callback-{}", request.parq_id))
            .spawn(move || {
                let completion = match deliver(&request, connect_timeout) {
                    Ok(stream) => CallbackCompletion {
                        outcome: CallbackOutcome::Delivered {
                            parq_id: request.parq_id,
                        },
                        stream: Some(stream),
                    },
                    Err(error) => CallbackCompletion {
                        outcome: CallbackOutcome::Failed {
                            parq_id: request.parq_id,
                            reason: error.to_string(),
                        },
                        stream: None,
                    },
                };
                let _ = tx.send(completion);
            })?;

        self.in_flight += 1;
        Ok(())
    }
}
