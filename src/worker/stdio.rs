//! Framed channel over byte streams, used on the worker's stdin/stdout.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::engine::EnginePolicy;
use crate::protocol::{read_frame, write_frame, ProtocolError, SupervisorMessage, WorkerMessage};

use super::WorkerChannel;

/// Worker side of a framed byte-stream channel.
pub struct FramedChannel<R, W> {
    reader: R,
    writer: W,
}

impl<R: Read, W: Write> FramedChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

impl<R: Read, W: Write> WorkerChannel for FramedChannel<R, W> {
    fn recv(&mut self) -> Result<Option<SupervisorMessage>, ProtocolError> {
        match read_frame(&mut self.reader) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) if e.is_eof() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, msg: WorkerMessage) -> Result<(), ProtocolError> {
        write_frame(&mut self.writer, msg)
    }
}

/// Serve the supervisor over this process's stdin and stdout.
pub fn run_stdio(policy: EnginePolicy, native_library: Option<&Path>) -> i32 {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut channel = FramedChannel::new(
        BufReader::new(stdin.lock()),
        BufWriter::new(stdout.lock()),
    );
    super::run(policy, native_library, &mut channel)
}
