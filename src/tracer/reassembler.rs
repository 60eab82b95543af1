use crate::protocol::{read_envelope, Direction, Message, ProtocolError};

/// Forward, incremental message reassembly for one direction of one connection.
///
/// A message body may span any number of chunks; the pending message is kept
/// between calls. A header split across chunks is not recovered: when fewer
/// than five bytes are left where a header should start, the rest of the chunk
/// is dropped and `IncompleteHeader` is returned.
#[derive(Debug, Clone)]
pub struct StreamReassembler {
    direction: Direction,
    pending: Option<Message>,
}

impl StreamReassembler {
    pub fn new(direction: Direction) -> Self {
        Self { direction, pending: None }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The message still waiting for bytes, if any.
    pub fn pending(&self) -> Option<&Message> {
        self.pending.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// Forget any partially received message.
    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// Consume one captured chunk, handing every completed message to `on_message`
    /// in wire order. Messages completed before a decode error are still handed out.
    pub fn feed<F>(&mut self, chunk: &[u8], mut on_message: F) -> Result<(), ProtocolError>
    where
        F: FnMut(Message),
    {
        let mut pos = 0;
        loop {
            if let Some(mut msg) = self.pending.take() {
                pos += msg.absorb(&chunk[pos..]);
                if msg.is_complete() {
                    on_message(msg);
                    continue;
                }
                self.pending = Some(msg);
                return Ok(());
            }

            if pos == chunk.len() {
                return Ok(());
            }
            let (envelope, next) = read_envelope(chunk, pos)?;
            pos = next;
            self.pending = Some(Message::pending(envelope, self.direction));
        }
    }
}
