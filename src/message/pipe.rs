use super::{message_reader, message_writer, MessageOptions, MessageReader, MessageWriter};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Creates a synchronous in-memory message pipe.
///
/// Frames written to the returned writer become readable from the returned
/// reader. The underlying channel is nonblocking: reading an empty pipe
/// reports `WouldBlock` to the framer, which handles it according to the
/// pipe's options.
pub fn message_pipe(opts: MessageOptions) -> (MessageReader<PipeReader>, MessageWriter<PipeWriter>) {
    let shared = Arc::new(Shared {
        buf: Mutex::new(VecDeque::new()),
        writer_gone: AtomicBool::new(false),
        reader_gone: AtomicBool::new(false),
    });
    let rd = PipeReader(Arc::clone(&shared));
    let wr = PipeWriter(shared);
    (message_reader(rd, opts), message_writer(wr, opts))
}

struct Shared {
    buf: Mutex<VecDeque<u8>>,
    writer_gone: AtomicBool,
    reader_gone: AtomicBool,
}

/// The raw byte-stream read end of a [`message_pipe`].
pub struct PipeReader(Arc<Shared>);

impl io::Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut bytes = self.0.buf.lock();
        if bytes.is_empty() {
            if self.0.writer_gone.load(Ordering::Acquire) {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(bytes.len());
        for (i, b) in bytes.drain(..n).enumerate() {
            buf[i] = b;
        }
        Ok(n)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.0.reader_gone.store(true, Ordering::Release);
    }
}

/// The raw byte-stream write end of a [`message_pipe`].
pub struct PipeWriter(Arc<Shared>);

impl io::Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.0.reader_gone.load(Ordering::Acquire) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.0.buf.lock().extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.0.writer_gone.store(true, Ordering::Release);
    }
}
