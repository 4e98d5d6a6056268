use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::BytesMut;
use may::queue::mpsc::Queue;
use may::sync::Mutex;

#[derive(Debug)]
struct BufWriter<W: Write> {
    writer: W,
    buf: BytesMut,
}

impl<W: Write> BufWriter<W> {
    fn new(writer: W) -> Self {
        BufWriter {
            writer,
            buf: BytesMut::with_capacity(1024 * 32),
        }
    }

    #[inline]
    fn put_data(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data)
    }

    #[inline]
    fn write_all(&mut self) -> io::Result<()> {
        let ret = self.writer.write_all(&self.buf);
        self.buf.clear();
        ret
    }
}

/// Serializes frames from many concurrent producers onto one writer.
///
/// Whoever finds the queue empty becomes the flusher and writes out
/// everything queued meanwhile; the others just enqueue.
pub struct QueuedWriter<W: Write> {
    data_count: AtomicUsize,
    data_queue: Queue<Vec<u8>>,
    writer: Mutex<BufWriter<W>>,
    broken: AtomicBool,
}

impl<W: Write> QueuedWriter<W> {
    /// wrap a writer
    pub fn new(writer: W) -> Self {
        QueuedWriter {
            data_count: AtomicUsize::new(0),
            data_queue: Queue::new(),
            writer: Mutex::new(BufWriter::new(writer)),
            broken: AtomicBool::new(false),
        }
    }

    /// true once a write failed, nothing is written after that
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// it's safe and efficient to call this API concurrently
    pub fn write(&self, data: Vec<u8>) -> io::Result<()> {
        if self.is_broken() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.data_queue.push(data);
        // only allow the first writer perform the write operation
        // other concurrent writers would just push the data
        if self.data_count.fetch_add(1, Ordering::AcqRel) != 0 {
            return Ok(());
        }

        let mut writer = self.writer.lock().unwrap();
        loop {
            let mut cnt = 0;
            while let Some(data) = self.data_queue.pop() {
                writer.put_data(&data);
                cnt += 1;
            }

            // detect if there are more packet need to deal with
            if self.data_count.fetch_sub(cnt, Ordering::AcqRel) == cnt {
                break;
            }
        }

        writer.write_all().map_err(|e| {
            error!("QueuedWriter failed, err={e}");
            self.broken.store(true, Ordering::Release);
            e
        })
    }
}
