//! Detected-electron output stream.
//!
//! Two levels: a single serialised writer at the bottom, one fixed-capacity
//! byte buffer per worker on top. Buffers hand whole multiples of the record
//! size to the writer, so streams from different workers interleave at
//! buffer boundaries only, never mid-record.
//!
//! Record layout, 36 bytes, no framing: seven little-endian f32
//! `(px, py, pz, dx, dy, dz, E)` then two little-endian i32 `(pixel.x,
//! pixel.y)`. Packing is explicit `to_le_bytes`, so the stream is
//! little-endian on every host.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::particle::{Particle, Pixel};

/// Bytes per detected-electron record.
pub const RECORD_BYTES: usize = 7 * 4 + 2 * 4;
/// Records per worker buffer.
pub const BUFFER_RECORDS: usize = 1024;

pub struct OutputSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl OutputSink {
    /// Open a sink on the given file, or on stdout when `path` is `None`.
    pub fn create(path: Option<&Path>) -> io::Result<Self> {
        let writer: Box<dyn Write + Send> = match path {
            Some(p) => Box::new(File::create(p)?),
            None => Box::new(io::stdout()),
        };
        Ok(Self::from_writer(writer))
    }

    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut w = self.writer.lock().unwrap();
        w.write_all(bytes)
    }

    /// Flush the underlying writer. Worker buffers flush themselves before
    /// their worker exits, so this drains everything that was produced.
    pub fn flush(&self) -> io::Result<()> {
        self.writer.lock().unwrap().flush()
    }
}

/// Per-worker staging buffer in front of an [`OutputSink`].
pub struct OutputBuffer<'a> {
    sink: &'a OutputSink,
    buf: Vec<u8>,
}

impl<'a> OutputBuffer<'a> {
    pub fn new(sink: &'a OutputSink) -> Self {
        Self {
            sink,
            buf: Vec::with_capacity(BUFFER_RECORDS * RECORD_BYTES),
        }
    }

    /// Append one record; flushes to the sink when the buffer fills.
    pub fn add_record(&mut self, p: &Particle, pixel: Pixel) -> io::Result<()> {
        for v in [
            p.pos.x, p.pos.y, p.pos.z, p.dir.x, p.dir.y, p.dir.z, p.energy,
        ] {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
        self.buf.extend_from_slice(&pixel.x.to_le_bytes());
        self.buf.extend_from_slice(&pixel.y.to_le_bytes());

        if self.buf.len() >= BUFFER_RECORDS * RECORD_BYTES {
            self.flush()?;
        }
        Ok(())
    }

    /// Hand the buffered records to the sink in one serialised write.
    pub fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.sink.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedVec(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedVec {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn record_particle() -> Particle {
        Particle::new(Vec3::new(1.0, 2.0, 3.0), Vec3::Z, 450.0)
    }

    #[test]
    fn record_is_36_little_endian_bytes() {
        let out = SharedVec::default();
        let sink = OutputSink::from_writer(Box::new(out.clone()));
        let mut buff = OutputBuffer::new(&sink);
        buff.add_record(&record_particle(), Pixel { x: 5, y: -7 }).unwrap();
        buff.flush().unwrap();

        let bytes = out.0.lock().unwrap().clone();
        assert_eq!(bytes.len(), RECORD_BYTES);
        assert_eq!(&bytes[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..8], &2.0f32.to_le_bytes());
        assert_eq!(&bytes[8..12], &3.0f32.to_le_bytes());
        assert_eq!(&bytes[20..24], &1.0f32.to_le_bytes()); // dz
        assert_eq!(&bytes[24..28], &450.0f32.to_le_bytes());
        assert_eq!(&bytes[28..32], &5i32.to_le_bytes());
        assert_eq!(&bytes[32..36], &(-7i32).to_le_bytes());
    }

    #[test]
    fn buffer_flushes_when_full() {
        let out = SharedVec::default();
        let sink = OutputSink::from_writer(Box::new(out.clone()));
        let mut buff = OutputBuffer::new(&sink);

        for _ in 0..BUFFER_RECORDS - 1 {
            buff.add_record(&record_particle(), Pixel { x: 0, y: 0 }).unwrap();
        }
        assert!(out.0.lock().unwrap().is_empty(), "not yet full");
        buff.add_record(&record_particle(), Pixel { x: 0, y: 0 }).unwrap();
        assert_eq!(
            out.0.lock().unwrap().len(),
            BUFFER_RECORDS * RECORD_BYTES,
            "full buffer written in one piece"
        );
    }

    #[test]
    fn interleaving_respects_record_boundaries() {
        let out = SharedVec::default();
        let sink = OutputSink::from_writer(Box::new(out.clone()));

        std::thread::scope(|s| {
            for worker in 0..4 {
                let sink = &sink;
                s.spawn(move || {
                    let mut buff = OutputBuffer::new(sink);
                    for i in 0..500 {
                        buff.add_record(
                            &record_particle(),
                            Pixel {
                                x: worker,
                                y: i,
                            },
                        )
                        .unwrap();
                    }
                    buff.flush().unwrap();
                });
            }
        });

        let bytes = out.0.lock().unwrap().clone();
        assert_eq!(bytes.len(), 4 * 500 * RECORD_BYTES);
        // Every record parses back with an in-range pixel.
        for rec in bytes.chunks_exact(RECORD_BYTES) {
            let x = i32::from_le_bytes(rec[28..32].try_into().unwrap());
            let y = i32::from_le_bytes(rec[32..36].try_into().unwrap());
            assert!((0..4).contains(&x));
            assert!((0..500).contains(&y));
        }
    }
}
