//! Streamed objects: `KRIN` magic, algorithm byte, wrapped data key, then
//! fixed-size AEAD frames. The associated data of every frame binds the
//! path-derived context, the frame index and whether it is the last frame,
//! so frames cannot be reordered, spliced between objects, or truncated
//! without detection.

use super::master::{aead_decrypt, aead_encrypt, Algorithm, DataKey, MasterKey, MAGIC};
use crate::error::{ServerError, ServerResult};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Plaintext bytes per frame.
pub const CHUNK_SIZE: usize = 64 * 1024;

const TAG_LEN: usize = 16;
const FULL_FRAME_CT: usize = CHUNK_SIZE + TAG_LEN;
const CONTEXT_LEN: usize = 20;

/// On-disk bytes of one full frame, length prefix included.
pub const FULL_FRAME_LEN: u64 = (4 + FULL_FRAME_CT) as u64;

/// Non-payload bytes of any frame: length prefix plus AEAD tag.
pub const fn frame_overhead() -> u64 {
    (4 + TAG_LEN) as u64
}

fn frame_nonce(index: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&index.to_be_bytes());
    nonce
}

fn frame_aad(context: &[u8; CONTEXT_LEN], index: u64, last: bool) -> Vec<u8> {
    let mut aad = Vec::with_capacity(CONTEXT_LEN + 9);
    aad.extend_from_slice(context);
    aad.extend_from_slice(&index.to_be_bytes());
    aad.push(last as u8);
    aad
}

/// An integrity failure distinguishable from ordinary IO errors; callers
/// map it back to `ServerError::DecryptFailed` so a tampered object is
/// never mistaken for EOF.
pub fn decrypt_failure() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "decrypt failed")
}

pub fn is_decrypt_failure(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::InvalidData
}

pub struct StreamWriter<W: Write> {
    inner: W,
    key: DataKey,
    context: [u8; CONTEXT_LEN],
    buf: Vec<u8>,
    index: u64,
    bytes_out: u64,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(
        master: &MasterKey,
        context: [u8; CONTEXT_LEN],
        mut inner: W,
    ) -> ServerResult<StreamWriter<W>> {
        let key = master.new_data_key();
        let wrapped = master.wrap_data_key(&key);

        let mut header = Vec::with_capacity(7 + wrapped.len());
        header.extend_from_slice(&MAGIC);
        header.push(key.algorithm().byte());
        header.extend_from_slice(&(wrapped.len() as u16).to_be_bytes());
        header.extend_from_slice(&wrapped);
        inner.write_all(&header)?;

        Ok(StreamWriter {
            inner,
            key,
            context,
            buf: Vec::with_capacity(CHUNK_SIZE),
            index: 0,
            bytes_out: header.len() as u64,
        })
    }

    fn write_frame(&mut self, plain: &[u8], last: bool) -> io::Result<()> {
        let ct = aead_encrypt(
            self.key.algorithm(),
            self.key.key.as_slice(),
            &frame_nonce(self.index),
            plain,
            &frame_aad(&self.context, self.index, last),
        );
        self.inner.write_all(&(ct.len() as u32).to_be_bytes())?;
        self.inner.write_all(&ct)?;
        self.bytes_out += 4 + ct.len() as u64;
        self.index += 1;
        Ok(())
    }

    /// Writes the final (short) frame and returns the inner writer along
    /// with the total number of bytes written, header included.
    pub fn finish(mut self) -> ServerResult<(W, u64)> {
        let rest = std::mem::take(&mut self.buf);
        self.write_frame(&rest, true)?;
        self.inner.flush()?;
        let total = self.bytes_out;
        Ok((self.inner, total))
    }
}

impl<W: Write> Write for StreamWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut rest = data;
        while !rest.is_empty() {
            let take = (CHUNK_SIZE - self.buf.len()).min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buf.len() == CHUNK_SIZE {
                let full = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
                self.write_frame(&full, false)?;
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Frames are flushed on `finish`; flushing mid-stream would leak a
        // short frame that the reader would take as end of stream.
        self.inner.flush()
    }
}

pub struct StreamReader<R: Read> {
    inner: R,
    key: DataKey,
    context: [u8; CONTEXT_LEN],
    header_len: u64,
    plain: Vec<u8>,
    pos: usize,
    index: u64,
    done: bool,
}

impl<R: Read> StreamReader<R> {
    pub fn new(
        master: &MasterKey,
        context: [u8; CONTEXT_LEN],
        mut inner: R,
    ) -> ServerResult<StreamReader<R>> {
        let mut fixed = [0u8; 7];
        inner.read_exact(&mut fixed).map_err(|_| ServerError::DecryptFailed)?;
        if fixed[..4] != MAGIC {
            return Err(ServerError::DecryptFailed);
        }
        let algorithm = Algorithm::from_byte(fixed[4]).ok_or(ServerError::DecryptFailed)?;
        let klen = u16::from_be_bytes([fixed[5], fixed[6]]) as usize;
        let mut wrapped = vec![0u8; klen];
        inner
            .read_exact(&mut wrapped)
            .map_err(|_| ServerError::DecryptFailed)?;
        let key = master.unwrap_data_key(&wrapped, algorithm)?;

        Ok(StreamReader {
            inner,
            key,
            context,
            header_len: 7 + klen as u64,
            plain: Vec::new(),
            pos: 0,
            index: 0,
            done: false,
        })
    }

    fn next_frame(&mut self) -> io::Result<()> {
        let mut len_bytes = [0u8; 4];
        // EOF before the last frame means the object was truncated.
        self.inner
            .read_exact(&mut len_bytes)
            .map_err(|_| decrypt_failure())?;
        let ct_len = u32::from_be_bytes(len_bytes) as usize;
        if ct_len < TAG_LEN || ct_len > FULL_FRAME_CT {
            return Err(decrypt_failure());
        }
        let last = ct_len < FULL_FRAME_CT;

        let mut ct = vec![0u8; ct_len];
        self.inner.read_exact(&mut ct).map_err(|_| decrypt_failure())?;

        let plain = aead_decrypt(
            self.key.algorithm(),
            self.key.key.as_slice(),
            &frame_nonce(self.index),
            &ct,
            &frame_aad(&self.context, self.index, last),
        )
        .map_err(|_| decrypt_failure())?;

        self.plain = plain;
        self.pos = 0;
        self.index += 1;
        self.done = last;
        Ok(())
    }
}

impl<R: Read> Read for StreamReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.plain.len() {
            if self.done {
                return Ok(0);
            }
            self.next_frame()?;
        }
        let take = (self.plain.len() - self.pos).min(out.len());
        out[..take].copy_from_slice(&self.plain[self.pos..self.pos + take]);
        self.pos += take;
        Ok(take)
    }
}

impl<R: Read + Seek> StreamReader<R> {
    /// Positions the stream at `offset` plaintext bytes by seeking over
    /// whole frames and discarding the remainder of the target frame. Only
    /// valid immediately after `new`.
    pub fn seek_to(&mut self, offset: u64) -> ServerResult<()> {
        let frame = offset / CHUNK_SIZE as u64;
        let skip = (offset % CHUNK_SIZE as u64) as usize;

        self.inner
            .seek(SeekFrom::Start(
                self.header_len + frame * (4 + FULL_FRAME_CT) as u64,
            ))
            .map_err(ServerError::Io)?;
        self.index = frame;

        if skip > 0 || offset > 0 {
            self.next_frame().map_err(|e| {
                if is_decrypt_failure(&e) {
                    ServerError::DecryptFailed
                } else {
                    ServerError::Io(e)
                }
            })?;
            if skip > self.plain.len() {
                // Past end of stream.
                self.pos = self.plain.len();
            } else {
                self.pos = skip;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn ctx(tag: u8) -> [u8; CONTEXT_LEN] {
        [tag; CONTEXT_LEN]
    }

    fn encrypt(master: &MasterKey, context: [u8; CONTEXT_LEN], plain: &[u8]) -> Vec<u8> {
        let mut w = StreamWriter::new(master, context, Vec::new()).unwrap();
        w.write_all(plain).unwrap();
        let (out, total) = w.finish().unwrap();
        assert_eq!(out.len() as u64, total);
        out
    }

    fn decrypt(
        master: &MasterKey,
        context: [u8; CONTEXT_LEN],
        blob: &[u8],
    ) -> io::Result<Vec<u8>> {
        let mut r = StreamReader::new(master, context, Cursor::new(blob))
            .map_err(|_| decrypt_failure())?;
        let mut out = Vec::new();
        r.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn round_trip_all_sizes() {
        let master = MasterKey::random(Algorithm::Aes256Gcm);
        for size in [0, 1, 2, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 3 * CHUNK_SIZE] {
            let plain: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let blob = encrypt(&master, ctx(7), &plain);
            assert_eq!(decrypt(&master, ctx(7), &blob).unwrap(), plain);
        }
    }

    #[test]
    fn one_byte_reads() {
        let master = MasterKey::random(Algorithm::Chacha20Poly1305);
        let plain = b"tiny stream, one byte at a time".to_vec();
        let blob = encrypt(&master, ctx(1), &plain);

        let mut r = StreamReader::new(&master, ctx(1), Cursor::new(&blob)).unwrap();
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match r.read(&mut byte).unwrap() {
                0 => break,
                1 => out.push(byte[0]),
                _ => unreachable!(),
            }
        }
        assert_eq!(out, plain);
    }

    #[test]
    fn tamper_any_byte_fails() {
        let master = MasterKey::random(Algorithm::Aes256Gcm);
        let plain = vec![42u8; 100];
        let blob = encrypt(&master, ctx(2), &plain);

        // Skip the magic; flipping it is caught before any decryption.
        for i in 7..blob.len() {
            let mut bad = blob.clone();
            bad[i] ^= 0x80;
            assert!(decrypt(&master, ctx(2), &bad).is_err(), "byte {}", i);
        }
    }

    #[test]
    fn wrong_context_fails() {
        let master = MasterKey::random(Algorithm::Aes256Gcm);
        let blob = encrypt(&master, ctx(3), b"data");
        let err = decrypt(&master, ctx(4), &blob).unwrap_err();
        assert!(is_decrypt_failure(&err));
    }

    #[test]
    fn truncation_is_not_eof() {
        let master = MasterKey::random(Algorithm::Aes256Gcm);
        let plain = vec![9u8; 2 * CHUNK_SIZE];
        let blob = encrypt(&master, ctx(5), &plain);

        // Cut exactly at the end of the first full frame.
        let first_frame_end = (blob.len() - (4 + TAG_LEN)) - (4 + FULL_FRAME_CT);
        let err = decrypt(&master, ctx(5), &blob[..first_frame_end]).unwrap_err();
        assert!(is_decrypt_failure(&err));
    }

    #[test]
    fn frame_swap_fails() {
        let master = MasterKey::random(Algorithm::Chacha20Poly1305);
        let plain = vec![1u8; 2 * CHUNK_SIZE + 10];
        let blob = encrypt(&master, ctx(6), &plain);

        // Swap the two full frames.
        let f = 4 + FULL_FRAME_CT;
        let header = blob.len() - 2 * f - (4 + 10 + TAG_LEN);
        let mut bad = blob[..header].to_vec();
        bad.extend_from_slice(&blob[header + f..header + 2 * f]);
        bad.extend_from_slice(&blob[header..header + f]);
        bad.extend_from_slice(&blob[header + 2 * f..]);
        assert!(decrypt(&master, ctx(6), &bad).is_err());
    }

    #[test]
    fn seek_matches_full_read() {
        let master = MasterKey::random(Algorithm::Aes256Gcm);
        let plain: Vec<u8> = (0..3 * CHUNK_SIZE + 17).map(|i| (i % 239) as u8).collect();
        let blob = encrypt(&master, ctx(8), &plain);

        for offset in [0u64, 1, 100, CHUNK_SIZE as u64, CHUNK_SIZE as u64 + 1, 2 * CHUNK_SIZE as u64 + 5000] {
            let mut r = StreamReader::new(&master, ctx(8), Cursor::new(&blob)).unwrap();
            r.seek_to(offset).unwrap();
            let mut out = Vec::new();
            r.read_to_end(&mut out).unwrap();
            assert_eq!(out, plain[offset as usize..], "offset {}", offset);
        }
    }
}
