use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};
use std::path::Path;

/// Size and SHA-256 of a file on disk.
pub(crate) fn sha256_file(path: &Path) -> io::Result<(u64, String)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hex::encode(hasher.finalize())))
}

/// Reader adapter that hashes and counts everything passing through it.
pub(crate) struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R: Read> HashingReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    pub(crate) fn finish(self) -> (u64, String) {
        (self.count, hex::encode(self.hasher.finalize()))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

/// Writer adapter used while extracting; hashes and counts written bytes.
pub(crate) struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    count: u64,
}

impl<W: Write> HashingWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    pub(crate) fn finish(self) -> (W, u64, String) {
        (self.inner, self.count, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_and_file_hash_agree() {
        let path = std::env::temp_dir().join(format!(
            "atlas-backup-hash-{}",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&path, b"level.dat contents").expect("write file");

        let (size, digest) = sha256_file(&path).expect("hash file");
        let mut reader = HashingReader::new(std::fs::File::open(&path).unwrap());
        std::io::copy(&mut reader, &mut std::io::sink()).unwrap();

        assert_eq!(reader.finish(), (size, digest.clone()));
        assert_eq!(size, 18);
        assert_eq!(digest.len(), 64);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn writer_hash_changes_with_content() {
        let mut a = HashingWriter::new(Vec::new());
        a.write_all(b"a").unwrap();
        let mut b = HashingWriter::new(Vec::new());
        b.write_all(b"b").unwrap();
        assert_ne!(a.finish().2, b.finish().2);
    }
}
