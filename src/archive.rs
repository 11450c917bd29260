use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ArchiveError;

/// Compression is transparent: `.gz`-suffixed archives are gzipped,
/// anything else is plain line-delimited JSON.
fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|extension| extension == "gz")
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

/// Reads every record of a line-delimited JSON archive, in file order.
///
/// Any failure here is fatal to the run; there is no per-line recovery.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, ArchiveError> {
    let file = File::open(path).map_err(|source| ArchiveError::Load {
        path: display(path),
        source,
    })?;
    let reader: Box<dyn BufRead> = if is_gzip(path) {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| ArchiveError::Load {
            path: display(path),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| ArchiveError::Decode {
            path: display(path),
            line: index + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

enum ArchiveSink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Write for ArchiveSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(writer) => writer.write(buf),
            Self::Gzip(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(writer) => writer.flush(),
            Self::Gzip(writer) => writer.flush(),
        }
    }
}

/// Append-only archive writer: one JSON record per line, in call order.
///
/// Every append is flushed so an interrupted run leaves a valid prefix of
/// complete records on disk.
pub struct ArchiveWriter {
    sink: ArchiveSink,
    path: String,
}

impl ArchiveWriter {
    /// Creates (or truncates) the archive at `path`.
    pub fn create(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::create(path).map_err(|source| ArchiveError::Write {
            path: display(path),
            source,
        })?;
        let sink = if is_gzip(path) {
            ArchiveSink::Gzip(GzEncoder::new(BufWriter::new(file), Compression::default()))
        } else {
            ArchiveSink::Plain(BufWriter::new(file))
        };
        Ok(Self {
            sink,
            path: display(path),
        })
    }

    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<(), ArchiveError> {
        let line = serde_json::to_string(record).map_err(|source| ArchiveError::Encode {
            path: self.path.clone(),
            source,
        })?;
        self.write_bytes(line.as_bytes())?;
        self.write_bytes(b"\n")?;
        self.sink.flush().map_err(|source| ArchiveError::Write {
            path: self.path.clone(),
            source,
        })
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ArchiveError> {
        self.sink
            .write_all(bytes)
            .map_err(|source| ArchiveError::Write {
                path: self.path.clone(),
                source,
            })
    }

    /// Finalizes the archive; required for a well-terminated gzip stream.
    pub fn finish(self) -> Result<(), ArchiveError> {
        let path = self.path;
        let result = match self.sink {
            ArchiveSink::Plain(mut writer) => writer.flush(),
            ArchiveSink::Gzip(writer) => writer.finish().and_then(|mut inner| inner.flush()),
        };
        result.map_err(|source| ArchiveError::Write { path, source })
    }
}
